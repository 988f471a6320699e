use std::time::Duration;

use tokio::time::timeout;

use crate::{CronExpr, ModuleSignal, RpcError, RuntimeError, Skeleton, SkeletonConfig};

#[derive(Default)]
struct Recorder {
    fired: Vec<&'static str>,
    ticks: u32,
    reloads: u32,
    replies: Vec<Result<u64, RpcError>>,
    jobs: u32,
}

type RecorderSkeleton = Skeleton<Recorder, (), Vec<&'static str>>;

fn recorder(config: SkeletonConfig) -> RecorderSkeleton {
    let mut skeleton = Skeleton::new("recorder", config, Recorder::default()).unwrap();
    skeleton
        .register_chan_rpc("fired", |state: &mut Recorder, _ctx, ()| Ok(state.fired.clone()))
        .unwrap();
    skeleton
}

async fn wait_for(router: &crate::ServerHandle<(), Vec<&'static str>>, expected: &[&'static str]) {
    timeout(Duration::from_secs(3), async {
        while router.call("fired", ()).await.unwrap() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timers fired");
}

#[tokio::test(flavor = "multi_thread")]
async fn after_func_fires_once_on_the_module_thread() {
    let mut skeleton = recorder(SkeletonConfig::default());
    skeleton.set_start(|_state, ctx| {
        let handle = ctx
            .after_func(Duration::from_millis(10), |state: &mut Recorder, _ctx| state.fired.push("once"))
            .unwrap();
        assert!(!handle.is_stopped());
    });
    let router = skeleton.chan_rpc();
    let (sender, signal) = ModuleSignal::new();
    let task = tokio::spawn(skeleton.run(signal));

    wait_for(&router, &["once"]).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(router.call("fired", ()).await.unwrap(), ["once"]);

    sender.close();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_timers_never_run_even_if_already_queued() {
    let mut skeleton = recorder(SkeletonConfig::default());
    skeleton.set_start(|_state, ctx| {
        let queued = ctx
            .after_func(Duration::ZERO, |state: &mut Recorder, _ctx| state.fired.push("queued"))
            .unwrap();
        let armed = ctx
            .after_func(Duration::from_millis(20), |state: &mut Recorder, _ctx| state.fired.push("armed"))
            .unwrap();
        ctx.after_func(Duration::from_millis(60), |state: &mut Recorder, _ctx| state.fired.push("kept"))
            .unwrap();
        // let the zero-delay firing reach the queue before stopping it
        std::thread::sleep(Duration::from_millis(30));
        queued.stop();
        armed.stop();
        assert!(queued.is_stopped());
    });
    let router = skeleton.chan_rpc();
    let (sender, signal) = ModuleSignal::new();
    let task = tokio::spawn(skeleton.run(signal));

    wait_for(&router, &["kept"]).await;

    sender.close();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cron_keeps_firing_until_stopped() {
    let mut skeleton = recorder(SkeletonConfig::default());
    skeleton.set_start(|_state, ctx| {
        let expr = CronExpr::parse("* * * * * *").unwrap();
        ctx.cron_func(expr, |state: &mut Recorder, _ctx| {
            state.fired.push("cron");
        })
        .unwrap();
    });
    let router = skeleton.chan_rpc();
    let (sender, signal) = ModuleSignal::new();
    let task = tokio::spawn(skeleton.run(signal));

    wait_for(&router, &["cron", "cron"]).await;

    sender.close();
    task.await.unwrap();
}

#[tokio::test]
async fn zero_dispatcher_len_disables_timers() {
    let config = SkeletonConfig { timer_dispatcher_len: 0, ..SkeletonConfig::default() };
    let mut skeleton = recorder(config);
    skeleton.set_start(|state, ctx| {
        if let Err(RuntimeError::Disabled(_)) = ctx.after_func(Duration::ZERO, |_s: &mut Recorder, _c| {}) {
            state.fired.push("disabled");
        }
    });
    let (sender, signal) = ModuleSignal::new();
    sender.close();
    let state = skeleton.run(signal).await;
    assert_eq!(state.fired, ["disabled"]);
}

#[tokio::test]
async fn update_ticks_only_with_a_handler() {
    let config = SkeletonConfig { loop_interval_ms: 5, ..SkeletonConfig::default() };
    let mut skeleton = recorder(config);
    skeleton.set_update(|state, _ctx| state.ticks += 1);
    let (sender, signal) = ModuleSignal::new();
    let task = tokio::spawn(skeleton.run(signal));

    tokio::time::sleep(Duration::from_millis(100)).await;
    sender.close();
    assert!(task.await.unwrap().ticks >= 3);
}

#[tokio::test]
async fn reload_requests_run_the_reload_hook() {
    let mut skeleton = recorder(SkeletonConfig::default());
    skeleton.set_reload(|state, _ctx| state.reloads += 1);
    let router = skeleton.chan_rpc();
    let (sender, signal) = ModuleSignal::new();
    let task = tokio::spawn(skeleton.run(signal));

    sender.reload();
    // a round trip through the router orders us after the reload
    tokio::time::sleep(Duration::from_millis(20)).await;
    router.call("fired", ()).await.unwrap();
    sender.close();
    assert_eq!(task.await.unwrap().reloads, 1);
}

#[tokio::test]
async fn commands_are_listed_and_executed() {
    let mut skeleton = recorder(SkeletonConfig::default());
    skeleton
        .register_command("echo", "echo the arguments back", |_state, _ctx, args| Ok(args.join(" ")))
        .unwrap();
    skeleton
        .register_command("ticks", "show the tick counter", |state, _ctx, _args| Ok(state.ticks.to_string()))
        .unwrap();
    assert!(skeleton.register_command("echo", "again", |_s, _c, _a| Ok(String::new())).is_err());

    let names: Vec<_> = skeleton.commands().iter().map(|c| c.name).collect();
    assert_eq!(names, ["echo", "ticks"]);

    let console = skeleton.command_handle();
    let (sender, signal) = ModuleSignal::new();
    let task = tokio::spawn(skeleton.run(signal));

    assert_eq!(console.call("echo", vec!["hello".into(), "there".into()]).await, Ok("hello there".into()));
    assert_eq!(console.call("ticks", vec![]).await, Ok("0".into()));
    assert!(matches!(console.call("nope", vec![]).await, Err(RpcError::NotRegistered(_))));

    sender.close();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drains_outstanding_jobs_and_async_calls() {
    // the target is not running yet, so the async calls cannot complete
    // before the caller has been told to close
    let mut target: Skeleton<(), u64, u64> = Skeleton::new("target", SkeletonConfig::default(), ()).unwrap();
    target.register_chan_rpc("double", |_s, _c, n| Ok(n * 2)).unwrap();
    let target_handle = target.chan_rpc();

    let mut caller = recorder(SkeletonConfig::default());
    caller.set_start(move |_state, ctx| {
        for n in 1..=2u64 {
            ctx.asyn_call(&target_handle, "double", n, |state: &mut Recorder, _ctx, result| {
                state.replies.push(result);
            })
            .unwrap();
        }
        for _ in 0..3 {
            ctx.go(
                || std::thread::sleep(Duration::from_millis(40)),
                |state: &mut Recorder, _ctx, result| {
                    assert!(result.is_ok());
                    state.jobs += 1;
                },
            )
            .unwrap();
        }
    });

    let (sender, signal) = ModuleSignal::new();
    let caller_task = tokio::spawn(caller.run(signal));
    sender.close();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!caller_task.is_finished(), "caller must wait for its async calls");

    let (target_sender, target_signal) = ModuleSignal::new();
    let target_task = tokio::spawn(target.run(target_signal));

    let recorder = timeout(Duration::from_secs(2), caller_task).await.expect("drain finished").unwrap();
    assert_eq!(recorder.jobs, 3);
    let mut replies = recorder.replies.clone();
    replies.sort_by_key(|r| r.clone().unwrap_or_default());
    assert_eq!(replies, vec![Ok(2), Ok(4)]);

    target_sender.close();
    target_task.await.unwrap();
}
