use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{ModuleSignal, RuntimeError, Skeleton, SkeletonConfig, WorkerError};

#[derive(Default)]
struct Jobs {
    done: Vec<&'static str>,
    outcomes: Vec<Result<u32, WorkerError>>,
    disabled: bool,
}

async fn run_until_idle(skeleton: Skeleton<Jobs, (), ()>) -> Jobs {
    let (sender, signal) = ModuleSignal::new();
    // close straight away: the drain must still collect every completion
    sender.close();
    tokio::time::timeout(Duration::from_secs(5), skeleton.run(signal))
        .await
        .expect("module drained")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn linear_context_runs_bodies_in_submission_order() {
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let mut skeleton: Skeleton<Jobs, (), ()> =
        Skeleton::new("linear", SkeletonConfig::default(), Jobs::default()).unwrap();

    let seen = Arc::clone(&bodies);
    skeleton.set_start(move |_state, ctx| {
        let mut chain = ctx.new_linear_context().unwrap();
        for (name, delay) in [("a", 60), ("b", 0), ("c", 20)] {
            let seen = Arc::clone(&seen);
            chain
                .go(
                    move || {
                        std::thread::sleep(Duration::from_millis(delay));
                        seen.lock().unwrap().push(name);
                    },
                    move |state: &mut Jobs, _ctx, result| {
                        assert!(result.is_ok());
                        state.done.push(name);
                    },
                )
                .unwrap();
        }
    });

    let jobs = run_until_idle(skeleton).await;
    assert_eq!(*bodies.lock().unwrap(), ["a", "b", "c"]);
    assert_eq!(jobs.done.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_jobs_are_unordered_but_all_complete() {
    let mut skeleton: Skeleton<Jobs, (), ()> =
        Skeleton::new("pool", SkeletonConfig::default(), Jobs::default()).unwrap();
    skeleton.set_start(|_state, ctx| {
        for (n, delay) in [(1u32, 80u64), (2, 0)] {
            ctx.go(
                move || {
                    std::thread::sleep(Duration::from_millis(delay));
                    n
                },
                |state: &mut Jobs, _ctx, result| state.outcomes.push(result),
            )
            .unwrap();
        }
    });

    let jobs = run_until_idle(skeleton).await;
    // the short job overtakes the long one
    assert_eq!(jobs.outcomes, vec![Ok(2), Ok(1)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_job_reports_to_its_callback() {
    let mut skeleton: Skeleton<Jobs, (), ()> =
        Skeleton::new("faulty", SkeletonConfig::default(), Jobs::default()).unwrap();
    skeleton.set_start(|_state, ctx| {
        ctx.go(
            || -> u32 { panic!("job failed") },
            |state: &mut Jobs, _ctx, result| state.outcomes.push(result),
        )
        .unwrap();
    });

    let jobs = run_until_idle(skeleton).await;
    assert_eq!(jobs.outcomes, vec![Err(WorkerError::Panicked("job failed".into()))]);
}

#[tokio::test]
async fn zero_go_len_disables_the_pool() {
    let config = SkeletonConfig { go_len: 0, ..SkeletonConfig::default() };
    let mut skeleton: Skeleton<Jobs, (), ()> = Skeleton::new("off", config, Jobs::default()).unwrap();
    skeleton.set_start(|state, ctx| {
        let go = ctx.go(|| 1u32, |_s: &mut Jobs, _c, _r| {});
        let linear = ctx.new_linear_context();
        state.disabled = matches!(go, Err(RuntimeError::Disabled(_)))
            && matches!(linear, Err(RuntimeError::Disabled(_)));
    });

    assert!(run_until_idle(skeleton).await.disabled);
}

#[tokio::test(flavor = "multi_thread")]
async fn callbacks_can_chain_more_work() {
    let mut skeleton: Skeleton<Jobs, (), ()> =
        Skeleton::new("chain", SkeletonConfig::default(), Jobs::default()).unwrap();
    skeleton.set_start(|_state, ctx| {
        ctx.go(
            || {
                std::thread::sleep(Duration::from_millis(50));
                1u32
            },
            |state: &mut Jobs, ctx, first| {
                state.outcomes.push(first);
                // the pool is closed by now, so follow-up work is refused
                if let Err(RuntimeError::Closed) = ctx.go(|| 2u32, |_s: &mut Jobs, _c, _r| {}) {
                    state.done.push("refused");
                }
            },
        )
        .unwrap();
    });

    let jobs = run_until_idle(skeleton).await;
    assert_eq!(jobs.outcomes, vec![Ok(1)]);
    assert_eq!(jobs.done, ["refused"]);
}
