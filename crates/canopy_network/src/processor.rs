//! JSON message routing.
//!
//! Each inbound body is a JSON object whose `"cmd"` field names the message.
//! Every command is registered once at startup with a decoder and a target
//! router; routing decodes the body into its concrete type, wraps it in the
//! target module's message enum and enqueues it under the command's id.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use canopy_runtime::{CallId, ServerHandle};

use crate::error::ProcessorError;
use crate::gate::AgentHandle;

type Dispatch =
    Box<dyn Fn(Value, AgentHandle) -> BoxFuture<'static, Result<(), ProcessorError>> + Send + Sync>;

/// Registry from command name to decode-and-dispatch function.
#[derive(Default)]
pub struct Processor {
    routes: HashMap<CallId, Dispatch>,
}

impl Processor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `cmd` to `target`: bodies are decoded as `T` and handed to
    /// `wrap` together with the sending agent.
    pub fn register<T, M, R, W>(
        &mut self,
        cmd: CallId,
        target: ServerHandle<M, R>,
        wrap: W,
    ) -> Result<(), ProcessorError>
    where
        T: DeserializeOwned + Send + 'static,
        M: Send + 'static,
        R: Send + 'static,
        W: Fn(T, AgentHandle) -> M + Send + Sync + 'static,
    {
        if self.routes.contains_key(cmd) {
            return Err(ProcessorError::AlreadyRegistered(cmd.to_string()));
        }
        let wrap = Arc::new(wrap);
        let dispatch = move |value: Value, agent: AgentHandle| -> BoxFuture<'static, Result<(), ProcessorError>> {
            let target = target.clone();
            let msg = serde_json::from_value::<T>(value).map(|decoded| wrap(decoded, agent));
            async move {
                target.go(cmd, msg?).await?;
                Ok(())
            }
            .boxed()
        };
        self.routes.insert(cmd, Box::new(dispatch));
        Ok(())
    }

    pub fn is_registered(&self, cmd: &str) -> bool {
        self.routes.contains_key(cmd)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Decodes one body and enqueues it on its target module.
    ///
    /// Unknown or malformed messages come back as errors; the caller decides
    /// whether the connection survives them.
    pub async fn route(&self, data: &[u8], agent: &AgentHandle) -> Result<(), ProcessorError> {
        let value: Value = serde_json::from_slice(data)?;
        let cmd = value
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or(ProcessorError::MissingCmd)?;
        let dispatch = self
            .routes
            .get(cmd)
            .ok_or_else(|| ProcessorError::UnknownMessage(cmd.to_string()))?;
        dispatch(value, agent.clone()).await
    }

    /// Serialises `msg` as a JSON object tagged with `cmd`.
    pub fn marshal<T: Serialize>(cmd: &str, msg: &T) -> Result<Vec<u8>, ProcessorError> {
        let mut value = serde_json::to_value(msg)?;
        if value.is_null() {
            value = Value::Object(Map::new());
        }
        let Value::Object(map) = &mut value else {
            return Err(ProcessorError::NotAnObject(cmd.to_string()));
        };
        map.insert("cmd".to_string(), Value::String(cmd.to_string()));
        Ok(serde_json::to_vec(&value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Pong {
        seq: u32,
    }

    #[test]
    fn marshal_tags_objects_with_cmd() {
        let body = Processor::marshal("pong", &Pong { seq: 3 }).unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["cmd"], "pong");
        assert_eq!(value["seq"], 3);

        let unit = Processor::marshal("ack", &()).unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&unit).unwrap(), serde_json::json!({"cmd": "ack"}));
    }

    #[test]
    fn marshal_rejects_non_objects() {
        assert!(matches!(
            Processor::marshal("bad", &[1, 2, 3]),
            Err(ProcessorError::NotAnObject(ref cmd)) if cmd == "bad"
        ));
    }
}
