use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::write::WriteEnvelope;
use crate::errors::Fault;

/// Domain side effect for one write command. The only place a mutation may happen.
#[async_trait]
pub trait WriteHandler: Send + Sync {
    async fn apply(&self, envelope: &WriteEnvelope) -> Result<Value, Fault>;
}

struct FnHandler<F> {
    handler: F,
}

#[async_trait]
impl<F, Fut> WriteHandler for FnHandler<F>
where
    F: Fn(WriteEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, Fault>> + Send,
{
    async fn apply(&self, envelope: &WriteEnvelope) -> Result<Value, Fault> {
        (self.handler)(envelope.clone()).await
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn WriteHandler>>>,
}

impl HandlerRegistry {
    /// Binds `command` to `handler`. A later registration for the same command replaces the
    /// earlier one.
    pub fn register<H>(&self, command: impl Into<String>, handler: H)
    where
        H: WriteHandler + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.insert(command.into(), Arc::new(handler));
    }

    pub fn register_fn<F, Fut>(&self, command: impl Into<String>, handler: F)
    where
        F: Fn(WriteEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
    {
        self.register(command, FnHandler { handler });
    }

    pub fn get(&self, command: &str) -> Option<Arc<dyn WriteHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(command).cloned()
    }

    pub fn commands(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut commands: Vec<String> = handlers.keys().cloned().collect();
        commands.sort();
        commands
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::HandlerRegistry;
    use crate::domain::write::WriteEnvelope;

    #[tokio::test]
    async fn registered_closure_is_invoked_by_exact_command() {
        let registry = HandlerRegistry::default();
        registry.register_fn("noop_cmd", |envelope: WriteEnvelope| async move {
            Ok(json!({ "resource": envelope.resource }))
        });

        assert!(registry.get("noop").is_none());
        assert!(registry.get("NOOP_CMD").is_none());

        let handler = registry.get("noop_cmd").expect("handler should be registered");
        let output = handler
            .apply(&WriteEnvelope::new("noop_cmd", "u1", "r1", json!({})))
            .await
            .expect("handler should succeed");
        assert_eq!(output, json!({ "resource": "r1" }));
    }

    #[test]
    fn later_registration_replaces_earlier_one() {
        let registry = HandlerRegistry::default();
        registry.register_fn("cmd", |_| async { Ok(json!(1)) });
        registry.register_fn("cmd", |_| async { Ok(json!(2)) });
        registry.register_fn("another", |_| async { Ok(json!(3)) });

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.commands(), vec!["another".to_string(), "cmd".to_string()]);
    }
}
