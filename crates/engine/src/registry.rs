//! Stage handler trait and registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::StreamEvent;
use crate::routing::StageOutput;
use crate::worker::StageInput;
use crate::{Error, Result};

/// Processing logic of a stage.
///
/// The handler pulls events from `input` until it returns `None` and
/// publishes through `output`. Each pulled item is acknowledged when the next
/// one is requested, so returning an error before pulling again leaves the
/// last item unacknowledged for redelivery.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Consume the stage input.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the worker.
    async fn run(&self, input: &mut StageInput, output: &StageOutput) -> Result<()>;
}

/// Handler reacting to one event at a time, with no state across events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a single event.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the worker.
    async fn on_event(&self, event: StreamEvent, output: &StageOutput) -> Result<()>;
}

/// Adapts an [`EventHandler`] into a [`StageHandler`].
pub struct PerEvent<H> {
    handler: H,
}

impl<H: EventHandler> PerEvent<H> {
    /// Wrap an event handler.
    pub const fn new(handler: H) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<H: EventHandler> StageHandler for PerEvent<H> {
    async fn run(&self, input: &mut StageInput, output: &StageOutput) -> Result<()> {
        while let Some(event) = input.next().await? {
            self.handler.on_event(event, output).await?;
        }
        Ok(())
    }
}

/// Stage name to handler mapping, filled explicitly at startup.
#[derive(Default)]
pub struct StageRegistry {
    handlers: HashMap<String, Arc<dyn StageHandler>>,
}

impl StageRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler of `stage`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the stage already has a handler.
    pub fn register(&mut self, stage: impl Into<String>, handler: Arc<dyn StageHandler>) -> Result<()> {
        let stage = stage.into();
        if self.handlers.contains_key(&stage) {
            return Err(Error::invalid_config(format!(
                "stage '{stage}' registered twice"
            )));
        }
        self.handlers.insert(stage, handler);
        Ok(())
    }

    /// Handler of `stage`.
    ///
    /// # Errors
    ///
    /// Returns `HandlerNotFound` if nothing is registered for the stage.
    pub fn get(&self, stage: &str) -> Result<Arc<dyn StageHandler>> {
        self.handlers
            .get(stage)
            .cloned()
            .ok_or_else(|| Error::HandlerNotFound {
                stage: stage.to_string(),
            })
    }

    /// Whether `stage` has a handler.
    #[must_use]
    pub fn has(&self, stage: &str) -> bool {
        self.handlers.contains_key(stage)
    }

    /// Registered stage names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    #[async_trait]
    impl StageHandler for Idle {
        async fn run(&self, _input: &mut StageInput, _output: &StageOutput) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = StageRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.register("filter", Arc::new(Idle)).is_ok());
        assert!(registry.register("join", Arc::new(Idle)).is_ok());

        assert!(registry.has("filter"));
        assert!(registry.get("join").is_ok());
        assert_eq!(registry.names(), vec!["filter", "join"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = StageRegistry::new();
        assert!(registry.register("filter", Arc::new(Idle)).is_ok());
        assert!(matches!(
            registry.register("filter", Arc::new(Idle)),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn missing_handler_is_reported() {
        let registry = StageRegistry::new();
        assert!(matches!(
            registry.get("ghost"),
            Err(Error::HandlerNotFound { ref stage }) if stage == "ghost"
        ));
    }
}
