//! In-memory event publisher implementation for testing.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{CompletionEvent, EventPublisher};
use crate::error::{Error, Result};

/// In-memory publisher that collects events for assertions.
#[derive(Debug, Default)]
pub struct InMemoryEventPublisher {
    events: Mutex<Vec<CompletionEvent>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::store("lock poisoned")
}

impl InMemoryEventPublisher {
    /// Creates a new empty publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all published events in publication order.
    ///
    /// # Errors
    ///
    /// Returns a store error if the collection lock is poisoned.
    pub fn events(&self) -> Result<Vec<CompletionEvent>> {
        Ok(self.events.lock().map_err(poison_err)?.clone())
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish_completed(&self, event: &CompletionEvent) -> Result<()> {
        self.events.lock().map_err(poison_err)?.push(event.clone());
        Ok(())
    }
}
