//! ==============================================================================
//! publisher.rs - watering command publisher
//! ==============================================================================
//!
//! purpose:
//!     turns one "water now" request into one bus publish of the fixed
//!     command literal on the fixed command topic.
//!
//! no retries here: a failed publish goes back to the caller as-is.
//!
//! relationships:
//!     - used by: gateway.rs (POST /water)
//!     - publishes through: CommandSink (bus.rs BusHandle in production)
//!
//! ==============================================================================

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::TopicsConfig;
use crate::error::PublishError;

/// anything that can hand a message to the bus without blocking
pub trait CommandSink: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
}

#[derive(Clone)]
pub struct CommandPublisher {
    sink: Arc<dyn CommandSink>,
    topic: String,
    payload: String,
}

impl CommandPublisher {
    pub fn new(sink: Arc<dyn CommandSink>, topics: &TopicsConfig) -> Self {
        Self {
            sink,
            topic: topics.command.clone(),
            payload: topics.command_payload.clone(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// publish the watering command once
    pub fn trigger(&self) -> Result<(), PublishError> {
        match self.sink.publish(&self.topic, self.payload.as_bytes()) {
            Ok(()) => {
                info!(topic = %self.topic, payload = %self.payload, "command published");
                Ok(())
            }
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "command publish failed");
                Err(e)
            }
        }
    }
}
