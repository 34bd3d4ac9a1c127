//! error types shared across the bridge
//!
//! transport connect failures never leave the session loop, so they are not
//! modelled here; the loop logs `rumqttc::ConnectionError` directly and hands
//! it to the reconnect policy.

use thiserror::Error;

/// an inbound telemetry payload that could not be turned into a snapshot
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid json: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload is json but not an object")]
    NotAnObject,
}

/// a command that could not be handed to the transport
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not connected to broker")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(#[from] rumqttc::ClientError),
}
