//! The contract a transport driver (BLE link, fleet relay) fulfills.
//!
//! A transport moves length-framed opaque byte strings in both directions
//! and advertises how commands sent through it should be authenticated
//! and paced. Drivers themselves live outside this crate.

use std::time::Duration;

/// How outgoing commands are authenticated on a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    /// Leave the payload as-is (session info requests, pairing flows).
    None,
    /// Authenticate without encrypting, so an intermediary relay can
    /// still inspect the command.
    Hmac,
    /// Authenticate and encrypt.
    Gcm,
}

#[derive(Debug, thiserror::Error)]
#[error("transport: {reason}")]
pub struct TransportError {
    pub reason: String,
    /// The message may have reached the vehicle even though the send
    /// reported failure. Callers must not blindly resend side-effecting
    /// commands when this is set.
    pub possibly_delivered: bool,
    /// Retrying later may succeed.
    pub temporary: bool,
}

impl TransportError {
    pub fn temporary(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            possibly_delivered: false,
            temporary: true,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            possibly_delivered: false,
            temporary: false,
        }
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    fn preferred_auth_method(&self) -> AuthMethod;

    /// How long to wait before re-sending an unacknowledged message.
    fn retry_interval(&self) -> Duration;

    /// Slack granted to command expiries to absorb link latency.
    fn allowed_latency(&self) -> Duration;

    /// Sends one whole routing envelope.
    async fn send(&self, message: Vec<u8>) -> Result<(), TransportError>;

    /// The next inbound envelope; `None` once the link is gone.
    async fn recv(&self) -> Option<Vec<u8>>;

    async fn close(&self);
}
