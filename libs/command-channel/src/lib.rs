//! Request/response dispatch over a single vehicle transport.
//!
//! A [`Dispatcher`] owns one message-oriented connection to a vehicle and
//! multiplexes pending commands over it: it runs per-domain handshakes,
//! signs outgoing commands with the negotiated sessions, and routes each
//! reply to the [`Receiver`] that is waiting for it. The [`SessionCache`]
//! persists handshake state across process restarts.
//!
//! Transport drivers (BLE stacks, fleet relays) live elsewhere and plug
//! in through the [`Transport`] trait.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod cache;
mod dispatcher;
mod receiver;
mod transport;

pub use cache::{CacheEntry, SessionCache};
pub use dispatcher::{Dispatcher, SendError};
pub use receiver::Receiver;
pub use transport::{AuthMethod, Transport, TransportError};
