//! Per-request inboxes and the registry that routes replies into them.

use fleetlink_model::{Domain, RoutingAddress};
use keyfob::wire::RoutedMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Replies are matched on (destination address, request uuid, source
/// domain); the address component keeps one client's replies invisible to
/// another client sharing the transport.
pub(crate) type ReceiverKey = (RoutingAddress, [u8; 16], Domain);

/// A stuck consumer loses its own replies, never anyone else's.
pub(crate) const INBOX_CAPACITY: usize = 10;

#[derive(Default)]
pub(crate) struct Registry {
    receivers: Mutex<HashMap<ReceiverKey, mpsc::Sender<RoutedMessage>>>,
}

impl Registry {
    /// Registers an inbox under `key`, replacing any previous holder.
    pub(crate) fn register(self: &Arc<Self>, key: ReceiverKey) -> Receiver {
        let (sender, inbox) = mpsc::channel(INBOX_CAPACITY);
        self.receivers.lock().insert(key, sender);

        Receiver {
            key,
            inbox,
            registry: Arc::downgrade(self),
            closed: false,
        }
    }

    /// Non-blocking delivery into the matching inbox. Returns false if no
    /// receiver claims the key.
    pub(crate) fn deliver(&self, key: &ReceiverKey, message: RoutedMessage) -> bool {
        let receivers = self.receivers.lock();
        let Some(sender) = receivers.get(key) else {
            return false;
        };

        match sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(uuid = %hex::encode(key.1), "Inbox full; dropping reply");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) fn remove(&self, key: &ReceiverKey) {
        self.receivers.lock().remove(key);
    }

    /// Pushes `terminal` into every inbox and forgets them all; their
    /// readers observe the terminal message, then end of stream.
    pub(crate) fn fail_all(&self, terminal: &RoutedMessage) {
        let receivers = std::mem::take(&mut *self.receivers.lock());

        for sender in receivers.into_values() {
            let _ = sender.try_send(terminal.clone());
        }
    }
}

/// The inbox awaiting replies to one sent message.
///
/// Replies arrive in delivery order. Dropping or closing the receiver
/// unregisters it; both are idempotent.
#[derive(Debug)]
pub struct Receiver {
    key: ReceiverKey,
    inbox: mpsc::Receiver<RoutedMessage>,
    registry: Weak<Registry>,
    closed: bool,
}

impl Receiver {
    /// The next reply, or `None` after close/teardown drained the inbox.
    pub async fn recv(&mut self) -> Option<RoutedMessage> {
        self.inbox.recv().await
    }

    /// The request uuid replies are matched against.
    pub fn request_uuid(&self) -> &[u8; 16] {
        &self.key.1
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key);
        }
        self.inbox.close();
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.close();
    }
}
