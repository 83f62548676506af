//! Lifecycle notifications for the hosting application.
//!
//! The store never drives UI itself. It publishes a [`StoreEvent`] and the
//! host decides whether to prompt for device credentials, show an
//! "encryption key expired" screen, or reset caches.

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::store::StoreId;

pub const DEFAULT_EVENT_CAPACITY: usize = 32;
const SIGNAL_PREFIX: &str = "credstore.intent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The key's presence window lapsed; the host should ask the user to
    /// confirm their device credential.
    UserShouldAuthenticate,
    /// The key was destroyed by an enrollment change. Stored data is gone.
    KeyPermanentlyInvalidated,
    /// A store file was deleted.
    StoreCleared,
}

impl EventKind {
    /// Broadcast name of the signal.
    pub fn signal_name(&self) -> String {
        let action = match self {
            Self::UserShouldAuthenticate => "USER_SHOULD_AUTHENTICATE",
            Self::KeyPermanentlyInvalidated => "CONTENT_ENCRYPTION_KEY_PERMANENTLY_INVALIDATED",
            Self::StoreCleared => "STORAGE_CLEARED",
        };
        format!("{SIGNAL_PREFIX}.{action}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: EventKind,
    pub store: StoreId,
}

impl StoreEvent {
    pub fn new(kind: EventKind, store: StoreId) -> Self {
        Self { kind, store }
    }
}

impl fmt::Display for StoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind.signal_name(), self.store)
    }
}

/// Fan-out channel with one bounded queue per subscriber.
///
/// Cloning yields another handle on the same subscriber list.
#[derive(Clone)]
pub struct EventChannel {
    subscribers: Arc<Mutex<Vec<SyncSender<StoreEvent>>>>,
    capacity: usize,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::sync_channel(self.capacity);
        self.lock().push(tx);
        EventReceiver { rx }
    }

    /// Deliver without blocking. A full queue loses the event for that
    /// subscriber only; dropped receivers are pruned.
    pub fn emit(&self, event: StoreEvent) {
        debug!(%event, "emitting store event");
        self.lock().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%event, "subscriber queue full, event dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SyncSender<StoreEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Receiving end handed to the host application.
pub struct EventReceiver {
    rx: Receiver<StoreEvent>,
}

impl EventReceiver {
    pub fn try_recv(&self) -> Option<StoreEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout`. `None` on timeout or when the channel is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<StoreEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything queued so far.
    pub fn drain(&self) -> Vec<StoreEvent> {
        self.rx.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleared() -> StoreEvent {
        StoreEvent::new(EventKind::StoreCleared, StoreId::user())
    }

    #[test]
    fn fans_out_to_every_subscriber() {
        let channel = EventChannel::default();
        let a = channel.subscribe();
        let b = channel.subscribe();

        channel.emit(cleared());
        assert_eq!(a.try_recv(), Some(cleared()));
        assert_eq!(b.drain(), vec![cleared()]);
        assert_eq!(a.try_recv(), None);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let channel = EventChannel::new(1);
        let rx = channel.subscribe();
        channel.emit(cleared());
        channel.emit(cleared());
        assert_eq!(rx.drain().len(), 1);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let channel = EventChannel::default();
        let rx = channel.subscribe();
        let clone = channel.clone();
        drop(rx);
        assert_eq!(clone.subscriber_count(), 1);
        clone.emit(cleared());
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[test]
    fn signal_names() {
        assert_eq!(
            EventKind::UserShouldAuthenticate.signal_name(),
            "credstore.intent.USER_SHOULD_AUTHENTICATE"
        );
        assert_eq!(
            EventKind::StoreCleared.signal_name(),
            "credstore.intent.STORAGE_CLEARED"
        );
        assert_eq!(
            cleared().to_string(),
            "credstore.intent.STORAGE_CLEARED (user-storage)"
        );
    }
}
