//! Manager event system.
//!
//! Everything the manager reports to the outside world is a [`ManagerEvent`].
//! Events are queued in order and delivered by a single dispatcher task to
//! every registered [`ManagerListener`], outside of any manager lock.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use hrm_types::{
    DeviceIdentity, DisconnectReason, HeartRateReading, ManagerState, ScanFailureReason,
};

/// Events emitted by the connection manager.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ManagerEvent {
    /// Scanning could not start or was interrupted.
    UnableToStart { reason: ScanFailureReason },
    /// A heart-rate sensor without a live connection was seen.
    DeviceFound {
        identity: DeviceIdentity,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// A connection reached the streaming state.
    DeviceConnected { identity: DeviceIdentity },
    /// A connection terminated. Sent exactly once per connection.
    DeviceDisconnected {
        identity: DeviceIdentity,
        reason: DisconnectReason,
    },
    /// A heart-rate value arrived.
    ValueChanged { reading: HeartRateReading },
    /// The aggregate manager state changed.
    ManagerStateChanged { state: ManagerState },
}

impl ManagerEvent {
    /// The device this event concerns, if any.
    pub fn identity(&self) -> Option<&DeviceIdentity> {
        match self {
            Self::DeviceFound { identity, .. }
            | Self::DeviceConnected { identity }
            | Self::DeviceDisconnected { identity, .. } => Some(identity),
            Self::ValueChanged { reading } => Some(&reading.identity),
            Self::UnableToStart { .. } | Self::ManagerStateChanged { .. } => None,
        }
    }
}

/// Receiver of manager events.
///
/// Called from the dispatcher task; implementations must not block for long.
pub trait ManagerListener: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &ManagerEvent);

    /// Whether this listener can no longer receive events.
    ///
    /// Closed listeners are dropped from the registry before the next
    /// delivery.
    fn is_closed(&self) -> bool {
        false
    }
}

impl<F> ManagerListener for F
where
    F: Fn(&ManagerEvent) + Send + Sync,
{
    fn on_event(&self, event: &ManagerEvent) {
        self(event)
    }
}

/// Listener that forwards every event into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<ManagerEvent>,
}

impl ChannelListener {
    /// Create a listener and the receiver its events go to.
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }

    /// Whether the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl ManagerListener for ChannelListener {
    fn on_event(&self, event: &ManagerEvent) {
        // Closed between the liveness check and this send.
        let _ = self.sender.send(event.clone());
    }

    fn is_closed(&self) -> bool {
        ChannelListener::is_closed(self)
    }
}

/// Ordered set of listeners.
///
/// Insertion order is notification order. A listener is identified by its
/// `Arc` allocation, so registering the same handle twice has no effect.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Arc<dyn ManagerListener>>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn ManagerListener>>> {
        // A listener never runs under this lock, so poisoning cannot leave
        // the list half-updated.
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a listener. Returns `false` if it was already registered.
    pub fn add(&self, listener: Arc<dyn ManagerListener>) -> bool {
        let mut listeners = self.lock();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove(&self, listener: &Arc<dyn ManagerListener>) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Whether a listener is registered.
    pub fn contains(&self, listener: &Arc<dyn ManagerListener>) -> bool {
        self.lock().iter().any(|l| Arc::ptr_eq(l, listener))
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Deliver one event to every listener, in registration order.
    ///
    /// Works on a snapshot so listeners may add or remove listeners while
    /// being called. A listener removed before its turn is skipped, and a
    /// closed one is removed.
    pub fn dispatch(&self, event: &ManagerEvent) {
        let snapshot: Vec<_> = self.lock().clone();
        for listener in snapshot {
            if !self.contains(&listener) {
                continue;
            }
            if listener.is_closed() {
                debug!("Dropping closed listener");
                self.remove(&listener);
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
                warn!("Listener panicked while handling {:?}", event);
            }
        }
    }
}

/// Spawn the task that drains `events` into `registry`.
///
/// The task ends once every sender of `events` is dropped.
pub(crate) fn spawn_dispatcher(
    registry: Arc<ListenerRegistry>,
    mut events: mpsc::Receiver<ManagerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            registry.dispatch(&event);
        }
        debug!("Event dispatcher stopped");
    })
}
