//! Fire-and-forget notifications about device lifecycle changes.

use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 64;

/// Lifecycle notifications emitted by the launcher and coordinator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceEvent {
    /// A new remote instance was created and registered.
    Provisioned {
        /// Provider identifier.
        uuid: String,
        /// Instance name.
        name: String,
        /// Recipe name the instance was launched from.
        recipe: String,
    },
    /// An existing instance was claimed for reuse.
    Claimed {
        /// Provider identifier.
        uuid: String,
    },
    /// A claim was released; the instance stays alive.
    Released {
        /// Provider identifier.
        uuid: String,
    },
    /// The remote instance was deleted.
    Deleted {
        /// Provider identifier.
        uuid: String,
    },
}

/// Broadcast channel for [`DeviceEvent`]s.
///
/// Emitting never blocks. Slow subscribers lose the oldest events.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<DeviceEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns a receiver for events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.sender.subscribe()
    }

    /// Publishes `event` to current subscribers, if any.
    pub fn emit(&self, event: DeviceEvent) {
        if let Err(unsent) = self.sender.send(event) {
            trace!(event = ?unsent.0, "no device event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
