//! Event delivery to the owning application.

use std::sync::{Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tracing::trace;
use usbmux_types::DeviceEvent;

/// Receives roster and listener notifications.
///
/// Called from the listener's reader task; implementations must not block.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: DeviceEvent);
}

impl EventSink for mpsc::UnboundedSender<DeviceEvent> {
    fn publish(&self, event: DeviceEvent) {
        if self.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }
}

impl EventSink for broadcast::Sender<DeviceEvent> {
    fn publish(&self, event: DeviceEvent) {
        if self.send(event).is_err() {
            trace!("No event subscribers");
        }
    }
}

/// Sink that keeps every event in memory, in publish order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DeviceEvent>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn take(&self) -> Vec<DeviceEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: DeviceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl<S: EventSink> EventSink for std::sync::Arc<S> {
    fn publish(&self, event: DeviceEvent) {
        (**self).publish(event);
    }
}
