//! Device roster kept in sync with daemon attach/detach traffic.
//!
//! The roster is an immutable snapshot behind a lock. Every change builds a
//! new snapshot and swaps it in whole, so readers holding an older snapshot
//! never see a partially applied update.

use std::sync::{Arc, PoisonError, RwLock};

use plist::{Dictionary, Value};
use tracing::{debug, info, warn};
use usbmux_rpc::keys;
use usbmux_types::{DeviceEntry, DeviceEvent, DeviceId, value_as_u32};

use crate::events::EventSink;

/// Immutable view of the roster at one point in time.
pub type Roster = Arc<[DeviceEntry]>;

#[derive(Debug)]
pub struct DeviceRegistry {
    roster: RwLock<Roster>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self {
            roster: RwLock::new(Arc::from(Vec::new())),
        }
    }
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Roster {
        self.roster
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn get(&self, id: DeviceId) -> Option<DeviceEntry> {
        self.snapshot().iter().find(|d| d.id() == id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: DeviceId) -> bool {
        self.snapshot().iter().any(|d| d.id() == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Handle an `Attached` payload.
    ///
    /// Publishes `Attached` when the device is new, then `AttachFinished`
    /// unconditionally, even when the payload held no usable device.
    pub fn attach(&self, payload: &Dictionary, sink: &dyn EventSink) {
        let device = DeviceEntry::from_properties(payload);

        let added = device.as_ref().and_then(|device| {
            let mut roster = self.roster.write().unwrap_or_else(PoisonError::into_inner);
            if roster.iter().any(|d| d.same_device(device)) {
                debug!("Device {} already known", device.id());
                return None;
            }
            let mut next = roster.to_vec();
            next.push(device.clone());
            *roster = Arc::from(next);
            Some(device.clone())
        });

        match (&device, added) {
            (_, Some(device)) => {
                info!(
                    "Device {} attached via {}",
                    device.id(),
                    device.connection_type
                );
                sink.publish(DeviceEvent::Attached(device));
            }
            (None, None) => warn!("Attach payload without a usable DeviceID"),
            (Some(_), None) => {}
        }

        sink.publish(DeviceEvent::AttachFinished(device));
    }

    /// Handle a `Detached` payload.
    ///
    /// Publishes one `Detached` per removed entry in roster order, then
    /// `DetachFinished` once.
    pub fn detach(&self, payload: &Dictionary, sink: &dyn EventSink) {
        let removed = match payload.get(keys::DEVICE_ID).and_then(value_as_u32) {
            Some(id) => self.remove(id),
            None => {
                warn!("Detach payload without a usable DeviceID");
                Vec::new()
            }
        };

        for device in removed {
            info!("Device {} detached", device.id());
            sink.publish(DeviceEvent::Detached(device));
        }

        sink.publish(DeviceEvent::DetachFinished);
    }

    fn remove(&self, id: DeviceId) -> Vec<DeviceEntry> {
        let mut roster = self.roster.write().unwrap_or_else(PoisonError::into_inner);
        let (removed, kept): (Vec<DeviceEntry>, Vec<DeviceEntry>) =
            roster.iter().cloned().partition(|d| d.id() == id);
        if removed.is_empty() {
            debug!("Detach for unknown device {}", id);
        } else {
            *roster = Arc::from(kept);
        }
        removed
    }

    /// Handle a full `DeviceList` snapshot. Entries that describe a device not
    /// yet known are run through [`attach`](Self::attach); known entries and
    /// entries without a usable `DeviceID` are skipped silently.
    pub fn apply_device_list(&self, devices: &[Value], sink: &dyn EventSink) {
        for item in devices {
            let Some(entry) = item.as_dictionary() else {
                warn!("Skipping non-dictionary DeviceList entry");
                continue;
            };
            match DeviceEntry::from_properties(entry) {
                Some(device) if !self.contains(device.id()) => self.attach(entry, sink),
                Some(_) => {}
                None => warn!("Skipping DeviceList entry without a usable DeviceID"),
            }
        }
    }

    /// Drop every entry without publishing events.
    pub fn clear(&self) {
        *self.roster.write().unwrap_or_else(PoisonError::into_inner) = Arc::from(Vec::new());
    }
}
