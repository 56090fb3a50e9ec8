//! Shared types for usbmux client components.
//!
//! This crate holds the device model as seen by the protocol engine and the
//! notification events published when the device roster changes. Device entries
//! are built from the property dictionaries the daemon pushes in `Attached`
//! messages and `DeviceList` snapshots.

use plist::{Dictionary, Value};
use serde::{Deserialize, Serialize};

/// Daemon-assigned connection identifier of a device.
pub type DeviceId = u32;

/// How a device is connected to the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConnectionType {
    #[default]
    Usb,
    Network,
    Other(String),
}

impl ConnectionType {
    /// Parse the `ConnectionType` string carried in device properties.
    #[must_use]
    pub fn from_wire(value: &str) -> Self {
        match value {
            "USB" => Self::Usb,
            "Network" => Self::Network,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_wire(&self) -> &str {
        match self {
            Self::Usb => "USB",
            Self::Network => "Network",
            Self::Other(s) => s,
        }
    }

    /// USB links win over network links when both exist for one device.
    #[must_use]
    pub fn priority(&self) -> u8 {
        match self {
            Self::Usb => 0,
            Self::Network => 1,
            Self::Other(_) => 2,
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// A device known to the daemon.
///
/// Identity is the [`DeviceId`]; two entries with the same id refer to the
/// same attached device regardless of the remaining attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub device_id: DeviceId,
    pub connection_type: ConnectionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_id: Option<u64>,
    #[serde(default)]
    pub properties: Dictionary,
}

impl DeviceEntry {
    #[must_use]
    pub fn new(device_id: DeviceId, connection_type: ConnectionType) -> Self {
        Self {
            device_id,
            connection_type,
            serial_number: None,
            product_id: None,
            location_id: None,
            properties: Dictionary::new(),
        }
    }

    /// Build a device entry from an `Attached` payload or a `DeviceList` item.
    ///
    /// The `DeviceID` is read from the top level first and from the nested
    /// `Properties` dictionary second. Returns `None` when neither carries a
    /// usable id.
    #[must_use]
    pub fn from_properties(payload: &Dictionary) -> Option<Self> {
        let properties = payload
            .get("Properties")
            .and_then(Value::as_dictionary)
            .cloned()
            .unwrap_or_default();

        let device_id = payload
            .get("DeviceID")
            .or_else(|| properties.get("DeviceID"))
            .and_then(value_as_u32)?;

        let connection_type = properties
            .get("ConnectionType")
            .and_then(Value::as_string)
            .map(ConnectionType::from_wire)
            .unwrap_or_default();

        Some(Self {
            device_id,
            connection_type,
            serial_number: properties
                .get("SerialNumber")
                .and_then(Value::as_string)
                .map(ToString::to_string),
            product_id: properties
                .get("ProductID")
                .and_then(Value::as_unsigned_integer),
            location_id: properties
                .get("LocationID")
                .and_then(Value::as_unsigned_integer),
            properties,
        })
    }

    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.device_id
    }

    #[must_use]
    pub fn same_device(&self, other: &DeviceEntry) -> bool {
        self.device_id == other.device_id
    }
}

/// Read a property-list integer as a `u32`, accepting signed encodings.
#[must_use]
pub fn value_as_u32(value: &Value) -> Option<u32> {
    value
        .as_unsigned_integer()
        .and_then(|n| u32::try_from(n).ok())
        .or_else(|| {
            value
                .as_signed_integer()
                .and_then(|n| u32::try_from(n).ok())
        })
}

/// Notifications published when the roster or listener changes.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A device not previously in the roster was added.
    Attached(DeviceEntry),
    /// One attach message was processed, whether or not it added a device.
    AttachFinished(Option<DeviceEntry>),
    /// A device was removed from the roster.
    Detached(DeviceEntry),
    /// One detach message was processed.
    DetachFinished,
    /// The listener connection was closed.
    ListenerStopped,
}

impl DeviceEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Attached(_) => "device attached",
            Self::AttachFinished(_) => "device attach finished",
            Self::Detached(_) => "device detached",
            Self::DetachFinished => "device detach finished",
            Self::ListenerStopped => "listener stopped",
        }
    }

    /// The device carried by this event, if any.
    #[must_use]
    pub fn device(&self) -> Option<&DeviceEntry> {
        match self {
            Self::Attached(d) | Self::Detached(d) => Some(d),
            Self::AttachFinished(d) => d.as_ref(),
            Self::DetachFinished | Self::ListenerStopped => None,
        }
    }
}
