//! Classification of inbound packets.

use plist::{Dictionary, Value};
use usbmux_rpc::{MessageType, keys};

/// Route for one inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// `MessageType` = `Result`: a reply to a request.
    Result,
    Attached,
    Detached,
    /// Any other `MessageType`; nothing handles it.
    Ignored(String),
    /// Untyped payload with `Logs`.
    Logs,
    /// Untyped payload with `DeviceList`.
    DeviceList,
    /// Untyped payload with `ListenerList`.
    ListenerList,
    /// Untyped payload with none of the known keys.
    Unknown,
}

impl Inbound {
    #[must_use]
    pub fn classify(payload: &Dictionary) -> Self {
        if let Some(kind) = payload.get(keys::MESSAGE_TYPE) {
            let name = kind.as_string().unwrap_or_default();
            return match MessageType::from_wire(name) {
                Some(MessageType::Result) => Self::Result,
                Some(MessageType::Attached) => Self::Attached,
                Some(MessageType::Detached) => Self::Detached,
                _ => Self::Ignored(name.to_string()),
            };
        }

        if payload.contains_key(keys::LOGS) {
            Self::Logs
        } else if payload.contains_key(keys::DEVICE_LIST) {
            Self::DeviceList
        } else if payload.contains_key(keys::LISTENER_LIST) {
            Self::ListenerList
        } else {
            Self::Unknown
        }
    }

    /// Whether the packet also lands in the pending-reply set.
    #[must_use]
    pub fn is_correlatable(&self) -> bool {
        !matches!(self, Self::Attached | Self::Detached | Self::Ignored(_))
    }
}

/// The `DeviceList` array of a payload, if present.
#[must_use]
pub fn device_list(payload: &Dictionary) -> Option<&Vec<Value>> {
    payload.get(keys::DEVICE_LIST).and_then(Value::as_array)
}
