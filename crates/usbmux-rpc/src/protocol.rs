//! usbmux protocol types.
//!
//! A packet is a fixed 16-byte header followed by an XML property-list
//! dictionary. The header carries the total length, the protocol version, the
//! message encoding and the transaction tag used to correlate replies.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use plist::{Dictionary, Value};
use tracing::debug;
use usbmux_types::DeviceId;

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Header version for property-list framed packets.
pub const PLIST_VERSION: u32 = 1;

/// Header message code for property-list payloads.
pub const PLIST_MESSAGE: u32 = 8;

/// Value sent under `kLibUSBMuxVersion`.
pub const LIB_USBMUX_VERSION: u64 = 3;

/// Reply deadline for connect and listen requests.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(30);

/// Reply deadline for every other request.
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reserved port value meaning "use the lockdown port". Already in wire byte
/// order, so it is sent unchanged.
pub const DEFAULT_PORT: u16 = 0x7ef2;

/// Payload dictionary keys.
pub mod keys {
    pub const MESSAGE_TYPE: &str = "MessageType";
    pub const DEVICE_ID: &str = "DeviceID";
    pub const PORT_NUMBER: &str = "PortNumber";
    pub const BUNDLE_ID: &str = "BundleID";
    pub const CLIENT_VERSION_STRING: &str = "ClientVersionString";
    pub const PROG_NAME: &str = "ProgName";
    pub const LIB_USBMUX_VERSION: &str = "kLibUSBMuxVersion";
    pub const CONN_TYPE: &str = "ConnType";
    pub const NUMBER: &str = "Number";
    pub const STRING: &str = "String";
    pub const DEVICE_LIST: &str = "DeviceList";
    pub const LISTENER_LIST: &str = "ListenerList";
    pub const LOGS: &str = "Logs";
    pub const PROPERTIES: &str = "Properties";
    pub const BUID: &str = "BUID";
}

/// Message kinds carried in the `MessageType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Result,
    Connect,
    Listen,
    Attached,
    Detached,
    ListDevices,
    ListListeners,
    ReadBuid,
}

impl MessageType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Result => "Result",
            Self::Connect => "Connect",
            Self::Listen => "Listen",
            Self::Attached => "Attached",
            Self::Detached => "Detached",
            Self::ListDevices => "ListDevices",
            Self::ListListeners => "ListListeners",
            Self::ReadBuid => "ReadBUID",
        }
    }

    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "Result" => Some(Self::Result),
            "Connect" => Some(Self::Connect),
            "Listen" => Some(Self::Listen),
            "Attached" => Some(Self::Attached),
            "Detached" => Some(Self::Detached),
            "ListDevices" => Some(Self::ListDevices),
            "ListListeners" => Some(Self::ListListeners),
            "ReadBUID" => Some(Self::ReadBuid),
            _ => None,
        }
    }

    /// Connect and listen may wait on device-side negotiation.
    #[must_use]
    pub fn timeout(self) -> Duration {
        match self {
            Self::Connect | Self::Listen => LONG_TIMEOUT,
            _ => SHORT_TIMEOUT,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static NEXT_TAG: AtomicU32 = AtomicU32::new(1);

/// Allocate the next transaction tag. Tags are unique for the life of the
/// process and never zero.
pub fn next_tag() -> u32 {
    loop {
        let tag = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
        if tag != 0 {
            return tag;
        }
    }
}

/// Identity block stamped into every outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub bundle_id: String,
    pub client_version: String,
    pub prog_name: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            bundle_id: "io.usbmux.client".to_string(),
            client_version: "usbmuxd-323".to_string(),
            prog_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

impl ClientIdentity {
    fn stamp(&self, payload: &mut Dictionary) {
        payload.insert(keys::BUNDLE_ID.to_string(), Value::from(self.bundle_id.as_str()));
        payload.insert(
            keys::CLIENT_VERSION_STRING.to_string(),
            Value::from(self.client_version.as_str()),
        );
        payload.insert(keys::PROG_NAME.to_string(), Value::from(self.prog_name.as_str()));
        payload.insert(
            keys::LIB_USBMUX_VERSION.to_string(),
            Value::from(LIB_USBMUX_VERSION),
        );
    }
}

/// Fixed packet header. All fields are little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Total packet size, header included.
    pub length: u32,
    pub version: u32,
    pub message: u32,
    pub tag: u32,
}

impl PacketHeader {
    /// Number of payload bytes that follow the header.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_SIZE)
    }
}

/// A framed usbmux packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Option<Dictionary>,
    /// How long a caller waits for the reply to this packet.
    pub timeout: Duration,
}

impl Packet {
    /// Build a request with the default client identity.
    #[must_use]
    pub fn request(kind: MessageType, extra: Option<Dictionary>) -> Self {
        Self::request_with_identity(kind, extra, &ClientIdentity::default())
    }

    /// Build a request: identity block, then caller fields, then
    /// `MessageType`, then the kind-specific defaults.
    #[must_use]
    pub fn request_with_identity(
        kind: MessageType,
        extra: Option<Dictionary>,
        identity: &ClientIdentity,
    ) -> Self {
        let mut payload = Dictionary::new();
        identity.stamp(&mut payload);

        if let Some(extra) = extra {
            for (key, value) in extra {
                payload.insert(key, value);
            }
        }

        let previous = payload.insert(keys::MESSAGE_TYPE.to_string(), Value::from(kind.as_str()));
        if let Some(previous) = previous.filter(|p| p.as_string() != Some(kind.as_str())) {
            debug!("Caller-supplied MessageType {:?} replaced by {}", previous, kind);
        }

        match kind {
            MessageType::Connect if !payload.contains_key(keys::PORT_NUMBER) => {
                payload.insert(keys::PORT_NUMBER.to_string(), Value::from(DEFAULT_PORT));
            }
            MessageType::Listen if !payload.contains_key(keys::CONN_TYPE) => {
                payload.insert(keys::CONN_TYPE.to_string(), Value::from(0_u32));
            }
            _ => {}
        }

        let mut packet = Self {
            header: PacketHeader {
                length: 0,
                version: PLIST_VERSION,
                message: PLIST_MESSAGE,
                tag: next_tag(),
            },
            payload: Some(payload),
            timeout: kind.timeout(),
        };
        packet.refresh_length();
        packet
    }

    /// `Connect` request tunnelling to `port` on a device. The port is given in
    /// host order; [`DEFAULT_PORT`] is passed through untouched.
    #[must_use]
    pub fn connect(device_id: DeviceId, port: u16) -> Self {
        let wire_port = if port == DEFAULT_PORT {
            DEFAULT_PORT
        } else {
            port.to_be()
        };

        let mut extra = Dictionary::new();
        extra.insert(keys::DEVICE_ID.to_string(), Value::from(device_id));
        extra.insert(keys::PORT_NUMBER.to_string(), Value::from(wire_port));
        Self::request(MessageType::Connect, Some(extra))
    }

    #[must_use]
    pub fn listen() -> Self {
        Self::request(MessageType::Listen, None)
    }

    /// A packet as read off the wire.
    #[must_use]
    pub fn inbound(header: PacketHeader, payload: Option<Dictionary>) -> Self {
        Self {
            header,
            payload,
            timeout: SHORT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn tag(&self) -> u32 {
        self.header.tag
    }

    /// Raw `MessageType` string, if the payload carries one.
    #[must_use]
    pub fn message_type(&self) -> Option<&str> {
        self.payload
            .as_ref()?
            .get(keys::MESSAGE_TYPE)
            .and_then(Value::as_string)
    }

    /// Recompute `header.length` from the encoded payload.
    #[allow(clippy::cast_possible_truncation)] // Payloads are bounded well below u32::MAX
    pub fn refresh_length(&mut self) {
        let payload_len = match self.payload.as_ref().map(encode_payload).transpose() {
            Ok(bytes) => bytes.map_or(0, |b| b.len()),
            Err(e) => {
                debug!("Payload for tag {} does not encode: {}", self.header.tag, e);
                0
            }
        };
        self.header.length = (HEADER_SIZE + payload_len) as u32;
    }
}

/// Encode a payload dictionary as an XML property list.
///
/// # Errors
///
/// Returns an error if the dictionary holds a value XML cannot express.
pub fn encode_payload(payload: &Dictionary) -> Result<Vec<u8>, plist::Error> {
    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, payload)?;
    Ok(buf)
}

/// Decode payload bytes into a dictionary. Anything that is not a property
/// list dictionary yields `None`.
#[must_use]
pub fn decode_payload(bytes: &[u8]) -> Option<Dictionary> {
    match Value::from_reader(std::io::Cursor::new(bytes)) {
        Ok(value) => {
            let dict = value.into_dictionary();
            if dict.is_none() {
                debug!("Payload decoded but is not a dictionary");
            }
            dict
        }
        Err(e) => {
            debug!("Payload failed to decode: {}", e);
            None
        }
    }
}
