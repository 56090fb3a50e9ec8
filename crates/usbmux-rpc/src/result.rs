//! Translation of daemon result codes.
//!
//! Replies of kind `Result` carry a `Number` and optionally a `String`. The
//! daemon's raw numbers are mapped onto the canonical codes callers see.

use plist::{Dictionary, Value};
use usbmux_types::value_as_u32;

use crate::protocol::keys;

/// Raw result numbers as sent by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DaemonResult {
    Ok = 0,
    BadCommand = 1,
    BadDevice = 2,
    ConnectionRefused = 3,
    Unknown0 = 4,
    Unknown1 = 5,
    BadVersion = 6,
    Unknown2 = 7,
}

impl DaemonResult {
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            1 => Some(Self::BadCommand),
            2 => Some(Self::BadDevice),
            3 => Some(Self::ConnectionRefused),
            4 => Some(Self::Unknown0),
            5 => Some(Self::Unknown1),
            6 => Some(Self::BadVersion),
            7 => Some(Self::Unknown2),
            _ => None,
        }
    }

    /// Canonical code and default description.
    #[must_use]
    pub fn canonical(self) -> (u32, Option<&'static str>) {
        match self {
            Self::Ok => (0, Some("OK")),
            Self::BadCommand => (0x2d, Some("Bad Command")),
            Self::BadDevice => (0x06, Some("Bad Device")),
            Self::ConnectionRefused => (0x3d, Some("Connection Refused by Device")),
            Self::Unknown0 => (0xffff_ffff, None),
            Self::Unknown1 => (0x16, None),
            Self::BadVersion => (0x49, Some("Bad Protocol Version")),
            Self::Unknown2 => (0x4b, None),
        }
    }
}

/// A translated result: `code == 0` means success.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseCode {
    pub code: u32,
    pub description: Option<String>,
}

impl ResponseCode {
    /// Translate a raw daemon number. A supplied description always wins over
    /// the table default; unknown numbers pass through unchanged.
    #[must_use]
    pub fn translate(raw: u32, description: Option<String>) -> Self {
        match DaemonResult::from_raw(raw) {
            Some(result) => {
                let (code, default) = result.canonical();
                Self {
                    code,
                    description: description.or_else(|| default.map(str::to_string)),
                }
            }
            None => Self {
                code: raw,
                description,
            },
        }
    }

    /// Translate the `Number`/`String` pair of a reply payload. A payload
    /// without `Number` yields code 0 with no description.
    #[must_use]
    pub fn from_payload(payload: &Dictionary) -> Self {
        let Some(raw) = payload.get(keys::NUMBER).and_then(value_as_u32) else {
            return Self::default();
        };
        let description = payload
            .get(keys::STRING)
            .and_then(Value::as_string)
            .map(str::to_string);
        Self::translate(raw, description)
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:#x} - {}",
            self.code,
            self.description
                .as_deref()
                .unwrap_or("Unknown Error Description")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: [(DaemonResult, u32, Option<&str>); 8] = [
        (DaemonResult::Ok, 0, Some("OK")),
        (DaemonResult::BadCommand, 0x2d, Some("Bad Command")),
        (DaemonResult::BadDevice, 0x06, Some("Bad Device")),
        (
            DaemonResult::ConnectionRefused,
            0x3d,
            Some("Connection Refused by Device"),
        ),
        (DaemonResult::Unknown0, 0xffff_ffff, None),
        (DaemonResult::Unknown1, 0x16, None),
        (DaemonResult::BadVersion, 0x49, Some("Bad Protocol Version")),
        (DaemonResult::Unknown2, 0x4b, None),
    ];

    #[test]
    fn test_table_defaults() {
        for (input, code, description) in TABLE {
            let result = ResponseCode::translate(input as u32, None);
            assert_eq!(result.code, code, "{input:?}");
            assert_eq!(result.description.as_deref(), description, "{input:?}");
        }
    }

    #[test]
    fn test_supplied_description_wins() {
        for (input, code, _) in TABLE {
            let result = ResponseCode::translate(input as u32, Some("from daemon".to_string()));
            assert_eq!(result.code, code);
            assert_eq!(result.description.as_deref(), Some("from daemon"));
        }
    }

    #[test]
    fn test_unknown_code_passes_through() {
        let result = ResponseCode::translate(99, None);
        assert_eq!(result, ResponseCode { code: 99, description: None });

        let result = ResponseCode::translate(99, Some("odd".to_string()));
        assert_eq!(result.description.as_deref(), Some("odd"));
    }

    #[test]
    fn test_from_payload_without_number() {
        let mut payload = Dictionary::new();
        payload.insert(keys::STRING.to_string(), Value::from("ignored"));
        assert_eq!(ResponseCode::from_payload(&payload), ResponseCode::default());
        assert!(ResponseCode::from_payload(&Dictionary::new()).is_ok());
    }

    #[test]
    fn test_from_payload_with_number_and_string() {
        let mut payload = Dictionary::new();
        payload.insert(keys::NUMBER.to_string(), Value::from(3_u64));
        let result = ResponseCode::from_payload(&payload);
        assert_eq!(result.code, 0x3d);
        assert!(!result.is_ok());

        payload.insert(keys::STRING.to_string(), Value::from("device said no"));
        let result = ResponseCode::from_payload(&payload);
        assert_eq!(result.description.as_deref(), Some("device said no"));
    }

    #[test]
    fn test_display() {
        let result = ResponseCode::translate(1, None);
        assert_eq!(result.to_string(), "0x2d - Bad Command");
        let result = ResponseCode::translate(5, None);
        assert_eq!(result.to_string(), "0x16 - Unknown Error Description");
    }
}
