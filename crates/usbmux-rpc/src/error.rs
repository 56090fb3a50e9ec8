//! Error types for the usbmux-rpc crate.

use std::io;

use crate::result::ResponseCode;
use crate::transport::CodecError;

/// Unified error type for usbmux protocol operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket creation, option tuning or connect failed.
    #[error("Transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("Short write: connection stopped accepting bytes mid-packet")]
    ShortWrite,

    #[error("Short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Request timeout")]
    Timeout,

    #[error("Connection closed")]
    Disconnected,

    #[error("Device refused connection: {0}")]
    ConnectRefused(ResponseCode),

    #[error("Reply carried no payload")]
    MissingPayload,
}

impl Error {
    /// Classify a failure while writing a packet.
    #[must_use]
    pub fn from_send(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) if e.kind() == io::ErrorKind::WriteZero => Self::ShortWrite,
            CodecError::Io(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                ) =>
            {
                Self::Disconnected
            }
            other => Self::Codec(other),
        }
    }

    /// Classify a failure while reading a packet.
    #[must_use]
    pub fn from_receive(err: CodecError) -> Self {
        match err {
            CodecError::ShortRead { expected, received } => Self::ShortRead { expected, received },
            CodecError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => Self::ShortRead {
                expected: 0,
                received: 0,
            },
            other => Self::Codec(other),
        }
    }

    /// Whether the connection can no longer be used. A payload that failed to
    /// encode never reached the socket, so it leaves the connection intact.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Timeout
                | Self::ConnectRefused(_)
                | Self::MissingPayload
                | Self::Codec(CodecError::Encode(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_send_write_zero_is_short_write() {
        let err = Error::from_send(CodecError::Io(io::Error::from(io::ErrorKind::WriteZero)));
        assert!(matches!(err, Error::ShortWrite));
    }

    #[test]
    fn test_from_send_broken_pipe_is_disconnected() {
        let err = Error::from_send(CodecError::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(matches!(err, Error::Disconnected));
    }

    #[test]
    fn test_from_send_other_is_codec() {
        let err = Error::from_send(CodecError::MessageTooLarge(1));
        assert!(matches!(err, Error::Codec(CodecError::MessageTooLarge(1))));
    }

    #[test]
    fn test_from_receive_short_read() {
        let err = Error::from_receive(CodecError::ShortRead {
            expected: 100,
            received: 12,
        });
        assert!(matches!(
            err,
            Error::ShortRead {
                expected: 100,
                received: 12
            }
        ));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(Error::Timeout.to_string(), "Request timeout");
        assert_eq!(Error::Disconnected.to_string(), "Connection closed");

        let err = Error::ConnectRefused(ResponseCode::translate(3, None));
        assert!(err.to_string().contains("Connection Refused by Device"));

        let err = Error::Transport(io::Error::new(io::ErrorKind::NotFound, "no socket"));
        assert!(err.to_string().contains("no socket"));
    }

    #[test]
    fn test_is_fatal() {
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::ConnectRefused(ResponseCode::default()).is_fatal());
        assert!(Error::ShortWrite.is_fatal());
        assert!(Error::Disconnected.is_fatal());
        assert!(
            Error::Codec(CodecError::ShortRead {
                expected: 16,
                received: 3
            })
            .is_fatal()
        );
    }
}
