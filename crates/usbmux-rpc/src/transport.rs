//! Packet framing and the daemon socket.
//!
//! Frame format:
//! ```text
//! +-----------+-----------+-----------+-----------+------------------+
//! | length LE | version LE| message LE|  tag LE   |  N bytes         |
//! | (u32)     | (u32)     | (u32)     | (u32)     |  (XML plist)     |
//! +-----------+-----------+-----------+-----------+------------------+
//! ```
//! `length` counts the whole frame, header included.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use tokio::net::UnixStream;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::error::Error;
use crate::protocol::{HEADER_SIZE, Packet, PacketHeader, decode_payload, encode_payload};

/// Maximum frame size (16 MB)
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Send and receive buffer size requested on the daemon socket.
const SOCKET_BUFFER_SIZE: libc::c_int = 0x0001_0400;

/// Well-known daemon rendezvous point.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/usbmuxd";

/// Environment override for the daemon socket, optionally `UNIX:`-prefixed.
pub const SOCKET_ADDRESS_ENV: &str = "USBMUXD_SOCKET_ADDRESS";

/// Get the daemon socket path.
///
/// Honors `$USBMUXD_SOCKET_ADDRESS` when it names a Unix socket, otherwise
/// falls back to [`DEFAULT_SOCKET_PATH`].
#[must_use]
pub fn socket_path() -> PathBuf {
    std::env::var(SOCKET_ADDRESS_ENV)
        .ok()
        .and_then(|value| parse_socket_address(&value))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}

fn parse_socket_address(value: &str) -> Option<PathBuf> {
    let path = value.strip_prefix("UNIX:").unwrap_or(value).trim();
    if path.starts_with('/') {
        Some(PathBuf::from(path))
    } else {
        warn!("Ignoring non-unix {}={}", SOCKET_ADDRESS_ENV, value);
        None
    }
}

/// Connect to the daemon socket and tune its buffers.
///
/// On Apple targets the socket is marked `SO_NOSIGPIPE`. Elsewhere a write to
/// a socket whose peer has gone raises `SIGPIPE`: Rust binaries ignore it by
/// default, but a non-Rust host embedding this library must ignore `SIGPIPE`
/// itself or the process is killed instead of seeing `Error::Disconnected`.
///
/// # Errors
///
/// Returns `Error::Transport` if the connect or any socket option fails.
pub async fn connect(path: &Path) -> Result<UnixStream, Error> {
    let stream = UnixStream::connect(path).await.map_err(Error::Transport)?;
    tune_socket(stream.as_raw_fd()).map_err(Error::Transport)?;
    debug!("Connected to usbmux daemon at {}", path.display());
    Ok(stream)
}

fn tune_socket(fd: RawFd) -> io::Result<()> {
    set_socket_option(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, SOCKET_BUFFER_SIZE)?;
    set_socket_option(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, SOCKET_BUFFER_SIZE)?;
    // Elsewhere SIGPIPE must be ignored by the process; see `connect`.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    set_socket_option(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;
    Ok(())
}

// size_of::<c_int>() is 4
#[allow(clippy::cast_possible_truncation)]
fn set_socket_option(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    // SAFETY: fd is an open socket borrowed from a live UnixStream and the
    // option value pointer is valid for the duration of the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            std::ptr::from_ref(&value).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Codec for usbmux packets
#[derive(Debug, Default)]
pub struct UsbmuxCodec {
    current_header: Option<PacketHeader>,
}

impl UsbmuxCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for UsbmuxCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.current_header.is_none() {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            let header = PacketHeader {
                length: src.get_u32_le(),
                version: src.get_u32_le(),
                message: src.get_u32_le(),
                tag: src.get_u32_le(),
            };

            if (header.length as usize) < HEADER_SIZE {
                return Err(CodecError::InvalidLength(header.length));
            }
            if header.length as usize > MAX_MESSAGE_SIZE {
                return Err(CodecError::MessageTooLarge(header.length as usize));
            }

            self.current_header = Some(header);
        }

        let Some(header) = self.current_header else {
            return Ok(None);
        };

        let length = header.payload_len();
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let body = src.split_to(length);
        self.current_header = None;

        let payload = if body.is_empty() {
            None
        } else {
            let payload = decode_payload(&body);
            if payload.is_none() {
                warn!(
                    "Packet tag {} carried {} payload bytes that did not decode",
                    header.tag,
                    body.len()
                );
            }
            payload
        };

        Ok(Some(Packet::inbound(header, payload)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(packet) = self.decode(buf)? {
            return Ok(Some(packet));
        }

        match self.current_header.take() {
            Some(header) => Err(CodecError::ShortRead {
                expected: header.payload_len(),
                received: buf.len(),
            }),
            None if buf.is_empty() => Ok(None),
            None => Err(CodecError::ShortRead {
                expected: HEADER_SIZE,
                received: buf.len(),
            }),
        }
    }
}

impl Encoder<Packet> for UsbmuxCodec {
    type Error = CodecError;

    // Frame size is checked against MAX_MESSAGE_SIZE (fits in u32)
    #[allow(clippy::cast_possible_truncation)]
    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = match &item.payload {
            Some(payload) => encode_payload(payload)?,
            None => Vec::new(),
        };

        let length = HEADER_SIZE + payload.len();
        if length > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        dst.reserve(length);
        dst.put_u32_le(length as u32);
        dst.put_u32_le(item.header.version);
        dst.put_u32_le(item.header.message);
        dst.put_u32_le(item.header.tag);
        dst.put_slice(&payload);

        Ok(())
    }
}

/// Errors that can occur during codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Payload encoding error: {0}")]
    Encode(#[from] plist::Error),

    #[error("Invalid frame length: {0} (header alone is {HEADER_SIZE})")]
    InvalidLength(u32),

    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("Connection closed mid-frame: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },
}
