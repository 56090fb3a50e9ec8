//! Client-side protocol definitions for the usbmux daemon.
//!
//! This crate provides the packet types, framing codec, reply correlation and
//! request client for talking to the device multiplexing daemon over its Unix
//! socket.
//!
//! # Architecture
//!
//! - [`protocol`]: Packet header, message kinds, payload keys, request construction
//! - [`transport`]: Length-prefixed codec and daemon socket connect
//! - [`correlator`]: Pending-reply set keyed by transaction tag
//! - [`client`]: Request client and device tunnel helper
//! - [`result`]: Daemon result code translation
//! - [`error`]: Error and `Result` types
//!
//! # Example
//!
//! ```no_run
//! use usbmux_rpc::{DEFAULT_PORT, connect_to_device, socket_path};
//!
//! # async fn example() -> Result<(), usbmux_rpc::Error> {
//! let tunnel = connect_to_device(&socket_path(), 3, DEFAULT_PORT).await?;
//! println!("Tunnel open, {} bytes already buffered", tunnel.buffered.len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod correlator;
pub mod error;
pub mod protocol;
pub mod result;
pub mod transport;

pub use client::{DeviceTunnel, MuxClient, connect_to_device};
pub use correlator::{Correlator, WaiterGuard};
pub use error::{Error, Result};
pub use protocol::{
    ClientIdentity, DEFAULT_PORT, HEADER_SIZE, LONG_TIMEOUT, MessageType, Packet, PacketHeader,
    SHORT_TIMEOUT, keys, next_tag,
};
pub use result::{DaemonResult, ResponseCode};
pub use transport::{CodecError, DEFAULT_SOCKET_PATH, UsbmuxCodec, connect, socket_path};
