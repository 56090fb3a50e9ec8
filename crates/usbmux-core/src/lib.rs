//! Listener, device registry and event delivery for the usbmux client.
//!
//! A [`Listener`] owns one daemon connection. It subscribes to attach and
//! detach traffic, keeps the [`DeviceRegistry`] roster current and reports
//! every change through an [`EventSink`].
//!
//! ```no_run
//! use usbmux_core::{Listener, ListenerConfig};
//! use usbmux_types::DeviceEvent;
//!
//! # async fn example() -> usbmux_core::Result<()> {
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<DeviceEvent>();
//! let listener = Listener::start(&ListenerConfig::default(), tx).await?;
//! while let Some(event) = rx.recv().await {
//!     println!("{} ({} devices)", event.name(), listener.devices().len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod listener;
pub mod registry;

pub use config::{ListenerConfig, RetryPolicy};
pub use dispatch::Inbound;
pub use error::{ListenerError, Result};
pub use events::{EventSink, RecordingSink};
pub use listener::{Listener, ListenerState};
pub use registry::{DeviceRegistry, Roster};
