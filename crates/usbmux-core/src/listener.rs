//! The listener: sole reader of a daemon connection.
//!
//! One spawned task reads packets off the socket and routes them: replies
//! into the correlator, attach/detach and device-list traffic into the
//! registry. Callers share the write half through [`MuxClient`] and block
//! only on their own reply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use plist::{Dictionary, Value};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use usbmux_rpc::{Correlator, MessageType, MuxClient, Packet, ResponseCode, UsbmuxCodec, keys};
use usbmux_types::{DeviceEntry, DeviceEvent, DeviceId};

use crate::config::{ListenerConfig, RetryPolicy};
use crate::dispatch::{Inbound, device_list};
use crate::error::{ListenerError, Result};
use crate::events::EventSink;
use crate::registry::{DeviceRegistry, Roster};

/// Lifecycle of a listener connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerState {
    /// Not connected yet.
    #[default]
    Idle,
    /// Connected and reading; the `Listen` handshake has not succeeded yet.
    Starting,
    /// Subscribed to attach/detach events.
    Active,
    /// Closed. Terminal.
    Stopped,
}

struct Shared {
    correlator: Arc<Correlator>,
    registry: DeviceRegistry,
    sink: Box<dyn EventSink>,
    state: watch::Sender<ListenerState>,
    stopped: AtomicBool,
}

impl Shared {
    fn set_state(&self, next: ListenerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Listener state {:?} -> {:?}", previous, next);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn dispatch(&self, packet: Packet) {
        if self.is_stopped() {
            trace!("Listener stopped; dropping packet tag {}", packet.tag());
            return;
        }

        let tag = packet.tag();
        let Some(payload) = packet.payload.as_ref() else {
            warn!(
                "Dropping packet tag {} ({} bytes) without a valid payload",
                tag, packet.header.length
            );
            return;
        };

        let route = Inbound::classify(payload);
        trace!("Packet tag {} routed as {:?}", tag, route);

        match &route {
            Inbound::Result => {
                let code = ResponseCode::from_payload(payload);
                if code.is_ok() {
                    debug!("Daemon returned {} for tag {}", code, tag);
                } else {
                    warn!("Daemon returned error {} for tag {}", code, tag);
                }
            }
            Inbound::Attached => self.registry.attach(payload, self.sink.as_ref()),
            Inbound::Detached => self.registry.detach(payload, self.sink.as_ref()),
            Inbound::Ignored(kind) => debug!("Ignoring {:?} message tag {}", kind, tag),
            Inbound::Logs => debug!("Daemon log reply for tag {}", tag),
            Inbound::DeviceList => match device_list(payload) {
                Some(list) => self.registry.apply_device_list(list, self.sink.as_ref()),
                None => warn!("DeviceList for tag {} is not an array", tag),
            },
            Inbound::ListenerList => debug!("Listener list reply for tag {}", tag),
            Inbound::Unknown => info!("Unknown message from daemon: {:?}", payload),
        }

        if route.is_correlatable() {
            self.correlator.deliver(packet);
        }
    }

    /// Idempotent transition to `Stopped`.
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.correlator.close();
        self.set_state(ListenerState::Stopped);
        self.sink.publish(DeviceEvent::ListenerStopped);
        info!("Listener stopped");
    }
}

/// A connection subscribed to daemon device events.
pub struct Listener {
    shared: Arc<Shared>,
    client: MuxClient,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Listener {
    /// An idle listener with no daemon connection yet.
    #[must_use]
    pub fn new(sink: impl EventSink) -> Self {
        let correlator = Arc::new(Correlator::new());
        let (state, _) = watch::channel(ListenerState::Idle);

        Self {
            shared: Arc::new(Shared {
                correlator: correlator.clone(),
                registry: DeviceRegistry::new(),
                sink: Box::new(sink),
                state,
                stopped: AtomicBool::new(false),
            }),
            client: MuxClient::unconnected(correlator),
            cancel: CancellationToken::new(),
            reader: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Connect to the daemon, start reading and complete the `Listen`
    /// handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be reached or the daemon never
    /// accepts the `Listen` request within the retry policy.
    pub async fn start(config: &ListenerConfig, sink: impl EventSink) -> Result<Self> {
        let listener = Self::new(sink);
        listener.connect(config).await?;
        Ok(listener)
    }

    /// Take an idle listener through connect and the `Listen` handshake. A
    /// failed connect leaves it `Idle` so the caller may retry; a failed
    /// handshake closes it.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` or `Closed` unless the listener is idle,
    /// otherwise the same errors as [`start`](Self::start).
    pub async fn connect(&self, config: &ListenerConfig) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(match self.state() {
                ListenerState::Stopped => ListenerError::Closed,
                state => ListenerError::AlreadyStarted(state),
            });
        }
        if self.shared.is_stopped() {
            return Err(ListenerError::Closed);
        }

        let stream = match usbmux_rpc::connect(&config.socket_path).await {
            Ok(stream) => stream,
            Err(e) => {
                self.started.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        if self.shared.is_stopped() {
            return Err(ListenerError::Closed);
        }

        let (read_half, write_half) = stream.into_split();
        self.client.attach(write_half).await;
        self.spawn_reader(read_half);

        if let Err(e) = self.listen(&config.listen_retry).await {
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    /// Take over a connected stream and start the reader task. Must be called
    /// from within a tokio runtime.
    #[must_use]
    pub fn from_stream(stream: UnixStream, sink: impl EventSink) -> Self {
        let (read_half, write_half) = stream.into_split();
        let mut listener = Self::new(sink);
        listener.client = MuxClient::new(write_half, listener.shared.correlator.clone());
        *listener.started.get_mut() = true;
        listener.spawn_reader(read_half);
        listener
    }

    fn spawn_reader(&self, read_half: OwnedReadHalf) {
        self.shared.set_state(ListenerState::Starting);
        let frames = FramedRead::new(read_half, UsbmuxCodec::new());
        let reader = tokio::spawn(read_loop(frames, self.shared.clone(), self.cancel.clone()));
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(reader);
    }

    /// Check the listener can carry a request.
    fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            ListenerState::Idle => Err(ListenerError::NotConnected),
            ListenerState::Stopped => Err(ListenerError::Closed),
            ListenerState::Starting | ListenerState::Active => Ok(()),
        }
    }

    /// Stop the listener when `err` leaves the connection unusable.
    fn fail(&self, err: usbmux_rpc::Error) -> ListenerError {
        if err.is_fatal() && !self.shared.is_stopped() {
            error!("Daemon connection failed: {}", err);
            self.cancel.cancel();
            self.shared.stop();
        }
        err.into()
    }

    /// Send `Listen` until the daemon answers with code 0, at most
    /// `policy.max_attempts` times, `policy.delay` apart.
    ///
    /// # Errors
    ///
    /// Returns `ListenRejected` when attempts run out, `Cancelled` if the
    /// listener is closed meanwhile, or the transport error that ended the
    /// connection.
    pub async fn listen(&self, policy: &RetryPolicy) -> Result<()> {
        if self.state() == ListenerState::Active {
            return Ok(());
        }
        self.ensure_connected()?;

        let attempts = policy.max_attempts.max(1);
        let mut last = None;

        for attempt in 1..=attempts {
            let reply = tokio::select! {
                () = self.cancel.cancelled() => return Err(ListenerError::Cancelled),
                reply = self.client.send_and_wait(Packet::listen()) => reply,
            };

            match reply {
                Ok(reply) => match reply.payload.as_ref().map(ResponseCode::from_payload) {
                    Some(code) if code.is_ok() => {
                        self.shared.set_state(ListenerState::Active);
                        info!("Listening for device events");
                        return Ok(());
                    }
                    Some(code) => {
                        warn!("Listen attempt {}/{} rejected: {}", attempt, attempts, code);
                        last = Some(code);
                    }
                    None => warn!("Listen attempt {}/{} got an empty reply", attempt, attempts),
                },
                Err(usbmux_rpc::Error::Timeout) => {
                    warn!("Listen attempt {}/{} timed out", attempt, attempts);
                }
                Err(e) => return Err(self.fail(e)),
            }

            if attempt < attempts {
                tokio::select! {
                    () = self.cancel.cancelled() => return Err(ListenerError::Cancelled),
                    () = tokio::time::sleep(policy.delay) => {}
                }
            }
        }

        Err(ListenerError::ListenRejected { attempts, last })
    }

    /// Send a request on this connection and wait for its reply. A write or
    /// read failure that breaks the connection stops the listener.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` before the listener is connected, `Closed`
    /// after it stopped, otherwise any correlation or transport error.
    pub async fn send_and_wait(&self, packet: Packet) -> Result<Packet> {
        self.ensure_connected()?;
        self.client
            .send_and_wait(packet)
            .await
            .map_err(|e| self.fail(e))
    }

    async fn request_key(&self, kind: MessageType, key: &'static str) -> Result<Dictionary> {
        let reply = self.send_and_wait(Packet::request(kind, None)).await?;
        let payload = reply
            .payload
            .ok_or(ListenerError::Rpc(usbmux_rpc::Error::MissingPayload))?;
        if payload.contains_key(key) {
            return Ok(payload);
        }
        let code = ResponseCode::from_payload(&payload);
        if code.is_ok() {
            Err(ListenerError::UnexpectedReply(key))
        } else {
            Err(ListenerError::Rejected(code))
        }
    }

    /// Ask the daemon for its full device list and return the devices it
    /// reported, in its order. Entries not yet in the roster are attached to it
    /// before this returns; entries without a usable `DeviceID` are left out.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the reply has no `DeviceList`.
    pub async fn list_devices(&self) -> Result<Vec<DeviceEntry>> {
        let payload = self
            .request_key(MessageType::ListDevices, keys::DEVICE_LIST)
            .await?;
        let listed =
            device_list(&payload).ok_or(ListenerError::UnexpectedReply(keys::DEVICE_LIST))?;
        Ok(listed
            .iter()
            .filter_map(Value::as_dictionary)
            .filter_map(DeviceEntry::from_properties)
            .collect())
    }

    /// Ask the daemon which clients are listening.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the reply has no `ListenerList`.
    pub async fn list_listeners(&self) -> Result<Vec<Value>> {
        let mut payload = self
            .request_key(MessageType::ListListeners, keys::LISTENER_LIST)
            .await?;
        match payload.remove(keys::LISTENER_LIST) {
            Some(Value::Array(listeners)) => Ok(listeners),
            _ => Err(ListenerError::UnexpectedReply(keys::LISTENER_LIST)),
        }
    }

    /// Read the host's system BUID.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the reply has no `BUID`.
    pub async fn read_buid(&self) -> Result<String> {
        let payload = self.request_key(MessageType::ReadBuid, keys::BUID).await?;
        payload
            .get(keys::BUID)
            .and_then(Value::as_string)
            .map(str::to_string)
            .ok_or(ListenerError::UnexpectedReply(keys::BUID))
    }

    /// Current roster snapshot.
    #[must_use]
    pub fn devices(&self) -> Roster {
        self.shared.registry.snapshot()
    }

    #[must_use]
    pub fn device(&self, id: DeviceId) -> Option<DeviceEntry> {
        self.shared.registry.get(id)
    }

    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.shared.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.shared.state.subscribe()
    }

    /// Replies received that no caller has claimed.
    #[must_use]
    pub fn unclaimed_replies(&self) -> usize {
        self.shared.correlator.pending_len()
    }

    /// Stop the reader, close the socket and release waiting callers.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.client.shutdown().await;

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                error!("Listener reader task failed: {}", e);
            }
        }

        self.shared.stop();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
        // Never connected: nothing to report
        if self.state() != ListenerState::Idle {
            self.shared.stop();
        }
    }
}

async fn read_loop(
    mut frames: FramedRead<OwnedReadHalf, UsbmuxCodec>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => None,
            next = frames.next() => Some(next),
        };
        let Some(next) = next else {
            debug!("Listener reader cancelled");
            break;
        };

        match next {
            Some(Ok(packet)) => shared.dispatch(packet),
            Some(Err(e)) => {
                error!(
                    "Daemon connection lost framing: {}",
                    usbmux_rpc::Error::from_receive(e)
                );
                break;
            }
            None => {
                info!("Daemon closed the connection");
                break;
            }
        }
    }

    shared.stop();
}
