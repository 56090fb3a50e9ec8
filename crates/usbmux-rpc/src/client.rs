//! Request client for the usbmux daemon.
//!
//! [`MuxClient`] owns the write half of a daemon connection and gives callers
//! synchronous request/reply semantics on top of whatever task reads the other
//! half and feeds replies into the shared [`Correlator`].

use std::path::Path;
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, FramedWrite};
use tracing::{debug, warn};
use usbmux_types::DeviceId;

use crate::correlator::Correlator;
use crate::error::Error;
use crate::protocol::Packet;
use crate::result::ResponseCode;
use crate::transport::{self, UsbmuxCodec};

type PacketSink = FramedWrite<OwnedWriteHalf, UsbmuxCodec>;

/// Request side of a daemon connection
pub struct MuxClient {
    sink: Mutex<Option<PacketSink>>,
    correlator: Arc<Correlator>,
}

impl MuxClient {
    #[must_use]
    pub fn new(writer: OwnedWriteHalf, correlator: Arc<Correlator>) -> Self {
        Self {
            sink: Mutex::new(Some(FramedWrite::new(writer, UsbmuxCodec::new()))),
            correlator,
        }
    }

    /// A client with no write half yet; sends fail with `Error::Disconnected`
    /// until [`attach`](Self::attach) is called.
    #[must_use]
    pub fn unconnected(correlator: Arc<Correlator>) -> Self {
        Self {
            sink: Mutex::new(None),
            correlator,
        }
    }

    /// Install the write half of a freshly connected socket.
    pub async fn attach(&self, writer: OwnedWriteHalf) {
        *self.sink.lock().await = Some(FramedWrite::new(writer, UsbmuxCodec::new()));
    }

    #[must_use]
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Write one packet. Header and payload of concurrent sends never interleave.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShortWrite` if the socket stopped accepting bytes
    /// mid-packet and `Error::Disconnected` if the client was shut down.
    pub async fn send(&self, packet: Packet) -> Result<(), Error> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(Error::Disconnected)?;
        sink.send(packet).await.map_err(Error::from_send)
    }

    /// Send a request and wait for the reply carrying the same tag, for at most
    /// `packet.timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if no reply arrived in time, or any send error.
    pub async fn send_and_wait(&self, packet: Packet) -> Result<Packet, Error> {
        let tag = packet.tag();
        let timeout = packet.timeout;
        let signal = self.correlator.register(tag)?;
        let _guard = self.correlator.guard(tag);

        self.send(packet).await?;

        debug!("Sent request tag {}, waiting up to {:?}", tag, timeout);
        self.correlator.wait(tag, signal, timeout).await
    }

    /// Drop the write half. Further sends fail with `Error::Disconnected`.
    pub async fn shutdown(&self) {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return;
        };
        if let Err(e) = sink.close().await {
            debug!("Error closing write half: {}", e);
        }
    }
}

/// A connection handed over to a device port after a successful `Connect`.
#[derive(Debug)]
pub struct DeviceTunnel {
    pub stream: UnixStream,
    /// Device bytes that arrived together with the daemon's reply.
    pub buffered: BytesMut,
}

/// Open a dedicated daemon connection and tunnel it to `port` on a device.
///
/// # Errors
///
/// Returns `Error::ConnectRefused` with the translated result code if the
/// daemon declines, `Error::Timeout` if it does not answer in time, or any
/// transport error.
pub async fn connect_to_device(
    socket: &Path,
    device_id: DeviceId,
    port: u16,
) -> Result<DeviceTunnel, Error> {
    let stream = transport::connect(socket).await?;
    let mut framed = Framed::new(stream, UsbmuxCodec::new());

    let request = Packet::connect(device_id, port);
    let timeout = request.timeout;
    framed.send(request).await.map_err(Error::from_send)?;

    let reply = tokio::time::timeout(timeout, framed.next())
        .await
        .map_err(|_| Error::Timeout)?
        .ok_or(Error::Disconnected)?
        .map_err(Error::from_receive)?;

    let payload = reply.payload.as_ref().ok_or(Error::MissingPayload)?;
    let code = ResponseCode::from_payload(payload);
    if !code.is_ok() {
        warn!("Connect to device {} port {} refused: {}", device_id, port, code);
        return Err(Error::ConnectRefused(code));
    }

    let parts = framed.into_parts();
    debug!("Tunnel open to device {} port {}", device_id, port);
    Ok(DeviceTunnel {
        stream: parts.io,
        buffered: parts.read_buf,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageType, keys};
    use plist::{Dictionary, Value};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;
    use tokio_util::codec::FramedRead;

    fn result_reply(tag: u32, number: u64) -> Packet {
        let mut payload = Dictionary::new();
        payload.insert(keys::MESSAGE_TYPE.to_string(), Value::from("Result"));
        payload.insert(keys::NUMBER.to_string(), Value::from(number));
        let mut packet = Packet::inbound(
            crate::protocol::PacketHeader {
                length: 0,
                version: crate::protocol::PLIST_VERSION,
                message: crate::protocol::PLIST_MESSAGE,
                tag,
            },
            Some(payload),
        );
        packet.refresh_length();
        packet
    }

    #[tokio::test]
    async fn test_send_and_wait_roundtrip() {
        let (local, remote) = UnixStream::pair().unwrap();
        let (read_half, write_half) = local.into_split();
        let correlator = Arc::new(Correlator::new());
        let client = MuxClient::new(write_half, correlator.clone());

        // Reader feeding the correlator
        let feeder = correlator.clone();
        tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, UsbmuxCodec::new());
            while let Some(Ok(packet)) = frames.next().await {
                feeder.deliver(packet);
            }
        });

        // Daemon echoing a zero result for every request
        tokio::spawn(async move {
            let mut daemon = Framed::new(remote, UsbmuxCodec::new());
            while let Some(Ok(request)) = daemon.next().await {
                daemon.send(result_reply(request.tag(), 0)).await.unwrap();
            }
        });

        let request = Packet::request(MessageType::ListListeners, None);
        let tag = request.tag();
        let reply = client.send_and_wait(request).await.unwrap();
        assert_eq!(reply.tag(), tag);
        assert!(ResponseCode::from_payload(reply.payload.as_ref().unwrap()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_wait_times_out() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let (_read_half, write_half) = local.into_split();
        let client = MuxClient::new(write_half, Arc::new(Correlator::new()));

        let started = tokio::time::Instant::now();
        let result = client
            .send_and_wait(Packet::request(MessageType::ListDevices, None))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_send_after_shutdown_is_disconnected() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let (_read_half, write_half) = local.into_split();
        let client = MuxClient::new(write_half, Arc::new(Correlator::new()));

        client.shutdown().await;
        let result = client
            .send(Packet::request(MessageType::ListDevices, None))
            .await;
        assert!(matches!(result, Err(Error::Disconnected)));
    }

    #[tokio::test]
    async fn test_unconnected_client_until_attached() {
        let (local, remote) = UnixStream::pair().unwrap();
        let (_read_half, write_half) = local.into_split();
        let client = MuxClient::unconnected(Arc::new(Correlator::new()));

        let result = client
            .send(Packet::request(MessageType::ListDevices, None))
            .await;
        assert!(matches!(result, Err(Error::Disconnected)));

        client.attach(write_half).await;
        let request = Packet::request(MessageType::ListDevices, None);
        let tag = request.tag();
        client.send(request).await.unwrap();

        let mut daemon = FramedRead::new(remote, UsbmuxCodec::new());
        assert_eq!(daemon.next().await.unwrap().unwrap().tag(), tag);
    }

    #[tokio::test]
    async fn test_failed_send_leaves_no_waiter() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let (_read_half, write_half) = local.into_split();
        let correlator = Arc::new(Correlator::new());
        let client = MuxClient::new(write_half, correlator.clone());
        client.shutdown().await;

        let result = client
            .send_and_wait(Packet::request(MessageType::ListDevices, None))
            .await;
        assert!(matches!(result, Err(Error::Disconnected)));
        assert_eq!(correlator.waiting_len(), 0);
    }

    async fn serve_one_connect(listener: UnixListener, number: u64) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut daemon = Framed::new(stream, UsbmuxCodec::new());
        let request = daemon.next().await.unwrap().unwrap();
        assert_eq!(request.message_type(), Some("Connect"));
        daemon.send(result_reply(request.tag(), number)).await.unwrap();
        let mut stream = daemon.into_inner();
        let mut echo = [0_u8; 4];
        if number == 0 && stream.read_exact(&mut echo).await.is_ok() {
            stream.write_all(&echo).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_connect_to_device_opens_tunnel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mux.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one_connect(listener, 0));

        let mut tunnel = connect_to_device(&path, 7, 62078).await.unwrap();
        tunnel.stream.write_all(b"ping").await.unwrap();
        let mut echo = [0_u8; 4];
        tunnel.stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_to_device_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mux.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one_connect(listener, 3));

        let result = connect_to_device(&path, 7, 62078).await;
        match result {
            Err(Error::ConnectRefused(code)) => {
                assert_eq!(code.code, 0x3d);
                assert_eq!(
                    code.description.as_deref(),
                    Some("Connection Refused by Device")
                );
            }
            other => panic!("Expected ConnectRefused, got {other:?}"),
        }
        server.await.unwrap();
    }
}
