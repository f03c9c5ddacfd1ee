// Packet transport
//
// Owns one byte stream (TCP socket or in-memory pipe) and moves whole packets
// across it. Ordering and delivery come from the stream; this layer only adds
// framing, the connect handshake, and close/disconnect semantics.

use crate::codec::{encode_into, PacketCodec};
use crate::protocol::*;
use bytes::BytesMut;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

struct ReadHalf {
    stream: BoxedReader,
    buffer: BytesMut,
    codec: PacketCodec,
}

struct Inner {
    reader: Mutex<ReadHalf>,
    writer: Mutex<BoxedWriter>,
    closed: CancellationToken,
    disconnected: AtomicBool,
    peer: String,
}

/// Reliable, ordered packet channel between debugger and debuggee.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transport {
    /// Connect to a listening debuggee and perform the handshake
    pub async fn connect<A: ToSocketAddrs + std::fmt::Display>(
        addr: A,
        handshake_timeout: Duration,
        max_packet_size: usize,
    ) -> HarnessResult<Self> {
        info!("Connecting transport to {}", addr);
        let peer = addr.to_string();

        let mut stream = tokio::time::timeout(handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| HarnessError::timeout(format!("connection to {}", peer), handshake_timeout))??;
        stream.set_nodelay(true).ok();

        tokio::time::timeout(handshake_timeout, Self::handshake(&mut stream))
            .await
            .map_err(|_| HarnessError::timeout("transport handshake", handshake_timeout))??;

        Ok(Self::from_stream(stream, peer, max_packet_size))
    }

    /// Accept one debugger connection (debuggee side) and answer its handshake
    pub async fn accept(
        listener: &TcpListener,
        handshake_timeout: Duration,
        max_packet_size: usize,
    ) -> HarnessResult<Self> {
        let (mut stream, peer) = tokio::time::timeout(handshake_timeout, listener.accept())
            .await
            .map_err(|_| HarnessError::timeout("debugger connection", handshake_timeout))??;
        stream.set_nodelay(true).ok();

        tokio::time::timeout(handshake_timeout, async {
            let mut buf = [0u8; JDWP_HANDSHAKE.len()];
            stream.read_exact(&mut buf).await?;
            if buf != JDWP_HANDSHAKE {
                warn!("Invalid handshake request: {:?}", buf);
                return Err(HarnessError::InvalidHandshake);
            }
            stream.write_all(JDWP_HANDSHAKE).await?;
            stream.flush().await?;
            Ok::<(), HarnessError>(())
        })
        .await
        .map_err(|_| HarnessError::timeout("transport handshake", handshake_timeout))??;

        info!("Accepted transport connection from {}", peer);
        Ok(Self::from_stream(stream, peer.to_string(), max_packet_size))
    }

    /// Perform the handshake (debugger side)
    async fn handshake(stream: &mut TcpStream) -> HarnessResult<()> {
        debug!("Performing handshake");

        stream.write_all(JDWP_HANDSHAKE).await?;
        stream.flush().await?;

        let mut buf = vec![0u8; JDWP_HANDSHAKE.len()];
        stream.read_exact(&mut buf).await?;

        if buf != JDWP_HANDSHAKE {
            warn!("Invalid handshake response: {:?}", buf);
            return Err(HarnessError::InvalidHandshake);
        }

        info!("Handshake successful");
        Ok(())
    }

    /// Adopt an already-connected stream; no handshake is performed.
    pub fn from_stream<S>(stream: S, peer: impl Into<String>, max_packet_size: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            inner: Arc::new(Inner {
                reader: Mutex::new(ReadHalf {
                    stream: Box::pin(reader),
                    buffer: BytesMut::with_capacity(4096),
                    codec: PacketCodec::new(max_packet_size),
                }),
                writer: Mutex::new(Box::pin(writer)),
                closed: CancellationToken::new(),
                disconnected: AtomicBool::new(false),
                peer: peer.into(),
            }),
        }
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    fn check_open(&self) -> HarnessResult<()> {
        if self.is_closed() {
            Err(HarnessError::Closed)
        } else if self.inner.disconnected.load(Ordering::Acquire) {
            Err(HarnessError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn mark_disconnected(&self, err: std::io::Error) -> HarnessError {
        use std::io::ErrorKind::*;
        match err.kind() {
            UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected => {
                self.inner.disconnected.store(true, Ordering::Release);
                HarnessError::Disconnected
            }
            _ => HarnessError::Io(err),
        }
    }

    /// Send one packet
    pub async fn send(&self, packet: &Packet) -> HarnessResult<()> {
        self.check_open()?;

        let mut buf = BytesMut::with_capacity(packet.length());
        encode_into(packet, &mut buf);

        let mut writer = self.inner.writer.lock().await;
        let write = async {
            writer.write_all(&buf).await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        };

        tokio::select! {
            _ = self.inner.closed.cancelled() => Err(HarnessError::Closed),
            res = write => res.map_err(|e| self.mark_disconnected(e)),
        }
    }

    /// Receive the next packet, waiting as long as it takes
    pub async fn receive(&self) -> HarnessResult<Packet> {
        self.check_open()?;

        let mut reader = self.inner.reader.lock().await;
        let ReadHalf {
            stream,
            buffer,
            codec,
        } = &mut *reader;

        loop {
            if let Some(packet) = codec.decode(buffer)? {
                debug!("Received packet id={} len={}", packet.id(), packet.length());
                return Ok(packet);
            }

            let read = tokio::select! {
                _ = self.inner.closed.cancelled() => return Err(HarnessError::Closed),
                res = stream.read_buf(buffer) => res,
            };

            match read {
                Ok(0) => {
                    if !buffer.is_empty() {
                        warn!(
                            "Connection to {} ended inside a packet ({} bytes buffered)",
                            self.inner.peer,
                            buffer.len()
                        );
                    }
                    self.inner.disconnected.store(true, Ordering::Release);
                    return Err(HarnessError::Disconnected);
                }
                Ok(_) => {}
                Err(e) => return Err(self.mark_disconnected(e)),
            }
        }
    }

    /// Close the transport; pending and future calls fail with `Closed`
    pub async fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();
        info!("Transport to {} closed", self.inner.peer);

        // Shut the write side down so the peer observes EOF
        let mut writer = self.inner.writer.lock().await;
        writer.shutdown().await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;

    fn pair() -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(1024);
        (
            Transport::from_stream(a, "debugger", MAX_PACKET_SIZE),
            Transport::from_stream(b, "debuggee", MAX_PACKET_SIZE),
        )
    }

    #[tokio::test]
    async fn test_packets_arrive_in_order() {
        let (debugger, debuggee) = pair();

        for id in 1..=5 {
            debugger
                .send(&CommandPacket::new(id, 1, 1).with_data(vec![id as u8; 100]).into())
                .await
                .unwrap();
        }

        for id in 1..=5 {
            let packet = debuggee.receive().await.unwrap();
            assert_eq!(packet.id(), id);
        }
    }

    #[tokio::test]
    async fn test_receive_reassembles_partial_writes() {
        let (raw, remote) = tokio::io::duplex(64);
        let transport = Transport::from_stream(remote, "peer", MAX_PACKET_SIZE);
        let packet: Packet = ReplyPacket::new(3, 0, vec![5; 40]).into();
        let wire = encode(&packet);

        let writer = tokio::spawn(async move {
            let mut raw = raw;
            for chunk in wire.chunks(7) {
                raw.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            raw
        });

        assert_eq!(transport.receive().await.unwrap(), packet);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_peer_drop_is_disconnected() {
        let (debugger, debuggee) = pair();
        drop(debuggee);

        assert!(matches!(
            debugger.receive().await,
            Err(HarnessError::Disconnected)
        ));
        // Later calls fail fast
        assert!(matches!(
            debugger.send(&CommandPacket::new(1, 1, 1).into()).await,
            Err(HarnessError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_receiver() {
        let (debugger, _debuggee) = pair();

        let receiver = {
            let debugger = debugger.clone();
            tokio::spawn(async move { debugger.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        debugger.close().await;

        assert!(matches!(
            receiver.await.unwrap(),
            Err(HarnessError::Closed)
        ));
        assert!(matches!(
            debugger.send(&CommandPacket::new(1, 1, 1).into()).await,
            Err(HarnessError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_malformed_header_is_reported() {
        let (raw, remote) = tokio::io::duplex(64);
        let transport = Transport::from_stream(remote, "peer", MAX_PACKET_SIZE);
        let mut raw = raw;
        raw.write_all(&[0, 0, 0, 2, 0, 0, 0, 1, 0, 1, 1]).await.unwrap();

        assert!(matches!(
            transport.receive().await,
            Err(HarnessError::MalformedHeader(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let timeout = Duration::from_secs(5);

        let server = tokio::spawn(async move {
            let transport = Transport::accept(&listener, timeout, MAX_PACKET_SIZE)
                .await
                .unwrap();
            transport.receive().await.unwrap()
        });

        let client = Transport::connect(addr, timeout, MAX_PACKET_SIZE)
            .await
            .unwrap();
        client.send(&CommandPacket::new(77, 1, 7).into()).await.unwrap();

        assert_eq!(server.await.unwrap().id(), 77);
    }
}
