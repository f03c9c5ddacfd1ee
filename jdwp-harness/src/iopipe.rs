// Line-oriented signal channel between debugger and debuggee
//
// A TCP connection of its own, independent of the packet transport, carrying
// `\n`-terminated text lines. Test choreography runs over it: the debuggee
// says `ready`, the debugger answers `go` or `quit`, and tests may add their
// own commands.

use crate::protocol::{HarnessError, HarnessResult};
use bytes::BytesMut;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::{debug, info};

pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// A line on the pipe, with the canonical choreography words singled out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Debuggee has initialized and is listening
    Ready,
    /// Debuggee may proceed past a checkpoint
    Go,
    /// Debuggee should terminate cleanly
    Quit,
    Custom(String),
}

impl Signal {
    pub fn as_str(&self) -> &str {
        match self {
            Signal::Ready => "ready",
            Signal::Go => "go",
            Signal::Quit => "quit",
            Signal::Custom(s) => s,
        }
    }
}

impl FromStr for Signal {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ready" => Signal::Ready,
            "go" => Signal::Go,
            "quit" => Signal::Quit,
            other => Signal::Custom(other.to_string()),
        })
    }
}

impl From<&str> for Signal {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(signal) => signal,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn line_error(e: LinesCodecError) -> HarnessError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            HarnessError::Protocol("Pipe line exceeds maximum length".to_string())
        }
        LinesCodecError::Io(e) => HarnessError::Io(e),
    }
}

struct LineReader {
    stream: OwnedReadHalf,
    buffer: BytesMut,
    codec: LinesCodec,
    eof: bool,
}

/// One end of the signal channel.
pub struct IoPipe {
    reader: Mutex<LineReader>,
    writer: Mutex<OwnedWriteHalf>,
    max_line_length: usize,
    peer: String,
}

impl fmt::Debug for IoPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoPipe").field("peer", &self.peer).finish()
    }
}

impl IoPipe {
    /// Connect to the debugger's pipe listener (debuggee side).
    pub async fn connect<A: ToSocketAddrs + fmt::Display>(
        addr: A,
        timeout: Duration,
    ) -> HarnessResult<Self> {
        let peer = addr.to_string();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| HarnessError::timeout(format!("pipe connection to {}", peer), timeout))??;
        Ok(Self::from_stream(stream, DEFAULT_MAX_LINE_LENGTH))
    }

    pub fn from_stream(stream: TcpStream, max_line_length: usize) -> Self {
        stream.set_nodelay(true).ok();
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read, write) = stream.into_split();
        Self {
            reader: Mutex::new(LineReader {
                stream: read,
                buffer: BytesMut::with_capacity(256),
                codec: LinesCodec::new_with_max_length(max_line_length),
                eof: false,
            }),
            writer: Mutex::new(write),
            max_line_length,
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write one line. The line itself must not contain a newline.
    pub async fn println(&self, line: &str) -> HarnessResult<()> {
        if line.contains('\n') {
            return Err(HarnessError::Protocol(format!(
                "Pipe line contains a newline: {:?}",
                line
            )));
        }

        let mut buf = BytesMut::with_capacity(line.len() + 1);
        LinesCodec::new_with_max_length(self.max_line_length)
            .encode(line, &mut buf)
            .map_err(line_error)?;

        debug!("pipe > {}", line);
        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn send(&self, signal: &Signal) -> HarnessResult<()> {
        self.println(signal.as_str()).await
    }

    /// Read the next line, waiting as long as it takes. `None` once the peer
    /// has closed the channel; a trailing unterminated line is returned first.
    pub async fn readln(&self) -> HarnessResult<Option<String>> {
        let mut reader = self.reader.lock().await;
        let LineReader {
            stream,
            buffer,
            codec,
            eof,
        } = &mut *reader;

        loop {
            if let Some(line) = codec.decode(buffer).map_err(line_error)? {
                debug!("pipe < {}", line);
                return Ok(Some(line));
            }
            if *eof {
                return codec.decode_eof(buffer).map_err(line_error);
            }

            // Cancel safe: bytes already read stay in `buffer`
            if stream.read_buf(buffer).await? == 0 {
                debug!("Pipe to {} closed by peer", self.peer);
                *eof = true;
            }
        }
    }

    /// `readln` bounded by `timeout`; a partial line survives the timeout.
    pub async fn readln_timeout(&self, timeout: Duration) -> HarnessResult<Option<String>> {
        tokio::time::timeout(timeout, self.readln())
            .await
            .map_err(|_| HarnessError::timeout("pipe line", timeout))?
    }

    /// Read the next line as a signal; a closed channel is `Disconnected`.
    pub async fn read_signal(&self, timeout: Duration) -> HarnessResult<Signal> {
        match self.readln_timeout(timeout).await? {
            Some(line) => Ok(Signal::from(line.as_str())),
            None => Err(HarnessError::Disconnected),
        }
    }

    /// Wait for a specific signal; any other line fails the handshake.
    pub async fn expect(&self, expected: &Signal, timeout: Duration) -> HarnessResult<()> {
        let got = self.read_signal(timeout).await?;
        if &got != expected {
            return Err(HarnessError::UnexpectedSignal {
                expected: expected.to_string(),
                got: got.to_string(),
            });
        }
        info!("Pipe signal '{}' received", got);
        Ok(())
    }

    /// Shut down the write side; the peer's `readln` sees end of stream.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.ok();
    }
}

/// Debugger side: waits for the debuggee to connect its pipe.
#[derive(Debug)]
pub struct IoPipeListener {
    listener: TcpListener,
    max_line_length: usize,
}

impl IoPipeListener {
    /// Bind on `host:port`; port 0 picks an ephemeral port.
    pub async fn bind(host: &str, port: u16) -> HarnessResult<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        info!("Pipe listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        })
    }

    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    pub fn local_addr(&self) -> HarnessResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self, timeout: Duration) -> HarnessResult<IoPipe> {
        let (stream, peer) = tokio::time::timeout(timeout, self.listener.accept())
            .await
            .map_err(|_| HarnessError::timeout("debuggee pipe connection", timeout))??;
        info!("Pipe connected from {}", peer);
        Ok(IoPipe::from_stream(stream, self.max_line_length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pipe_pair() -> (IoPipe, IoPipe) {
        let listener = IoPipeListener::bind("127.0.0.1", 0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let timeout = Duration::from_secs(5);
        let (debugger, debuggee) = tokio::join!(
            listener.accept(timeout),
            IoPipe::connect(addr, timeout)
        );
        (debugger.unwrap(), debuggee.unwrap())
    }

    #[test]
    fn test_signal_vocabulary() {
        assert_eq!(Signal::from("ready"), Signal::Ready);
        assert_eq!(Signal::from("go"), Signal::Go);
        assert_eq!(Signal::from("quit"), Signal::Quit);
        assert_eq!(
            Signal::from("checkpoint 3"),
            Signal::Custom("checkpoint 3".to_string())
        );
        assert_eq!(Signal::Quit.to_string(), "quit");
    }

    #[tokio::test]
    async fn test_ready_handshake() {
        let (debugger, debuggee) = pipe_pair().await;

        debuggee.send(&Signal::Ready).await.unwrap();
        debugger
            .expect(&Signal::Ready, Duration::from_secs(5))
            .await
            .unwrap();

        debugger.send(&Signal::Go).await.unwrap();
        assert_eq!(
            debuggee.read_signal(Duration::from_secs(5)).await.unwrap(),
            Signal::Go
        );
    }

    #[tokio::test]
    async fn test_unexpected_signal() {
        let (debugger, debuggee) = pipe_pair().await;
        debuggee.println("error: init failed").await.unwrap();

        let err = debugger
            .expect(&Signal::Ready, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::UnexpectedSignal { .. }));
    }

    #[tokio::test]
    async fn test_partial_line_survives_timeout() {
        let (debugger, debuggee) = pipe_pair().await;

        {
            let mut writer = debuggee.writer.lock().await;
            writer.write_all(b"hel").await.unwrap();
            writer.flush().await.unwrap();
        }
        assert!(matches!(
            debugger.readln_timeout(Duration::from_millis(50)).await,
            Err(HarnessError::Timeout { .. })
        ));

        {
            let mut writer = debuggee.writer.lock().await;
            writer.write_all(b"lo\nworld\n").await.unwrap();
        }
        let timeout = Duration::from_secs(5);
        assert_eq!(debugger.readln_timeout(timeout).await.unwrap().as_deref(), Some("hello"));
        assert_eq!(debugger.readln_timeout(timeout).await.unwrap().as_deref(), Some("world"));
    }

    #[tokio::test]
    async fn test_readln_returns_none_after_close() {
        let (debugger, debuggee) = pipe_pair().await;
        debuggee.println("last").await.unwrap();
        debuggee.close().await;

        assert_eq!(debugger.readln().await.unwrap().as_deref(), Some("last"));
        assert_eq!(debugger.readln().await.unwrap(), None);
        assert!(matches!(
            debugger.read_signal(Duration::from_secs(1)).await,
            Err(HarnessError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_println_rejects_embedded_newline() {
        let (_debugger, debuggee) = pipe_pair().await;
        assert!(debuggee.println("two\nlines").await.is_err());
    }

    #[tokio::test]
    async fn test_pipe_independent_of_reader_blocking() {
        let (debugger, debuggee) = pipe_pair().await;

        // A blocked reader on one side does not stop writes from the other
        let blocked = tokio::spawn(async move {
            let line = debuggee.readln().await.unwrap();
            (debuggee, line)
        });
        debugger.println("go").await.unwrap();
        let (_debuggee, line) = blocked.await.unwrap();
        assert_eq!(line.as_deref(), Some("go"));
    }
}
