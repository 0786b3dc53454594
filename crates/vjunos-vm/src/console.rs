use crate::VmError;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, Instant, timeout};
use tracing::debug;
use vjunos_core::{Pattern, find_first};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const READ_CHUNK: usize = 4096;

/// Result of waiting for console output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Index into the pattern list of the pattern that matched.
    pub matched: Option<usize>,
    /// Bytes consumed by this read, matched or not.
    pub data: Vec<u8>,
}

impl ReadOutcome {
    #[must_use]
    pub fn is_match(&self) -> bool {
        self.matched.is_some()
    }
}

/// A bidirectional text stream to an appliance console.
pub trait ConsoleChannel {
    fn write(&mut self, data: &[u8]) -> impl Future<Output = Result<(), VmError>> + Send;

    /// Block until one of `patterns` shows up or `timeout` elapses.
    ///
    /// On a match, bytes up to the end of the match are consumed and returned.
    /// On timeout, everything received so far is consumed and returned.
    fn read_matching(
        &mut self,
        patterns: &[Pattern],
        timeout: Duration,
    ) -> impl Future<Output = Result<ReadOutcome, VmError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), VmError>> + Send;
}

/// Opens console channels on demand.
pub trait ConsoleConnector {
    type Channel: ConsoleChannel + Send;

    fn open(&self) -> impl Future<Output = Result<Self::Channel, VmError>> + Send;
}

/// Connects to QEMU's telnet serial server.
#[derive(Debug, Clone)]
pub struct TelnetConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TelnetConnector {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ConsoleConnector for TelnetConnector {
    type Channel = TelnetConsole<TcpStream>;

    async fn open(&self) -> Result<Self::Channel, VmError> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| VmError::ConsoleUnavailable(format!("connect to {addr} timed out")))?
            .map_err(|e| VmError::ConsoleUnavailable(format!("connect to {addr}: {e}")))?;
        stream.set_nodelay(true).ok();
        debug!(%addr, "console connected");
        Ok(TelnetConsole::new(stream))
    }
}

/// Telnet client that refuses every option and exposes the plain data stream.
pub struct TelnetConsole<S> {
    stream: S,
    buffer: Vec<u8>,
    decoder: TelnetDecoder,
}

impl<S> TelnetConsole<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            decoder: TelnetDecoder::default(),
        }
    }

    async fn fill(&mut self, wait: Duration) -> Result<bool, VmError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = match timeout(wait, self.stream.read(&mut chunk)).await {
            Err(_) => return Ok(false),
            Ok(Ok(0)) => return Err(VmError::ConsoleClosed),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(VmError::Console(format!("read failed: {e}"))),
        };

        let (data, replies) = self.decoder.feed(&chunk[..n]);
        if !replies.is_empty() {
            self.stream
                .write_all(&replies)
                .await
                .map_err(|e| VmError::Console(format!("option negotiation failed: {e}")))?;
        }
        self.buffer.extend_from_slice(&data);
        Ok(true)
    }
}

impl<S> ConsoleChannel for TelnetConsole<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: &[u8]) -> Result<(), VmError> {
        let escaped = escape_iac(data);
        self.stream
            .write_all(&escaped)
            .await
            .map_err(|e| VmError::Console(format!("write failed: {e}")))?;
        self.stream
            .flush()
            .await
            .map_err(|e| VmError::Console(format!("flush failed: {e}")))
    }

    async fn read_matching(
        &mut self,
        patterns: &[Pattern],
        wait: Duration,
    ) -> Result<ReadOutcome, VmError> {
        let deadline = Instant::now() + wait;

        loop {
            if let Some((idx, range)) = find_first(patterns, &self.buffer) {
                let data = self.buffer.drain(..range.end).collect();
                return Ok(ReadOutcome {
                    matched: Some(idx),
                    data,
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.fill(remaining).await? {
                break;
            }
        }

        Ok(ReadOutcome {
            matched: None,
            data: std::mem::take(&mut self.buffer),
        })
    }

    async fn close(&mut self) -> Result<(), VmError> {
        self.buffer.clear();
        self.stream
            .shutdown()
            .await
            .map_err(|e| VmError::Console(format!("shutdown failed: {e}")))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    #[default]
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

/// Strips telnet commands out of the byte stream and answers option requests.
#[derive(Debug, Default)]
struct TelnetDecoder {
    state: DecodeState,
}

impl TelnetDecoder {
    /// Returns `(data, replies)` for one received chunk.
    fn feed(&mut self, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::with_capacity(input.len());
        let mut replies = Vec::new();

        for &byte in input {
            self.state = match (self.state, byte) {
                (DecodeState::Data, IAC) => DecodeState::Iac,
                (DecodeState::Data, 0) => DecodeState::Data,
                (DecodeState::Data, b) => {
                    data.push(b);
                    DecodeState::Data
                }
                (DecodeState::Iac, IAC) => {
                    data.push(IAC);
                    DecodeState::Data
                }
                (DecodeState::Iac, cmd @ (DO | DONT | WILL | WONT)) => DecodeState::Option(cmd),
                (DecodeState::Iac, SB) => DecodeState::Sub,
                (DecodeState::Iac, _) => DecodeState::Data,
                (DecodeState::Option(cmd), opt) => {
                    match cmd {
                        DO => replies.extend_from_slice(&[IAC, WONT, opt]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, opt]),
                        _ => {}
                    }
                    DecodeState::Data
                }
                (DecodeState::Sub, IAC) => DecodeState::SubIac,
                (DecodeState::Sub, _) => DecodeState::Sub,
                (DecodeState::SubIac, SE) => DecodeState::Data,
                (DecodeState::SubIac, _) => DecodeState::Sub,
            };
        }

        (data, replies)
    }
}

fn escape_iac(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        out.push(byte);
        if byte == IAC {
            out.push(IAC);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_decoder_refuses_options() {
        let mut decoder = TelnetDecoder::default();
        let (data, replies) = decoder.feed(&[IAC, DO, 1, b'o', b'k', IAC, WILL, 3]);
        assert_eq!(data, b"ok");
        assert_eq!(replies, vec![IAC, WONT, 1, IAC, DONT, 3]);
    }

    #[test]
    fn test_decoder_handles_split_sequences() {
        let mut decoder = TelnetDecoder::default();
        let (data, replies) = decoder.feed(&[b'a', IAC]);
        assert_eq!(data, b"a");
        assert!(replies.is_empty());
        let (data, replies) = decoder.feed(&[DO, 24, b'b']);
        assert_eq!(data, b"b");
        assert_eq!(replies, vec![IAC, WONT, 24]);
    }

    #[test]
    fn test_decoder_drops_subnegotiation_and_nul() {
        let mut decoder = TelnetDecoder::default();
        let (data, _) = decoder.feed(&[b'x', IAC, SB, 24, 1, IAC, SE, b'\r', 0, b'y', IAC, IAC]);
        assert_eq!(data, vec![b'x', b'\r', b'y', IAC]);
    }

    #[test]
    fn test_escape_iac() {
        assert_eq!(escape_iac(&[b'a', IAC]), vec![b'a', IAC, IAC]);
    }

    #[tokio::test]
    async fn test_read_matching_consumes_through_match() {
        let (client, mut server) = duplex(1024);
        let mut console = TelnetConsole::new(client);

        server
            .write_all(b"FreeBSD/amd64\r\nlogin: root@:~ # ")
            .await
            .unwrap();

        let out = console
            .read_matching(&[Pattern::literal("login:")], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.matched, Some(0));
        assert_eq!(out.data, b"FreeBSD/amd64\r\nlogin:");

        let out = console
            .read_matching(&[Pattern::literal("# ")], Duration::from_secs(1))
            .await
            .unwrap();
        assert!(out.is_match());
        assert_eq!(out.data, b" root@:~ # ");
    }

    #[tokio::test]
    async fn test_read_matching_timeout_returns_partial_output() {
        let (client, mut server) = duplex(1024);
        let mut console = TelnetConsole::new(client);

        server.write_all(b"Booting [kernel]...").await.unwrap();

        let out = console
            .read_matching(&[Pattern::literal("login:")], Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!out.is_match());
        assert_eq!(out.data, b"Booting [kernel]...");
    }

    #[tokio::test]
    async fn test_read_matching_answers_negotiation() {
        let (client, mut server) = duplex(1024);
        let mut console = TelnetConsole::new(client);

        server.write_all(&[IAC, DO, 31, b'>']).await.unwrap();
        let out = console
            .read_matching(&[Pattern::literal(">")], Duration::from_secs(1))
            .await
            .unwrap();
        assert!(out.is_match());

        let mut reply = [0u8; 3];
        server.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [IAC, WONT, 31]);
    }

    #[tokio::test]
    async fn test_read_matching_reports_eof() {
        let (client, server) = duplex(64);
        let mut console = TelnetConsole::new(client);
        drop(server);

        let err = console
            .read_matching(&[Pattern::literal("login:")], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::ConsoleClosed));
    }

    #[tokio::test]
    async fn test_write_sends_bytes() {
        let (client, mut server) = duplex(64);
        let mut console = TelnetConsole::new(client);

        console.write(b"cli\r").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"cli\r");
    }
}
