//! Telnet handshake and IAC filtering.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::transport::{
    BoxedStream, Handshake, HandshakeError, ShellConnection, TerminalSize,
};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;
const OPT_NAWS: u8 = 31;

/// Server side of the opening negotiation.
const NEGOTIATION: [u8; 9] = [
    IAC, WILL, OPT_ECHO, IAC, WILL, OPT_SGA, IAC, DO, OPT_NAWS,
];

const LOGIN_PROMPT: &[u8] = b"login: ";
const MAX_SUBNEGOTIATION: usize = 64;
const PIPE_CAPACITY: usize = 4096;

// ============================================================================
// Parser
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelnetEvent {
    /// WILL/WONT/DO/DONT from the client.
    Negotiation { command: u8, option: u8 },
    /// NAWS subnegotiation.
    WindowSize(TerminalSize),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum State {
    #[default]
    Data,
    Iac,
    Negotiate(u8),
    Sub,
    SubIac,
}

/// Splits a telnet byte stream into application data and protocol events.
#[derive(Debug, Default)]
pub struct TelnetParser {
    state: State,
    sub: Vec<u8>,
}

impl TelnetParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; data bytes go to `data`, protocol events are returned.
    pub fn feed(&mut self, bytes: &[u8], data: &mut Vec<u8>) -> Vec<TelnetEvent> {
        let mut events = Vec::new();
        for &byte in bytes {
            self.state = match (self.state, byte) {
                (State::Data, IAC) => State::Iac,
                (State::Data, b) => {
                    data.push(b);
                    State::Data
                }
                (State::Iac, IAC) => {
                    data.push(IAC);
                    State::Data
                }
                (State::Iac, SB) => {
                    self.sub.clear();
                    State::Sub
                }
                (State::Iac, cmd @ (WILL | WONT | DO | DONT)) => State::Negotiate(cmd),
                // NOP, GA, AYT and friends carry no payload.
                (State::Iac, _) => State::Data,
                (State::Negotiate(command), option) => {
                    events.push(TelnetEvent::Negotiation { command, option });
                    State::Data
                }
                (State::Sub, IAC) => State::SubIac,
                (State::Sub, b) => {
                    if self.sub.len() < MAX_SUBNEGOTIATION {
                        self.sub.push(b);
                    }
                    State::Sub
                }
                (State::SubIac, SE) => {
                    events.extend(self.finish_subnegotiation());
                    State::Data
                }
                (State::SubIac, IAC) => {
                    if self.sub.len() < MAX_SUBNEGOTIATION {
                        self.sub.push(IAC);
                    }
                    State::Sub
                }
                (State::SubIac, _) => State::Data,
            };
        }
        events
    }

    fn finish_subnegotiation(&mut self) -> Option<TelnetEvent> {
        match self.sub.as_slice() {
            [OPT_NAWS, c0, c1, r0, r1, ..] => Some(TelnetEvent::WindowSize(TerminalSize {
                cols: u16::from_be_bytes([*c0, *c1]),
                rows: u16::from_be_bytes([*r0, *r1]),
            })),
            _ => None,
        }
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Telnet login: negotiate echo/SGA/NAWS, prompt for a username.
#[derive(Debug, Clone)]
pub struct TelnetHandshake {
    max_username: usize,
}

impl TelnetHandshake {
    pub fn new() -> Self {
        Self { max_username: 32 }
    }
}

impl Default for TelnetHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handshake for TelnetHandshake {
    async fn accept(
        &self,
        stream: BoxedStream,
        peer: SocketAddr,
    ) -> Result<ShellConnection, HandshakeError> {
        let (raw_read, mut raw_write) = tokio::io::split(stream);
        let (pipe_write, mut input) = tokio::io::duplex(PIPE_CAPACITY);
        let (resize_tx, mut resizes) = watch::channel(TerminalSize::default());
        let negotiated = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        tokio::spawn(pump(
            raw_read,
            pipe_write,
            resize_tx,
            negotiated.clone(),
            cancel.clone(),
        ));
        let guard = cancel.drop_guard();

        raw_write.write_all(&NEGOTIATION).await?;
        raw_write.write_all(LOGIN_PROMPT).await?;
        raw_write.flush().await?;

        let (username, pending_cr) =
            read_username(&mut input, &mut raw_write, &negotiated, self.max_username).await?;

        let size = *resizes.borrow_and_update();

        Ok(ShellConnection {
            username,
            peer,
            interactive: negotiated.load(Ordering::Acquire),
            size,
            input: Box::new(input),
            output: Box::new(raw_write),
            resizes,
            pending_cr,
            guard: Some(guard),
        })
    }
}

/// Move bytes from the socket into the session pipe, stripping telnet framing.
async fn pump<R>(
    mut raw: R,
    mut pipe: DuplexStream,
    resizes: watch::Sender<TerminalSize>,
    negotiated: Arc<AtomicBool>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut parser = TelnetParser::new();
    let mut buf = [0u8; 1024];
    let mut data = Vec::with_capacity(1024);

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = raw.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };

        data.clear();
        for event in parser.feed(&buf[..n], &mut data) {
            negotiated.store(true, Ordering::Release);
            if let TelnetEvent::WindowSize(size) = event {
                debug!(cols = size.cols, rows = size.rows, "window size reported");
                resizes.send_replace(size);
            }
        }

        if !data.is_empty() {
            let write = tokio::select! {
                _ = cancel.cancelled() => break,
                write = pipe.write_all(&data) => write,
            };
            if write.is_err() {
                break;
            }
        }
    }
}

/// Read one login line. Returns the username and whether it ended in CR.
async fn read_username<R, W>(
    input: &mut R,
    echo: &mut W,
    negotiated: &AtomicBool,
    max_len: usize,
) -> Result<(String, bool), HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut name = String::new();
    let mut byte = [0u8; 1];

    loop {
        if input.read(&mut byte).await? == 0 {
            return Err(HandshakeError::Disconnected);
        }
        let remote_echo = negotiated.load(Ordering::Acquire);

        match byte[0] {
            b'\r' | b'\n' if name.is_empty() => {
                echo.write_all(b"\r\n").await?;
                echo.write_all(LOGIN_PROMPT).await?;
            }
            b'\r' | b'\n' => {
                echo.write_all(b"\r\n").await?;
                echo.flush().await?;
                return Ok((name, byte[0] == b'\r'));
            }
            0x03 | 0x04 => return Err(HandshakeError::Disconnected),
            0x7f | 0x08 => {
                if name.pop().is_some() && remote_echo {
                    echo.write_all(b"\x08 \x08").await?;
                }
            }
            b if (b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
                && name.len() < max_len =>
            {
                name.push(b as char);
                if remote_echo {
                    echo.write_all(&byte).await?;
                }
            }
            _ => {}
        }
        echo.flush().await?;
    }
}
