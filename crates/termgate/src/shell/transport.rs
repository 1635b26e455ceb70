//! Seam between the wire protocol and the session runtime.
//!
//! A [`Handshake`] turns an accepted byte stream into a [`ShellConnection`]:
//! an authenticated username, a clean input stream with protocol framing
//! removed, an output sink, and a feed of window-size changes. The telnet
//! implementation lives in [`super::telnet`]; anything else that can produce
//! the same shape plugs in unchanged.

use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::DropGuard;

/// Any bidirectional byte stream a handshake can run over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn Stream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client disconnected during handshake")]
    Disconnected,

    #[error("handshake timed out")]
    Timeout,
}

/// An authenticated connection ready for a session runtime.
pub struct ShellConnection {
    pub username: String,
    pub peer: SocketAddr,
    /// Whether the client behaves like a terminal (negotiates, wants frames).
    pub interactive: bool,
    pub size: TerminalSize,
    pub input: Box<dyn AsyncRead + Send + Unpin>,
    pub output: Box<dyn AsyncWrite + Send + Unpin>,
    /// Latest reported window size. Intermediate sizes may be skipped.
    pub resizes: watch::Receiver<TerminalSize>,
    /// The login line ended in a bare CR whose LF/NUL partner may still be in `input`.
    pub pending_cr: bool,
    /// Stops any background transport work when the connection is dropped.
    pub guard: Option<DropGuard>,
}

impl std::fmt::Debug for ShellConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellConnection")
            .field("username", &self.username)
            .field("peer", &self.peer)
            .field("interactive", &self.interactive)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Handshake: Send + Sync {
    /// Negotiate with the client and authenticate a username.
    async fn accept(
        &self,
        stream: BoxedStream,
        peer: SocketAddr,
    ) -> Result<ShellConnection, HandshakeError>;
}
