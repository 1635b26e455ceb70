//! Wire-protocol listener.
//!
//! Each accepted connection runs admission in order: rate limit, session
//! cap, handshake, identity. Only a connection that passes all four gets a
//! [`SessionRuntime`]. Rejections write one short line and close.

pub mod runtime;
pub mod telnet;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{Instrument, error, info, info_span, warn};

use crate::admission::gate::MAX_SESSIONS_MESSAGE;
use crate::admission::{AdmissionGate, RateLimiter, SourceKey};
use crate::identity::{Identity, IdentityResolver, REJECTION_BANNER};
use crate::shutdown::Tasks;
use crate::tui::{KeyDecoder, SessionContext};

pub use runtime::{RuntimeError, RuntimeSettings, SessionEnd, SessionRuntime};
pub use telnet::TelnetHandshake;
pub use transport::{BoxedStream, Handshake, HandshakeError, ShellConnection, TerminalSize};

/// Line written to a throttled client before closing.
pub const RATE_LIMITED_MESSAGE: &str = "too many connections from your address, try again later";

const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Who is on the other end of an admitted session. Owned by that session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub identity: Identity,
    pub observer: String,
    pub peer: SocketAddr,
    pub started_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn context(&self) -> SessionContext {
        SessionContext {
            user: self.identity.username.clone(),
            observer: self.observer.clone(),
            preselected_vector: self.identity.preselected_vector().map(str::to_string),
        }
    }

    pub fn elapsed_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

/// Everything a connection needs on its way to a session.
pub struct ShellServer {
    limiter: Arc<RateLimiter>,
    gate: AdmissionGate,
    identities: Arc<IdentityResolver>,
    handshake: Arc<dyn Handshake>,
    settings: RuntimeSettings,
    handshake_timeout: Duration,
    tasks: Tasks,
}

impl ShellServer {
    pub fn new(
        limiter: Arc<RateLimiter>,
        gate: AdmissionGate,
        identities: Arc<IdentityResolver>,
        handshake: Arc<dyn Handshake>,
        settings: RuntimeSettings,
        handshake_timeout: Duration,
        tasks: Tasks,
    ) -> Self {
        Self {
            limiter,
            gate,
            identities,
            handshake,
            settings,
            handshake_timeout,
            tasks,
        }
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Accept connections until shutdown begins.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let cancel = self.tasks.token();
        info!(addr = %listener.local_addr()?, "shell listener started");

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            let _ = stream.set_nodelay(true);
            let server = self.clone();
            self.tasks.spawn(async move {
                server.handle_connection(Box::new(stream), peer).await;
            });
        }

        info!("shell listener stopped");
        Ok(())
    }

    /// Run one connection from admission to teardown.
    pub async fn handle_connection(self: Arc<Self>, mut stream: BoxedStream, peer: SocketAddr) {
        let source = SourceKey::from_socket(peer);

        if !self.limiter.allow(source) {
            reject(&mut stream, RATE_LIMITED_MESSAGE).await;
            return;
        }

        let permit = match self.gate.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                info!(source = %source, error = %e, "session refused");
                reject(&mut stream, MAX_SESSIONS_MESSAGE).await;
                return;
            }
        };

        let connection = match tokio::time::timeout(
            self.handshake_timeout,
            self.handshake.accept(stream, peer),
        )
        .await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                info!(source = %source, error = %e, "handshake failed");
                return;
            }
            Err(_) => {
                info!(source = %source, error = %HandshakeError::Timeout, "handshake failed");
                return;
            }
        };

        let identity = self.identities.resolve(&connection.username);
        if identity.is_rejected() {
            info!(source = %source, user = %identity.username, "identity rejected");
            let mut output = connection.output;
            reject(&mut output, REJECTION_BANNER).await;
            return;
        }

        let info = SessionInfo {
            identity,
            observer: source.fingerprint(),
            peer,
            started_at: Utc::now(),
        };
        let span = info_span!(
            "shell_session",
            user = %info.identity.username,
            route = info.identity.route.as_str(),
            vector = info.identity.preselected_vector().unwrap_or("none"),
            observer = %info.observer,
        );

        let ShellConnection {
            interactive,
            size,
            input,
            output,
            resizes,
            pending_cr,
            guard,
            ..
        } = connection;

        let decoder = if pending_cr {
            KeyDecoder::after_carriage_return()
        } else {
            KeyDecoder::new()
        };
        let runtime = SessionRuntime::new(
            info.context(),
            self.settings.clone(),
            interactive,
            size,
            output,
            self.tasks.token().child_token(),
        )
        .with_permit(permit.clone());

        // A panic inside the session surfaces here as a JoinError instead of
        // unwinding through the listener.
        let session = tokio::spawn(
            async move {
                info!(interactive, "session started");
                runtime.run(input, decoder, resizes).await
            }
            .instrument(span.clone()),
        );

        async {
            match session.await {
                Ok(Ok(end)) => info!(
                    end = end.as_str(),
                    duration_secs = info.elapsed_secs(),
                    "session ended"
                ),
                Ok(Err(e)) => warn!(error = %e, "session ended with error"),
                Err(e) if e.is_panic() => error!(error = %e, "session handler panicked"),
                Err(e) => warn!(error = %e, "session task aborted"),
            }
        }
        .instrument(span)
        .await;

        drop(guard);
        permit.release();
    }
}

async fn reject<W>(stream: &mut W, message: &str)
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let write = async {
        stream.write_all(message.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.shutdown().await
    };
    let _ = tokio::time::timeout(REJECT_WRITE_TIMEOUT, write).await;
}
