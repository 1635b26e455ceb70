//! Per-session event loop.
//!
//! Input bytes, resize notifications and three timers all feed one bounded
//! inbox. The loop takes exactly one message per iteration, applies it to
//! the model, and repaints when the model reports a change. Cancellation and
//! the idle deadline are raced against the inbox in the same `select!`, and
//! against every terminal write, so a client that stops reading cannot pin
//! the session.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::transport::TerminalSize;
use crate::admission::AdmissionPermit;
use crate::config::ShellConfig;
use crate::tui::content::{FAREWELL, IDLE_NOTICE};
use crate::tui::render::{encode_clear, encode_frame, encode_reset, render};
use crate::tui::{Event, KeyDecoder, Model, ModelOptions, SessionContext, Tick};

const INBOX_CAPACITY: usize = 256;

/// Upper bound on the closing write once the loop has decided to end.
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("terminal write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a session loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The user pressed ctrl+d.
    Exited,
    /// The input stream closed.
    Disconnected,
    IdleTimeout,
    /// Server shutdown or connection teardown.
    Cancelled,
}

impl SessionEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEnd::Exited => "exited",
            SessionEnd::Disconnected => "disconnected",
            SessionEnd::IdleTimeout => "idle_timeout",
            SessionEnd::Cancelled => "cancelled",
        }
    }
}

/// Timer periods and model limits for one session.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub idle_timeout: Duration,
    pub status_blink: Duration,
    pub cursor_blink: Duration,
    pub typewriter: Duration,
    pub typewriter_step: usize,
    pub typewriter_queue_cap: usize,
    pub max_buffer_lines: usize,
}

impl RuntimeSettings {
    pub fn from_config(config: &ShellConfig) -> Self {
        Self {
            idle_timeout: Duration::from_secs(config.idle_timeout_seconds),
            status_blink: Duration::from_millis(config.ui.status_blink_ms),
            cursor_blink: Duration::from_millis(config.ui.cursor_blink_ms),
            typewriter: Duration::from_millis(config.ui.typewriter_ms),
            typewriter_step: config.ui.typewriter_step,
            typewriter_queue_cap: config.ui.typewriter_queue_cap,
            max_buffer_lines: config.ui.max_buffer_lines,
        }
    }

    pub fn model_options(&self, interactive: bool, size: TerminalSize) -> ModelOptions {
        ModelOptions {
            max_buffer_lines: self.max_buffer_lines,
            typewriter_step: self.typewriter_step,
            typewriter_queue_cap: self.typewriter_queue_cap,
            interactive,
            cols: i32::from(size.cols),
            rows: i32::from(size.rows),
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from_config(&ShellConfig::default())
    }
}

enum Inbox {
    Event(Event),
    Eof,
}

/// Why a terminal write did not complete.
enum Stall {
    Io(std::io::Error),
    /// Cancellation or the idle deadline fired while the write was blocked.
    Ended(SessionEnd),
}

pub struct SessionRuntime {
    model: Model,
    settings: RuntimeSettings,
    output: Box<dyn AsyncWrite + Send + Unpin>,
    cancel: CancellationToken,
    permit: Option<AdmissionPermit>,
    streamed: u64,
    idle_deadline: Instant,
}

impl SessionRuntime {
    pub fn new(
        session: SessionContext,
        settings: RuntimeSettings,
        interactive: bool,
        size: TerminalSize,
        output: Box<dyn AsyncWrite + Send + Unpin>,
        cancel: CancellationToken,
    ) -> Self {
        let model = Model::new(session, settings.model_options(interactive, size));
        Self {
            model,
            settings,
            output,
            cancel,
            permit: None,
            streamed: 0,
            idle_deadline: Instant::now(),
        }
    }

    /// Release `permit` when the loop exits.
    pub fn with_permit(mut self, permit: AdmissionPermit) -> Self {
        self.permit = Some(permit);
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Drive the session until exit, disconnect, idle timeout or cancellation.
    pub async fn run<R>(
        mut self,
        input: R,
        decoder: KeyDecoder,
        resizes: watch::Receiver<TerminalSize>,
    ) -> Result<SessionEnd, RuntimeError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, mut inbox) = mpsc::channel(INBOX_CAPACITY);
        let mut feeders = JoinSet::new();
        feeders.spawn(read_keys(input, decoder, tx.clone()));
        feeders.spawn(forward_resizes(resizes, tx.clone()));
        spawn_ticker(&mut feeders, &tx, self.settings.status_blink, Tick::StatusBlink);
        spawn_ticker(&mut feeders, &tx, self.settings.cursor_blink, Tick::CursorBlink);
        spawn_ticker(&mut feeders, &tx, self.settings.typewriter, Tick::Typewriter);
        drop(tx);

        let result = self.event_loop(&mut inbox).await;

        feeders.abort_all();
        if let Some(permit) = self.permit.take() {
            permit.release();
        }
        result
    }

    async fn event_loop(
        &mut self,
        inbox: &mut mpsc::Receiver<Inbox>,
    ) -> Result<SessionEnd, RuntimeError> {
        let end = match self.drive(inbox).await {
            Ok(end) => {
                if end != SessionEnd::Disconnected {
                    self.farewell().await?;
                }
                end
            }
            Err(Stall::Ended(end)) => {
                debug!(end = end.as_str(), "terminal output stalled");
                end
            }
            Err(Stall::Io(e)) => return Err(e.into()),
        };
        debug!(end = end.as_str(), "session loop finished");
        Ok(end)
    }

    async fn drive(&mut self, inbox: &mut mpsc::Receiver<Inbox>) -> Result<SessionEnd, Stall> {
        self.idle_deadline = Instant::now() + self.settings.idle_timeout;
        if self.model.is_interactive() {
            self.send(encode_clear()).await?;
        }
        self.draw().await?;

        let idle = tokio::time::sleep_until(self.idle_deadline);
        tokio::pin!(idle);

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                _ = &mut idle => {
                    self.model.apply(Event::Append(vec![IDLE_NOTICE.to_string()]));
                    return Ok(SessionEnd::IdleTimeout);
                }
                message = inbox.recv() => match message {
                    Some(Inbox::Event(event)) => event,
                    Some(Inbox::Eof) | None => return Ok(SessionEnd::Disconnected),
                },
            };

            if matches!(event, Event::Key(_)) {
                self.idle_deadline = Instant::now() + self.settings.idle_timeout;
                idle.as_mut().reset(self.idle_deadline);
            }
            if self.model.apply(event) {
                self.draw().await?;
            }
            if self.model.is_exited() {
                return Ok(SessionEnd::Exited);
            }
        }
    }

    /// Bytes that bring the terminal up to date with the model.
    fn pending_output(&mut self) -> Vec<u8> {
        if self.model.is_interactive() {
            encode_frame(&render(&self.model))
        } else {
            let mut text = String::new();
            for line in self.model.viewport().lines_since(self.streamed) {
                text.push_str(line);
                text.push_str("\r\n");
            }
            self.streamed = self.model.viewport().pushed_total();
            text.into_bytes()
        }
    }

    async fn draw(&mut self) -> Result<(), Stall> {
        let bytes = self.pending_output();
        self.send(&bytes).await
    }

    /// Write and flush, giving up if cancellation or the idle deadline comes
    /// first. A write that is ready immediately always wins.
    async fn send(&mut self, bytes: &[u8]) -> Result<(), Stall> {
        let deadline = self.idle_deadline;
        let cancel = &self.cancel;
        let output = &mut self.output;
        tokio::select! {
            biased;
            written = async {
                output.write_all(bytes).await?;
                output.flush().await
            } => written.map_err(Stall::Io),
            _ = cancel.cancelled() => Err(Stall::Ended(SessionEnd::Cancelled)),
            _ = tokio::time::sleep_until(deadline) => Err(Stall::Ended(SessionEnd::IdleTimeout)),
        }
    }

    async fn farewell(&mut self) -> Result<(), RuntimeError> {
        self.model.apply(Event::Append(vec![FAREWELL.to_string()]));
        let mut bytes = self.pending_output();
        if self.model.is_interactive() {
            bytes.extend_from_slice(encode_reset());
        }

        let output = &mut self.output;
        let write = async {
            output.write_all(&bytes).await?;
            output.flush().await?;
            output.shutdown().await
        };
        match tokio::time::timeout(FAREWELL_TIMEOUT, write).await {
            Ok(written) => written?,
            Err(_) => debug!("farewell write timed out"),
        }
        Ok(())
    }
}

async fn read_keys<R>(mut input: R, mut decoder: KeyDecoder, tx: mpsc::Sender<Inbox>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = [0u8; 1024];
    loop {
        let n = match input.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = tx.send(Inbox::Eof).await;
                return;
            }
            Ok(n) => n,
        };
        for key in decoder.feed(&buf[..n]) {
            if tx.send(Inbox::Event(Event::Key(key))).await.is_err() {
                return;
            }
        }
    }
}

/// Forward the newest window size. Sizes superseded before the loop reads
/// them are skipped.
async fn forward_resizes(mut resizes: watch::Receiver<TerminalSize>, tx: mpsc::Sender<Inbox>) {
    while resizes.changed().await.is_ok() {
        let size = *resizes.borrow_and_update();
        let event = Event::Resize {
            cols: i32::from(size.cols),
            rows: i32::from(size.rows),
        };
        if tx.send(Inbox::Event(event)).await.is_err() {
            return;
        }
    }
}

/// Periodic tick into the inbox. A full inbox drops the tick instead of waiting.
fn spawn_ticker(
    feeders: &mut JoinSet<()>,
    tx: &mpsc::Sender<Inbox>,
    period: Duration,
    tick: Tick,
) {
    let tx = tx.clone();
    feeders.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            interval.tick().await;
            match tx.try_send(Inbox::Event(Event::Tick(tick))) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionGate;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn session() -> SessionContext {
        SessionContext {
            user: "guest".to_string(),
            observer: "0123456789AB".to_string(),
            preselected_vector: None,
        }
    }

    fn settings() -> RuntimeSettings {
        RuntimeSettings {
            idle_timeout: Duration::from_secs(60),
            ..RuntimeSettings::default()
        }
    }

    struct Harness {
        keyboard: DuplexStream,
        screen: DuplexStream,
        resize_tx: watch::Sender<TerminalSize>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<Result<SessionEnd, RuntimeError>>,
    }

    fn start(interactive: bool, settings: RuntimeSettings, permit: Option<AdmissionPermit>) -> Harness {
        start_with_screen(interactive, settings, permit, 1 << 20)
    }

    /// `screen_capacity` bounds how much output fits before writes block.
    fn start_with_screen(
        interactive: bool,
        settings: RuntimeSettings,
        permit: Option<AdmissionPermit>,
        screen_capacity: usize,
    ) -> Harness {
        let (keyboard, input) = tokio::io::duplex(1024);
        let (output, screen) = tokio::io::duplex(screen_capacity);
        let (resize_tx, resizes) = watch::channel(TerminalSize::default());
        let cancel = CancellationToken::new();
        let mut runtime = SessionRuntime::new(
            session(),
            settings,
            interactive,
            TerminalSize::default(),
            Box::new(output),
            cancel.clone(),
        );
        if let Some(permit) = permit {
            runtime = runtime.with_permit(permit);
        }
        let handle = tokio::spawn(runtime.run(input, KeyDecoder::new(), resizes));
        Harness {
            keyboard,
            screen,
            resize_tx,
            cancel,
            handle,
        }
    }

    async fn drain(screen: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        screen.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn ctrl_d_in_command_exits_and_releases_permit() {
        let gate = AdmissionGate::new(1);
        let permit = gate.try_acquire().unwrap();
        let mut h = start(true, settings(), Some(permit.clone()));

        h.keyboard.write_all(b"a").await.unwrap();
        h.keyboard.write_all(&[0x04]).await.unwrap();

        let end = h.handle.await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Exited);
        assert!(permit.is_released());
        drop(permit);
        assert_eq!(gate.available(), 1);

        let screen = drain(&mut h.screen).await;
        assert!(screen.contains("TERMGATE/1"));
        assert!(screen.contains(FAREWELL));
    }

    #[tokio::test]
    async fn input_eof_is_disconnect() {
        let h = start(true, settings(), None);
        drop(h.keyboard);
        assert_eq!(h.handle.await.unwrap().unwrap(), SessionEnd::Disconnected);
    }

    #[tokio::test]
    async fn cancellation_stops_loop_promptly() {
        let mut h = start(true, settings(), None);
        h.cancel.cancel();
        assert_eq!(h.handle.await.unwrap().unwrap(), SessionEnd::Cancelled);
        assert!(drain(&mut h.screen).await.contains(FAREWELL));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_times_out() {
        let mut h = start(
            true,
            RuntimeSettings {
                idle_timeout: Duration::from_secs(5),
                ..RuntimeSettings::default()
            },
            None,
        );
        let end = h.handle.await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::IdleTimeout);
        assert!(drain(&mut h.screen).await.contains(IDLE_NOTICE));
    }

    #[tokio::test]
    async fn non_interactive_streams_plain_lines() {
        let mut h = start(false, settings(), None);
        h.keyboard.write_all(b"c").await.unwrap();
        h.keyboard.write_all(b"whoami\n").await.unwrap();
        h.keyboard.write_all(&[0x04]).await.unwrap();
        assert_eq!(h.handle.await.unwrap().unwrap(), SessionEnd::Exited);

        let screen = drain(&mut h.screen).await;
        assert!(!screen.contains('\x1b'));
        assert!(screen.contains("vector relay engaged."));
        assert!(screen.contains("guest@relay$ whoami\r\n"));
        assert!(screen.contains("guest (observer 0123456789AB)\r\n"));
    }

    #[tokio::test]
    async fn resize_reaches_model() {
        let mut h = start(true, settings(), None);
        h.resize_tx.send(TerminalSize { cols: 0, rows: 0 }).unwrap();
        h.keyboard.write_all(b"b").await.unwrap();
        h.keyboard.write_all(&[0x04]).await.unwrap();
        assert_eq!(h.handle.await.unwrap().unwrap(), SessionEnd::Exited);
        assert!(!drain(&mut h.screen).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unread_screen_does_not_block_cancellation() {
        let gate = AdmissionGate::new(1);
        let permit = gate.try_acquire().unwrap();
        let h = start_with_screen(
            true,
            RuntimeSettings {
                idle_timeout: Duration::from_secs(3600),
                ..RuntimeSettings::default()
            },
            Some(permit.clone()),
            64,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!h.handle.is_finished());
        h.cancel.cancel();

        let end = tokio::time::timeout(Duration::from_secs(10), h.handle)
            .await
            .expect("loop should stop once cancelled")
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::Cancelled);
        assert!(permit.is_released());
        drop(permit);
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unread_screen_still_hits_idle_deadline() {
        let gate = AdmissionGate::new(1);
        let permit = gate.try_acquire().unwrap();
        let h = start_with_screen(
            true,
            RuntimeSettings {
                idle_timeout: Duration::from_secs(5),
                ..RuntimeSettings::default()
            },
            Some(permit.clone()),
            64,
        );

        let end = tokio::time::timeout(Duration::from_secs(60), h.handle)
            .await
            .expect("loop should stop at the idle deadline")
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::IdleTimeout);
        assert!(permit.is_released());
        drop(permit);
        assert_eq!(gate.available(), 1);
    }
}
