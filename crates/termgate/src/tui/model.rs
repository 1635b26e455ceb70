//! Per-session interaction state machine.
//!
//! Single-threaded and clock-free: every change arrives as an [`Event`] and is
//! fully applied before the next one. The runtime owns the timers and feeds
//! their ticks in like any other event, which keeps the model replayable in
//! tests.

use unicode_segmentation::UnicodeSegmentation;

use super::content::{self, CommandContext, Response};
use super::keys::Key;
use super::typewriter::Typewriter;
use super::viewport::Viewport;

pub const HEADER_ROWS: usize = 2;
pub const FOOTER_ROWS: usize = 1;
pub const MIN_VIEWPORT_HEIGHT: usize = 1;
pub const MIN_VIEWPORT_WIDTH: usize = 1;

/// Longest prompt line accepted, in bytes.
const MAX_INPUT_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Motd,
    Triage,
    Command,
    Exit,
}

impl Screen {
    pub fn as_str(&self) -> &'static str {
        match self {
            Screen::Motd => "motd",
            Screen::Triage => "triage",
            Screen::Command => "command",
            Screen::Exit => "exit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    StatusBlink,
    CursorBlink,
    Typewriter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Key(Key),
    Tick(Tick),
    /// Requested terminal size. May be zero or negative; the model clamps.
    Resize { cols: i32, rows: i32 },
    /// Push lines from outside the key path.
    Append(Vec<String>),
    /// Replace the whole buffer.
    Replace(Vec<String>),
}

/// Who the session belongs to. Fixed at login.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user: String,
    /// 12-char fingerprint of the normalized remote address.
    pub observer: String,
    pub preselected_vector: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub max_buffer_lines: usize,
    pub typewriter_step: usize,
    pub typewriter_queue_cap: usize,
    pub interactive: bool,
    pub cols: i32,
    pub rows: i32,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            max_buffer_lines: 1000,
            typewriter_step: 2,
            typewriter_queue_cap: 256,
            interactive: true,
            cols: 80,
            rows: 24,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    session: SessionContext,
    screen: Screen,
    has_entered_command: bool,
    vector: Option<String>,
    viewport: Viewport,
    typewriter: Typewriter,
    input: String,
    interactive: bool,
    status_on: bool,
    cursor_on: bool,
    cols: usize,
    rows: usize,
}

fn clamp_dim(value: i32) -> usize {
    value.clamp(0, u16::MAX as i32) as usize
}

fn viewport_size(cols: usize, rows: usize) -> (usize, usize) {
    (
        cols.max(MIN_VIEWPORT_WIDTH),
        rows.saturating_sub(HEADER_ROWS + FOOTER_ROWS)
            .max(MIN_VIEWPORT_HEIGHT),
    )
}

impl Model {
    /// A fresh session on the MOTD screen with its content already in the buffer.
    pub fn new(session: SessionContext, options: ModelOptions) -> Self {
        let cols = clamp_dim(options.cols);
        let rows = clamp_dim(options.rows);
        let (width, height) = viewport_size(cols, rows);
        let mut viewport = Viewport::new(options.max_buffer_lines, width, height);
        for line in content::motd_lines() {
            viewport.push(&line);
        }

        Self {
            vector: session.preselected_vector.clone(),
            session,
            screen: Screen::Motd,
            has_entered_command: false,
            viewport,
            typewriter: Typewriter::new(options.typewriter_step, options.typewriter_queue_cap),
            input: String::new(),
            interactive: options.interactive,
            status_on: true,
            cursor_on: true,
            cols,
            rows,
        }
    }

    /// Apply one event. Returns whether anything visible changed.
    pub fn apply(&mut self, event: Event) -> bool {
        match event {
            Event::Key(key) => self.on_key(key),
            Event::Tick(tick) => self.on_tick(tick),
            Event::Resize { cols, rows } => self.on_resize(cols, rows),
            Event::Append(lines) => {
                self.typewriter.flush(&mut self.viewport);
                for line in &lines {
                    self.viewport.push(line);
                }
                true
            }
            Event::Replace(lines) => {
                self.typewriter.flush(&mut self.viewport);
                self.viewport.clear();
                for line in &lines {
                    self.viewport.push(line);
                }
                true
            }
        }
    }

    fn on_tick(&mut self, tick: Tick) -> bool {
        match tick {
            Tick::StatusBlink if self.interactive => {
                self.status_on = !self.status_on;
                true
            }
            Tick::CursorBlink if self.interactive => {
                self.cursor_on = !self.cursor_on;
                true
            }
            Tick::Typewriter => self.typewriter.advance(&mut self.viewport),
            Tick::StatusBlink | Tick::CursorBlink => false,
        }
    }

    fn on_resize(&mut self, cols: i32, rows: i32) -> bool {
        self.cols = clamp_dim(cols);
        self.rows = clamp_dim(rows);
        let (width, height) = viewport_size(self.cols, self.rows);
        self.viewport.set_size(width, height);
        true
    }

    fn on_key(&mut self, key: Key) -> bool {
        // Animation never holds back input.
        let flushed = self.typewriter.flush(&mut self.viewport);

        if self.screen != Screen::Exit && self.scroll(key) {
            return true;
        }

        let handled = match self.screen {
            Screen::Motd => match key {
                Key::Enter => {
                    self.enter_triage();
                    true
                }
                Key::Char(c) => self.select_vector(c),
                _ => false,
            },
            Screen::Triage => match key {
                Key::Esc if !self.has_entered_command => {
                    self.screen = Screen::Motd;
                    self.enqueue(content::motd_lines());
                    true
                }
                Key::Char(c) => self.select_vector(c),
                _ => false,
            },
            Screen::Command => self.edit_prompt(key),
            Screen::Exit => false,
        };

        flushed || handled
    }

    fn scroll(&mut self, key: Key) -> bool {
        match key {
            Key::Up => self.viewport.scroll_up(1),
            Key::Down => self.viewport.scroll_down(1),
            Key::PageUp => self.viewport.page_up(),
            Key::PageDown => self.viewport.page_down(),
            Key::Home => self.viewport.to_top(),
            Key::End => self.viewport.to_bottom(),
            _ => return false,
        }
        true
    }

    fn enter_triage(&mut self) {
        self.screen = Screen::Triage;
        self.enqueue(content::triage_lines());
    }

    fn select_vector(&mut self, hotkey: char) -> bool {
        let Some(vector) = content::vector_for_hotkey(hotkey) else {
            return false;
        };
        self.vector = Some(vector.to_string());
        self.screen = Screen::Command;
        self.has_entered_command = true;
        self.enqueue(content::engaged_lines(vector));
        true
    }

    fn edit_prompt(&mut self, key: Key) -> bool {
        match key {
            Key::CtrlD => {
                self.screen = Screen::Exit;
                true
            }
            Key::Enter => {
                self.submit();
                true
            }
            Key::Backspace => match self.input.grapheme_indices(true).next_back() {
                Some((start, _)) => {
                    self.input.truncate(start);
                    true
                }
                None => false,
            },
            Key::CtrlC => {
                if self.input.is_empty() {
                    return false;
                }
                self.input.clear();
                true
            }
            Key::CtrlL => {
                self.viewport.clear();
                true
            }
            Key::Char(c) if !c.is_control() => {
                if self.input.len() + c.len_utf8() > MAX_INPUT_BYTES {
                    return false;
                }
                self.input.push(c);
                true
            }
            _ => false,
        }
    }

    fn submit(&mut self) {
        let input = std::mem::take(&mut self.input);
        let echo = format!("{} {}", self.prompt_label(), input);
        self.viewport.push(echo.trim_end());

        let ctx = CommandContext {
            user: &self.session.user,
            observer: &self.session.observer,
            vector: self.vector.as_deref(),
        };
        match content::run_command(input.trim(), &ctx) {
            Response::Lines(lines) => self.enqueue(lines),
            Response::Clear => self.viewport.clear(),
            Response::Motd => self.enqueue(content::motd_lines()),
        }
    }

    /// Queue lines for reveal, or append them directly when nobody watches the animation.
    pub fn enqueue(&mut self, lines: Vec<String>) {
        if self.interactive {
            self.typewriter.enqueue(lines);
        } else {
            for line in &lines {
                self.viewport.push(line);
            }
        }
    }

    pub fn prompt_label(&self) -> String {
        format!(
            "{}@{}$",
            self.session.user,
            self.vector.as_deref().unwrap_or(content::NO_VECTOR)
        )
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn is_exited(&self) -> bool {
        self.screen == Screen::Exit
    }

    pub fn has_entered_command(&self) -> bool {
        self.has_entered_command
    }

    pub fn vector(&self) -> Option<&str> {
        self.vector.as_deref()
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn typewriter(&self) -> &Typewriter {
        &self.typewriter
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn status_on(&self) -> bool {
        self.status_on
    }

    pub fn cursor_on(&self) -> bool {
        self.cursor_on
    }

    /// Clamped terminal size as `(cols, rows)`.
    pub fn size(&self) -> (usize, usize) {
        (self.cols, self.rows)
    }

    #[cfg(test)]
    pub(crate) fn force_screen(&mut self, screen: Screen) {
        self.screen = screen;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(vector: Option<&str>) -> SessionContext {
        SessionContext {
            user: "guest".to_string(),
            observer: "0123456789AB".to_string(),
            preselected_vector: vector.map(str::to_string),
        }
    }

    fn model() -> Model {
        Model::new(session(None), ModelOptions::default())
    }

    fn keys(model: &mut Model, keys: &[Key]) {
        for key in keys {
            model.apply(Event::Key(*key));
        }
    }

    fn type_text(model: &mut Model, text: &str) {
        for c in text.chars() {
            model.apply(Event::Key(Key::Char(c)));
        }
    }

    #[test]
    fn starts_on_motd_with_content() {
        let m = model();
        assert_eq!(m.screen(), Screen::Motd);
        assert!(m.viewport().lines().any(|l| l.contains("TERMGATE")));
        assert!(!m.typewriter().is_busy());
    }

    #[test]
    fn motd_enter_goes_to_triage_and_back() {
        let mut m = model();
        keys(&mut m, &[Key::Enter]);
        assert_eq!(m.screen(), Screen::Triage);
        keys(&mut m, &[Key::Esc]);
        assert_eq!(m.screen(), Screen::Motd);
    }

    #[test]
    fn motd_hotkey_jumps_to_command() {
        let mut m = model();
        keys(&mut m, &[Key::Char('b')]);
        assert_eq!(m.screen(), Screen::Command);
        assert_eq!(m.vector(), Some("archive"));
        assert!(m.has_entered_command());
    }

    #[test]
    fn illegal_keys_are_noops() {
        let mut m = model();
        keys(&mut m, &[Key::Char('z'), Key::Esc, Key::CtrlD, Key::Backspace]);
        assert_eq!(m.screen(), Screen::Motd);

        keys(&mut m, &[Key::Enter, Key::Enter, Key::Char('q'), Key::CtrlD]);
        assert_eq!(m.screen(), Screen::Triage);
    }

    #[test]
    fn triage_escape_disabled_after_command() {
        let mut m = model();
        keys(&mut m, &[Key::Char('a')]);
        m.force_screen(Screen::Triage);
        keys(&mut m, &[Key::Esc]);
        assert_eq!(m.screen(), Screen::Triage);
    }

    #[test]
    fn ctrl_d_exits_only_from_command() {
        let mut m = model();
        keys(&mut m, &[Key::Enter, Key::Char('c'), Key::CtrlD]);
        assert!(m.is_exited());
        keys(&mut m, &[Key::Enter, Key::Char('a')]);
        assert!(m.is_exited());
    }

    #[test]
    fn prompt_editing_and_grapheme_backspace() {
        let mut m = model();
        keys(&mut m, &[Key::Char('a')]);
        type_text(&mut m, "héllo👍🏽");
        assert_eq!(m.input(), "héllo👍🏽");
        keys(&mut m, &[Key::Backspace]);
        assert_eq!(m.input(), "héllo");
        keys(&mut m, &[Key::Backspace, Key::Backspace, Key::Backspace, Key::Backspace]);
        assert_eq!(m.input(), "h");
    }

    #[test]
    fn characters_ignored_outside_command() {
        let mut m = model();
        keys(&mut m, &[Key::Enter]);
        type_text(&mut m, "xyz");
        assert_eq!(m.input(), "");
    }

    #[test]
    fn submit_echoes_and_answers() {
        let mut m = model();
        keys(&mut m, &[Key::Char('c')]);
        type_text(&mut m, "bogus");
        keys(&mut m, &[Key::Enter]);
        assert_eq!(m.input(), "");

        // Echo lands immediately, the answer waits for the typewriter.
        assert!(m.viewport().lines().any(|l| l == "guest@relay$ bogus"));
        assert!(m.typewriter().is_busy());

        m.apply(Event::Key(Key::End));
        assert!(m.viewport().lines().any(|l| l == "bogus: command not found"));
    }

    #[test]
    fn exit_command_does_not_exit() {
        let mut m = model();
        keys(&mut m, &[Key::Char('c')]);
        type_text(&mut m, "exit");
        keys(&mut m, &[Key::Enter]);
        assert_eq!(m.screen(), Screen::Command);
    }

    #[test]
    fn clear_command_empties_buffer() {
        let mut m = model();
        keys(&mut m, &[Key::Char('c')]);
        type_text(&mut m, "clear");
        keys(&mut m, &[Key::Enter]);
        assert!(m.viewport().is_empty());
    }

    #[test]
    fn key_flushes_pending_animation_first() {
        let mut m = model();
        keys(&mut m, &[Key::Enter]);
        assert!(m.typewriter().is_busy());
        m.apply(Event::Tick(Tick::Typewriter));
        keys(&mut m, &[Key::Char('a')]);

        // Triage text was completed before the hotkey took effect.
        assert!(m.viewport().lines().any(|l| l == "    [c] relay"));
        assert_eq!(m.screen(), Screen::Command);
    }

    #[test]
    fn scroll_keys_never_change_screen() {
        let mut m = model();
        for key in [Key::Up, Key::PageUp, Key::Home, Key::Down, Key::PageDown, Key::End] {
            m.apply(Event::Key(key));
            assert_eq!(m.screen(), Screen::Motd);
        }
    }

    #[test]
    fn ticks_suppressed_when_not_interactive() {
        let mut m = Model::new(
            session(None),
            ModelOptions {
                interactive: false,
                ..ModelOptions::default()
            },
        );
        assert!(!m.apply(Event::Tick(Tick::StatusBlink)));
        assert!(!m.apply(Event::Tick(Tick::CursorBlink)));
        assert!(m.status_on());
        assert!(m.cursor_on());

        keys(&mut m, &[Key::Enter]);
        assert!(!m.typewriter().is_busy());
        assert!(m.viewport().lines().any(|l| l.contains("TRIAGE")));
    }

    #[test]
    fn blink_ticks_toggle_when_interactive() {
        let mut m = model();
        assert!(m.apply(Event::Tick(Tick::StatusBlink)));
        assert!(!m.status_on());
        m.apply(Event::Tick(Tick::CursorBlink));
        assert!(!m.cursor_on());
    }

    #[test]
    fn extreme_resizes_are_floored() {
        let mut m = model();
        for (cols, rows) in [(0, 0), (-5, -10), (1, 1), (i32::MAX, i32::MIN), (200, 3)] {
            m.apply(Event::Resize { cols, rows });
            assert!(m.viewport().height() >= MIN_VIEWPORT_HEIGHT);
            assert!(m.viewport().width() >= MIN_VIEWPORT_WIDTH);
        }
        m.apply(Event::Resize { cols: 100, rows: 30 });
        assert_eq!(m.viewport().height(), 27);
        assert_eq!(m.viewport().width(), 100);
    }

    #[test]
    fn append_and_replace_flush_animation() {
        let mut m = model();
        keys(&mut m, &[Key::Enter]);
        m.apply(Event::Append(vec!["status: ok".to_string()]));
        assert!(!m.typewriter().is_busy());
        assert_eq!(m.viewport().lines().last(), Some("status: ok"));

        m.apply(Event::Replace(vec!["only".to_string()]));
        assert_eq!(m.viewport().lines().collect::<Vec<_>>(), vec!["only"]);
    }

    #[test]
    fn preselected_vector_is_shown_and_overridable() {
        let mut m = Model::new(session(Some("relay")), ModelOptions::default());
        assert_eq!(m.vector(), Some("relay"));
        assert_eq!(m.screen(), Screen::Motd);
        keys(&mut m, &[Key::Enter, Key::Char('a')]);
        assert_eq!(m.vector(), Some("signal"));
    }
}
