//! Pure rendering of a [`Model`] into screen regions, and ANSI encoding.

use unicode_segmentation::UnicodeSegmentation;
use unicode_width::UnicodeWidthStr;

use super::content::{NO_VECTOR, PROTOCOL_BANNER};
use super::model::{Model, Screen};

const LIVE_ON: &str = "●";
const LIVE_OFF: &str = "○";
const CURSOR: &str = "█";

/// One rendered screen. Every line already fits `width` display columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: usize,
    pub header: Vec<String>,
    pub body: Vec<String>,
    pub prompt: String,
}

pub fn render(model: &Model) -> Frame {
    let width = model.viewport().width();

    let live = if model.status_on() { LIVE_ON } else { LIVE_OFF };
    let title = format!(
        " {PROTOCOL_BANNER} {live} LIVE  OBSERVER {}  VECTOR {}",
        model.session().observer,
        model.vector().unwrap_or(NO_VECTOR).to_uppercase(),
    );
    let header = vec![fit(&title, width), "─".repeat(width)];

    let mut body: Vec<String> = model.viewport().visible().map(|l| fit(l, width)).collect();
    body.resize(model.viewport().height(), String::new());

    Frame {
        width,
        header,
        body,
        prompt: fit(&prompt_line(model), width),
    }
}

fn prompt_line(model: &Model) -> String {
    match model.screen() {
        Screen::Motd => "press ENTER to continue · [a] [b] [c] jump to a vector".to_string(),
        Screen::Triage if model.has_entered_command() => "select a vector: [a] [b] [c]".to_string(),
        Screen::Triage => "select a vector: [a] [b] [c] · ESC back".to_string(),
        Screen::Command => {
            let cursor = if model.cursor_on() { CURSOR } else { " " };
            format!("{} {}{cursor}", model.prompt_label(), model.input())
        }
        Screen::Exit => "session closed".to_string(),
    }
}

/// Strip control characters and cut to `width` display columns.
pub fn fit(text: &str, width: usize) -> String {
    let mut out = String::with_capacity(text.len().min(width * 4));
    let mut used = 0;
    for grapheme in text.graphemes(true) {
        let grapheme = if grapheme == "\t" { " " } else { grapheme };
        if grapheme.chars().any(char::is_control) {
            continue;
        }
        let w = grapheme.width();
        if used + w > width {
            break;
        }
        used += w;
        out.push_str(grapheme);
    }
    out
}

fn pad(text: &str, width: usize) -> String {
    let w = text.width();
    let mut out = text.to_string();
    out.extend(std::iter::repeat_n(' ', width.saturating_sub(w)));
    out
}

/// Encode a frame as an in-place repaint: home the cursor, rewrite each row,
/// erase leftovers. No full-screen clear, so there is no flicker.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut out = String::with_capacity(frame.width * (frame.body.len() + 3) + 64);
    out.push_str("\x1b[?25l\x1b[H");

    if let Some((title, rest)) = frame.header.split_first() {
        out.push_str("\x1b[7m");
        out.push_str(&pad(title, frame.width));
        out.push_str("\x1b[0m\x1b[K\r\n");
        for line in rest {
            out.push_str(line);
            out.push_str("\x1b[K\r\n");
        }
    }
    for line in &frame.body {
        out.push_str(line);
        out.push_str("\x1b[K\r\n");
    }
    out.push_str(&frame.prompt);
    out.push_str("\x1b[K\x1b[J");
    out.into_bytes()
}

/// Clear the screen once at session start.
pub fn encode_clear() -> &'static [u8] {
    b"\x1b[2J\x1b[H"
}

/// Restore the cursor and leave a clean line after the last frame.
pub fn encode_reset() -> &'static [u8] {
    b"\x1b[0m\x1b[?25h\r\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tui::keys::Key;
    use crate::tui::model::{Event, ModelOptions, SessionContext, Tick};

    fn model(cols: i32, rows: i32) -> Model {
        Model::new(
            SessionContext {
                user: "guest".to_string(),
                observer: "DEADBEEF0042".to_string(),
                preselected_vector: None,
            },
            ModelOptions {
                cols,
                rows,
                ..ModelOptions::default()
            },
        )
    }

    #[test]
    fn frame_has_fixed_regions() {
        let m = model(80, 24);
        let frame = render(&m);
        assert_eq!(frame.header.len(), 2);
        assert_eq!(frame.body.len(), 21);
        assert!(frame.header[0].contains(PROTOCOL_BANNER));
        assert!(frame.header[0].contains("DEADBEEF0042"));
        assert!(frame.header[0].contains("VECTOR NONE"));
        assert!(frame.prompt.contains("ENTER"));
    }

    #[test]
    fn render_is_deterministic() {
        let m = model(60, 12);
        assert_eq!(render(&m), render(&m));
    }

    #[test]
    fn live_indicator_follows_blink() {
        let mut m = model(80, 24);
        assert!(render(&m).header[0].contains(LIVE_ON));
        m.apply(Event::Tick(Tick::StatusBlink));
        assert!(render(&m).header[0].contains(LIVE_OFF));
    }

    #[test]
    fn command_prompt_shows_input_and_cursor() {
        let mut m = model(80, 24);
        m.apply(Event::Key(Key::Char('b')));
        m.apply(Event::Key(Key::Char('l')));
        m.apply(Event::Key(Key::Char('s')));
        let frame = render(&m);
        assert_eq!(frame.prompt, format!("guest@archive$ ls{CURSOR}"));
        assert!(frame.header[0].contains("VECTOR ARCHIVE"));
    }

    #[test]
    fn lines_fit_width() {
        let m = model(10, 24);
        let frame = render(&m);
        for line in frame.header.iter().chain(&frame.body) {
            assert!(line.width() <= 10, "{line:?}");
        }
    }

    #[test]
    fn degenerate_size_still_renders() {
        let m = model(0, 0);
        let frame = render(&m);
        assert_eq!(frame.width, 1);
        assert_eq!(frame.body.len(), 1);
        assert!(!encode_frame(&frame).is_empty());
    }

    #[test]
    fn fit_respects_wide_chars_and_strips_controls() {
        assert_eq!(fit("日本語", 5), "日本");
        assert_eq!(fit("a\x1b[31mb", 10), "a[31mb");
        assert_eq!(fit("a\tb", 10), "a b");
    }

    #[test]
    fn encoded_frame_repaints_in_place() {
        let frame = render(&model(40, 8));
        let bytes = String::from_utf8(encode_frame(&frame)).unwrap();
        assert!(bytes.starts_with("\x1b[?25l\x1b[H\x1b[7m"));
        assert!(!bytes.contains("\x1b[2J"));
        assert_eq!(bytes.matches("\r\n").count(), 2 + frame.body.len());
    }
}
