//! Raw terminal input → discrete key events.
//!
//! Input arrives as arbitrary byte chunks. Multi-byte UTF-8 characters and
//! CSI/SS3 escape sequences may be split across reads, so the decoder keeps
//! incomplete tails in a small buffer until the rest shows up.

/// A decoded key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Backspace,
    Tab,
    Esc,
    CtrlC,
    CtrlD,
    CtrlL,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    Delete,
    Unknown,
}

const ESC: u8 = 0x1b;

/// Longest tail we are willing to hold waiting for completion.
const MAX_PENDING: usize = 16;

/// Incremental byte → key decoder. One per session.
#[derive(Debug, Default)]
pub struct KeyDecoder {
    pending: Vec<u8>,
    after_cr: bool,
}

enum Step {
    Key(Key, usize),
    Skip(usize),
    Incomplete,
}

impl KeyDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder whose first LF or NUL completes an already-consumed CR.
    pub fn after_carriage_return() -> Self {
        Self {
            pending: Vec::new(),
            after_cr: true,
        }
    }

    /// Decode as many keys as `bytes` (plus any held tail) completes.
    ///
    /// An ESC that ends the chunk is reported as a bare `Esc` right away
    /// rather than held, so the escape key never waits on the next read.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Key> {
        self.pending.extend_from_slice(bytes);
        let mut keys = Vec::new();
        let mut pos = 0;

        while pos < self.pending.len() {
            match self.step(pos) {
                Step::Key(key, used) => {
                    keys.push(key);
                    pos += used;
                }
                Step::Skip(used) => pos += used,
                Step::Incomplete => break,
            }
        }

        self.pending.drain(..pos);
        if self.pending.len() > MAX_PENDING {
            self.pending.clear();
            keys.push(Key::Unknown);
        }
        keys
    }

    fn step(&mut self, pos: usize) -> Step {
        let buf = &self.pending[pos..];
        let byte = buf[0];
        let after_cr = std::mem::replace(&mut self.after_cr, false);

        match byte {
            b'\r' => {
                self.after_cr = true;
                Step::Key(Key::Enter, 1)
            }
            b'\n' | 0x00 if after_cr => Step::Skip(1),
            b'\n' => Step::Key(Key::Enter, 1),
            0x00 => Step::Skip(1),
            0x7f | 0x08 => Step::Key(Key::Backspace, 1),
            b'\t' => Step::Key(Key::Tab, 1),
            0x03 => Step::Key(Key::CtrlC, 1),
            0x04 => Step::Key(Key::CtrlD, 1),
            0x0c => Step::Key(Key::CtrlL, 1),
            ESC => decode_escape(buf),
            b if b < 0x20 => Step::Key(Key::Unknown, 1),
            _ => decode_utf8(buf),
        }
    }
}

fn decode_escape(buf: &[u8]) -> Step {
    let Some(&next) = buf.get(1) else {
        return Step::Key(Key::Esc, 1);
    };

    match next {
        b'[' => decode_csi(buf),
        b'O' => match buf.get(2) {
            None => Step::Incomplete,
            Some(b'A') => Step::Key(Key::Up, 3),
            Some(b'B') => Step::Key(Key::Down, 3),
            Some(b'C') => Step::Key(Key::Right, 3),
            Some(b'D') => Step::Key(Key::Left, 3),
            Some(b'H') => Step::Key(Key::Home, 3),
            Some(b'F') => Step::Key(Key::End, 3),
            Some(_) => Step::Key(Key::Unknown, 3),
        },
        ESC => Step::Key(Key::Esc, 1),
        // Alt+key: swallow both bytes.
        _ => Step::Key(Key::Unknown, 2),
    }
}

fn decode_csi(buf: &[u8]) -> Step {
    // buf = ESC '[' params* intermediates* final
    let mut end = 2;
    while let Some(&b) = buf.get(end) {
        if (0x40..=0x7e).contains(&b) {
            let params = &buf[2..end];
            return Step::Key(csi_key(params, b), end + 1);
        }
        if !(0x20..=0x3f).contains(&b) {
            return Step::Key(Key::Unknown, end);
        }
        end += 1;
    }
    Step::Incomplete
}

fn csi_key(params: &[u8], final_byte: u8) -> Key {
    match final_byte {
        b'A' => Key::Up,
        b'B' => Key::Down,
        b'C' => Key::Right,
        b'D' => Key::Left,
        b'H' => Key::Home,
        b'F' => Key::End,
        b'~' => {
            let first = params.split(|b| *b == b';').next().unwrap_or_default();
            match first {
                b"1" | b"7" => Key::Home,
                b"4" | b"8" => Key::End,
                b"3" => Key::Delete,
                b"5" => Key::PageUp,
                b"6" => Key::PageDown,
                _ => Key::Unknown,
            }
        }
        _ => Key::Unknown,
    }
}

fn decode_utf8(buf: &[u8]) -> Step {
    let width = match buf[0] {
        0x00..=0x7f => 1,
        0xc2..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf4 => 4,
        _ => return Step::Key(Key::Unknown, 1),
    };
    if buf.len() < width {
        return Step::Incomplete;
    }
    match std::str::from_utf8(&buf[..width])
        .ok()
        .and_then(|s| s.chars().next())
    {
        Some(c) => Step::Key(Key::Char(c), width),
        None => Step::Key(Key::Unknown, 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Vec<Key> {
        KeyDecoder::new().feed(bytes)
    }

    #[test]
    fn plain_text() {
        assert_eq!(
            decode(b"ab"),
            vec![Key::Char('a'), Key::Char('b')]
        );
    }

    #[test]
    fn line_endings_collapse_to_one_enter() {
        assert_eq!(decode(b"\r\n"), vec![Key::Enter]);
        assert_eq!(decode(b"\r\0"), vec![Key::Enter]);
        assert_eq!(decode(b"\n"), vec![Key::Enter]);
        assert_eq!(decode(b"\r\r"), vec![Key::Enter, Key::Enter]);
    }

    #[test]
    fn crlf_split_across_reads() {
        let mut decoder = KeyDecoder::new();
        assert_eq!(decoder.feed(b"x\r"), vec![Key::Char('x'), Key::Enter]);
        assert_eq!(decoder.feed(b"\ny"), vec![Key::Char('y')]);
    }

    #[test]
    fn carried_over_cr_swallows_first_lf() {
        let mut decoder = KeyDecoder::after_carriage_return();
        assert_eq!(decoder.feed(b"\n\n"), vec![Key::Enter]);
    }

    #[test]
    fn control_keys() {
        assert_eq!(
            decode(&[0x04, 0x03, 0x7f, 0x08, 0x0c, b'\t']),
            vec![
                Key::CtrlD,
                Key::CtrlC,
                Key::Backspace,
                Key::Backspace,
                Key::CtrlL,
                Key::Tab
            ]
        );
    }

    #[test]
    fn arrow_and_paging_sequences() {
        assert_eq!(
            decode(b"\x1b[A\x1b[B\x1bOC\x1b[5~\x1b[6~\x1b[1~\x1b[4~"),
            vec![
                Key::Up,
                Key::Down,
                Key::Right,
                Key::PageUp,
                Key::PageDown,
                Key::Home,
                Key::End
            ]
        );
    }

    #[test]
    fn modified_arrow_is_still_an_arrow() {
        assert_eq!(decode(b"\x1b[1;5A"), vec![Key::Up]);
    }

    #[test]
    fn lone_escape_is_reported_immediately() {
        assert_eq!(decode(b"\x1b"), vec![Key::Esc]);
        assert_eq!(decode(b"\x1b\x1b"), vec![Key::Esc, Key::Esc]);
    }

    #[test]
    fn split_csi_waits_for_final_byte() {
        let mut decoder = KeyDecoder::new();
        assert!(decoder.feed(b"\x1b[").is_empty());
        assert_eq!(decoder.feed(b"D"), vec![Key::Left]);
    }

    #[test]
    fn multibyte_char_split_across_reads() {
        let mut decoder = KeyDecoder::new();
        let bytes = "é".as_bytes();
        assert!(decoder.feed(&bytes[..1]).is_empty());
        assert_eq!(decoder.feed(&bytes[1..]), vec![Key::Char('é')]);
    }

    #[test]
    fn invalid_utf8_does_not_stall() {
        assert_eq!(decode(&[0xff, b'a']), vec![Key::Unknown, Key::Char('a')]);
    }

    #[test]
    fn alt_combination_is_unknown() {
        assert_eq!(decode(b"\x1bx"), vec![Key::Unknown]);
    }
}
