//! Character-reveal animation for output lines.

use std::collections::VecDeque;

use unicode_segmentation::UnicodeSegmentation;

use super::viewport::Viewport;

pub fn truncation_marker(dropped: usize) -> String {
    format!("… {dropped} earlier lines truncated …")
}

#[derive(Debug, Clone)]
struct ActiveLine {
    text: String,
    /// Byte offset just past each grapheme cluster.
    ends: Vec<usize>,
    revealed: usize,
}

impl ActiveLine {
    fn new(text: String) -> Self {
        let ends = text
            .grapheme_indices(true)
            .map(|(start, g)| start + g.len())
            .collect();
        Self {
            text,
            ends,
            revealed: 0,
        }
    }

    fn prefix(&self) -> &str {
        match self.revealed {
            0 => "",
            n => &self.text[..self.ends[n - 1]],
        }
    }

    fn is_done(&self) -> bool {
        self.revealed >= self.ends.len()
    }
}

/// Queue of lines waiting to be revealed, plus the line being revealed.
///
/// The active line owns the last row of the viewport: a blank placeholder is
/// pushed when it starts and rewritten in place on every tick.
#[derive(Debug, Clone)]
pub struct Typewriter {
    queue: VecDeque<String>,
    active: Option<ActiveLine>,
    step: usize,
    cap: usize,
    dropped: usize,
    marker_at_front: bool,
}

impl Typewriter {
    pub fn new(step: usize, cap: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            active: None,
            step: step.max(1),
            cap: cap.max(1),
            dropped: 0,
            marker_at_front: false,
        }
    }

    pub fn enqueue<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for line in lines {
            let line: String = line.into();
            for part in line.split('\n') {
                self.queue.push_back(part.trim_end_matches('\r').to_string());
            }
        }
        self.enforce_cap();
    }

    fn enforce_cap(&mut self) {
        if self.queue.len() <= self.cap {
            return;
        }
        if self.marker_at_front {
            self.queue.pop_front();
        }
        // Leave one slot for the marker itself.
        while self.queue.len() > self.cap - 1 {
            self.queue.pop_front();
            self.dropped += 1;
        }
        self.queue.push_front(truncation_marker(self.dropped));
        self.marker_at_front = true;
    }

    /// Reveal the next `step` clusters. Returns whether the viewport changed.
    pub fn advance(&mut self, viewport: &mut Viewport) -> bool {
        if self.active.is_none() {
            let Some(next) = self.queue.pop_front() else {
                return false;
            };
            self.take_marker();
            viewport.push("");
            self.active = Some(ActiveLine::new(next));
        }

        let Some(active) = self.active.as_mut() else {
            return false;
        };
        active.revealed = (active.revealed + self.step).min(active.ends.len());
        viewport.replace_last(active.prefix());
        if active.is_done() {
            self.active = None;
        }
        true
    }

    /// Finish the active line and append everything queued, verbatim.
    pub fn flush(&mut self, viewport: &mut Viewport) -> bool {
        let mut changed = false;
        if let Some(active) = self.active.take() {
            viewport.replace_last(&active.text);
            changed = true;
        }
        for line in self.queue.drain(..) {
            viewport.push(&line);
            changed = true;
        }
        self.take_marker();
        changed
    }

    fn take_marker(&mut self) {
        self.marker_at_front = false;
        self.dropped = 0;
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some() || !self.queue.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}
