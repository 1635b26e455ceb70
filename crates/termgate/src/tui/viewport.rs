//! Bounded, scrollable line buffer.

use std::collections::VecDeque;

/// Scrollback window over a capped line buffer.
///
/// `top` is the index of the first visible line. When the buffer overflows
/// the oldest lines are trimmed and `top` shifts by the same amount, so the
/// visible window keeps showing the same content without a repaint.
#[derive(Debug, Clone)]
pub struct Viewport {
    lines: VecDeque<String>,
    max_lines: usize,
    top: usize,
    width: usize,
    height: usize,
    follow: bool,
    pushed_total: u64,
}

impl Viewport {
    pub fn new(max_lines: usize, width: usize, height: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            max_lines: max_lines.max(1),
            top: 0,
            width: width.max(1),
            height: height.max(1),
            follow: true,
            pushed_total: 0,
        }
    }

    /// Append text, one buffer entry per `\n`-separated line.
    pub fn push(&mut self, text: &str) {
        for line in text.split('\n') {
            self.push_line(line.trim_end_matches('\r').to_string());
        }
    }

    fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        self.pushed_total += 1;

        if self.lines.len() > self.max_lines {
            let excess = self.lines.len() - self.max_lines;
            self.lines.drain(..excess);
            self.top = self.top.saturating_sub(excess);
        }

        if self.follow {
            self.top = self.max_top();
        }
        self.clamp();
    }

    /// Rewrite the newest line in place.
    pub fn replace_last(&mut self, line: &str) {
        match self.lines.back_mut() {
            Some(last) => {
                last.clear();
                last.push_str(line);
            }
            None => self.push_line(line.to_string()),
        }
    }

    /// Drop every line and return to follow mode.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.top = 0;
        self.follow = true;
    }

    pub fn set_size(&mut self, width: usize, height: usize) {
        self.width = width.max(1);
        self.height = height.max(1);
        if self.follow {
            self.top = self.max_top();
        }
        self.clamp();
    }

    pub fn scroll_up(&mut self, n: usize) {
        self.top = self.top.saturating_sub(n);
        self.follow = self.top >= self.max_top();
    }

    pub fn scroll_down(&mut self, n: usize) {
        self.top = self.top.saturating_add(n);
        self.clamp();
        self.follow = self.top >= self.max_top();
    }

    pub fn page_up(&mut self) {
        self.scroll_up(self.height);
    }

    pub fn page_down(&mut self) {
        self.scroll_down(self.height);
    }

    pub fn to_top(&mut self) {
        self.top = 0;
        self.follow = self.max_top() == 0;
    }

    pub fn to_bottom(&mut self) {
        self.top = self.max_top();
        self.follow = true;
    }

    pub fn max_top(&self) -> usize {
        self.lines.len().saturating_sub(self.height)
    }

    fn clamp(&mut self) {
        self.top = self.top.min(self.max_top());
    }

    /// Lines currently inside the window, top to bottom.
    pub fn visible(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .skip(self.top)
            .take(self.height)
            .map(String::as_str)
    }

    /// Lines pushed since `mark` (a previous `pushed_total`) that are still buffered.
    pub fn lines_since(&self, mark: u64) -> impl Iterator<Item = &str> {
        let first_abs = self.pushed_total - self.lines.len() as u64;
        let skip = mark.saturating_sub(first_abs) as usize;
        self.lines.iter().skip(skip).map(String::as_str)
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn top(&self) -> usize {
        self.top
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    pub fn is_following(&self) -> bool {
        self.follow
    }

    /// Count of lines ever pushed, including trimmed ones.
    pub fn pushed_total(&self) -> u64 {
        self.pushed_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(max: usize, height: usize, count: usize) -> Viewport {
        let mut vp = Viewport::new(max, 80, height);
        for i in 0..count {
            vp.push(&format!("line {i}"));
        }
        vp
    }

    #[test]
    fn follows_tail_by_default() {
        let vp = filled(100, 3, 10);
        let visible: Vec<_> = vp.visible().collect();
        assert_eq!(visible, vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn overflow_trims_oldest_first() {
        let vp = filled(5, 3, 12);
        assert_eq!(vp.len(), 5);
        assert_eq!(vp.lines().next(), Some("line 7"));
        assert_eq!(vp.pushed_total(), 12);
    }

    #[test]
    fn trimming_shifts_scroll_offset() {
        let mut vp = filled(6, 2, 6);
        vp.to_top();
        vp.scroll_down(3);
        assert_eq!(vp.visible().next(), Some("line 3"));

        vp.push("line 6");
        vp.push("line 7");
        // Two lines trimmed from the front, window still shows the same content.
        assert_eq!(vp.top(), 1);
        assert_eq!(vp.visible().next(), Some("line 3"));
        assert!(!vp.is_following());
    }

    #[test]
    fn scrolling_back_to_bottom_resumes_follow() {
        let mut vp = filled(100, 3, 10);
        vp.scroll_up(2);
        assert!(!vp.is_following());
        vp.push("new");
        assert_eq!(vp.visible().last(), Some("line 7"));

        vp.to_bottom();
        assert!(vp.is_following());
        assert_eq!(vp.visible().last(), Some("new"));
    }

    #[test]
    fn scroll_is_clamped() {
        let mut vp = filled(100, 4, 6);
        vp.scroll_down(100);
        assert_eq!(vp.top(), 2);
        vp.scroll_up(100);
        assert_eq!(vp.top(), 0);
    }

    #[test]
    fn multiline_push_splits() {
        let mut vp = Viewport::new(10, 80, 5);
        vp.push("a\nb\r\nc");
        assert_eq!(vp.lines().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn lines_since_skips_trimmed() {
        let mut vp = filled(3, 3, 3);
        let mark = vp.pushed_total();
        vp.push("x");
        vp.push("y");
        assert_eq!(vp.lines_since(mark).collect::<Vec<_>>(), vec!["x", "y"]);
        assert_eq!(vp.lines_since(0).count(), 3);
    }

    #[test]
    fn clear_keeps_running_total() {
        let mut vp = filled(10, 3, 4);
        let mark = vp.pushed_total();
        vp.clear();
        vp.push("fresh");
        assert_eq!(vp.lines_since(mark).collect::<Vec<_>>(), vec!["fresh"]);
    }
}
