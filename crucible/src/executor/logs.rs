//! Bounded stdout/stderr capture.

/// Accumulates log lines up to a byte budget. Once the budget is exhausted
/// further lines are dropped and a single truncation marker is appended, so
/// a runaway container cannot blow up job records.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    buf: String,
    limit: usize,
    truncated: bool,
}

const TRUNCATION_MARKER: &str = "[log truncated]";

impl LogBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Appends one line, newline-terminated.
    pub fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.buf.len() + line.len() + 1 > self.limit {
            self.truncated = true;
            if !self.buf.is_empty() && !self.buf.ends_with('\n') {
                self.buf.push('\n');
            }
            self.buf.push_str(TRUNCATION_MARKER);
            return;
        }
        self.buf.push_str(line);
        self.buf.push('\n');
    }

    /// Appends many lines.
    pub fn extend<'a>(&mut self, lines: impl IntoIterator<Item = &'a str>) {
        for line in lines {
            self.push_line(line);
        }
    }

    /// The captured text.
    pub fn contents(&self) -> &str {
        &self.buf
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// The final lines of the capture, joined, for short error messages.
    pub fn tail(&self, max_lines: usize) -> String {
        let lines: Vec<&str> = self.buf.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_preserved_verbatim_within_budget() {
        let mut buf = LogBuffer::new(1024);
        buf.push_line("first");
        buf.push_line("second");
        assert_eq!(buf.contents(), "first\nsecond\n");
        assert!(!buf.is_truncated());
    }

    #[test]
    fn test_truncates_at_budget() {
        let mut buf = LogBuffer::new(12);
        buf.push_line("0123456789"); // 11 bytes with newline
        buf.push_line("overflow");
        assert!(buf.is_truncated());
        assert!(buf.contents().contains("[log truncated]"));
        // Dropped lines stay dropped.
        buf.push_line("more");
        assert_eq!(buf.contents().matches("more").count(), 0);
    }

    #[test]
    fn test_tail() {
        let mut buf = LogBuffer::new(1024);
        for i in 0..5 {
            buf.push_line(&format!("line-{i}"));
        }
        assert_eq!(buf.tail(2), "line-3\nline-4");
    }
}
