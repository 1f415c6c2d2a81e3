//! Fixed-capacity ring of the most recent output lines of a sub-agent.

use std::collections::VecDeque;

use parking_lot::Mutex;

const REDACTED: &str = "***";

#[derive(Debug)]
pub struct RingLog {
    capacity: usize,
    redact_words: Vec<String>,
    lines: Mutex<VecDeque<String>>,
}

impl RingLog {
    pub fn new(capacity: usize, redact_words: Vec<String>) -> Self {
        let redact_words = redact_words.into_iter().filter(|w| !w.is_empty()).collect();
        Self {
            capacity: capacity.max(1),
            redact_words,
            lines: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Append a line, evicting the oldest one when full.
    pub fn push(&self, line: &str) {
        let line = self.redact(line);
        let mut lines = self.lines.lock();
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Up to `limit` most recent lines, oldest first. `0` means all.
    pub fn tail(&self, limit: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = if limit == 0 {
            0
        } else {
            lines.len().saturating_sub(limit)
        };
        lines.iter().skip(skip).cloned().collect()
    }

    fn redact(&self, line: &str) -> String {
        self.redact_words
            .iter()
            .fold(line.to_string(), |acc, word| acc.replace(word.as_str(), REDACTED))
    }
}
