//! Bounded history of successful inference responses

use serde::Serialize;

/// Recent model responses, oldest first.
///
/// Grows to `2 * max_history` entries and is then cut back to the newest
/// `max_history` in one step, so trimming happens once per `max_history`
/// appends rather than on every append. Readers only ever see the newest
/// `max_history` entries.
#[derive(Debug, Clone)]
pub struct ResponseHistory {
    entries: Vec<String>,
    max_history: usize,
}

/// Summary reported to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistorySummary {
    pub enabled: bool,
    pub max_history: usize,
    pub current_count: usize,
    pub history: Vec<String>,
}

impl ResponseHistory {
    pub fn new(max_history: usize) -> Self {
        let max_history = max_history.max(1);
        Self { entries: Vec::with_capacity(max_history * 2 + 1), max_history }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Hard cap on stored entries
    pub fn capacity(&self) -> usize {
        self.max_history * 2
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a response, batch-trimming once the cap is exceeded
    pub fn push(&mut self, entry: String) {
        self.entries.push(entry);
        if self.entries.len() > self.capacity() {
            let excess = self.entries.len() - self.max_history;
            self.entries.drain(..excess);
        }
    }

    /// Newest `max_history` entries, newest first
    pub fn recent(&self) -> Vec<String> {
        self.entries.iter().rev().take(self.max_history).cloned().collect()
    }

    /// Newest `max_history` entries, oldest first
    pub fn window(&self) -> Vec<String> {
        let start = self.entries.len().saturating_sub(self.max_history);
        self.entries[start..].to_vec()
    }

    /// Remove everything, returning how many entries were dropped
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
