//! Ledger of directory records this process created.
//!
//! Every record a host creates lands here before anything else can fail, so
//! teardown always knows what to clean up. Entries leave the ledger in
//! exactly two ways: a successful rollback delete retires one early, and the
//! shutdown drain empties whatever is left.

use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct RecordLedger {
    entries: VecDeque<String>,
}

impl RecordLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record_id: impl Into<String>) {
        self.entries.push_back(record_id.into());
    }

    /// Removes one entry matching `record_id`, if present.
    pub fn retire(&mut self, record_id: &str) -> bool {
        match self.entries.iter().position(|entry| entry == record_id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Oldest entry first, for the teardown drain.
    pub fn pop(&mut self) -> Option<String> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
