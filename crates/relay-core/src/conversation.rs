use std::collections::VecDeque;

use dashmap::DashMap;

use crate::domain::{Turn, UserId};

/// Per-user rolling conversation history, in memory only.
///
/// Buffers are created lazily on first append and bounded by `max_history`
/// turns; the oldest turn is evicted first, one at a time, which may split a
/// user/assistant pair. Every operation completes under the user's map entry
/// lock and never across an `.await`.
#[derive(Debug)]
pub struct ConversationStore {
    max_history: usize,
    buffers: DashMap<UserId, VecDeque<Turn>>,
}

impl ConversationStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history: max_history.max(1),
            buffers: DashMap::new(),
        }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Snapshot of the user's history, oldest first. Empty history is not an error.
    pub fn get_context(&self, user_id: UserId) -> Vec<Turn> {
        self.buffers
            .get(&user_id)
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn append(&self, user_id: UserId, turn: Turn) {
        let mut buf = self.buffers.entry(user_id).or_default();
        buf.push_back(turn);
        while buf.len() > self.max_history {
            buf.pop_front();
        }
    }

    pub fn clear(&self, user_id: UserId) {
        self.buffers.remove(&user_id);
    }

    pub fn len(&self, user_id: UserId) -> usize {
        self.buffers.get(&user_id).map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, user_id: UserId) -> bool {
        self.len(user_id) == 0
    }
}
