//! The hand-off list: ingress handlers append, the scheduler drains.

use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

use crate::engine::bridge::Bridge;

pub struct Handoff {
    pending: Mutex<VecDeque<Bridge>>,
    notify: Notify,
}

impl Handoff {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, bridge: Bridge) {
        self.pending.lock().await.push_back(bridge);
        self.notify.notify_one();
    }

    /// Removes and returns every pending bridge, oldest first.
    pub async fn drain(&self) -> Vec<Bridge> {
        let mut pending = self.pending.lock().await;
        pending.drain(..).collect()
    }

    /// Resolves when a push has happened since the last drain. A push that
    /// races ahead of the wait is not lost: `notify_one` stores a permit.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

impl Default for Handoff {
    fn default() -> Self {
        Self::new()
    }
}
