//! Recently seen inbound message ids.
//!
//! Meta redelivers a webhook when it does not get a timely 200; remembering the last few
//! message ids keeps a redelivery from producing a second reply. In-memory and per process.

use std::collections::{HashSet, VecDeque};
use tokio::sync::RwLock;

/// Bounded set of message ids; the oldest id is forgotten once `capacity` is reached.
pub struct SeenMessages {
    capacity: usize,
    inner: RwLock<Window>,
}

#[derive(Default)]
struct Window {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenMessages {
    /// A window remembering up to `capacity` ids. Capacity 0 never reports a duplicate.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(Window::default()),
        }
    }

    /// Record `id`; returns false if it was already in the window.
    pub async fn first_sighting(&self, id: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        let mut w = self.inner.write().await;
        if w.ids.contains(id) {
            return false;
        }
        if w.order.len() >= self.capacity {
            if let Some(oldest) = w.order.pop_front() {
                w.ids.remove(&oldest);
            }
        }
        w.order.push_back(id.to_string());
        w.ids.insert(id.to_string());
        true
    }

    /// Drop `id` from the window so a redelivery is processed again.
    pub async fn forget(&self, id: &str) {
        let mut w = self.inner.write().await;
        if w.ids.remove(id) {
            w.order.retain(|seen| seen != id);
        }
    }
}
