//! In-process queue with call accounting, for tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Message, WorkQueue};
use crate::error::CloudError;

#[derive(Debug)]
struct Entry {
    id: String,
    body: String,
    visible_at: Instant,
    receives: u32,
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<Entry>,
    next_id: u64,
    deleted: Vec<String>,
    visibility_changes: HashMap<String, Vec<Duration>>,
    failing_reads: u32,
}

/// Queue held in memory.
///
/// Records every visibility change and deletion so tests can assert on
/// the exact conversation a consumer had with the queue.
#[derive(Debug)]
pub struct MemoryQueue {
    visibility_timeout: Duration,
    state: Mutex<State>,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Push a message and return its id.
    pub fn enqueue(&self, body: &str) -> String {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("msg-{}", state.next_id);
        state.entries.push(Entry {
            id: id.clone(),
            body: body.to_string(),
            visible_at: Instant::now(),
            receives: 0,
        });
        id
    }

    /// Make the next `n` reads fail with a transport error.
    pub fn fail_next_reads(&self, n: u32) {
        self.state().failing_reads = n;
    }

    /// How many times `id` has been delivered.
    pub fn receive_count(&self, id: &str) -> u32 {
        self.state()
            .entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.receives)
            .unwrap_or(0)
    }

    pub fn is_deleted(&self, id: &str) -> bool {
        self.state().deleted.iter().any(|d| d == id)
    }

    /// Every timeout passed to `change_visibility` for `id`, in order.
    pub fn visibility_changes(&self, id: &str) -> Vec<Duration> {
        self.state()
            .visibility_changes
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `id` would be handed out by the next read.
    pub fn is_visible(&self, id: &str) -> bool {
        let now = Instant::now();
        self.state()
            .entries
            .iter()
            .any(|e| e.id == id && e.visible_at <= now)
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn read(&self) -> Result<Option<Message>, CloudError> {
        let mut state = self.state();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(CloudError::Transport {
                service: "memory-queue",
                message: "injected read failure".to_string(),
            });
        }

        let now = Instant::now();
        let timeout = self.visibility_timeout;
        Ok(state
            .entries
            .iter_mut()
            .find(|e| e.visible_at <= now)
            .map(|entry| {
                entry.visible_at = now + timeout;
                entry.receives += 1;
                Message {
                    id: entry.id.clone(),
                    receipt: format!("{}#{}", entry.id, entry.receives),
                    body: entry.body.clone(),
                }
            }))
    }

    async fn change_visibility(
        &self,
        message: &Message,
        timeout: Duration,
    ) -> Result<(), CloudError> {
        let mut state = self.state();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == message.id)
            .ok_or_else(|| CloudError::NotFound(format!("message {}", message.id)))?;
        entry.visible_at = Instant::now() + timeout;
        state
            .visibility_changes
            .entry(message.id.clone())
            .or_default()
            .push(timeout);
        Ok(())
    }

    async fn delete(&self, message: &Message) -> Result<(), CloudError> {
        let mut state = self.state();
        state.entries.retain(|e| e.id != message.id);
        state.deleted.push(message.id.clone());
        Ok(())
    }

    async fn push(&self, body: &str) -> Result<(), CloudError> {
        self.enqueue(body);
        Ok(())
    }

    async fn count(&self) -> Result<u64, CloudError> {
        Ok(self.len() as u64)
    }

    async fn clear(&self) -> Result<(), CloudError> {
        self.state().entries.clear();
        Ok(())
    }

    async fn destroy(&self) -> Result<(), CloudError> {
        self.clear().await
    }

    fn describe(&self) -> String {
        "memory://queue".to_string()
    }
}
