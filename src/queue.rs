use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// FIFO of submission ids waiting for a worker
///
/// An id stays tracked from `push` until the `JobTicket` handed out by `pop`
/// is dropped, and a tracked id cannot be queued again. This keeps a
/// submission from being judged by two workers at once.
#[derive(Debug, Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct QueueState {
    waiting: VecDeque<i64>,
    tracked: HashSet<i64>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `id`; returns false when it is already queued or running
    pub fn push(&self, id: i64) -> bool {
        {
            let mut state = self.state.lock();
            if !state.tracked.insert(id) {
                return false;
            }
            state.waiting.push_back(id);
        }
        self.notify.notify_one();
        true
    }

    /// Waits for the next id
    pub async fn pop(self: &Arc<Self>) -> JobTicket {
        loop {
            let next = self.state.lock().waiting.pop_front();
            if let Some(id) = next {
                return JobTicket {
                    id,
                    queue: Arc::clone(self),
                };
            }
            self.notify.notified().await;
        }
    }

    /// Removes a queued id that no worker has taken yet
    pub fn cancel_job(&self, id: i64) -> bool {
        let mut state = self.state.lock();
        let before_len = state.waiting.len();
        state.waiting.retain(|&queued| queued != id);
        let removed = before_len != state.waiting.len();
        if removed {
            state.tracked.remove(&id);
        }
        removed
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }

    pub fn is_tracked(&self, id: i64) -> bool {
        self.state.lock().tracked.contains(&id)
    }
}

/// A submission id taken by a worker
#[derive(Debug)]
pub struct JobTicket {
    id: i64,
    queue: Arc<JobQueue>,
}

impl JobTicket {
    pub fn id(&self) -> i64 {
        self.id
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        self.queue.state.lock().tracked.remove(&self.id);
    }
}
