use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::routes::JudgeRequest;

/// A judge request paired with the installed snapshot it must be judged
/// against. Workers treat the snapshot path as read-only.
#[derive(Debug)]
pub struct JudgeJob {
    pub request: JudgeRequest,
    pub task_info_path: PathBuf,
}

/// Shared FIFO between the intake/cache side and the judge workers.
#[derive(Default)]
pub struct JudgeQueue {
    queue: Mutex<VecDeque<JudgeJob>>,
    notify: Notify,
}

impl JudgeQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, job: JudgeJob) {
        self.queue.lock().unwrap().push_back(job);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> JudgeJob {
        loop {
            if let Some(job) = self.queue.lock().unwrap().pop_front() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
