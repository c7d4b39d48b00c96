//! Shared worker status registry.
//!
//! One board is shared by every worker in the process. Status writes happen
//! from worker tasks and reads from the operational surface, so the whole
//! board sits behind a single mutex. Next to the live view the board keeps
//! an append-only, timestamped log of transitions; setting a status equal
//! to the current one is a no-op so each transition is logged exactly once.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

pub const STATUS_NONE: &str = "none";
pub const STATUS_ADDED: &str = "added";
pub const STATUS_STARTED: &str = "started";
pub const STATUS_INITIALIZED: &str = "initialized";
pub const STATUS_INIT_FAILED: &str = "initialization failed";
pub const STATUS_TERMINATING: &str = "terminating";
pub const STATUS_TERMINATED: &str = "terminated";

/// Live status of one worker and its subworkers.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub name: String,
    pub status: String,
    pub subworkers: HashMap<String, String>,
}

impl WorkerStatus {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: STATUS_NONE.to_string(),
            subworkers: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct BoardInner {
    workers: HashMap<String, WorkerStatus>,
    log: Vec<String>,
}

/// Process-wide status board.
#[derive(Default)]
pub struct StatusBoard {
    inner: Mutex<BoardInner>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_worker_status(&self, worker: &str, status: &str) {
        let mut inner = self.lock();
        let entry = inner
            .workers
            .entry(worker.to_string())
            .or_insert_with(|| WorkerStatus::new(worker));
        if entry.status == status {
            return;
        }
        entry.status = status.to_string();
        let line = format!("{} Worker {}: {}.", timestamp(), worker, status);
        inner.log.push(line);
    }

    pub fn set_subworker_status(&self, worker: &str, subworker: &str, status: &str) {
        let mut inner = self.lock();
        let entry = inner
            .workers
            .entry(worker.to_string())
            .or_insert_with(|| WorkerStatus::new(worker));
        let previous = entry
            .subworkers
            .insert(subworker.to_string(), status.to_string());
        if previous.as_deref() == Some(status) {
            return;
        }
        let line = format!(
            "{} Worker {} subworker {}: {}.",
            timestamp(),
            worker,
            subworker,
            status
        );
        inner.log.push(line);
    }

    pub fn worker_status(&self, worker: &str) -> Option<String> {
        self.lock().workers.get(worker).map(|w| w.status.clone())
    }

    pub fn subworker_status(&self, worker: &str, subworker: &str) -> Option<String> {
        self.lock()
            .workers
            .get(worker)
            .and_then(|w| w.subworkers.get(subworker).cloned())
    }

    /// Snapshot of every worker's status.
    pub fn all(&self) -> Vec<WorkerStatus> {
        let inner = self.lock();
        let mut all: Vec<WorkerStatus> = inner.workers.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Full transition log, oldest first.
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BoardInner> {
        // A poisoned board means a panic mid-write of a String field; the
        // data is still a consistent map, so keep serving it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_logged_once() {
        let board = StatusBoard::new();
        board.set_worker_status("agreement", STATUS_STARTED);
        board.set_worker_status("agreement", STATUS_INITIALIZED);
        board.set_worker_status("agreement", STATUS_INITIALIZED);

        assert_eq!(
            board.worker_status("agreement").as_deref(),
            Some(STATUS_INITIALIZED)
        );
        let log = board.log();
        assert_eq!(log.len(), 2);
        assert!(log[0].contains("Worker agreement: started."));
        assert!(log[1].contains("Worker agreement: initialized."));
    }

    #[test]
    fn subworker_status_is_scoped_to_parent() {
        let board = StatusBoard::new();
        board.set_subworker_status("agreement", "heartbeat", STATUS_ADDED);
        board.set_subworker_status("agreement", "heartbeat", STATUS_STARTED);

        assert_eq!(
            board.subworker_status("agreement", "heartbeat").as_deref(),
            Some(STATUS_STARTED)
        );
        assert_eq!(board.subworker_status("other", "heartbeat"), None);
        // Parent entry is created implicitly with no status of its own.
        assert_eq!(board.worker_status("agreement").as_deref(), Some(STATUS_NONE));
    }

    #[test]
    fn snapshot_is_sorted_by_name() {
        let board = StatusBoard::new();
        board.set_worker_status("b", STATUS_STARTED);
        board.set_worker_status("a", STATUS_STARTED);
        let names: Vec<String> = board.all().into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
