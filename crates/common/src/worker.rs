//! Worker thread launch
//!
//! Spawns a named, long-lived thread and exposes whether it has started
//! running, so a launcher can wait for it with its own retry policy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, ThreadId};
use tracing::debug;

/// A spawned worker thread
pub struct WorkerThread<T> {
    name: String,
    started: Arc<AtomicBool>,
    handle: JoinHandle<T>,
}

impl<T> WorkerThread<T> {
    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the thread has begun running its body
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Id of the spawned thread
    pub fn thread_id(&self) -> ThreadId {
        self.handle.thread().id()
    }

    /// Wait for the thread to exit
    pub fn join(self) -> crate::Result<T> {
        self.handle
            .join()
            .map_err(|_| crate::Error::WorkerPanicked(self.name))
    }
}

/// Spawn a named worker thread
///
/// The started flag is raised on the new thread right before `body` runs.
pub fn spawn_worker<F, T>(name: &str, body: F) -> crate::Result<WorkerThread<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let started = Arc::new(AtomicBool::new(false));
    let flag = started.clone();

    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            flag.store(true, Ordering::Release);
            body()
        })?;

    debug!("Spawned worker thread {}", name);

    Ok(WorkerThread {
        name: name.to_string(),
        started,
        handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_worker_reports_started() {
        let worker = spawn_worker("test-worker", || {
            std::thread::current().name().map(str::to_string)
        })
        .unwrap();

        for _ in 0..500 {
            if worker.has_started() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(worker.has_started());
        assert_eq!(worker.name(), "test-worker");
        assert_eq!(worker.join().unwrap().as_deref(), Some("test-worker"));
    }

    #[test]
    fn test_join_reports_panic() {
        let worker = spawn_worker("panicking-worker", || -> u32 { panic!("boom") }).unwrap();
        let result = worker.join();
        assert!(matches!(result, Err(crate::Error::WorkerPanicked(name)) if name == "panicking-worker"));
    }
}
