//! Per-collection worker registry.
//!
//! Every collection path gets one dedicated OS thread consuming a FIFO
//! job queue; all database access for that collection happens on that
//! thread, which is the server's entire concurrency story. Submitting a
//! job blocks on a private reply channel until the worker answers —
//! errors cross the boundary as values and are returned on the caller's
//! stack, never re-thrown inside the worker.
//!
//! A background monitor scans the registry and closes the collection of
//! any worker that has sat idle with an empty queue past the configured
//! threshold; the worker itself keeps running and reopens the collection
//! on its next job. A job that panics tears its worker down after the
//! caller has been answered; the next lookup for that path spawns a
//! replacement.

use crate::error::{ServerError, ServerResult};
use cardbox_core::Collection;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A job returns true when it panicked, telling the worker loop to tear
/// itself down after the caller has been answered.
type Job = Box<dyn FnOnce(&mut WorkerState) -> bool + Send>;

enum Command {
    Run { operation: &'static str, job: Job },
    Close,
    Stop,
}

struct WorkerState {
    path: PathBuf,
    collection: Option<Collection>,
}

impl WorkerState {
    /// The live collection, opened lazily on first use.
    fn collection(&mut self) -> ServerResult<&mut Collection> {
        if self.collection.is_none() {
            self.collection = Some(Collection::open(&self.path)?);
        }
        match self.collection.as_mut() {
            Some(col) => Ok(col),
            None => Err(ServerError::Internal("collection missing after open".into())),
        }
    }
}

/// One collection's dedicated worker.
pub struct CollectionWorker {
    path: PathBuf,
    sender: mpsc::Sender<Command>,
    pending: Arc<AtomicUsize>,
    collection_open: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    last_active: Arc<Mutex<Instant>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CollectionWorker {
    fn spawn(path: PathBuf) -> ServerResult<Arc<Self>> {
        let (sender, receiver) = mpsc::channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let collection_open = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));

        let state = WorkerState {
            path: path.clone(),
            collection: None,
        };
        let loop_pending = Arc::clone(&pending);
        let loop_open = Arc::clone(&collection_open);
        let loop_alive = Arc::clone(&alive);
        let handle = thread::Builder::new()
            .name("collection-worker".into())
            .spawn(move || worker_loop(state, receiver, loop_pending, loop_open, loop_alive))?;

        Ok(Arc::new(Self {
            path,
            sender,
            pending,
            collection_open,
            alive,
            last_active: Arc::new(Mutex::new(Instant::now())),
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// The collection path this worker serves.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs a job against the collection and blocks for its result.
    ///
    /// The job's error, if any, is returned here on the caller's stack.
    /// A panicking job comes back as [`ServerError::WorkerFailed`] and
    /// retires the worker.
    pub fn execute<R, F>(&self, operation: &'static str, f: F) -> ServerResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Collection) -> ServerResult<R> + Send + 'static,
    {
        let (reply, result) = mpsc::sync_channel(1);
        let job: Job = Box::new(move |state| {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                state.collection().and_then(|col| f(col))
            }));
            let (value, panicked) = match outcome {
                Ok(value) => (value, false),
                Err(_) => (
                    Err(ServerError::WorkerFailed {
                        operation: operation.into(),
                    }),
                    true,
                ),
            };
            let _ = reply.send(value);
            panicked
        });

        *self.last_active.lock() = Instant::now();
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(Command::Run { operation, job }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ServerError::WorkerGone);
        }
        result.recv().map_err(|_| ServerError::WorkerGone)?
    }

    /// Asks the worker to close its collection without stopping. Fire
    /// and forget; used by the idle monitor.
    pub fn request_close(&self) {
        let _ = self.sender.send(Command::Close);
    }

    /// Stops the worker and waits for its thread to finish.
    pub fn stop(&self) {
        let _ = self.sender.send(Command::Stop);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// False once the worker thread has exited.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// True while the worker holds an open collection.
    pub fn collection_open(&self) -> bool {
        self.collection_open.load(Ordering::SeqCst)
    }

    /// True when no jobs are queued or running.
    pub fn queue_is_empty(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }

    /// Time since the last job submission.
    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }
}

fn worker_loop(
    mut state: WorkerState,
    receiver: mpsc::Receiver<Command>,
    pending: Arc<AtomicUsize>,
    collection_open: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
) {
    debug!(path = %state.path.display(), "collection worker started");
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Run { operation, job } => {
                let panicked = job(&mut state);
                pending.fetch_sub(1, Ordering::SeqCst);
                collection_open.store(state.collection.is_some(), Ordering::SeqCst);
                if panicked {
                    error!(
                        operation,
                        path = %state.path.display(),
                        "job panicked; retiring worker"
                    );
                    break;
                }
            }
            Command::Close => {
                if state.collection.take().is_some() {
                    info!(path = %state.path.display(), "closed idle collection");
                }
                collection_open.store(false, Ordering::SeqCst);
            }
            Command::Stop => break,
        }
    }
    state.collection.take();
    collection_open.store(false, Ordering::SeqCst);
    alive.store(false, Ordering::SeqCst);
    debug!(path = %state.path.display(), "collection worker stopped");
}

/// The registry of per-collection workers.
///
/// Worker creation is idempotent per path — the registry lock makes the
/// first caller win — and a worker retired by a panic is transparently
/// replaced at the next lookup.
pub struct CollectionManager {
    workers: Mutex<HashMap<PathBuf, Arc<CollectionWorker>>>,
    monitor_inactivity: Duration,
    shutting_down: AtomicBool,
}

impl CollectionManager {
    /// Creates the registry and starts its idle monitor.
    pub fn new(monitor_frequency: Duration, monitor_inactivity: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            workers: Mutex::new(HashMap::new()),
            monitor_inactivity,
            shutting_down: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&manager);
        let spawned = thread::Builder::new()
            .name("collection-monitor".into())
            .spawn(move || monitor_loop(weak, monitor_frequency));
        if let Err(err) = spawned {
            warn!(%err, "could not start idle monitor; collections stay open");
        }
        manager
    }

    /// The worker for a collection path, spawning or replacing as
    /// needed.
    pub fn worker_for(&self, path: &Path) -> ServerResult<Arc<CollectionWorker>> {
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.get(path) {
            if worker.is_alive() {
                return Ok(Arc::clone(worker));
            }
            warn!(path = %path.display(), "replacing retired collection worker");
        }
        let worker = CollectionWorker::spawn(path.to_path_buf())?;
        workers.insert(path.to_path_buf(), Arc::clone(&worker));
        Ok(worker)
    }

    /// The number of registered workers.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Drains and stops every worker.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let workers: Vec<_> = self.workers.lock().drain().map(|(_, w)| w).collect();
        for worker in workers {
            worker.stop();
        }
        info!("collection manager shut down");
    }
}

fn monitor_loop(manager: Weak<CollectionManager>, frequency: Duration) {
    loop {
        thread::sleep(frequency);
        let Some(manager) = manager.upgrade() else {
            return;
        };
        if manager.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let workers: Vec<_> = manager.workers.lock().values().cloned().collect();
        for worker in workers {
            if worker.is_alive()
                && worker.collection_open()
                && worker.queue_is_empty()
                && worker.idle_for() >= manager.monitor_inactivity
            {
                info!(path = %worker.path().display(), "closing collection on idle worker");
                worker.request_close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, Arc<CollectionManager>) {
        let dir = TempDir::new().unwrap();
        let manager = CollectionManager::new(Duration::from_secs(3600), Duration::from_secs(3600));
        (dir, manager)
    }

    #[test]
    fn execute_returns_job_result() {
        let (dir, manager) = manager();
        let path = dir.path().join("a").join("collection.db");
        let worker = manager.worker_for(&path).unwrap();

        let usn = worker.execute("usn", |col| Ok(col.usn()?)).unwrap();
        assert_eq!(usn, 0);
        manager.shutdown();
    }

    #[test]
    fn worker_per_path_is_idempotent() {
        let (dir, manager) = manager();
        let path = dir.path().join("a").join("collection.db");
        let first = manager.worker_for(&path).unwrap();
        let second = manager.worker_for(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.worker_count(), 1);

        let other = manager.worker_for(&dir.path().join("b").join("collection.db"));
        assert!(other.is_ok());
        assert_eq!(manager.worker_count(), 2);
        manager.shutdown();
    }

    #[test]
    fn jobs_serialize_on_one_worker() {
        let (dir, manager) = manager();
        let path = dir.path().join("a").join("collection.db");
        let worker = manager.worker_for(&path).unwrap();

        let threads: Vec<_> = (0..32)
            .map(|_| {
                let worker = Arc::clone(&worker);
                thread::spawn(move || {
                    worker
                        .execute("increment", |col| {
                            col.increment_usn()?;
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let usn = worker.execute("usn", |col| Ok(col.usn()?)).unwrap();
        assert_eq!(usn, 32);
        manager.shutdown();
    }

    #[test]
    fn errors_cross_the_worker_boundary_as_values() {
        let (dir, manager) = manager();
        let path = dir.path().join("a").join("collection.db");
        let worker = manager.worker_for(&path).unwrap();

        let result: ServerResult<()> = worker.execute("boom", |_col| {
            Err(ServerError::InvalidRequest("bad payload".into()))
        });
        assert!(matches!(result, Err(ServerError::InvalidRequest(_))));

        // the worker survives an error value
        assert!(worker.is_alive());
        assert!(worker.execute("usn", |col| Ok(col.usn()?)).is_ok());
        manager.shutdown();
    }

    #[test]
    fn panicking_job_retires_worker_and_registry_replaces_it() {
        let (dir, manager) = manager();
        let path = dir.path().join("a").join("collection.db");
        let worker = manager.worker_for(&path).unwrap();

        let result: ServerResult<()> = worker.execute("explode", |_col| panic!("boom"));
        assert!(matches!(result, Err(ServerError::WorkerFailed { .. })));

        // the old worker winds down; a later submission gets a fresh one
        worker.stop();
        assert!(!worker.is_alive());
        let replacement = manager.worker_for(&path).unwrap();
        assert!(!Arc::ptr_eq(&worker, &replacement));
        assert_eq!(replacement.execute("usn", |col| Ok(col.usn()?)).unwrap(), 0);
        manager.shutdown();
    }

    #[test]
    fn idle_monitor_closes_inactive_collection() {
        let dir = TempDir::new().unwrap();
        let manager =
            CollectionManager::new(Duration::from_millis(20), Duration::from_millis(50));
        let path = dir.path().join("a").join("collection.db");
        let worker = manager.worker_for(&path).unwrap();

        worker.execute("touch", |col| Ok(col.usn()?)).unwrap();
        assert!(worker.collection_open());

        // give the monitor a few scan periods
        thread::sleep(Duration::from_millis(300));
        assert!(!worker.collection_open());
        assert!(worker.is_alive());

        // the worker reopens on demand
        assert_eq!(worker.execute("usn", |col| Ok(col.usn()?)).unwrap(), 0);
        manager.shutdown();
    }

    #[test]
    fn shutdown_stops_workers() {
        let (dir, manager) = manager();
        let path = dir.path().join("a").join("collection.db");
        let worker = manager.worker_for(&path).unwrap();
        manager.shutdown();
        assert!(!worker.is_alive());
        assert_eq!(manager.worker_count(), 0);
    }
}
