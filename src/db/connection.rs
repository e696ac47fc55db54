use std::{
    path::PathBuf,
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::migrations::run_migrations;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

/// Where the worker opens its connection.
#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

impl Location {
    fn open(&self) -> Result<Connection> {
        let conn = match self {
            Location::File(path) => Connection::open(path)
                .with_context(|| format!("failed to open SQLite database {}", path.display()))?,
            Location::Memory => {
                Connection::open_in_memory().context("failed to open in-memory SQLite database")?
            }
        };
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to set busy timeout")?;
        if let Location::File(_) = self {
            if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                warn!("Annotation store stays in rollback journal mode: {err}");
            }
        }
        Ok(conn)
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::File(path) => write!(f, "{}", path.display()),
            Location::Memory => f.write_str(":memory:"),
        }
    }
}

struct Worker {
    sender: mpsc::Sender<Message>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };
        if self.sender.send(Message::Stop).is_err() {
            error!("Annotation store worker already gone at shutdown");
        }
        if handle.join().is_err() {
            error!("Annotation store worker panicked");
        }
    }
}

/// Opens the connection, migrates, reports readiness, then serves jobs until stopped.
fn serve(location: Location, ready: mpsc::Sender<Result<()>>, jobs: mpsc::Receiver<Message>) {
    let mut conn = match location.open().and_then(|mut conn| {
        run_migrations(&mut conn).context("failed to run database migrations")?;
        Ok(conn)
    }) {
        Ok(conn) => conn,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    while let Ok(Message::Run(job)) = jobs.recv() {
        job(&mut conn);
    }
    info!("Annotation store worker for {location} stopped");
}

/// Handle to the SQLite store. One worker thread owns the connection and runs
/// jobs in submission order; clones share that worker.
#[derive(Clone)]
pub struct Database {
    worker: Arc<Worker>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
        Self::spawn(Location::File(db_path))
    }

    /// Private, non-persistent store. Each call gets its own database.
    pub fn in_memory() -> Result<Self> {
        Self::spawn(Location::Memory)
    }

    fn spawn(location: Location) -> Result<Self> {
        let (sender, jobs) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let label = location.to_string();

        let thread = thread::Builder::new()
            .name("imaging-db".into())
            .spawn(move || serve(location, ready_tx, jobs))
            .context("failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;
        info!("Annotation store ready at {label}");

        Ok(Self {
            worker: Arc::new(Worker {
                sender,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    /// Runs `task` on the worker thread and awaits its result.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            // The caller may have given up waiting.
            let _ = reply_tx.send(task(conn));
        });

        self.worker
            .sender
            .send(Message::Run(job))
            .map_err(|_| anyhow!("annotation store worker is not running"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("annotation store worker dropped the request"))?
    }
}
