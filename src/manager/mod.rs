//! Single-flight initialization and query instrumentation.
//!
//! [`DbManager`] shares one [`DbWorker`] between any number of callers.
//! The first caller to ask for a handle pays for initialization; callers
//! arriving while that open sequence is running are parked and resolved
//! with the same handle once it completes, oldest first. Every query run
//! through the manager gets a sequential id, a retained [`QueryRecord`],
//! and a `queryStart` event followed by exactly one of `queryResult` or
//! `queryError`.
//!
//! ```text
//!  caller A ──┐
//!  caller B ──┼── handle() ── single-flight ── DbWorker::init()
//!  caller C ──┘                   │
//!                                 ├── dbInit ─▶ sink
//!                                 └── dbReady ─▶ sink
//!
//!  exec(sql) ── query id ── queryStart ─▶ sink
//!                  │
//!                  └── DbWorker::exec ── queryResult | queryError ─▶ sink
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sqlbridge::config::DbOpts;
//! use sqlbridge::events::EventBus;
//! use sqlbridge::manager::DbManager;
//!
//! let bus = Arc::new(EventBus::default());
//! let opts = DbOpts::new("./data/app.db", "./sqlbridge-worker");
//! let manager = DbManager::spawn(opts, bus.clone()).await?;
//!
//! let response = manager.exec("select 1 as val").await?;
//! manager.terminate().await?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

use crate::config::DbOpts;
use crate::data::{DataSource, FsDataSource};
use crate::events::{DbEvent, EventSink};
use crate::worker::{DbWorker, QueryRows, WorkerError, WorkerResponse, WorkerResult};

// ============================================================================
// Query Records
// ============================================================================

/// Last-known state of one query, keyed by its manager-scoped id.
///
/// Created when the query is dispatched and mutated exactly once when it
/// settles. Records are never deleted, so a query id can be looked up
/// after the fact.
#[derive(Debug, Clone)]
pub struct QueryRecord {
    /// The SQL text as submitted.
    pub sql: String,
    /// True until the query settles.
    pub loading: bool,
    /// Row sets from a successful settlement, empty otherwise.
    pub results: Vec<QueryRows>,
    /// Failure or abort message when the query produced no rows.
    pub error: Option<String>,
}

impl QueryRecord {
    fn started(sql: String) -> Self {
        Self {
            sql,
            loading: true,
            results: Vec::new(),
            error: None,
        }
    }
}

// ============================================================================
// Single-flight window
// ============================================================================

/// Where the current initialization window stands.
enum InitFlight {
    /// Nothing started yet, or the last attempt failed.
    Idle,
    /// An open sequence is running; parked callers resolve when it
    /// settles, in the order they arrived.
    InFlight(Vec<oneshot::Sender<WorkerResult<DbHandle>>>),
    /// The worker answered the open action; handles return synchronously.
    Ready,
}

// ============================================================================
// Handle
// ============================================================================

/// Query access to a worker that has finished initializing.
///
/// Cheap to clone. `exec` here is the raw lifecycle call with no query
/// ids, records, or events; instrumented execution goes through
/// [`DbManager::exec`].
#[derive(Clone)]
pub struct DbHandle {
    worker: Arc<DbWorker>,
}

impl DbHandle {
    /// Run a SQL statement on the worker.
    ///
    /// # Errors
    ///
    /// Propagates lifecycle, transmission, and timeout errors from the
    /// worker layer.
    pub async fn exec(&self, sql: impl Into<String>) -> WorkerResult<WorkerResponse> {
        self.worker.exec(sql).await
    }
}

impl fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbHandle").finish_non_exhaustive()
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Coordinates one worker for many callers.
///
/// Guarantees regardless of caller count: one `dbInit`/`dbReady` pair per
/// successful initialization, monotonically increasing query ids that are
/// never reused (even after a failed initialization window), and exactly
/// one settlement event per started query.
pub struct DbManager {
    worker: Arc<DbWorker>,
    opts: DbOpts,
    sink: Arc<dyn EventSink>,
    flight: Mutex<InitFlight>,
    next_query_id: AtomicU64,
    records: Mutex<BTreeMap<u64, QueryRecord>>,
}

impl DbManager {
    /// Spawn the worker binary named by `opts`, reading the data file
    /// from the filesystem.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker process cannot be spawned.
    pub async fn spawn(opts: DbOpts, sink: Arc<dyn EventSink>) -> WorkerResult<Self> {
        Self::spawn_with_source(opts, Arc::new(FsDataSource), sink).await
    }

    /// Spawn with a custom data source.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker process cannot be spawned.
    pub async fn spawn_with_source(
        opts: DbOpts,
        source: Arc<dyn DataSource>,
        sink: Arc<dyn EventSink>,
    ) -> WorkerResult<Self> {
        let worker = DbWorker::spawn(&opts, source).await?;
        Ok(Self::with_worker(worker, opts, sink))
    }

    /// Wrap an already-constructed worker.
    ///
    /// Tests and embedders use this with a worker connected over an
    /// in-memory transport.
    pub fn with_worker(worker: DbWorker, opts: DbOpts, sink: Arc<dyn EventSink>) -> Self {
        Self {
            worker: Arc::new(worker),
            opts,
            sink,
            flight: Mutex::new(InitFlight::Idle),
            next_query_id: AtomicU64::new(0),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Get a handle to the initialized worker.
    ///
    /// The first caller in a window starts initialization and emits
    /// `dbInit`; once the worker reports ready, `dbReady` is emitted and
    /// every caller parked during the window receives its own clone of
    /// the same handle, in arrival order. Callers after a completed
    /// window return immediately. If initialization fails, the window
    /// resets so a later call may retry; parked callers all receive the
    /// failure.
    ///
    /// # Errors
    ///
    /// Propagates fetch and open failures from the worker layer; parked
    /// callers observe them as [`WorkerError::InitFailed`].
    pub async fn handle(&self) -> WorkerResult<DbHandle> {
        let parked = {
            let mut flight = self.flight.lock().await;
            match &mut *flight {
                InitFlight::Ready => return Ok(self.make_handle()),
                InitFlight::InFlight(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    debug!(waiting = waiters.len(), "parked caller on initialization");
                    Some(rx)
                }
                InitFlight::Idle => {
                    *flight = InitFlight::InFlight(Vec::new());
                    None
                }
            }
        };

        match parked {
            Some(rx) => rx.await.map_err(|_| WorkerError::ChannelClosed)?,
            None => self.run_init().await,
        }
    }

    /// Drive one initialization window: emit `dbInit`, open the database,
    /// emit `dbReady`, then settle parked callers oldest first.
    async fn run_init(&self) -> WorkerResult<DbHandle> {
        self.sink.emit(DbEvent::DbInit {
            data_url: self.opts.data_url.clone(),
            worker_path: self.opts.worker_path.clone(),
        });

        match self.worker.init().await {
            Ok(()) => {
                self.sink.emit(DbEvent::DbReady {
                    data_url: self.opts.data_url.clone(),
                    worker_path: self.opts.worker_path.clone(),
                });

                let waiters = self.close_window(InitFlight::Ready).await;
                info!(shared_with = waiters.len(), "database initialized");
                for waiter in waiters {
                    let _ = waiter.send(Ok(self.make_handle()));
                }
                Ok(self.make_handle())
            }
            Err(e) => {
                let waiters = self.close_window(InitFlight::Idle).await;
                let message = e.to_string();
                for waiter in waiters {
                    let _ = waiter.send(Err(WorkerError::InitFailed(message.clone())));
                }
                Err(e)
            }
        }
    }

    /// Swap the window state and take its parked callers in one step.
    async fn close_window(&self, next: InitFlight) -> Vec<oneshot::Sender<WorkerResult<DbHandle>>> {
        let mut flight = self.flight.lock().await;
        match std::mem::replace(&mut *flight, next) {
            InitFlight::InFlight(waiters) => waiters,
            _ => Vec::new(),
        }
    }

    fn make_handle(&self) -> DbHandle {
        DbHandle {
            worker: self.worker.clone(),
        }
    }

    /// Run a SQL statement with instrumentation.
    ///
    /// Initializes the worker if needed, assigns the next query id,
    /// records the query, emits `queryStart`, awaits the worker, then
    /// emits exactly one of `queryResult` or `queryError` and settles the
    /// record. Worker-reported failures, local errors, and shutdown
    /// aborts all settle as `queryError`; the abort message is
    /// "query aborted".
    ///
    /// # Errors
    ///
    /// Propagates initialization, lifecycle, transmission, and timeout
    /// errors. A worker-reported failure or an abort is an `Ok` response
    /// variant, not an `Err`.
    pub async fn exec(&self, sql: impl Into<String>) -> WorkerResult<WorkerResponse> {
        let sql = sql.into();
        let handle = self.handle().await?;

        let query_id = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        let started_at = Utc::now();
        self.records
            .lock()
            .await
            .insert(query_id, QueryRecord::started(sql.clone()));

        self.sink.emit(DbEvent::QueryStart {
            query_id,
            sql: sql.clone(),
            data_url: self.opts.data_url.clone(),
            worker_path: self.opts.worker_path.clone(),
            started_at,
        });
        debug!(query_id, "query started");

        let outcome = handle.exec(sql.clone()).await;
        let completed_at = Utc::now();

        match &outcome {
            Ok(WorkerResponse::Result { results, .. }) => {
                self.settle_record(query_id, Some(results.clone()), None).await;
                self.sink.emit(DbEvent::QueryResult {
                    query_id,
                    sql,
                    data_url: self.opts.data_url.clone(),
                    worker_path: self.opts.worker_path.clone(),
                    started_at,
                    completed_at,
                    results: results.clone(),
                });
            }
            Ok(WorkerResponse::Error { message, .. }) => {
                self.settle_record(query_id, None, Some(message.clone())).await;
                self.sink.emit(DbEvent::QueryError {
                    query_id,
                    sql,
                    data_url: self.opts.data_url.clone(),
                    worker_path: self.opts.worker_path.clone(),
                    started_at,
                    completed_at,
                    error: message.clone(),
                });
            }
            Ok(WorkerResponse::Abort { .. }) => {
                let message = "query aborted".to_string();
                self.settle_record(query_id, None, Some(message.clone())).await;
                self.sink.emit(DbEvent::QueryError {
                    query_id,
                    sql,
                    data_url: self.opts.data_url.clone(),
                    worker_path: self.opts.worker_path.clone(),
                    started_at,
                    completed_at,
                    error: message,
                });
            }
            Err(e) => {
                let message = e.to_string();
                self.settle_record(query_id, None, Some(message.clone())).await;
                self.sink.emit(DbEvent::QueryError {
                    query_id,
                    sql,
                    data_url: self.opts.data_url.clone(),
                    worker_path: self.opts.worker_path.clone(),
                    started_at,
                    completed_at,
                    error: message,
                });
            }
        }

        outcome
    }

    async fn settle_record(
        &self,
        query_id: u64,
        results: Option<Vec<QueryRows>>,
        error: Option<String>,
    ) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(&query_id) {
            record.loading = false;
            record.results = results.unwrap_or_default();
            record.error = error;
        }
    }

    /// Shut the worker down and emit `dbTerminate`.
    ///
    /// Outstanding queries settle as aborts before this returns; their
    /// `queryError` events fire on the corresponding `exec` call paths.
    ///
    /// # Errors
    ///
    /// Fails if termination is already running or already complete.
    pub async fn terminate(&self) -> WorkerResult<()> {
        self.worker.terminate().await?;
        self.sink.emit(DbEvent::DbTerminate);
        Ok(())
    }

    /// Last-known state of one query.
    pub async fn query_record(&self, query_id: u64) -> Option<QueryRecord> {
        self.records.lock().await.get(&query_id).cloned()
    }

    /// Snapshot of every query record, ordered by query id.
    pub async fn query_records(&self) -> BTreeMap<u64, QueryRecord> {
        self.records.lock().await.clone()
    }

    /// Location of the data file this manager's worker opens.
    pub fn data_url(&self) -> &str {
        &self.opts.data_url
    }

    /// Check if the worker has initialized and is accepting queries.
    pub async fn is_ready(&self) -> bool {
        self.worker.is_ready().await
    }

    /// Check if termination has completed.
    pub async fn is_terminated(&self) -> bool {
        self.worker.is_terminated().await
    }
}
