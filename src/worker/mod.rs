//! Worker communication module.
//!
//! This module drives a long-lived database worker child process over an
//! async message channel. The worker owns the database engine; this side
//! owns correlation, timeouts, readiness queueing, and termination.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Client Process (Tokio)                      │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                  DbWorker (Lifecycle)                     │  │
//! │  │  - init: fetch data file, open, release parked queries    │  │
//! │  │  - exec: park before ready, dispatch after                │  │
//! │  │  - terminate: abort outstanding, reap the process         │  │
//! │  ├───────────────────────────────────────────────────────────┤  │
//! │  │                WorkerChannel (Protocol)                   │  │
//! │  │  - NDJSON frames over stdin/stdout                        │  │
//! │  │  - Correlation ids, per-request timeout                   │  │
//! │  │  - Fault side channel (stderr, bad frames, exit)          │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │               stdin (NDJSON) │ stdout (NDJSON)                  │
//! │                              ▼                                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            SQL Worker (Long-Running Child Process)              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sqlbridge::config::DbOpts;
//! use sqlbridge::data::FsDataSource;
//! use sqlbridge::worker::DbWorker;
//!
//! let opts = DbOpts::new("./data.db", "./sqlite-worker");
//! let worker = DbWorker::spawn(&opts, Arc::new(FsDataSource)).await?;
//!
//! worker.init().await?;
//! let response = worker.exec("select 1 as val").await?;
//! worker.terminate().await?;
//! ```

mod channel;
mod error;
mod lifecycle;
pub mod protocol;

pub use channel::{WorkerChannel, WorkerFault, DEFAULT_TIMEOUT_SECS};
pub use error::{WorkerError, WorkerResult};
pub use lifecycle::DbWorker;
pub use protocol::{Action, QueryRows, WorkerResponse};
