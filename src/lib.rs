//! # sqlbridge
//!
//! An async bridge that drives a single out-of-process SQL worker over
//! newline-delimited JSON.
//!
//! ## Architecture
//!
//! Three layers, each owning one slice of the problem:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 DbManager (manager)                      │
//! │  (single-flight init, query ids, records, events)        │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [lifecycle]
//! ┌─────────────────────────────────────────────────────────┐
//! │                  DbWorker (worker)                       │
//! │  (readiness, init queue, termination, aborts)            │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [protocol]
//! ┌─────────────────────────────────────────────────────────┐
//! │               WorkerChannel (worker)                     │
//! │  (correlation ids, timeouts, fault side channel)         │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ NDJSON over stdin/stdout
//! ┌─────────────────────────────────────────────────────────┐
//! │            worker process (SQL engine)                   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Every request dispatched to the worker settles exactly once: with
//! rows, a worker-reported error, a timeout, or an abort when the worker
//! is torn down mid-flight.

pub mod config;
pub mod data;
pub mod events;
pub mod manager;
pub mod worker;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::config::{DbOpts, Settings, SettingsError};
    pub use crate::data::{DataSource, FsDataSource, StaticDataSource};
    pub use crate::events::{DbEvent, EventBus, EventSink, EventStream, NullSink};
    pub use crate::manager::{DbHandle, DbManager, QueryRecord};
    pub use crate::worker::{
        DbWorker, QueryRows, WorkerChannel, WorkerError, WorkerFault, WorkerResponse, WorkerResult,
    };
}

// Also export at crate root for convenience
pub use config::{DbOpts, Settings};
pub use events::{DbEvent, EventBus, EventSink};
pub use manager::{DbHandle, DbManager};
pub use worker::{DbWorker, QueryRows, WorkerError, WorkerResponse, WorkerResult};
