//! Typed instrumentation events and the sinks that receive them.
//!
//! The manager reports into one [`EventSink`] handed to it at
//! construction. Nothing registers globally; a caller that wants fan-out
//! passes an [`EventBus`] and subscribes, a caller that wants nothing
//! passes [`NullSink`].

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::worker::QueryRows;

/// Default broadcast capacity for [`EventBus`].
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

// ============================================================================
// Events
// ============================================================================

/// An instrumentation event emitted by the manager.
///
/// Query events carry the database location and worker path alongside the
/// query fields so a sink can tell instances apart without extra context.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum DbEvent {
    /// Database initialization has begun.
    DbInit {
        /// Location of the data file.
        data_url: String,
        /// Path of the worker binary.
        worker_path: PathBuf,
    },
    /// The worker opened the database and is accepting queries.
    DbReady {
        data_url: String,
        worker_path: PathBuf,
    },
    /// A query was assigned an id and handed to the worker.
    QueryStart {
        /// Manager-scoped query id, monotonic and never reused.
        query_id: u64,
        sql: String,
        data_url: String,
        worker_path: PathBuf,
        started_at: DateTime<Utc>,
    },
    /// The query settled with rows.
    QueryResult {
        query_id: u64,
        sql: String,
        data_url: String,
        worker_path: PathBuf,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        results: Vec<QueryRows>,
    },
    /// The query settled without rows: worker failure, timeout, or abort.
    QueryError {
        query_id: u64,
        sql: String,
        data_url: String,
        worker_path: PathBuf,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        error: String,
    },
    /// The worker was shut down.
    DbTerminate,
}

impl DbEvent {
    /// Wire name of the event, for logging and ordering assertions.
    pub fn name(&self) -> &'static str {
        match self {
            DbEvent::DbInit { .. } => "dbInit",
            DbEvent::DbReady { .. } => "dbReady",
            DbEvent::QueryStart { .. } => "queryStart",
            DbEvent::QueryResult { .. } => "queryResult",
            DbEvent::QueryError { .. } => "queryError",
            DbEvent::DbTerminate => "dbTerminate",
        }
    }

    /// Query id this event concerns, if it is a query event.
    pub fn query_id(&self) -> Option<u64> {
        match self {
            DbEvent::QueryStart { query_id, .. }
            | DbEvent::QueryResult { query_id, .. }
            | DbEvent::QueryError { query_id, .. } => Some(*query_id),
            _ => None,
        }
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Receives manager events.
///
/// Emission happens on the manager's call path, so implementations must
/// not block; hand off to a channel or task for slow consumers.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    fn emit(&self, event: DbEvent);
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: DbEvent) {}
}

/// Unbounded channel sender as a sink. Tests capture event streams with
/// this.
impl EventSink for mpsc::UnboundedSender<DbEvent> {
    fn emit(&self, event: DbEvent) {
        let _ = self.send(event);
    }
}

// ============================================================================
// Broadcast Bus
// ============================================================================

/// Errors observed by event subscribers.
#[derive(Error, Debug, PartialEq)]
pub enum EventError {
    /// The subscriber fell behind and missed events.
    #[error("event stream lagged, {count} events skipped")]
    Lagged {
        /// Number of events skipped.
        count: u64,
    },

    /// The bus was dropped.
    #[error("event stream closed")]
    Closed,
}

/// Broadcast fan-out for events.
///
/// Holds an internal receiver so emission never fails while the bus is
/// alive. Subscribers that fall behind the channel capacity observe
/// [`EventError::Lagged`] instead of stalling the manager.
pub struct EventBus {
    sender: broadcast::Sender<DbEvent>,
    _internal_receiver: broadcast::Receiver<DbEvent>,
}

impl EventBus {
    /// Create a bus holding at most `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = broadcast::channel(capacity);
        Self {
            sender,
            _internal_receiver: receiver,
        }
    }

    /// Open a subscription starting at the next emitted event.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: DbEvent) {
        trace!(event = event.name(), "emitting event");
        let _ = self.sender.send(event);
    }
}

/// A subscription to an [`EventBus`].
pub struct EventStream {
    receiver: broadcast::Receiver<DbEvent>,
}

impl EventStream {
    /// Receive the next event.
    ///
    /// On lag the stream resubscribes at the current tail and reports how
    /// many events were skipped; the next call yields live events again.
    ///
    /// # Errors
    ///
    /// [`EventError::Lagged`] after falling behind, [`EventError::Closed`]
    /// once the bus is gone.
    pub async fn recv(&mut self) -> Result<DbEvent, EventError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(count)) => {
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count })
            }
            Err(broadcast::error::RecvError::Closed) => Err(EventError::Closed),
        }
    }
}
