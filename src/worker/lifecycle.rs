//! Worker lifecycle: readiness tracking, deferred execution, termination.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

use super::channel::{WorkerChannel, WorkerFault};
use super::error::{WorkerError, WorkerResult};
use super::protocol::{Action, WorkerResponse};
use crate::config::DbOpts;
use crate::data::DataSource;

/// Readiness of the database inside the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    /// No successful open yet; queries are parked.
    NotReady,
    /// An open action is in flight.
    Opening,
    /// The database answered the open action; queries dispatch directly.
    Ready,
}

/// Progress of shutdown. Orthogonal to readiness; termination is valid
/// from any readiness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Active,
    Terminating,
    Terminated,
}

/// A query submitted before the worker was ready, parked until the open
/// action settles. Carries its correlation id from the moment it is
/// created so termination can settle it with `Abort` even if it never
/// reached the wire.
struct QueuedExec {
    id: u64,
    sql: String,
    reply: oneshot::Sender<WorkerResult<WorkerResponse>>,
}

struct LifecycleState {
    readiness: Readiness,
    termination: Termination,
    init_queue: Vec<QueuedExec>,
}

/// A single worker process with lifecycle sequencing on top of the raw
/// channel.
///
/// `init` opens the database and releases queries that arrived early;
/// `exec` parks or dispatches depending on readiness; `terminate` aborts
/// everything outstanding and tears the worker down. Every operation
/// settles exactly once: with a response, an error, or an abort.
pub struct DbWorker {
    channel: WorkerChannel,
    source: Arc<dyn DataSource>,
    data_url: String,
    state: Mutex<LifecycleState>,
}

impl DbWorker {
    /// Spawn the worker binary named by `opts` and wrap it in a lifecycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker process cannot be spawned.
    pub async fn spawn(opts: &DbOpts, source: Arc<dyn DataSource>) -> WorkerResult<Self> {
        let channel = WorkerChannel::spawn_with_timeout(
            &opts.worker_path,
            &opts.worker_args,
            opts.request_timeout,
        )
        .await?;
        Ok(Self::with_channel(channel, opts.data_url.clone(), source))
    }

    /// Wrap an already-connected channel.
    ///
    /// Tests and embedders use this with an in-memory transport.
    pub fn with_channel(
        channel: WorkerChannel,
        data_url: impl Into<String>,
        source: Arc<dyn DataSource>,
    ) -> Self {
        Self {
            channel,
            source,
            data_url: data_url.into(),
            state: Mutex::new(LifecycleState {
                readiness: Readiness::NotReady,
                termination: Termination::Active,
                init_queue: Vec::new(),
            }),
        }
    }

    /// Open the data source inside the worker, then release queries that
    /// were submitted early, oldest first.
    ///
    /// Calling again after a successful init is a no-op; the worker is not
    /// re-opened. Calling while another init is still running is an error.
    ///
    /// # Errors
    ///
    /// Fetch and open failures propagate, readiness stays `NotReady`, and
    /// parked queries stay parked for a retry. Fails with a lifecycle
    /// error once termination has begun.
    pub async fn init(&self) -> WorkerResult<()> {
        {
            let mut state = self.state.lock().await;
            if state.termination != Termination::Active {
                return Err(WorkerError::Unavailable);
            }
            match state.readiness {
                Readiness::Ready => return Ok(()),
                Readiness::Opening => return Err(WorkerError::InitInProgress),
                Readiness::NotReady => state.readiness = Readiness::Opening,
            }
        }

        if let Err(e) = self.open_database().await {
            let mut state = self.state.lock().await;
            if state.readiness == Readiness::Opening {
                state.readiness = Readiness::NotReady;
            }
            return Err(e);
        }

        self.drain_init_queue().await;
        Ok(())
    }

    /// Fetch the data file and send the open action.
    async fn open_database(&self) -> WorkerResult<()> {
        let buffer = self.source.fetch(&self.data_url).await?;
        info!(url = %self.data_url, bytes = buffer.len(), "opening database in worker");

        match self.channel.request(Action::Open { buffer }).await? {
            WorkerResponse::Result { .. } => Ok(()),
            WorkerResponse::Error { message, .. } => Err(WorkerError::OpenFailed(message)),
            WorkerResponse::Abort { .. } => Err(WorkerError::Unavailable),
        }
    }

    /// Replay parked queries in submission order, then flip to ready.
    ///
    /// The empty-queue check and the `Ready` transition share one lock
    /// hold: a query that observed `NotReady` is either inside a taken
    /// batch or will observe `Ready` at its own dispatch. Each replay is
    /// awaited before the next so early callers settle in submission
    /// order.
    async fn drain_init_queue(&self) {
        loop {
            let batch = {
                let mut state = self.state.lock().await;
                if state.termination != Termination::Active {
                    // terminate() settles whatever is still queued
                    return;
                }
                if state.init_queue.is_empty() {
                    state.readiness = Readiness::Ready;
                    info!("worker ready");
                    return;
                }
                std::mem::take(&mut state.init_queue)
            };

            debug!(queued = batch.len(), "replaying queries parked before ready");
            for QueuedExec { id, sql, reply } in batch {
                if self.is_shutting_down().await {
                    let _ = reply.send(Ok(WorkerResponse::Abort { id }));
                    continue;
                }
                let outcome = self.channel.request_with_id(id, Action::Exec { sql }).await;
                let _ = reply.send(outcome);
            }
        }
    }

    /// Run a SQL statement through the worker.
    ///
    /// Ready: dispatches immediately. Not ready: parks the query until
    /// init's open action settles, preserving submission order relative to
    /// other parked queries. Terminating or terminated: rejected without
    /// contacting the worker.
    ///
    /// # Errors
    ///
    /// Lifecycle misuse, transmission failures, and timeouts surface as
    /// errors; worker-reported failures and shutdown cancellation come
    /// back as the `Error` and `Abort` response variants.
    pub async fn exec(&self, sql: impl Into<String>) -> WorkerResult<WorkerResponse> {
        let sql = sql.into();

        let parked = {
            let mut state = self.state.lock().await;
            if state.termination != Termination::Active {
                return Err(WorkerError::Unavailable);
            }
            match state.readiness {
                Readiness::Ready => None,
                Readiness::NotReady | Readiness::Opening => {
                    let id = self.channel.allocate_id();
                    let (tx, rx) = oneshot::channel();
                    state.init_queue.push(QueuedExec {
                        id,
                        sql: sql.clone(),
                        reply: tx,
                    });
                    debug!(id, "parked query until worker is ready");
                    Some(rx)
                }
            }
        };

        match parked {
            Some(rx) => rx.await.map_err(|_| WorkerError::ChannelClosed)?,
            None => self.channel.request(Action::Exec { sql }).await,
        }
    }

    /// Shut the worker down, aborting everything still outstanding.
    ///
    /// Dispatched requests settle with `Abort` in dispatch order, then
    /// queries still parked for init settle the same way, then the channel
    /// closes and the process is reaped. Aborts are delivered before this
    /// call returns.
    ///
    /// # Errors
    ///
    /// Fails if a terminate is already running ("already terminating") or
    /// has already completed ("already terminated").
    pub async fn terminate(&self) -> WorkerResult<()> {
        let parked = {
            let mut state = self.state.lock().await;
            match state.termination {
                Termination::Terminating => return Err(WorkerError::AlreadyTerminating),
                Termination::Terminated => return Err(WorkerError::AlreadyTerminated),
                Termination::Active => state.termination = Termination::Terminating,
            }
            std::mem::take(&mut state.init_queue)
        };

        let dispatched = self.channel.abort_all().await;
        let queued = parked.len();
        for QueuedExec { id, reply, .. } in parked {
            let _ = reply.send(Ok(WorkerResponse::Abort { id }));
        }
        info!(dispatched, queued, "aborted outstanding requests");

        self.channel.shutdown().await;

        self.state.lock().await.termination = Termination::Terminated;
        info!("worker terminated");
        Ok(())
    }

    async fn is_shutting_down(&self) -> bool {
        self.state.lock().await.termination != Termination::Active
    }

    /// Check if the worker has opened its database and is accepting
    /// queries.
    pub async fn is_ready(&self) -> bool {
        let state = self.state.lock().await;
        state.readiness == Readiness::Ready && state.termination == Termination::Active
    }

    /// Check if termination has completed.
    pub async fn is_terminated(&self) -> bool {
        self.state.lock().await.termination == Termination::Terminated
    }

    /// Check if the worker connection is still being serviced.
    pub fn is_alive(&self) -> bool {
        self.channel.is_alive()
    }

    /// Take the fault stream of the underlying channel.
    pub async fn take_faults(&self) -> Option<mpsc::Receiver<WorkerFault>> {
        self.channel.take_faults().await
    }

    /// Location of the data file this worker opens.
    pub fn data_url(&self) -> &str {
        &self.data_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::StaticDataSource;
    use crate::worker::protocol::RequestEnvelope;
    use std::time::Duration;
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Worker double speaking the open/exec protocol: acknowledges open,
    /// answers every exec with one `val=1` row set.
    fn scripted_worker(transport: DuplexStream) {
        tokio::spawn(async move {
            let (read, mut write) = split(transport);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: RequestEnvelope = serde_json::from_str(&line).unwrap();
                let reply = match request.action {
                    Action::Open { .. } => serde_json::json!({ "id": request.id }),
                    Action::Exec { .. } => serde_json::json!({
                        "id": request.id,
                        "results": [{"columns": ["val"], "values": [[1]]}],
                    }),
                };
                let frame = reply.to_string() + "\n";
                write.write_all(frame.as_bytes()).await.unwrap();
            }
        });
    }

    fn worker_pair() -> DbWorker {
        let (local, remote) = duplex(64 * 1024);
        scripted_worker(remote);
        let (read, write) = split(local);
        let channel = WorkerChannel::connect_with_timeout(read, write, Duration::from_secs(5));
        DbWorker::with_channel(
            channel,
            "test.db",
            Arc::new(StaticDataSource::new(b"payload".to_vec())),
        )
    }

    #[tokio::test]
    async fn test_init_then_exec() {
        let worker = worker_pair();

        worker.init().await.unwrap();
        assert!(worker.is_ready().await);

        let response = worker.exec("select 1 as val").await.unwrap();
        match response {
            WorkerResponse::Result { results, .. } => {
                assert_eq!(results[0].columns, vec!["val"]);
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_init_is_idempotent_after_success() {
        let worker = worker_pair();

        worker.init().await.unwrap();
        // Second init must not re-open; the scripted worker would answer
        // a second open with id 1, which would show up as a changed id on
        // the next exec if it were sent.
        worker.init().await.unwrap();

        let response = worker.exec("select 1 as val").await.unwrap();
        assert_eq!(response.id(), 1);
    }

    #[tokio::test]
    async fn test_exec_after_terminate_is_rejected() {
        let worker = worker_pair();
        worker.init().await.unwrap();
        worker.terminate().await.unwrap();

        let err = worker.exec("select 1").await.unwrap_err();
        assert!(matches!(err, WorkerError::Unavailable));
        assert!(err.is_lifecycle_misuse());
    }

    #[tokio::test]
    async fn test_double_terminate_errors() {
        let worker = worker_pair();
        worker.init().await.unwrap();

        worker.terminate().await.unwrap();
        let err = worker.terminate().await.unwrap_err();
        assert!(matches!(err, WorkerError::AlreadyTerminated));
    }

    #[tokio::test]
    async fn test_terminate_before_init_aborts_parked_queries() {
        let worker = Arc::new(worker_pair());

        let parked = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.exec("select 1").await })
        };
        tokio::task::yield_now().await;

        worker.terminate().await.unwrap();

        match parked.await.unwrap().unwrap() {
            WorkerResponse::Abort { .. } => {}
            other => panic!("expected abort, got {other:?}"),
        }
        assert!(worker.is_terminated().await);
    }
}
