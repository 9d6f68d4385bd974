//! Message protocol layer: turns one bidirectional NDJSON stream into
//! independent request/response futures correlated by id.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use super::error::{WorkerError, WorkerResult};
use super::protocol::{Action, ReplyEnvelope, RequestEnvelope, WorkerResponse};

/// Default timeout for requests (30 seconds).
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Cap on faults held while the fault stream is untaken.
const FAULT_BUFFER: usize = 64;

type ReplySender = oneshot::Sender<WorkerResult<WorkerResponse>>;

/// In-flight requests keyed by correlation id.
///
/// Ordered by id so an abort drain settles requests in dispatch order.
/// `closed` flips inside the same critical section that drains the map, so
/// a dispatch racing against shutdown either lands in the drain or is
/// rejected at registration.
struct PendingMap {
    entries: BTreeMap<u64, ReplySender>,
    closed: bool,
}

/// A fault reported by the worker process outside request/reply flow.
///
/// Faults never settle a pending request; they are diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerFault {
    /// A line on the reply stream could not be parsed as a frame.
    Protocol {
        /// Parse failure detail.
        detail: String,
    },
    /// The worker reported an error not addressed to any request id.
    Process {
        /// Message from the worker.
        message: String,
    },
    /// A line the worker wrote to stderr.
    Stderr {
        /// The stderr line, trailing newline stripped.
        line: String,
    },
    /// The reply stream ended while the channel was still open.
    Exited,
}

impl fmt::Display for WorkerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerFault::Protocol { detail } => write!(f, "protocol fault: {detail}"),
            WorkerFault::Process { message } => write!(f, "worker fault: {message}"),
            WorkerFault::Stderr { line } => write!(f, "worker stderr: {line}"),
            WorkerFault::Exited => write!(f, "worker exited unexpectedly"),
        }
    }
}

/// Async channel to a worker process.
///
/// Requests are written as NDJSON frames with a per-instance monotonic id;
/// a background reader task matches reply frames to pending requests. Each
/// request carries its own timeout. Replies whose id has no pending entry
/// are ignored; id-less frames, unparseable lines, stderr output, and
/// unexpected exit surface on the fault stream instead.
///
/// # Example
///
/// ```ignore
/// use sqlbridge::worker::{Action, WorkerChannel};
///
/// let channel = WorkerChannel::spawn("./sqlite-worker").await?;
/// let response = channel.request(Action::Exec { sql: "select 1".into() }).await?;
/// ```
pub struct WorkerChannel {
    /// Writer for the worker's request stream.
    writer: Arc<Mutex<BufWriter<Box<dyn AsyncWrite + Send + Unpin>>>>,

    /// Pending requests awaiting replies.
    pending: Arc<Mutex<PendingMap>>,

    /// Correlation id counter, owned by this instance.
    next_id: AtomicU64,

    /// Per-request timeout.
    timeout: Duration,

    /// Producer half of the fault stream, kept for the stderr task.
    fault_tx: mpsc::Sender<WorkerFault>,

    /// Consumer half of the fault stream, taken at most once.
    faults: Mutex<Option<mpsc::Receiver<WorkerFault>>>,

    /// Worker child process, present when this channel spawned one.
    child: Mutex<Option<Child>>,

    /// Handle to the background reply reader.
    reader_task: tokio::task::JoinHandle<()>,

    /// Handle to the stderr reader, present when a process was spawned.
    stderr_task: Option<tokio::task::JoinHandle<()>>,
}

impl WorkerChannel {
    /// Spawn a worker process and connect to its stdio.
    ///
    /// # Arguments
    ///
    /// * `worker_path` - Path to the worker binary.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker process cannot be spawned.
    pub async fn spawn<P: AsRef<Path>>(worker_path: P) -> WorkerResult<Self> {
        Self::spawn_with_timeout(worker_path, &[], Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Spawn a worker with arguments and a custom request timeout.
    ///
    /// stdin and stdout carry the frame streams; stderr is piped into the
    /// fault stream. The process is killed if the channel is dropped.
    pub async fn spawn_with_timeout<P: AsRef<Path>>(
        worker_path: P,
        args: &[String],
        timeout: Duration,
    ) -> WorkerResult<Self> {
        let mut child = Command::new(worker_path.as_ref())
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::SpawnFailed)?;

        let stdin = child.stdin.take().expect("stdin not captured");
        let stdout = child.stdout.take().expect("stdout not captured");
        let stderr = child.stderr.take().expect("stderr not captured");

        let mut channel = Self::connect_with_timeout(stdout, stdin, timeout);
        channel.stderr_task = Some(Self::spawn_stderr_task(stderr, channel.fault_tx.clone()));
        *channel.child.get_mut() = Some(child);

        debug!(path = %worker_path.as_ref().display(), "spawned worker process");
        Ok(channel)
    }

    /// Connect over an arbitrary transport with the default timeout.
    ///
    /// Tests and embedders bring their own worker connection this way, for
    /// example an in-memory `tokio::io::duplex` pair.
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::connect_with_timeout(reader, writer, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Connect over an arbitrary transport with a custom request timeout.
    pub fn connect_with_timeout<R, W>(reader: R, writer: W, timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let pending = Arc::new(Mutex::new(PendingMap {
            entries: BTreeMap::new(),
            closed: false,
        }));
        let (fault_tx, fault_rx) = mpsc::channel(FAULT_BUFFER);

        let reader_task = Self::spawn_reader_task(reader, pending.clone(), fault_tx.clone());

        Self {
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            pending,
            next_id: AtomicU64::new(0),
            timeout,
            fault_tx,
            faults: Mutex::new(Some(fault_rx)),
            child: Mutex::new(None),
            reader_task,
            stderr_task: None,
        }
    }

    /// Spawn the background task that reads reply frames from the worker.
    fn spawn_reader_task<R>(
        reader: R,
        pending: Arc<Mutex<PendingMap>>,
        faults: mpsc::Sender<WorkerFault>,
    ) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        // EOF - reply stream is gone
                        break;
                    }
                    Ok(_) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<ReplyEnvelope>(&line) {
                            Ok(reply) => Self::settle_reply(&pending, &faults, reply).await,
                            Err(e) => {
                                warn!(error = %e, "unparseable frame from worker");
                                let _ = faults.try_send(WorkerFault::Protocol {
                                    detail: e.to_string(),
                                });
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "read error on worker channel");
                        let _ = faults.try_send(WorkerFault::Protocol {
                            detail: e.to_string(),
                        });
                        break;
                    }
                }
            }

            // Fail whatever is still pending; registration is refused from
            // here on. A channel that was already shut down drained first,
            // so this is a no-op then.
            let (drained, already_closed) = {
                let mut pending = pending.lock().await;
                let already_closed = pending.closed;
                pending.closed = true;
                (std::mem::take(&mut pending.entries), already_closed)
            };
            if !already_closed {
                warn!(pending = drained.len(), "worker exited with channel open");
                let _ = faults.try_send(WorkerFault::Exited);
            }
            for (id, tx) in drained {
                debug!(id, "failing pending request after worker exit");
                let _ = tx.send(Err(WorkerError::WorkerExited));
            }
        })
    }

    /// Route one reply frame: settle the matching pending request, or
    /// report a fault for id-less frames, or ignore a stale id.
    async fn settle_reply(
        pending: &Arc<Mutex<PendingMap>>,
        faults: &mpsc::Sender<WorkerFault>,
        reply: ReplyEnvelope,
    ) {
        let Some(id) = reply.id else {
            let message = reply
                .error
                .unwrap_or_else(|| "worker fault with no detail".to_string());
            warn!(%message, "worker reported a process fault");
            let _ = faults.try_send(WorkerFault::Process { message });
            return;
        };

        // Deregister before resolving; once the entry is gone nothing else
        // can settle this id.
        let tx = pending.lock().await.entries.remove(&id);
        match tx {
            Some(tx) => {
                let _ = tx.send(Ok(WorkerResponse::from_reply(id, reply)));
            }
            None => {
                // Stale reply after a timeout or abort already settled it
                debug!(id, "ignoring reply with no pending request");
            }
        }
    }

    /// Spawn the background task that forwards worker stderr lines to the
    /// fault stream.
    fn spawn_stderr_task<R>(
        stderr: R,
        faults: mpsc::Sender<WorkerFault>,
    ) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = line.trim_end().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        warn!(%line, "worker stderr");
                        let _ = faults.try_send(WorkerFault::Stderr { line });
                    }
                }
            }
        })
    }

    /// Allocate the next correlation id.
    ///
    /// Ids are monotonic per channel instance and never reused. Callers
    /// that park work before dispatching reserve the id up front so the
    /// parked operation can be settled by id even if it never reaches the
    /// wire.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send an action to the worker and wait for its reply.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Serialization or the stdin write fails
    /// - The channel is closed
    /// - No reply arrives within the timeout
    pub async fn request(&self, action: Action) -> WorkerResult<WorkerResponse> {
        let id = self.allocate_id();
        self.request_with_id(id, action).await
    }

    /// Send an action under a previously allocated correlation id.
    ///
    /// The reply sender is registered before the frame is written and
    /// removed before any settlement, so a request settles at most once
    /// even when a late reply races a timeout or an abort.
    pub async fn request_with_id(&self, id: u64, action: Action) -> WorkerResult<WorkerResponse> {
        let request = RequestEnvelope { id, action };

        // Register the reply sender
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(WorkerError::ChannelClosed);
            }
            pending.entries.insert(id, tx);
        }

        if let Err(e) = self.write_frame(&request).await {
            // Never reached the worker; the registration must not linger
            self.pending.lock().await.entries.remove(&id);
            return Err(e);
        }
        debug!(id, action = request.action.kind(), "dispatched request");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(WorkerError::ChannelClosed),
            Err(_) => {
                // Deadline passed; deregister first so a late reply is
                // ignored instead of double-settling
                self.pending.lock().await.entries.remove(&id);
                debug!(id, "request timed out");
                Err(WorkerError::Timeout(self.timeout.as_secs()))
            }
        }
    }

    /// Serialize a request and write it as one frame.
    async fn write_frame(&self, request: &RequestEnvelope) -> WorkerResult<()> {
        let line = serde_json::to_string(request).map_err(WorkerError::SerializeFailed)? + "\n";
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(WorkerError::WriteFailed)?;
        writer.flush().await.map_err(WorkerError::WriteFailed)
    }

    /// Abort every in-flight request and refuse new ones.
    ///
    /// Pending requests settle with `Abort` in dispatch (id) order. The
    /// closed flag flips in the same critical section that takes the map,
    /// so no dispatch can slip between the drain and the refusal. Returns
    /// the number of requests aborted.
    pub async fn abort_all(&self) -> usize {
        let drained = {
            let mut pending = self.pending.lock().await;
            pending.closed = true;
            std::mem::take(&mut pending.entries)
        };

        let count = drained.len();
        for (id, tx) in drained {
            debug!(id, "aborting pending request");
            let _ = tx.send(Ok(WorkerResponse::Abort { id }));
        }
        count
    }

    /// Close the transport and reap the worker process, if one was spawned.
    ///
    /// Idempotent. Outstanding requests should be settled with
    /// [`WorkerChannel::abort_all`] first; any left here fail as the
    /// channel tasks stop.
    pub async fn shutdown(&self) {
        self.pending.lock().await.closed = true;

        // Closing our write half signals EOF to the worker's stdin
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        self.reader_task.abort();
        if let Some(task) = &self.stderr_task {
            task.abort();
        }
        debug!("worker channel shut down");
    }

    /// Take the fault stream.
    ///
    /// Faults are always logged at warn level; the stream exists for
    /// callers that want to observe them programmatically. While nothing
    /// is draining the stream, at most a fixed number of faults are
    /// held; further ones are dropped after logging. Returns `None`
    /// after the first call.
    pub async fn take_faults(&self) -> Option<mpsc::Receiver<WorkerFault>> {
        self.faults.lock().await.take()
    }

    /// Check if the worker connection is still being serviced.
    ///
    /// Returns `false` once the reader task has finished, which happens on
    /// worker exit or after [`WorkerChannel::shutdown`].
    pub fn is_alive(&self) -> bool {
        !self.reader_task.is_finished()
    }

    /// Get the current request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set the request timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}
