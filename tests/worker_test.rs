//! Integration tests for the worker channel and lifecycle layers.
//!
//! A scripted in-memory worker stands in for the real process: it reads
//! request frames off a duplex pipe and answers according to the SQL
//! text, which lets these tests drive readiness, ordering, timeouts, and
//! termination deterministically.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

use sqlbridge::data::StaticDataSource;
use sqlbridge::worker::protocol::RequestEnvelope;
use sqlbridge::worker::{
    Action, DbWorker, WorkerChannel, WorkerError, WorkerFault, WorkerResponse,
};

// ============================================================================
// Scripted worker
// ============================================================================

/// Drives the worker side of the wire. Replies are keyed off the SQL
/// text; every received frame is reported on `seen` in arrival order.
///
/// Behaviors: `slow_table` is never answered, `broken` fails, `twice` is
/// answered with a duplicate frame, `chatty` writes fault lines before
/// answering, everything else returns one `val=1` row set.
fn scripted_worker(
    transport: DuplexStream,
    open_delay: Duration,
    seen: mpsc::UnboundedSender<String>,
) {
    tokio::spawn(async move {
        let (read, mut write) = split(transport);
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: RequestEnvelope = serde_json::from_str(&line).unwrap();
            match request.action {
                Action::Open { .. } => {
                    let _ = seen.send("open".to_string());
                    if !open_delay.is_zero() {
                        tokio::time::sleep(open_delay).await;
                    }
                    send_frame(&mut write, serde_json::json!({ "id": request.id })).await;
                }
                Action::Exec { sql } => {
                    let _ = seen.send(sql.clone());
                    if sql.contains("slow_table") {
                        continue;
                    }
                    if sql.contains("broken") {
                        send_frame(
                            &mut write,
                            serde_json::json!({
                                "id": request.id,
                                "error": "no such table: broken",
                            }),
                        )
                        .await;
                        continue;
                    }
                    if sql.contains("chatty") {
                        send_frame(&mut write, serde_json::json!({ "error": "disk pressure" }))
                            .await;
                        write.write_all(b"not a frame\n").await.unwrap();
                    }
                    let reply = serde_json::json!({
                        "id": request.id,
                        "results": [{ "columns": ["val"], "values": [[1]] }],
                    });
                    if sql.contains("twice") {
                        send_frame(&mut write, reply.clone()).await;
                    }
                    send_frame(&mut write, reply).await;
                }
            }
        }
    });
}

async fn send_frame(write: &mut (impl AsyncWrite + Unpin), frame: serde_json::Value) {
    let line = frame.to_string() + "\n";
    write.write_all(line.as_bytes()).await.unwrap();
}

fn test_worker(open_delay: Duration) -> (DbWorker, mpsc::UnboundedReceiver<String>) {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let (local, remote) = duplex(64 * 1024);
    scripted_worker(remote, open_delay, seen_tx);
    let (read, write) = split(local);
    let channel = WorkerChannel::connect_with_timeout(read, write, Duration::from_secs(5));
    let worker = DbWorker::with_channel(
        channel,
        "test.db",
        Arc::new(StaticDataSource::new(b"payload".to_vec())),
    );
    (worker, seen_rx)
}

fn drain_seen(seen: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Ok(frame) = seen.try_recv() {
        frames.push(frame);
    }
    frames
}

// ============================================================================
// Readiness and ordering
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_early_execs_settle_in_submission_order_after_open() {
    let (worker, mut seen) = test_worker(Duration::from_millis(100));
    let worker = Arc::new(worker);

    // Three queries before init; each task parks before the next spawns.
    let mut callers = Vec::new();
    for n in 0..3 {
        let worker = worker.clone();
        callers.push(tokio::spawn(
            async move { worker.exec(format!("select {n}")).await },
        ));
        tokio::task::yield_now().await;
    }

    worker.init().await.unwrap();

    let mut ids = Vec::new();
    for caller in callers {
        match caller.await.unwrap().unwrap() {
            WorkerResponse::Result { id, .. } => ids.push(id),
            other => panic!("expected result, got {other:?}"),
        }
    }
    // Parked queries reserved ids 0..3 at submission time, before the
    // open action allocated its own.
    assert_eq!(ids, vec![0, 1, 2]);

    // Nothing reached the wire before the open action.
    let frames = drain_seen(&mut seen);
    assert_eq!(frames[0], "open");
    assert_eq!(frames[1..], ["select 0", "select 1", "select 2"]);
}

#[tokio::test(start_paused = true)]
async fn test_exec_during_open_in_flight_parks_until_ready() {
    let (worker, mut seen) = test_worker(Duration::from_millis(100));
    let worker = Arc::new(worker);

    let init = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.init().await })
    };
    // The open frame is on the wire and stays unanswered for 100ms.
    assert_eq!(seen.recv().await.unwrap(), "open");

    let caller = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.exec("select 1 as val").await })
    };

    init.await.unwrap().unwrap();
    match caller.await.unwrap().unwrap() {
        WorkerResponse::Result { id, results } => {
            // Parked behind the in-flight open action, which took id 0.
            assert_eq!(id, 1);
            assert_eq!(results[0].columns, vec!["val"]);
        }
        other => panic!("expected result, got {other:?}"),
    }

    // The query reached the wire only after the open reply.
    let frames = drain_seen(&mut seen);
    assert_eq!(frames, ["select 1 as val"]);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_exec_times_out_at_deadline() {
    let (worker, _seen) = test_worker(Duration::ZERO);
    worker.init().await.unwrap();

    let started = tokio::time::Instant::now();
    let err = worker.exec("select * from slow_table").await.unwrap_err();

    assert!(matches!(err, WorkerError::Timeout(5)));
    assert!(started.elapsed() >= Duration::from_secs(5));
}

// ============================================================================
// Settlement
// ============================================================================

#[tokio::test]
async fn test_each_outcome_kind_settles_its_own_request() {
    let (worker, _seen) = test_worker(Duration::ZERO);
    let worker = Arc::new(worker);
    worker.init().await.unwrap();

    let ok = worker.exec("select 1 as val").await.unwrap();
    match ok {
        WorkerResponse::Result { results, .. } => {
            assert_eq!(results[0].values, vec![vec![serde_json::json!(1)]]);
        }
        other => panic!("expected result, got {other:?}"),
    }

    let failed = worker.exec("select * from broken").await.unwrap();
    match failed {
        WorkerResponse::Error { message, .. } => {
            assert_eq!(message, "no such table: broken");
        }
        other => panic!("expected error, got {other:?}"),
    }

    let slow = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.exec("select * from slow_table").await })
    };
    tokio::task::yield_now().await;

    worker.terminate().await.unwrap();

    match slow.await.unwrap().unwrap() {
        WorkerResponse::Abort { .. } => {}
        other => panic!("expected abort, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_reply_is_ignored() {
    let (worker, _seen) = test_worker(Duration::ZERO);
    worker.init().await.unwrap();

    let response = worker.exec("select twice").await.unwrap();
    assert!(matches!(response, WorkerResponse::Result { .. }));

    // The duplicate frame found no pending request; the channel keeps
    // serving and reports no fault for it.
    let again = worker.exec("select 1 as val").await.unwrap();
    assert!(matches!(again, WorkerResponse::Result { .. }));

    let mut faults = worker.take_faults().await.unwrap();
    assert!(faults.try_recv().is_err());
}

#[tokio::test]
async fn test_worker_faults_surface_on_side_channel() {
    let (worker, _seen) = test_worker(Duration::ZERO);
    worker.init().await.unwrap();

    // The reply still arrives and the request still settles
    let response = worker.exec("select chatty").await.unwrap();
    assert!(matches!(response, WorkerResponse::Result { .. }));

    let mut faults = worker.take_faults().await.unwrap();
    assert_eq!(
        faults.recv().await.unwrap(),
        WorkerFault::Process {
            message: "disk pressure".to_string()
        }
    );
    match faults.recv().await.unwrap() {
        WorkerFault::Protocol { .. } => {}
        other => panic!("expected protocol fault, got {other:?}"),
    }
}

// ============================================================================
// Termination
// ============================================================================

#[tokio::test]
async fn test_terminate_aborts_outstanding_exec_before_returning() {
    let (worker, _seen) = test_worker(Duration::ZERO);
    let worker = Arc::new(worker);
    worker.init().await.unwrap();

    let slow = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.exec("select * from slow_table").await })
    };
    tokio::task::yield_now().await;

    worker.terminate().await.unwrap();

    // The abort was delivered during terminate; the caller observes it
    // without any further worker activity.
    match slow.await.unwrap().unwrap() {
        WorkerResponse::Abort { .. } => {}
        other => panic!("expected abort, got {other:?}"),
    }
    assert!(worker.is_terminated().await);
}

#[tokio::test]
async fn test_terminate_during_queue_replay_settles_each_parked_exec_once() {
    let (worker, mut seen) = test_worker(Duration::ZERO);
    let worker = Arc::new(worker);

    // Two queries park before init; the replay dispatches the first and
    // blocks on it, holding the second in its batch.
    let blocked = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.exec("select * from slow_table").await })
    };
    tokio::task::yield_now().await;
    let queued = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.exec("select 2").await })
    };
    tokio::task::yield_now().await;

    let init = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.init().await })
    };
    assert_eq!(seen.recv().await.unwrap(), "open");
    assert_eq!(seen.recv().await.unwrap(), "select * from slow_table");

    worker.terminate().await.unwrap();

    // Both parked queries settle exactly once as aborts: the dispatched
    // one through the channel, the held one from the replay loop.
    match blocked.await.unwrap().unwrap() {
        WorkerResponse::Abort { id } => assert_eq!(id, 0),
        other => panic!("expected abort, got {other:?}"),
    }
    match queued.await.unwrap().unwrap() {
        WorkerResponse::Abort { id } => assert_eq!(id, 1),
        other => panic!("expected abort, got {other:?}"),
    }
    init.await.unwrap().unwrap();
    assert!(worker.is_terminated().await);

    // The second query never reached the wire.
    assert!(drain_seen(&mut seen).is_empty());
}

#[tokio::test]
async fn test_concurrent_terminates_accept_exactly_one() {
    let (worker, _seen) = test_worker(Duration::ZERO);
    worker.init().await.unwrap();

    let (first, second) = tokio::join!(worker.terminate(), worker.terminate());

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);

    let err = outcomes.into_iter().find_map(Result::err).unwrap();
    assert!(err.is_lifecycle_misuse());
    assert!(matches!(
        err,
        WorkerError::AlreadyTerminating | WorkerError::AlreadyTerminated
    ));
}

#[tokio::test]
async fn test_exec_after_terminate_does_not_reach_worker() {
    let (worker, mut seen) = test_worker(Duration::ZERO);
    worker.init().await.unwrap();
    worker.exec("select 1 as val").await.unwrap();

    worker.terminate().await.unwrap();
    drain_seen(&mut seen);

    let err = worker.exec("select 2").await.unwrap_err();
    assert!(matches!(err, WorkerError::Unavailable));
    assert!(!err.is_retriable());

    tokio::task::yield_now().await;
    assert!(drain_seen(&mut seen).is_empty());
}
