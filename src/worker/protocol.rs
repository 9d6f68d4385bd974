//! Wire types for worker communication.
//!
//! Frames are newline-delimited JSON. Outbound frames are flat objects
//! `{"id", "action", ...}`; inbound frames carry `{"id", "results"?,
//! "error"?}`. An inbound frame without an id is a process-level fault
//! report, not a reply.

use serde::{Deserialize, Serialize};

// ============================================================================
// Request Frame
// ============================================================================

/// Request frame sent to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id, unique for the lifetime of one channel instance.
    pub id: u64,
    /// The action to perform, flattened into the frame.
    #[serde(flatten)]
    pub action: Action,
}

/// The two actions a worker understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Action {
    /// Load a database file and open it for querying.
    Open {
        /// Raw data file bytes, base64-encoded on the wire.
        #[serde(with = "base64_bytes")]
        buffer: Vec<u8>,
    },
    /// Execute a SQL statement against the opened database.
    Exec {
        /// SQL text to run.
        sql: String,
    },
}

impl Action {
    /// Wire name of the action, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Open { .. } => "open",
            Action::Exec { .. } => "exec",
        }
    }
}

// ============================================================================
// Reply Frame
// ============================================================================

/// Reply frame received from the worker.
///
/// A successful `open` comes back as a bare `{"id"}` frame; queries add
/// `results`. A frame with `error` set reports a failure of that request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// Correlation id of the request this reply answers. Absent for
    /// process-level fault lines.
    #[serde(default)]
    pub id: Option<u64>,
    /// Row sets produced by the action (queries only).
    #[serde(default)]
    pub results: Option<Vec<QueryRows>>,
    /// Failure message, if the action failed inside the worker.
    #[serde(default)]
    pub error: Option<String>,
}

// ============================================================================
// Responses
// ============================================================================

/// Settled outcome of one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerResponse {
    /// Worker completed the action; zero or more row sets.
    Result {
        /// Correlation id of the settled request.
        id: u64,
        /// Row sets, empty for non-query actions.
        results: Vec<QueryRows>,
    },
    /// Worker reported a failure for this request.
    Error {
        /// Correlation id of the settled request.
        id: u64,
        /// Failure message from the worker.
        message: String,
    },
    /// Synthesized locally when the worker is terminated before a reply
    /// arrived. Never sent by the worker itself.
    Abort {
        /// Correlation id of the cancelled request.
        id: u64,
    },
}

impl WorkerResponse {
    /// Correlation id this response settles.
    pub fn id(&self) -> u64 {
        match self {
            WorkerResponse::Result { id, .. }
            | WorkerResponse::Error { id, .. }
            | WorkerResponse::Abort { id } => *id,
        }
    }

    /// Check if the request was cancelled by shutdown.
    pub fn is_abort(&self) -> bool {
        matches!(self, WorkerResponse::Abort { .. })
    }

    /// Map a reply frame addressed to `id` into a settled response.
    pub(crate) fn from_reply(id: u64, reply: ReplyEnvelope) -> Self {
        match reply.error {
            Some(message) => WorkerResponse::Error { id, message },
            None => WorkerResponse::Result {
                id,
                results: reply.results.unwrap_or_default(),
            },
        }
    }
}

// ============================================================================
// Row Sets
// ============================================================================

/// One result set: column names plus row values in column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRows {
    /// Column names, in select order.
    pub columns: Vec<String>,
    /// Rows; each inner vector is aligned with `columns`.
    pub values: Vec<Vec<serde_json::Value>>,
}

impl QueryRows {
    /// Zip columns and rows into one map per row.
    pub fn to_objects(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.values
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row.iter())
                    .map(|(col, value)| (col.clone(), value.clone()))
                    .collect()
            })
            .collect()
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_frame_serialization() {
        let request = RequestEnvelope {
            id: 7,
            action: Action::Exec {
                sql: "select 1 as val".to_string(),
            },
        };

        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"id":7,"action":"exec","sql":"select 1 as val"}"#);
    }

    #[test]
    fn test_open_frame_roundtrip() {
        let request = RequestEnvelope {
            id: 0,
            action: Action::Open {
                buffer: vec![0x53, 0x51, 0x4c, 0x00],
            },
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""action":"open""#));

        let parsed: RequestEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 0);
        match parsed.action {
            Action::Open { buffer } => assert_eq!(buffer, vec![0x53, 0x51, 0x4c, 0x00]),
            other => panic!("expected open action, got {other:?}"),
        }
    }

    #[test]
    fn test_result_reply_deserialization() {
        let json = r#"{"id":3,"results":[{"columns":["val"],"values":[[1]]}]}"#;

        let reply: ReplyEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(reply.id, Some(3));

        let response = WorkerResponse::from_reply(3, reply);
        match response {
            WorkerResponse::Result { id, results } => {
                assert_eq!(id, 3);
                assert_eq!(results[0].columns, vec!["val"]);
                assert_eq!(results[0].values, vec![vec![serde_json::json!(1)]]);
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn test_bare_open_reply_is_empty_result() {
        let reply: ReplyEnvelope = serde_json::from_str(r#"{"id":0}"#).unwrap();
        let response = WorkerResponse::from_reply(0, reply);
        assert_eq!(
            response,
            WorkerResponse::Result {
                id: 0,
                results: vec![]
            }
        );
    }

    #[test]
    fn test_error_reply_deserialization() {
        let json = r#"{"id":4,"error":"no such table: missing"}"#;

        let reply: ReplyEnvelope = serde_json::from_str(json).unwrap();
        let response = WorkerResponse::from_reply(4, reply);
        assert_eq!(
            response,
            WorkerResponse::Error {
                id: 4,
                message: "no such table: missing".to_string()
            }
        );
    }

    #[test]
    fn test_abort_is_distinguishable_from_worker_outcomes() {
        let abort = WorkerResponse::Abort { id: 9 };
        assert!(abort.is_abort());
        assert_eq!(abort.id(), 9);

        let result = WorkerResponse::Result {
            id: 9,
            results: vec![],
        };
        assert!(!result.is_abort());
        let error = WorkerResponse::Error {
            id: 9,
            message: "boom".to_string(),
        };
        assert!(!error.is_abort());
    }

    #[test]
    fn test_fault_line_has_no_id() {
        let reply: ReplyEnvelope =
            serde_json::from_str(r#"{"error":"worker out of memory"}"#).unwrap();
        assert_eq!(reply.id, None);
        assert_eq!(reply.error.as_deref(), Some("worker out of memory"));
    }

    #[test]
    fn test_rows_to_objects() {
        let rows = QueryRows {
            columns: vec!["id".to_string(), "name".to_string()],
            values: vec![
                vec![serde_json::json!(1), serde_json::json!("ada")],
                vec![serde_json::json!(2), serde_json::json!("grace")],
            ],
        };

        let objects = rows.to_objects();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0]["id"], serde_json::json!(1));
        assert_eq!(objects[0]["name"], serde_json::json!("ada"));
        assert_eq!(objects[1]["name"], serde_json::json!("grace"));
    }
}
