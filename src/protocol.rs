//! Wire protocol types and topic conventions.
//!
//! All coordination between coordinators and workers flows through the MQTT
//! broker as JSON payloads on well-known topics:
//!
//! ```text
//! tinpot/actions/{name}          retained   ActionAnnouncement (empty = withdrawal)
//! tinpot/actions/{name}/trigger  one-shot   ExecutionRequest
//! tinpot/exec/{id}/result        retained   ResultResponse
//! tinpot/exec/{id}/log           one-shot   LogEntry
//! ```
//!
//! ## Execution rendezvous
//!
//! 1. Coordinator generates an execution id, subscribes to the result and log
//!    topics, and publishes an [`ExecutionRequest`] to the action's trigger
//!    topic.
//! 2. The worker owning the action invokes it, streaming [`LogEntry`]
//!    messages to the log topic as the action produces output.
//! 3. Exactly one [`ResultResponse`] is published (retained) to the result
//!    topic when the action returns or raises.
//!
//! The result is retained so a coordinator that reconnects after the worker
//! finished still observes the outcome. Announcements are retained so a
//! coordinator that subscribes late receives the full catalog.

// Rust guideline compliant 2026-02

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix for action announcement topics.
pub const ACTIONS_PREFIX: &str = "tinpot/actions";

/// Wildcard filter matching every action announcement (one `+` level, so
/// trigger topics — one level deeper — do not match).
pub const ACTIONS_FILTER: &str = "tinpot/actions/+";

/// Topic carrying the retained announcement for `name`.
pub fn announce_topic(name: &str) -> String {
    format!("{ACTIONS_PREFIX}/{name}")
}

/// Topic on which the action named `name` accepts trigger messages.
pub fn trigger_topic(name: &str) -> String {
    format!("{ACTIONS_PREFIX}/{name}/trigger")
}

/// Retained result topic for one execution.
pub fn result_topic(execution_id: Uuid) -> String {
    format!("tinpot/exec/{execution_id}/result")
}

/// Log stream topic for one execution.
pub fn log_topic(execution_id: Uuid) -> String {
    format!("tinpot/exec/{execution_id}/log")
}

/// Extract the action name from an announcement topic.
///
/// Returns `None` for anything that is not exactly `tinpot/actions/{name}`,
/// including trigger topics (one extra level) and empty names.
pub fn parse_announce_topic(topic: &str) -> Option<&str> {
    let name = topic.strip_prefix(ACTIONS_PREFIX)?.strip_prefix('/')?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some(name)
}

// ─── Catalog types ─────────────────────────────────────────────────────────

/// One declared parameter of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Declared type name (`"string"`, `"int"`, `"float"`, `"bool"`, …).
    /// Advisory — the coordinator passes parameters through untyped.
    #[serde(rename = "type")]
    pub kind: String,
    /// Default value, `null` when the parameter has no default.
    #[serde(default)]
    pub default: serde_json::Value,
}

/// Retained announcement advertising one action.
///
/// Published by workers to `tinpot/actions/{name}` with the retained flag so
/// present and future catalog subscribers both receive it. An empty payload
/// on the same topic withdraws the action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionAnnouncement {
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Grouping label for catalog UIs.
    #[serde(default)]
    pub group: String,
    /// Parameter name → descriptor.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
    /// Topic on which this action accepts [`ExecutionRequest`] messages.
    /// Opaque to the coordinator.
    pub trigger_topic: String,
}

// ─── Execution types ───────────────────────────────────────────────────────

/// One-shot trigger message published by the coordinator to an action's
/// trigger topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Unique id for this invocation (UUID v4).
    pub execution_id: Uuid,
    /// Caller-supplied parameters. Reserved keys (leading `_`) are stripped
    /// by the coordinator before publication.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Ephemeral topic the worker publishes the retained result to.
    pub result_topic: String,
    /// Ephemeral topic the worker streams log lines to.
    pub log_topic: String,
}

/// Log severity carried on log topics and SSE streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One log line emitted during an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp taken when the line was captured on the worker.
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    /// Build an entry stamped with the current wall-clock time.
    pub fn now(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level,
            message: message.into(),
        }
    }
}

/// Terminal outcome of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecStatus {
    Success,
    Failure,
}

impl ExecStatus {
    /// Stable string form, as used in HTTP status bodies.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

/// Retained result message — published exactly once per execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultResponse {
    pub status: ExecStatus,
    /// JSON-rendered return value of the action, `null` when absent or not
    /// serializable.
    #[serde(default)]
    pub result: serde_json::Value,
    /// Error description for FAILURE results, empty string otherwise.
    #[serde(default)]
    pub error: String,
}

// ─── SSE stream events ─────────────────────────────────────────────────────

/// Payload of the terminal SSE event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// `SUCCESS` or `FAILURE`.
    pub state: ExecStatus,
    pub successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ResultResponse> for Completion {
    fn from(r: ResultResponse) -> Self {
        Self {
            state: r.status,
            successful: r.status == ExecStatus::Success,
            result: if r.result.is_null() { None } else { Some(r.result) },
            error: if r.error.is_empty() { None } else { Some(r.error) },
        }
    }
}

/// One event on an execution's SSE stream.
///
/// Serialized as `{"type": …, …}` — the `type` tag is inside the JSON, not
/// in an SSE `event:` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Mandatory first event of every stream.
    Connected { execution_id: String },
    /// One captured log line.
    Log { data: LogEntry },
    /// Terminal event; the stream ends after it.
    Complete { data: Completion },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_topic_round_trips_through_parse() {
        let topic = announce_topic("clean_cache");
        assert_eq!(topic, "tinpot/actions/clean_cache");
        assert_eq!(parse_announce_topic(&topic), Some("clean_cache"));
    }

    #[test]
    fn parse_rejects_trigger_and_foreign_topics() {
        assert_eq!(parse_announce_topic("tinpot/actions/x/trigger"), None);
        assert_eq!(parse_announce_topic("tinpot/actions/"), None);
        assert_eq!(parse_announce_topic("tinpot/actions"), None);
        assert_eq!(parse_announce_topic("other/actions/x"), None);
    }

    #[test]
    fn exec_topics_embed_the_id() {
        let id = Uuid::new_v4();
        assert_eq!(result_topic(id), format!("tinpot/exec/{id}/result"));
        assert_eq!(log_topic(id), format!("tinpot/exec/{id}/log"));
    }

    #[test]
    fn announcement_wire_shape() {
        let mut parameters = BTreeMap::new();
        parameters.insert(
            "days".to_string(),
            ParameterSpec { kind: "int".to_string(), default: serde_json::json!(7) },
        );
        let ann = ActionAnnouncement {
            description: "Remove stale cache entries".to_string(),
            group: "maintenance".to_string(),
            parameters,
            trigger_topic: trigger_topic("clean_cache"),
        };

        let json = serde_json::to_value(&ann).expect("serialize announcement");
        assert_eq!(json["parameters"]["days"]["type"], "int");
        assert_eq!(json["parameters"]["days"]["default"], 7);
        assert_eq!(json["trigger_topic"], "tinpot/actions/clean_cache/trigger");

        let back: ActionAnnouncement =
            serde_json::from_value(json).expect("deserialize announcement");
        assert_eq!(back, ann);
    }

    #[test]
    fn execution_request_tolerates_missing_parameters() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"execution_id":"{id}","result_topic":"r","log_topic":"l"}}"#
        );
        let req: ExecutionRequest = serde_json::from_str(&raw).expect("decode request");
        assert_eq!(req.execution_id, id);
        assert!(req.parameters.is_empty());
    }

    #[test]
    fn result_response_defaults() {
        let r: ResultResponse =
            serde_json::from_str(r#"{"status":"SUCCESS"}"#).expect("decode result");
        assert_eq!(r.status, ExecStatus::Success);
        assert!(r.result.is_null());
        assert!(r.error.is_empty());
    }

    #[test]
    fn stream_event_wire_shapes() {
        let connected = StreamEvent::Connected { execution_id: "abc".to_string() };
        assert_eq!(
            serde_json::to_string(&connected).expect("serialize"),
            r#"{"type":"connected","execution_id":"abc"}"#
        );

        let log = StreamEvent::Log {
            data: LogEntry {
                timestamp: "t".to_string(),
                level: LogLevel::Info,
                message: "hi".to_string(),
            },
        };
        let json = serde_json::to_value(&log).expect("serialize");
        assert_eq!(json["type"], "log");
        assert_eq!(json["data"]["level"], "INFO");

        let complete = StreamEvent::Complete {
            data: Completion::from(ResultResponse {
                status: ExecStatus::Failure,
                result: serde_json::Value::Null,
                error: "boom".to_string(),
            }),
        };
        let json = serde_json::to_value(&complete).expect("serialize");
        assert_eq!(json["type"], "complete");
        assert_eq!(json["data"]["state"], "FAILURE");
        assert_eq!(json["data"]["successful"], false);
        assert_eq!(json["data"]["error"], "boom");
        assert!(json["data"].get("result").is_none());
    }

    #[test]
    fn completion_from_success_carries_result() {
        let c = Completion::from(ResultResponse {
            status: ExecStatus::Success,
            result: serde_json::json!({"files_deleted": 42}),
            error: String::new(),
        });
        assert!(c.successful);
        assert_eq!(c.result, Some(serde_json::json!({"files_deleted": 42})));
        assert_eq!(c.error, None);
    }
}
