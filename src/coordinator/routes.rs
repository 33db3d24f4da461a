//! HTTP surface: catalog listing, execution dispatch, SSE streaming.
//!
//! Dispatch follows the rendezvous protocol: generate an execution id,
//! subscribe to the ephemeral result and log topics, **wait for both
//! subscription acknowledgments**, then publish the trigger. The ack wait
//! closes the race where a fast worker publishes the (non-retained) first
//! log lines before the coordinator is listening; the retained result would
//! survive the race, the logs would not.
//!
//! Async mode returns immediately with a stream URL; the SSE streamer drains
//! the execution's bounded event queue. Sync mode parks the HTTP handler on
//! a oneshot until the result arrives or the deadline passes.

// Rust guideline compliant 2026-02

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::broker::{BrokerClient, QoS};
use crate::protocol::{
    log_topic, result_topic, ExecutionRequest, LogEntry, ResultResponse, StreamEvent,
};

use super::catalog::ActionCatalog;
use super::executions::{ExecutionRegistry, ExecutionState};

/// How long dispatch waits for the broker to acknowledge the exec-topic
/// subscriptions before giving up with a 500.
const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state behind every HTTP handler.
#[derive(Clone, Debug)]
pub struct AppState {
    pub catalog: Arc<ActionCatalog>,
    pub executions: Arc<ExecutionRegistry>,
    pub broker: BrokerClient,
    pub sync_timeout: Duration,
}

/// Build the coordinator router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/actions", get(list_actions))
        .route("/api/actions/{name}/execute", post(execute_action))
        .route("/api/actions/{name}/sync_execute", post(sync_execute_action))
        .route("/api/executions/{id}/stream", get(stream_execution))
        .route("/api/executions/{id}/status", get(execution_status))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct ExecuteBody {
    #[serde(default)]
    parameters: serde_json::Map<String, serde_json::Value>,
}

fn not_found(detail: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "detail": detail }))).into_response()
}

fn server_error(detail: String) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "detail": detail }))).into_response()
}

/// Drop reserved (`_`-prefixed) parameter names before publication.
fn strip_reserved(
    mut parameters: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    parameters.retain(|key, _| !key.starts_with('_'));
    parameters
}

// ─── Catalog ───────────────────────────────────────────────────────────────

async fn list_actions(State(state): State<AppState>) -> Response {
    Json(state.catalog.list()).into_response()
}

// ─── Dispatch ──────────────────────────────────────────────────────────────

/// Subscribe to both exec topics and wait for the acknowledgments.
///
/// Must complete before the trigger publication; see the module docs.
async fn subscribe_exec_topics(
    broker: &BrokerClient,
    result_topic: &str,
    log_topic: &str,
    on_result: crate::broker::MessageHandler,
    on_log: crate::broker::MessageHandler,
) -> anyhow::Result<()> {
    let result_ack = broker.subscribe(result_topic, QoS::AtLeastOnce, on_result)?;
    let log_ack = broker.subscribe(log_topic, QoS::AtLeastOnce, on_log)?;
    tokio::time::timeout(SUBSCRIBE_ACK_TIMEOUT, result_ack.wait())
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for result subscription ack"))??;
    tokio::time::timeout(SUBSCRIBE_ACK_TIMEOUT, log_ack.wait())
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for log subscription ack"))??;
    Ok(())
}

async fn publish_trigger(
    broker: &BrokerClient,
    trigger_topic: &str,
    request: &ExecutionRequest,
) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(request)?;
    broker.publish(trigger_topic, QoS::AtLeastOnce, false, payload).await
}

async fn execute_action(
    Path(name): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<ExecuteBody>>,
) -> Response {
    let Some(action) = state.catalog.lookup(&name) else {
        return not_found(format!("Action not found: {name}"));
    };
    if !state.broker.is_connected() {
        return server_error("Broker not connected".to_string());
    }

    let parameters = strip_reserved(body.map(|Json(b)| b.parameters).unwrap_or_default());
    let execution_id = Uuid::new_v4();
    let result_topic = result_topic(execution_id);
    let log_topic = log_topic(execution_id);

    let exec_state = state.executions.insert(execution_id, &name);

    let log_state = Arc::clone(&exec_state);
    let on_log: crate::broker::MessageHandler = Arc::new(move |_topic, payload| {
        match serde_json::from_slice::<LogEntry>(payload) {
            Ok(entry) => log_state.push_log(entry),
            Err(e) => log::warn!("[coordinator] dropping malformed log entry: {e}"),
        }
    });

    let result_state = Arc::clone(&exec_state);
    let result_broker = state.broker.clone();
    let result_registry = Arc::clone(&state.executions);
    let unsub_result = result_topic.clone();
    let unsub_log = log_topic.clone();
    let on_result: crate::broker::MessageHandler = Arc::new(move |_topic, payload| {
        let result = match serde_json::from_slice::<ResultResponse>(payload) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("[coordinator] dropping malformed result: {e}");
                return;
            }
        };
        // complete() is idempotent under QoS 1 redelivery; only the first
        // result tears down the rendezvous.
        if result_state.complete(result) {
            result_broker.unsubscribe(&[&unsub_result, &unsub_log]);
            result_registry.schedule_cleanup(result_state.execution_id);
        }
    });

    if let Err(e) =
        subscribe_exec_topics(&state.broker, &result_topic, &log_topic, on_result, on_log).await
    {
        state.broker.unsubscribe(&[&result_topic, &log_topic]);
        state.executions.remove(execution_id);
        return server_error(format!("Failed to subscribe to execution topics: {e}"));
    }

    let request = ExecutionRequest {
        execution_id,
        parameters,
        result_topic: result_topic.clone(),
        log_topic: log_topic.clone(),
    };
    if let Err(e) = publish_trigger(&state.broker, &action.trigger_topic, &request).await {
        state.broker.unsubscribe(&[&result_topic, &log_topic]);
        state.executions.remove(execution_id);
        return server_error(format!("Failed to publish trigger: {e}"));
    }

    log::info!("[coordinator] dispatched '{name}' as {execution_id}");
    Json(json!({
        "execution_id": execution_id,
        "action_name": name,
        "status": "submitted",
        "stream_url": format!("/api/executions/{execution_id}/stream"),
    }))
    .into_response()
}

async fn sync_execute_action(
    Path(name): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<ExecuteBody>>,
) -> Response {
    let Some(action) = state.catalog.lookup(&name) else {
        return not_found(format!("Action not found: {name}"));
    };
    if !state.broker.is_connected() {
        return server_error("Broker not connected".to_string());
    }

    let parameters = strip_reserved(body.map(|Json(b)| b.parameters).unwrap_or_default());
    let execution_id = Uuid::new_v4();
    let result_topic = result_topic(execution_id);
    let log_topic = log_topic(execution_id);

    let (result_tx, result_rx) = oneshot::channel::<ResultResponse>();
    let result_slot = Arc::new(Mutex::new(Some(result_tx)));
    let on_result: crate::broker::MessageHandler = Arc::new(move |_topic, payload| {
        let result = match serde_json::from_slice::<ResultResponse>(payload) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("[coordinator] dropping malformed result: {e}");
                return;
            }
        };
        if let Some(tx) = result_slot.lock().ok().and_then(|mut slot| slot.take()) {
            let _ = tx.send(result);
        }
    });
    // Sync mode has no event buffer; the log stream is discarded.
    let on_log: crate::broker::MessageHandler = Arc::new(|_topic, _payload| {});

    if let Err(e) =
        subscribe_exec_topics(&state.broker, &result_topic, &log_topic, on_result, on_log).await
    {
        state.broker.unsubscribe(&[&result_topic, &log_topic]);
        return server_error(format!("Failed to subscribe to execution topics: {e}"));
    }

    let request = ExecutionRequest {
        execution_id,
        parameters,
        result_topic: result_topic.clone(),
        log_topic: log_topic.clone(),
    };
    if let Err(e) = publish_trigger(&state.broker, &action.trigger_topic, &request).await {
        state.broker.unsubscribe(&[&result_topic, &log_topic]);
        return server_error(format!("Failed to publish trigger: {e}"));
    }

    let outcome = tokio::time::timeout(state.sync_timeout, result_rx).await;
    state.broker.unsubscribe(&[&result_topic, &log_topic]);

    match outcome {
        Ok(Ok(result)) => {
            let mut body = json!({
                "execution_id": execution_id,
                "action_name": name,
                "status": result.status,
                "result": result.result,
            });
            if !result.error.is_empty() {
                body["error"] = json!(result.error);
            }
            Json(body).into_response()
        }
        Ok(Err(_)) => server_error("Result channel closed unexpectedly".to_string()),
        Err(_) => {
            // The action keeps running; only the wait is abandoned.
            log::warn!(
                "[coordinator] sync execution {execution_id} of '{name}' timed out after {:?}",
                state.sync_timeout
            );
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({
                    "detail": format!(
                        "Execution {execution_id} did not complete within {} seconds",
                        state.sync_timeout.as_secs()
                    ),
                })),
            )
                .into_response()
        }
    }
}

// ─── SSE streaming ─────────────────────────────────────────────────────────

enum DrainPhase {
    Connected,
    Buffered,
    Terminal,
    Done,
}

/// Pull-based view over one execution's event flow.
///
/// Emits `connected`, then the buffered events (if this subscriber claimed
/// the queue), then the terminal event once the execution has completed. A
/// subscriber that arrives after the queue was claimed — or after completion
/// drained it — still gets `connected` plus the terminal replay.
struct EventDrain {
    state: Arc<ExecutionState>,
    receiver: Option<mpsc::Receiver<StreamEvent>>,
    phase: DrainPhase,
}

impl EventDrain {
    fn new(state: Arc<ExecutionState>, receiver: Option<mpsc::Receiver<StreamEvent>>) -> Self {
        Self { state, receiver, phase: DrainPhase::Connected }
    }

    async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            match self.phase {
                DrainPhase::Connected => {
                    self.phase = DrainPhase::Buffered;
                    return Some(StreamEvent::Connected {
                        execution_id: self.state.execution_id.to_string(),
                    });
                }
                DrainPhase::Buffered => match self.receiver.as_mut() {
                    Some(rx) => match rx.recv().await {
                        Some(event) => return Some(event),
                        None => self.phase = DrainPhase::Terminal,
                    },
                    None => self.phase = DrainPhase::Terminal,
                },
                DrainPhase::Terminal => {
                    self.phase = DrainPhase::Done;
                    if let Some(event) = self.state.terminal_event() {
                        return Some(event);
                    }
                }
                DrainPhase::Done => return None,
            }
        }
    }
}

async fn stream_execution(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    let Some(exec_state) = Uuid::parse_str(&id).ok().and_then(|id| state.executions.get(id))
    else {
        return not_found(format!("Execution not found: {id}"));
    };

    let receiver = exec_state.take_receiver();
    let events = stream::unfold(EventDrain::new(exec_state, receiver), |mut drain| async move {
        let event = drain.next_event().await?;
        let data = serde_json::to_string(&event)
            .unwrap_or_else(|_| r#"{"type":"error"}"#.to_string());
        Some((Ok::<_, Infallible>(Event::default().data(data)), drain))
    });

    let headers = [
        (header::CACHE_CONTROL, "no-cache"),
        (header::CONNECTION, "keep-alive"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];
    (headers, Sse::new(events)).into_response()
}

// ─── Status / cancel / health ──────────────────────────────────────────────

async fn execution_status(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    let tracked = Uuid::parse_str(&id).ok().and_then(|id| state.executions.get(id));
    match tracked {
        Some(exec_state) => Json(json!({
            "execution_id": id,
            "state": exec_state.state_label(),
            "ready": exec_state.is_completed(),
        }))
        .into_response(),
        None => Json(json!({
            "execution_id": id,
            "state": "UNKNOWN",
            "ready": false,
        }))
        .into_response(),
    }
}

async fn cancel_execution(Path(id): Path<String>) -> Response {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({ "detail": format!("Cancellation is not supported (execution {id})") })),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    if state.broker.is_connected() {
        Json(json!({ "status": "healthy" })).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "unhealthy" }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ExecStatus, LogLevel};

    #[test]
    fn reserved_parameters_are_stripped() {
        let mut parameters = serde_json::Map::new();
        parameters.insert("days".to_string(), json!(5));
        parameters.insert("_execution_id".to_string(), json!("spoofed"));
        parameters.insert("_internal".to_string(), json!(true));

        let cleaned = strip_reserved(parameters);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned["days"], json!(5));
    }

    #[tokio::test]
    async fn drain_emits_connected_logs_then_terminal() {
        let registry = ExecutionRegistry::default();
        let exec_state = registry.insert(Uuid::new_v4(), "demo");
        exec_state.push_log(crate::protocol::LogEntry::now(LogLevel::Info, "working"));
        exec_state.complete(ResultResponse {
            status: ExecStatus::Success,
            result: json!(1),
            error: String::new(),
        });

        let receiver = exec_state.take_receiver();
        let mut drain = EventDrain::new(exec_state, receiver);

        assert!(matches!(
            drain.next_event().await,
            Some(StreamEvent::Connected { .. })
        ));
        assert!(matches!(drain.next_event().await, Some(StreamEvent::Log { .. })));
        assert!(matches!(
            drain.next_event().await,
            Some(StreamEvent::Complete { .. })
        ));
        assert!(drain.next_event().await.is_none());
    }

    #[tokio::test]
    async fn drain_without_receiver_replays_terminal_after_completion() {
        let registry = ExecutionRegistry::default();
        let exec_state = registry.insert(Uuid::new_v4(), "demo");
        exec_state.complete(ResultResponse {
            status: ExecStatus::Failure,
            result: serde_json::Value::Null,
            error: "boom".to_string(),
        });
        // First subscriber claimed (and dropped) the queue already.
        let _ = exec_state.take_receiver();

        let mut drain = EventDrain::new(exec_state, None);
        assert!(matches!(
            drain.next_event().await,
            Some(StreamEvent::Connected { .. })
        ));
        assert!(matches!(
            drain.next_event().await,
            Some(StreamEvent::Complete { .. })
        ));
        assert!(drain.next_event().await.is_none());
    }

    #[tokio::test]
    async fn drain_without_receiver_on_pending_execution_ends_after_connected() {
        let registry = ExecutionRegistry::default();
        let exec_state = registry.insert(Uuid::new_v4(), "demo");
        let _ = exec_state.take_receiver();

        let mut drain = EventDrain::new(exec_state, None);
        assert!(matches!(
            drain.next_event().await,
            Some(StreamEvent::Connected { .. })
        ));
        assert!(drain.next_event().await.is_none());
    }
}
