//! Worker side: action discovery, announcement, and trigger dispatch.
//!
//! On every broker (re)connect the worker announces each discovered action
//! as a retained message and subscribes to its trigger topic. A trigger
//! message carries the execution id plus the ephemeral result/log topics;
//! the handler decodes it and spawns a task that runs the action through the
//! [`manager::ActionManager`], streaming captured output to the log topic
//! and publishing exactly one retained result.
//!
//! The broker event loop is never blocked by action work: trigger handlers
//! only decode and spawn.

// Rust guideline compliant 2026-02

pub mod manager;
pub mod primitives;

use std::sync::Arc;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::broker::{BrokerClient, MessageHandler, OnConnect, QoS};
use crate::config::Config;
use crate::protocol::{
    announce_topic, trigger_topic, ActionAnnouncement, ExecutionRequest, LogEntry, ResultResponse,
};

use manager::{ActionInfo, ActionManager};
use primitives::LogSink;

/// Announcements are retained so future catalog subscribers see them.
const RETAIN_ANNOUNCEMENTS: bool = true;
/// Results are retained so a coordinator reconnecting late still learns the
/// outcome.
const RETAIN_RESULTS: bool = true;
/// Logs are not retained: the coordinator subscribes to the log topic before
/// publishing the trigger, so no line can be emitted without a subscriber,
/// and a stale retained line must never leak to an unrelated subscriber.
const RETAIN_LOGS: bool = false;

/// Run the worker until interrupted.
pub async fn run(config: Config) -> Result<()> {
    let manager = Arc::new(ActionManager::start(&config.actions_dir)?);
    if manager.list().is_empty() {
        log::warn!(
            "[worker] no actions found in {}; announcing nothing",
            config.actions_dir.display()
        );
    }

    let client_id = format!("tinpot-worker-{}", Uuid::new_v4().simple());
    let mgr = Arc::clone(&manager);
    let on_connect: OnConnect = Arc::new(move |client| announce_and_subscribe(client, &mgr));
    let client = BrokerClient::connect(&config.broker_url, &client_id, on_connect)?;

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;

    log::info!("[worker] shutting down, withdrawing announcements");
    withdraw_announcements(&client, &manager).await;
    if let Err(e) = client.disconnect().await {
        log::debug!("[worker] disconnect during shutdown: {e}");
    }
    Ok(())
}

/// Announce every action (retained) and subscribe to its trigger topic.
///
/// Runs on each connect, including reconnects after a broker outage — the
/// broker has forgotten our session, so both steps must be replayed.
/// Announcements are idempotent on the catalog side.
fn announce_and_subscribe(client: &BrokerClient, manager: &Arc<ActionManager>) {
    for info in manager.list().values() {
        let announcement = announcement_for(info);
        match serde_json::to_vec(&announcement) {
            Ok(payload) => {
                if let Err(e) = client.try_publish(
                    &announce_topic(&info.name),
                    QoS::AtLeastOnce,
                    RETAIN_ANNOUNCEMENTS,
                    payload,
                ) {
                    log::warn!("[worker] failed to announce '{}': {e}", info.name);
                }
            }
            Err(e) => {
                log::error!("[worker] cannot encode announcement for '{}': {e}", info.name);
                continue;
            }
        }

        let handler = trigger_handler(client.clone(), Arc::clone(manager), info.name.clone());
        match client.subscribe(&announcement.trigger_topic, QoS::AtLeastOnce, handler) {
            // The worker does not gate on the SUBACK; the coordinator's
            // subscribe-before-publish discipline covers the races that matter.
            Ok(_token) => {}
            Err(e) => {
                log::warn!("[worker] failed to subscribe trigger for '{}': {e}", info.name)
            }
        }
    }
    log::info!("[worker] announced {} action(s)", manager.list().len());
}

fn announcement_for(info: &ActionInfo) -> ActionAnnouncement {
    ActionAnnouncement {
        description: info.description.clone(),
        group: info.group.clone(),
        parameters: info.parameters.clone(),
        trigger_topic: trigger_topic(&info.name),
    }
}

/// Handler for one action's trigger topic: decode and spawn.
fn trigger_handler(
    client: BrokerClient,
    manager: Arc<ActionManager>,
    action_name: String,
) -> MessageHandler {
    Arc::new(move |_topic, payload| {
        let request: ExecutionRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("[worker] dropping malformed trigger for '{action_name}': {e}");
                return;
            }
        };
        tokio::spawn(handle_trigger(
            client.clone(),
            Arc::clone(&manager),
            action_name.clone(),
            request,
        ));
    })
}

/// Run one invocation: stream logs, publish the retained result.
async fn handle_trigger(
    client: BrokerClient,
    manager: Arc<ActionManager>,
    action_name: String,
    request: ExecutionRequest,
) {
    log::info!("[worker] executing '{action_name}' ({})", request.execution_id);

    let log_client = client.clone();
    let log_topic = request.log_topic.clone();
    let on_log: LogSink = Arc::new(move |level, line: &str| {
        let entry = LogEntry::now(level, line);
        match serde_json::to_vec(&entry) {
            Ok(payload) => {
                if let Err(e) =
                    log_client.try_publish(&log_topic, QoS::AtLeastOnce, RETAIN_LOGS, payload)
                {
                    log::warn!("[worker] failed to publish log line: {e}");
                }
            }
            Err(e) => log::warn!("[worker] cannot encode log entry: {e}"),
        }
    });

    let outcome = manager.invoke(&action_name, request.parameters, on_log).await;
    let response = ResultResponse {
        status: outcome.status,
        result: outcome.result,
        error: outcome.error,
    };

    match serde_json::to_vec(&response) {
        Ok(payload) => {
            if let Err(e) = client
                .publish(&request.result_topic, QoS::AtLeastOnce, RETAIN_RESULTS, payload)
                .await
            {
                log::error!(
                    "[worker] failed to publish result for '{action_name}' ({}): {e}",
                    request.execution_id
                );
            }
        }
        Err(e) => log::error!("[worker] cannot encode result: {e}"),
    }

    log::info!(
        "[worker] '{action_name}' ({}) finished: {}",
        request.execution_id,
        response.status.as_str()
    );
}

/// Publish an empty retained payload per action so the catalog forgets us.
async fn withdraw_announcements(client: &BrokerClient, manager: &Arc<ActionManager>) {
    for name in manager.list().keys() {
        if let Err(e) = client
            .publish(&announce_topic(name), QoS::AtLeastOnce, true, Vec::new())
            .await
        {
            log::warn!("[worker] failed to withdraw '{name}': {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ParameterSpec;
    use std::collections::BTreeMap;

    // The retained-flag contract: announcements and results must survive for
    // late subscribers, logs must not outlive their execution.
    #[test]
    fn retained_flag_contract() {
        assert!(RETAIN_ANNOUNCEMENTS);
        assert!(RETAIN_RESULTS);
        assert!(!RETAIN_LOGS);
    }

    #[test]
    fn announcement_points_at_the_trigger_topic() {
        let mut parameters = BTreeMap::new();
        parameters.insert(
            "days".to_string(),
            ParameterSpec { kind: "int".to_string(), default: serde_json::json!(7) },
        );
        let info = ActionInfo {
            name: "clean_cache".to_string(),
            description: "Remove stale cache entries".to_string(),
            group: "maintenance".to_string(),
            parameters,
        };
        let announcement = announcement_for(&info);
        assert_eq!(announcement.trigger_topic, "tinpot/actions/clean_cache/trigger");
        assert_eq!(announcement.parameters.len(), 1);
    }
}
