//! MQTT broker client adapter.
//!
//! Thin wrapper over `rumqttc` shared by the coordinator and the worker:
//!
//! ```text
//! BrokerClient::connect ──spawns──► event loop task
//!     poll() → ConnAck     re-subscribe registered filters, run on_connect
//!     poll() → Publish     match topic against filters, run handlers inline
//!     poll() → SubAck      complete the oldest pending AckToken
//!     poll() → Err         mark disconnected, back off, poll again
//! ```
//!
//! Handlers run inline on the event loop task so that messages on a single
//! topic are observed in broker-receive order; a handler must never block.
//! Anything slow (action invocation, publishing a result) is spawned onto a
//! separate task by the handler itself.
//!
//! SUBACK correlation is FIFO: the broker acknowledges SUBSCRIBE packets in
//! the order they were sent on the connection, so the oldest pending token is
//! always the one being acknowledged. Re-subscriptions issued internally on
//! reconnect push placeholder entries to keep the queue aligned.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use tokio::sync::oneshot;

pub use rumqttc::QoS;

/// Callback invoked for each message received on a subscribed filter.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Callback invoked on every successful (re)connect, including the first.
pub type OnConnect = Arc<dyn Fn(&BrokerClient) + Send + Sync>;

/// Maximum reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Capacity of the client's outgoing request queue.
const REQUEST_QUEUE_CAP: usize = 1024;

struct Subscription {
    filter: String,
    qos: QoS,
    handler: MessageHandler,
}

/// Resolves when the broker acknowledges the matching SUBSCRIBE.
#[derive(Debug)]
pub struct AckToken {
    rx: oneshot::Receiver<()>,
}

impl AckToken {
    /// Wait for the subscription acknowledgment.
    ///
    /// Errors if the connection drops before the SUBACK arrives; the
    /// subscription will be replayed on reconnect, but callers that need
    /// subscribe-before-publish ordering must treat this as failure.
    pub async fn wait(self) -> Result<()> {
        self.rx
            .await
            .map_err(|_| anyhow!("connection lost before subscribe acknowledgment"))
    }
}

/// Shared handle to the broker connection.
///
/// Cheap to clone; all clones share the underlying client, subscription
/// table, and connection flag.
#[derive(Clone)]
pub struct BrokerClient {
    client: AsyncClient,
    broker_url: String,
    connected: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
    // FIFO of pending SUBACK waiters; `None` entries are internal
    // re-subscriptions that consume an ack without notifying anyone.
    pending_subacks: Arc<Mutex<VecDeque<Option<oneshot::Sender<()>>>>>,
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("broker_url", &self.broker_url)
            .field("connected", &self.is_connected())
            .field(
                "subscriptions",
                &self.subscriptions.lock().map(|s| s.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

impl BrokerClient {
    /// Connect to the broker and spawn the event loop task.
    ///
    /// Returns immediately; `is_connected()` turns true once the CONNACK
    /// arrives. `on_connect` runs on every successful connect — workers use
    /// it to re-announce and re-subscribe after a broker outage.
    pub fn connect(broker_url: &str, client_id: &str, on_connect: OnConnect) -> Result<Self> {
        let (host, port) = parse_broker_url(broker_url)?;
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, event_loop) = AsyncClient::new(options, REQUEST_QUEUE_CAP);
        let this = Self {
            client,
            broker_url: broker_url.to_string(),
            connected: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            pending_subacks: Arc::new(Mutex::new(VecDeque::new())),
        };

        let looper = this.clone();
        tokio::spawn(async move {
            looper.run_event_loop(event_loop, on_connect).await;
        });

        Ok(this)
    }

    /// Whether the MQTT session is currently established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Publish, waiting for space in the request queue.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.client
            .publish(topic, qos, retained, payload)
            .await
            .with_context(|| format!("publish to {topic}"))
    }

    /// Publish without blocking; fails if the request queue is full.
    ///
    /// Used from synchronous contexts (log callbacks on the worker's
    /// interpreter thread, handlers on the event loop).
    pub fn try_publish(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.client
            .try_publish(topic, qos, retained, payload)
            .with_context(|| format!("publish to {topic}"))
    }

    /// Register `handler` for `filter` and queue a SUBSCRIBE.
    ///
    /// Subscribing again with the same filter replaces the handler. The
    /// handler runs inline on the event loop task and must not block.
    pub fn subscribe(&self, filter: &str, qos: QoS, handler: MessageHandler) -> Result<AckToken> {
        {
            let mut subs = self
                .subscriptions
                .lock()
                .map_err(|_| anyhow!("subscription table poisoned"))?;
            if let Some(existing) = subs.iter_mut().find(|s| s.filter == filter) {
                existing.qos = qos;
                existing.handler = handler;
            } else {
                subs.push(Subscription { filter: filter.to_string(), qos, handler });
            }
        }

        let (tx, rx) = oneshot::channel();
        let mut pending = self
            .pending_subacks
            .lock()
            .map_err(|_| anyhow!("suback queue poisoned"))?;
        self.client
            .try_subscribe(filter, qos)
            .with_context(|| format!("queue subscribe to {filter}"))?;
        pending.push_back(Some(tx));
        Ok(AckToken { rx })
    }

    /// Remove handlers and queue UNSUBSCRIBEs for the given topics.
    ///
    /// Handler removal is what matters locally: once the entry is gone,
    /// deliveries racing the UNSUBSCRIBE are ignored.
    pub fn unsubscribe(&self, topics: &[&str]) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.retain(|s| !topics.contains(&s.filter.as_str()));
        }
        for topic in topics {
            if let Err(e) = self.client.try_unsubscribe(*topic) {
                log::warn!("[broker] failed to queue unsubscribe from {topic}: {e}");
            }
        }
    }

    /// Cleanly end the MQTT session.
    pub async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.client.disconnect().await.context("disconnect")
    }

    /// Number of registered subscription filters (test observability).
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().map(|s| s.len()).unwrap_or(0)
    }

    async fn run_event_loop(self, mut event_loop: EventLoop, on_connect: OnConnect) {
        let mut backoff = Duration::from_secs(1);
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    backoff = Duration::from_secs(1);
                    self.connected.store(true, Ordering::SeqCst);
                    log::info!("[broker] connected to {}", self.broker_url);
                    self.replay_subscriptions();
                    on_connect(&self);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.dispatch(&publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    self.complete_oldest_suback();
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    log::warn!("[broker] server closed the session");
                }
                Ok(_) => {}
                Err(e) => {
                    let was_connected = self.connected.swap(false, Ordering::SeqCst);
                    if was_connected {
                        log::warn!("[broker] connection lost: {e}");
                    } else {
                        log::debug!("[broker] connect attempt failed: {e}");
                    }
                    self.fail_pending_subacks();
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Run every handler whose filter matches `topic`.
    fn dispatch(&self, topic: &str, payload: &[u8]) {
        // Clone matching handlers out so the table is not locked while they run
        // (a handler may subscribe or unsubscribe).
        let handlers: Vec<MessageHandler> = match self.subscriptions.lock() {
            Ok(subs) => subs
                .iter()
                .filter(|s| topic_matches(&s.filter, topic))
                .map(|s| Arc::clone(&s.handler))
                .collect(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(topic, payload);
        }
    }

    /// Re-issue SUBSCRIBE for every registered filter after a reconnect.
    ///
    /// The broker forgot our session state; placeholders keep the SUBACK
    /// FIFO aligned with real waiters queued afterwards.
    fn replay_subscriptions(&self) {
        let filters: Vec<(String, QoS)> = match self.subscriptions.lock() {
            Ok(subs) => subs.iter().map(|s| (s.filter.clone(), s.qos)).collect(),
            Err(_) => return,
        };
        let Ok(mut pending) = self.pending_subacks.lock() else { return };
        for (filter, qos) in filters {
            match self.client.try_subscribe(&filter, qos) {
                Ok(()) => pending.push_back(None),
                Err(e) => log::warn!("[broker] failed to replay subscription {filter}: {e}"),
            }
        }
    }

    fn complete_oldest_suback(&self) {
        if let Ok(mut pending) = self.pending_subacks.lock() {
            if let Some(Some(tx)) = pending.pop_front() {
                let _ = tx.send(());
            }
        }
    }

    /// Drop all pending waiters so `AckToken::wait` callers see an error
    /// instead of hanging across a reconnect.
    fn fail_pending_subacks(&self) {
        if let Ok(mut pending) = self.pending_subacks.lock() {
            pending.clear();
        }
    }
}

/// Split `tcp://host:port` (scheme optional, port optional) into host + port.
pub fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .unwrap_or(url);
    if stripped.is_empty() {
        anyhow::bail!("empty broker URL");
    }
    match stripped.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid broker port in {url:?}"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((stripped.to_string(), 1883)),
    }
}

/// MQTT topic filter matching: `+` matches one level, `#` the rest.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
