//! Phoenix-channel websocket transport for the hosted realtime change feed.
//!
//! One websocket is shared by every channel created from the same
//! [`PhoenixRealtime`]. The socket is opened lazily on the first join and
//! re-opened on the next join after it drops. A join's `phx_reply` with
//! `status: "ok"` is the handshake success signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    dispatch, ChangeEvent, ChangeKind, ListenerConfig, RealtimeChannel, RealtimeError,
    RealtimeResult, RealtimeTransport,
};

const PHOENIX_TOPIC: &str = "phoenix";
const TOPIC_PREFIX: &str = "realtime:";

#[derive(Debug, Clone)]
pub struct PhoenixConfig {
    /// e.g. `wss://project.example.co/realtime/v1/websocket`
    pub endpoint: Url,
    pub api_key: String,
    pub access_token: Option<String>,
    pub schema: String,
    pub heartbeat_interval: Duration,
}

impl PhoenixConfig {
    pub fn new(endpoint: Url, api_key: impl Into<String>) -> Self {
        Self {
            endpoint,
            api_key: api_key.into(),
            access_token: None,
            schema: "public".into(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    fn socket_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", "1.0.0");
        url
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    data: RawChange,
}

#[derive(Debug, Deserialize)]
struct RawChange {
    table: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    record: Value,
    #[serde(default)]
    old_record: Value,
    #[serde(default)]
    commit_timestamp: Option<String>,
}

impl RawChange {
    fn into_event(self) -> RealtimeResult<ChangeEvent> {
        Ok(ChangeEvent {
            kind: self.kind.parse::<ChangeKind>()?,
            resource: self.table,
            record: self.record,
            old_record: self.old_record,
            commit_timestamp: self.commit_timestamp,
        })
    }
}

/// The channel instance that currently owns a topic on the socket. A later
/// join of the same topic takes it over.
struct Route {
    channel: u64,
    listeners: Arc<RwLock<Vec<ListenerConfig>>>,
}

type Routes = Arc<RwLock<HashMap<String, Route>>>;
type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;

/// Drops the reply slot of a join whose caller stopped waiting.
struct PendingReply {
    pending: Pending,
    reference: String,
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.reference);
    }
}

struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &Frame) -> RealtimeResult<()> {
        let text = serde_json::to_string(frame)
            .map_err(|err| RealtimeError::Protocol(format!("serialize frame failed: {err}")))?;
        self.outbound
            .send(text)
            .map_err(|_| RealtimeError::Closed)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Inner {
    config: PhoenixConfig,
    routes: Routes,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
    next_ref: AtomicU64,
    next_channel: AtomicU64,
}

impl Inner {
    fn next_ref(&self) -> String {
        (self.next_ref.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Removes the route for `topic` if `channel` still owns it.
    fn release_route(&self, topic: &str, channel: u64) -> bool {
        let mut routes = self.routes.write();
        match routes.get(topic) {
            Some(route) if route.channel == channel => {
                routes.remove(topic);
                true
            }
            _ => false,
        }
    }

    async fn connection(self: &Arc<Self>) -> RealtimeResult<Arc<Connection>> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.is_open() {
                return Ok(Arc::clone(conn));
            }
        }
        let conn = Arc::new(self.open().await?);
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    async fn open(self: &Arc<Self>) -> RealtimeResult<Connection> {
        let url = self.config.socket_url();
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| RealtimeError::Transport(format!("websocket connect failed: {err}")))?;
        info!(target = "realtime.phoenix", endpoint = %self.config.endpoint, "realtime socket open");

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer_closed = Arc::clone(&closed);
        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(text)).await {
                    warn!(target = "realtime.phoenix", error = %err, "realtime socket write failed");
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
        });

        let reader_routes = Arc::clone(&self.routes);
        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => handle_frame(&text, &reader_routes, &reader_pending),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(target = "realtime.phoenix", error = %err, "realtime socket read failed");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // Dropping the senders fails every in-flight join with `Closed`.
            reader_pending.lock().clear();
            info!(target = "realtime.phoenix", "realtime socket closed");
        });

        let heartbeat_inner = Arc::downgrade(self);
        let heartbeat_outbound = outbound.clone();
        let interval = self.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = heartbeat_inner.upgrade() else {
                    break;
                };
                let frame = Frame {
                    topic: PHOENIX_TOPIC.into(),
                    event: "heartbeat".into(),
                    payload: json!({}),
                    reference: Some(inner.next_ref()),
                };
                let Ok(text) = serde_json::to_string(&frame) else {
                    continue;
                };
                if heartbeat_outbound.send(text).is_err() {
                    break;
                }
            }
        });

        Ok(Connection {
            outbound,
            pending,
            closed,
            tasks: vec![writer, reader, heartbeat],
        })
    }
}

fn handle_frame(text: &str, routes: &Routes, pending: &Pending) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(target = "realtime.phoenix", error = %err, "undecodable realtime frame");
            return;
        }
    };
    match frame.event.as_str() {
        "phx_reply" => {
            let waiter = frame
                .reference
                .as_ref()
                .and_then(|reference| pending.lock().remove(reference));
            if let Some(waiter) = waiter {
                let _ = waiter.send(frame.payload);
            }
        }
        "postgres_changes" => {
            let listeners = routes
                .read()
                .get(&frame.topic)
                .map(|route| Arc::clone(&route.listeners));
            let Some(listeners) = listeners else {
                debug!(target = "realtime.phoenix", topic = %frame.topic, "change for unknown topic");
                return;
            };
            let event = serde_json::from_value::<ChangePayload>(frame.payload)
                .map_err(|err| RealtimeError::Protocol(err.to_string()))
                .and_then(|payload| payload.data.into_event());
            match event {
                Ok(event) => {
                    let snapshot = listeners.read().clone();
                    dispatch(&snapshot, &event);
                }
                Err(err) => {
                    warn!(target = "realtime.phoenix", topic = %frame.topic, error = %err, "invalid change payload");
                }
            }
        }
        "phx_error" | "phx_close" => {
            warn!(
                target = "realtime.phoenix",
                topic = %frame.topic,
                event = %frame.event,
                "realtime channel closed by server"
            );
        }
        _ => {}
    }
}

/// Realtime transport speaking the Phoenix channel protocol over one websocket.
#[derive(Clone)]
pub struct PhoenixRealtime {
    inner: Arc<Inner>,
}

impl PhoenixRealtime {
    pub fn new(config: PhoenixConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                routes: Arc::new(RwLock::new(HashMap::new())),
                connection: tokio::sync::Mutex::new(None),
                next_ref: AtomicU64::new(0),
                next_channel: AtomicU64::new(0),
            }),
        }
    }
}

impl RealtimeTransport for PhoenixRealtime {
    fn channel(&self, topic: &str) -> Arc<dyn RealtimeChannel> {
        Arc::new(PhoenixChannel {
            id: self.inner.next_channel.fetch_add(1, Ordering::SeqCst),
            topic: format!("{TOPIC_PREFIX}{topic}"),
            inner: Arc::clone(&self.inner),
            listeners: Arc::new(RwLock::new(Vec::new())),
        })
    }
}

struct PhoenixChannel {
    id: u64,
    topic: String,
    inner: Arc<Inner>,
    listeners: Arc<RwLock<Vec<ListenerConfig>>>,
}

impl PhoenixChannel {
    fn join_payload(&self) -> Value {
        let changes: Vec<Value> = self
            .listeners
            .read()
            .iter()
            .map(|listener| {
                let mut binding = json!({
                    "event": listener.event.as_wire(),
                    "schema": self.inner.config.schema,
                    "table": listener.resource,
                });
                if let Some(filter) = &listener.filter {
                    binding["filter"] = Value::String(filter.to_string());
                }
                binding
            })
            .collect();
        let mut payload = json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": changes,
            }
        });
        if let Some(token) = &self.inner.config.access_token {
            payload["access_token"] = Value::String(token.clone());
        }
        payload
    }
}

#[async_trait]
impl RealtimeChannel for PhoenixChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn on_change(&self, listener: ListenerConfig) {
        self.listeners.write().push(listener);
    }

    async fn subscribe(&self) -> RealtimeResult<()> {
        let conn = self.inner.connection().await?;
        // Route before joining so events right after the reply reach the listeners.
        self.inner.routes.write().insert(
            self.topic.clone(),
            Route {
                channel: self.id,
                listeners: Arc::clone(&self.listeners),
            },
        );

        let reference = self.inner.next_ref();
        let (reply_tx, reply_rx) = oneshot::channel();
        conn.pending.lock().insert(reference.clone(), reply_tx);
        let _slot = PendingReply {
            pending: Arc::clone(&conn.pending),
            reference: reference.clone(),
        };
        conn.send(&Frame {
            topic: self.topic.clone(),
            event: "phx_join".into(),
            payload: self.join_payload(),
            reference: Some(reference),
        })?;

        let reply = reply_rx.await.map_err(|_| RealtimeError::Closed)?;
        match reply.get("status").and_then(Value::as_str) {
            Some("ok") => {
                debug!(target = "realtime.phoenix", topic = %self.topic, "channel joined");
                Ok(())
            }
            _ => {
                self.inner.release_route(&self.topic, self.id);
                let reason = reply
                    .get("response")
                    .map(Value::to_string)
                    .unwrap_or_else(|| reply.to_string());
                Err(RealtimeError::Rejected(reason))
            }
        }
    }

    async fn unsubscribe(&self) -> RealtimeResult<()> {
        // A newer channel on the same topic owns the server-side join now.
        if !self.inner.release_route(&self.topic, self.id) {
            debug!(target = "realtime.phoenix", topic = %self.topic, "topic taken over; no leave sent");
            return Ok(());
        }
        let conn = self.inner.connection.lock().await.clone();
        let Some(conn) = conn.filter(|conn| conn.is_open()) else {
            return Ok(());
        };
        conn.send(&Frame {
            topic: self.topic.clone(),
            event: "phx_leave".into(),
            payload: json!({}),
            reference: Some(self.inner.next_ref()),
        })
    }
}
