use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{
    dispatch, ChangeEvent, ListenerConfig, RealtimeChannel, RealtimeError, RealtimeResult,
    RealtimeTransport,
};

/// How the in-process transport answers join handshakes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandshakeScript {
    #[default]
    Ack,
    AckAfter(Duration),
    Reject(String),
    /// Never answers; exercises the caller's timeout.
    Hang,
}

struct Shared {
    changes: broadcast::Sender<ChangeEvent>,
    script: RwLock<HandshakeScript>,
    handshakes: AtomicUsize,
    teardowns: AtomicUsize,
    fail_teardown: AtomicBool,
}

/// In-process realtime transport for tests and offline development.
#[derive(Clone)]
pub struct LocalRealtime {
    shared: Arc<Shared>,
}

impl Default for LocalRealtime {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRealtime {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                changes: broadcast::channel(256).0,
                script: RwLock::new(HandshakeScript::Ack),
                handshakes: AtomicUsize::new(0),
                teardowns: AtomicUsize::new(0),
                fail_teardown: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_handshake(&self, script: HandshakeScript) {
        *self.shared.script.write() = script;
    }

    pub fn fail_teardown(&self, fail: bool) {
        self.shared.fail_teardown.store(fail, Ordering::SeqCst);
    }

    /// Number of join handshakes started so far.
    pub fn handshakes(&self) -> usize {
        self.shared.handshakes.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.shared.teardowns.load(Ordering::SeqCst)
    }

    /// Fans an event out to every subscribed channel.
    pub fn publish(&self, event: ChangeEvent) -> RealtimeResult<()> {
        self.shared
            .changes
            .send(event)
            .map(|_| ())
            .map_err(|_| RealtimeError::Closed)
    }
}

impl RealtimeTransport for LocalRealtime {
    fn channel(&self, topic: &str) -> Arc<dyn RealtimeChannel> {
        Arc::new(LocalChannel {
            topic: topic.to_string(),
            shared: Arc::clone(&self.shared),
            listeners: Arc::new(RwLock::new(Vec::new())),
            pump: Mutex::new(None),
        })
    }
}

struct LocalChannel {
    topic: String,
    shared: Arc<Shared>,
    listeners: Arc<RwLock<Vec<ListenerConfig>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl RealtimeChannel for LocalChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn on_change(&self, listener: ListenerConfig) {
        self.listeners.write().push(listener);
    }

    async fn subscribe(&self) -> RealtimeResult<()> {
        self.shared.handshakes.fetch_add(1, Ordering::SeqCst);
        // Subscribe to the feed before acking so nothing published right after is lost.
        let mut rx = self.shared.changes.subscribe();
        let script = self.shared.script.read().clone();
        match script {
            HandshakeScript::Ack => {}
            HandshakeScript::AckAfter(delay) => tokio::time::sleep(delay).await,
            HandshakeScript::Reject(reason) => return Err(RealtimeError::Rejected(reason)),
            HandshakeScript::Hang => std::future::pending::<()>().await,
        }

        let listeners = Arc::clone(&self.listeners);
        let topic = self.topic.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let snapshot = listeners.read().clone();
                        dispatch(&snapshot, &event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(
                            target = "realtime.local",
                            topic = %topic,
                            skipped,
                            "local channel lagged"
                        );
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self) -> RealtimeResult<()> {
        self.shared.teardowns.fetch_add(1, Ordering::SeqCst);
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if self.shared.fail_teardown.load(Ordering::SeqCst) {
            return Err(RealtimeError::Transport("scripted teardown failure".into()));
        }
        Ok(())
    }
}
