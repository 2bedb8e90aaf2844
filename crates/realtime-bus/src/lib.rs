//! Realtime change-feed contract shared by the registry and the transports.
//!
//! A [`RealtimeTransport`] hands out [`RealtimeChannel`]s keyed by topic. Callers
//! attach [`ListenerConfig`]s to a channel before calling
//! [`RealtimeChannel::subscribe`], which resolves once the backend acknowledged
//! the join. Row-change events are then delivered to every matching listener in
//! the order the listeners were attached.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod local;
pub mod phoenix;

pub use local::{HandshakeScript, LocalRealtime};
pub use phoenix::{PhoenixConfig, PhoenixRealtime};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("subscription rejected: {0}")]
    Rejected(String),
    #[error("realtime connection closed")]
    Closed,
    #[error("realtime transport error: {0}")]
    Transport(String),
    #[error("invalid row filter `{0}`")]
    InvalidFilter(String),
    #[error("realtime protocol error: {0}")]
    Protocol(String),
}

pub type RealtimeResult<T> = Result<T, RealtimeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_wire(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(ChangeKind::Insert),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(RealtimeError::Protocol(format!("unknown change kind {other}"))),
        }
    }
}

/// Which change kinds a listener wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventFilter {
    #[default]
    All,
    Only(ChangeKind),
}

impl EventFilter {
    pub fn matches(&self, kind: ChangeKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(wanted) => *wanted == kind,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            EventFilter::All => "*",
            EventFilter::Only(kind) => kind.as_wire(),
        }
    }
}

/// A single row-level change delivered by the realtime feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub resource: String,
    pub kind: ChangeKind,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub old_record: Value,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
}

impl ChangeEvent {
    pub fn new(resource: impl Into<String>, kind: ChangeKind, record: Value) -> Self {
        Self {
            resource: resource.into(),
            kind,
            record,
            old_record: Value::Null,
            commit_timestamp: None,
        }
    }

    /// Row used for filter matching: deletes only carry the old row.
    fn row(&self) -> &Value {
        match self.kind {
            ChangeKind::Delete if !self.old_record.is_null() => &self.old_record,
            _ => &self.record,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
}

impl FilterOp {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "eq" => FilterOp::Eq,
            "neq" => FilterOp::Neq,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "in" => FilterOp::In,
            _ => return None,
        })
    }

    fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::In => "in",
        }
    }
}

/// PostgREST-style row filter, e.g. `thread_id=eq.42` or `status=in.(open,funded)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    column: String,
    op: FilterOp,
    value: String,
}

impl RowFilter {
    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn matches(&self, row: &Value) -> bool {
        let Some(field) = row.get(&self.column) else {
            return false;
        };
        let actual = scalar_text(field);
        match self.op {
            FilterOp::Eq => actual == self.value,
            FilterOp::Neq => actual != self.value,
            FilterOp::In => self
                .value
                .trim_start_matches('(')
                .trim_end_matches(')')
                .split(',')
                .any(|candidate| candidate.trim() == actual),
            FilterOp::Lt | FilterOp::Lte | FilterOp::Gt | FilterOp::Gte => {
                let (Ok(lhs), Ok(rhs)) = (actual.parse::<f64>(), self.value.parse::<f64>()) else {
                    return false;
                };
                match self.op {
                    FilterOp::Lt => lhs < rhs,
                    FilterOp::Lte => lhs <= rhs,
                    FilterOp::Gt => lhs > rhs,
                    _ => lhs >= rhs,
                }
            }
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".into(),
        other => other.to_string(),
    }
}

impl FromStr for RowFilter {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RealtimeError::InvalidFilter(s.to_string());
        let (column, rest) = s.split_once('=').ok_or_else(invalid)?;
        let (op, value) = rest.split_once('.').ok_or_else(invalid)?;
        let op = FilterOp::parse(op).ok_or_else(invalid)?;
        if column.trim().is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            column: column.trim().to_string(),
            op,
            value: value.to_string(),
        })
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}.{}", self.column, self.op.as_str(), self.value)
    }
}

pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// One (resource, event, filter, callback) binding attached to a channel.
#[derive(Clone)]
pub struct ListenerConfig {
    pub resource: String,
    pub event: EventFilter,
    pub filter: Option<RowFilter>,
    pub callback: ChangeCallback,
}

impl ListenerConfig {
    pub fn new<F>(resource: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        Self {
            resource: resource.into(),
            event: EventFilter::All,
            filter: None,
            callback: Arc::new(callback),
        }
    }

    pub fn on(mut self, kind: ChangeKind) -> Self {
        self.event = EventFilter::Only(kind);
        self
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        (self.resource == "*" || self.resource == event.resource)
            && self.event.matches(event.kind)
            && self
                .filter
                .as_ref()
                .map(|filter| filter.matches(event.row()))
                .unwrap_or(true)
    }
}

impl fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("resource", &self.resource)
            .field("event", &self.event)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// Invokes every listener matching `event`, in attach order. Returns how many ran.
pub fn dispatch(listeners: &[ListenerConfig], event: &ChangeEvent) -> usize {
    let mut delivered = 0;
    for listener in listeners.iter().filter(|l| l.matches(event)) {
        (listener.callback)(event);
        delivered += 1;
    }
    delivered
}

#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    fn topic(&self) -> &str;

    /// Attaches a listener. Must be called before [`RealtimeChannel::subscribe`]
    /// so no event sent right after the join is missed.
    fn on_change(&self, listener: ListenerConfig);

    /// Performs the join handshake; resolves once the backend acknowledged it.
    async fn subscribe(&self) -> RealtimeResult<()>;

    async fn unsubscribe(&self) -> RealtimeResult<()>;
}

pub trait RealtimeTransport: Send + Sync {
    fn channel(&self, topic: &str) -> Arc<dyn RealtimeChannel>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn parses_and_prints_filters() {
        let filter: RowFilter = "thread_id=eq.42".parse().expect("filter");
        assert_eq!(filter.column(), "thread_id");
        assert_eq!(filter.to_string(), "thread_id=eq.42");
        assert!(filter.matches(&json!({"thread_id": 42})));
        assert!(!filter.matches(&json!({"thread_id": 7})));
        assert!(!filter.matches(&json!({"other": 42})));
    }

    #[test]
    fn rejects_malformed_filters() {
        for raw in ["thread_id", "thread_id=42", "=eq.1", "thread_id=like.4%"] {
            assert!(matches!(
                raw.parse::<RowFilter>(),
                Err(RealtimeError::InvalidFilter(_))
            ));
        }
    }

    #[test]
    fn in_and_range_filters() {
        let status: RowFilter = "status=in.(open,funded)".parse().unwrap();
        assert!(status.matches(&json!({"status": "funded"})));
        assert!(!status.matches(&json!({"status": "closed"})));

        let amount: RowFilter = "amount=gte.1000".parse().unwrap();
        assert!(amount.matches(&json!({"amount": 1500})));
        assert!(!amount.matches(&json!({"amount": 999.5})));
        assert!(!amount.matches(&json!({"amount": "lots"})));
    }

    #[test]
    fn dispatch_respects_kind_filter_and_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tag = |name: &'static str| {
            let seen = seen.clone();
            move |_: &ChangeEvent| seen.lock().push(name)
        };
        let listeners = vec![
            ListenerConfig::new("messages", tag("any")),
            ListenerConfig::new("messages", tag("inserts")).on(ChangeKind::Insert),
            ListenerConfig::new("messages", tag("thread-7"))
                .with_filter("thread_id=eq.7".parse().unwrap()),
            ListenerConfig::new("alerts", tag("alerts")),
        ];

        let event = ChangeEvent::new("messages", ChangeKind::Insert, json!({"thread_id": 7}));
        assert_eq!(dispatch(&listeners, &event), 3);
        assert_eq!(*seen.lock(), vec!["any", "inserts", "thread-7"]);
    }

    #[test]
    fn delete_events_match_on_old_row() {
        let listener = ListenerConfig::new("messages", |_| {})
            .with_filter("thread_id=eq.7".parse().unwrap());
        let mut event = ChangeEvent::new("messages", ChangeKind::Delete, Value::Null);
        event.old_record = json!({"thread_id": 7});
        assert!(listener.matches(&event));
    }
}
