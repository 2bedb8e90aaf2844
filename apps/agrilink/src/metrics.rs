use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static HANDSHAKES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "agrilink_realtime_handshakes_total",
            "realtime subscription handshakes by result",
        ),
        &["result"],
    )
    .expect("handshake counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ENQUEUED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "agrilink_mutations_enqueued_total",
            "mutations enqueued for sync by operation",
        ),
        &["operation"],
    )
    .expect("enqueue counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static REPLAYED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "agrilink_mutations_replayed_total",
            "queued mutations replayed against the backend by result",
        ),
        &["result"],
    )
    .expect("replay counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static DEAD_LETTERS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "agrilink_dead_letters_total",
        "mutations moved to the dead-letter list",
    ))
    .expect("dead letter counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CONNECTIVITY: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "agrilink_connectivity_transitions_total",
            "network status transitions by new status",
        ),
        &["status"],
    )
    .expect("connectivity counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Touches every counter so they show up in output before their first event.
pub fn register_all() {
    Lazy::force(&HANDSHAKES);
    Lazy::force(&ENQUEUED);
    Lazy::force(&REPLAYED);
    Lazy::force(&DEAD_LETTERS);
    Lazy::force(&CONNECTIVITY);
}

pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(target = "metrics", error = %err, "metrics encode error");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
