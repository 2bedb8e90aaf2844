use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::routing::{any, get};
use axum::Router;
use backend_sdk::{BackendError, MatchKey, RemoteBackend, RestBackend};
use serde_json::json;
use url::Url;

#[derive(Debug, Clone)]
struct Seen {
    method: Method,
    table: String,
    query: Option<String>,
    apikey: Option<String>,
    authorization: Option<String>,
    prefer: Option<String>,
    body: String,
}

type Log = Arc<Mutex<Vec<Seen>>>;

async fn record(
    State(log): State<Log>,
    method: Method,
    Path(table): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    log.lock().unwrap().push(Seen {
        method,
        table: table.clone(),
        query,
        apikey: header("apikey"),
        authorization: header("authorization"),
        prefer: header("prefer"),
        body: String::from_utf8_lossy(&body).into_owned(),
    });
    if table == "locked" {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::CREATED
    }
}

async fn serve() -> (Url, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/rest/v1/", get(|| async { StatusCode::OK }))
        .route(
            "/rest/v1/stalled",
            any(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                StatusCode::CREATED
            }),
        )
        .route("/rest/v1/:table", any(record))
        .with_state(log.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (Url::parse(&format!("http://{addr}/")).expect("url"), log)
}

#[tokio::test]
async fn sends_postgrest_shaped_requests() {
    let (base, log) = serve().await;
    let backend = RestBackend::new(base, "anon-key")
        .expect("client")
        .with_access_token("user-jwt");

    backend
        .insert("investments", &json!({"id": "inv-1", "amount": 2500}))
        .await
        .expect("insert");
    backend
        .update(
            "investments",
            &json!({"amount": 3000}),
            &MatchKey::new("id", "inv-1"),
        )
        .await
        .expect("update");
    backend
        .delete("investments", &MatchKey::new("id", "inv-1"))
        .await
        .expect("delete");
    backend.health().await.expect("health");

    let seen = log.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);

    assert_eq!(seen[0].method, Method::POST);
    assert_eq!(seen[0].table, "investments");
    assert_eq!(seen[0].query, None);
    assert_eq!(seen[0].apikey.as_deref(), Some("anon-key"));
    assert_eq!(seen[0].authorization.as_deref(), Some("Bearer user-jwt"));
    assert_eq!(seen[0].prefer.as_deref(), Some("return=minimal"));
    let body: serde_json::Value = serde_json::from_str(&seen[0].body).expect("json body");
    assert_eq!(body["amount"], 2500);

    assert_eq!(seen[1].method, Method::PATCH);
    assert_eq!(seen[1].query.as_deref(), Some("id=eq.inv-1"));

    assert_eq!(seen[2].method, Method::DELETE);
    assert_eq!(seen[2].query.as_deref(), Some("id=eq.inv-1"));
    assert!(seen[2].body.is_empty());
}

#[tokio::test]
async fn surfaces_unexpected_status() {
    let (base, _log) = serve().await;
    let backend = RestBackend::new(base, "anon-key").expect("client");
    let err = backend
        .insert("locked", &json!({"id": 1}))
        .await
        .expect_err("forbidden");
    match err {
        BackendError::UnexpectedStatus { status, .. } => {
            assert_eq!(status, reqwest::StatusCode::FORBIDDEN)
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn health_fails_when_unreachable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let backend =
        RestBackend::new(Url::parse(&format!("http://{addr}/")).unwrap(), "anon").expect("client");
    assert!(matches!(backend.health().await, Err(BackendError::Http(_))));
}

#[tokio::test]
async fn stalled_request_times_out() {
    let (base, _log) = serve().await;
    let backend =
        RestBackend::with_timeout(base, "anon-key", Duration::from_millis(200)).expect("client");
    match backend.insert("stalled", &json!({"id": 1})).await {
        Err(BackendError::Http(err)) => assert!(err.is_timeout()),
        other => panic!("expected a timeout, got {other:?}"),
    }
}
