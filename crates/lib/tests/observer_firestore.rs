//! Integration test: read the delivery log through a local fake of the Firestore REST `runQuery`
//! endpoint. No credentials are configured, as with the emulator.

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use rcs_probe::config::Config;
use rcs_probe::identity::{IdentityMap, IdentityRegistry};
use rcs_probe::observer::DeliveryObserver;
use rcs_probe::sender::MessageSender;
use rcs_probe::sequence::{Sequencer, Step};
use rcs_probe::store::{DeliveryLog, FirestoreLog, MessageSource};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const FAR_FUTURE: &str = "4102444800";

#[derive(Clone, Default)]
struct FakeStore {
    paths: Arc<Mutex<Vec<String>>>,
}

fn document(id: &str, created_at: Value, source: &str, body: &str) -> Value {
    json!({
        "document": {
            "name": format!("projects/demo/databases/(default)/documents/messages/ext_abc/chat/{}", id),
            "fields": {
                "serverMessageId": { "stringValue": format!("srv-{}", id) },
                "messageBody": { "stringValue": body },
                "source": { "stringValue": source },
                "createdAt": created_at,
                "isPoll": { "booleanValue": id == "poll" },
                "questionsAnswers": { "arrayValue": { "values": [
                    { "stringValue": "1-9" }, { "stringValue": "10+" }
                ]}}
            }
        },
        "readTime": "2024-01-01T00:00:00Z"
    })
}

async fn run_query(State(store): State<FakeStore>, uri: Uri, Json(body): Json<Value>) -> Response {
    let path = uri.path().to_string();
    store.paths.lock().expect("lock").push(path.clone());
    if path.contains("/messages/ext_broken:") {
        return (StatusCode::INTERNAL_SERVER_ERROR, "backend unavailable").into_response();
    }
    if !path.contains("/messages/ext_abc:") {
        return Json(json!([{ "readTime": "2024-01-01T00:00:00Z" }])).into_response();
    }
    // Deliberately not in createdAt order, and with mixed time units.
    let mut docs = vec![
        document("a", json!({ "integerValue": "1700000000000" }), "inbound", "start"),
        document("poll", json!({ "integerValue": "1700000100" }), "outbound", "How many?"),
        document("c", json!({ "timestampValue": "2023-11-14T22:14:10Z" }), "outbound", "Welcome"),
        document("future", json!({ "integerValue": FAR_FUTURE }), "outbound", "Reply"),
    ];
    let limit = body["structuredQuery"]["limit"].as_u64().unwrap_or(100) as usize;
    docs.truncate(limit);
    Json(Value::Array(docs)).into_response()
}

async fn spawn_store() -> (String, FakeStore) {
    let store = FakeStore::default();
    let app = Router::new().fallback(run_query).with_state(store.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{}", addr), store)
}

async fn spawn_backend() -> String {
    let app = Router::new().route("/scheduler/mobile-app", post(|| async { StatusCode::OK }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

fn firestore(base_url: &str) -> Arc<FirestoreLog> {
    Arc::new(FirestoreLog::new(base_url, "demo", "messages", "chat", None).expect("firestore log"))
}

#[tokio::test]
async fn check_messages_decodes_and_orders_newest_first() {
    let (url, store) = spawn_store().await;
    let observer = DeliveryObserver::new(firestore(&url));

    let records = observer.check_messages("ext_abc", 3).await;
    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["poll", "c", "a"]);

    assert_eq!(records[0].created_at, 1_700_000_100);
    assert_eq!(records[1].created_at, 1_700_000_050);
    assert_eq!(records[2].created_at, 1_700_000_000);
    assert_eq!(records[2].source, MessageSource::Inbound);

    let poll = &records[0];
    assert!(poll.is_poll);
    assert_eq!(poll.server_message_id, "srv-poll");
    assert_eq!(poll.poll_options.as_deref(), Some(&["1-9".to_string(), "10+".to_string()][..]));

    let paths = store.paths.lock().expect("lock").clone();
    assert_eq!(
        paths,
        ["/v1/projects/demo/databases/(default)/documents/messages/ext_abc:runQuery"]
    );
}

#[tokio::test]
async fn check_messages_edge_cases_return_empty() {
    let (url, store) = spawn_store().await;
    let observer = DeliveryObserver::new(firestore(&url));

    assert!(observer.check_messages("ext_abc", 0).await.is_empty());
    assert!(store.paths.lock().expect("lock").is_empty());

    assert!(observer.check_messages("ext_nobody", 5).await.is_empty());
    assert!(observer.check_messages("ext_broken", 5).await.is_empty());
}

#[tokio::test]
async fn store_errors_surface_from_the_log_itself() {
    let (url, _store) = spawn_store().await;
    let log = firestore(&url);
    assert!(log.recent("ext_broken", 5).await.is_err());
}

#[tokio::test]
async fn unreachable_store_is_an_empty_check() {
    let observer = DeliveryObserver::new(firestore("http://127.0.0.1:9"));
    assert!(observer.check_messages("ext_abc", 5).await.is_empty());
}

#[tokio::test]
async fn from_config_points_at_emulator() {
    let (url, _store) = spawn_store().await;
    let mut config = Config::default();
    config.store.base_url = url;
    config.store.project_id = Some("demo".to_string());
    if std::env::var("GOOGLE_APPLICATION_CREDENTIALS").is_ok() {
        return;
    }
    let log = FirestoreLog::from_config(&config).expect("firestore log");
    let observer = DeliveryObserver::from_config(Arc::new(log), &config.store);
    assert_eq!(observer.check_messages("ext_abc", 10).await.len(), 4);
}

#[tokio::test]
async fn sequence_checks_log_only_for_mapped_users() {
    let (store_url, _store) = spawn_store().await;
    let backend_url = spawn_backend().await;
    let sender = MessageSender::new(&backend_url, "tok", Duration::from_secs(5), "RCS-Testing/1.0").expect("sender");
    let observer = DeliveryObserver::new(firestore(&store_url));
    let identities = IdentityRegistry::new(Arc::new(IdentityMap::new([("49804", "ext_abc")])));
    let steps = vec![Step::new("start", 0), Step::new("10:00", 0)];
    let sequencer = Sequencer::new(&sender).with_observer(&observer).with_check_limit(10);

    let mapped = identities.resolve("49804");
    assert_eq!(mapped.as_deref(), Some("ext_abc"));
    let report = sequencer.run("49804", mapped.as_deref(), &steps).await;
    assert_eq!(report.to_string(), "2 of 2 succeeded");
    // Only the far-future record is dated after each send.
    assert!(report.steps.iter().all(|s| s.replies == Some(1)));

    let unmapped = identities.resolve("99999");
    assert_eq!(unmapped, None);
    let report = sequencer.run("99999", unmapped.as_deref(), &steps).await;
    assert_eq!(report.succeeded(), 2);
    assert!(report.steps.iter().all(|s| s.replies.is_none()));
}
