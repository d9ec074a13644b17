//! Operator HTTP surface tests: parsing, defaults, and error envelopes.
//!
//! The master runs fully in-process on port 0 with no agents connected, so
//! every broadcast collects an empty reply list.

use master::{AppState, Engine, PublishFanout, build_router};
use serde_json::{Value, json};
use std::net::SocketAddr;

async fn start_master() -> String {
    let fanout = PublishFanout::bind("127.0.0.1:0").await.unwrap();
    let publish = fanout.handle();
    tokio::spawn(fanout.run());
    let (pull, collector) = master::collector::bind("127.0.0.1:0").await.unwrap();
    tokio::spawn(pull.run());

    let state = AppState::new(Engine::new(publish, collector));
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("http server error");
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn configure_merges_the_query_and_put_persists() {
    let http = start_master().await;
    let client = reqwest::Client::new();

    let defaults: Value = client
        .get(format!("{http}/configure"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(defaults, json!({"timeout": 1000.0, "agents": null}));

    // GET with overrides reports the merge without storing it.
    let merged: Value = client
        .get(format!("{http}/configure?timeout=10&agents=1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(merged, json!({"timeout": 10.0, "agents": 1}));
    let defaults: Value = client
        .get(format!("{http}/configure"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(defaults, json!({"timeout": 1000.0, "agents": null}));

    // PUT stores.
    let stored: Value = client
        .put(format!("{http}/configure?timeout=250&agents=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stored, json!({"timeout": 250.0, "agents": 2}));
    let defaults: Value = client
        .get(format!("{http}/configure"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(defaults, json!({"timeout": 250.0, "agents": 2}));
}

#[tokio::test]
async fn a_key_in_both_query_and_body_is_a_client_error() {
    let http = start_master().await;
    let response = reqwest::Client::new()
        .post(format!("{http}/command?path=env"))
        .form(&[("path", "env")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"error": "Duplicate argumets."}));
}

#[tokio::test]
async fn unknown_get_routes_are_404() {
    let http = start_master().await;
    let response = reqwest::get(format!("{http}/nope")).await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn broadcasts_with_no_agents_return_an_empty_list() {
    let http = start_master().await;
    let client = reqwest::Client::new();

    // Fire-and-forget: quorum zero skips the window entirely.
    let replies: Value = client
        .post(format!("{http}/command?agents=0"))
        .form(&[("path", "echo")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(replies, json!([]));

    let replies: Value = client
        .get(format!("{http}/ping?timeout=100&agents=0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(replies, json!([]));
}

#[tokio::test]
async fn poll_and_missed_start_empty() {
    let http = start_master().await;
    let client = reqwest::Client::new();

    let replies: Value = client
        .get(format!("{http}/poll?timeout=100"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(replies, json!([]));

    let missed: Value = client
        .get(format!("{http}/missed?timeout=100"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(missed, json!({"missed": {}}));
}
