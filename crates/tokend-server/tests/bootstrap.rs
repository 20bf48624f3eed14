//! A device bootstraps a token over the loopback HMAC gate, then uses it
//! as a bearer token from a non-loopback address.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};

use common::{body_json, issue_token, Harness, REMOTE};

fn stats_request(token: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri("/system/device/stats")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request")
}

#[tokio::test]
async fn bootstrap_then_bearer_round_trip() {
    // Buffer size 1 means the very first recorded event flushes immediately,
    // so the second stats read observes it.
    let harness = Harness::with_buffer_size(1).await;
    let token = issue_token(&harness, "device-1").await;

    let first = harness.send(stats_request(&token), REMOTE).await;
    assert_eq!(first.status(), StatusCode::NOT_FOUND);

    let second = harness.send(stats_request(&token), REMOTE).await;
    assert_eq!(second.status(), StatusCode::OK);

    let json = body_json(second).await;
    assert_eq!(json["device_id"], "device-1");
}
