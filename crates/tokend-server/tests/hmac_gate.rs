//! The loopback HMAC gate: non-loopback callers are refused outright, and a
//! tampered signature is rejected with a fixed, specific error.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};

use common::{sign, Harness, LOOPBACK, REMOTE};

#[tokio::test]
async fn auth_token_from_non_loopback_is_forbidden() {
    let harness = Harness::new().await;
    let secret = harness.shared_secret();
    let body = r#"{"device_id":"device-1"}"#.to_owned();
    let signature = sign(&secret, "POST", "/auth/token", "", &body);

    let request = Request::builder()
        .method("POST")
        .uri("/auth/token")
        .header("x-request-signature", signature)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("request");

    let response = harness.send(request, REMOTE).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let harness = Harness::new().await;
    let secret = harness.shared_secret();
    let body = r#"{"device_id":"device-1"}"#.to_owned();
    let mut signature = sign(&secret, "POST", "/auth/token", "", &body);
    let last = signature.pop().expect("non-empty signature");
    signature.push(if last == '0' { '1' } else { '0' });

    let request = Request::builder()
        .method("POST")
        .uri("/auth/token")
        .header("x-request-signature", signature)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("request");

    let response = harness.send(request, LOOPBACK).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get("x-requires-signature"),
        None,
        "x-requires-signature marks a missing header, not a bad signature"
    );

    let bytes = axum::body::to_bytes(response.into_body(), 1 << 16).await.expect("body");
    let text = String::from_utf8(bytes.to_vec()).expect("utf8 body");
    assert!(text.contains("Invalid signature"), "body was: {text}");
}

#[tokio::test]
async fn missing_signature_header_is_flagged() {
    let harness = Harness::new().await;
    let body = r#"{"device_id":"device-1"}"#.to_owned();

    let request = Request::builder()
        .method("POST")
        .uri("/auth/token")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("request");

    let response = harness.send(request, LOOPBACK).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers().get("x-requires-signature").expect("header"), "true");
}
