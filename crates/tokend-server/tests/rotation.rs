//! Rotating the active signing key revokes tokens issued under the old key.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{issue_token, Harness};

#[tokio::test]
async fn rotate_key_revokes_previously_issued_tokens() {
    let harness = Harness::new().await;
    let first = issue_token(&harness, "device-1").await;

    assert!(harness.state.token_manager.verify_token(&first).await.is_ok());

    let revoked = harness.state.token_manager.rotate_key().await.expect("rotate_key");
    assert_eq!(revoked, 1);

    assert!(harness.state.token_manager.verify_token(&first).await.is_err());

    let second = issue_token(&harness, "device-1").await;
    assert!(harness.state.token_manager.verify_token(&second).await.is_ok());
    assert_ne!(first, second);
}
