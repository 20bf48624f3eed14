//! Per-request authentication: HMAC-signed canonical strings for loopback
//! clients, bearer tokens for everyone else.
//!
//! Installed as a single Axum middleware in front of every route except
//! `/system/health`. `/auth/token` additionally requires loopback — it is
//! the bootstrap path a device uses before it holds a token at all, so a
//! remote caller is refused outright rather than falling through to the
//! bearer check.

use std::net::{IpAddr, SocketAddr};

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::AppError;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Routes that may only ever be reached by a loopback caller, regardless
/// of whether they present a bearer token.
const LOOPBACK_ONLY_PATHS: &[&str] = &["/auth/token"];

/// Maximum request body size read for HMAC canonicalization.
const MAX_BODY_BYTES: usize = 1 << 20;

/// Caller identity established by the gate, attached to request
/// extensions for handlers and the activity recorder to read.
#[derive(Debug, Clone)]
pub struct AuthIdentity {
    pub device_id: Option<String>,
}

pub async fn auth_gate(
    State(state): State<std::sync::Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let query = req.uri().query().unwrap_or("").to_owned();
    let loopback = is_loopback_request(&req, connect_info.map(|c| c.0));
    let loopback_required = LOOPBACK_ONLY_PATHS.contains(&path.as_str());

    if loopback_required && !loopback {
        return Err(AppError::Forbidden("loopback required"));
    }

    if loopback {
        return hmac_path(state, method.as_str(), &path, &query, req, next).await;
    }

    bearer_path(state, req, next).await
}

async fn hmac_path(
    state: std::sync::Arc<AppState>,
    method: &str,
    path: &str,
    query: &str,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let signature_header = req
        .headers()
        .get("x-request-signature")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let (parts, body) = req.into_parts();
    let body_bytes = to_bytes(body, MAX_BODY_BYTES).await.map_err(|_| AppError::BadRequest("body too large".into()))?;

    let Some(signature_hex) = signature_header else {
        let mut response = AppError::UnauthorizedWithReason("Missing signature header").into_response();
        response.headers_mut().insert("x-requires-signature", HeaderValue::from_static("true"));
        return Ok(response);
    };

    let canonical_body: &[u8] = if method.eq_ignore_ascii_case("GET") { b"" } else { &body_bytes };
    let canonical = canonical_string(method, path, query, canonical_body);

    if !verify_hmac(state.secrets_store.shared_secret(), &canonical, &signature_hex) {
        return Err(AppError::UnauthorizedWithReason("Invalid signature"));
    }

    // HMAC proves the caller holds the shared secret, not which device it
    // is; routes that need a device identity for a loopback caller take it
    // from the query string (GET) or body (POST, e.g. `/auth/token`).
    let device_id = query_param(query, "device_id");
    let mut parts = parts;
    parts.extensions.insert(AuthIdentity { device_id });

    let req = Request::from_parts(parts, Body::from(body_bytes));
    Ok(next.run(req).await)
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_owned())
    })
}

async fn bearer_path(state: std::sync::Arc<AppState>, mut req: Request, next: Next) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?
        .to_owned();

    let claims = state.token_manager.verify_token(&token).await?;
    req.extensions_mut().insert(AuthIdentity { device_id: Some(claims.did) });

    Ok(next.run(req).await)
}

/// Builds the canonical signing string: `METHOD\nPATH\nQUERY\nBODY`, no
/// trailing newline.
fn canonical_string(method: &str, path: &str, query: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(method.len() + path.len() + query.len() + body.len() + 3);
    out.extend_from_slice(method.to_ascii_uppercase().as_bytes());
    out.push(b'\n');
    out.extend_from_slice(path.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(query.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(body);
    out
}

fn verify_hmac(shared_secret: &[u8], canonical: &[u8], signature_hex: &str) -> bool {
    let Ok(expected_sig) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(shared_secret) else {
        return false;
    };
    mac.update(canonical);
    let computed = mac.finalize().into_bytes();
    computed.as_slice().ct_eq(&expected_sig).into()
}

fn is_loopback_request(req: &Request, connect_info: Option<SocketAddr>) -> bool {
    let candidate = req
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
        .or_else(|| {
            req.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok()).and_then(|v| {
                v.split(',').next().and_then(|first| first.trim().parse::<IpAddr>().ok())
            })
        })
        .or_else(|| connect_info.map(|addr| addr.ip()));

    candidate.is_some_and(|ip| is_loopback_addr(&ip))
}

fn is_loopback_addr(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.octets()[0] == 127,
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_string_has_no_trailing_newline() {
        let s = canonical_string("POST", "/auth/token", "", b"{\"device_id\":\"d1\"}");
        assert_eq!(s, b"POST\n/auth/token\n\n{\"device_id\":\"d1\"}".to_vec());
    }

    #[test]
    fn verify_hmac_round_trips() {
        let secret = b"super-secret-key-material-32-by";
        let canonical = canonical_string("GET", "/system/device/stats", "device_id=d1", b"");
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(&canonical);
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(verify_hmac(secret, &canonical, &sig));
    }

    #[test]
    fn verify_hmac_rejects_single_byte_change() {
        let secret = b"super-secret-key-material-32-by";
        let canonical = canonical_string("GET", "/system/device/stats", "", b"");
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(&canonical);
        let mut sig = hex::encode(mac.finalize().into_bytes());
        let last = sig.pop().unwrap();
        sig.push(if last == '0' { '1' } else { '0' });
        assert!(!verify_hmac(secret, &canonical, &sig));
    }

    #[test]
    fn loopback_classification_table() {
        assert!(is_loopback_addr(&"127.0.0.1".parse().unwrap()));
        assert!(is_loopback_addr(&"127.5.5.5".parse().unwrap()));
        assert!(is_loopback_addr(&"::1".parse().unwrap()));
        assert!(!is_loopback_addr(&"10.0.0.5".parse().unwrap()));
        assert!(!is_loopback_addr(&"192.168.1.1".parse().unwrap()));
        assert!(!is_loopback_addr(&"8.8.8.8".parse().unwrap()));
    }
}
