//! `tokend-getjwt` — self-issues a device token over the loopback HMAC gate.
//!
//! A standalone HTTP client with no dependency on `tokend-core`. It reads
//! the shared secret straight off disk, signs the canonical string for
//! `POST /auth/token` the same way the server verifies it, and prints the
//! resulting token JSON to stdout. It never talks to the database and
//! carries no privilege beyond filesystem read access to the shared secret
//! file — the server remains the sole writer of all persisted state.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::net::TcpStream;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Serialize)]
struct CreateTokenBody<'a> {
    device_id: &'a str,
}

const SHARED_SECRET_FILE: &str = "shared_secret.bin";
const DEFAULT_PORT: u16 = 31415;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Self-issue a device token from the local token daemon.
#[derive(Parser)]
#[command(
    name = "tokend-getjwt",
    version,
    about = "Bootstrap a device token over the loopback HMAC gate",
    long_about = None,
)]
struct Cli {
    /// Device id to request a token for.
    device_id: String,

    /// Port the token daemon is listening on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory holding `shared_secret.bin`.
    #[arg(long, env = "TOKEND_SECRETS_DIR", default_value = "./data/secrets")]
    secrets_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(token_json) => {
            println!("{token_json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<String> {
    check_listening(cli.port)
        .with_context(|| format!("nothing is listening on 127.0.0.1:{}", cli.port))?;

    let secret = read_shared_secret(&cli.secrets_dir)?;

    let body = serde_json::to_string(&CreateTokenBody { device_id: &cli.device_id })
        .context("failed to serialize request body")?;
    let canonical = canonical_string("POST", "/auth/token", "", &body);
    let signature = sign(&secret, &canonical);

    let url = format!("http://127.0.0.1:{}/auth/token", cli.port);
    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .header("X-Request-Signature", signature)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .context("request to token daemon failed")?;

    let status = response.status();
    let text = response.text().await.context("failed to read response body")?;
    if !status.is_success() {
        bail!("token daemon returned {status}: {text}");
    }
    Ok(text)
}

/// Confirms a TCP listener is up before attempting the signed request, so
/// failures read as "nothing is listening" rather than a signature error.
fn check_listening(port: u16) -> Result<()> {
    TcpStream::connect_timeout(&format!("127.0.0.1:{port}").parse()?, CONNECT_TIMEOUT)?;
    Ok(())
}

fn read_shared_secret(secrets_dir: &std::path::Path) -> Result<Vec<u8>> {
    let path = secrets_dir.join(SHARED_SECRET_FILE);
    let bytes = std::fs::read(&path)
        .with_context(|| format!("failed to read shared secret at {}", path.display()))?;
    if bytes.is_empty() {
        bail!("shared secret file at {} is empty", path.display());
    }
    Ok(bytes)
}

fn canonical_string(method: &str, path: &str, query: &str, body: &str) -> String {
    format!("{method}\n{path}\n{query}\n{body}")
}

fn sign(secret: &[u8], canonical: &str) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
