//! Manual smoke test against a running daemon.
//!
//! Start `tokend` with a configuration in hand, then:
//!
//! ```sh
//! cargo run --example smoke_client -- <hex-config-blob>
//! ```
//!
//! Walks the whole surface: configure, enumerate, acquire the first
//! device, ping it, release.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

const BASE_URL: &str = "https://127.0.0.1:21324";

#[tokio::main]
async fn main() -> Result<()> {
    let blob = std::env::args()
        .nth(1)
        .context("usage: smoke_client <hex-config-blob>")?;

    // the daemon's certificate is typically self-issued on dev machines
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()?;

    let index: Value = client.get(BASE_URL).send().await?.json().await?;
    println!("version {}, configured: {}", index["version"], index["configured"]);

    let response = client
        .post(format!("{BASE_URL}/configure"))
        .body(blob)
        .send()
        .await?;
    if !response.status().is_success() {
        bail!("configure failed: {}", response.text().await?);
    }
    println!("configuration installed");

    let devices: Value = client
        .get(format!("{BASE_URL}/enumerate"))
        .send()
        .await?
        .json()
        .await?;
    println!("devices: {devices}");

    let Some(first) = devices.as_array().and_then(|list| list.first()) else {
        println!("no devices connected, stopping here");
        return Ok(());
    };
    let path = first["path"].as_str().context("path missing")?;

    let acquired: Value = client
        .post(format!("{BASE_URL}/acquire/{path}"))
        .send()
        .await?
        .json()
        .await?;
    let session = acquired["session"].as_str().context("no session granted")?;
    println!("session: {session}");

    let reply: Value = client
        .post(format!("{BASE_URL}/call/{session}"))
        .body(json!({ "type": "Ping", "message": { "message": "smoke" } }).to_string())
        .send()
        .await?
        .json()
        .await?;
    println!("reply: {reply}");

    client
        .post(format!("{BASE_URL}/release/{session}"))
        .send()
        .await?
        .error_for_status()?;
    println!("released");

    Ok(())
}
