//! End-to-end smoke check against a running relay.
//!
//! Connects `alice` and `bob`, exchanges a private message in each direction
//! and a broadcast, and verifies what each side receives.

use anyhow::{Context, Result, bail};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};
use tracing::info;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Run the smoke check against `base_url` (e.g. `ws://127.0.0.1:8000`).
pub async fn run(base_url: &str, timeout: Duration) -> Result<()> {
    let base_url = base_url.trim_end_matches('/');

    info!("Connecting both clients...");
    let mut alice = connect(base_url, "alice").await?;
    let mut bob = connect(base_url, "bob").await?;

    // Each client sees its own broadcast only once it is registered
    announce(&mut alice, "alice", timeout).await?;
    announce(&mut bob, "bob", timeout).await?;

    info!("alice -> bob (private)");
    send(&mut alice, r#"{"to": "bob", "message": "hello bob"}"#).await?;
    expect(&mut bob, "bob", "(private) alice: hello bob", timeout).await?;
    expect(&mut alice, "alice", "(to bob) You: hello bob", timeout).await?;

    info!("bob -> alice (private)");
    send(&mut bob, r#"{"to": "alice", "message": "hi alice"}"#).await?;
    expect(&mut alice, "alice", "(private) bob: hi alice", timeout).await?;
    expect(&mut bob, "bob", "(to alice) You: hi alice", timeout).await?;

    info!("alice -> all (broadcast)");
    send(&mut alice, r#"{"message": "hello everyone"}"#).await?;
    expect(&mut bob, "bob", "alice: hello everyone", timeout).await?;
    expect(&mut alice, "alice", "alice: hello everyone", timeout).await?;

    let _ = alice.close(None).await;
    expect(&mut bob, "bob", "alice left the chat", timeout).await?;
    let _ = bob.close(None).await;

    info!("Smoke test succeeded");
    Ok(())
}

async fn connect(base_url: &str, username: &str) -> Result<Client> {
    let url = format!("{base_url}/ws/{username}");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    Ok(ws)
}

async fn announce(client: &mut Client, username: &str, timeout: Duration) -> Result<()> {
    send(client, &format!(r#"{{"message": "{username} is here"}}"#)).await?;
    expect(client, username, &format!("{username}: {username} is here"), timeout).await
}

async fn send(client: &mut Client, text: &str) -> Result<()> {
    client
        .send(tungstenite::Message::Text(text.into()))
        .await
        .context("Failed to send frame")
}

/// Read frames until `expected` arrives, skipping anything else.
async fn expect(client: &mut Client, who: &str, expected: &str, timeout: Duration) -> Result<()> {
    tokio::time::timeout(timeout, read_until(client, who, expected))
        .await
        .with_context(|| format!("{who}: timed out waiting for {expected:?}"))?
}

async fn read_until(client: &mut Client, who: &str, expected: &str) -> Result<()> {
    while let Some(msg) = client.next().await {
        match msg.with_context(|| format!("{who}: connection failed"))? {
            tungstenite::Message::Text(text) if text.as_str() == expected => {
                info!("{} received: {}", who, text.as_str());
                return Ok(());
            }
            tungstenite::Message::Text(text) => {
                info!("{} skipped: {}", who, text.as_str());
            }
            tungstenite::Message::Close(_) => break,
            _ => {}
        }
    }
    bail!("{who}: connection closed while waiting for {expected:?}")
}
