//! Joins a room on a running `websocket-hub` server and prints what arrives.
//!
//! ```text
//! cargo run --example client -- ws://127.0.0.1:8080/ws lobby
//! ```

use std::time::Duration;

use serde_json::json;
use websocket_hub::{ClientConfig, WsClient};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| "ws://127.0.0.1:8080/ws".to_owned());
    let room = args.next().unwrap_or_else(|| "lobby".to_owned());

    let client = WsClient::new(ClientConfig::new(url))?;
    client.on_text(|text| println!("<- {text}"));
    client.on_disconnect(|error| println!("disconnected: {error:?}"));
    client.connect().await?;

    client.send_json(&json!({ "type": "join_room", "room": room }))?;
    for n in 0..5 {
        client.send_json(&json!({
            "type": "room_message",
            "room": room,
            "content": format!("hello #{n}"),
        }))?;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    client.close().await;
    Ok(())
}
