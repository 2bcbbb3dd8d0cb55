//! Sends one binary message to an echo server and closes once it comes back.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example echo --features tracing -- wss://echo.websocket.org
//! ```

use futures::StreamExt as _;
use resilient_ws::{CloseRequest, Config, WsMessage};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://echo.websocket.org".to_owned());

    let config = Config::builder().reconnecting(false).build();
    let mut client = resilient_ws::connect(&url, config)?;

    while let Some(message) = client.next().await {
        let message = message?;
        tracing::info!(?message, "Event received");

        match message {
            WsMessage::ConnectionEstablished(_) => client.send_message(b"test").await?,
            WsMessage::Bytes(data) => {
                tracing::info!(?data, "Got response");
                client
                    .close(CloseRequest::builder().reason("Thank you!").build())
                    .await?;
            }
            _ => {}
        }
    }

    Ok(())
}
