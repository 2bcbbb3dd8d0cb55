//! Reconnecting WebSocket client.
//!
//! # Architecture
//!
//! - [`ClientWebsocket`]: consumer handle; spawns the driver task and exposes its messages as a
//!   [`Stream`](futures::Stream)
//! - `Connection`: owned by the driver task; opens the transport, feeds the codec and applies
//!   the reconnect policy
//! - [`Codec`](codec::Codec): sans-IO protocol session, [`FrameCodec`](codec::FrameCodec) by
//!   default
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt as _;
//! use resilient_ws::ws::{ClientWebsocket, Config, WsMessage};
//! use resilient_ws::types::Target;
//!
//! # async fn run() -> resilient_ws::Result<()> {
//! let target = Target::new("localhost", 8080, false, "/");
//! let mut client = ClientWebsocket::connect(target, Config::default());
//!
//! while let Some(message) = client.next().await {
//!     if let WsMessage::ConnectionEstablished(_) = message? {
//!         client.send_message("hello").await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
mod reassembly;

pub use client::{ClientWebsocket, CloseRequest};
pub use config::{Config, ReconnectConfig};
pub use connection::ConnectionState;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsMessage includes module name for clarity when used outside this module"
)]
pub use message::WsMessage;
