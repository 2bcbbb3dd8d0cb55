#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod error;
pub mod tls;
pub mod types;
pub mod ws;

use crate::error::Error;
use crate::types::Target;
pub use crate::ws::{ClientWebsocket, CloseRequest, Config, WsMessage};

pub type Result<T> = std::result::Result<T, Error>;

/// Start a [`ClientWebsocket`] for a `ws://` or `wss://` URL.
///
/// Fails only when `url` is not a valid WebSocket URL; connection errors are reported on the
/// client's message stream.
pub fn connect(url: &str, config: Config) -> Result<ClientWebsocket> {
    let target = Target::parse(url)?;
    Ok(ClientWebsocket::connect(target, config))
}
