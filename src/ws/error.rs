#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// No transport is open
    NotConnected,
    /// The opening handshake has not completed yet
    NotEstablished,
    /// A close frame was already sent or received
    Closing,
    /// Close code that may not be sent on the wire
    InvalidCloseCode(u16),
    /// The connection driver has stopped and no longer accepts commands
    ConnectionClosed,
    /// The codec produced an event the connection manager cannot accept in its current state
    UnexpectedEvent(String),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "WebSocket is not connected"),
            Self::NotEstablished => write!(f, "WebSocket handshake has not completed"),
            Self::Closing => write!(f, "WebSocket is closing"),
            Self::InvalidCloseCode(code) => write!(f, "Invalid close code {code}"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::UnexpectedEvent(event) => write!(f, "Unexpected protocol event: {event}"),
        }
    }
}

impl StdError for WsError {}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}
