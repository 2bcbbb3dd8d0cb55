#![expect(
    clippy::module_name_repetitions,
    reason = "WsMessage mirrors the message type exposed by other WebSocket clients"
)]

use std::fmt;

/// Details of a completed opening handshake.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Established {
    /// Subprotocol selected by the server, if one was offered and accepted
    pub subprotocol: Option<String>,
}

/// Why a connection did not complete its opening handshake.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failed {
    /// HTTP status of the handshake response, when one was received
    pub status: Option<u16>,
    pub reason: String,
}

impl Failed {
    pub(crate) fn new<S: Into<String>>(status: Option<u16>, reason: S) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Failed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "handshake failed with status {status}: {}", self.reason),
            None => write!(f, "handshake failed: {}", self.reason),
        }
    }
}

/// Close code and reason of a finished connection.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    #[must_use]
    pub fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// A message produced by a [`ClientWebsocket`](super::ClientWebsocket).
///
/// Data messages are always complete: fragments are reassembled before they are handed out.
///
/// ```
/// use resilient_ws::WsMessage;
///
/// fn describe(message: &WsMessage) -> String {
///     match message {
///         WsMessage::ConnectionEstablished(_) => "open".to_owned(),
///         WsMessage::ConnectionFailed(failed) => failed.to_string(),
///         WsMessage::Closed(frame) => format!("closed with {}", frame.code),
///         WsMessage::Text(text) => text.clone(),
///         WsMessage::Bytes(bytes) => format!("{} bytes", bytes.len()),
///         _ => String::new(),
///     }
/// }
///
/// assert_eq!(describe(&WsMessage::Bytes(b"test".to_vec())), "4 bytes");
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// The opening handshake completed
    ConnectionEstablished(Established),
    /// The opening handshake was rejected or could not complete
    ConnectionFailed(Failed),
    /// The connection was closed, by either side
    Closed(CloseFrame),
    /// A complete text message
    Text(String),
    /// A complete binary message
    Bytes(Vec<u8>),
}

impl WsMessage {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// `true` for text and binary messages.
    #[must_use]
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Text(_) | Self::Bytes(_))
    }
}
