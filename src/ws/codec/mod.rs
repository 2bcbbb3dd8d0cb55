//! Sans-IO protocol codec boundary.
//!
//! A [`Codec`] never touches the network: the connection manager feeds it raw bytes, drains
//! the bytes it wants written, and walks the [`Event`]s it produced. [`FrameCodec`] is the
//! RFC 6455 client implementation used by default; it frames and parses with tungstenite.

mod handshake;
mod session;

pub use session::FrameCodec;

use super::message::{CloseFrame, Established, Failed};
use crate::Result;

/// Data handed to or produced by a codec.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Bytes(bytes) => bytes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Payload {
    fn from(bytes: &[u8; N]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

/// Discrete protocol event, in the order the codec observed it on the wire.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The server accepted the opening handshake
    Established(Established),
    /// The connection closed; no further events follow
    Closed(CloseFrame),
    /// One fragment of a data message
    Data {
        payload: Payload,
        message_finished: bool,
    },
    /// The opening handshake failed; no further events follow
    Failed(Failed),
}

/// Handshake settings a codec needs besides host and resource.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct CodecOptions {
    /// Subprotocols offered in `Sec-WebSocket-Protocol`
    pub subprotocols: Vec<String>,
    /// Additional request headers
    pub headers: Vec<(String, String)>,
    /// Largest accepted message, across all of its fragments
    pub max_message_size: usize,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            subprotocols: Vec::new(),
            headers: Vec::new(),
            max_message_size: super::config::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Client-role WebSocket protocol session.
///
/// One value lives exactly as long as one transport: the connection manager creates a fresh
/// codec for every connection attempt.
pub trait Codec: Send + 'static {
    /// Start a client session for `resource` on `host`. The handshake request is immediately
    /// available from [`Codec::bytes_to_send`].
    ///
    /// Fails when the request cannot be built, e.g. for a header value with a line break.
    fn client(host: &str, resource: &str, options: &CodecOptions) -> Result<Self>
    where
        Self: Sized;

    /// Feed received bytes, or `None` once the transport reached end of stream.
    fn receive_bytes(&mut self, data: Option<&[u8]>);

    /// Take everything that should be written to the transport. May be empty.
    fn bytes_to_send(&mut self) -> Vec<u8>;

    /// Next pending event, if any.
    fn next_event(&mut self) -> Option<Event>;

    /// Queue `payload` as one frame; `fin = false` starts or continues a fragmented message.
    fn send_data(&mut self, payload: Payload, fin: bool) -> Result<()>;

    /// Start the closing handshake.
    fn close(&mut self, code: u16, reason: &str) -> Result<()>;

    /// `true` once the session can neither send nor receive anymore.
    fn closed(&self) -> bool;
}
