#![expect(
    clippy::module_name_repetitions,
    reason = "ClientWebsocket names the role of the connection it manages"
)]

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

use bon::Builder;
use futures::Stream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::codec::{Codec, FrameCodec, Payload};
use super::config::Config;
use super::connection::{Command, Connection, ConnectionState, Flags};
use super::error::WsError;
use super::message::WsMessage;
use crate::Result;
use crate::types::Target;

/// Parameters of [`ClientWebsocket::close`].
///
/// ```
/// use resilient_ws::CloseRequest;
///
/// let request = CloseRequest::builder().reason("Thank you!").build();
///
/// assert_eq!(request.code, 1000);
/// assert!(!request.allow_reconnects);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct CloseRequest {
    /// Status code sent in the close frame
    #[builder(default = 1000)]
    pub code: u16,
    /// Reason sent in the close frame
    #[builder(default = "No reason".to_owned())]
    pub reason: String,
    /// Keep the reconnect policy enabled, so a new connection is opened afterwards
    #[builder(default)]
    pub allow_reconnects: bool,
}

impl Default for CloseRequest {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Reconnecting WebSocket client.
///
/// The connection is driven by a background task that is started by [`ClientWebsocket::connect`]
/// and stopped when the handle is dropped. Messages are consumed through the [`Stream`]
/// implementation or [`ClientWebsocket::next_message`]; the stream ends once the connection is
/// closed and reconnecting is disabled.
///
/// Transport errors are yielded as `Err` items; they do not end the stream while the client
/// keeps reconnecting.
#[derive(Debug)]
pub struct ClientWebsocket {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::Receiver<Result<WsMessage>>,
    state_rx: watch::Receiver<ConnectionState>,
    flags: Arc<Flags>,
    _cancel: DropGuard,
}

impl ClientWebsocket {
    /// Start connecting to `target` with the default [`FrameCodec`].
    ///
    /// Returns immediately; the first connection attempt happens in the background. Must be
    /// called from within a tokio runtime.
    #[must_use]
    pub fn connect(target: Target, config: Config) -> Self {
        Self::with_codec::<FrameCodec>(target, config)
    }

    /// Start connecting to `target`, creating a `C` for every connection attempt.
    #[must_use]
    pub fn with_codec<C: Codec>(target: Target, config: Config) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::channel(config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let flags = Arc::new(Flags::new(config.reconnecting));
        let cancel = CancellationToken::new();

        let connection = Connection::<C>::new(target, config, state_tx, Arc::clone(&flags));
        tokio::spawn(connection.run(command_rx, event_tx, cancel.clone()));

        Self {
            commands,
            events,
            state_rx,
            flags,
            _cancel: cancel.drop_guard(),
        }
    }

    /// Next message, or `None` once the connection has terminated.
    pub async fn next_message(&mut self) -> Option<Result<WsMessage>> {
        self.events.recv().await
    }

    /// Send one complete text or binary message.
    ///
    /// Fails when no connection is open or its handshake has not completed yet.
    pub async fn send_message<P: Into<Payload>>(&self, data: P) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Send {
                payload: data.into(),
                reply,
            })
            .map_err(|_e| WsError::ConnectionClosed)?;

        response.await.map_err(|_e| WsError::ConnectionClosed)?
    }

    /// Send a close frame and release the transport.
    ///
    /// Closing a client whose connection already terminated is a no-op.
    pub async fn close(&self, request: CloseRequest) -> Result<()> {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::Close { request, reply })
            .is_err()
        {
            return Ok(());
        }

        response.await.unwrap_or(Ok(()))
    }

    /// `true` when no connection is open or the open one can no longer send or receive.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.flags.closed.load(Ordering::Acquire)
    }

    /// `true` between a completed handshake and the next close or failure.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.flags.ready.load(Ordering::Acquire)
    }

    /// Whether a new connection will be opened after the current one closes or fails.
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.flags.reconnecting.load(Ordering::Acquire)
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    ///
    /// Useful for detecting reconnections.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

impl Stream for ClientWebsocket {
    type Item = Result<WsMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}
