#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;

use super::client::CloseRequest;
use super::codec::{Codec, Event, Payload};
use super::config::Config;
use super::error::WsError;
use super::message::WsMessage;
use super::reassembly::Reassembler;
use crate::error::{Error, Kind};
use crate::types::Target;
use crate::{Result, tls};

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempt was made yet
    Disconnected,
    /// Opening the transport and performing the handshake
    Connecting,
    /// Handshake completed
    Established {
        /// When the handshake completed
        since: Instant,
    },
    /// The connection was closed, by either side
    Closing,
    /// The opening handshake failed
    Failed,
    /// Waiting before the next connection attempt
    Reconnecting {
        /// Consecutive failed attempts so far, plus one
        attempt: u32,
    },
    /// No further connection attempts will be made
    Terminated,
}

impl ConnectionState {
    /// Check if the handshake completed and the connection is open.
    #[must_use]
    pub const fn is_established(self) -> bool {
        matches!(self, Self::Established { .. })
    }

    #[must_use]
    pub const fn is_terminated(self) -> bool {
        matches!(self, Self::Terminated)
    }
}

/// Requests from a [`ClientWebsocket`](super::ClientWebsocket) to its driver task.
pub(crate) enum Command {
    Send {
        payload: Payload,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        request: CloseRequest,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Connection flags readable without a round trip to the driver.
#[derive(Debug)]
pub(crate) struct Flags {
    pub(crate) ready: AtomicBool,
    pub(crate) reconnecting: AtomicBool,
    pub(crate) closed: AtomicBool,
}

impl Flags {
    pub(crate) fn new(reconnecting: bool) -> Self {
        Self {
            ready: AtomicBool::new(false),
            reconnecting: AtomicBool::new(reconnecting),
            closed: AtomicBool::new(true),
        }
    }
}

/// Transport and codec of one connection attempt. They are created and dropped together.
struct Session<C> {
    stream: MaybeTlsStream<TcpStream>,
    codec: C,
    established: bool,
}

/// What the driver does after a session step.
enum Flow {
    /// Keep serving the current session
    Continue,
    /// The session is gone; the reconnect policy decides what happens next
    Ended,
    /// Stop the driver
    Stop,
}

/// Owns the transport and the codec, and turns codec events into [`WsMessage`]s.
///
/// A `Connection` is driven by exactly one task, which is the only writer to the transport.
pub(crate) struct Connection<C: Codec> {
    target: Target,
    config: Config,
    session: Option<Session<C>>,
    reconnecting: bool,
    ready: bool,
    reassembler: Reassembler,
    read_buf: Vec<u8>,
    backoff: ExponentialBackoff,
    failures: u32,
    state_tx: watch::Sender<ConnectionState>,
    flags: Arc<Flags>,
}

impl<C: Codec> Connection<C> {
    pub(crate) fn new(
        target: Target,
        config: Config,
        state_tx: watch::Sender<ConnectionState>,
        flags: Arc<Flags>,
    ) -> Self {
        Self {
            reconnecting: config.reconnecting,
            read_buf: vec![0; config.read_chunk_size.max(1)],
            backoff: config.reconnect.clone().into(),
            target,
            config,
            session: None,
            ready: false,
            reassembler: Reassembler::default(),
            failures: 0,
            state_tx,
            flags,
        }
    }

    /// Drive the connection until it terminates or `cancel` fires.
    ///
    /// Dropping `events` at the end is what ends the consumer's stream.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::Sender<Result<WsMessage>>,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                #[cfg(feature = "tracing")]
                tracing::debug!(url = %self.target, "WebSocket handle dropped, stopping connection");
            }
            () = self.drive(&mut commands, &events) => {}
        }

        self.session = None;
        self.ready = false;
        self.set_state(ConnectionState::Terminated);
    }

    async fn drive(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        events: &mpsc::Sender<Result<WsMessage>>,
    ) {
        loop {
            self.set_state(ConnectionState::Connecting);

            if let Err(e) = self.open_connection().await {
                #[cfg(feature = "tracing")]
                tracing::warn!(url = %self.target, error = ?e, "Unable to connect");
                self.session = None;
                self.failures = self.failures.saturating_add(1);
                if let Flow::Stop = self.deliver(Err(e), commands, events).await {
                    return;
                }
            } else {
                loop {
                    match self.serve(commands, events).await {
                        Flow::Continue => self.publish(),
                        Flow::Ended => break,
                        Flow::Stop => return,
                    }
                }
            }

            if !self.reconnecting || !self.wait_reconnect(commands).await {
                return;
            }
        }
    }

    /// Open a new transport and start the handshake on a fresh codec.
    ///
    /// Any previous session is dropped first.
    pub(crate) async fn open_connection(&mut self) -> Result<()> {
        self.session = None;
        self.ready = false;
        self.reassembler.reset();

        let target = &self.target;
        #[cfg(feature = "tracing")]
        tracing::debug!(url = %target, "Opening WebSocket connection");

        let codec = C::client(
            &target.host_header(),
            &target.resource,
            &self.config.codec_options(),
        )?;

        let tls = if target.secure {
            Some(self.config.tls.resolve()?)
        } else {
            None
        };

        let tcp = TcpStream::connect((target.host.as_str(), target.port)).await?;
        tcp.set_nodelay(true)?;

        let stream = match tls {
            Some(config) => {
                let server_name = tls::server_name(&target.host)?;
                let stream = TlsConnector::from(config)
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| Error::with_source(Kind::Tls, e))?;
                MaybeTlsStream::Rustls(stream)
            }
            None => MaybeTlsStream::Plain(tcp),
        };

        self.session = Some(Session {
            stream,
            codec,
            established: false,
        });
        self.publish();

        self.flush().await
    }

    /// One step of an open session: a command from the handle, or one read from the transport.
    async fn serve(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        events: &mpsc::Sender<Result<WsMessage>>,
    ) -> Flow {
        let Some(session) = self.session.as_mut() else {
            return Flow::Ended;
        };

        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    return Flow::Stop;
                };
                self.handle_command(command).await;
                if self.session.is_none() {
                    return Flow::Ended;
                }
                Flow::Continue
            }
            read = session.stream.read(&mut self.read_buf) => {
                let received = match read {
                    Ok(0) => None,
                    Ok(n) => self.read_buf.get(..n),
                    Err(e) => return self.transport_failed(e.into(), commands, events).await,
                };

                #[cfg(feature = "tracing")]
                tracing::trace!(bytes = received.map_or(0, <[u8]>::len), "Received from transport");

                if let Some(session) = self.session.as_mut() {
                    session.codec.receive_bytes(received);
                }
                if let Err(e) = self.flush().await {
                    return self.transport_failed(e, commands, events).await;
                }
                self.dispatch(commands, events).await
            }
        }
    }

    /// Walk the codec's events in order, forwarding finished units to the consumer.
    async fn dispatch(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        events: &mpsc::Sender<Result<WsMessage>>,
    ) -> Flow {
        while let Some(event) = self.session.as_mut().and_then(|s| s.codec.next_event()) {
            #[cfg(feature = "tracing")]
            tracing::trace!(?event, "Codec event");

            let message = match event {
                Event::Established(established) => {
                    if self.ready {
                        return self
                            .unexpected("handshake completed twice".to_owned(), commands, events)
                            .await;
                    }
                    self.ready = true;
                    if let Some(session) = self.session.as_mut() {
                        session.established = true;
                    }
                    self.failures = 0;
                    self.backoff.reset();
                    self.set_state(ConnectionState::Established {
                        since: Instant::now(),
                    });
                    WsMessage::ConnectionEstablished(established)
                }
                Event::Data {
                    payload,
                    message_finished,
                } => {
                    if !self.ready {
                        return self
                            .unexpected(
                                "data before the handshake completed".to_owned(),
                                commands,
                                events,
                            )
                            .await;
                    }
                    match self.reassembler.push(payload, message_finished) {
                        Some(message) => message,
                        None => continue,
                    }
                }
                Event::Closed(frame) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(code = frame.code, reason = %frame.reason, "WebSocket closed");
                    self.ready = false;
                    self.set_state(ConnectionState::Closing);
                    return self
                        .finish(WsMessage::Closed(frame), commands, events)
                        .await;
                }
                Event::Failed(failed) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%failed, "WebSocket handshake failed");
                    self.ready = false;
                    self.set_state(ConnectionState::Failed);
                    return self
                        .finish(WsMessage::ConnectionFailed(failed), commands, events)
                        .await;
                }
            };

            match self.deliver(Ok(message), commands, events).await {
                Flow::Continue => {}
                flow => return flow,
            }
        }

        Flow::Continue
    }

    /// Hand `item` to the consumer, serving commands while the event channel is full.
    ///
    /// Returns [`Flow::Ended`] without delivering when a command closed the session `item`
    /// belongs to, or turned reconnecting off while no session was open.
    async fn deliver(
        &mut self,
        item: Result<WsMessage>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        events: &mpsc::Sender<Result<WsMessage>>,
    ) -> Flow {
        let had_session = self.session.is_some();
        let reconnecting = self.reconnecting;

        loop {
            tokio::select! {
                permit = events.reserve() => {
                    let Ok(permit) = permit else {
                        return Flow::Stop;
                    };
                    permit.send(item);
                    return Flow::Continue;
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        return Flow::Stop;
                    };
                    self.handle_command(command).await;

                    let session_closed = had_session && self.session.is_none();
                    let gave_up = !had_session && reconnecting && !self.reconnecting;
                    if session_closed || gave_up {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("Dropping undelivered message of a closed connection");
                        return Flow::Ended;
                    }
                }
            }
        }
    }

    /// Forward the final message of a session, then release the session.
    async fn finish(
        &mut self,
        message: WsMessage,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        events: &mpsc::Sender<Result<WsMessage>>,
    ) -> Flow {
        match self.deliver(Ok(message), commands, events).await {
            Flow::Stop => Flow::Stop,
            Flow::Continue | Flow::Ended => {
                self.end_session().await;
                Flow::Ended
            }
        }
    }

    async fn transport_failed(
        &mut self,
        e: Error,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        events: &mpsc::Sender<Result<WsMessage>>,
    ) -> Flow {
        #[cfg(feature = "tracing")]
        tracing::warn!(url = %self.target, error = ?e, "WebSocket transport failed");

        self.ready = false;
        self.drop_session();
        self.set_state(ConnectionState::Closing);
        match self.deliver(Err(e), commands, events).await {
            Flow::Stop => Flow::Stop,
            Flow::Continue | Flow::Ended => Flow::Ended,
        }
    }

    async fn unexpected(
        &mut self,
        event: String,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        events: &mpsc::Sender<Result<WsMessage>>,
    ) -> Flow {
        #[cfg(feature = "tracing")]
        tracing::error!(%event, "Codec and connection state disagree");

        self.ready = false;
        self.drop_session();
        let item = Err(WsError::UnexpectedEvent(event).into());
        self.deliver(item, commands, events).await;
        Flow::Stop
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { payload, reply } => {
                _ = reply.send(self.send_message(payload).await);
            }
            Command::Close { request, reply } => {
                _ = reply.send(self.close(request).await);
            }
        }
        self.publish();
    }

    /// Send one complete message as a single frame.
    pub(crate) async fn send_message<P: Into<Payload>>(&mut self, data: P) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(WsError::NotConnected.into());
        };

        session.codec.send_data(data.into(), true)?;
        self.flush().await
    }

    /// Start the closing handshake and release the transport.
    ///
    /// Unless `allow_reconnects` is set, no new connection is made afterwards.
    pub(crate) async fn close(&mut self, request: CloseRequest) -> Result<()> {
        if !request.allow_reconnects {
            self.reconnecting = false;
        }

        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.codec.close(request.code, &request.reason)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(code = request.code, reason = %request.reason, "Closing WebSocket");

        if let Err(e) = self.flush().await {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = ?e, "Unable to send close frame");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }

        self.ready = false;
        self.set_state(ConnectionState::Closing);
        self.end_session().await;
        Ok(())
    }

    /// `true` when there is no session, or its codec can no longer send or receive.
    pub(crate) fn closed(&self) -> bool {
        self.session.as_ref().is_none_or(|s| s.codec.closed())
    }

    async fn flush(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        let bytes = session.codec.bytes_to_send();
        if !bytes.is_empty() {
            session.stream.write_all(&bytes).await?;
            session.stream.flush().await?;
        }
        Ok(())
    }

    /// Shut the transport down, tell the codec, and drop both.
    async fn end_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.stream.shutdown().await {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = ?e, "Transport shutdown failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
            session.codec.receive_bytes(None);
            if !session.established {
                self.failures = self.failures.saturating_add(1);
            }
        }
        self.reassembler.reset();
        self.publish();
    }

    fn drop_session(&mut self) {
        if let Some(session) = self.session.take()
            && !session.established
        {
            self.failures = self.failures.saturating_add(1);
        }
        self.reassembler.reset();
        self.publish();
    }

    /// Sleep before the next attempt. Returns `false` when the driver should stop instead.
    async fn wait_reconnect(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
        if let Some(max) = self.config.reconnect.max_attempts
            && self.failures >= max
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(attempts = self.failures, "Giving up on reconnecting");
            return false;
        }

        let attempt = self.failures.saturating_add(1);
        self.set_state(ConnectionState::Reconnecting { attempt });

        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.config.reconnect.max_backoff);

        #[cfg(feature = "tracing")]
        tracing::debug!(attempt, ?delay, "Reconnecting");

        let pause = sleep(delay);
        tokio::pin!(pause);

        loop {
            tokio::select! {
                () = &mut pause => return true,
                command = commands.recv() => {
                    let Some(command) = command else {
                        return false;
                    };
                    self.handle_command(command).await;
                    if !self.reconnecting {
                        return false;
                    }
                }
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        _ = self.state_tx.send(state);
        self.publish();
    }

    fn publish(&self) {
        self.flags.ready.store(self.ready, Ordering::Release);
        self.flags
            .reconnecting
            .store(self.reconnecting, Ordering::Release);
        self.flags.closed.store(self.closed(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use super::*;
    use crate::ws::codec::{CodecOptions, FrameCodec};

    /// Emits data without ever completing a handshake.
    struct DataFirst {
        events: VecDeque<Event>,
    }

    impl Codec for DataFirst {
        fn client(_host: &str, _resource: &str, _options: &CodecOptions) -> Result<Self> {
            Ok(Self {
                events: VecDeque::from([Event::Data {
                    payload: Payload::from("early"),
                    message_finished: true,
                }]),
            })
        }

        fn receive_bytes(&mut self, _data: Option<&[u8]>) {}

        fn bytes_to_send(&mut self) -> Vec<u8> {
            Vec::new()
        }

        fn next_event(&mut self) -> Option<Event> {
            self.events.pop_front()
        }

        fn send_data(&mut self, _payload: Payload, _fin: bool) -> Result<()> {
            Ok(())
        }

        fn close(&mut self, _code: u16, _reason: &str) -> Result<()> {
            Ok(())
        }

        fn closed(&self) -> bool {
            false
        }
    }

    fn connection<C: Codec>(port: u16, config: Config) -> Connection<C> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let flags = Arc::new(Flags::new(config.reconnecting));
        Connection::new(Target::new("127.0.0.1", port, false, "/"), config, state_tx, flags)
    }

    #[tokio::test]
    async fn data_before_handshake_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"x").await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let conn = connection::<DataFirst>(port, Config::default());
        let (_commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, mut events) = mpsc::channel(8);
        tokio::spawn(conn.run(commands, events_tx, CancellationToken::new()));

        let first = timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        let err = first.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WsError>(),
            Some(WsError::UnexpectedEvent(_))
        ));

        let end = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn send_without_session_is_rejected() {
        let mut conn = connection::<DataFirst>(1, Config::default());

        let err = conn.send_message("hello").await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<WsError>(),
            Some(WsError::NotConnected)
        ));
        assert!(conn.closed());
    }

    #[tokio::test]
    async fn close_without_session_disables_reconnects() {
        let mut conn = connection::<DataFirst>(1, Config::default());
        assert!(conn.reconnecting);

        conn.close(CloseRequest::default()).await.unwrap();

        assert!(!conn.reconnecting);
        assert!(conn.closed());
    }

    #[tokio::test]
    async fn refused_connection_surfaces_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut conn = connection::<DataFirst>(port, Config::default());

        let err = conn.open_connection().await.unwrap_err();

        assert_eq!(err.kind(), Kind::Transport);
        assert!(conn.closed());
    }

    #[tokio::test]
    async fn invalid_header_fails_before_connecting() {
        let config = Config::builder()
            .headers(vec![("X-Token".to_owned(), "a\r\nX-Admin: 1".to_owned())])
            .build();
        // Nothing listens on port 1, so reaching the network would fail with `Transport`
        let mut conn = connection::<FrameCodec>(1, config);

        let err = conn.open_connection().await.unwrap_err();

        assert_eq!(err.kind(), Kind::Validation);
        assert!(conn.session.is_none());
    }
}
