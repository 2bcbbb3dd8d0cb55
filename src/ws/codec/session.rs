use std::collections::VecDeque;
use std::io::Cursor;

use tokio_tungstenite::tungstenite::protocol::CloseFrame as WireClose;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{CloseCode, Control, Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::{Frame, FrameHeader, Utf8Bytes};

use super::handshake::{self, Response};
use super::{Codec, CodecOptions, Event, Payload};
use crate::Result;
use crate::error::Error;
use crate::ws::error::WsError;
use crate::ws::message::{CloseFrame, Failed};

/// Control frames carry at most this many payload bytes.
const MAX_CONTROL_PAYLOAD: u64 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Handshaking,
    Open,
    /// We sent a close frame and wait for the peer's
    LocalClosing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Binary,
}

impl Kind {
    fn opcode(self) -> Data {
        match self {
            Self::Text => Data::Text,
            Self::Binary => Data::Binary,
        }
    }
}

#[derive(Debug)]
struct Incoming {
    kind: Kind,
    size: usize,
}

/// A frame the peer was not allowed to send. The connection is closed with `code`.
#[derive(Debug, Clone, Copy)]
struct Violation {
    code: CloseCode,
    reason: &'static str,
}

impl Violation {
    const fn new(code: CloseCode, reason: &'static str) -> Self {
        Self { code, reason }
    }
}

/// RFC 6455 client session on top of tungstenite's frame and handshake types.
///
/// Inbound fragments are surfaced one by one as [`Event::Data`]; text fragments are decoded
/// incrementally so a code point split across two frames is delivered intact.
#[derive(Debug)]
pub struct FrameCodec {
    state: State,
    key: String,
    subprotocols: Vec<String>,
    max_message_size: usize,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    events: VecDeque<Event>,
    incoming: Option<Incoming>,
    outgoing: Option<Kind>,
    utf8_tail: Vec<u8>,
}

impl Codec for FrameCodec {
    fn client(host: &str, resource: &str, options: &CodecOptions) -> Result<Self> {
        let upgrade = handshake::request(host, resource, options)?;

        Ok(Self {
            state: State::Handshaking,
            key: upgrade.key,
            subprotocols: options.subprotocols.clone(),
            max_message_size: options.max_message_size,
            inbound: Vec::new(),
            outbound: upgrade.bytes,
            events: VecDeque::new(),
            incoming: None,
            outgoing: None,
            utf8_tail: Vec::new(),
        })
    }

    fn receive_bytes(&mut self, data: Option<&[u8]>) {
        let Some(data) = data else {
            self.receive_eof();
            return;
        };

        if self.state == State::Closed {
            return;
        }
        self.inbound.extend_from_slice(data);

        if self.state == State::Handshaking {
            match handshake::parse_response(&self.inbound, &self.key, &self.subprotocols) {
                Response::Partial => return,
                Response::Accepted {
                    consumed,
                    established,
                } => {
                    self.inbound.drain(..consumed);
                    self.state = State::Open;
                    self.events.push_back(Event::Established(established));
                }
                Response::Rejected(failed) => {
                    self.inbound = Vec::new();
                    self.state = State::Closed;
                    self.events.push_back(Event::Failed(failed));
                    return;
                }
            }
        }

        self.decode_frames();
    }

    fn bytes_to_send(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn send_data(&mut self, payload: Payload, fin: bool) -> Result<()> {
        match self.state {
            State::Open => {}
            State::Handshaking => return Err(WsError::NotEstablished.into()),
            State::LocalClosing | State::Closed => return Err(WsError::Closing.into()),
        }

        let (kind, data) = match payload {
            Payload::Text(text) => (Kind::Text, text.into_bytes()),
            Payload::Bytes(bytes) => (Kind::Binary, bytes),
        };

        let opcode = match self.outgoing {
            None => kind.opcode(),
            Some(started) if started == kind => Data::Continue,
            Some(_) => {
                return Err(Error::validation(
                    "cannot mix text and binary fragments in one message",
                ));
            }
        };
        self.outgoing = if fin { None } else { Some(kind) };

        self.write_frame(Frame::message(data, OpCode::Data(opcode), fin));
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let close_code = CloseCode::from(code);
        if !close_code.is_allowed() {
            return Err(WsError::InvalidCloseCode(code).into());
        }

        match self.state {
            State::Open => {
                self.write_close(close_code, reason);
                self.state = State::LocalClosing;
            }
            State::Handshaking => self.state = State::Closed,
            State::LocalClosing | State::Closed => {}
        }
        Ok(())
    }

    fn closed(&self) -> bool {
        self.state == State::Closed
    }
}

impl FrameCodec {
    fn write_frame(&mut self, mut frame: Frame) {
        frame.header_mut().mask = Some(rand::random());
        // Formatting into a Vec cannot fail.
        _ = frame.format(&mut self.outbound);
    }

    fn write_close(&mut self, code: CloseCode, reason: &str) {
        self.write_frame(Frame::close(Some(WireClose {
            code,
            reason: Utf8Bytes::from(truncate_reason(reason)),
        })));
    }

    fn receive_eof(&mut self) {
        match self.state {
            State::Handshaking => {
                self.state = State::Closed;
                self.events.push_back(Event::Failed(Failed::new(
                    None,
                    "connection closed during handshake",
                )));
            }
            State::Open | State::LocalClosing => {
                self.state = State::Closed;
                self.events
                    .push_back(Event::Closed(CloseFrame::new(CloseCode::Abnormal.into(), "")));
            }
            State::Closed => {}
        }
    }

    fn decode_frames(&mut self) {
        let mut offset = 0;

        while matches!(self.state, State::Open | State::LocalClosing) {
            let mut cursor = Cursor::new(self.inbound.get(offset..).unwrap_or_default());
            let parsed = FrameHeader::parse(&mut cursor);
            let header_len = usize::try_from(cursor.position()).unwrap_or(usize::MAX);

            let (header, len) = match parsed {
                Ok(Some(parsed)) => parsed,
                Ok(None) => break,
                Err(_) => {
                    self.fail(Violation::new(CloseCode::Protocol, "reserved opcode"));
                    break;
                }
            };
            let len = match self.check_header(&header, len) {
                Ok(len) => len,
                Err(violation) => {
                    self.fail(violation);
                    break;
                }
            };

            let start = offset.saturating_add(header_len);
            let end = start.saturating_add(len);
            let Some(payload) = self.inbound.get(start..end).map(<[u8]>::to_vec) else {
                break;
            };
            offset = end;

            if let Err(violation) = self.handle_frame(header.opcode, header.is_final, payload) {
                self.fail(violation);
            }
        }

        if self.state == State::Closed {
            self.inbound = Vec::new();
        } else {
            self.inbound.drain(..offset);
        }
    }

    /// Reject headers a server may not send, and return the payload length.
    fn check_header(&self, header: &FrameHeader, len: u64) -> std::result::Result<usize, Violation> {
        if header.rsv1 || header.rsv2 || header.rsv3 {
            return Err(Violation::new(CloseCode::Protocol, "reserved bits set"));
        }
        if header.mask.is_some() {
            return Err(Violation::new(
                CloseCode::Protocol,
                "server frames must not be masked",
            ));
        }
        if matches!(header.opcode, OpCode::Control(_)) {
            if !header.is_final {
                return Err(Violation::new(CloseCode::Protocol, "fragmented control frame"));
            }
            if len > MAX_CONTROL_PAYLOAD {
                return Err(Violation::new(CloseCode::Protocol, "control frame too long"));
            }
        }

        usize::try_from(len)
            .ok()
            .filter(|len| *len <= self.max_message_size)
            .ok_or(Violation::new(
                CloseCode::Size,
                "frame exceeds maximum message size",
            ))
    }

    fn handle_frame(
        &mut self,
        opcode: OpCode,
        fin: bool,
        payload: Vec<u8>,
    ) -> std::result::Result<(), Violation> {
        match opcode {
            OpCode::Data(data @ (Data::Text | Data::Binary)) => {
                if self.incoming.is_some() {
                    return Err(Violation::new(
                        CloseCode::Protocol,
                        "new data frame inside a fragmented message",
                    ));
                }
                let kind = if data == Data::Text {
                    Kind::Text
                } else {
                    Kind::Binary
                };
                self.incoming = Some(Incoming { kind, size: 0 });
                self.data_frame(payload, fin)
            }
            OpCode::Data(Data::Continue) => {
                if self.incoming.is_none() {
                    return Err(Violation::new(
                        CloseCode::Protocol,
                        "continuation frame without a message",
                    ));
                }
                self.data_frame(payload, fin)
            }
            OpCode::Control(Control::Ping) => {
                if self.state == State::Open {
                    self.write_frame(Frame::pong(payload));
                }
                Ok(())
            }
            OpCode::Control(Control::Pong) => Ok(()),
            OpCode::Control(Control::Close) => self.close_frame(&payload),
            OpCode::Data(Data::Reserved(_)) | OpCode::Control(Control::Reserved(_)) => {
                Err(Violation::new(CloseCode::Protocol, "reserved opcode"))
            }
        }
    }

    fn data_frame(&mut self, data: Vec<u8>, fin: bool) -> std::result::Result<(), Violation> {
        let Some(incoming) = self.incoming.as_mut() else {
            return Ok(());
        };

        incoming.size += data.len();
        if incoming.size > self.max_message_size {
            return Err(Violation::new(
                CloseCode::Size,
                "message exceeds maximum message size",
            ));
        }

        let payload = match incoming.kind {
            Kind::Binary => Payload::Bytes(data),
            Kind::Text => Payload::Text(self.decode_text(data, fin)?),
        };
        if fin {
            self.incoming = None;
        }

        self.events.push_back(Event::Data {
            payload,
            message_finished: fin,
        });
        Ok(())
    }

    /// Decode as much of `data` as forms complete code points, keeping a split sequence for
    /// the next fragment.
    fn decode_text(&mut self, data: Vec<u8>, fin: bool) -> std::result::Result<String, Violation> {
        let invalid = Violation::new(CloseCode::Invalid, "invalid UTF-8 in text message");

        let bytes = if self.utf8_tail.is_empty() {
            data
        } else {
            let mut bytes = std::mem::take(&mut self.utf8_tail);
            bytes.extend_from_slice(&data);
            bytes
        };

        match String::from_utf8(bytes) {
            Ok(text) => Ok(text),
            Err(e) => {
                let utf8 = e.utf8_error();
                if fin || utf8.error_len().is_some() {
                    return Err(invalid);
                }
                let mut bytes = e.into_bytes();
                self.utf8_tail = bytes.split_off(utf8.valid_up_to());
                String::from_utf8(bytes).map_err(|_e| invalid)
            }
        }
    }

    fn close_frame(&mut self, payload: &[u8]) -> std::result::Result<(), Violation> {
        let frame = match payload {
            [] => CloseFrame::new(CloseCode::Status.into(), ""),
            [_] => {
                return Err(Violation::new(
                    CloseCode::Protocol,
                    "close frame with one byte payload",
                ));
            }
            [hi, lo, reason @ ..] => {
                let code = u16::from_be_bytes([*hi, *lo]);
                if !CloseCode::from(code).is_allowed() {
                    return Err(Violation::new(CloseCode::Protocol, "invalid close code"));
                }
                let reason = std::str::from_utf8(reason).map_err(|_e| {
                    Violation::new(CloseCode::Invalid, "invalid UTF-8 in close reason")
                })?;
                CloseFrame::new(code, reason)
            }
        };

        if self.state == State::Open {
            if payload.is_empty() {
                self.write_frame(Frame::close(None));
            } else {
                self.write_close(CloseCode::from(frame.code), "");
            }
        }

        self.state = State::Closed;
        self.events.push_back(Event::Closed(frame));
        Ok(())
    }

    /// Close the connection because the peer broke the protocol.
    fn fail(&mut self, violation: Violation) {
        if self.state == State::Open {
            self.write_close(violation.code, violation.reason);
        }
        self.state = State::Closed;
        self.incoming = None;
        self.utf8_tail.clear();
        self.events.push_back(Event::Closed(CloseFrame::new(
            violation.code.into(),
            violation.reason,
        )));
    }
}

// Two of the control payload bytes are the status code.
fn truncate_reason(reason: &str) -> &str {
    const MAX_REASON: usize = 123;

    if reason.len() <= MAX_REASON {
        return reason;
    }
    let mut end = MAX_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason.get(..end).unwrap_or_default()
}
