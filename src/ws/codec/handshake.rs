//! Opening handshake, built and parsed with tungstenite's HTTP types.

use tokio_tungstenite::tungstenite::handshake::client::{
    Request as HttpRequest, Response as HttpResponse, generate_key, generate_request,
};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::handshake::machine::TryParse as _;
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};

use super::CodecOptions;
use crate::Result;
use crate::error::{Error, Kind};
use crate::ws::message::{Established, Failed};

/// Largest response header block buffered before the handshake fails.
pub(crate) const MAX_RESPONSE_SIZE: usize = 64 << 10;

/// Serialized upgrade request.
pub(crate) struct Upgrade {
    /// `Sec-WebSocket-Key` sent with the request
    pub(crate) key: String,
    pub(crate) bytes: Vec<u8>,
}

/// Build the upgrade request. Header names and values are validated, so a value carrying a
/// line break is rejected instead of being written to the wire.
pub(crate) fn request(host: &str, resource: &str, options: &CodecOptions) -> Result<Upgrade> {
    let mut builder = HttpRequest::builder()
        .method("GET")
        .uri(resource)
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key());
    if !options.subprotocols.is_empty() {
        builder = builder.header("Sec-WebSocket-Protocol", options.subprotocols.join(", "));
    }
    for (name, value) in &options.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let request = builder
        .body(())
        .map_err(|e| Error::with_source(Kind::Validation, e))?;
    let (bytes, key) =
        generate_request(request).map_err(|e| Error::with_source(Kind::Validation, e))?;

    Ok(Upgrade { key, bytes })
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Response {
    /// The header block is not complete yet
    Partial,
    /// Handshake accepted; `consumed` bytes belonged to the header block
    Accepted {
        consumed: usize,
        established: Established,
    },
    Rejected(Failed),
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}

fn has_token(value: Option<&str>, token: &str) -> bool {
    value.is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
}

/// Validate the server's response to an [`Upgrade`] carrying `key`.
pub(crate) fn parse_response(buf: &[u8], key: &str, offered: &[String]) -> Response {
    let (consumed, response) = match HttpResponse::try_parse(buf) {
        Ok(Some(parsed)) => parsed,
        Ok(None) if buf.len() > MAX_RESPONSE_SIZE => {
            return Response::Rejected(Failed::new(
                None,
                format!("handshake response exceeds {MAX_RESPONSE_SIZE} bytes"),
            ));
        }
        Ok(None) => return Response::Partial,
        Err(e) => {
            return Response::Rejected(Failed::new(None, format!("malformed response: {e}")));
        }
    };

    let status = response.status();
    if status != StatusCode::SWITCHING_PROTOCOLS {
        let reason = status.canonical_reason().unwrap_or("unexpected status");
        return Response::Rejected(Failed::new(Some(status.as_u16()), reason));
    }

    let headers = response.headers();
    let reject = |reason: &str| Response::Rejected(Failed::new(Some(status.as_u16()), reason));

    if !has_token(header(headers, "Upgrade"), "websocket") {
        return reject("missing `Upgrade: websocket`");
    }
    if !has_token(header(headers, "Connection"), "upgrade") {
        return reject("missing `Connection: Upgrade`");
    }
    if header(headers, "Sec-WebSocket-Accept") != Some(derive_accept_key(key.as_bytes()).as_str()) {
        return reject("`Sec-WebSocket-Accept` does not match the request key");
    }
    if headers.contains_key("Sec-WebSocket-Extensions") {
        return reject("server selected an extension that was not offered");
    }

    let subprotocol = match header(headers, "Sec-WebSocket-Protocol") {
        None => None,
        Some(selected) if offered.iter().any(|p| p == selected) => Some(selected.to_owned()),
        Some(_) => return reject("server selected a subprotocol that was not offered"),
    };

    Response::Accepted {
        consumed,
        established: Established { subprotocol },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted_response(key: &str, extra: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             {extra}\r\n",
            derive_accept_key(key.as_bytes())
        )
        .into_bytes()
    }

    #[test]
    fn request_contains_upgrade_headers() {
        let options = CodecOptions {
            subprotocols: vec!["chat".to_owned(), "superchat".to_owned()],
            headers: vec![("Authorization".to_owned(), "Bearer t".to_owned())],
            ..CodecOptions::default()
        };

        let request = request("example.com:8080", "/feed?x=1", &options).unwrap();
        let text = String::from_utf8(request.bytes).unwrap().to_ascii_lowercase();

        assert!(text.starts_with("get /feed?x=1 http/1.1\r\n"));
        assert!(text.contains("host: example.com:8080\r\n"));
        assert!(text.contains("upgrade: websocket\r\n"));
        assert!(text.contains(&format!(
            "sec-websocket-key: {}\r\n",
            request.key.to_ascii_lowercase()
        )));
        assert!(text.contains("sec-websocket-version: 13\r\n"));
        assert!(text.contains("sec-websocket-protocol: chat, superchat\r\n"));
        assert!(text.contains("authorization: bearer t\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn header_injection_is_rejected() {
        let injected = CodecOptions {
            headers: vec![("X-Token".to_owned(), "a\r\nX-Admin: 1".to_owned())],
            ..CodecOptions::default()
        };
        let bad_name = CodecOptions {
            headers: vec![("X-Token\r\nX-Admin".to_owned(), "1".to_owned())],
            ..CodecOptions::default()
        };

        for options in [injected, bad_name] {
            let err = request("example.com", "/", &options).err().unwrap();
            assert_eq!(err.kind(), Kind::Validation);
        }
    }

    #[test]
    fn duplicate_upgrade_header_is_rejected() {
        let options = CodecOptions {
            headers: vec![("Host".to_owned(), "evil.example".to_owned())],
            ..CodecOptions::default()
        };

        assert!(request("example.com", "/", &options).is_err());
    }

    #[test]
    fn rfc_sample_key_is_accepted() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let response = b"HTTP/1.1 101 Switching Protocols\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";

        let parsed = parse_response(response, key, &[]);

        assert_eq!(
            parsed,
            Response::Accepted {
                consumed: response.len(),
                established: Established::default(),
            }
        );
    }

    #[test]
    fn partial_header_block_waits() {
        let key = generate_key();
        let response = accepted_response(&key, "");

        assert_eq!(
            parse_response(&response[..20], &key, &[]),
            Response::Partial
        );
    }

    #[test]
    fn oversized_header_block_is_rejected() {
        let mut response = b"HTTP/1.1 101 Switching Protocols\r\nX-Pad: ".to_vec();
        response.resize(MAX_RESPONSE_SIZE + 1, b'a');

        assert!(matches!(
            parse_response(&response, "k", &[]),
            Response::Rejected(Failed { status: None, .. })
        ));
    }

    #[test]
    fn trailing_frame_bytes_are_not_consumed() {
        let key = generate_key();
        let mut response = accepted_response(&key, "");
        let header_len = response.len();
        response.extend_from_slice(&[0x81, 0x00]);

        match parse_response(&response, &key, &[]) {
            Response::Accepted { consumed, .. } => assert_eq!(consumed, header_len),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_101_status_is_rejected() {
        let response = b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n";

        let parsed = parse_response(response, "irrelevant", &[]);

        assert_eq!(parsed, Response::Rejected(Failed::new(Some(403), "Forbidden")));
    }

    #[test]
    fn wrong_accept_key_is_rejected() {
        let response = accepted_response("some-other-key", "");

        assert!(matches!(
            parse_response(&response, &generate_key(), &[]),
            Response::Rejected(Failed {
                status: Some(101),
                ..
            })
        ));
    }

    #[test]
    fn unoffered_extension_is_rejected() {
        let key = generate_key();
        let response = accepted_response(&key, "Sec-WebSocket-Extensions: permessage-deflate\r\n");

        assert!(matches!(
            parse_response(&response, &key, &[]),
            Response::Rejected(_)
        ));
    }

    #[test]
    fn subprotocol_must_be_offered() {
        let key = generate_key();
        let response = accepted_response(&key, "Sec-WebSocket-Protocol: chat\r\n");

        let offered = vec!["chat".to_owned()];
        match parse_response(&response, &key, &offered) {
            Response::Accepted { established, .. } => {
                assert_eq!(established.subprotocol.as_deref(), Some("chat"));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            parse_response(&response, &key, &[]),
            Response::Rejected(_)
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            parse_response(b"\x00\x01 not http\r\n\r\n", "k", &[]),
            Response::Rejected(Failed { status: None, .. })
        ));
    }
}
