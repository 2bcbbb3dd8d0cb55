use std::fmt;

use url::Url;

use crate::Result;
use crate::error::Error;

const DEFAULT_PLAIN_PORT: u16 = 80;
const DEFAULT_SECURE_PORT: u16 = 443;

/// Where a [`ClientWebsocket`](crate::ws::ClientWebsocket) connects to.
///
/// Set once at construction and never mutated; every reconnect dials the same target.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Host name or IP literal, also used for SNI and the `Host` header
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Wrap the TCP stream in TLS
    pub secure: bool,
    /// Request target of the upgrade request, e.g. `/chat?room=1`
    pub resource: String,
}

impl Target {
    #[must_use]
    pub fn new<H: Into<String>, R: Into<String>>(
        host: H,
        port: u16,
        secure: bool,
        resource: R,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
            resource: resource.into(),
        }
    }

    /// Parse a `ws://` or `wss://` URL.
    ///
    /// The port defaults to 80 or 443 depending on the scheme, and the resource keeps the
    /// query string. An empty path becomes `/`.
    pub fn parse(url: &str) -> Result<Self> {
        let url = Url::parse(url)?;

        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(Error::validation(format!(
                    "unsupported scheme `{other}`, expected ws or wss"
                )));
            }
        };

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.trim_start_matches('[').trim_end_matches(']'),
            _ => return Err(Error::validation("URL has no host")),
        };

        let port = url.port().unwrap_or(if secure {
            DEFAULT_SECURE_PORT
        } else {
            DEFAULT_PLAIN_PORT
        });

        let mut resource = url.path().to_owned();
        if resource.is_empty() {
            resource.push('/');
        }
        if let Some(query) = url.query() {
            resource.push('?');
            resource.push_str(query);
        }

        Ok(Self::new(host, port, secure, resource))
    }

    /// Value of the `Host` header: the port is omitted when it is the scheme default.
    #[must_use]
    pub fn host_header(&self) -> String {
        let default_port = if self.secure {
            DEFAULT_SECURE_PORT
        } else {
            DEFAULT_PLAIN_PORT
        };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "wss" } else { "ws" };
        write!(f, "{scheme}://{}{}", self.host_header(), self.resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    #[test]
    fn parse_plain_url_uses_default_port() {
        let target = Target::parse("ws://echo.websocket.org").unwrap();

        assert_eq!(target.host, "echo.websocket.org");
        assert_eq!(target.port, 80);
        assert!(!target.secure);
        assert_eq!(target.resource, "/");
    }

    #[test]
    fn parse_secure_url_keeps_path_and_query() {
        let target = Target::parse("wss://example.com:8443/feed/v1?token=abc").unwrap();

        assert_eq!(target.port, 8443);
        assert!(target.secure);
        assert_eq!(target.resource, "/feed/v1?token=abc");
        assert_eq!(target.to_string(), "wss://example.com:8443/feed/v1?token=abc");
    }

    #[test]
    fn parse_ipv6_host_strips_brackets() {
        let target = Target::parse("ws://[::1]:9001/").unwrap();

        assert_eq!(target.host, "::1");
        assert_eq!(target.host_header(), "[::1]:9001");
    }

    #[test]
    fn parse_rejects_http_scheme() {
        let err = Target::parse("https://example.com").unwrap_err();

        assert_eq!(err.kind(), Kind::Validation);
    }

    #[test]
    fn host_header_omits_default_port() {
        let target = Target::new("example.com", 443, true, "/");

        assert_eq!(target.host_header(), "example.com");
    }
}
