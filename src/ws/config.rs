#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;

use super::codec::CodecOptions;
use crate::tls::TlsConfig;

const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_READ_CHUNK_SIZE: usize = 4096;
const DEFAULT_EVENT_CAPACITY: usize = 1024;
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 << 20;

/// Configuration for WebSocket client behavior.
///
/// ```
/// use resilient_ws::Config;
///
/// let config = Config::builder()
///     .reconnecting(false)
///     .subprotocols(vec!["chat".to_owned()])
///     .build();
///
/// assert!(!config.reconnecting);
/// assert_eq!(config.read_chunk_size, 4096);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Re-open the connection after it was closed or failed
    #[builder(default = true)]
    pub reconnecting: bool,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// TLS settings for `wss://` targets
    #[builder(default, into)]
    pub tls: TlsConfig,
    /// Largest chunk read from the transport at once
    #[builder(default = DEFAULT_READ_CHUNK_SIZE)]
    pub read_chunk_size: usize,
    /// Number of messages buffered for the consumer before the connection stops reading
    #[builder(default = DEFAULT_EVENT_CAPACITY)]
    pub event_capacity: usize,
    /// Largest accepted message, across all of its fragments
    #[builder(default = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,
    /// Subprotocols offered during the handshake
    #[builder(default)]
    pub subprotocols: Vec<String>,
    /// Additional handshake request headers
    #[builder(default)]
    pub headers: Vec<(String, String)>,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    pub(crate) fn codec_options(&self) -> CodecOptions {
        CodecOptions {
            subprotocols: self.subprotocols.clone(),
            headers: self.headers.clone(),
            max_message_size: self.max_message_size,
        }
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed connection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Initial backoff duration for first reconnection attempt
    #[builder(default = DEFAULT_INITIAL_BACKOFF_DURATION)]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[builder(default = DEFAULT_MAX_BACKOFF_DURATION)]
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    #[builder(default = DEFAULT_BACKOFF_MULTIPLIER)]
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None, // Infinite reconnection by default
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff as _;

    use super::*;

    #[test]
    fn backoff_sequence() {
        let config = ReconnectConfig::default();
        let mut backoff: ExponentialBackoff = config.into();

        // First backoff should be around initial_backoff (with some jitter)
        let first = backoff.next_backoff().unwrap();
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1500));
    }

    #[test]
    fn backoff_respects_max() {
        let config = ReconnectConfig::builder()
            .initial_backoff(Duration::from_secs(1))
            .max_backoff(Duration::from_secs(2))
            .backoff_multiplier(3.0)
            .build();
        let mut backoff: ExponentialBackoff = config.into();

        for _ in 0..10 {
            let _next = backoff.next_backoff();
        }

        // Capped at max plus jitter
        let duration = backoff.next_backoff().unwrap();
        assert!(duration <= Duration::from_secs(3));
    }

    #[test]
    fn defaults_reconnect_forever() {
        let config = Config::default();

        assert!(config.reconnecting);
        assert_eq!(config.reconnect.max_attempts, None);
        assert_eq!(config.event_capacity, 1024);
        assert_eq!(config.max_message_size, 64 * 1024 * 1024);
    }

    #[test]
    fn codec_options_carry_handshake_settings() {
        let config = Config::builder()
            .subprotocols(vec!["chat".to_owned()])
            .headers(vec![("X-Token".to_owned(), "abc".to_owned())])
            .max_message_size(16)
            .build();

        let options = config.codec_options();

        assert_eq!(options.subprotocols, ["chat"]);
        assert_eq!(options.headers.len(), 1);
        assert_eq!(options.max_message_size, 16);
    }
}
