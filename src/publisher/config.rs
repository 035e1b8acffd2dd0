//! Broker configuration.
//!
//! Values mirror the usual producer settings of a log-structured broker
//! (bootstrap servers, acks, linger, buffering limits, retries, timeouts). They
//! are validated once at construction and then passed through to the broker
//! client as a flat property map; the buffering, retry and timeout values also
//! drive the local [`BufferedPublisher`](super::BufferedPublisher).

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Acknowledgement level requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Acks {
    /// Fire and forget.
    #[serde(rename = "0")]
    None,
    /// Partition leader only.
    #[serde(rename = "1")]
    Leader,
    /// All in-sync replicas.
    #[default]
    #[serde(rename = "all")]
    All,
}

impl Acks {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "0",
            Self::Leader => "1",
            Self::All => "all",
        }
    }
}

/// Batch compression codec.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

/// Transport security mode.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plaintext => "PLAINTEXT",
            Self::Ssl => "SSL",
            Self::SaslPlaintext => "SASL_PLAINTEXT",
            Self::SaslSsl => "SASL_SSL",
        }
    }

    const fn uses_sasl(self) -> bool {
        matches!(self, Self::SaslPlaintext | Self::SaslSsl)
    }
}

/// Credential string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, for handing to the broker client.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Producer configuration.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub bootstrap_servers: Vec<String>,
    pub client_id: String,
    pub acks: Acks,
    pub security_protocol: Option<SecurityProtocol>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<Secret>,
    /// Linger window before a buffered message becomes eligible for sending.
    pub linger_ms: u64,
    pub compression: Compression,
    /// Max messages buffered locally before `publish` refuses new ones.
    pub queue_buffering_max_messages: usize,
    /// Max bytes (in KiB) buffered locally before `publish` refuses new ones.
    pub queue_buffering_max_kbytes: usize,
    /// Broker-side batching delay, passed through to the client.
    pub queue_buffering_max_ms: u64,
    /// Largest single message accepted.
    pub message_max_bytes: usize,
    /// Retries after the first transient send failure.
    pub message_send_max_retries: u32,
    pub retry_backoff_ms: u64,
    /// A message still undelivered this long after `publish` fails terminally.
    pub message_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Delivery pump tick.
    pub poll_interval_ms: u64,
    /// Upper bound on the flush performed when the publisher closes.
    pub flush_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec!["localhost:9092".to_string()],
            client_id: "hookbus".to_string(),
            acks: Acks::All,
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            linger_ms: 10,
            compression: Compression::None,
            queue_buffering_max_messages: 1_000_000,
            queue_buffering_max_kbytes: 1_048_576,
            queue_buffering_max_ms: 1_000,
            message_max_bytes: 10 * 1024 * 1024,
            message_send_max_retries: 3,
            retry_backoff_ms: 100,
            message_timeout_ms: 60_000,
            request_timeout_ms: 30_000,
            poll_interval_ms: 100,
            flush_timeout_ms: 5_000,
        }
    }
}

fn require_positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

impl BrokerConfig {
    /// Config pointing at a single comma-separated endpoint list.
    #[must_use]
    pub fn with_servers(servers: &str) -> Self {
        Self {
            bootstrap_servers: servers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            ..Self::default()
        }
    }

    /// Check the configuration before any thread or client is created.
    ///
    /// # Errors
    /// `ConfigError::EmptyField` for missing endpoints, client id or SASL
    /// mechanism; `ConfigError::InvalidValue` for zero limits or a message cap
    /// that cannot fit in the buffer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() || self.bootstrap_servers.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::EmptyField {
                field: "bootstrap_servers".to_string(),
            });
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::EmptyField {
                field: "client_id".to_string(),
            });
        }
        if self.security_protocol.is_some_and(SecurityProtocol::uses_sasl)
            && self.sasl_mechanism.as_deref().map_or(true, |m| m.trim().is_empty())
        {
            return Err(ConfigError::EmptyField {
                field: "sasl_mechanism".to_string(),
            });
        }

        require_positive("queue_buffering_max_messages", self.queue_buffering_max_messages as u64)?;
        require_positive("queue_buffering_max_kbytes", self.queue_buffering_max_kbytes as u64)?;
        require_positive("message_max_bytes", self.message_max_bytes as u64)?;
        require_positive("message_timeout_ms", self.message_timeout_ms)?;
        require_positive("request_timeout_ms", self.request_timeout_ms)?;
        require_positive("poll_interval_ms", self.poll_interval_ms)?;

        if self.message_max_bytes > self.max_buffered_bytes() {
            return Err(ConfigError::InvalidValue {
                field: "message_max_bytes".to_string(),
                reason: format!(
                    "{} exceeds the buffer limit of {} bytes",
                    self.message_max_bytes,
                    self.max_buffered_bytes()
                ),
            });
        }

        Ok(())
    }

    /// Flat property map handed to the broker client. Unset values are omitted.
    #[must_use]
    pub fn to_properties(&self) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("bootstrap.servers".to_string(), self.bootstrap_servers.join(","));
        if !self.client_id.is_empty() {
            m.insert("client.id".to_string(), self.client_id.clone());
        }
        m.insert("acks".to_string(), self.acks.as_str().to_string());
        if let Some(protocol) = self.security_protocol {
            m.insert("security.protocol".to_string(), protocol.as_str().to_string());
        }
        if let Some(v) = self.sasl_mechanism.as_ref().filter(|v| !v.is_empty()) {
            m.insert("sasl.mechanisms".to_string(), v.clone());
        }
        if let Some(v) = self.sasl_username.as_ref().filter(|v| !v.is_empty()) {
            m.insert("sasl.username".to_string(), v.clone());
        }
        if let Some(v) = self.sasl_password.as_ref().filter(|v| !v.expose().is_empty()) {
            m.insert("sasl.password".to_string(), v.expose().to_string());
        }
        m.insert("linger.ms".to_string(), self.linger_ms.to_string());
        m.insert("compression.type".to_string(), self.compression.as_str().to_string());
        m.insert(
            "queue.buffering.max.messages".to_string(),
            self.queue_buffering_max_messages.to_string(),
        );
        m.insert(
            "queue.buffering.max.kbytes".to_string(),
            self.queue_buffering_max_kbytes.to_string(),
        );
        m.insert(
            "queue.buffering.max.ms".to_string(),
            self.queue_buffering_max_ms.to_string(),
        );
        m.insert("message.max.bytes".to_string(), self.message_max_bytes.to_string());
        m.insert(
            "message.send.max.retries".to_string(),
            self.message_send_max_retries.to_string(),
        );
        m.insert("message.timeout.ms".to_string(), self.message_timeout_ms.to_string());
        m.insert("retry.backoff.ms".to_string(), self.retry_backoff_ms.to_string());
        m.insert("request.timeout.ms".to_string(), self.request_timeout_ms.to_string());
        m
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn max_buffered_bytes(&self) -> usize {
        self.queue_buffering_max_kbytes.saturating_mul(1024)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        BrokerConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_servers_rejected() {
        let cfg = BrokerConfig {
            bootstrap_servers: Vec::new(),
            ..BrokerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyField { field }) if field == "bootstrap_servers"));

        let cfg = BrokerConfig::with_servers(" , ");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn with_servers_splits_list() {
        let cfg = BrokerConfig::with_servers("a:9092, b:9092");
        assert_eq!(cfg.bootstrap_servers, vec!["a:9092", "b:9092"]);
        assert_eq!(cfg.to_properties()["bootstrap.servers"], "a:9092,b:9092");
    }

    #[test]
    fn zero_limits_rejected() {
        let cfg = BrokerConfig {
            queue_buffering_max_messages: 0,
            ..BrokerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { .. })));

        let cfg = BrokerConfig {
            poll_interval_ms: 0,
            ..BrokerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn message_cap_must_fit_buffer() {
        let cfg = BrokerConfig {
            queue_buffering_max_kbytes: 1,
            message_max_bytes: 2048,
            ..BrokerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { field, .. }) if field == "message_max_bytes"));
    }

    #[test]
    fn sasl_requires_mechanism() {
        let cfg = BrokerConfig {
            security_protocol: Some(SecurityProtocol::SaslSsl),
            ..BrokerConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = BrokerConfig {
            security_protocol: Some(SecurityProtocol::SaslSsl),
            sasl_mechanism: Some("PLAIN".to_string()),
            sasl_username: Some("user".to_string()),
            sasl_password: Some(Secret::new("hunter2")),
            ..BrokerConfig::default()
        };
        cfg.validate().unwrap();
        let props = cfg.to_properties();
        assert_eq!(props["security.protocol"], "SASL_SSL");
        assert_eq!(props["sasl.password"], "hunter2");
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }

    #[test]
    fn properties_omit_unset_values() {
        let props = BrokerConfig::default().to_properties();
        assert_eq!(props["acks"], "all");
        assert_eq!(props["linger.ms"], "10");
        assert_eq!(props["compression.type"], "none");
        assert_eq!(props["queue.buffering.max.ms"], "1000");
        assert!(!props.contains_key("security.protocol"));
        assert!(!props.contains_key("sasl.username"));
    }

    #[test]
    fn deserializes_partial_json() {
        let cfg: BrokerConfig =
            serde_json::from_str(r#"{"bootstrap_servers":["kafka:9092"],"acks":"1","compression":"lz4"}"#).unwrap();
        assert_eq!(cfg.acks, Acks::Leader);
        assert_eq!(cfg.compression, Compression::Lz4);
        assert_eq!(cfg.linger_ms, 10);
    }
}
