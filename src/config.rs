//! Configuration for the oplog agent.
//!
//! # Example
//!
//! ```
//! use oplog::OplogConfig;
//!
//! // Minimal config (uses defaults)
//! let config = OplogConfig::default();
//! assert_eq!(config.max_bytes, 64 * 1024 * 1024); // 64 MB capped log
//!
//! // Full config
//! let config = OplogConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     max_bytes: 16 * 1024 * 1024,
//!     object_url_template: Some("https://api.example.com/{{type}}/{{id}}".into()),
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// Configuration for the oplog agent.
///
/// All fields have sensible defaults. Without a `redis_url` the agent
/// runs on the in-memory store, which is only suitable for tests and
/// single-process embedding.
#[derive(Debug, Clone, Deserialize)]
pub struct OplogConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Optional key prefix when sharing a Redis instance
    #[serde(default)]
    pub redis_prefix: Option<String>,

    /// Capped op-log size bound in bytes (default: 64 MB)
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Bounded ingest channel capacity
    #[serde(default = "default_ingest_queue")]
    pub ingest_queue: usize,

    /// Replication read page size
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// How long a tail read blocks before reporting a timeout, in ms
    #[serde(default = "default_tail_timeout_ms")]
    pub tail_timeout_ms: u64,

    /// Template rendered into each emitted event's `ref` field,
    /// substituting `{{type}}` and `{{id}}` (absent = no `ref`)
    #[serde(default)]
    pub object_url_template: Option<String>,

    /// Shared secret for HTTP Basic auth on the SSE endpoint
    /// (None = no authentication)
    #[serde(default)]
    pub password: Option<String>,

    /// SSE listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// UDP ingest bind address
    #[serde(default = "default_udp_addr")]
    pub udp_addr: String,

    /// Largest accepted UDP datagram
    #[serde(default = "default_max_datagram_bytes")]
    pub max_datagram_bytes: usize,

    /// SSE keep-alive comment interval in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Per-subscriber event channel capacity (slow consumers block the
    /// tailer once this fills)
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_max_bytes() -> u64 { 64 * 1024 * 1024 } // 64 MB
fn default_ingest_queue() -> usize { 4096 }
fn default_page_size() -> usize { 1000 }
fn default_tail_timeout_ms() -> u64 { 5000 }
fn default_listen_addr() -> String { "0.0.0.0:8042".to_string() }
fn default_udp_addr() -> String { "0.0.0.0:8043".to_string() }
fn default_max_datagram_bytes() -> usize { 8192 }
fn default_keepalive_secs() -> u64 { 25 }
fn default_subscriber_buffer() -> usize { 64 }

impl Default for OplogConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_prefix: None,
            max_bytes: default_max_bytes(),
            ingest_queue: default_ingest_queue(),
            page_size: default_page_size(),
            tail_timeout_ms: default_tail_timeout_ms(),
            object_url_template: None,
            password: None,
            listen_addr: default_listen_addr(),
            udp_addr: default_udp_addr(),
            max_datagram_bytes: default_max_datagram_bytes(),
            keepalive_secs: default_keepalive_secs(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OplogConfig::default();
        assert!(config.redis_url.is_none());
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.tail_timeout_ms, 5000);
        assert_eq!(config.keepalive_secs, 25);
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: OplogConfig =
            serde_json::from_str(r#"{"redis_url": "redis://localhost", "max_bytes": 1024}"#)
                .unwrap();
        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost"));
        assert_eq!(config.max_bytes, 1024);
        assert_eq!(config.ingest_queue, default_ingest_queue());
        assert!(config.password.is_none());
    }
}
