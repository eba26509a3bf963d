//! Proxy configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the worker launch and the synchronous transfer loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Name of the worker thread
    pub worker_name: String,
    /// How many times `init` checks whether the worker has started
    pub start_retries: u32,
    /// Sleep between those checks, in milliseconds
    pub start_retry_interval_ms: u64,
    /// Event-processing slice of the synchronous transfer loop, in seconds
    pub event_poll_slice_secs: u64,
    /// Depth of the worker's command queue
    pub command_queue_depth: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            worker_name: "usb-worker".to_string(),
            start_retries: 50,
            start_retry_interval_ms: 100,
            event_poll_slice_secs: 60,
            command_queue_depth: common::DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl ProxyConfig {
    pub fn start_retry_interval(&self) -> Duration {
        Duration::from_millis(self.start_retry_interval_ms)
    }

    pub fn event_poll_slice(&self) -> Duration {
        Duration::from_secs(self.event_poll_slice_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.worker_name, "usb-worker");
        assert_eq!(config.event_poll_slice(), Duration::from_secs(60));
        assert_eq!(config.start_retry_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_toml_takes_defaults() {
        let config: ProxyConfig = toml::from_str("start_retries = 3").unwrap();
        assert_eq!(config.start_retries, 3);
        assert_eq!(config.command_queue_depth, common::DEFAULT_QUEUE_DEPTH);
    }
}
