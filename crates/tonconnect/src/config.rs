use crate::DEFAULT_BRIDGE_URL;
use crate::protocol::DEFAULT_MESSAGE_TTL_SECS;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Floor for the backoff applied after consecutive failed reconnects.
const RETRY_FLOOR_MS: u64 = 500;

/// Runtime settings of the bridge subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub bridge_url: String,
    pub message_ttl_secs: u32,
    /// Delay before the first reconnect after a dropped stream. Zero reconnects
    /// immediately.
    pub reconnect_delay_ms: u64,
    /// Upper bound of random jitter added to every reconnect delay.
    pub reconnect_jitter_ms: u64,
    /// Cap for the backoff between consecutive failed reconnects.
    pub reconnect_max_delay_ms: u64,
    /// Events buffered per subscriber before the oldest are dropped.
    pub event_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge_url: DEFAULT_BRIDGE_URL.to_string(),
            message_ttl_secs: DEFAULT_MESSAGE_TTL_SECS,
            reconnect_delay_ms: 0,
            reconnect_jitter_ms: 0,
            reconnect_max_delay_ms: 30_000,
            event_buffer: 1,
        }
    }
}

impl BridgeConfig {
    pub fn with_bridge_url(mut self, url: impl Into<String>) -> Self {
        self.bridge_url = url.into();
        self
    }

    /// Delay before reconnect number `attempt` (0-based) of one outage.
    ///
    /// The first attempt uses `reconnect_delay_ms`. Later attempts double from
    /// at least 500ms up to `reconnect_max_delay_ms`.
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let base = if attempt == 0 {
            self.reconnect_delay_ms
        } else {
            let floor = self.reconnect_delay_ms.max(RETRY_FLOOR_MS);
            let factor = 1u64 << attempt.saturating_sub(1).min(16);
            floor
                .saturating_mul(factor)
                .min(self.reconnect_max_delay_ms.max(floor))
        };
        let jitter = if self.reconnect_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.reconnect_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}
