//! Broker configuration.

use std::env;
use std::time::Duration;

/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of envelopes the dispatch queue buffers before senders wait.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Per-broker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Deadline applied to every request, refreshed on each partial response.
    pub request_timeout: Duration,
    /// Capacity of the bounded dispatch queue.
    pub queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl BrokerConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RELAY_REQUEST_TIMEOUT_MS`: Request timeout in milliseconds (default: 10000)
    /// - `RELAY_QUEUE_CAPACITY`: Dispatch queue capacity (default: 1000)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            request_timeout: env::var("RELAY_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),

            queue_capacity: env::var("RELAY_QUEUE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(|c: usize| c.max(1))
                .unwrap_or(defaults.queue_capacity),
        }
    }

    /// Creates a minimal config for testing.
    pub fn for_testing() -> Self {
        Self {
            request_timeout: Duration::from_millis(200),
            queue_capacity: 64,
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Capacity is clamped to at least one slot.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}
