//! Monitor configuration types
//!
//! This module defines the tuning knobs of the capture/decode pipeline and the
//! channel parameters accepted by the hardware transports.

use crate::types::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bitrates accepted by the session and every driver
pub const SUPPORTED_BITRATES: [u32; 4] = [125_000, 250_000, 500_000, 1_000_000];

/// Configuration for the monitor pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Frames buffered between capture and decode; the oldest is dropped on overflow
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// How long a close waits for the reader before force-releasing the handle
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    /// Receive timeout used by the reader so it can notice a close request
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_queue_depth() -> usize {
    256
}

fn default_close_timeout() -> u64 {
    2000
}

fn default_poll_interval() -> u64 {
    100
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            close_timeout_ms: default_close_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl MonitorConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the capture queue depth
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Builder method: set the close timeout
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder method: set the reader poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Check that the values can drive a pipeline
    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(MonitorError::Config("queue_depth must be at least 1".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(MonitorError::Config("poll_interval_ms must be at least 1".to_string()));
        }
        if self.close_timeout_ms < self.poll_interval_ms {
            return Err(MonitorError::Config(format!(
                "close_timeout_ms ({}) must not be shorter than poll_interval_ms ({})",
                self.close_timeout_ms, self.poll_interval_ms
            )));
        }
        Ok(())
    }
}

/// Reject bitrates outside [`SUPPORTED_BITRATES`]
pub fn validate_bitrate(bitrate: u32) -> Result<()> {
    if SUPPORTED_BITRATES.contains(&bitrate) {
        Ok(())
    } else {
        Err(MonitorError::Connection(format!(
            "unsupported bitrate {} (supported: {:?})",
            bitrate, SUPPORTED_BITRATES
        )))
    }
}
