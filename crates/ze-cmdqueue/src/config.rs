//! Driver tuning knobs.
//!
//! Every field has a default, so an empty JSON object is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ze_gpu_cmd::PreemptionMode;

/// Smallest segment that can hold a useful packet plus the chaining jump.
pub const MIN_SEGMENT_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse driver config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{field} must be at least {min} bytes (got {value})")]
    TooSmall {
        field: &'static str,
        min: usize,
        value: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    /// Size of each command list buffer segment.
    pub command_list_segment_size: usize,
    /// Size of each queue ring segment. A batch larger than this gets a dedicated segment.
    pub queue_ring_size: usize,
    /// Overrides both the device default and per-list preemption requests.
    pub force_preemption_mode: Option<PreemptionMode>,
    /// Re-send CSR base and SIP on every switch into mid-thread preemption, not just the first.
    pub force_mid_thread_setup_each_switch: bool,
    /// Upper bound for host-side waits. `None` waits indefinitely.
    pub sync_timeout_ms: Option<u64>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            command_list_segment_size: 64 * 1024,
            queue_ring_size: 64 * 1024,
            force_preemption_mode: None,
            force_mid_thread_setup_each_switch: false,
            sync_timeout_ms: None,
        }
    }
}

impl DriverConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("command_list_segment_size", self.command_list_segment_size),
            ("queue_ring_size", self.queue_ring_size),
        ] {
            if value < MIN_SEGMENT_SIZE {
                return Err(ConfigError::TooSmall {
                    field,
                    min: MIN_SEGMENT_SIZE,
                    value,
                });
            }
        }
        Ok(())
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        self.sync_timeout_ms.map(Duration::from_millis)
    }
}
