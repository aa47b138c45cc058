//! Acquisition pipeline configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};

/// Tunables of the producer/dispatcher pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Block slots in the ring buffer
    pub ring_slots: usize,
    /// Columns kept in the output channel's history
    pub output_history_len: usize,
    /// How often the worker threads check for cancellation
    pub poll_interval_ms: u64,
    /// How long `connect` waits for the device description
    pub info_timeout_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            ring_slots: 8,
            output_history_len: 10,
            poll_interval_ms: 100,
            info_timeout_ms: 2000,
        }
    }
}

impl AcquisitionConfig {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.ring_slots == 0 {
            return Err(PipelineError::invalid_configuration(
                "ring_slots must be greater than 0",
            ));
        }
        if self.output_history_len == 0 {
            return Err(PipelineError::invalid_configuration(
                "output_history_len must be greater than 0",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(PipelineError::invalid_configuration(
                "poll_interval_ms must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn info_timeout(&self) -> Duration {
        Duration::from_millis(self.info_timeout_ms)
    }
}
