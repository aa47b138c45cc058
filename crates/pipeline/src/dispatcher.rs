//! Dispatcher: drains the ring buffer onto the measurement bus.

use rt_types::{Block, ChannelKey, MeasurementValue};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::MeasurementBus;
use crate::error::PipelineResult;
use crate::ring_buffer::RingBuffer;

/// What one dispatcher run delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub blocks: u64,
    pub columns: u64,
    /// Columns the bus refused
    pub dropped_columns: u64,
}

/// Channels a dispatcher publishes to.
#[derive(Debug, Clone, Copy)]
pub struct DispatchTargets {
    pub output: ChannelKey,
    /// Receives the ring fill level after each block.
    pub fill: Option<ChannelKey>,
}

/// Publishes every column of `block` in order, converted to double precision.
pub fn dispatch_block(
    bus: &MeasurementBus,
    targets: DispatchTargets,
    block: &Block,
    stats: &mut DispatchStats,
) {
    for column in block.columns() {
        let values: Arc<[f64]> = column.iter().map(|&v| f64::from(v)).collect();
        match bus.publish(targets.output, MeasurementValue::MultiSample(values)) {
            Ok(_) => stats.columns += 1,
            Err(_) => stats.dropped_columns += 1,
        }
    }
    stats.blocks += 1;
}

/// The `rt_dispatcher` thread.
pub struct Dispatcher {
    cancel: CancellationToken,
    handle: Option<JoinHandle<DispatchStats>>,
}

impl Dispatcher {
    pub fn start(
        ring: Arc<RingBuffer>,
        bus: Arc<MeasurementBus>,
        targets: DispatchTargets,
        poll_interval: Duration,
    ) -> PipelineResult<Self> {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = thread::Builder::new()
            .name("rt_dispatcher".into())
            .spawn(move || run(ring, bus, targets, poll_interval, token))?;
        debug!(output = %targets.output, "Dispatcher started");
        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Cancels the loop and waits for it. Later calls return `None`.
    pub fn stop(&mut self) -> Option<DispatchStats> {
        self.cancel.cancel();
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(stats) => {
                info!(blocks = stats.blocks, columns = stats.columns, "Dispatcher stopped");
                Some(stats)
            }
            Err(_) => {
                error!("Dispatcher thread panicked");
                None
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    ring: Arc<RingBuffer>,
    bus: Arc<MeasurementBus>,
    targets: DispatchTargets,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> DispatchStats {
    let mut stats = DispatchStats::default();
    while !cancel.is_cancelled() {
        let block = match ring.pop_timeout(poll_interval) {
            Ok(Some(block)) => block,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Dispatcher input closed");
                break;
            }
        };
        dispatch_block(&bus, targets, &block, &mut stats);
        if let Some(fill) = targets.fill {
            let _ = bus.publish(fill, MeasurementValue::Progress(ring.fill_percent()));
        }
    }
    stats
}
