//! Bounded block queue between the producer and the dispatcher.
//!
//! Backed by a bounded `flume` channel: pushing suspends while every slot is
//! occupied, popping suspends while none is. Blocks leave in the order they
//! entered.

use flume::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use rt_types::Block;
use std::time::Duration;
use tracing::trace;

use crate::error::{PipelineError, PipelineResult};

pub struct RingBuffer {
    tx: Sender<Block>,
    rx: Receiver<Block>,
    slots: usize,
    num_channels: usize,
    samples_per_block: usize,
}

impl RingBuffer {
    pub fn new(slots: usize, num_channels: usize, samples_per_block: usize) -> PipelineResult<Self> {
        if slots == 0 || num_channels == 0 || samples_per_block == 0 {
            return Err(PipelineError::invalid_configuration(format!(
                "ring buffer dimensions must be non-zero (slots={}, channels={}, samples={})",
                slots, num_channels, samples_per_block
            )));
        }
        let (tx, rx) = flume::bounded(slots);
        Ok(Self {
            tx,
            rx,
            slots,
            num_channels,
            samples_per_block,
        })
    }

    /// `(num_channels, samples_per_block)` of every block this buffer accepts.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_channels, self.samples_per_block)
    }

    pub fn capacity(&self) -> usize {
        self.slots
    }

    /// Unread blocks.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }

    /// Occupied slots as a percentage.
    pub fn fill_percent(&self) -> u8 {
        ((self.len() * 100) / self.slots).min(100) as u8
    }

    fn check_shape(&self, block: &Block) -> PipelineResult<()> {
        if block.shape() != self.shape() {
            return Err(PipelineError::ShapeMismatch {
                expected: self.shape(),
                actual: block.shape(),
            });
        }
        Ok(())
    }

    /// Appends a block, waiting for a free slot.
    pub fn push(&self, block: Block) -> PipelineResult<()> {
        self.check_shape(&block)?;
        self.tx
            .send(block)
            .map_err(|e| PipelineError::ChannelError(e.to_string()))
    }

    /// Like [`push`](Self::push) but gives the block back if no slot frees up in time.
    pub fn push_timeout(&self, block: Block, timeout: Duration) -> PipelineResult<Option<Block>> {
        self.check_shape(&block)?;
        match self.tx.send_timeout(block, timeout) {
            Ok(()) => Ok(None),
            Err(SendTimeoutError::Timeout(block)) => {
                trace!("Ring buffer full, push timed out");
                Ok(Some(block))
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                Err(PipelineError::ChannelError("ring buffer closed".into()))
            }
        }
    }

    /// Removes the oldest block, waiting until one is available.
    pub fn pop(&self) -> PipelineResult<Block> {
        self.rx
            .recv()
            .map_err(|e| PipelineError::ChannelError(e.to_string()))
    }

    /// Like [`pop`](Self::pop) but returns `None` if nothing arrives in time.
    pub fn pop_timeout(&self, timeout: Duration) -> PipelineResult<Option<Block>> {
        match self.rx.recv_timeout(timeout) {
            Ok(block) => Ok(Some(block)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(PipelineError::ChannelError("ring buffer closed".into()))
            }
        }
    }

    pub fn try_pop(&self) -> Option<Block> {
        self.rx.try_recv().ok()
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("slots", &self.slots)
            .field("len", &self.len())
            .field("shape", &self.shape())
            .finish()
    }
}
