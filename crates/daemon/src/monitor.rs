//! A bus consumer that keeps running statistics for the status line.

use pipeline::{Consumes, Observer, PipelineChannels};
use rt_types::{ChannelId, ChannelKey, MeasurementValue};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Point-in-time view of the monitor's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSnapshot {
    pub columns: u64,
    /// Columns per second since the previous snapshot
    pub column_rate: f64,
    pub connected: bool,
    pub buffer_fill: u8,
    pub last_column: Option<Vec<f64>>,
}

/// Counts output columns and forwards server messages to a `flume` queue.
///
/// Notifications never block: when the message queue is full the message
/// is dropped.
pub struct RateMonitor {
    channels: PipelineChannels,
    columns: AtomicU64,
    connected: AtomicU64,
    buffer_fill: AtomicU8,
    last_column: Mutex<Option<Vec<f64>>>,
    last_snapshot: Mutex<(Instant, u64)>,
    messages: flume::Sender<String>,
}

impl RateMonitor {
    pub fn new(channels: PipelineChannels, message_capacity: usize) -> (Self, flume::Receiver<String>) {
        let (messages, rx) = flume::bounded(message_capacity.max(1));
        let monitor = Self {
            channels,
            columns: AtomicU64::new(0),
            connected: AtomicU64::new(0f64.to_bits()),
            buffer_fill: AtomicU8::new(0),
            last_column: Mutex::new(None),
            last_snapshot: Mutex::new((Instant::now(), 0)),
            messages,
        };
        (monitor, rx)
    }

    pub fn columns(&self) -> u64 {
        self.columns.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let columns = self.columns();
        let now = Instant::now();
        let column_rate = {
            let mut last = self.last_snapshot.lock().unwrap_or_else(|p| p.into_inner());
            let elapsed = now.duration_since(last.0).as_secs_f64();
            let rate = if elapsed > 0.0 {
                columns.saturating_sub(last.1) as f64 / elapsed
            } else {
                0.0
            };
            *last = (now, columns);
            rate
        };
        MonitorSnapshot {
            columns,
            column_rate,
            connected: f64::from_bits(self.connected.load(Ordering::Relaxed)) > 0.5,
            buffer_fill: self.buffer_fill.load(Ordering::Relaxed),
            last_column: self.last_column.lock().unwrap_or_else(|p| p.into_inner()).clone(),
        }
    }
}

impl Observer for RateMonitor {
    fn on_value_available(&self, _id: ChannelId, value: &MeasurementValue) {
        match value {
            MeasurementValue::MultiSample(column) => {
                self.columns.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut last) = self.last_column.try_lock() {
                    *last = Some(column.to_vec());
                }
            }
            MeasurementValue::Numeric(v) => self.connected.store(v.to_bits(), Ordering::Relaxed),
            MeasurementValue::Progress(percent) => self.buffer_fill.store(*percent, Ordering::Relaxed),
            MeasurementValue::Text(text) => {
                let _ = self.messages.try_send(text.clone());
            }
            _ => {}
        }
    }
}

impl Consumes for RateMonitor {
    fn consumer_name(&self) -> &str {
        "rate_monitor"
    }

    fn wanted_channels(&self) -> Vec<ChannelKey> {
        vec![
            self.channels.output,
            self.channels.connected,
            self.channels.messages,
            self.channels.buffer_fill,
        ]
    }
}
