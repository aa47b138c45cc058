//! A simulated acquisition server.
//!
//! Serves the command and data interfaces on loopback so the client, the
//! pipeline and the daemon can run without real hardware. Data is a
//! deterministic ramp by default, which makes ordering and loss visible.

mod server;
mod signal;

pub use server::MockServer;
pub use signal::{SignalGenerator, SignalShape};

use rt_types::DeviceInfo;
use std::time::Duration;

/// One selectable input of the simulated server.
#[derive(Debug, Clone)]
pub struct MockConnector {
    pub id: i32,
    pub name: String,
    pub info: DeviceInfo,
}

impl MockConnector {
    pub fn new(id: i32, name: &str, num_channels: usize, sampling_rate: f64) -> Self {
        let mut info = DeviceInfo::new(num_channels, sampling_rate);
        info.channel_names = (1..=num_channels).map(|n| format!("{}{:03}", name, n)).collect();
        info.channel_units = vec!["T".to_string(); num_channels];
        Self {
            id,
            name: name.to_string(),
            info,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockServerConfig {
    pub bind_host: String,
    /// 0 picks an ephemeral port.
    pub control_port: u16,
    /// 0 picks an ephemeral port.
    pub data_port: u16,
    pub connectors: Vec<MockConnector>,
    pub active_connector: i32,
    /// Initial answer to `bufsize`.
    pub buffer_size: i32,
    /// Columns per data frame.
    pub frame_samples: usize,
    /// Pause between two data frames.
    pub frame_interval: Duration,
    pub signal: SignalShape,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            control_port: 0,
            data_port: 0,
            connectors: vec![
                MockConnector::new(1, "A", 4, 1000.0),
                MockConnector::new(2, "B", 6, 2000.0),
            ],
            active_connector: 1,
            buffer_size: 100,
            frame_samples: 50,
            frame_interval: Duration::from_millis(10),
            signal: SignalShape::Ramp,
        }
    }
}

impl MockServerConfig {
    pub fn connector(&self, id: i32) -> Option<&MockConnector> {
        self.connectors.iter().find(|c| c.id == id)
    }

    /// Value of sample `n` on channel `c` under [`SignalShape::Ramp`].
    pub fn ramp_value(n: u64, num_channels: usize, c: usize) -> f32 {
        (n * num_channels as u64 + c as u64) as f32
    }
}
