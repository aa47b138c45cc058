//! One acquisition session: optional simulated server, bus, pipeline and monitor.

use anyhow::Context;
use pipeline::{AcquisitionPipeline, MeasurementBus};
use rt_client::mock_server::{MockServer, MockServerConfig};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::monitor::RateMonitor;

const MESSAGE_QUEUE: usize = 64;

pub struct Session {
    pipeline: Arc<AcquisitionPipeline>,
    monitor: Arc<RateMonitor>,
    messages: flume::Receiver<String>,
    // Dropped last so the pipeline can still say goodbye to it.
    mock: Option<MockServer>,
}

impl Session {
    /// Connects, applies the configured connector and buffer size, and starts
    /// acquiring. With `mock` a simulated server is started on loopback first.
    pub fn open(config: &DaemonConfig, mock: bool) -> anyhow::Result<Self> {
        config.validate()?;
        let mut client_config = config.client.clone();
        let mock = if mock {
            let server = MockServer::start(MockServerConfig::default())
                .context("Could not start the simulated acquisition server")?;
            client_config = client_config.with_addrs(server.control_addr(), server.data_addr());
            info!(control = %server.control_addr(), data = %server.data_addr(), "Using simulated server");
            Some(server)
        } else {
            None
        };

        let bus = Arc::new(MeasurementBus::new());
        let pipeline = Arc::new(AcquisitionPipeline::new(
            client_config,
            config.acquisition.clone(),
            bus.clone(),
        )?);
        let (monitor, messages) = RateMonitor::new(pipeline.channels(), MESSAGE_QUEUE);
        let monitor = Arc::new(monitor);
        bus.attach(monitor.clone());

        pipeline.connect().context("Could not connect to the acquisition server")?;
        if let Some(connector) = config.connector {
            pipeline
                .select_connector(connector)
                .with_context(|| format!("Could not select connector {}", connector))?;
        }
        if let Some(size) = config.buffer_size {
            pipeline.set_buffer_size(size)?;
        }
        pipeline.start_acquisition().context("Could not start acquisition")?;

        Ok(Self {
            pipeline,
            monitor,
            messages,
            mock,
        })
    }

    pub fn pipeline(&self) -> &Arc<AcquisitionPipeline> {
        &self.pipeline
    }

    pub fn monitor(&self) -> &Arc<RateMonitor> {
        &self.monitor
    }

    pub fn mock_server(&self) -> Option<&MockServer> {
        self.mock.as_ref()
    }

    /// Server messages published since the last call.
    pub fn drain_messages(&self) -> Vec<String> {
        self.messages.try_iter().collect()
    }

    /// Stops acquisition and disconnects. Safe to call more than once.
    pub fn close(&self) -> anyhow::Result<()> {
        self.pipeline.stop_acquisition()?;
        if let Err(e) = self.pipeline.disconnect() {
            warn!(error = %e, "Disconnect failed");
        }
        info!(stats = ?self.pipeline.last_dispatch_stats(), "Session closed");
        Ok(())
    }
}
