//! The acquisition pipeline: control session, producer, ring buffer and
//! dispatcher wired together behind one host-facing handle.

use rt_client::{ClientConfig, ControlClient};
use rt_types::{ChannelId, ChannelKey, ChannelKind, ConnectorSet, DeviceInfo, MeasurementValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::bus::MeasurementBus;
use crate::config::AcquisitionConfig;
use crate::dispatcher::{DispatchStats, DispatchTargets, Dispatcher};
use crate::error::{PipelineError, PipelineResult};
use crate::plugin::{Publishes, Sensor};
use crate::producer::{Producer, ProducerListener, ProducerStats};
use crate::ring_buffer::RingBuffer;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keys of the channels the pipeline publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineChannels {
    pub output: ChannelKey,
    pub connected: ChannelKey,
    pub messages: ChannelKey,
    pub buffer_fill: ChannelKey,
}

impl PipelineChannels {
    fn register(bus: &MeasurementBus, config: &AcquisitionConfig) -> PipelineResult<Self> {
        let output = bus.create_multi_sample_array(ChannelId::RT_SERVER_OUTPUT, 1, "RT Server Output", "")?;
        bus.set_history_len(output, config.output_history_len)?;
        bus.set_visibility(ChannelId::RT_SERVER_OUTPUT, true);
        Ok(Self {
            output,
            connected: bus.create_channel(
                ChannelKind::Numeric,
                ChannelId::RT_SERVER_CONNECTED,
                "RT Server Connected",
                "",
            )?,
            messages: bus.create_channel(
                ChannelKind::Text,
                ChannelId::RT_SERVER_MESSAGES,
                "RT Server Messages",
                "",
            )?,
            buffer_fill: bus.create_channel(
                ChannelKind::ProgressBar,
                ChannelId::RT_SERVER_BUFFER_FILL,
                "RT Server Buffer Fill",
                "%",
            )?,
        })
    }
}

/// State the producer thread reports into.
struct PipelineShared {
    bus: Arc<MeasurementBus>,
    channels: PipelineChannels,
    device_info: Mutex<Option<DeviceInfo>>,
    info_ready: Condvar,
    measuring: AtomicBool,
}

impl PipelineShared {
    fn message(&self, text: impl Into<String>) {
        let _ = self.bus.publish(self.channels.messages, MeasurementValue::Text(text.into()));
    }

    fn set_connected(&self, connected: bool) {
        let value = if connected { 1.0 } else { 0.0 };
        let _ = self.bus.publish(self.channels.connected, MeasurementValue::Numeric(value));
    }

    fn clear_device_info(&self) {
        lock(&self.device_info).take();
    }
}

impl ProducerListener for PipelineShared {
    fn info_available(&self, info: DeviceInfo) {
        if !self.measuring.load(Ordering::SeqCst) {
            if let Err(e) = self.bus.init_from_device_info(self.channels.output, &info) {
                warn!(error = %e, "Output channel not reshaped");
            }
        }
        self.message(format!(
            "Device info: {} channels at {} Hz",
            info.num_channels, info.sampling_rate
        ));
        *lock(&self.device_info) = Some(info);
        self.info_ready.notify_all();
    }

    fn measuring_changed(&self, measuring: bool) {
        self.measuring.store(measuring, Ordering::SeqCst);
        if !measuring {
            self.message("Acquisition stopped by the server");
        }
    }

    fn connection_lost(&self, reason: &str) {
        self.measuring.store(false, Ordering::SeqCst);
        self.set_connected(false);
        self.message(format!("Data connection lost: {}", reason));
    }
}

/// Resources that exist only while acquiring.
struct RunState {
    ring: Arc<RingBuffer>,
    dispatcher: Dispatcher,
}

/// Host-facing handle on one acquisition server.
pub struct AcquisitionPipeline {
    name: String,
    config: AcquisitionConfig,
    control: ControlClient,
    producer: Producer,
    shared: Arc<PipelineShared>,
    run: Mutex<Option<RunState>>,
    /// Samples per block last reported by the server.
    server_buffer_size: Mutex<Option<i32>>,
    /// Samples per block to apply on the next start.
    requested_buffer_size: Mutex<Option<i32>>,
    last_dispatch: Mutex<Option<DispatchStats>>,
}

impl AcquisitionPipeline {
    /// Registers the pipeline's channels on `bus`.
    pub fn new(
        client_config: ClientConfig,
        config: AcquisitionConfig,
        bus: Arc<MeasurementBus>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let channels = PipelineChannels::register(&bus, &config)?;
        let shared = Arc::new(PipelineShared {
            bus,
            channels,
            device_info: Mutex::new(None),
            info_ready: Condvar::new(),
            measuring: AtomicBool::new(false),
        });
        let producer = Producer::new(client_config.clone(), config.poll_interval(), shared.clone());
        Ok(Self {
            name: format!("rt_server@{}:{}", client_config.host, client_config.control_port),
            control: ControlClient::new(client_config),
            config,
            producer,
            shared,
            run: Mutex::new(None),
            server_buffer_size: Mutex::new(None),
            requested_buffer_size: Mutex::new(None),
            last_dispatch: Mutex::new(None),
        })
    }

    pub fn bus(&self) -> &Arc<MeasurementBus> {
        &self.shared.bus
    }

    pub fn channels(&self) -> PipelineChannels {
        self.shared.channels
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Opens both connections and negotiates the configuration: command
    /// table, connectors, device description and buffer size.
    pub fn connect(&self) -> PipelineResult<()> {
        if self.is_running() {
            return Err(PipelineError::Busy);
        }
        if let Err(e) = self.negotiate() {
            warn!(error = %e, "Connecting to the acquisition server failed");
            self.producer.stop();
            let _ = self.control.disconnect();
            self.shared.set_connected(false);
            return Err(e);
        }
        Ok(())
    }

    fn negotiate(&self) -> PipelineResult<()> {
        let client_id = self.producer.connect()?;
        self.control.connect_configured()?;
        let commands = self.control.request_commands()?;
        debug!(commands = commands.len(), "Command table received");

        let connectors = self.control.request_connectors()?;
        info!(
            connectors = connectors.connectors.len(),
            active = connectors.active,
            "Connectors received"
        );
        self.refresh_device_info(client_id)?;
        let buffer_size = self.control.request_buffer_size()?;
        *lock(&self.server_buffer_size) = Some(buffer_size);

        self.shared.set_connected(true);
        self.shared.message(format!(
            "Connected to {} (connector {})",
            self.name, connectors.active
        ));
        Ok(())
    }

    /// Replaces the cached device description with a fresh one.
    ///
    /// The producer is flagged before the request goes out so the reply
    /// cannot outrun the flag, and the call waits for the reply so two
    /// requests never overlap.
    fn refresh_device_info(&self, client_id: i32) -> PipelineResult<DeviceInfo> {
        self.shared.clear_device_info();
        self.producer.request_info();
        if let Err(e) = self.control.request_info(client_id) {
            self.producer.cancel_info_request();
            return Err(e.into());
        }
        match self.wait_for_device_info(self.config.info_timeout()) {
            Ok(info) => Ok(info),
            Err(e) => {
                self.producer.cancel_info_request();
                Err(e)
            }
        }
    }

    /// Stops acquisition if needed and closes both connections.
    pub fn disconnect(&self) -> PipelineResult<()> {
        self.stop_acquisition()?;
        self.producer.stop();
        self.control.disconnect()?;
        self.shared.clear_device_info();
        *lock(&self.server_buffer_size) = None;
        self.shared.set_connected(false);
        info!("Disconnected from the acquisition server");
        Ok(())
    }

    /// Switches the server's input and re-fetches the device description.
    pub fn select_connector(&self, id: i32) -> PipelineResult<DeviceInfo> {
        if self.is_running() {
            return Err(PipelineError::Busy);
        }
        let client_id = self.connected_client_id()?;
        self.control.select_connector(id)?;
        let info = self.refresh_device_info(client_id)?;
        *lock(&self.server_buffer_size) = Some(self.control.request_buffer_size()?);
        self.shared.message(format!(
            "Connector {} selected: {} channels",
            id, info.num_channels
        ));
        Ok(info)
    }

    /// Asks the server for a fresh device description and waits for it.
    pub fn request_info(&self) -> PipelineResult<DeviceInfo> {
        if self.is_running() {
            return Err(PipelineError::Busy);
        }
        let client_id = self.connected_client_id()?;
        self.refresh_device_info(client_id)
    }

    fn connected_client_id(&self) -> PipelineResult<i32> {
        if !self.control.is_connected() {
            return Err(PipelineError::NotConnected);
        }
        self.producer.client_id().ok_or(PipelineError::NotConnected)
    }

    /// Blocks until a device description is available.
    pub fn wait_for_device_info(&self, timeout: Duration) -> PipelineResult<DeviceInfo> {
        let deadline = Instant::now() + timeout;
        let mut info = lock(&self.shared.device_info);
        loop {
            if let Some(info) = info.as_ref() {
                return Ok(info.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PipelineError::NotConfigured(
                    "no device info received from the server".into(),
                ));
            }
            info = self
                .shared
                .info_ready
                .wait_timeout(info, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Sets the samples per block used from the next start on.
    pub fn set_buffer_size(&self, samples: i32) -> PipelineResult<()> {
        if samples <= 0 {
            return Err(PipelineError::invalid_configuration(format!(
                "buffer size must be positive, got {}",
                samples
            )));
        }
        *lock(&self.requested_buffer_size) = Some(samples);
        Ok(())
    }

    /// Requested buffer size, else the one the server last reported.
    pub fn buffer_size(&self) -> Option<i32> {
        lock(&self.requested_buffer_size).or(*lock(&self.server_buffer_size))
    }

    pub fn start_acquisition(&self) -> PipelineResult<()> {
        let mut run = lock(&self.run);
        if run.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }
        if !self.control.is_connected() {
            return Err(PipelineError::NotConnected);
        }
        let client_id = self.producer.connect()?;
        let info = self.wait_for_device_info(self.config.info_timeout())?;

        let requested = *lock(&self.requested_buffer_size);
        if let Some(samples) = requested {
            self.control.set_buffer_size(samples)?;
        }
        let samples = self.control.request_buffer_size()?;
        *lock(&self.server_buffer_size) = Some(samples);
        let samples_per_block = usize::try_from(samples)
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| {
                PipelineError::invalid_configuration(format!("server buffer size {}", samples))
            })?;

        let channels = self.shared.channels;
        self.shared.bus.init_from_device_info(channels.output, &info)?;
        let ring = Arc::new(RingBuffer::new(
            self.config.ring_slots,
            info.num_channels,
            samples_per_block,
        )?);
        let mut dispatcher = Dispatcher::start(
            ring.clone(),
            self.shared.bus.clone(),
            DispatchTargets {
                output: channels.output,
                fill: Some(channels.buffer_fill),
            },
            self.config.poll_interval(),
        )?;

        // Measuring must be flagged before the server starts sending.
        if let Err(e) = self.producer.start_measuring(ring.clone()) {
            dispatcher.stop();
            return Err(e);
        }
        self.shared.measuring.store(true, Ordering::SeqCst);
        if let Err(e) = self.control.start(client_id) {
            self.producer.stop_measuring();
            self.shared.measuring.store(false, Ordering::SeqCst);
            dispatcher.stop();
            error!(error = %e, "Server refused to start");
            return Err(e.into());
        }

        *run = Some(RunState { ring, dispatcher });
        self.shared.set_connected(true);
        self.shared.message(format!(
            "Acquisition started: {} channels, {} samples per block",
            info.num_channels, samples_per_block
        ));
        info!(
            client_id,
            num_channels = info.num_channels,
            samples_per_block,
            "Acquisition started"
        );
        Ok(())
    }

    /// Stops acquisition. Stopping when idle succeeds and does nothing.
    pub fn stop_acquisition(&self) -> PipelineResult<()> {
        let Some(mut state) = lock(&self.run).take() else {
            return Ok(());
        };
        self.producer.begin_stop();
        if self.control.is_connected() {
            if let Err(e) = self.control.stop_all() {
                warn!(error = %e, "stop-all failed");
            }
        }
        self.producer.stop_measuring();
        self.shared.measuring.store(false, Ordering::SeqCst);
        self.producer.stop();
        let stats = state.dispatcher.stop();
        *lock(&self.last_dispatch) = stats;
        debug!(unread_blocks = state.ring.len(), "Ring buffer released");
        drop(state);

        self.shared.message("Acquisition stopped");
        info!(?stats, "Acquisition stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.run).is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.control.is_connected() && self.producer.is_connected()
    }

    pub fn connectors(&self) -> ConnectorSet {
        self.control.connectors()
    }

    pub fn active_connector(&self) -> Option<i32> {
        self.control.active_connector()
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        lock(&self.shared.device_info).clone()
    }

    pub fn data_client_id(&self) -> Option<i32> {
        self.producer.client_id()
    }

    pub fn ring_fill_percent(&self) -> Option<u8> {
        lock(&self.run).as_ref().map(|run| run.ring.fill_percent())
    }

    pub fn producer_stats(&self) -> ProducerStats {
        self.producer.stats()
    }

    /// Totals of the last finished run.
    pub fn last_dispatch_stats(&self) -> Option<DispatchStats> {
        *lock(&self.last_dispatch)
    }
}

impl Sensor for AcquisitionPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> bool {
        match self.start_acquisition() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Start failed");
                false
            }
        }
    }

    fn stop(&self) -> bool {
        match self.stop_acquisition() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Stop failed");
                false
            }
        }
    }

    fn is_configured(&self) -> bool {
        self.control.is_connected() && self.device_info().is_some()
    }
}

impl Publishes for AcquisitionPipeline {
    fn published_channels(&self) -> Vec<ChannelKey> {
        let channels = self.shared.channels;
        vec![
            channels.output,
            channels.connected,
            channels.messages,
            channels.buffer_fill,
        ]
    }
}

impl Drop for AcquisitionPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.stop_acquisition() {
            warn!(error = %e, "Stop on drop failed");
        }
        self.producer.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(bus: Arc<MeasurementBus>) -> AcquisitionPipeline {
        let addr_config = ClientConfig {
            // Nothing listens on the discard port of loopback in the test environment.
            control_port: 9,
            data_port: 9,
            connect_timeout_ms: 200,
            ..ClientConfig::default()
        };
        AcquisitionPipeline::new(addr_config, AcquisitionConfig::default(), bus).unwrap()
    }

    #[test]
    fn test_registers_channels_once() {
        let bus = Arc::new(MeasurementBus::new());
        let first = pipeline(bus.clone());
        assert_eq!(first.published_channels().len(), 4);
        assert!(bus.metadata(ChannelId::RT_SERVER_OUTPUT).unwrap().visible);

        let second = AcquisitionPipeline::new(ClientConfig::default(), AcquisitionConfig::default(), bus);
        assert!(matches!(second, Err(PipelineError::DuplicateChannel { .. })));
    }

    #[test]
    fn test_idle_pipeline_state_errors() {
        let pipeline = pipeline(Arc::new(MeasurementBus::new()));
        assert!(matches!(pipeline.start_acquisition(), Err(PipelineError::NotConnected)));
        assert!(matches!(pipeline.request_info(), Err(PipelineError::NotConnected)));
        assert!(matches!(pipeline.select_connector(1), Err(PipelineError::NotConnected)));
        assert!(pipeline.stop_acquisition().is_ok());
        assert!(pipeline.stop_acquisition().is_ok());
        assert!(!Sensor::start(&pipeline));
        assert!(Sensor::stop(&pipeline));
        assert!(!pipeline.is_configured());
        assert!(matches!(
            pipeline.wait_for_device_info(Duration::from_millis(10)),
            Err(PipelineError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_buffer_size_validation() {
        let pipeline = pipeline(Arc::new(MeasurementBus::new()));
        assert_eq!(pipeline.buffer_size(), None);
        assert!(pipeline.set_buffer_size(0).is_err());
        pipeline.set_buffer_size(16).unwrap();
        assert_eq!(pipeline.buffer_size(), Some(16));
    }

    #[test]
    fn test_connect_failure_publishes_disconnected() {
        let bus = Arc::new(MeasurementBus::new());
        let pipeline = pipeline(bus.clone());
        let err = pipeline.connect().unwrap_err();
        assert!(err.is_recoverable(), "unexpected error {:?}", err);
        assert!(!pipeline.is_connected());
        assert_eq!(
            bus.current_value(pipeline.channels().connected),
            Some(MeasurementValue::Numeric(0.0))
        );
    }
}
