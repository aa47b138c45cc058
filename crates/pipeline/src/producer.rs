//! Producer: reads the data connection and fills the ring buffer.
//!
//! The read loop runs on its own thread and demultiplexes frames by two
//! flags. While a device description is requested only `MeasInfo` frames are
//! accepted; while measuring, `DataBuffer` payloads are accumulated and cut
//! into fixed-shape blocks, each pushed to the ring buffer exactly once.

use rt_client::{ClientConfig, ClientError, DataConnection, Frame, FrameKind, PollOutcome};
use rt_types::{Block, DeviceInfo};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::ring_buffer::RingBuffer;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Events raised by the producer thread.
pub trait ProducerListener: Send + Sync {
    /// A requested device description arrived and validated.
    fn info_available(&self, info: DeviceInfo);

    /// Measuring ended on the server side.
    fn measuring_changed(&self, measuring: bool);

    /// The data connection ended without a local stop. Called at most once
    /// per connection.
    fn connection_lost(&self, reason: &str);
}

/// Where data frames go while measuring.
struct MeasurementTarget {
    ring: Arc<RingBuffer>,
    num_channels: usize,
    samples_per_block: usize,
    /// Samples received but not yet a whole block.
    pending: Vec<f32>,
}

impl MeasurementTarget {
    fn block_len(&self) -> usize {
        self.num_channels * self.samples_per_block
    }

    fn take_blocks(&mut self, samples: Vec<f32>) -> PipelineResult<Vec<Block>> {
        self.pending.extend(samples);
        let block_len = self.block_len();
        let mut blocks = Vec::with_capacity(self.pending.len() / block_len);
        while self.pending.len() >= block_len {
            let data: Vec<f32> = self.pending.drain(..block_len).collect();
            blocks.push(Block::new(self.num_channels, self.samples_per_block, data)?);
        }
        Ok(blocks)
    }
}

#[derive(Default)]
struct ProducerFlags {
    info_requested: Mutex<bool>,
    measuring: Mutex<Option<MeasurementTarget>>,
    /// Set while the client itself is stopping; the server's `Stop` is then
    /// an acknowledgement, not news.
    local_stop: AtomicBool,
}

impl ProducerFlags {
    fn clear(&self) {
        *lock(&self.info_requested) = false;
        lock(&self.measuring).take();
        self.local_stop.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    blocks_pushed: AtomicU64,
    protocol_errors: AtomicU64,
}

/// Producer activity since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub frames: u64,
    pub blocks_pushed: u64,
    pub protocol_errors: u64,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    socket: TcpStream,
    client_id: i32,
    alive: Arc<AtomicBool>,
}

/// Everything the read loop shares with the producer handle.
struct ReadLoop {
    flags: Arc<ProducerFlags>,
    counters: Arc<Counters>,
    listener: Arc<dyn ProducerListener>,
    cancel: CancellationToken,
    poll_interval: Duration,
    alive: Arc<AtomicBool>,
}

pub struct Producer {
    config: ClientConfig,
    poll_interval: Duration,
    listener: Arc<dyn ProducerListener>,
    flags: Arc<ProducerFlags>,
    counters: Arc<Counters>,
    worker: Mutex<Option<Worker>>,
}

impl Producer {
    pub fn new(config: ClientConfig, poll_interval: Duration, listener: Arc<dyn ProducerListener>) -> Self {
        Self {
            config,
            poll_interval,
            listener,
            flags: Arc::new(ProducerFlags::default()),
            counters: Arc::new(Counters::default()),
            worker: Mutex::new(None),
        }
    }

    /// Opens the data connection, or reuses the live one, and returns the
    /// data client id.
    pub fn connect(&self) -> PipelineResult<i32> {
        let mut worker = lock(&self.worker);
        if let Some(current) = worker.as_ref() {
            if current.alive.load(Ordering::SeqCst) {
                return Ok(current.client_id);
            }
        }
        if let Some(dead) = worker.take() {
            let _ = dead.handle.join();
        }

        let addr = self.config.data_addr()?;
        let connection =
            DataConnection::connect(addr, &self.config.client_alias, self.config.connect_timeout())?;
        connection.set_poll_interval(self.poll_interval)?;
        let socket = connection.shutdown_handle()?;
        let client_id = connection.client_id();

        let cancel = CancellationToken::new();
        let alive = Arc::new(AtomicBool::new(true));
        let read_loop = ReadLoop {
            flags: self.flags.clone(),
            counters: self.counters.clone(),
            listener: self.listener.clone(),
            cancel: cancel.clone(),
            poll_interval: self.poll_interval,
            alive: alive.clone(),
        };
        let handle = thread::Builder::new()
            .name("rt_producer".into())
            .spawn(move || read_loop.run(connection))?;

        info!(client_id, %addr, "Producer connected");
        *worker = Some(Worker {
            cancel,
            handle,
            socket,
            client_id,
            alive,
        });
        Ok(client_id)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .map_or(false, |w| w.alive.load(Ordering::SeqCst))
    }

    pub fn client_id(&self) -> Option<i32> {
        lock(&self.worker)
            .as_ref()
            .filter(|w| w.alive.load(Ordering::SeqCst))
            .map(|w| w.client_id)
    }

    /// Expects the next frame to be a device description.
    pub fn request_info(&self) {
        *lock(&self.flags.info_requested) = true;
    }

    pub fn cancel_info_request(&self) {
        *lock(&self.flags.info_requested) = false;
    }

    pub fn is_info_requested(&self) -> bool {
        *lock(&self.flags.info_requested)
    }

    /// Routes data frames into `ring`, cut to its shape.
    pub fn start_measuring(&self, ring: Arc<RingBuffer>) -> PipelineResult<()> {
        if !self.is_connected() {
            return Err(PipelineError::NotConnected);
        }
        let (num_channels, samples_per_block) = ring.shape();
        self.flags.local_stop.store(false, Ordering::SeqCst);
        *lock(&self.flags.measuring) = Some(MeasurementTarget {
            ring,
            num_channels,
            samples_per_block,
            pending: Vec::new(),
        });
        debug!(num_channels, samples_per_block, "Producer measuring");
        Ok(())
    }

    /// Announces a stop requested by this client. Until `stop_measuring`,
    /// a `Stop` frame ends measuring without notifying the listener.
    pub fn begin_stop(&self) {
        self.flags.local_stop.store(true, Ordering::SeqCst);
    }

    /// Detaches the ring buffer; samples of an incomplete block are discarded.
    pub fn stop_measuring(&self) {
        if let Some(target) = lock(&self.flags.measuring).take() {
            if !target.pending.is_empty() {
                debug!(samples = target.pending.len(), "Discarding partial block");
            }
        }
        self.flags.local_stop.store(false, Ordering::SeqCst);
    }

    pub fn is_measuring(&self) -> bool {
        lock(&self.flags.measuring).is_some()
    }

    /// Clears both flags, ends the read loop and closes the data connection.
    pub fn stop(&self) {
        self.flags.clear();
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        worker.cancel.cancel();
        let _ = worker.socket.shutdown(Shutdown::Both);
        if worker.handle.join().is_err() {
            error!("Producer thread panicked");
        }
        info!(client_id = worker.client_id, "Producer stopped");
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            frames: self.counters.frames.load(Ordering::Relaxed),
            blocks_pushed: self.counters.blocks_pushed.load(Ordering::Relaxed),
            protocol_errors: self.counters.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ReadLoop {
    fn run(self, mut connection: DataConnection) {
        let mut lost = None;
        while !self.cancel.is_cancelled() {
            match connection.poll_frame() {
                Ok(PollOutcome::Frame(frame)) => {
                    self.counters.frames.fetch_add(1, Ordering::Relaxed);
                    self.handle_frame(frame);
                }
                Ok(PollOutcome::Idle) => {}
                Ok(PollOutcome::Closed) => {
                    lost = Some("data connection closed by server".to_string());
                    break;
                }
                Err(ClientError::Protocol(message)) => self.protocol_error(&message),
                Err(e) => {
                    lost = Some(e.to_string());
                    break;
                }
            }
        }
        connection.shutdown();
        // Observers told about the loss must already see the producer as down.
        self.alive.store(false, Ordering::SeqCst);

        if self.cancel.is_cancelled() {
            debug!("Producer read loop cancelled");
            return;
        }
        self.flags.clear();
        if let Some(reason) = lost {
            warn!(%reason, "Data connection lost");
            self.listener.connection_lost(&reason);
        }
    }

    fn protocol_error(&self, message: &str) {
        self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
        warn!(%message, "Protocol error, frame dropped");
    }

    fn handle_frame(&self, frame: Frame) {
        if frame.kind == FrameKind::Stop {
            if lock(&self.flags.measuring).take().is_some() {
                if self.flags.local_stop.load(Ordering::SeqCst) {
                    debug!("Server acknowledged the stop");
                } else {
                    info!("Server stopped the measurement");
                    self.listener.measuring_changed(false);
                }
            }
            return;
        }

        let mut info_requested = lock(&self.flags.info_requested);
        if *info_requested {
            match frame.as_device_info() {
                Ok(info) => {
                    *info_requested = false;
                    drop(info_requested);
                    debug!(num_channels = info.num_channels, "Device info received");
                    self.listener.info_available(info);
                }
                Err(e) => self.protocol_error(&e.to_string()),
            }
            return;
        }
        drop(info_requested);

        let (blocks, ring) = {
            let mut measuring = lock(&self.flags.measuring);
            let Some(target) = measuring.as_mut() else {
                self.protocol_error(&format!("unexpected {:?} frame", frame.kind));
                return;
            };
            let samples = match frame.samples() {
                Ok(samples) => samples,
                Err(e) => {
                    self.protocol_error(&e.to_string());
                    return;
                }
            };
            match target.take_blocks(samples) {
                Ok(blocks) => (blocks, target.ring.clone()),
                Err(e) => {
                    self.protocol_error(&e.to_string());
                    return;
                }
            }
        };

        for block in blocks {
            if !self.push(&ring, block) {
                return;
            }
        }
    }

    /// Pushes one block, waiting for space. Gives up if cancelled or if the
    /// ring was detached meanwhile.
    fn push(&self, ring: &Arc<RingBuffer>, mut block: Block) -> bool {
        loop {
            match ring.push_timeout(block, self.poll_interval) {
                Ok(None) => {
                    self.counters.blocks_pushed.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Ok(Some(back)) => {
                    let attached = lock(&self.flags.measuring)
                        .as_ref()
                        .map_or(false, |t| Arc::ptr_eq(&t.ring, ring));
                    if self.cancel.is_cancelled() || !attached {
                        trace!("Block discarded, measuring stopped while the ring was full");
                        return false;
                    }
                    block = back;
                }
                Err(e) => {
                    warn!(error = %e, "Block not pushed");
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_client::mock_server::{MockServer, MockServerConfig};
    use std::sync::mpsc;
    use std::time::Instant;

    #[derive(Debug, PartialEq)]
    enum Event {
        Info(usize),
        Measuring(bool),
        Lost,
    }

    struct ChannelListener(Mutex<mpsc::Sender<Event>>);

    impl ProducerListener for ChannelListener {
        fn info_available(&self, info: DeviceInfo) {
            let _ = lock(&self.0).send(Event::Info(info.num_channels));
        }
        fn measuring_changed(&self, measuring: bool) {
            let _ = lock(&self.0).send(Event::Measuring(measuring));
        }
        fn connection_lost(&self, _reason: &str) {
            let _ = lock(&self.0).send(Event::Lost);
        }
    }

    fn setup(frame_samples: usize) -> (MockServer, Producer, rt_client::ControlClient, mpsc::Receiver<Event>) {
        let server = MockServer::start(MockServerConfig {
            frame_samples,
            ..MockServerConfig::default()
        })
        .unwrap();
        let config = ClientConfig::default().with_addrs(server.control_addr(), server.data_addr());
        let (tx, rx) = mpsc::channel();
        let producer = Producer::new(
            config.clone(),
            Duration::from_millis(20),
            Arc::new(ChannelListener(Mutex::new(tx))),
        );
        let control = rt_client::ControlClient::new(config);
        control.connect(server.control_addr()).unwrap();
        (server, producer, control, rx)
    }

    #[test]
    fn test_info_then_blocks_in_order() {
        let (_server, producer, control, events) = setup(3);
        let id = producer.connect().unwrap();
        assert_eq!(producer.connect().unwrap(), id);

        producer.request_info();
        control.request_info(id).unwrap();
        assert_eq!(events.recv_timeout(Duration::from_secs(2)).unwrap(), Event::Info(4));
        assert!(!producer.is_info_requested());

        // Frames of 3 columns cut into blocks of 5 columns.
        let ring = Arc::new(RingBuffer::new(8, 4, 5).unwrap());
        producer.start_measuring(ring.clone()).unwrap();
        control.start(id).unwrap();

        let mut next = 0u64;
        for _ in 0..4 {
            let block = ring.pop_timeout(Duration::from_secs(2)).unwrap().expect("block");
            for column in block.columns() {
                let expected: Vec<f32> =
                    (0..4).map(|c| MockServerConfig::ramp_value(next, 4, c)).collect();
                assert_eq!(column, &expected[..]);
                next += 1;
            }
        }

        control.stop_all().unwrap();
        // Keep draining so the producer is never stuck on a full ring.
        let deadline = Instant::now() + Duration::from_secs(2);
        let event = loop {
            assert!(Instant::now() < deadline, "no stop event");
            while ring.try_pop().is_some() {}
            if let Ok(event) = events.recv_timeout(Duration::from_millis(20)) {
                break event;
            }
        };
        assert_eq!(event, Event::Measuring(false));
        assert!(!producer.is_measuring());
        producer.stop();
        assert!(!producer.is_connected());
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_local_stop_is_not_reported() {
        let (_server, producer, control, events) = setup(3);
        let id = producer.connect().unwrap();
        let ring = Arc::new(RingBuffer::new(8, 4, 3).unwrap());
        producer.start_measuring(ring.clone()).unwrap();
        control.start(id).unwrap();
        assert!(ring.pop_timeout(Duration::from_secs(2)).unwrap().is_some());

        producer.begin_stop();
        control.stop_all().unwrap();
        // The Stop frame still ends measuring, silently.
        let deadline = Instant::now() + Duration::from_secs(2);
        while producer.is_measuring() {
            assert!(Instant::now() < deadline, "measuring never ended");
            while ring.try_pop().is_some() {}
            thread::sleep(Duration::from_millis(10));
        }
        producer.stop_measuring();
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());

        // A later server-side stop is reported again.
        producer.start_measuring(ring.clone()).unwrap();
        control.start(id).unwrap();
        control.stop_all().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let event = loop {
            assert!(Instant::now() < deadline, "no stop event");
            while ring.try_pop().is_some() {}
            if let Ok(event) = events.recv_timeout(Duration::from_millis(20)) {
                break event;
            }
        };
        assert_eq!(event, Event::Measuring(false));
        producer.stop();
    }

    #[test]
    fn test_connection_lost_reported_once() {
        let (server, producer, _control, events) = setup(3);
        producer.connect().unwrap();
        server.drop_data_clients();

        assert_eq!(events.recv_timeout(Duration::from_secs(2)).unwrap(), Event::Lost);
        let deadline = Instant::now() + Duration::from_secs(1);
        while producer.is_connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!producer.is_connected());
        assert!(events.recv_timeout(Duration::from_millis(200)).is_err());

        // A fresh connection gets a new id.
        let id = producer.connect().unwrap();
        assert_eq!(producer.client_id(), Some(id));
    }

    #[test]
    fn test_frames_without_flags_are_dropped() {
        let (_server, producer, control, events) = setup(3);
        let id = producer.connect().unwrap();
        // measinfo without the info flag
        control.request_info(id).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while producer.stats().protocol_errors == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(producer.stats().protocol_errors, 1);
        assert!(events.try_recv().is_err());
        assert!(producer.is_connected());
    }

    #[test]
    fn test_start_measuring_requires_connection() {
        let (_server, producer, _control, _events) = setup(3);
        let ring = Arc::new(RingBuffer::new(2, 4, 5).unwrap());
        assert!(matches!(producer.start_measuring(ring), Err(PipelineError::NotConnected)));
        producer.stop();
    }
}
