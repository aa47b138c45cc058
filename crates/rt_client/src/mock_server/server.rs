use log::{debug, info, warn};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::signal::SignalGenerator;
use super::MockServerConfig;
use crate::protocol::{
    read_frame, write_frame, CommandDescription, CommandRequest, CommandResponse, ConnectorList,
    Frame,
};
use rt_types::{ConnectorSet, DeviceInfo};

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const SESSION_POLL: Duration = Duration::from_millis(50);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Streamer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Streamer {
    fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.join();
    }
}

struct DataClient {
    alias: String,
    writer: Arc<Mutex<TcpStream>>,
    /// Unlocked handle so a blocked writer can be interrupted.
    socket: TcpStream,
    streamer: Option<Streamer>,
}

struct ServerState {
    active_connector: i32,
    buffer_size: i32,
    next_client_id: i32,
    data_clients: BTreeMap<i32, DataClient>,
}

struct ControlSession {
    socket: TcpStream,
    handle: JoinHandle<()>,
}

struct Shared {
    config: MockServerConfig,
    cancel: CancellationToken,
    state: Mutex<ServerState>,
    commands_received: Mutex<Vec<String>>,
    sessions: Mutex<Vec<ControlSession>>,
}

/// A running simulated server. Dropping it shuts everything down.
pub struct MockServer {
    shared: Arc<Shared>,
    control_addr: SocketAddr,
    data_addr: SocketAddr,
    acceptors: Vec<JoinHandle<()>>,
}

impl MockServer {
    pub fn start(config: MockServerConfig) -> io::Result<Self> {
        if config.connector(config.active_connector).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("active connector {} is not configured", config.active_connector),
            ));
        }
        let control = TcpListener::bind((config.bind_host.as_str(), config.control_port))?;
        let data = TcpListener::bind((config.bind_host.as_str(), config.data_port))?;
        control.set_nonblocking(true)?;
        data.set_nonblocking(true)?;
        let control_addr = control.local_addr()?;
        let data_addr = data.local_addr()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(ServerState {
                active_connector: config.active_connector,
                buffer_size: config.buffer_size,
                next_client_id: 0,
                data_clients: BTreeMap::new(),
            }),
            config,
            cancel: CancellationToken::new(),
            commands_received: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        });

        let control_shared = shared.clone();
        let control_acceptor = thread::Builder::new()
            .name("mock_control_accept".into())
            .spawn(move || accept_control(control_shared, control))?;
        let data_shared = shared.clone();
        let data_acceptor = thread::Builder::new()
            .name("mock_data_accept".into())
            .spawn(move || accept_data(data_shared, data))?;

        info!(
            "Simulated acquisition server listening on {} (commands) and {} (data)",
            control_addr, data_addr
        );
        Ok(Self {
            shared,
            control_addr,
            data_addr,
            acceptors: vec![control_acceptor, data_acceptor],
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn data_addr(&self) -> SocketAddr {
        self.data_addr
    }

    pub fn config(&self) -> &MockServerConfig {
        &self.shared.config
    }

    /// Names of all commands received so far, in arrival order.
    pub fn commands_received(&self) -> Vec<String> {
        lock(&self.shared.commands_received).clone()
    }

    pub fn active_connector(&self) -> i32 {
        lock(&self.shared.state).active_connector
    }

    pub fn buffer_size(&self) -> i32 {
        lock(&self.shared.state).buffer_size
    }

    pub fn data_client_ids(&self) -> Vec<i32> {
        lock(&self.shared.state).data_clients.keys().copied().collect()
    }

    pub fn is_streaming(&self, client_id: i32) -> bool {
        lock(&self.shared.state)
            .data_clients
            .get(&client_id)
            .map_or(false, |client| client.streamer.is_some())
    }

    /// Closes every data connection, as if the link had failed.
    pub fn drop_data_clients(&self) -> usize {
        let clients = std::mem::take(&mut lock(&self.shared.state).data_clients);
        let count = clients.len();
        for (id, client) in clients {
            let _ = client.socket.shutdown(Shutdown::Both);
            if let Some(streamer) = client.streamer {
                streamer.stop();
            }
            debug!("Dropped data client {} ('{}')", id, client.alias);
        }
        count
    }

    pub fn shutdown(&mut self) {
        self.shared.cancel.cancel();
        for handle in self.acceptors.drain(..) {
            let _ = handle.join();
        }
        let sessions = std::mem::take(&mut *lock(&self.shared.sessions));
        for session in sessions {
            let _ = session.socket.shutdown(Shutdown::Both);
            let _ = session.handle.join();
        }
        self.drop_data_clients();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_control(shared: Arc<Shared>, listener: TcpListener) {
    while !shared.cancel.is_cancelled() {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("Command client {} connected", peer);
                if let Err(e) = spawn_session(&shared, stream) {
                    warn!("Cannot serve command client {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!("Accepting command client failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn spawn_session(shared: &Arc<Shared>, stream: TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(SESSION_POLL))?;
    let socket = stream.try_clone()?;
    let session_shared = shared.clone();
    let handle = thread::Builder::new()
        .name("mock_control".into())
        .spawn(move || serve_control(session_shared, stream))?;
    lock(&shared.sessions).push(ControlSession { socket, handle });
    Ok(())
}

fn serve_control(shared: Arc<Shared>, stream: TcpStream) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(e) => {
            warn!("Command session setup failed: {}", e);
            return;
        }
    };
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    while !shared.cancel.is_cancelled() {
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let response = shared.handle_line(line.trim());
                line.clear();
                let mut encoded = match serde_json::to_string(&response) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!("Encoding response failed: {}", e);
                        break;
                    }
                };
                encoded.push('\n');
                if writer.write_all(encoded.as_bytes()).is_err() {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(_) => break,
        }
    }
    let _ = writer.shutdown(Shutdown::Both);
    debug!("Command session ended");
}

fn accept_data(shared: Arc<Shared>, listener: TcpListener) {
    while !shared.cancel.is_cancelled() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = shared.register_data_client(stream) {
                    warn!("Data client {} rejected: {}", peer, e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!("Accepting data client failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn command_table() -> Vec<CommandDescription> {
    vec![
        CommandDescription::new("commands", "List the supported commands", 0),
        CommandDescription::new("conlist", "List connectors and the active one", 0),
        CommandDescription::new("selcon", "Select the active connector", 1),
        CommandDescription::new("measinfo", "Send the measurement info to a data client", 1),
        CommandDescription::new("bufsize", "Read or set the samples per buffer", 1),
        CommandDescription::new("start", "Start streaming to a data client", 1),
        CommandDescription::new("stop-all", "Stop streaming to all data clients", 0),
    ]
}

fn int_arg(request: &CommandRequest, index: usize) -> Result<i32, CommandResponse> {
    request
        .args
        .get(index)
        .and_then(|&arg| i32::try_from(arg).ok())
        .ok_or_else(|| {
            CommandResponse::error(format!(
                "'{}' needs an integer argument at position {}",
                request.command, index
            ))
        })
}

impl Shared {
    fn register_data_client(&self, stream: TcpStream) -> Result<(), crate::ClientError> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let mut reader = stream.try_clone()?;
        let alias = read_frame(&mut reader)?.as_alias()?;

        let mut state = lock(&self.state);
        let id = state.next_client_id;
        state.next_client_id += 1;
        let mut writer = stream.try_clone()?;
        write_frame(&mut writer, &Frame::client_id(id))?;
        state.data_clients.insert(
            id,
            DataClient {
                alias: alias.clone(),
                writer: Arc::new(Mutex::new(writer)),
                socket: stream,
                streamer: None,
            },
        );
        info!("Data client '{}' registered with id {}", alias, id);
        Ok(())
    }

    fn handle_line(&self, line: &str) -> CommandResponse {
        let request: CommandRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => return CommandResponse::error(format!("malformed request: {}", e)),
        };
        lock(&self.commands_received).push(request.command.clone());
        match self.handle_command(&request) {
            Ok(response) | Err(response) => response,
        }
    }

    fn handle_command(&self, request: &CommandRequest) -> Result<CommandResponse, CommandResponse> {
        match request.command.as_str() {
            "commands" => Ok(CommandResponse::ok(json!(command_table()))),
            "conlist" => {
                let connectors: ConnectorSet = self
                    .config
                    .connectors
                    .iter()
                    .map(|c| (c.id, c.name.clone()))
                    .collect();
                let list = ConnectorList {
                    active: lock(&self.state).active_connector,
                    connectors,
                };
                Ok(CommandResponse::ok(json!(list)))
            }
            "selcon" => {
                let id = int_arg(request, 0)?;
                if self.config.connector(id).is_none() {
                    return Err(CommandResponse::error(format!("unknown connector {}", id)));
                }
                lock(&self.state).active_connector = id;
                Ok(CommandResponse::ok(serde_json::Value::Null))
            }
            "measinfo" => {
                let client_id = int_arg(request, 0)?;
                let (info, writer) = {
                    let state = lock(&self.state);
                    let client = state.data_clients.get(&client_id).ok_or_else(|| {
                        CommandResponse::error(format!("unknown data client {}", client_id))
                    })?;
                    (self.active_info(&state), client.writer.clone())
                };
                let frame = Frame::meas_info(&info).map_err(|e| CommandResponse::error(e.to_string()))?;
                write_frame(&mut *lock(&writer), &frame)
                    .map_err(|e| CommandResponse::error(format!("data client {}: {}", client_id, e)))?;
                Ok(CommandResponse::ok(serde_json::Value::Null))
            }
            "bufsize" => {
                if request.args.is_empty() {
                    return Ok(CommandResponse::ok(json!(lock(&self.state).buffer_size)));
                }
                let size = int_arg(request, 0)?;
                if size <= 0 {
                    return Err(CommandResponse::error(format!("invalid buffer size {}", size)));
                }
                lock(&self.state).buffer_size = size;
                Ok(CommandResponse::ok(json!(size)))
            }
            "start" => {
                let client_id = int_arg(request, 0)?;
                let mut state = lock(&self.state);
                let info = self.active_info(&state);
                let client = state.data_clients.get_mut(&client_id).ok_or_else(|| {
                    CommandResponse::error(format!("unknown data client {}", client_id))
                })?;
                if client.streamer.is_none() {
                    let streamer = self
                        .spawn_streamer(client.writer.clone(), info)
                        .map_err(|e| CommandResponse::error(e.to_string()))?;
                    client.streamer = Some(streamer);
                    info!("Streaming to data client {}", client_id);
                }
                Ok(CommandResponse::ok(serde_json::Value::Null))
            }
            "stop-all" => {
                let stopped: Vec<(i32, Streamer, Arc<Mutex<TcpStream>>)> = {
                    let mut state = lock(&self.state);
                    state
                        .data_clients
                        .iter_mut()
                        .filter_map(|(id, client)| {
                            client.streamer.take().map(|s| (*id, s, client.writer.clone()))
                        })
                        .collect()
                };
                for (id, streamer, writer) in stopped {
                    streamer.stop();
                    if let Err(e) = write_frame(&mut *lock(&writer), &Frame::stop()) {
                        debug!("Stop frame to data client {} failed: {}", id, e);
                    }
                }
                Ok(CommandResponse::ok(serde_json::Value::Null))
            }
            other => Err(CommandResponse::error(format!("unknown command '{}'", other))),
        }
    }

    fn active_info(&self, state: &ServerState) -> DeviceInfo {
        match self.config.connector(state.active_connector) {
            Some(connector) => connector.info.clone().with_connector(connector.id),
            None => DeviceInfo::new(1, 1.0),
        }
    }

    fn spawn_streamer(&self, writer: Arc<Mutex<TcpStream>>, info: DeviceInfo) -> io::Result<Streamer> {
        let cancel = self.cancel.child_token();
        let token = cancel.clone();
        let shape = self.config.signal;
        let frame_samples = self.config.frame_samples.max(1);
        let interval = self.config.frame_interval;
        let handle = thread::Builder::new().name("mock_stream".into()).spawn(move || {
            let mut generator = SignalGenerator::new(shape, info.num_channels, info.sampling_rate);
            while !token.is_cancelled() {
                let frame = Frame::data_buffer(&generator.next_frame(frame_samples));
                if let Err(e) = write_frame(&mut *lock(&writer), &frame) {
                    debug!("Streaming stopped: {}", e);
                    break;
                }
                thread::sleep(interval);
            }
            debug!("Streamer sent {} samples", generator.samples_generated());
        })?;
        Ok(Streamer { cancel, handle })
    }
}
