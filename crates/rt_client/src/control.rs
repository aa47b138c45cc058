//! Client for the server's command interface.

use log::{debug, info, warn};
use rt_types::ConnectorSet;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::protocol::{CommandDescription, CommandRequest, CommandResponse, ConnectorList};
use crate::types::{ClientConfig, ClientError, ConnectionState};

/// Everything the session knows, kept under one lock.
struct ControlState {
    connection: ConnectionState,
    stream: Option<BufReader<TcpStream>>,
    peer: Option<SocketAddr>,
    /// Commands advertised by the server; empty until `commands` succeeds.
    commands: Vec<CommandDescription>,
    connectors: ConnectorSet,
    active_connector: Option<i32>,
}

impl ControlState {
    fn new() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            stream: None,
            peer: None,
            commands: Vec::new(),
            connectors: ConnectorSet::new(),
            active_connector: None,
        }
    }

    /// Drops the socket without the close handshake.
    fn teardown(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.get_ref().shutdown(Shutdown::Both);
        }
        self.connection = ConnectionState::Disconnected;
        self.peer = None;
    }

    /// Notices a close by the server that happened since the last command.
    /// Bytes the server sent unasked are dropped so they cannot be taken for
    /// the next response.
    fn peer_closed(&mut self) -> bool {
        let Some(reader) = self.stream.as_mut() else {
            return true;
        };
        let stale = reader.buffer().len();
        if stale > 0 {
            debug!("Discarding {} unsolicited bytes", stale);
            reader.consume(stale);
        }
        let mut stream = reader.get_ref();
        if stream.set_nonblocking(true).is_err() {
            return true;
        }
        let mut scratch = [0u8; 512];
        let closed = loop {
            match stream.read(&mut scratch) {
                Ok(0) => break true,
                Ok(n) => debug!("Discarding {} unsolicited bytes", n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break true,
            }
        };
        closed || stream.set_nonblocking(false).is_err()
    }
}

/// One synchronous session with the command interface.
///
/// Every operation sends one command and waits for its response line. The
/// client caches the advertised command table and the connector table, both
/// cleared on every fresh connect.
pub struct ControlClient {
    config: ClientConfig,
    state: Mutex<ControlState>,
}

impl ControlClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ControlState::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens the session, closing any existing one first.
    pub fn connect(&self, addr: SocketAddr) -> Result<(), ClientError> {
        if self.is_connected() {
            self.disconnect()?;
        }

        let mut state = self.lock();
        state.connection = ConnectionState::Connecting;
        state.commands.clear();
        state.connectors.clear();
        state.active_connector = None;

        let stream = match TcpStream::connect_timeout(&addr, self.config.connect_timeout()) {
            Ok(stream) => stream,
            Err(e) => {
                state.connection = ConnectionState::Disconnected;
                warn!("Command connection to {} failed: {}", addr, e);
                return Err(ClientError::Connection(format!("{}: {}", addr, e)));
            }
        };
        if let Err(e) = stream
            .set_nodelay(true)
            .and_then(|_| stream.set_read_timeout(Some(self.config.command_timeout())))
        {
            state.connection = ConnectionState::Disconnected;
            return Err(ClientError::Connection(e.to_string()));
        }

        state.stream = Some(BufReader::new(stream));
        state.peer = Some(addr);
        state.connection = ConnectionState::Connected;
        info!("Command connection to {} established", addr);
        Ok(())
    }

    /// Connects to the address in the configuration.
    pub fn connect_configured(&self) -> Result<(), ClientError> {
        let addr = self.config.control_addr()?;
        self.connect(addr)
    }

    /// Closes the session gracefully. A no-op when already disconnected.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        let mut state = self.lock();
        let Some(mut reader) = state.stream.take() else {
            state.connection = ConnectionState::Disconnected;
            return Ok(());
        };
        let peer = state.peer.take();
        state.connection = ConnectionState::Disconnected;
        drop(state);

        let timeout = self.config.disconnect_timeout();
        let stream = reader.get_ref();
        if let Err(e) = stream.shutdown(Shutdown::Write) {
            debug!("Half-close of command connection failed: {}", e);
            return Ok(());
        }
        let _ = stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))));

        // Wait for the server to close its side.
        let deadline = Instant::now() + timeout;
        let mut sink = [0u8; 512];
        while Instant::now() < deadline {
            match reader.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = reader.get_ref().shutdown(Shutdown::Both);
        info!("Command connection to {:?} closed", peer);
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock().peer
    }

    /// Cached command table from the last `commands` request.
    pub fn commands(&self) -> Vec<CommandDescription> {
        self.lock().commands.clone()
    }

    /// Cached connector table from the last `conlist` request.
    pub fn connectors(&self) -> ConnectorSet {
        self.lock().connectors.clone()
    }

    pub fn active_connector(&self) -> Option<i32> {
        self.lock().active_connector
    }

    /// Sends one command and returns the `result` of its response.
    pub fn send(&self, command: &str, args: &[i64]) -> Result<serde_json::Value, ClientError> {
        let mut state = self.lock();
        Self::send_locked(&mut state, command, args)
    }

    fn send_locked(
        state: &mut ControlState,
        command: &str,
        args: &[i64],
    ) -> Result<serde_json::Value, ClientError> {
        if state.connection != ConnectionState::Connected {
            warn!("Command '{}' ignored: not connected", command);
            return Err(ClientError::NotConnected);
        }
        if state.peer_closed() {
            warn!("Command connection closed by server; '{}' not sent", command);
            state.teardown();
            return Err(ClientError::NotConnected);
        }
        if !state.commands.is_empty() && !state.commands.iter().any(|c| c.name == command) {
            return Err(ClientError::UnsupportedCommand(command.to_string()));
        }

        let line = CommandRequest::new(command, args).to_line()?;
        let Some(reader) = state.stream.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        // The reader never holds data here: responses are strictly one line per request.
        if let Err(e) = reader.get_mut().write_all(line.as_bytes()) {
            state.teardown();
            return Err(ClientError::Connection(format!("sending '{}': {}", command, e)));
        }

        let mut response = String::new();
        match reader.read_line(&mut response) {
            Ok(0) => {
                state.teardown();
                Err(ClientError::Connection(format!(
                    "connection closed while waiting for '{}'",
                    command
                )))
            }
            Ok(_) => {
                debug!("'{}' {:?} -> {}", command, args, response.trim_end());
                let response: CommandResponse = serde_json::from_str(response.trim_end())?;
                response.into_result(command)
            }
            Err(e) => {
                state.teardown();
                Err(ClientError::Connection(format!(
                    "waiting for '{}': {}",
                    command, e
                )))
            }
        }
    }

    /// `commands`: fetches and caches the server's command table.
    pub fn request_commands(&self) -> Result<Vec<CommandDescription>, ClientError> {
        let mut state = self.lock();
        state.commands.clear();
        let result = Self::send_locked(&mut state, "commands", &[])?;
        let commands: Vec<CommandDescription> = serde_json::from_value(result)?;
        debug!("Server advertises {} commands", commands.len());
        state.commands = commands.clone();
        Ok(commands)
    }

    /// `conlist`: fetches and caches the connector table and the active connector.
    pub fn request_connectors(&self) -> Result<ConnectorList, ClientError> {
        let mut state = self.lock();
        let result = Self::send_locked(&mut state, "conlist", &[])?;
        let list: ConnectorList = serde_json::from_value(result)?;
        state.connectors = list.connectors.clone();
        state.active_connector = Some(list.active);
        Ok(list)
    }

    /// `selcon id`: makes `id` the active connector.
    pub fn select_connector(&self, id: i32) -> Result<(), ClientError> {
        let mut state = self.lock();
        if !state.connectors.is_empty() && !state.connectors.contains(id) {
            return Err(ClientError::InvalidArgument(format!("unknown connector {}", id)));
        }
        Self::send_locked(&mut state, "selcon", &[id as i64])?;
        state.active_connector = Some(id);
        info!("Connector {} selected", id);
        Ok(())
    }

    /// `measinfo id`: asks the server to send the device description on the
    /// data connection identified by `data_client_id`.
    pub fn request_info(&self, data_client_id: i32) -> Result<(), ClientError> {
        if data_client_id < 0 {
            return Err(ClientError::InvalidArgument(format!(
                "data client id {} is not assigned",
                data_client_id
            )));
        }
        self.send("measinfo", &[data_client_id as i64]).map(|_| ())
    }

    /// `bufsize`: samples per block the server will send.
    pub fn request_buffer_size(&self) -> Result<i32, ClientError> {
        let result = self.send("bufsize", &[])?;
        result
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| ClientError::Protocol(format!("bufsize result {} is not an integer", result)))
    }

    /// `bufsize n`
    pub fn set_buffer_size(&self, samples: i32) -> Result<(), ClientError> {
        if samples <= 0 {
            return Err(ClientError::InvalidArgument(format!(
                "buffer size must be positive, got {}",
                samples
            )));
        }
        self.send("bufsize", &[samples as i64]).map(|_| ())
    }

    /// `start id`: starts streaming to the given data client.
    pub fn start(&self, data_client_id: i32) -> Result<(), ClientError> {
        if data_client_id < 0 {
            return Err(ClientError::InvalidArgument(format!(
                "data client id {} is not assigned",
                data_client_id
            )));
        }
        self.send("start", &[data_client_id as i64]).map(|_| ())
    }

    /// `stop-all`
    pub fn stop_all(&self) -> Result<(), ClientError> {
        self.send("stop-all", &[]).map(|_| ())
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient")
            .field("state", &self.state())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_server::{MockServer, MockServerConfig};
    use std::net::TcpListener;

    fn client() -> ControlClient {
        ControlClient::new(ClientConfig {
            connect_timeout_ms: 500,
            disconnect_timeout_ms: 500,
            ..ClientConfig::default()
        })
    }

    #[test]
    fn test_commands_while_disconnected_are_rejected() {
        let client = client();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(client.stop_all(), Err(ClientError::NotConnected)));
        assert!(matches!(client.request_connectors(), Err(ClientError::NotConnected)));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let server = MockServer::start(MockServerConfig::default()).unwrap();
        let client = client();
        client.disconnect().unwrap();

        client.connect(server.control_addr()).unwrap();
        assert!(client.is_connected());
        client.disconnect().unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.disconnect().unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_refused_connect_reverts_to_disconnected() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let client = client();
        assert!(matches!(client.connect(addr), Err(ClientError::Connection(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_negotiation_against_simulated_server() {
        let server = MockServer::start(MockServerConfig::default()).unwrap();
        let client = client();
        client.connect(server.control_addr()).unwrap();

        let commands = client.request_commands().unwrap();
        assert!(commands.iter().any(|c| c.name == "selcon" && c.args == 1));

        let list = client.request_connectors().unwrap();
        assert_eq!(list.active, 1);
        assert_eq!(list.connectors.get(1), Some("A"));
        assert_eq!(list.connectors.get(2), Some("B"));

        assert_eq!(client.request_buffer_size().unwrap(), 100);
        client.set_buffer_size(8).unwrap();
        assert_eq!(client.request_buffer_size().unwrap(), 8);
        assert!(matches!(client.set_buffer_size(0), Err(ClientError::InvalidArgument(_))));

        client.select_connector(2).unwrap();
        assert_eq!(client.active_connector(), Some(2));
        assert!(matches!(client.select_connector(9), Err(ClientError::InvalidArgument(_))));

        assert!(matches!(client.send("reboot", &[]), Err(ClientError::UnsupportedCommand(_))));
        // The server rejects measinfo for a data client it never assigned.
        assert!(matches!(client.request_info(42), Err(ClientError::Rejected { .. })));
        assert!(client.is_connected());
    }

    #[test]
    fn test_server_close_is_noticed_before_next_command() {
        let server = MockServer::start(MockServerConfig::default()).unwrap();
        let client = client();
        client.connect(server.control_addr()).unwrap();
        client.request_connectors().unwrap();

        drop(server);
        std::thread::sleep(Duration::from_millis(200));

        assert!(client.stop_all().is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_unsolicited_lines_are_not_taken_as_responses() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (sent_tx, sent_rx) = std::sync::mpsc::channel();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            writer
                .write_all(b"{\"status\":\"ok\",\"result\":8}\n")
                .unwrap();
            // Stray line, once in the client's buffer and once on the socket.
            writer
                .write_all(b"{\"status\":\"ok\",\"result\":99}\n")
                .unwrap();
            sent_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            writer
                .write_all(b"{\"status\":\"ok\",\"result\":98}\n")
                .unwrap();
            line.clear();
            reader.read_line(&mut line).unwrap();
            assert!(line.contains("bufsize"));
            writer
                .write_all(b"{\"status\":\"ok\",\"result\":16}\n")
                .unwrap();
        });

        let client = client();
        client.connect(addr).unwrap();
        assert_eq!(client.request_buffer_size().unwrap(), 8);
        sent_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(client.request_buffer_size().unwrap(), 16);
        server.join().unwrap();
    }

    #[test]
    fn test_reconnect_clears_cached_tables() {
        let server = MockServer::start(MockServerConfig::default()).unwrap();
        let client = client();
        client.connect(server.control_addr()).unwrap();
        client.request_connectors().unwrap();
        assert_eq!(client.connectors().len(), 2);

        client.connect(server.control_addr()).unwrap();
        assert!(client.connectors().is_empty());
        assert_eq!(client.active_connector(), None);
        assert!(client.is_connected());
    }
}
