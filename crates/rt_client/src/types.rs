//! Common types for the acquisition server client

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Configuration for both server connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host name or address of the acquisition server
    pub host: String,
    /// Port of the command interface
    pub control_port: u16,
    /// Port of the data interface
    pub data_port: u16,
    /// Name announced on the data connection
    pub client_alias: String,
    pub connect_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    /// Upper bound on the wait for one command response
    pub command_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            control_port: 4217,
            data_port: 4218,
            client_alias: "rt_client".to_string(),
            connect_timeout_ms: 1000,
            disconnect_timeout_ms: 1000,
            command_timeout_ms: 5000,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn control_addr(&self) -> Result<SocketAddr, ClientError> {
        resolve(&self.host, self.control_port)
    }

    pub fn data_addr(&self) -> Result<SocketAddr, ClientError> {
        resolve(&self.host, self.data_port)
    }

    /// Points both ports at the given addresses' ports, keeping the alias and timeouts.
    pub fn with_addrs(mut self, control: SocketAddr, data: SocketAddr) -> Self {
        self.host = control.ip().to_string();
        self.control_port = control.port();
        self.data_port = data.port();
        self
    }
}

/// Resolves `host:port` to the first socket address it names.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ClientError::Connection(format!("cannot resolve {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| ClientError::Connection(format!("{}:{} resolves to no address", host, port)))
}

/// Errors raised by the server connections
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connect timed out or was refused, or the link failed mid-command.
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Not connected to the acquisition server")]
    NotConnected,
    /// The server does not advertise this command.
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),
    /// The server answered with an error response.
    #[error("Command '{command}' rejected: {message}")]
    Rejected { command: String, message: String },
    /// Malformed response or frame.
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

/// Connection state of the command session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_partial_json() {
        let config: ClientConfig = serde_json::from_str(r#"{"host":"localhost","data_port":5000}"#).unwrap();
        assert_eq!(config.control_port, 4217);
        assert_eq!(config.data_port, 5000);
        assert_eq!(config.connect_timeout(), Duration::from_millis(1000));
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_with_addrs() {
        let control: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let data: SocketAddr = "127.0.0.1:40002".parse().unwrap();
        let config = ClientConfig::default().with_addrs(control, data);
        assert_eq!(config.control_addr().unwrap(), control);
        assert_eq!(config.data_addr().unwrap(), data);
    }
}
