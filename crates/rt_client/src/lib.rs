//! Client side of the acquisition server's two TCP interfaces.
//!
//! The server exposes a command interface (newline-delimited JSON requests and
//! responses) and a data interface (length-prefixed binary frames tagged with
//! their kind). [`ControlClient`] drives the first, [`DataConnection`] the
//! second. With the `mock` feature the crate also ships a simulated server.

pub mod control;
pub mod data_connection;
pub mod protocol;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock_server;

pub use control::ControlClient;
pub use data_connection::{DataConnection, PollOutcome};
pub use protocol::{CommandDescription, ConnectorList, Frame, FrameKind};
pub use types::{ClientConfig, ClientError, ConnectionState};
