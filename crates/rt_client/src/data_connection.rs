//! The data interface: one TCP stream of tagged frames.

use log::{debug, info, warn};
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use crate::protocol::{write_frame, Frame, FrameError, FrameKind, FrameReader};
use crate::types::ClientError;

const READ_CHUNK: usize = 64 * 1024;
const HANDSHAKE_POLL: Duration = Duration::from_millis(50);

/// Result of one bounded wait for a frame.
#[derive(Debug)]
pub enum PollOutcome {
    Frame(Frame),
    /// Nothing complete arrived within the poll interval.
    Idle,
    /// The server closed the stream.
    Closed,
}

/// An identified session on the data interface.
pub struct DataConnection {
    stream: TcpStream,
    reader: FrameReader,
    client_id: i32,
    peer: SocketAddr,
    chunk: Vec<u8>,
}

impl DataConnection {
    /// Connects, announces `alias` and waits for the server to assign a client id.
    pub fn connect(addr: SocketAddr, alias: &str, timeout: Duration) -> Result<Self, ClientError> {
        let mut stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| ClientError::Connection(format!("data connection to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &Frame::alias(alias))
            .map_err(|e| ClientError::Connection(format!("sending alias: {}", e)))?;

        let mut connection = Self {
            stream,
            reader: FrameReader::new(),
            client_id: -1,
            peer: addr,
            chunk: vec![0u8; READ_CHUNK],
        };
        connection.set_poll_interval(HANDSHAKE_POLL)?;

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match connection.poll_frame()? {
                PollOutcome::Frame(frame) if frame.kind == FrameKind::ClientId => {
                    connection.client_id = frame.as_client_id()?;
                    info!(
                        "Data connection to {} established as '{}' (client id {})",
                        addr, alias, connection.client_id
                    );
                    return Ok(connection);
                }
                PollOutcome::Frame(frame) => {
                    warn!("Ignoring {:?} frame received before the client id", frame.kind);
                }
                PollOutcome::Idle => {}
                PollOutcome::Closed => {
                    return Err(ClientError::Connection(
                        "data connection closed during handshake".to_string(),
                    ));
                }
            }
        }
        Err(ClientError::Connection(format!(
            "no client id from {} within {:?}",
            addr, timeout
        )))
    }

    /// Id assigned by the server; always `>= 0` once connected.
    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Bounds how long [`poll_frame`](Self::poll_frame) blocks.
    pub fn set_poll_interval(&self, interval: Duration) -> io::Result<()> {
        self.stream
            .set_read_timeout(Some(interval.max(Duration::from_millis(1))))
    }

    /// Waits at most one poll interval for the next complete frame.
    ///
    /// Frames of unknown kind are consumed and reported as
    /// [`ClientError::Protocol`]; the stream stays usable. An oversized frame
    /// leaves the stream unreadable and is reported as a connection error.
    pub fn poll_frame(&mut self) -> Result<PollOutcome, ClientError> {
        if let Some(frame) = self.take_buffered()? {
            return Ok(PollOutcome::Frame(frame));
        }
        match self.stream.read(&mut self.chunk) {
            Ok(0) => {
                debug!("Data connection to {} closed by peer", self.peer);
                Ok(PollOutcome::Closed)
            }
            Ok(n) => {
                self.reader.extend(&self.chunk[..n]);
                Ok(match self.take_buffered()? {
                    Some(frame) => PollOutcome::Frame(frame),
                    None => PollOutcome::Idle,
                })
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(PollOutcome::Idle)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::NotConnected
                ) =>
            {
                debug!("Data connection to {} lost: {}", self.peer, e);
                Ok(PollOutcome::Closed)
            }
            Err(e) => Err(ClientError::Io(e)),
        }
    }

    pub fn send_frame(&mut self, frame: &Frame) -> Result<(), ClientError> {
        write_frame(&mut self.stream, frame).map_err(|e| ClientError::Connection(e.to_string()))
    }

    /// A second handle on the socket, used to unblock a reader from another thread.
    pub fn shutdown_handle(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!("Shutting down data connection: {}", e);
            }
        }
    }

    fn take_buffered(&mut self) -> Result<Option<Frame>, ClientError> {
        match self.reader.next_frame() {
            Ok(frame) => Ok(frame),
            Err(FrameError::UnknownKind(kind)) => {
                Err(ClientError::Protocol(format!("unknown frame kind {}", kind)))
            }
            Err(e @ FrameError::TooLarge(_)) => {
                self.reader.clear();
                Err(ClientError::Connection(format!("corrupt data stream: {}", e)))
            }
        }
    }
}

impl std::fmt::Debug for DataConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataConnection")
            .field("peer", &self.peer)
            .field("client_id", &self.client_id)
            .field("buffered", &self.reader.buffered())
            .finish()
    }
}
