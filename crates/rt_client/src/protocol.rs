//! Wire formats of the command and data interfaces.
//!
//! Commands are newline-delimited JSON: one [`CommandRequest`] per line, one
//! [`CommandResponse`] line back. Data frames are an 8 byte header (`u32`
//! kind, `u32` payload length, both little endian) followed by the payload.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use rt_types::{ConnectorSet, DeviceInfo};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

use crate::types::ClientError;

pub const FRAME_HEADER_LEN: usize = 8;
/// Frames announcing a larger payload are treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// One command sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<i64>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, args: &[i64]) -> Self {
        Self {
            command: command.into(),
            args: args.to_vec(),
        }
    }

    /// Encodes the request as one line, terminator included.
    pub fn to_line(&self) -> Result<String, ClientError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// The server's answer to one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CommandResponse {
    Ok {
        #[serde(default)]
        result: serde_json::Value,
    },
    Error {
        message: String,
    },
}

impl CommandResponse {
    pub fn ok(result: serde_json::Value) -> Self {
        CommandResponse::Ok { result }
    }

    pub fn error(message: impl Into<String>) -> Self {
        CommandResponse::Error {
            message: message.into(),
        }
    }

    pub fn into_result(self, command: &str) -> Result<serde_json::Value, ClientError> {
        match self {
            CommandResponse::Ok { result } => Ok(result),
            CommandResponse::Error { message } => Err(ClientError::Rejected {
                command: command.to_string(),
                message,
            }),
        }
    }
}

/// One entry of the server's advertised command table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDescription {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Number of integer arguments the command takes.
    #[serde(default)]
    pub args: usize,
}

impl CommandDescription {
    pub fn new(name: &str, description: &str, args: usize) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            args,
        }
    }
}

/// Result of `conlist`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorList {
    pub active: i32,
    pub connectors: ConnectorSet,
}

/// Tag of a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FrameKind {
    /// Client alias, client to server.
    Alias = 1,
    /// Data client id assigned by the server.
    ClientId = 2,
    /// JSON [`DeviceInfo`].
    MeasInfo = 3,
    /// f32 samples, one column after the other.
    DataBuffer = 4,
    /// Acquisition stopped on the server side.
    Stop = 5,
}

impl FrameKind {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(FrameKind::Alias),
            2 => Some(FrameKind::ClientId),
            3 => Some(FrameKind::MeasInfo),
            4 => Some(FrameKind::DataBuffer),
            5 => Some(FrameKind::Stop),
            _ => None,
        }
    }
}

/// One tagged data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn alias(alias: &str) -> Self {
        Self::new(FrameKind::Alias, alias.as_bytes().to_vec())
    }

    pub fn client_id(id: i32) -> Self {
        let mut payload = vec![0u8; 4];
        LittleEndian::write_i32(&mut payload, id);
        Self::new(FrameKind::ClientId, payload)
    }

    pub fn meas_info(info: &DeviceInfo) -> Result<Self, ClientError> {
        Ok(Self::new(FrameKind::MeasInfo, serde_json::to_vec(info)?))
    }

    pub fn data_buffer(samples: &[f32]) -> Self {
        let mut payload = vec![0u8; samples.len() * 4];
        LittleEndian::write_f32_into(samples, &mut payload);
        Self::new(FrameKind::DataBuffer, payload)
    }

    pub fn stop() -> Self {
        Self::new(FrameKind::Stop, Vec::new())
    }

    pub fn as_alias(&self) -> Result<String, ClientError> {
        self.expect_kind(FrameKind::Alias)?;
        String::from_utf8(self.payload.clone())
            .map_err(|e| ClientError::Protocol(format!("alias is not UTF-8: {}", e)))
    }

    pub fn as_client_id(&self) -> Result<i32, ClientError> {
        self.expect_kind(FrameKind::ClientId)?;
        if self.payload.len() != 4 {
            return Err(ClientError::Protocol(format!(
                "client id payload of {} bytes",
                self.payload.len()
            )));
        }
        Ok(LittleEndian::read_i32(&self.payload))
    }

    pub fn as_device_info(&self) -> Result<DeviceInfo, ClientError> {
        self.expect_kind(FrameKind::MeasInfo)?;
        DeviceInfo::from_json(&self.payload).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    /// Decodes a data payload. Its length must be a whole number of samples.
    pub fn samples(&self) -> Result<Vec<f32>, ClientError> {
        self.expect_kind(FrameKind::DataBuffer)?;
        if self.payload.len() % 4 != 0 {
            return Err(ClientError::Protocol(format!(
                "data payload of {} bytes is not a whole number of samples",
                self.payload.len()
            )));
        }
        let mut samples = vec![0f32; self.payload.len() / 4];
        LittleEndian::read_f32_into(&self.payload, &mut samples);
        Ok(samples)
    }

    fn expect_kind(&self, kind: FrameKind) -> Result<(), ClientError> {
        if self.kind != kind {
            return Err(ClientError::Protocol(format!(
                "expected {:?} frame, got {:?}",
                kind, self.kind
            )));
        }
        Ok(())
    }
}

pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    let mut bytes = Vec::with_capacity(FRAME_HEADER_LEN + frame.payload.len());
    bytes.write_u32::<LittleEndian>(frame.kind as u32)?;
    bytes.write_u32::<LittleEndian>(frame.payload.len() as u32)?;
    bytes.extend_from_slice(&frame.payload);
    writer.write_all(&bytes)?;
    writer.flush()
}

/// Reads one whole frame from a blocking reader.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, ClientError> {
    let raw_kind = reader.read_u32::<LittleEndian>()?;
    let len = reader.read_u32::<LittleEndian>()? as usize;
    if len > MAX_FRAME_LEN {
        return Err(ClientError::Protocol(format!("frame of {} bytes exceeds limit", len)));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let kind = FrameKind::from_u32(raw_kind)
        .ok_or_else(|| ClientError::Protocol(format!("unknown frame kind {}", raw_kind)))?;
    Ok(Frame::new(kind, payload))
}

/// Failure to cut a frame out of the byte stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The frame was consumed; the stream is still in sync.
    #[error("unknown frame kind {0}")]
    UnknownKind(u32),
    /// The stream cannot be resynchronised.
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
}

/// Reassembles frames from bytes that arrive in arbitrary chunks.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Cuts the next complete frame off the front of the buffer, if any.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let raw_kind = LittleEndian::read_u32(&self.buf[0..4]);
        let len = LittleEndian::read_u32(&self.buf[4..8]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
        self.buf.drain(..FRAME_HEADER_LEN + len);
        match FrameKind::from_u32(raw_kind) {
            Some(kind) => Ok(Some(Frame::new(kind, payload))),
            None => Err(FrameError::UnknownKind(raw_kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_lines() {
        let line = CommandRequest::new("selcon", &[2]).to_line().unwrap();
        assert_eq!(line, "{\"command\":\"selcon\",\"args\":[2]}\n");

        let line = CommandRequest::new("stop-all", &[]).to_line().unwrap();
        assert_eq!(line, "{\"command\":\"stop-all\"}\n");

        let ok: CommandResponse = serde_json::from_str(r#"{"status":"ok","result":100}"#).unwrap();
        assert_eq!(ok.into_result("bufsize").unwrap(), serde_json::json!(100));

        let ack: CommandResponse = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
        assert_eq!(ack.into_result("start").unwrap(), serde_json::Value::Null);

        let err: CommandResponse =
            serde_json::from_str(r#"{"status":"error","message":"no such connector"}"#).unwrap();
        assert!(matches!(
            err.into_result("selcon"),
            Err(ClientError::Rejected { command, .. }) if command == "selcon"
        ));
    }

    #[test]
    fn test_conlist_result() {
        let list: ConnectorList =
            serde_json::from_str(r#"{"active":1,"connectors":{"1":"A","2":"B"}}"#).unwrap();
        assert_eq!(list.active, 1);
        assert_eq!(list.connectors.get(2), Some("B"));
    }

    #[test]
    fn test_frame_reader_handles_split_input() {
        let mut bytes = Vec::new();
        write_frame(&mut bytes, &Frame::client_id(7)).unwrap();
        write_frame(&mut bytes, &Frame::data_buffer(&[1.0, -2.5])).unwrap();

        let mut reader = FrameReader::new();
        reader.extend(&bytes[..5]);
        assert_eq!(reader.next_frame().unwrap(), None);
        reader.extend(&bytes[5..13]);
        assert_eq!(reader.next_frame().unwrap().unwrap().as_client_id().unwrap(), 7);
        assert_eq!(reader.next_frame().unwrap(), None);
        reader.extend(&bytes[13..]);
        let data = reader.next_frame().unwrap().unwrap();
        assert_eq!(data.samples().unwrap(), vec![1.0, -2.5]);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_frame_reader_skips_unknown_kinds() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(99).unwrap();
        bytes.write_u32::<LittleEndian>(2).unwrap();
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        write_frame(&mut bytes, &Frame::stop()).unwrap();

        let mut reader = FrameReader::new();
        reader.extend(&bytes);
        assert_eq!(reader.next_frame(), Err(FrameError::UnknownKind(99)));
        assert_eq!(reader.next_frame().unwrap().unwrap().kind, FrameKind::Stop);
    }

    #[test]
    fn test_oversized_frame_is_fatal() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(FrameKind::DataBuffer as u32).unwrap();
        bytes.write_u32::<LittleEndian>(MAX_FRAME_LEN as u32 + 1).unwrap();
        let mut reader = FrameReader::new();
        reader.extend(&bytes);
        assert_eq!(reader.next_frame(), Err(FrameError::TooLarge(MAX_FRAME_LEN + 1)));
    }

    #[test]
    fn test_ragged_data_payload_is_rejected() {
        let frame = Frame::new(FrameKind::DataBuffer, vec![0u8; 6]);
        assert!(matches!(frame.samples(), Err(ClientError::Protocol(_))));
        assert!(matches!(Frame::stop().samples(), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn test_meas_info_frame() {
        let info = DeviceInfo::new(4, 1000.0).with_connector(1);
        let frame = Frame::meas_info(&info).unwrap();
        assert_eq!(frame.as_device_info().unwrap(), info);

        let mut bytes = Vec::new();
        write_frame(&mut bytes, &frame).unwrap();
        let read = read_frame(&mut bytes.as_slice()).unwrap();
        assert_eq!(read, frame);
    }
}
