//! Measurement identities and values published on the bus.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::data::SensorError;

/// Stable identifier of one logical real-time data stream.
///
/// Ids are unique per [`ChannelKind`]; the same numeric id may name one
/// channel of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u16);

impl ChannelId {
    /// Multichannel sample stream relayed from the acquisition server.
    pub const RT_SERVER_OUTPUT: ChannelId = ChannelId(1);
    /// 1.0 while both server connections are up, 0.0 otherwise.
    pub const RT_SERVER_CONNECTED: ChannelId = ChannelId(2);
    /// Human-readable status annotations from the acquisition pipeline.
    pub const RT_SERVER_MESSAGES: ChannelId = ChannelId(3);
    /// Ring buffer fill level after each drained block.
    pub const RT_SERVER_BUFFER_FILL: ChannelId = ChannelId(4);

    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kinds of publishable channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// A single scalar value, e.g. a status flag.
    Numeric,
    /// A single-channel sample stream, one sample per publish.
    SampleArray,
    /// A multichannel sample stream, one column per publish.
    MultiSampleArray,
    /// A derived source-space estimate.
    SourceEstimate,
    /// A percentage in 0..=100.
    ProgressBar,
    /// A text annotation.
    Text,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 6] = [
        ChannelKind::Numeric,
        ChannelKind::SampleArray,
        ChannelKind::MultiSampleArray,
        ChannelKind::SourceEstimate,
        ChannelKind::ProgressBar,
        ChannelKind::Text,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ChannelKind::Numeric => "numeric",
            ChannelKind::SampleArray => "sample_array",
            ChannelKind::MultiSampleArray => "multi_sample_array",
            ChannelKind::SourceEstimate => "source_estimate",
            ChannelKind::ProgressBar => "progress_bar",
            ChannelKind::Text => "text",
        }
    }

    /// How many recent values a new channel of this kind retains.
    pub fn default_history_len(self) -> usize {
        match self {
            ChannelKind::MultiSampleArray => 10,
            ChannelKind::SampleArray => 128,
            ChannelKind::Text => 32,
            _ => 1,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registry key of a channel: its kind plus its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    pub kind: ChannelKind,
    pub id: ChannelId,
}

impl ChannelKey {
    pub const fn new(kind: ChannelKind, id: ChannelId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.id)
    }
}

/// A source-space estimate: `rows` sources by `cols` time points, stored
/// column-major, with the vertex index of every source row.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEstimate {
    data: Vec<f64>,
    rows: usize,
    cols: usize,
    vertices: Vec<i32>,
    /// Time of the first column, in seconds.
    tmin: f32,
    /// Time between columns, in seconds.
    tstep: f32,
}

impl SourceEstimate {
    pub fn new(
        data: Vec<f64>,
        rows: usize,
        cols: usize,
        vertices: Vec<i32>,
        tmin: f32,
        tstep: f32,
    ) -> Result<Self, SensorError> {
        if data.len() != rows * cols {
            return Err(SensorError::InvalidSourceEstimate(format!(
                "{} values for a {}x{} matrix",
                data.len(),
                rows,
                cols
            )));
        }
        if vertices.len() != rows {
            return Err(SensorError::InvalidSourceEstimate(format!(
                "{} vertices for {} sources",
                vertices.len(),
                rows
            )));
        }
        if cols > 1 && !(tstep > 0.0) {
            return Err(SensorError::InvalidSourceEstimate(format!(
                "time step must be positive, got {}",
                tstep
            )));
        }
        Ok(Self {
            data,
            rows,
            cols,
            vertices,
            tmin,
            tstep,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn vertices(&self) -> &[i32] {
        &self.vertices
    }

    pub fn tmin(&self) -> f32 {
        self.tmin
    }

    pub fn tstep(&self) -> f32 {
        self.tstep
    }

    /// Time of the last column.
    pub fn tmax(&self) -> f32 {
        self.tmin + self.tstep * self.cols.saturating_sub(1) as f32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Source amplitudes at time point `index`.
    pub fn column(&self, index: usize) -> Option<&[f64]> {
        if index >= self.cols {
            return None;
        }
        let start = index * self.rows;
        Some(&self.data[start..start + self.rows])
    }
}

/// One value published on a channel. The variant must match the channel kind.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementValue {
    Numeric(f64),
    Sample(f64),
    /// One column: a value for each channel at one time sample.
    MultiSample(Arc<[f64]>),
    SourceEstimate(Arc<SourceEstimate>),
    /// Percent complete, 0..=100.
    Progress(u8),
    Text(String),
}

impl MeasurementValue {
    pub fn kind(&self) -> ChannelKind {
        match self {
            MeasurementValue::Numeric(_) => ChannelKind::Numeric,
            MeasurementValue::Sample(_) => ChannelKind::SampleArray,
            MeasurementValue::MultiSample(_) => ChannelKind::MultiSampleArray,
            MeasurementValue::SourceEstimate(_) => ChannelKind::SourceEstimate,
            MeasurementValue::Progress(_) => ChannelKind::ProgressBar,
            MeasurementValue::Text(_) => ChannelKind::Text,
        }
    }

    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            MeasurementValue::Numeric(v) | MeasurementValue::Sample(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_multi_sample(&self) -> Option<&[f64]> {
        match self {
            MeasurementValue::MultiSample(column) => Some(column),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MeasurementValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Presentation metadata of a channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMeta {
    pub name: String,
    pub unit: String,
    pub visible: bool,
    /// Per-channel names of a multi-sample array.
    #[serde(default)]
    pub channel_names: Vec<String>,
    #[serde(default)]
    pub channel_units: Vec<String>,
    #[serde(default)]
    pub sampling_rate: Option<f64>,
}

impl ChannelMeta {
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            ..Default::default()
        }
    }
}
