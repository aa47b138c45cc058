use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Errors raised while validating data received from, or handed to, the
/// acquisition path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum SensorError {
    /// A block did not match its declared shape.
    #[error("Invalid block shape: {0}")]
    InvalidShape(String),
    /// The server delivered unusable device metadata.
    #[error("Invalid device info: {0}")]
    InvalidDeviceInfo(String),
    /// A source estimate's matrix and vertex list disagree.
    #[error("Invalid source estimate: {0}")]
    InvalidSourceEstimate(String),
}

/// One fixed-shape chunk of multichannel samples.
///
/// Samples are stored column-major: column `i` holds the value of every
/// channel at time sample `i`, which is the order the server streams them in.
/// A block is never mutated once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    num_channels: usize,
    samples_per_block: usize,
    data: Vec<f32>,
}

impl Block {
    /// Builds a block from column-major samples.
    pub fn new(
        num_channels: usize,
        samples_per_block: usize,
        data: Vec<f32>,
    ) -> Result<Self, SensorError> {
        if num_channels == 0 || samples_per_block == 0 {
            return Err(SensorError::InvalidShape(format!(
                "{}x{} has a zero dimension",
                num_channels, samples_per_block
            )));
        }
        if data.len() != num_channels * samples_per_block {
            return Err(SensorError::InvalidShape(format!(
                "expected {} samples for {}x{}, got {}",
                num_channels * samples_per_block,
                num_channels,
                samples_per_block,
                data.len()
            )));
        }
        Ok(Self {
            num_channels,
            samples_per_block,
            data,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn samples_per_block(&self) -> usize {
        self.samples_per_block
    }

    /// `(num_channels, samples_per_block)`
    pub fn shape(&self) -> (usize, usize) {
        (self.num_channels, self.samples_per_block)
    }

    /// The values of all channels at time sample `index`.
    pub fn column(&self, index: usize) -> Option<&[f32]> {
        if index >= self.samples_per_block {
            return None;
        }
        let start = index * self.num_channels;
        Some(&self.data[start..start + self.num_channels])
    }

    /// Iterates over the columns in temporal order.
    pub fn columns(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.num_channels)
    }

    /// All samples of one channel in temporal order.
    pub fn channel(&self, channel: usize) -> impl Iterator<Item = f32> + '_ {
        self.data
            .iter()
            .skip(channel)
            .step_by(self.num_channels)
            .copied()
            .take(if channel < self.num_channels { self.samples_per_block } else { 0 })
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.data
    }
}

/// Channel count and sampling metadata describing the current acquisition
/// configuration. Valid for one connection epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub num_channels: usize,
    /// Sampling rate in Hz.
    pub sampling_rate: f64,
    #[serde(default)]
    pub channel_names: Vec<String>,
    #[serde(default)]
    pub channel_units: Vec<String>,
    /// The connector this description belongs to, when the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<i32>,
}

impl DeviceInfo {
    pub fn new(num_channels: usize, sampling_rate: f64) -> Self {
        Self {
            num_channels,
            sampling_rate,
            channel_names: Vec::new(),
            channel_units: Vec::new(),
            connector_id: None,
        }
    }

    pub fn validate(&self) -> Result<(), SensorError> {
        if self.num_channels == 0 {
            return Err(SensorError::InvalidDeviceInfo(
                "channel count must be greater than 0".into(),
            ));
        }
        if self.sampling_rate <= 0.0 || !self.sampling_rate.is_finite() {
            return Err(SensorError::InvalidDeviceInfo(format!(
                "sampling rate must be positive, got {}",
                self.sampling_rate
            )));
        }
        if !self.channel_names.is_empty() && self.channel_names.len() != self.num_channels {
            return Err(SensorError::InvalidDeviceInfo(format!(
                "{} channel names for {} channels",
                self.channel_names.len(),
                self.num_channels
            )));
        }
        if !self.channel_units.is_empty() && self.channel_units.len() != self.num_channels {
            return Err(SensorError::InvalidDeviceInfo(format!(
                "{} channel units for {} channels",
                self.channel_units.len(),
                self.num_channels
            )));
        }
        Ok(())
    }

    /// Parses and validates the JSON payload delivered on the data connection.
    pub fn from_json(payload: &[u8]) -> Result<Self, SensorError> {
        let info: DeviceInfo = serde_json::from_slice(payload)
            .map_err(|e| SensorError::InvalidDeviceInfo(e.to_string()))?;
        info.validate()?;
        Ok(info)
    }

    /// Name of channel `index`, falling back to `CH<n>` when the server sent none.
    pub fn channel_name(&self, index: usize) -> String {
        self.channel_names
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("CH{}", index + 1))
    }

    pub fn channel_unit(&self, index: usize) -> String {
        self.channel_units
            .get(index)
            .cloned()
            .unwrap_or_else(|| "V".to_string())
    }

    pub fn with_connector(mut self, connector_id: i32) -> Self {
        self.connector_id = Some(connector_id);
        self
    }
}

/// Selectable inputs offered by the acquisition server, keyed by connector id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorSet {
    connectors: BTreeMap<i32, String>,
}

impl ConnectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: i32, name: impl Into<String>) -> Option<String> {
        self.connectors.insert(id, name.into())
    }

    pub fn get(&self, id: i32) -> Option<&str> {
        self.connectors.get(&id).map(String::as_str)
    }

    pub fn contains(&self, id: i32) -> bool {
        self.connectors.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn clear(&mut self) {
        self.connectors.clear();
    }

    pub fn ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.connectors.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &str)> + '_ {
        self.connectors.iter().map(|(id, name)| (*id, name.as_str()))
    }
}

impl<S: Into<String>> FromIterator<(i32, S)> for ConnectorSet {
    fn from_iter<T: IntoIterator<Item = (i32, S)>>(iter: T) -> Self {
        Self {
            connectors: iter.into_iter().map(|(id, name)| (id, name.into())).collect(),
        }
    }
}
