use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Waveform streamed by the simulated server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum SignalShape {
    /// Sample `n` of channel `c` has the value `n * num_channels + c`.
    /// Lets tests check ordering and completeness exactly.
    #[default]
    Ramp,
    /// Channel `c` carries a `2 + 4c` Hz sine of amplitude 10 plus gaussian noise.
    Sinusoid { noise_std: f32 },
}

/// Produces consecutive sample-major frames of one signal.
pub struct SignalGenerator {
    shape: SignalShape,
    num_channels: usize,
    sampling_rate: f64,
    sample_index: u64,
    noise: Option<Normal<f32>>,
    rng: StdRng,
}

impl SignalGenerator {
    pub fn new(shape: SignalShape, num_channels: usize, sampling_rate: f64) -> Self {
        let noise = match shape {
            SignalShape::Sinusoid { noise_std } if noise_std > 0.0 => Normal::new(0.0, noise_std).ok(),
            _ => None,
        };
        Self {
            shape,
            num_channels,
            sampling_rate,
            sample_index: 0,
            noise,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn samples_generated(&self) -> u64 {
        self.sample_index
    }

    /// The next `samples` columns, each holding one value per channel.
    pub fn next_frame(&mut self, samples: usize) -> Vec<f32> {
        let mut frame = Vec::with_capacity(samples * self.num_channels);
        for _ in 0..samples {
            let n = self.sample_index;
            for c in 0..self.num_channels {
                let value = match self.shape {
                    SignalShape::Ramp => (n * self.num_channels as u64 + c as u64) as f32,
                    SignalShape::Sinusoid { .. } => {
                        let t = n as f64 / self.sampling_rate;
                        let freq = 2.0 + 4.0 * c as f64;
                        let clean = (10.0 * (2.0 * PI * freq * t).sin()) as f32;
                        match &self.noise {
                            Some(noise) => clean + noise.sample(&mut self.rng),
                            None => clean,
                        }
                    }
                };
                frame.push(value);
            }
            self.sample_index += 1;
        }
        frame
    }
}
