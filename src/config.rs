/// Simulation configuration
///
/// Every knob of an intermittent run: ring parameters, tessera granularity,
/// the cost model, the power model and the NVM geometry. Configurations are
/// plain serde structs, so they can be loaded from JSON; any field left out
/// takes the reference device's default.

use std::fs;
use std::path::Path;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointRecord;
use crate::error::{Result, TesseraError};
use crate::ntt::{NttParams, DEFAULT_DIMENSION, DEFAULT_MODULUS};
use crate::nvm::DEFAULT_CAPACITY;
use crate::power::{Deterministic, DurationSampler, Exponential, Fixed};

/// Simulated cost of the work a tessera performs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingModel {
    /// Time to compute one full butterfly layer; a tessera covering a
    /// fraction of a layer takes that fraction of this time
    pub compute_cost_per_layer: f64,
    /// Time for one checkpoint record to land in NVM
    pub checkpoint_cost: f64,
}

impl Default for TimingModel {
    fn default() -> Self {
        Self {
            compute_cost_per_layer: 10.0,
            checkpoint_cost: 5.0,
        }
    }
}

impl TimingModel {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("compute_cost_per_layer", self.compute_cost_per_layer),
            ("checkpoint_cost", self.checkpoint_cost),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(TesseraError::InvalidParameters(format!(
                    "{} must be positive and finite, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Duration distribution of one power phase
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SamplerConfig {
    Exponential { mean: f64 },
    Fixed { duration: f64 },
    Deterministic { durations: Vec<f64> },
}

impl SamplerConfig {
    /// Builds the sampler, drawing randomness from the given ChaCha stream
    pub fn build(&self, seed: u64, stream: u64) -> Result<Box<dyn DurationSampler>> {
        Ok(match self {
            SamplerConfig::Exponential { mean } => {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                rng.set_stream(stream);
                Box::new(Exponential::with_rng(*mean, rng)?)
            }
            SamplerConfig::Fixed { duration } => Box::new(Fixed::new(*duration)),
            SamplerConfig::Deterministic { durations } => {
                Box::new(Deterministic::new(durations.clone()))
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    pub on: SamplerConfig,
    pub off: SamplerConfig,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            on: SamplerConfig::Exponential { mean: 120.0 },
            off: SamplerConfig::Exponential { mean: 40.0 },
        }
    }
}

impl PowerConfig {
    /// Power that never fails within any practical deadline
    pub fn always_on() -> Self {
        Self {
            on: SamplerConfig::Fixed { duration: f64::MAX },
            off: SamplerConfig::Fixed { duration: 1.0 },
        }
    }

    pub fn exponential(on_mean: f64, off_mean: f64) -> Self {
        Self {
            on: SamplerConfig::Exponential { mean: on_mean },
            off: SamplerConfig::Exponential { mean: off_mean },
        }
    }

    /// Scripted on/off durations, each list repeated cyclically
    pub fn scripted(on: Vec<f64>, off: Vec<f64>) -> Self {
        Self {
            on: SamplerConfig::Deterministic { durations: on },
            off: SamplerConfig::Deterministic { durations: off },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Transform length n
    pub dimension: usize,
    /// Prime modulus q
    pub modulus: u32,
    /// Tesserae per butterfly layer (power of two dividing n/2)
    pub tiles_per_layer: usize,
    pub timing: TimingModel,
    pub power: PowerConfig,
    /// Seed for the power model's random streams
    pub seed: u64,
    /// Simulated time after which an unfinished run is abandoned
    pub deadline: f64,
    /// NVM size in bytes
    pub nvm_capacity: usize,
    /// NVM address of the checkpoint record
    pub checkpoint_address: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_DIMENSION,
            modulus: DEFAULT_MODULUS,
            tiles_per_layer: 1,
            timing: TimingModel::default(),
            power: PowerConfig::default(),
            seed: 0,
            deadline: 10_000.0,
            nvm_capacity: DEFAULT_CAPACITY,
            checkpoint_address: 0,
        }
    }
}

impl SimulationConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_power(mut self, power: PowerConfig) -> Self {
        self.power = power;
        self
    }

    pub fn with_tiles_per_layer(mut self, tiles_per_layer: usize) -> Self {
        self.tiles_per_layer = tiles_per_layer;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_deadline(mut self, deadline: f64) -> Self {
        self.deadline = deadline;
        self
    }

    /// Checks the configuration for internal consistency
    ///
    /// Sampler outputs are not checked here: a distribution
    /// that produces a non-positive duration is reported by the power model
    /// itself when it happens.
    pub fn validate(&self) -> Result<()> {
        let params = self.ntt_params()?;

        let butterflies = params.butterflies_per_layer();
        if self.tiles_per_layer == 0
            || !self.tiles_per_layer.is_power_of_two()
            || self.tiles_per_layer > butterflies
        {
            return Err(TesseraError::InvalidParameters(format!(
                "tiles_per_layer must be a power of two in [1, {}], got {}",
                butterflies, self.tiles_per_layer
            )));
        }

        self.timing.validate()?;

        if !(self.deadline.is_finite() && self.deadline > 0.0) {
            return Err(TesseraError::InvalidParameters(format!(
                "deadline must be positive and finite, got {}",
                self.deadline
            )));
        }

        let record_len = CheckpointRecord::encoded_len(self.dimension);
        match self.checkpoint_address.checked_add(record_len) {
            Some(end) if end <= self.nvm_capacity => Ok(()),
            _ => Err(TesseraError::AddressOutOfRange {
                address: self.checkpoint_address,
                length: record_len,
                capacity: self.nvm_capacity,
            }),
        }
    }

    pub fn ntt_params(&self) -> Result<NttParams> {
        NttParams::new(self.dimension, self.modulus)
    }

    /// Builds the (on, off) samplers on independent random streams
    pub fn samplers(&self) -> Result<(Box<dyn DurationSampler>, Box<dyn DurationSampler>)> {
        Ok((
            self.power.on.build(self.seed, 0)?,
            self.power.off.build(self.seed, 1)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SimulationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.dimension, 256);
        assert_eq!(config.modulus, 3329);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SimulationConfig::from_json_str(
            r#"{
                "tiles_per_layer": 4,
                "power": { "on": { "kind": "fixed", "duration": 50.0 } },
                "seed": 9
            }"#,
        )
        .unwrap();

        assert_eq!(config.tiles_per_layer, 4);
        assert_eq!(config.seed, 9);
        assert_eq!(config.power.on, SamplerConfig::Fixed { duration: 50.0 });
        assert_eq!(config.power.off, SamplerConfig::Exponential { mean: 40.0 });
        assert_eq!(config.timing, TimingModel::default());
    }

    #[test]
    fn test_json_round_trip() {
        let config = SimulationConfig::default()
            .with_power(PowerConfig::scripted(vec![15.0], vec![7.0]))
            .with_seed(3);
        let parsed = SimulationConfig::from_json_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_rejects_inconsistent_values() {
        let bad = [
            SimulationConfig::default().with_tiles_per_layer(3),
            SimulationConfig::default().with_deadline(-1.0),
            SimulationConfig {
                modulus: 3331,
                ..SimulationConfig::default()
            },
            SimulationConfig {
                nvm_capacity: 512,
                ..SimulationConfig::default()
            },
            SimulationConfig {
                timing: TimingModel {
                    compute_cost_per_layer: 0.0,
                    checkpoint_cost: 5.0,
                },
                ..SimulationConfig::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }

        assert!(SimulationConfig::from_json_str("{ \"dimension\": 100 }").is_err());
        assert!(SimulationConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_samplers_use_independent_streams() {
        let config = SimulationConfig::default().with_power(PowerConfig::exponential(50.0, 50.0));
        let (mut on, mut off) = config.samplers().unwrap();
        let on_samples: Vec<f64> = (0..4).map(|_| on.sample()).collect();
        let off_samples: Vec<f64> = (0..4).map(|_| off.sample()).collect();
        assert_ne!(on_samples, off_samples);
    }
}
