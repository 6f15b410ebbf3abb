/// Hamming-weight leakage model for NVM writes
///
/// FRAM/MRAM cells draw current roughly in proportion to the number of set
/// bits they are asked to store. The recorder uses the Hamming weight of
/// every written byte sequence as a proxy for that power draw and appends
/// one sample per write to an append-only trace. An attacker correlating
/// these samples with secret-dependent checkpoint contents is the threat
/// the trace lets you study; nothing here attempts to hide the signal.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sim::SimTime;

/// Number of 1-bits across a byte sequence
pub fn hamming_weight(bytes: &[u8]) -> u64 {
    bytes.iter().map(|b| b.count_ones() as u64).sum()
}

/// One power sample, produced by exactly one NVM write
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeakageSample {
    /// Simulated time at which the write landed
    pub timestamp: SimTime,
    /// Number of bytes written
    pub byte_length: usize,
    /// Number of set bits across the written bytes
    pub hamming_weight: u64,
    /// Progress index of the checkpoint record written, if the write was one
    pub progress_index: Option<u32>,
}

/// Aggregate statistics over a trace
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeakageSummary {
    pub samples: usize,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
}

impl LeakageSummary {
    /// Summary of a trace, or `None` for an empty one
    pub fn from_samples(samples: &[LeakageSample]) -> Option<Self> {
        let weights = samples.iter().map(|s| s.hamming_weight);
        let min = weights.clone().min()?;
        let max = weights.clone().max()?;
        let total: u64 = weights.sum();

        Some(Self {
            samples: samples.len(),
            min,
            max,
            mean: total as f64 / samples.len() as f64,
        })
    }
}

impl fmt::Display for LeakageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Leakage trace: {} samples | min={} | max={} | mean={:.1} HW-bits",
            self.samples, self.min, self.max, self.mean
        )
    }
}

/// Append-only leakage trace
#[derive(Clone, Debug, Default)]
pub struct LeakageRecorder {
    samples: Vec<LeakageSample>,
}

impl LeakageRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a raw write of `bytes` at `timestamp`
    pub fn record(&mut self, bytes: &[u8], timestamp: SimTime) -> &LeakageSample {
        self.append(bytes, timestamp, None)
    }

    /// Records the write of checkpoint record `progress_index`
    pub fn record_checkpoint(
        &mut self,
        bytes: &[u8],
        timestamp: SimTime,
        progress_index: u32,
    ) -> &LeakageSample {
        self.append(bytes, timestamp, Some(progress_index))
    }

    fn append(
        &mut self,
        bytes: &[u8],
        timestamp: SimTime,
        progress_index: Option<u32>,
    ) -> &LeakageSample {
        let index = self.samples.len();
        self.samples.push(LeakageSample {
            timestamp,
            byte_length: bytes.len(),
            hamming_weight: hamming_weight(bytes),
            progress_index,
        });
        &self.samples[index]
    }

    /// The ordered trace
    pub fn trace(&self) -> &[LeakageSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn summary(&self) -> Option<LeakageSummary> {
        LeakageSummary::from_samples(&self.samples)
    }

    /// Mean Hamming weight of the checkpoint writes for each progress index
    pub fn mean_weight_by_progress(&self) -> BTreeMap<u32, f64> {
        let mut totals: BTreeMap<u32, (u64, usize)> = BTreeMap::new();
        for sample in &self.samples {
            if let Some(index) = sample.progress_index {
                let entry = totals.entry(index).or_insert((0, 0));
                entry.0 += sample.hamming_weight;
                entry.1 += 1;
            }
        }
        totals
            .into_iter()
            .map(|(index, (total, count))| (index, total as f64 / count as f64))
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.samples)?)
    }

    /// Writes the trace as a JSON array for offline plotting
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &self.samples)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hamming_weight() {
        assert_eq!(hamming_weight(&[]), 0);
        assert_eq!(hamming_weight(&[0x00; 16]), 0);
        assert_eq!(hamming_weight(&[0xFF, 0xFF, 0xFF, 0xFF]), 32);
        assert_eq!(hamming_weight(&[0x01]), 1);
        // 3329 = 0x0D01 little-endian
        assert_eq!(hamming_weight(&3329u16.to_le_bytes()), 4);
    }

    #[test]
    fn test_record_appends_in_order() {
        let mut recorder = LeakageRecorder::new();
        recorder.record(&[0xF0], 1.0);
        recorder.record_checkpoint(&[0x03, 0x00], 2.5, 0);

        let trace = recorder.trace();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].hamming_weight, 4);
        assert_eq!(trace[0].progress_index, None);
        assert_eq!(trace[1].byte_length, 2);
        assert_eq!(trace[1].hamming_weight, 2);
        assert_eq!(trace[1].progress_index, Some(0));
        assert!(trace[0].timestamp <= trace[1].timestamp);
    }

    #[test]
    fn test_summary() {
        let mut recorder = LeakageRecorder::new();
        assert!(recorder.summary().is_none());

        recorder.record(&[0x00], 0.0);
        recorder.record(&[0xFF], 1.0);
        let summary = recorder.summary().unwrap();
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.min, 0);
        assert_eq!(summary.max, 8);
        assert!((summary.mean - 4.0).abs() < f64::EPSILON);

        let text = summary.to_string();
        assert!(text.contains("samples"));
        assert!(text.contains("HW-bits"));
    }

    #[test]
    fn test_mean_weight_by_progress() {
        let mut recorder = LeakageRecorder::new();
        recorder.record_checkpoint(&[0x0F], 0.0, 0);
        recorder.record_checkpoint(&[0xFF], 1.0, 0);
        recorder.record_checkpoint(&[0x01], 2.0, 1);
        recorder.record(&[0xFF], 3.0);

        let means = recorder.mean_weight_by_progress();
        assert_eq!(means.len(), 2);
        assert!((means[&0] - 6.0).abs() < f64::EPSILON);
        assert!((means[&1] - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_json_export() {
        let mut recorder = LeakageRecorder::new();
        recorder.record_checkpoint(&[0x07], 42.5, 3);
        let json = recorder.to_json().unwrap();
        let parsed: Vec<LeakageSample> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, recorder.trace());
    }
}
