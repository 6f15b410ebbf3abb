/// Non-volatile memory (FRAM/MRAM) model
///
/// The store is a flat, byte-addressable array that survives power loss.
/// `write` is the only way bytes become durable and the only source of
/// observable leakage: each call appends exactly one sample to the store's
/// `LeakageRecorder`, stamped with the simulation clock.
///
/// Checkpoint records live at a fixed address. A record write is atomic:
/// it either lands in full, becoming the live record immediately, or never
/// happens, leaving the previous live record untouched. Torn writes are not
/// modelled. The store keeps a small directory entry (the length of the
/// live record and the plan that wrote it) so that an empty store is
/// distinguishable from one holding a damaged record, and so that a device
/// rebooted under a different plan does not resume someone else's progress.

use std::ops::Range;

use tracing::{debug, warn};

use crate::checkpoint::CheckpointRecord;
use crate::error::{Result, TesseraError};
use crate::leakage::{LeakageRecorder, LeakageSample};
use crate::sim::{SimContext, SimTime};
use crate::tiling::PlanId;

/// Default store size: 64 KiB
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Acknowledgement that a write has landed
#[derive(Clone, Debug, PartialEq)]
pub struct WriteReceipt {
    pub address: usize,
    pub length: usize,
    pub timestamp: SimTime,
    pub hamming_weight: u64,
    /// Zero-based count of writes performed by this store
    pub sequence: u64,
}

/// Directory entry for the live checkpoint record
#[derive(Clone, Copy, Debug)]
struct LiveRecord {
    length: usize,
    plan: PlanId,
}

#[derive(Debug)]
pub struct NvmStore {
    ctx: SimContext,
    cells: Vec<u8>,
    checkpoint_address: usize,
    live: Option<LiveRecord>,
    recorder: LeakageRecorder,
    writes: u64,
}

impl NvmStore {
    /// Creates an erased (all-zero) store
    ///
    /// # Arguments
    /// * `ctx` - Simulation context providing write timestamps
    /// * `capacity` - Size of the store in bytes
    /// * `checkpoint_address` - Base address of the checkpoint record
    pub fn new(ctx: &SimContext, capacity: usize, checkpoint_address: usize) -> Result<Self> {
        if checkpoint_address >= capacity {
            return Err(TesseraError::AddressOutOfRange {
                address: checkpoint_address,
                length: 0,
                capacity,
            });
        }

        Ok(Self {
            ctx: ctx.clone(),
            cells: vec![0u8; capacity],
            checkpoint_address,
            live: None,
            recorder: LeakageRecorder::new(),
            writes: 0,
        })
    }

    pub fn with_defaults(ctx: &SimContext) -> Self {
        Self {
            ctx: ctx.clone(),
            cells: vec![0u8; DEFAULT_CAPACITY],
            checkpoint_address: 0,
            live: None,
            recorder: LeakageRecorder::new(),
            writes: 0,
        }
    }

    /// The simulation context whose clock stamps this store's writes
    pub fn context(&self) -> &SimContext {
        &self.ctx
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub fn checkpoint_address(&self) -> usize {
        self.checkpoint_address
    }

    fn range(&self, address: usize, length: usize) -> Result<Range<usize>> {
        match address.checked_add(length) {
            Some(end) if end <= self.cells.len() => Ok(address..end),
            _ => Err(TesseraError::AddressOutOfRange {
                address,
                length,
                capacity: self.cells.len(),
            }),
        }
    }

    /// Durably writes `bytes` at `address`
    pub fn write(&mut self, address: usize, bytes: &[u8]) -> Result<WriteReceipt> {
        self.write_labeled(address, bytes, None)
    }

    fn write_labeled(
        &mut self,
        address: usize,
        bytes: &[u8],
        progress_index: Option<u32>,
    ) -> Result<WriteReceipt> {
        let range = self.range(address, bytes.len())?;
        self.cells[range].copy_from_slice(bytes);

        let timestamp = self.ctx.now();
        let sample = match progress_index {
            Some(index) => self.recorder.record_checkpoint(bytes, timestamp, index),
            None => self.recorder.record(bytes, timestamp),
        };

        let receipt = WriteReceipt {
            address,
            length: bytes.len(),
            timestamp,
            hamming_weight: sample.hamming_weight,
            sequence: self.writes,
        };
        self.writes += 1;

        debug!(
            address,
            length = receipt.length,
            hamming_weight = receipt.hamming_weight,
            timestamp,
            "nvm write"
        );
        Ok(receipt)
    }

    pub fn read(&self, address: usize, length: usize) -> Result<Vec<u8>> {
        let range = self.range(address, length)?;
        Ok(self.cells[range].to_vec())
    }

    pub fn has_checkpoint(&self) -> bool {
        self.live.is_some()
    }

    /// Byte range occupied by the live checkpoint record
    pub fn checkpoint_extent(&self) -> Option<Range<usize>> {
        self.live.map(|live| self.checkpoint_address..self.checkpoint_address + live.length)
    }

    /// Plan that wrote the live checkpoint record
    pub fn checkpoint_plan(&self) -> Option<PlanId> {
        self.live.map(|live| live.plan)
    }

    /// Writes `record` as the new live checkpoint with a single store write
    ///
    /// `plan` is kept in the directory entry, not in the record bytes, so
    /// the write still produces exactly one leakage sample.
    pub fn write_checkpoint(
        &mut self,
        record: &CheckpointRecord,
        plan: PlanId,
    ) -> Result<WriteReceipt> {
        let bytes = record.encode();
        let receipt =
            self.write_labeled(self.checkpoint_address, &bytes, Some(record.progress_index))?;
        self.live = Some(LiveRecord {
            length: bytes.len(),
            plan,
        });
        Ok(receipt)
    }

    /// Loads and authenticates the live checkpoint
    ///
    /// # Returns
    /// * `Ok(None)` - Nothing has been checkpointed yet
    /// * `Ok(Some(record))` - The live record
    /// * `Err(CorruptCheckpoint)` - The live record fails authentication
    pub fn load_checkpoint(&self) -> Result<Option<CheckpointRecord>> {
        let length = match self.live {
            Some(live) => live.length,
            None => return Ok(None),
        };

        let bytes = self.read(self.checkpoint_address, length)?;
        match CheckpointRecord::decode(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(error = %err, "live checkpoint failed authentication");
                Err(err)
            }
        }
    }

    /// Fault injection: XORs `mask` into the byte at `address`
    ///
    /// Models external corruption (radiation, wear), not a device write, so
    /// it produces no leakage sample.
    pub fn corrupt(&mut self, address: usize, mask: u8) -> Result<()> {
        let range = self.range(address, 1)?;
        self.cells[range.start] ^= mask;
        Ok(())
    }

    pub fn recorder(&self) -> &LeakageRecorder {
        &self.recorder
    }

    pub fn trace(&self) -> &[LeakageSample] {
        self.recorder.trace()
    }

    /// Number of writes performed so far
    pub fn writes(&self) -> u64 {
        self.writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::TAG_LEN;
    use crate::ntt::Direction;
    use crate::power::PowerState;
    use crate::sim::EventKind;

    const FORWARD: PlanId = PlanId {
        direction: Direction::Forward,
        tiles_per_layer: 1,
    };

    fn record(progress: u32) -> CheckpointRecord {
        CheckpointRecord::new(progress, (0..256).map(|i| (i * 7 + progress) % 3329).collect(), 3329)
    }

    #[test]
    fn test_write_then_read() {
        let ctx = SimContext::new();
        let mut nvm = NvmStore::with_defaults(&ctx);
        let receipt = nvm.write(0x100, &[1, 2, 3, 0xFF]).unwrap();

        assert_eq!(receipt.length, 4);
        assert_eq!(receipt.hamming_weight, 1 + 1 + 2 + 8);
        assert_eq!(receipt.sequence, 0);
        assert_eq!(nvm.read(0x100, 4).unwrap(), vec![1, 2, 3, 0xFF]);
        assert_eq!(nvm.read(0x104, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_every_write_produces_one_sample() {
        let ctx = SimContext::new();
        let mut nvm = NvmStore::with_defaults(&ctx);
        nvm.write(0, &[0x0F]).unwrap();

        ctx.schedule_at(20.0, EventKind::PowerTransition(PowerState::Off));
        ctx.pop_next();
        nvm.write_checkpoint(&record(0), FORWARD).unwrap();

        let trace = nvm.trace();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].timestamp, 0.0);
        assert_eq!(trace[1].timestamp, 20.0);
        assert_eq!(trace[1].progress_index, Some(0));
        assert_eq!(trace[1].byte_length, CheckpointRecord::encoded_len(256));
        assert_eq!(nvm.writes(), 2);
    }

    #[test]
    fn test_empty_store_has_no_checkpoint() {
        let nvm = NvmStore::with_defaults(&SimContext::new());
        assert!(!nvm.has_checkpoint());
        assert!(nvm.load_checkpoint().unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_supersedes_previous() {
        let mut nvm = NvmStore::with_defaults(&SimContext::new());
        nvm.write_checkpoint(&record(0), FORWARD).unwrap();
        nvm.write_checkpoint(&record(1), FORWARD).unwrap();

        assert!(nvm.has_checkpoint());
        assert_eq!(nvm.load_checkpoint().unwrap(), Some(record(1)));
        assert_eq!(nvm.checkpoint_plan(), Some(FORWARD));
    }

    #[test]
    fn test_directory_follows_the_latest_writer() {
        let mut nvm = NvmStore::with_defaults(&SimContext::new());
        assert_eq!(nvm.checkpoint_plan(), None);

        let tiled = PlanId {
            direction: Direction::Inverse,
            tiles_per_layer: 4,
        };
        nvm.write_checkpoint(&record(0), FORWARD).unwrap();
        nvm.write_checkpoint(&record(1), tiled).unwrap();

        assert_eq!(nvm.checkpoint_plan(), Some(tiled));
        assert_eq!(nvm.trace().len(), 2);
    }

    #[test]
    fn test_corrupted_tag_is_detected() {
        let mut nvm = NvmStore::with_defaults(&SimContext::new());
        nvm.write_checkpoint(&record(3), FORWARD).unwrap();

        let extent = nvm.checkpoint_extent().unwrap();
        nvm.corrupt(extent.end - TAG_LEN, 0x40).unwrap();
        assert_eq!(nvm.trace().len(), 1);

        assert!(matches!(
            nvm.load_checkpoint(),
            Err(TesseraError::CorruptCheckpoint { stored_progress: Some(3), .. })
        ));
    }

    #[test]
    fn test_out_of_range_access() {
        let ctx = SimContext::new();
        let mut nvm = NvmStore::new(&ctx, 16, 0).unwrap();
        assert!(matches!(
            nvm.write(14, &[0, 0, 0]),
            Err(TesseraError::AddressOutOfRange { .. })
        ));
        assert!(nvm.read(usize::MAX, 2).is_err());
        assert!(nvm.trace().is_empty());

        // A record that does not fit is rejected without becoming live
        assert!(nvm.write_checkpoint(&record(0), FORWARD).is_err());
        assert!(!nvm.has_checkpoint());

        assert!(NvmStore::new(&ctx, 16, 16).is_err());
    }
}
