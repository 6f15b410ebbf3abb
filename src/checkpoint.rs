/// Checkpoint record format
///
/// Serialized layout (all integers little-endian):
///
/// ```text
/// +----------------+-------------------+---------+---------------------+------------------+
/// | progress_index | coefficient_count | modulus | coefficients        | integrity tag    |
/// | u32            | u32               | u32     | count × u32         | 32 bytes BLAKE3  |
/// +----------------+-------------------+---------+---------------------+------------------+
/// ```
///
/// The tag is the BLAKE3 hash of every byte before it. A record whose tag
/// does not match is never trusted, not even its header.

use byteorder::{ByteOrder, LittleEndian};
use subtle::ConstantTimeEq;

use crate::error::{Result, TesseraError};
use crate::polynomial::Polynomial;

/// Size of the fixed header in bytes
pub const HEADER_LEN: usize = 12;

/// Width of one serialized coefficient in bytes
pub const COEFFICIENT_WIDTH: usize = 4;

/// Size of the integrity tag in bytes
pub const TAG_LEN: usize = 32;

/// Durable snapshot written after each tessera
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Index of the last tessera whose output `polynomial_state` holds
    pub progress_index: u32,
    pub modulus: u32,
    /// Working state after tessera `progress_index`
    pub polynomial_state: Vec<u32>,
}

impl CheckpointRecord {
    pub fn new(progress_index: u32, polynomial_state: Vec<u32>, modulus: u32) -> Self {
        Self {
            progress_index,
            modulus,
            polynomial_state,
        }
    }

    /// Serialized size of a record holding `coefficient_count` coefficients
    pub fn encoded_len(coefficient_count: usize) -> usize {
        HEADER_LEN + coefficient_count * COEFFICIENT_WIDTH + TAG_LEN
    }

    pub fn integrity_tag(body: &[u8]) -> [u8; TAG_LEN] {
        *blake3::hash(body).as_bytes()
    }

    pub fn encode(&self) -> Vec<u8> {
        let count = self.polynomial_state.len();
        let body_len = HEADER_LEN + count * COEFFICIENT_WIDTH;
        let mut bytes = vec![0u8; Self::encoded_len(count)];

        LittleEndian::write_u32(&mut bytes[0..4], self.progress_index);
        LittleEndian::write_u32(&mut bytes[4..8], count as u32);
        LittleEndian::write_u32(&mut bytes[8..12], self.modulus);
        LittleEndian::write_u32_into(&self.polynomial_state, &mut bytes[HEADER_LEN..body_len]);

        let tag = Self::integrity_tag(&bytes[..body_len]);
        bytes[body_len..].copy_from_slice(&tag);
        bytes
    }

    /// Parses and authenticates a serialized record
    ///
    /// # Returns
    /// * `Result<Self>` - The record, or `CorruptCheckpoint` if the bytes are
    ///   truncated, inconsistent with their own header, or fail the tag check
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN + TAG_LEN {
            return Err(TesseraError::CorruptCheckpoint {
                stored_progress: None,
                reason: format!("record of {} bytes is shorter than header and tag", bytes.len()),
            });
        }

        // Untrusted until the tag verifies; only used for error reporting
        let claimed_progress = LittleEndian::read_u32(&bytes[0..4]);
        let count = LittleEndian::read_u32(&bytes[4..8]) as usize;

        if bytes.len() != Self::encoded_len(count) {
            return Err(TesseraError::CorruptCheckpoint {
                stored_progress: Some(claimed_progress),
                reason: format!(
                    "header claims {} coefficients but record is {} bytes",
                    count,
                    bytes.len()
                ),
            });
        }

        let body_len = bytes.len() - TAG_LEN;
        let expected = Self::integrity_tag(&bytes[..body_len]);
        if !bool::from(expected[..].ct_eq(&bytes[body_len..])) {
            return Err(TesseraError::CorruptCheckpoint {
                stored_progress: Some(claimed_progress),
                reason: "integrity tag mismatch".to_string(),
            });
        }

        let modulus = LittleEndian::read_u32(&bytes[8..12]);
        let mut polynomial_state = vec![0u32; count];
        LittleEndian::read_u32_into(&bytes[HEADER_LEN..body_len], &mut polynomial_state);

        Ok(Self {
            progress_index: claimed_progress,
            modulus,
            polynomial_state,
        })
    }

    /// The checkpointed state as a polynomial, range-checked against q
    pub fn polynomial(&self) -> Result<Polynomial> {
        Polynomial::new(self.polynomial_state.clone(), self.modulus)
    }
}
