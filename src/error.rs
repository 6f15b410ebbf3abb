use thiserror::Error;

#[derive(Error, Debug)]
pub enum TesseraError {
    /// The integrity tag of the stored checkpoint does not match its
    /// contents, or the record is too malformed to carry a tag at all.
    #[error("Corrupt checkpoint (stored progress index {stored_progress:?}): {reason}")]
    CorruptCheckpoint {
        stored_progress: Option<u32>,
        reason: String,
    },

    #[error("Invalid tessera sequence: cannot apply tessera {tessera} while durable progress is {durable_progress:?}")]
    InvalidTesseraSequence {
        tessera: u32,
        durable_progress: Option<u32>,
    },

    #[error("Power model exhausted: {phase} duration sampler produced {duration}")]
    PowerModelExhausted {
        phase: &'static str,
        duration: f64,
    },

    #[error("Coefficient {coefficient} out of range [0, {modulus}) at position {position} (tessera {tessera:?})")]
    ArithmeticRangeError {
        coefficient: u64,
        modulus: u32,
        position: usize,
        tessera: Option<u32>,
    },

    #[error("Invalid dimension: expected {expected}, got {got}")]
    InvalidDimension {
        expected: usize,
        got: usize,
    },

    #[error("Invalid modulus: {modulus}")]
    InvalidModulus { modulus: u64 },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("NVM access of {length} bytes at address {address:#06x} exceeds capacity {capacity}")]
    AddressOutOfRange {
        address: usize,
        length: usize,
        capacity: usize,
    },

    #[error("Incompatible checkpoint: {0}")]
    IncompatibleCheckpoint(String),

    #[error("Simulation deadline {deadline} reached with durable progress {progress_index:?}")]
    DeadlineExceeded {
        deadline: f64,
        progress_index: Option<u32>,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TesseraError {
    /// Tessera index (or stored progress index) the failure is attributed to,
    /// when the error carries one.
    pub fn tessera_index(&self) -> Option<u32> {
        match self {
            Self::CorruptCheckpoint { stored_progress, .. } => *stored_progress,
            Self::InvalidTesseraSequence { tessera, .. } => Some(*tessera),
            Self::ArithmeticRangeError { tessera, .. } => *tessera,
            Self::DeadlineExceeded { progress_index, .. } => *progress_index,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TesseraError>;

impl From<serde_json::Error> for TesseraError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tessera_index_attribution() {
        let err = TesseraError::InvalidTesseraSequence {
            tessera: 4,
            durable_progress: Some(1),
        };
        assert_eq!(err.tessera_index(), Some(4));

        let err = TesseraError::CorruptCheckpoint {
            stored_progress: None,
            reason: "truncated".to_string(),
        };
        assert_eq!(err.tessera_index(), None);
        assert!(err.to_string().contains("truncated"));
    }
}
