//! Save-states
//!
//! A save-state bundles the guest register file, the scheduler clock and
//! RAM. It is serialized with bincode and compressed with zstd. Compiled
//! code is never saved; restoring clears the block cache.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cpu::GuestState;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),

    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("save-state version {found} not supported (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("save-state RAM is {found} bytes, system has {expected}")]
    RamSize { found: usize, expected: usize },
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SaveState {
    /// Version for compatibility checking
    pub version: u32,
    pub state: GuestState,
    /// Scheduler clock at capture
    pub ticks: u64,
    pub ram: Vec<u8>,
}

impl SaveState {
    /// Current save-state version
    pub const VERSION: u32 = 1;

    pub fn capture(state: &GuestState, ticks: u64, ram: &[u8]) -> Self {
        SaveState { version: Self::VERSION, state: state.clone(), ticks, ram: ram.to_vec() }
    }

    /// Serialize to bytes (compressed with zstd)
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        let serialized = bincode::serialize(self)?;
        Ok(zstd::stream::encode_all(&serialized[..], 3)?)
    }

    /// Deserialize from bytes (compressed with zstd)
    pub fn from_bytes(data: &[u8]) -> Result<Self, SnapshotError> {
        let decompressed = zstd::stream::decode_all(data)?;
        let save: SaveState = bincode::deserialize(&decompressed)?;
        if save.version != Self::VERSION {
            return Err(SnapshotError::Version { found: save.version, expected: Self::VERSION });
        }
        Ok(save)
    }
}
