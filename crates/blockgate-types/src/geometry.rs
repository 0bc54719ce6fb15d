//! Device block geometry.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default block size applied when a handler leaves it unset (4 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Default logical block count applied when a handler leaves it unset
/// (262144 blocks of 4 KiB = 1 GiB).
pub const DEFAULT_NUM_LBAS: u64 = 262_144;

/// Default maximum transfer length in bytes (1 MiB).
pub const DEFAULT_MAX_XFER_LEN: u32 = 1024 * 1024;

/// Block geometry of one attached device.
///
/// A handler may fill any of these from its `open`; fields left at zero
/// are replaced by the defaults above when the device is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Number of logical blocks.
    pub num_lbas: u64,
    /// Block size in bytes. Must be a power of two.
    pub block_size: u32,
    /// Maximum I/O size in bytes. Must be a multiple of the block size.
    pub max_xfer_len: u32,
}

impl Geometry {
    /// All-zero geometry, handed to a handler's `open` to fill in.
    pub const UNSET: Geometry = Geometry {
        num_lbas: 0,
        block_size: 0,
        max_xfer_len: 0,
    };

    /// Total device size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.num_lbas * u64::from(self.block_size)
    }

    /// Check the invariants of a finalized geometry.
    pub fn validate(&self) -> Result<()> {
        if self.num_lbas == 0 {
            return Err(Error::Invalid("geometry: num_lbas is zero".into()));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::Invalid(format!(
                "geometry: block_size {} is not a power of two",
                self.block_size
            )));
        }
        if self.max_xfer_len == 0 || self.max_xfer_len % self.block_size != 0 {
            return Err(Error::Invalid(format!(
                "geometry: max_xfer_len {} is not a multiple of block_size {}",
                self.max_xfer_len, self.block_size
            )));
        }
        Ok(())
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            num_lbas: DEFAULT_NUM_LBAS,
            block_size: DEFAULT_BLOCK_SIZE,
            max_xfer_len: DEFAULT_MAX_XFER_LEN,
        }
    }
}
