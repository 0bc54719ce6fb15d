//! Ramdisk backend: anonymous memory, discarded on close.
//!
//! Config string is `/@` for the default size, or `/@/<size>` where size
//! takes an optional k/m/g suffix. The size is rounded down to a whole
//! number of blocks.

use std::sync::Arc;

use async_trait::async_trait;
use blockgate_types::{CmdStatus, Error, Geometry, Result};
use tokio::sync::RwLock;

use crate::handler::{BackendHandler, BlockDevice, OpenRequest};
use crate::registry::BackendRegistry;

const BLOCK_SIZE: u32 = 4096;
const DEFAULT_SIZE: u64 = 1 << 30;

/// Module entry point: registers the ram handler.
pub fn handler_init(registry: &BackendRegistry) -> Result<()> {
    registry.register(Arc::new(RamHandler))
}

pub struct RamHandler;

#[async_trait]
impl BackendHandler for RamHandler {
    fn subtype(&self) -> &str {
        "ram"
    }

    fn display_name(&self) -> &str {
        "RAM handler"
    }

    fn check_config(&self, cfg: &str) -> std::result::Result<(), String> {
        parse_cfg(cfg).map(|_| ())
    }

    async fn open(&self, req: &mut OpenRequest) -> Result<Arc<dyn BlockDevice>> {
        let size = parse_cfg(&req.cfgstring).map_err(Error::Invalid)?;
        let size = size / u64::from(BLOCK_SIZE) * u64::from(BLOCK_SIZE);
        if size == 0 {
            return Err(Error::Invalid(format!(
                "ram size {size} is smaller than one block"
            )));
        }

        tracing::info!(
            "{}: no backing store, {size} bytes of memory are discarded on close",
            req.devname
        );
        req.geometry = Geometry {
            num_lbas: size / u64::from(BLOCK_SIZE),
            block_size: BLOCK_SIZE,
            max_xfer_len: 0,
        };

        Ok(Arc::new(RamDevice {
            data: RwLock::new(vec![0u8; size as usize]),
        }))
    }
}

struct RamDevice {
    data: RwLock<Vec<u8>>,
}

#[async_trait]
impl BlockDevice for RamDevice {
    async fn read(&self, buf: &mut [u8], seekpos: u64) -> CmdStatus {
        let data = self.data.read().await;
        let Some(range) = io_range(data.len(), buf.len(), seekpos) else {
            return CmdStatus::Range;
        };
        buf.copy_from_slice(&data[range]);
        CmdStatus::Ok
    }

    async fn write(&self, buf: &[u8], seekpos: u64) -> CmdStatus {
        let mut data = self.data.write().await;
        let len = data.len();
        let Some(range) = io_range(len, buf.len(), seekpos) else {
            return CmdStatus::Range;
        };
        data[range].copy_from_slice(buf);
        CmdStatus::Ok
    }

    // Nothing to sync; the default flush already reports Ok.
}

fn io_range(dev_len: usize, nbyte: usize, seekpos: u64) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(seekpos).ok()?;
    let end = start.checked_add(nbyte)?;
    if start >= dev_len || end > dev_len {
        return None;
    }
    Some(start..end)
}

/// Parse `/@` or `/@/<size>` into a size in bytes.
fn parse_cfg(cfg: &str) -> std::result::Result<u64, String> {
    let rest = cfg
        .strip_prefix("/@")
        .ok_or_else(|| format!("ram config must be /@ or /@/<size>, got '{cfg}'"))?;
    if rest.is_empty() {
        return Ok(DEFAULT_SIZE);
    }
    let spec = rest
        .strip_prefix('/')
        .ok_or_else(|| format!("ram config must be /@ or /@/<size>, got '{cfg}'"))?;
    parse_size(spec)
}

fn parse_size(spec: &str) -> std::result::Result<u64, String> {
    let spec = spec.trim();
    let (digits, shift) = match spec.chars().last() {
        Some('k') | Some('K') => (&spec[..spec.len() - 1], 10),
        Some('m') | Some('M') => (&spec[..spec.len() - 1], 20),
        Some('g') | Some('G') => (&spec[..spec.len() - 1], 30),
        _ => (spec, 0),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("bad ram size '{spec}'"))?;
    n.checked_shl(shift)
        .filter(|_| n.leading_zeros() >= shift)
        .ok_or_else(|| format!("ram size '{spec}' overflows"))
}
