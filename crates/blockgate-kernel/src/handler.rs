//! The backend handler ABI.
//!
//! A handler implements block I/O for one storage subtype (ramdisk,
//! file-backed, network block, ...). Modules — builtin or dynamically
//! loaded — expose a `handler_init` entry point that registers one or more
//! handlers with the [`BackendRegistry`](crate::registry::BackendRegistry);
//! opening a device through a handler yields a per-device [`BlockDevice`]
//! instance that carries the backend's private state.

use std::sync::Arc;

use async_trait::async_trait;
use blockgate_types::{CmdStatus, Geometry, Result};

/// Which I/O entry points a handler provides.
///
/// A missing read or write fails the corresponding bridge call before
/// submit; a missing flush makes fsync complete immediately.
#[derive(Debug, Clone, Copy)]
pub struct IoCaps {
    pub read: bool,
    pub write: bool,
    pub flush: bool,
}

impl Default for IoCaps {
    fn default() -> Self {
        IoCaps {
            read: true,
            write: true,
            flush: true,
        }
    }
}

/// Everything a handler sees while opening a device.
pub struct OpenRequest {
    /// Working copy of the handler-specific cfgstring (the part after the
    /// subtype segment, leading `/` included). Handlers may parse it
    /// destructively; the device binding restores its own copy from the
    /// immutable original once open returns.
    pub cfgstring: String,
    /// The device name the binding will use.
    pub devname: String,
    /// True when re-opening an existing device.
    pub reopen: bool,
    /// Geometry for the handler to fill in. Fields left at zero are
    /// replaced with the gateway defaults.
    pub geometry: Geometry,
}

/// One loaded storage backend.
#[async_trait]
pub trait BackendHandler: Send + Sync {
    /// Short identifier, unique across loaded handlers; the first segment
    /// of a cfgstring names it.
    fn subtype(&self) -> &str;

    /// Human-readable handler name.
    fn display_name(&self) -> &str;

    /// Concurrency hint. 0 means commands complete on the submitting
    /// task; anything greater gives each device a worker and permits the
    /// handler to complete asynchronously.
    fn nr_threads(&self) -> usize {
        0
    }

    fn io_caps(&self) -> IoCaps {
        IoCaps::default()
    }

    /// Validate the handler-specific part of a cfgstring. The `Err` value
    /// is the human-readable reason.
    fn check_config(&self, _cfg: &str) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Open a device instance for the given configuration.
    async fn open(&self, req: &mut OpenRequest) -> Result<Arc<dyn BlockDevice>>;
}

/// An opened backend device: the target of the I/O bridge.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Fill `buf` from the device starting at byte `seekpos`.
    async fn read(&self, buf: &mut [u8], seekpos: u64) -> CmdStatus;

    /// Write `buf` to the device starting at byte `seekpos`.
    async fn write(&self, buf: &[u8], seekpos: u64) -> CmdStatus;

    /// Flush to stable storage.
    async fn flush(&self) -> CmdStatus {
        CmdStatus::Ok
    }

    /// Called once when the device binding is removed.
    async fn close(&self) {}
}
