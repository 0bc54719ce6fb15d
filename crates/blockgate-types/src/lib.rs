//! blockgate-types — the data contract of the blockgate gateway.
//!
//! These types are shared between the gateway kernel and backend handler
//! modules (builtin or dynamically loaded). The handler traits themselves
//! live in blockgate-kernel; this crate carries only data: error kinds,
//! command statuses, device geometry, and configuration strings.

mod cfgstring;
mod error;
mod geometry;
mod status;

pub use cfgstring::{CFGSTRING_MAX, CfgString};
pub use error::{Error, Result};
pub use geometry::{
    DEFAULT_BLOCK_SIZE, DEFAULT_MAX_XFER_LEN, DEFAULT_NUM_LBAS, Geometry,
};
pub use status::CmdStatus;

/// Capacity of the backend handler registry (concurrently loaded handlers).
pub const MAX_HANDLERS: usize = 64;

/// Capacity of the device table. All subtypes share one space of minors.
pub const MAX_MINORS: usize = 256;
