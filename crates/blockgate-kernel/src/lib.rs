//! blockgate-kernel: the core of the blockgate gateway.
//!
//! This crate provides:
//!
//! - **Tree**: the process-owned filesystem tree backing the mount
//! - **Registry**: the fixed-capacity backend handler table and loaders
//! - **Devices**: minors bound to backend instances
//! - **Bridge**: synchronous filesystem I/O over asynchronous backend
//!   commands
//! - **Ctl**: the control channel command interpreter
//! - **Gateway**: the assembly of all of the above
//! - **Backends**: the builtin `ram` and `file` handlers
//! - **Stubs**: neutral entry points for richer-host handler modules
//!
//! The mount transport itself lives with the embedding binary (see
//! blockgate-daemon); everything here is driven through the inode-keyed
//! dispatch surface on [`Tree`].

pub mod backends;
pub mod bridge;
pub mod ctl;
pub mod devices;
pub mod gateway;
pub mod handler;
pub mod loader;
pub mod registry;
pub mod stubs;
pub mod tree;

pub use bridge::{DeviceOps, IoBridge, IoCounters};
pub use ctl::CtlOps;
pub use devices::{Device, DeviceTable};
pub use gateway::{DEFAULT_CTL_NAME, DEFAULT_MOUNTPOINT, Gateway, GatewayConfig};
pub use handler::{BackendHandler, BlockDevice, IoCaps, OpenRequest};
pub use loader::{BuiltinLoader, DylibLoader, HandlerInit, ModuleLoader};
pub use registry::{BackendRegistry, DEFAULT_HANDLER_PREFIX};
pub use tree::{DirEntry, NodeId, NodeKind, NodeOps, NodeStat, OpenedNode, Tree};
