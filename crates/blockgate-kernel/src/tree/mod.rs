//! The virtual filesystem tree.
//!
//! Like /proc, the tree is managed entirely by the host program — client
//! filesystem syscalls never create or remove nodes. Individual nodes may
//! still be readable and writable through the mounted filesystem,
//! depending on their permissions and per-node operations.
//!
//! # Design
//!
//! Nodes live in an arena keyed by stable [`NodeId`]s; the hierarchy is a
//! parent id plus an insertion-ordered child-id list. The root has id 1,
//! which doubles as the FUSE root inode number, so the mount adapter can
//! use node ids as inode numbers directly.
//!
//! One global mutex guards the node graph. It is held for lookups and
//! link/unlink, never across a backend call: the dispatch surface clones
//! the per-node ops handle under the lock and invokes it outside.

mod dispatch;
mod node;
#[allow(clippy::module_inception)]
mod tree;

pub use dispatch::{DirEntry, OpenedNode};
pub use node::{NodeId, NodeKind, NodeOps, NodeStat};
pub use tree::Tree;
