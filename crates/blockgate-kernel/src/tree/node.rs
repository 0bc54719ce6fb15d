//! Node types and the per-node operations vector.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use blockgate_types::{Error, Result};

/// Stable identifier of a node in the tree arena.
///
/// Ids are never reused. The root is always [`NodeId::ROOT`], which matches
/// the FUSE root inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const ROOT: NodeId = NodeId(1);
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Regular,
    Directory,
    /// A backend device. Reported to the mount as a regular file (see
    /// [`NodeStat`]); the block kind governs open flags and dump output.
    Block,
}

/// Per-node operations, dispatched by the tree for filesystem I/O.
///
/// Directories carry no ops. The defaults make a node that opens and
/// fsyncs successfully but rejects data I/O, matching a node added with
/// no read/write entry points.
#[async_trait]
pub trait NodeOps: Send + Sync {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }

    /// Read up to `size` bytes starting at `offset`.
    async fn read(&self, _offset: u64, _size: usize) -> Result<Vec<u8>> {
        Err(Error::Invalid("node has no read operation".into()))
    }

    /// Write `data` at `offset`, returning the bytes consumed.
    async fn write(&self, _data: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::Invalid("node has no write operation".into()))
    }

    /// Missing fsync means success.
    async fn fsync(&self, _datasync: bool) -> Result<()> {
        Ok(())
    }
}

/// One tree entry.
pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    /// Permission bits only (0o777 mask); the kind is tracked separately.
    pub(crate) mode: u32,
    pub(crate) size: u64,
    /// log2 of the block size reported in stat.
    pub(crate) blkbits: u8,
    pub(crate) atime: SystemTime,
    pub(crate) mtime: SystemTime,
    pub(crate) ctime: SystemTime,
    pub(crate) rdev: u64,
    pub(crate) ops: Option<Arc<dyn NodeOps>>,
    pub(crate) parent: Option<NodeId>,
    /// Direct children, insertion-ordered.
    pub(crate) children: Vec<NodeId>,
    /// 1 while linked, +1 per open.
    pub(crate) refs: u32,
}

impl Node {
    pub(crate) fn new(
        name: &str,
        kind: NodeKind,
        mode: u32,
        ops: Option<Arc<dyn NodeOps>>,
    ) -> Node {
        let now = SystemTime::now();
        Node {
            name: name.to_string(),
            kind,
            mode: mode & 0o777,
            size: 0,
            // Block nodes default to 512-byte blocks until the device
            // geometry is known.
            blkbits: if kind == NodeKind::Block { 9 } else { 12 },
            atime: now,
            mtime: now,
            ctime: now,
            rdev: 0,
            ops,
            parent: None,
            children: Vec::new(),
            refs: 1,
        }
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// Attributes reported for one node.
///
/// Block nodes are reported with `kind == Regular` (permissions preserved):
/// exposing them as block devices would make the FUSE host kernel
/// interpret the rdev as one of its own major/minor pairs instead of
/// routing I/O through the gateway's ops.
#[derive(Debug, Clone)]
pub struct NodeStat {
    pub ino: u64,
    pub kind: NodeKind,
    pub perm: u16,
    pub nlink: u32,
    pub size: u64,
    pub block_size: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub rdev: u64,
}
