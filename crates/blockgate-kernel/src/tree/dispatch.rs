//! The dispatch surface backing the mounted filesystem.
//!
//! The mount adapter calls these inode-keyed methods; they enforce the
//! kind and permission rules, maintain reference counts and timestamps,
//! and forward I/O to the per-node ops. The tree lock is only held around
//! structure access — never across an ops call.

use std::time::SystemTime;

use blockgate_types::{Error, Result};

use super::node::{NodeId, NodeKind, NodeStat};
use super::tree::{Tree, find_child};

/// One directory entry, as listed by [`Tree::readdir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    /// Reported kind; block nodes list as regular files, consistent with
    /// [`Tree::stat`].
    pub kind: NodeKind,
}

/// Result of a successful open.
#[derive(Debug, Clone, Copy)]
pub struct OpenedNode {
    pub id: NodeId,
    /// Non-block nodes open direct-I/O and nonseekable so the host kernel
    /// does not buffer them.
    pub direct_io: bool,
}

impl Tree {
    /// Report the attributes of a node.
    pub fn stat(&self, id: NodeId) -> Result<NodeStat> {
        let inner = self.lock();
        let node = inner
            .nodes
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("node {id}")))?;

        Ok(NodeStat {
            ino: id.0,
            // A block node is reported as a regular file with its
            // permission bits preserved; see `NodeStat`.
            kind: match node.kind {
                NodeKind::Block => NodeKind::Regular,
                kind => kind,
            },
            perm: (node.mode & 0o777) as u16,
            nlink: 1 + node.children.len() as u32,
            size: if node.is_dir() {
                node.children.len() as u64
            } else {
                node.size
            },
            block_size: 1u32 << node.blkbits,
            atime: node.atime,
            mtime: node.mtime,
            ctime: node.ctime,
            rdev: node.rdev,
        })
    }

    /// Resolve a direct child by name, as FUSE lookup does.
    pub fn stat_child(&self, parent: NodeId, name: &str) -> Result<NodeStat> {
        let child = {
            let inner = self.lock();
            find_child(&inner, parent, name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?
        };
        self.stat(child)
    }

    /// List the children of a directory starting at `offset`, bumping the
    /// directory's atime.
    pub fn readdir(&self, id: NodeId, offset: usize) -> Result<Vec<DirEntry>> {
        let mut inner = self.lock();
        let node = inner
            .nodes
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
        if !node.is_dir() {
            return Err(Error::NotDirectory(node.name.clone()));
        }

        let children = node.children.clone();
        let entries = children
            .iter()
            .skip(offset)
            .filter_map(|child| {
                inner.nodes.get(child).map(|n| DirEntry {
                    ino: child.0,
                    name: n.name.clone(),
                    kind: match n.kind {
                        NodeKind::Block => NodeKind::Regular,
                        kind => kind,
                    },
                })
            })
            .collect();

        let node = inner.nodes.get_mut(&id).expect("node checked");
        node.atime = SystemTime::now();
        Ok(entries)
    }

    /// Open a node: take a reference under the lock, then dispatch to the
    /// node's open op. The reference is dropped again if the op fails.
    pub async fn open(&self, id: NodeId) -> Result<OpenedNode> {
        let (ops, kind) = {
            let mut inner = self.lock();
            let node = inner
                .nodes
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
            if node.is_dir() {
                return Err(Error::IsDirectory(node.name.clone()));
            }
            node.refs += 1;
            (node.ops.clone(), node.kind)
        };

        if let Some(ops) = &ops
            && let Err(err) = ops.open().await
        {
            tracing::warn!("node {id} open op failed: {err}");
            let mut inner = self.lock();
            if let Some(node) = inner.nodes.get_mut(&id) {
                node.refs -= 1;
            }
            return Err(err);
        }

        Ok(OpenedNode {
            id,
            direct_io: kind != NodeKind::Block,
        })
    }

    /// Release a node opened with [`Tree::open`], dropping its reference.
    pub async fn release(&self, id: NodeId) -> Result<()> {
        let ops = {
            let inner = self.lock();
            let node = inner
                .nodes
                .get(&id)
                .ok_or_else(|| Error::BadFile(format!("node {id}")))?;
            if node.is_dir() {
                return Err(Error::IsDirectory(node.name.clone()));
            }
            node.ops.clone()
        };

        let result = match &ops {
            Some(ops) => ops.release().await,
            None => Ok(()),
        };
        if let Err(err) = &result {
            tracing::warn!("node {id} release op failed: {err}");
        }

        // The open reference is dropped either way; open and release must
        // stay balanced.
        let mut inner = self.lock();
        if let Some(node) = inner.nodes.get_mut(&id) {
            node.refs = node.refs.saturating_sub(1);
        }
        result
    }

    /// Read through the node's ops, bumping atime on success.
    pub async fn read(&self, id: NodeId, offset: u64, size: usize) -> Result<Vec<u8>> {
        let ops = self.io_ops(id)?;
        let data = ops.read(offset, size).await?;
        let mut inner = self.lock();
        if let Some(node) = inner.nodes.get_mut(&id) {
            node.atime = SystemTime::now();
        }
        Ok(data)
    }

    /// Write through the node's ops, bumping mtime on success.
    pub async fn write(&self, id: NodeId, data: &[u8], offset: u64) -> Result<usize> {
        let ops = self.io_ops(id)?;
        let written = ops.write(data, offset).await?;
        if written != data.len() {
            tracing::warn!(
                "node {id} short write: {written}/{} at offset {offset}",
                data.len()
            );
        }
        let mut inner = self.lock();
        if let Some(node) = inner.nodes.get_mut(&id) {
            node.mtime = SystemTime::now();
        }
        Ok(written)
    }

    /// Fsync through the node's ops; missing fsync means success.
    pub async fn fsync(&self, id: NodeId, datasync: bool) -> Result<()> {
        let ops = self.io_ops(id)?;
        ops.fsync(datasync).await?;
        let mut inner = self.lock();
        if let Some(node) = inner.nodes.get_mut(&id) {
            node.mtime = SystemTime::now();
        }
        Ok(())
    }

    /// Fetch the ops handle for a data-I/O call on an open node.
    fn io_ops(&self, id: NodeId) -> Result<std::sync::Arc<dyn super::NodeOps>> {
        let inner = self.lock();
        let node = inner
            .nodes
            .get(&id)
            .ok_or_else(|| Error::BadFile(format!("node {id}")))?;
        if node.is_dir() {
            return Err(Error::IsDirectory(node.name.clone()));
        }
        node.ops
            .clone()
            .ok_or_else(|| Error::Invalid(format!("node '{}' has no ops", node.name)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use blockgate_types::{Error, Result};

    use super::super::node::NodeOps;
    use super::*;

    /// Byte-buffer ops for exercising the dispatch path.
    struct BufOps {
        data: Mutex<Vec<u8>>,
        fail_open: bool,
    }

    impl BufOps {
        fn new() -> Arc<BufOps> {
            Arc::new(BufOps {
                data: Mutex::new(vec![0u8; 64]),
                fail_open: false,
            })
        }
    }

    #[async_trait]
    impl NodeOps for BufOps {
        async fn open(&self) -> Result<()> {
            if self.fail_open {
                return Err(Error::NoDevice("gone".into()));
            }
            Ok(())
        }

        async fn read(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
            let data = self.data.lock().unwrap();
            let start = offset as usize;
            let end = (start + size).min(data.len());
            Ok(data[start..end].to_vec())
        }

        async fn write(&self, data: &[u8], offset: u64) -> Result<usize> {
            let mut buf = self.data.lock().unwrap();
            let start = offset as usize;
            buf[start..start + data.len()].copy_from_slice(data);
            Ok(data.len())
        }
    }

    fn tree_with_file() -> (Tree, NodeId) {
        let tree = Tree::new("/gate").unwrap();
        let id = tree
            .node_add("buf", None, NodeKind::Regular, 0o664, Some(BufOps::new()))
            .unwrap();
        (tree, id)
    }

    #[tokio::test]
    async fn open_read_write_release() {
        let (tree, id) = tree_with_file();
        let opened = tree.open(id).await.unwrap();
        assert!(opened.direct_io);

        tree.write(id, b"hello", 3).await.unwrap();
        let data = tree.read(id, 3, 5).await.unwrap();
        assert_eq!(data, b"hello");

        tree.release(id).await.unwrap();
    }

    #[tokio::test]
    async fn open_holds_node_against_removal() {
        let (tree, id) = tree_with_file();
        tree.open(id).await.unwrap();
        assert!(matches!(tree.node_remove("buf", None), Err(Error::Busy(_))));
        tree.release(id).await.unwrap();
        tree.node_remove("buf", None).unwrap();
    }

    #[tokio::test]
    async fn failed_open_drops_reference() {
        let tree = Tree::new("/gate").unwrap();
        let ops = Arc::new(BufOps {
            data: Mutex::new(Vec::new()),
            fail_open: true,
        });
        let id = tree
            .node_add("flaky", None, NodeKind::Regular, 0o664, Some(ops))
            .unwrap();
        assert!(tree.open(id).await.is_err());
        // No stray reference: the node can be removed.
        tree.node_remove("flaky", None).unwrap();
    }

    #[tokio::test]
    async fn open_directory_is_rejected() {
        let tree = Tree::new("/gate").unwrap();
        let dir = tree.mkdir("dev", None).unwrap();
        assert!(matches!(tree.open(dir).await, Err(Error::IsDirectory(_))));
    }

    #[tokio::test]
    async fn read_without_ops_is_invalid() {
        let tree = Tree::new("/gate").unwrap();
        let id = tree
            .node_add("bare", None, NodeKind::Regular, 0o444, None)
            .unwrap();
        assert!(matches!(
            tree.read(id, 0, 16).await,
            Err(Error::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn fsync_without_ops_entry_succeeds() {
        let (tree, id) = tree_with_file();
        tree.fsync(id, true).await.unwrap();
    }

    #[test]
    fn stat_reports_block_as_regular() {
        let tree = Tree::new("/gate").unwrap();
        let id = tree
            .node_add("ram000", None, NodeKind::Block, 0o664, None)
            .unwrap();
        tree.update_block_size(id, 4096).unwrap();
        tree.update_size(id, 1 << 30).unwrap();
        tree.update_rdev(id, 42).unwrap();

        let stat = tree.stat(id).unwrap();
        assert_eq!(stat.kind, NodeKind::Regular);
        assert_eq!(stat.perm, 0o664);
        assert_eq!(stat.size, 1 << 30);
        assert_eq!(stat.block_size, 4096);
        assert_eq!(stat.rdev, 42);
    }

    #[tokio::test]
    async fn block_nodes_open_seekable() {
        let tree = Tree::new("/gate").unwrap();
        let id = tree
            .node_add("ram000", None, NodeKind::Block, 0o664, Some(BufOps::new()))
            .unwrap();
        let opened = tree.open(id).await.unwrap();
        assert!(!opened.direct_io);
        tree.release(id).await.unwrap();
    }

    #[test]
    fn readdir_respects_offset() {
        let tree = Tree::new("/gate").unwrap();
        tree.mkdir("a", None).unwrap();
        tree.mkdir("b", None).unwrap();
        tree.mkdir("c", None).unwrap();

        let all = tree.readdir(NodeId::ROOT, 0).unwrap();
        assert_eq!(
            all.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            ["a", "b", "c"]
        );
        let rest = tree.readdir(NodeId::ROOT, 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, "c");
    }

    #[test]
    fn readdir_on_file_fails() {
        let (tree, id) = tree_with_file();
        assert!(matches!(
            tree.readdir(id, 0),
            Err(Error::NotDirectory(_))
        ));
    }

    #[test]
    fn stat_child_resolves_names() {
        let tree = Tree::new("/gate").unwrap();
        let dev = tree.mkdir("dev", None).unwrap();
        tree.node_add("ram000", Some(dev), NodeKind::Block, 0o664, None)
            .unwrap();
        let stat = tree.stat_child(dev, "ram000").unwrap();
        assert_eq!(stat.perm, 0o664);
        assert!(matches!(
            tree.stat_child(dev, "missing"),
            Err(Error::NotFound(_))
        ));
    }
}
