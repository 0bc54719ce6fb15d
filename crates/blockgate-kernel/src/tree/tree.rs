//! Tree structure: creation, linking, lookup, metadata, and the dump.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use blockgate_types::{Error, Result};

use super::node::{Node, NodeId, NodeKind, NodeOps};

/// Tree invariants are programming errors, not runtime faults: violations
/// abort in debug builds and warn in release builds.
macro_rules! check_node {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            if cfg!(debug_assertions) {
                panic!($($arg)*);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

pub(crate) struct TreeInner {
    pub(crate) nodes: HashMap<NodeId, Node>,
    next_id: u64,
    mountpoint: String,
}

/// The process-owned filesystem tree.
///
/// All mutation goes through these methods; the mounted filesystem only
/// ever reads the structure and performs I/O through per-node ops.
pub struct Tree {
    pub(crate) inner: Mutex<TreeInner>,
}

impl Tree {
    /// Create a tree rooted at `mountpoint`.
    ///
    /// The mountpoint must start with `/` and not end with `/`; the root
    /// node takes the final path segment as its name, directory kind,
    /// mode 0o555.
    pub fn new(mountpoint: &str) -> Result<Tree> {
        if !mountpoint.starts_with('/') {
            return Err(Error::Invalid(format!(
                "mountpoint must start with '/': '{mountpoint}'"
            )));
        }
        let rootname = match mountpoint.rsplit('/').next() {
            Some(name) if !name.is_empty() => name,
            _ => {
                return Err(Error::Invalid(format!(
                    "mountpoint must not end with '/': '{mountpoint}'"
                )));
            }
        };

        let mut nodes = HashMap::new();
        nodes.insert(
            NodeId::ROOT,
            Node::new(rootname, NodeKind::Directory, 0o555, None),
        );

        Ok(Tree {
            inner: Mutex::new(TreeInner {
                nodes,
                next_id: NodeId::ROOT.0 + 1,
                mountpoint: mountpoint.to_string(),
            }),
        })
    }

    /// The configured mountpoint path.
    pub fn mountpoint(&self) -> String {
        self.lock().mountpoint.clone()
    }

    /// Tear the tree down. Fails with `busy` while the root has children.
    pub fn shutdown(&self) -> Result<()> {
        let inner = self.lock();
        let root = &inner.nodes[&NodeId::ROOT];
        if let Some(first) = root.children.first() {
            let name = inner
                .nodes
                .get(first)
                .map(|n| n.name.as_str())
                .unwrap_or("?");
            tracing::warn!(
                "tree root '{}' still has {} child(ren), e.g. '{}'",
                root.name,
                root.children.len(),
                name
            );
            return Err(Error::Busy(format!(
                "tree root '{}' still has children",
                root.name
            )));
        }
        Ok(())
    }

    /// Add a node under `parent` (the root when `None`).
    ///
    /// If a node of that name already exists and both it and the request
    /// are directories, the existing node is returned; any other collision
    /// fails with `exists`.
    pub fn node_add(
        &self,
        name: &str,
        parent: Option<NodeId>,
        kind: NodeKind,
        mode: u32,
        ops: Option<Arc<dyn NodeOps>>,
    ) -> Result<NodeId> {
        check_node!(
            !name.is_empty() && !name.contains('/'),
            "bad node name '{name}'"
        );
        if name.is_empty() || name.contains('/') {
            return Err(Error::Invalid(format!("bad node name '{name}'")));
        }

        let mut inner = self.lock();
        let parent = parent.unwrap_or(NodeId::ROOT);
        let parent_node = inner
            .nodes
            .get(&parent)
            .ok_or_else(|| Error::NotFound(format!("parent node {parent}")))?;
        if !parent_node.is_dir() {
            return Err(Error::NotDirectory(parent_node.name.clone()));
        }

        if let Some(existing) = find_child(&inner, parent, name) {
            // An existing directory satisfies a directory request.
            if kind == NodeKind::Directory && inner.nodes[&existing].is_dir() {
                return Ok(existing);
            }
            tracing::warn!("attempt to create '{name}' which already exists");
            return Err(Error::Exists(name.to_string()));
        }

        let id = NodeId(inner.next_id);
        inner.next_id += 1;

        let mut node = Node::new(name, kind, mode, ops);
        node.parent = Some(parent);
        inner.nodes.insert(id, node);

        let parent_node = inner.nodes.get_mut(&parent).expect("parent checked");
        parent_node.children.push(id);
        parent_node.mtime = SystemTime::now();

        tracing::debug!("created {kind:?} node '{name}' id={id}");
        Ok(id)
    }

    /// Shorthand for adding a 0o555 directory.
    pub fn mkdir(&self, name: &str, parent: Option<NodeId>) -> Result<NodeId> {
        self.node_add(name, parent, NodeKind::Directory, 0o555, None)
    }

    /// Remove the direct child `name` of `parent` (the root when `None`).
    ///
    /// Fails with `not-empty` for a directory with children, `busy` while
    /// the node is held open, `not-found` when there is no such child.
    pub fn node_remove(&self, name: &str, parent: Option<NodeId>) -> Result<()> {
        let mut inner = self.lock();
        let parent = parent.unwrap_or(NodeId::ROOT);
        let child = find_child(&inner, parent, name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let node = &inner.nodes[&child];
        check_node!(node.parent == Some(parent), "node '{name}' parent mismatch");
        if !node.children.is_empty() {
            tracing::warn!(
                "node '{}' still has {} child(ren)",
                node.name,
                node.children.len()
            );
            return Err(Error::NotEmpty(name.to_string()));
        }
        if node.refs > 1 {
            return Err(Error::Busy(format!("node '{name}' is open")));
        }

        inner.nodes.remove(&child);
        let parent_node = inner.nodes.get_mut(&parent).expect("parent exists");
        parent_node.children.retain(|&c| c != child);
        parent_node.mtime = SystemTime::now();

        tracing::debug!("removed node '{name}' id={child}");
        Ok(())
    }

    /// [`Tree::node_remove`] restricted to directories.
    pub fn rmdir(&self, name: &str, parent: Option<NodeId>) -> Result<()> {
        {
            let inner = self.lock();
            let parent_id = parent.unwrap_or(NodeId::ROOT);
            let child = find_child(&inner, parent_id, name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            if !inner.nodes[&child].is_dir() {
                return Err(Error::NotDirectory(name.to_string()));
            }
        }
        self.node_remove(name, parent)
    }

    /// Resolve an absolute path (relative to the tree root) to a node.
    ///
    /// Repeated `/` collapse and a trailing `/` is tolerated; matching is
    /// exact and byte-wise. Returns `None` if any segment is missing.
    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        let inner = self.lock();
        let mut current = NodeId::ROOT;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = find_child(&inner, current, segment)?;
        }
        Some(current)
    }

    /// Replace the node's permission bits (type bits are untouched).
    pub fn update_mode(&self, id: NodeId, mode: u32) -> Result<()> {
        self.with_node(id, |node| node.mode = mode & 0o777)
    }

    pub fn update_size(&self, id: NodeId, size: u64) -> Result<()> {
        self.with_node(id, |node| node.size = size)
    }

    /// Set the node's block size; must be a power of two.
    pub fn update_block_size(&self, id: NodeId, block_size: u32) -> Result<()> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Error::Invalid(format!(
                "block size {block_size} is not a power of two"
            )));
        }
        self.with_node(id, |node| {
            node.blkbits = block_size.trailing_zeros() as u8;
        })
    }

    pub fn update_mtime(&self, id: NodeId) -> Result<()> {
        self.with_node(id, |node| node.mtime = SystemTime::now())
    }

    pub fn update_rdev(&self, id: NodeId, rdev: u64) -> Result<()> {
        self.with_node(id, |node| node.rdev = rdev)
    }

    /// Render a human-readable dump of the whole tree.
    pub fn fmt(&self) -> String {
        let inner = self.lock();
        let mut out = String::new();
        fmt_subtree(&inner, NodeId::ROOT, 0, &mut out);
        out
    }

    fn with_node(&self, id: NodeId, f: impl FnOnce(&mut Node)) -> Result<()> {
        let mut inner = self.lock();
        let node = inner
            .nodes
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
        f(node);
        Ok(())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TreeInner> {
        self.inner.lock().expect("tree lock poisoned")
    }
}

/// Find a direct child of `parent` by exact name. Caller holds the lock.
pub(crate) fn find_child(inner: &TreeInner, parent: NodeId, name: &str) -> Option<NodeId> {
    let parent_node = inner.nodes.get(&parent)?;
    parent_node
        .children
        .iter()
        .copied()
        .find(|id| inner.nodes.get(id).map(|n| n.name.as_str()) == Some(name))
}

fn fmt_subtree(inner: &TreeInner, id: NodeId, level: usize, out: &mut String) {
    use std::fmt::Write;

    let Some(node) = inner.nodes.get(&id) else {
        return;
    };
    let tag = match node.kind {
        NodeKind::Directory => " (DIR)",
        NodeKind::Block => " (BLK)",
        NodeKind::Regular => " (REG)",
    };
    let size = if node.is_dir() {
        node.children.len() as u64
    } else {
        node.size
    };
    let _ = writeln!(
        out,
        "{:indent$}node[{}]={{name='{}' mode=0{:o}{} size={} refs={}}}",
        "",
        id,
        node.name,
        node.mode,
        tag,
        size,
        node.refs,
        indent = level * 4
    );
    for child in &node.children {
        fmt_subtree(inner, *child, level + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Tree {
        Tree::new("/gate").unwrap()
    }

    #[test]
    fn mountpoint_must_be_absolute() {
        assert!(Tree::new("gate").is_err());
        assert!(Tree::new("/gate/").is_err());
        assert!(Tree::new("/").is_err());
    }

    #[test]
    fn root_takes_final_segment_name() {
        let t = Tree::new("/mnt/gate").unwrap();
        assert!(t.fmt().contains("name='gate'"));
    }

    #[test]
    fn add_and_lookup() {
        let t = tree();
        let dev = t.mkdir("dev", None).unwrap();
        let node = t
            .node_add("ram000", Some(dev), NodeKind::Block, 0o664, None)
            .unwrap();
        assert_eq!(t.lookup("/dev/ram000"), Some(node));
        assert_eq!(t.lookup("/dev"), Some(dev));
        assert_eq!(t.lookup("/dev/missing"), None);
    }

    #[test]
    fn lookup_is_path_canonical() {
        let t = tree();
        let a = t.mkdir("a", None).unwrap();
        let b = t.mkdir("b", Some(a)).unwrap();
        assert_eq!(t.lookup("//a///b"), Some(b));
        assert_eq!(t.lookup("/a/b/"), Some(b));
        assert_eq!(t.lookup(""), Some(NodeId::ROOT));
        assert_eq!(t.lookup("/"), Some(NodeId::ROOT));
    }

    #[test]
    fn lookup_is_exact_and_case_sensitive() {
        let t = tree();
        t.mkdir("Dev", None).unwrap();
        assert!(t.lookup("/dev").is_none());
        assert!(t.lookup("/De").is_none());
        assert!(t.lookup("/Devx").is_none());
    }

    #[test]
    fn mkdir_twice_returns_existing() {
        let t = tree();
        let first = t.mkdir("sys", None).unwrap();
        let second = t.mkdir("sys", None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn duplicate_file_fails_with_exists() {
        let t = tree();
        t.node_add("ctl", None, NodeKind::Regular, 0o664, None)
            .unwrap();
        let err = t
            .node_add("ctl", None, NodeKind::Regular, 0o664, None)
            .unwrap_err();
        assert!(matches!(err, Error::Exists(_)));
        // A directory request over an existing file also fails.
        let err = t.mkdir("ctl", None).unwrap_err();
        assert!(matches!(err, Error::Exists(_)));
    }

    #[test]
    fn remove_missing_fails_not_found() {
        let t = tree();
        assert!(matches!(
            t.node_remove("nope", None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn remove_non_empty_dir_fails() {
        let t = tree();
        let dev = t.mkdir("dev", None).unwrap();
        t.node_add("ram000", Some(dev), NodeKind::Block, 0o664, None)
            .unwrap();
        assert!(matches!(
            t.node_remove("dev", None),
            Err(Error::NotEmpty(_))
        ));
        t.node_remove("ram000", Some(dev)).unwrap();
        t.node_remove("dev", None).unwrap();
    }

    #[test]
    fn rmdir_rejects_non_directories() {
        let t = tree();
        t.node_add("file", None, NodeKind::Regular, 0o444, None)
            .unwrap();
        assert!(matches!(
            t.rmdir("file", None),
            Err(Error::NotDirectory(_))
        ));
    }

    #[test]
    fn mkdir_rmdir_restores_child_set() {
        let t = tree();
        t.mkdir("dev", None).unwrap();
        let before = t.fmt();
        t.mkdir("tmp", None).unwrap();
        t.rmdir("tmp", None).unwrap();
        assert_eq!(t.fmt(), before);
    }

    #[test]
    fn block_size_must_be_power_of_two() {
        let t = tree();
        let id = t
            .node_add("blk", None, NodeKind::Block, 0o664, None)
            .unwrap();
        t.update_block_size(id, 4096).unwrap();
        assert!(t.update_block_size(id, 4095).is_err());
        assert!(t.update_block_size(id, 0).is_err());
    }

    #[test]
    fn update_mode_keeps_permission_bits_only() {
        let t = tree();
        let id = t
            .node_add("n", None, NodeKind::Regular, 0o664, None)
            .unwrap();
        t.update_mode(id, 0o170444).unwrap();
        assert!(t.fmt().contains("mode=0444"));
    }

    #[test]
    fn shutdown_busy_until_empty() {
        let t = tree();
        t.mkdir("dev", None).unwrap();
        assert!(matches!(t.shutdown(), Err(Error::Busy(_))));
        t.rmdir("dev", None).unwrap();
        t.shutdown().unwrap();
    }

    #[test]
    fn fmt_shows_hierarchy() {
        let t = tree();
        let dev = t.mkdir("dev", None).unwrap();
        t.node_add("ram000", Some(dev), NodeKind::Block, 0o664, None)
            .unwrap();
        let dump = t.fmt();
        assert!(dump.contains("name='gate'"));
        assert!(dump.contains("(DIR)"));
        assert!(dump.contains("name='ram000'"));
        assert!(dump.contains("(BLK)"));
        // Directory size counts children.
        assert!(dump.contains("name='dev' mode=0555 (DIR) size=1"));
    }

    #[test]
    fn ids_are_not_reused() {
        let t = tree();
        let a = t.mkdir("a", None).unwrap();
        t.rmdir("a", None).unwrap();
        let b = t.mkdir("b", None).unwrap();
        assert_ne!(a, b);
    }
}
