//! FUSE adapter: maps fuser callbacks onto the tree's dispatch surface.
//!
//! Node ids double as inode numbers (the tree root is id 1, which is
//! FUSE's root inode). The session thread blocks each callback on the
//! corresponding async dispatch call through a runtime handle.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use blockgate_kernel::{Gateway, NodeId, NodeKind, NodeStat};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request,
};
use tokio::runtime::Handle;

/// Attribute validity handed to the host kernel.
const TTL: Duration = Duration::from_secs(1);

pub struct FuseAdapter {
    gateway: Arc<Gateway>,
    runtime: Handle,
    uid: u32,
    gid: u32,
}

impl FuseAdapter {
    pub fn new(gateway: Arc<Gateway>, runtime: Handle) -> FuseAdapter {
        // SAFETY: geteuid/getegid have no preconditions.
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        FuseAdapter {
            gateway,
            runtime,
            uid,
            gid,
        }
    }

    fn attr(&self, stat: &NodeStat) -> FileAttr {
        FileAttr {
            ino: stat.ino,
            size: stat.size,
            blocks: stat.size.div_ceil(512),
            atime: stat.atime,
            mtime: stat.mtime,
            ctime: stat.ctime,
            crtime: SystemTime::UNIX_EPOCH,
            kind: file_type(stat.kind),
            perm: stat.perm,
            nlink: stat.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: stat.rdev as u32,
            blksize: stat.block_size,
            flags: 0,
        }
    }
}

fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        // Block nodes are already reported as regular by the tree.
        NodeKind::Regular | NodeKind::Block => FileType::RegularFile,
    }
}

impl Filesystem for FuseAdapter {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(2); // ENOENT: names in the tree are UTF-8
            return;
        };
        match self.gateway.tree().stat_child(NodeId(parent), name) {
            Ok(stat) => reply.entry(&TTL, &self.attr(&stat), 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.gateway.tree().stat(NodeId(ino)) {
            Ok(stat) => reply.attr(&TTL, &self.attr(&stat)),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if offset < 0 {
            reply.error(22); // EINVAL
            return;
        }
        match self.gateway.tree().readdir(NodeId(ino), offset as usize) {
            Ok(entries) => {
                let mut next = offset;
                for entry in entries {
                    next += 1;
                    if reply.add(entry.ino, next, file_type(entry.kind), &entry.name) {
                        break; // buffer full
                    }
                }
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.runtime.block_on(self.gateway.tree().open(NodeId(ino))) {
            Ok(opened) => {
                let flags = if opened.direct_io {
                    fuser::consts::FOPEN_DIRECT_IO | fuser::consts::FOPEN_NONSEEKABLE
                } else {
                    0
                };
                reply.opened(ino, flags);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self
            .runtime
            .block_on(self.gateway.tree().release(NodeId(ino)))
        {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(22);
            return;
        }
        match self
            .runtime
            .block_on(self.gateway.tree().read(NodeId(ino), offset as u64, size as usize))
        {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(22);
            return;
        }
        match self
            .runtime
            .block_on(self.gateway.tree().write(NodeId(ino), data, offset as u64))
        {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        match self
            .runtime
            .block_on(self.gateway.tree().fsync(NodeId(ino), datasync))
        {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }
}
