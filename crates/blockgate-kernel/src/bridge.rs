//! The I/O bridge: synchronous filesystem ops over asynchronous backend
//! commands.
//!
//! Each read/write/fsync becomes a command with a single-shot completion
//! (a oneshot channel). The command either runs on the submitting task
//! (`nr_threads == 0` handlers) or is enqueued on the device's worker; the
//! caller then waits on the completion and the status is translated into
//! a filesystem error. Commands are never cancelled — the bridge always
//! waits for the backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use blockgate_types::{CmdStatus, Error, Result};
use tokio::sync::{mpsc, oneshot};

use crate::devices::{Device, DeviceTable};
use crate::handler::BlockDevice;
use crate::tree::NodeOps;

/// Per-device submit/complete counters.
///
/// `nsubmit` is bumped by the submitter, `ncomplete` by the completion
/// context; `nsubmit >= ncomplete` always, and the difference is the
/// instantaneous queue depth (read racily, for diagnostics only).
pub struct IoCounters {
    nsubmit: AtomicU64,
    ncomplete: AtomicU64,
}

impl IoCounters {
    pub(crate) fn new() -> IoCounters {
        IoCounters {
            nsubmit: AtomicU64::new(0),
            ncomplete: AtomicU64::new(0),
        }
    }

    pub fn nsubmit(&self) -> u64 {
        self.nsubmit.load(Ordering::Relaxed)
    }

    pub fn ncomplete(&self) -> u64 {
        self.ncomplete.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> u64 {
        self.nsubmit().saturating_sub(self.ncomplete())
    }

    fn submitted(&self) {
        self.nsubmit.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the queue depth after this completion.
    fn completed(&self) -> u64 {
        let ncomplete = self.ncomplete.fetch_add(1, Ordering::Relaxed) + 1;
        self.nsubmit().saturating_sub(ncomplete)
    }
}

pub(crate) enum TaskKind {
    Read { buf: Vec<u8> },
    Write { buf: Vec<u8> },
    Flush,
}

/// One in-flight command.
pub(crate) struct Task {
    kind: TaskKind,
    seekpos: u64,
    started: Instant,
    done: oneshot::Sender<Reply>,
}

pub(crate) struct Reply {
    status: CmdStatus,
    /// Read data rides back on the completion.
    buf: Option<Vec<u8>>,
}

/// Run one command against the backend and fire its completion.
pub(crate) async fn execute(
    state: &Arc<dyn BlockDevice>,
    counters: &IoCounters,
    task: Task,
) {
    let Task {
        kind,
        seekpos,
        started,
        done,
    } = task;

    let (status, buf) = match kind {
        TaskKind::Read { mut buf } => {
            let status = state.read(&mut buf, seekpos).await;
            (status, Some(buf))
        }
        TaskKind::Write { buf } => (state.write(&buf, seekpos).await, None),
        TaskKind::Flush => (state.flush().await, None),
    };

    let depth = counters.completed();
    let elapsed = started.elapsed();
    if elapsed.as_millis() >= 250 {
        tracing::warn!("slow completion: {}ms qd={depth}", elapsed.as_millis());
    }
    if !status.is_ok() {
        tracing::debug!("command completes with status: {status}");
    }
    // The waiter may have gone away; the command still ran to completion.
    let _ = done.send(Reply { status, buf });
}

/// A per-device single-consumer work queue. Submission order is the
/// completion order, since one task drains the channel.
pub(crate) struct Worker {
    tx: mpsc::UnboundedSender<Task>,
}

impl Worker {
    pub(crate) fn spawn(state: Arc<dyn BlockDevice>, counters: Arc<IoCounters>) -> Worker {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                execute(&state, &counters, task).await;
            }
        });
        Worker { tx }
    }

    fn submit(&self, task: Task) -> std::result::Result<(), Task> {
        self.tx.send(task).map_err(|e| e.0)
    }
}

/// Translates filesystem reads, writes and fsyncs into backend commands.
pub struct IoBridge {
    devices: Arc<DeviceTable>,
}

impl IoBridge {
    pub fn new(devices: Arc<DeviceTable>) -> IoBridge {
        IoBridge { devices }
    }

    pub fn devices(&self) -> &Arc<DeviceTable> {
        &self.devices
    }

    /// Read `nbyte` bytes at `seekpos` from the device bound to `minor`.
    pub async fn read(&self, minor: usize, nbyte: usize, seekpos: u64) -> Result<Vec<u8>> {
        let device = self.devices.get(minor)?;
        if !device.handler().io_caps().read {
            return Err(Error::NoEnt(format!(
                "handler for {} has no read function",
                device.dev_name()
            )));
        }
        check_range(&device, nbyte, seekpos)?;

        let (tx, rx) = oneshot::channel();
        self.submit(
            &device,
            Task {
                kind: TaskKind::Read {
                    buf: vec![0u8; nbyte],
                },
                seekpos,
                started: Instant::now(),
                done: tx,
            },
        )
        .await;

        let reply = wait(rx).await?;
        if !reply.status.is_ok() {
            return Err(Error::Io(format!("read status: {}", reply.status)));
        }
        Ok(reply.buf.expect("read reply carries data"))
    }

    /// Write `data` at `seekpos` to the device bound to `minor`.
    pub async fn write(&self, minor: usize, data: &[u8], seekpos: u64) -> Result<usize> {
        let device = self.devices.get(minor)?;
        if !device.handler().io_caps().write {
            return Err(Error::NoEnt(format!(
                "handler for {} has no write function",
                device.dev_name()
            )));
        }
        check_range(&device, data.len(), seekpos)?;

        let (tx, rx) = oneshot::channel();
        self.submit(
            &device,
            Task {
                kind: TaskKind::Write {
                    buf: data.to_vec(),
                },
                seekpos,
                started: Instant::now(),
                done: tx,
            },
        )
        .await;

        let reply = wait(rx).await?;
        if !reply.status.is_ok() {
            return Err(Error::Io(format!("write status: {}", reply.status)));
        }
        Ok(data.len())
    }

    /// Flush the device bound to `minor`. A handler without a flush entry
    /// completes immediately.
    pub async fn flush(&self, minor: usize) -> Result<()> {
        let device = self.devices.get(minor)?;
        if !device.handler().io_caps().flush {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        self.submit(
            &device,
            Task {
                kind: TaskKind::Flush,
                seekpos: 0,
                started: Instant::now(),
                done: tx,
            },
        )
        .await;

        let reply = wait(rx).await?;
        if !reply.status.is_ok() {
            return Err(Error::Io(format!("flush status: {}", reply.status)));
        }
        Ok(())
    }

    /// Enqueue on the device worker when there is one, else run the
    /// command on the submitting task.
    async fn submit(&self, device: &Arc<Device>, task: Task) {
        device.counters.submitted();
        let task = match &device.worker {
            Some(worker) => match worker.submit(task) {
                Ok(()) => return,
                // The worker is gone (device being torn down); complete
                // the command inline rather than dropping it.
                Err(task) => task,
            },
            None => task,
        };
        execute(&device.state, &device.counters, task).await;
    }
}

/// Per-node ops for device files: ferries filesystem I/O through the
/// bridge for one minor. Opening the node also holds the device binding,
/// so `remove` fails with `busy` until the last opener is gone.
pub struct DeviceOps {
    bridge: Arc<IoBridge>,
    minor: usize,
}

impl DeviceOps {
    pub fn new(bridge: Arc<IoBridge>, minor: usize) -> Arc<DeviceOps> {
        Arc::new(DeviceOps { bridge, minor })
    }
}

#[async_trait]
impl NodeOps for DeviceOps {
    async fn open(&self) -> Result<()> {
        self.bridge.devices().hold(self.minor)
    }

    async fn release(&self) -> Result<()> {
        self.bridge.devices().close(self.minor)
    }

    async fn read(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        self.bridge.read(self.minor, size, offset).await
    }

    async fn write(&self, data: &[u8], offset: u64) -> Result<usize> {
        self.bridge.write(self.minor, data, offset).await
    }

    async fn fsync(&self, _datasync: bool) -> Result<()> {
        self.bridge.flush(self.minor).await
    }
}

async fn wait(rx: oneshot::Receiver<Reply>) -> Result<Reply> {
    rx.await
        .map_err(|_| Error::Io("command completion dropped".into()))
}

/// Reject I/O that wraps or exceeds the device bounds.
fn check_range(device: &Device, nbyte: usize, seekpos: u64) -> Result<()> {
    let dev_size = device.size_bytes();
    let end = seekpos
        .checked_add(nbyte as u64)
        .ok_or_else(|| Error::Invalid("I/O range wraps".into()))?;
    if seekpos >= dev_size || end > dev_size {
        return Err(Error::Invalid(format!(
            "I/O exceeds device bounds: [{seekpos}, {end}) on {} byte device",
            dev_size
        )));
    }
    Ok(())
}
