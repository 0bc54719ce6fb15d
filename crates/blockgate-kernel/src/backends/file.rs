//! File-backed backend.
//!
//! The handler-specific cfgstring is the path of the backing file, which
//! is created if missing. An existing file fixes the device size (rounded
//! down to whole blocks); an empty or new file leaves the geometry to the
//! gateway defaults. The backing file is written positionally and grows
//! on demand, and reads past its end inside the device bounds return
//! zeroes.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use async_trait::async_trait;
use blockgate_types::{CmdStatus, Error, Result};

use crate::handler::{BackendHandler, BlockDevice, OpenRequest};
use crate::registry::BackendRegistry;

const BLOCK_SIZE: u32 = 4096;

/// Module entry point: registers the file handler.
pub fn handler_init(registry: &BackendRegistry) -> Result<()> {
    registry.register(Arc::new(FileHandler))
}

pub struct FileHandler;

#[async_trait]
impl BackendHandler for FileHandler {
    fn subtype(&self) -> &str {
        "file"
    }

    fn display_name(&self) -> &str {
        "file-backed handler"
    }

    /// The backing file is driven through a worker; completions are
    /// asynchronous with respect to the submitter.
    fn nr_threads(&self) -> usize {
        1
    }

    fn check_config(&self, cfg: &str) -> std::result::Result<(), String> {
        if cfg.is_empty() || cfg == "/" {
            return Err(format!(
                "file config must name a backing file path, got '{cfg}'"
            ));
        }
        Ok(())
    }

    async fn open(&self, req: &mut OpenRequest) -> Result<Arc<dyn BlockDevice>> {
        let path = req.cfgstring.clone();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| {
                tracing::error!("{path}: cannot open ({err})");
                Error::from(err)
            })?;

        let file_size =
            file.metadata()?.len() / u64::from(BLOCK_SIZE) * u64::from(BLOCK_SIZE);

        req.geometry.block_size = BLOCK_SIZE;
        if file_size > 0 {
            req.geometry.num_lbas = file_size / u64::from(BLOCK_SIZE);
            tracing::info!("{path}: size determined as {file_size}");
        } else {
            // num_lbas stays zero; the device table applies the default.
            tracing::info!("{path}: size unspecified, using default geometry");
        }

        Ok(Arc::new(FileDevice {
            file: Arc::new(file),
            path,
        }))
    }
}

struct FileDevice {
    file: Arc<File>,
    path: String,
}

#[async_trait]
impl BlockDevice for FileDevice {
    async fn read(&self, buf: &mut [u8], seekpos: u64) -> CmdStatus {
        let file = self.file.clone();
        let len = buf.len();
        let result = tokio::task::spawn_blocking(move || {
            let mut tmp = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                match file.read_at(&mut tmp[filled..], seekpos + filled as u64) {
                    // EOF inside the device bounds reads as zeroes.
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }
            Ok(tmp)
        })
        .await;

        match result {
            Ok(Ok(tmp)) => {
                buf.copy_from_slice(&tmp);
                CmdStatus::Ok
            }
            Ok(Err(err)) => {
                tracing::error!("{}: read failed ({err})", self.path);
                CmdStatus::ReadError
            }
            Err(err) => {
                tracing::error!("{}: read task failed ({err})", self.path);
                CmdStatus::ReadError
            }
        }
    }

    async fn write(&self, buf: &[u8], seekpos: u64) -> CmdStatus {
        let file = self.file.clone();
        let data = buf.to_vec();
        let result =
            tokio::task::spawn_blocking(move || file.write_all_at(&data, seekpos)).await;

        match result {
            Ok(Ok(())) => CmdStatus::Ok,
            Ok(Err(err)) => {
                tracing::error!("{}: write failed ({err})", self.path);
                CmdStatus::WriteError
            }
            Err(err) => {
                tracing::error!("{}: write task failed ({err})", self.path);
                CmdStatus::WriteError
            }
        }
    }

    async fn flush(&self) -> CmdStatus {
        let file = self.file.clone();
        let result = tokio::task::spawn_blocking(move || file.sync_all()).await;
        match result {
            Ok(Ok(())) => CmdStatus::Ok,
            Ok(Err(err)) => {
                tracing::error!("{}: sync failed ({err})", self.path);
                CmdStatus::WriteError
            }
            Err(err) => {
                tracing::error!("{}: sync task failed ({err})", self.path);
                CmdStatus::WriteError
            }
        }
    }

    async fn close(&self) {
        if let Err(err) = self.file.sync_all() {
            tracing::warn!("{}: close cannot sync ({err})", self.path);
        }
    }
}
