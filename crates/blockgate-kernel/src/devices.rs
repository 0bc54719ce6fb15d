//! The device table: minors bound to backend instances.
//!
//! A fixed-capacity table indexed by minor number. Adding a device checks
//! the cfgstring, opens the backend, applies geometry defaults and
//! publishes the binding; removing it requires that nothing holds the
//! device. All subtypes share the one minor space.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use blockgate_types::{
    DEFAULT_BLOCK_SIZE, DEFAULT_MAX_XFER_LEN, DEFAULT_NUM_LBAS, Error, Geometry,
    MAX_MINORS, Result,
};

use crate::bridge::{IoCounters, Worker};
use crate::handler::{BackendHandler, BlockDevice, OpenRequest};
use crate::registry::BackendRegistry;

/// One minor's binding to a backend instance.
pub struct Device {
    minor: usize,
    dev_name: String,
    subtype: String,
    /// Immutable original handler-specific cfgstring.
    cfgstring_orig: String,
    /// Working copy. A handler may tokenize it destructively during open;
    /// the binding restores it from the original afterwards.
    cfgstring: Mutex<String>,
    handler: Arc<dyn BackendHandler>,
    geometry: Geometry,
    pub(crate) state: Arc<dyn BlockDevice>,
    pub(crate) worker: Option<Worker>,
    pub(crate) counters: Arc<IoCounters>,
    holds: AtomicU32,
}

impl Device {
    pub fn minor(&self) -> usize {
        self.minor
    }

    pub fn dev_name(&self) -> &str {
        &self.dev_name
    }

    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Total device size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.geometry.size_bytes()
    }

    /// The current working copy of the handler-specific cfgstring.
    pub fn cfgstring(&self) -> String {
        self.cfgstring.lock().expect("cfgstring lock poisoned").clone()
    }

    /// The immutable original the working copy is restored from.
    pub fn cfgstring_orig(&self) -> &str {
        &self.cfgstring_orig
    }

    pub fn handler(&self) -> &Arc<dyn BackendHandler> {
        &self.handler
    }

    /// Commands submitted so far.
    pub fn nsubmit(&self) -> u64 {
        self.counters.nsubmit()
    }

    /// Commands completed so far. Never exceeds [`Device::nsubmit`].
    pub fn ncomplete(&self) -> u64 {
        self.counters.ncomplete()
    }

    /// Commands currently in flight (racy, diagnostic only).
    pub fn queue_depth(&self) -> u64 {
        self.counters.queue_depth()
    }
}

/// The minor-indexed device table.
pub struct DeviceTable {
    slots: Mutex<Vec<Option<Arc<Device>>>>,
}

impl DeviceTable {
    pub fn new() -> DeviceTable {
        DeviceTable {
            slots: Mutex::new(vec![None; MAX_MINORS]),
        }
    }

    /// Bind `minor` to a new backend instance described by `cfgstring`.
    ///
    /// The devname defaults to the subtype followed by the three-digit
    /// minor. Geometry fields the handler leaves unset get the defaults.
    pub async fn add(
        &self,
        registry: &BackendRegistry,
        minor: usize,
        devname: Option<&str>,
        cfgstring: &str,
    ) -> Result<Arc<Device>> {
        if minor >= MAX_MINORS {
            return Err(Error::NoDevice(format!("minor {minor} out of range")));
        }
        if self.get(minor).is_ok() {
            return Err(Error::Busy(format!("minor {minor} already bound")));
        }

        let cfg = registry.check_config(cfgstring)?;
        let handler = registry
            .find(cfg.subtype())
            .ok_or_else(|| Error::NoEnt(format!("no handler for '{}'", cfg.subtype())))?;

        let dev_name = match devname {
            Some(name) => name.to_string(),
            None => format!("{}{:03}", cfg.subtype(), minor),
        };

        let mut req = OpenRequest {
            cfgstring: cfg.handler_cfg().to_string(),
            devname: dev_name.clone(),
            reopen: false,
            geometry: Geometry::UNSET,
        };
        let state = handler.open(&mut req).await.inspect_err(|err| {
            tracing::error!(
                "{} handler open({dev_name}) returned err={err}",
                handler.display_name()
            );
        })?;

        let mut geometry = req.geometry;
        if geometry.block_size == 0 {
            tracing::info!("using default block size={DEFAULT_BLOCK_SIZE}");
            geometry.block_size = DEFAULT_BLOCK_SIZE;
        }
        if geometry.num_lbas == 0 {
            tracing::info!("using default nblocks={DEFAULT_NUM_LBAS}");
            geometry.num_lbas = DEFAULT_NUM_LBAS;
        }
        if geometry.max_xfer_len == 0 {
            tracing::info!("using max I/O size={DEFAULT_MAX_XFER_LEN}");
            geometry.max_xfer_len = DEFAULT_MAX_XFER_LEN;
        }
        geometry.validate()?;

        let counters = Arc::new(IoCounters::new());
        let worker = if handler.nr_threads() > 0 {
            Some(Worker::spawn(state.clone(), counters.clone()))
        } else {
            None
        };

        let device = Arc::new(Device {
            minor,
            dev_name: dev_name.clone(),
            subtype: cfg.subtype().to_string(),
            // The working copy is restored from the original here; whatever
            // the handler did to req.cfgstring is discarded.
            cfgstring_orig: cfg.handler_cfg().to_string(),
            cfgstring: Mutex::new(cfg.handler_cfg().to_string()),
            handler: handler.clone(),
            geometry,
            state: state.clone(),
            worker,
            counters,
            holds: AtomicU32::new(0),
        });

        let busy = {
            let mut slots = self.slots.lock().expect("device table lock poisoned");
            if slots[minor].is_some() {
                true
            } else {
                slots[minor] = Some(device.clone());
                false
            }
        };
        if busy {
            state.close().await;
            return Err(Error::Busy(format!("minor {minor} already bound")));
        }

        tracing::info!(
            "handler {} attach target {} size {} block_size {}",
            handler.display_name(),
            dev_name,
            geometry.size_bytes(),
            geometry.block_size
        );
        Ok(device)
    }

    /// Unbind `minor`, closing the backend instance.
    ///
    /// Fails with `busy` while the device is held open.
    pub async fn remove(&self, minor: usize) -> Result<()> {
        let device = {
            let mut slots = self.slots.lock().expect("device table lock poisoned");
            let slot = slots
                .get_mut(minor)
                .ok_or_else(|| Error::NoDevice(format!("minor {minor}")))?;
            let device = slot
                .as_ref()
                .ok_or_else(|| Error::NoDevice(format!("minor {minor}")))?;
            if device.holds.load(Ordering::SeqCst) > 0 {
                return Err(Error::Busy(format!(
                    "device {} is held open",
                    device.dev_name
                )));
            }
            slot.take().expect("slot checked")
        };

        tracing::info!(
            "handler {} detach target {}",
            device.handler.display_name(),
            device.dev_name
        );
        device.state.close().await;
        Ok(())
    }

    /// The device bound at `minor`.
    pub fn get(&self, minor: usize) -> Result<Arc<Device>> {
        self.slots
            .lock()
            .expect("device table lock poisoned")
            .get(minor)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| Error::NoDevice(format!("minor {minor}")))
    }

    /// Look up a device by name and take a hold on it.
    pub fn open(&self, devname: &str) -> Result<usize> {
        let slots = self.slots.lock().expect("device table lock poisoned");
        for device in slots.iter().flatten() {
            if device.dev_name == devname {
                device.holds.fetch_add(1, Ordering::SeqCst);
                return Ok(device.minor);
            }
        }
        Err(Error::NoDevice(devname.to_string()))
    }

    /// Take a hold on `minor` directly.
    pub fn hold(&self, minor: usize) -> Result<()> {
        let device = self.get(minor)?;
        device.holds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Drop a hold taken with [`DeviceTable::open`] or [`DeviceTable::hold`].
    pub fn close(&self, minor: usize) -> Result<()> {
        let device = self.get(minor)?;
        let dropped = device
            .holds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |h| h.checked_sub(1));
        if dropped.is_err() {
            tracing::warn!("unbalanced close on {}", device.dev_name);
        }
        Ok(())
    }

    pub fn size(&self, minor: usize) -> Result<u64> {
        Ok(self.get(minor)?.size_bytes())
    }

    pub fn block_size(&self, minor: usize) -> Result<u32> {
        Ok(self.get(minor)?.geometry.block_size)
    }

    pub fn max_xfer(&self, minor: usize) -> Result<u32> {
        Ok(self.get(minor)?.geometry.max_xfer_len)
    }

    pub fn dev_name(&self, minor: usize) -> Result<String> {
        Ok(self.get(minor)?.dev_name.clone())
    }

    /// True when any bound device uses the given handler subtype.
    pub fn has_subtype(&self, subtype: &str) -> bool {
        self.slots
            .lock()
            .expect("device table lock poisoned")
            .iter()
            .flatten()
            .any(|d| d.subtype == subtype)
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use blockgate_types::CmdStatus;

    use super::*;
    use crate::loader::{BuiltinLoader, HandlerInit};

    struct MemDevice {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BlockDevice for MemDevice {
        async fn read(&self, buf: &mut [u8], _seekpos: u64) -> CmdStatus {
            buf.fill(0);
            CmdStatus::Ok
        }
        async fn write(&self, _buf: &[u8], _seekpos: u64) -> CmdStatus {
            CmdStatus::Ok
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Test handler: cfg "/small" sets explicit geometry, anything else
    /// leaves the defaults. Tokenizes the working cfgstring to prove the
    /// binding restores it.
    struct MemHandler {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BackendHandler for MemHandler {
        fn subtype(&self) -> &str {
            "mem"
        }
        fn display_name(&self) -> &str {
            "mem handler"
        }
        async fn open(&self, req: &mut OpenRequest) -> Result<Arc<dyn BlockDevice>> {
            if req.cfgstring == "/small" {
                req.geometry = Geometry {
                    num_lbas: 8,
                    block_size: 512,
                    max_xfer_len: 4096,
                };
            }
            // Destructive parse of the working copy.
            req.cfgstring.clear();
            Ok(Arc::new(MemDevice {
                closed: self.closed.clone(),
            }))
        }
    }

    fn setup() -> (BackendRegistry, DeviceTable, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let closed2 = closed.clone();
        // A one-off init through register(), sidestepping the fn-pointer
        // table so the handler can share the `closed` flag.
        let loader = BuiltinLoader::with_table(Vec::<(&str, HandlerInit)>::new());
        let registry = BackendRegistry::new(None, Box::new(loader));
        registry
            .register(Arc::new(MemHandler { closed: closed2 }))
            .unwrap();
        (registry, DeviceTable::new(), closed)
    }

    #[tokio::test]
    async fn add_applies_geometry_defaults() {
        let (registry, devices, _) = setup();
        let dev = devices.add(&registry, 0, None, "/mem/whatever").await.unwrap();
        assert_eq!(dev.geometry().block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(dev.geometry().num_lbas, DEFAULT_NUM_LBAS);
        assert_eq!(dev.geometry().max_xfer_len, DEFAULT_MAX_XFER_LEN);
        assert_eq!(dev.size_bytes(), 1 << 30);
    }

    #[tokio::test]
    async fn add_respects_handler_geometry() {
        let (registry, devices, _) = setup();
        let dev = devices.add(&registry, 0, None, "/mem/small").await.unwrap();
        assert_eq!(dev.geometry().block_size, 512);
        assert_eq!(dev.size_bytes(), 4096);
    }

    #[tokio::test]
    async fn devname_defaults_to_subtype_and_minor() {
        let (registry, devices, _) = setup();
        let dev = devices.add(&registry, 7, None, "/mem/x").await.unwrap();
        assert_eq!(dev.dev_name(), "mem007");
        assert_eq!(devices.dev_name(7).unwrap(), "mem007");

        let named = devices
            .add(&registry, 8, Some("scratch"), "/mem/x")
            .await
            .unwrap();
        assert_eq!(named.dev_name(), "scratch");
    }

    #[tokio::test]
    async fn add_rejects_bound_minor_and_bad_range() {
        let (registry, devices, _) = setup();
        devices.add(&registry, 0, None, "/mem/x").await.unwrap();
        assert!(matches!(
            devices.add(&registry, 0, None, "/mem/x").await,
            Err(Error::Busy(_))
        ));
        assert!(matches!(
            devices.add(&registry, MAX_MINORS, None, "/mem/x").await,
            Err(Error::NoDevice(_))
        ));
    }

    #[tokio::test]
    async fn add_unknown_subtype_fails() {
        let (registry, devices, _) = setup();
        assert!(matches!(
            devices.add(&registry, 0, None, "/qcow/x").await,
            Err(Error::NoEnt(_))
        ));
    }

    #[tokio::test]
    async fn working_cfgstring_is_restored_after_open() {
        let (registry, devices, _) = setup();
        let dev = devices.add(&registry, 0, None, "/mem/keepme").await.unwrap();
        // The handler cleared its working copy; the binding kept its own.
        assert_eq!(dev.cfgstring(), "/keepme");
        assert_eq!(dev.cfgstring(), dev.cfgstring_orig());
    }

    #[tokio::test]
    async fn remove_closes_backend() {
        let (registry, devices, closed) = setup();
        devices.add(&registry, 0, None, "/mem/x").await.unwrap();
        devices.remove(0).await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert!(matches!(devices.remove(0).await, Err(Error::NoDevice(_))));
    }

    #[tokio::test]
    async fn holds_block_removal() {
        let (registry, devices, _) = setup();
        devices.add(&registry, 0, None, "/mem/x").await.unwrap();

        let minor = devices.open("mem000").unwrap();
        assert_eq!(minor, 0);
        assert!(matches!(devices.remove(0).await, Err(Error::Busy(_))));

        devices.close(minor).unwrap();
        devices.remove(0).await.unwrap();
    }

    #[tokio::test]
    async fn open_unknown_devname_fails() {
        let (_, devices, _) = setup();
        assert!(matches!(
            devices.open("nope000"),
            Err(Error::NoDevice(_))
        ));
    }

    #[tokio::test]
    async fn accessors_fail_on_missing_minor() {
        let (_, devices, _) = setup();
        assert!(matches!(devices.size(3), Err(Error::NoDevice(_))));
        assert!(matches!(devices.block_size(3), Err(Error::NoDevice(_))));
        assert!(matches!(devices.max_xfer(3), Err(Error::NoDevice(_))));
        assert!(matches!(devices.dev_name(3), Err(Error::NoDevice(_))));
    }

    #[tokio::test]
    async fn has_subtype_tracks_bindings() {
        let (registry, devices, _) = setup();
        assert!(!devices.has_subtype("mem"));
        devices.add(&registry, 0, None, "/mem/x").await.unwrap();
        assert!(devices.has_subtype("mem"));
        devices.remove(0).await.unwrap();
        assert!(!devices.has_subtype("mem"));
    }
}
