//! Gateway assembly.
//!
//! Owns the tree, the handler registry, the device table and the I/O
//! bridge, wires the control node into the tree, and enforces the
//! cross-table rules (no unload while devices bind a handler, device
//! node and binding kept in step).

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use blockgate_types::{Error, Result};
use tokio::sync::Notify;

use crate::bridge::{DeviceOps, IoBridge};
use crate::ctl::CtlOps;
use crate::devices::{Device, DeviceTable};
use crate::loader::ModuleLoader;
use crate::registry::BackendRegistry;
use crate::tree::{NodeId, NodeKind, Tree};

pub const DEFAULT_MOUNTPOINT: &str = "/tcmur";
pub const DEFAULT_CTL_NAME: &str = "tcmur";

/// Gateway construction parameters.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Where the filesystem is mounted.
    pub mountpoint: String,
    /// Name of the control node under `/dev`.
    pub ctl_name: String,
    /// Handler module search prefix; `None` keeps the default.
    pub handler_prefix: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            mountpoint: DEFAULT_MOUNTPOINT.to_string(),
            ctl_name: DEFAULT_CTL_NAME.to_string(),
            handler_prefix: None,
        }
    }
}

/// The assembled gateway.
pub struct Gateway {
    tree: Arc<Tree>,
    registry: Arc<BackendRegistry>,
    devices: Arc<DeviceTable>,
    bridge: Arc<IoBridge>,
    ctl: OnceLock<Arc<CtlOps>>,
    ctl_name: String,
    dev_dir: NodeId,
    sys_dir: NodeId,
    mod_dir: NodeId,
    shutdown: Notify,
}

impl Gateway {
    /// Build the tree skeleton (`/dev`, `/sys/module`), the tables, and
    /// the control node `/dev/<ctl>` with its `/sys/module/<ctl>` twin.
    pub fn new(config: GatewayConfig, loader: Box<dyn ModuleLoader>) -> Result<Arc<Gateway>> {
        let tree = Arc::new(Tree::new(&config.mountpoint)?);
        let dev_dir = tree.mkdir("dev", None)?;
        let sys_dir = tree.mkdir("sys", None)?;
        let mod_dir = tree.mkdir("module", Some(sys_dir))?;

        let registry = Arc::new(BackendRegistry::new(
            config.handler_prefix.as_deref(),
            loader,
        ));
        let devices = Arc::new(DeviceTable::new());
        let bridge = Arc::new(IoBridge::new(devices.clone()));

        let gateway = Arc::new(Gateway {
            tree,
            registry,
            devices,
            bridge,
            ctl: OnceLock::new(),
            ctl_name: config.ctl_name.clone(),
            dev_dir,
            sys_dir,
            mod_dir,
            shutdown: Notify::new(),
        });

        let ctl = CtlOps::new(&gateway);
        gateway.ctl.set(ctl.clone()).ok().expect("fresh gateway");
        gateway.tree.mkdir(&config.ctl_name, Some(mod_dir))?;
        gateway.tree.node_add(
            &config.ctl_name,
            Some(dev_dir),
            NodeKind::Regular,
            0o664,
            Some(ctl),
        )?;

        Ok(gateway)
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn devices(&self) -> &Arc<DeviceTable> {
        &self.devices
    }

    pub fn bridge(&self) -> &Arc<IoBridge> {
        &self.bridge
    }

    /// The control channel interpreter.
    pub fn control(&self) -> Arc<CtlOps> {
        self.ctl.get().expect("set at construction").clone()
    }

    pub fn fmt_tree(&self) -> String {
        self.tree.fmt()
    }

    /// Load a handler module and create its `/sys/module/<subtype>` entry.
    pub fn load_handler(&self, subtype: &str) -> Result<()> {
        self.registry.load(subtype)?;
        self.tree.mkdir(subtype, Some(self.mod_dir))?;
        Ok(())
    }

    /// Unload a handler. Fails with `busy` while any device binds it.
    pub fn unload_handler(&self, subtype: &str) -> Result<()> {
        if self.devices.has_subtype(subtype) {
            tracing::error!("handler {subtype} has existing devices");
            return Err(Error::Busy(format!(
                "handler {subtype} has existing devices"
            )));
        }
        self.registry.unload(subtype)?;
        self.tree.rmdir(subtype, Some(self.mod_dir))?;
        Ok(())
    }

    /// Bind a device and insert its node under `/dev`.
    pub async fn add_device(&self, minor: usize, cfgstring: &str) -> Result<Arc<Device>> {
        let device = self
            .devices
            .add(&self.registry, minor, None, cfgstring)
            .await?;

        let ops = DeviceOps::new(self.bridge.clone(), minor);
        match self.tree.node_add(
            device.dev_name(),
            Some(self.dev_dir),
            NodeKind::Block,
            0o664,
            Some(ops),
        ) {
            Ok(node) => {
                self.tree.update_size(node, device.size_bytes())?;
                self.tree
                    .update_block_size(node, device.geometry().block_size)?;
                Ok(device)
            }
            Err(err) => {
                // No node, no binding.
                let _ = self.devices.remove(minor).await;
                Err(err)
            }
        }
    }

    /// Remove the device node under `/dev`, then the binding. A node held
    /// open fails the removal with `busy` and leaves the binding intact.
    pub async fn remove_device(&self, minor: usize) -> Result<()> {
        let devname = self.devices.dev_name(minor)?;
        self.tree.node_remove(&devname, Some(self.dev_dir))?;
        self.devices.remove(minor).await
    }

    /// Request shutdown after a short grace period, so the reply to the
    /// write carrying `exit` can still be delivered.
    pub fn schedule_exit(self: &Arc<Self>) {
        let gateway = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            gateway.shutdown.notify_one();
        });
    }

    /// Wait for a scheduled exit.
    pub async fn exited(&self) {
        self.shutdown.notified().await;
    }

    /// Tear the gateway down: control node, skeletal directories, tree,
    /// then the registry (which refuses while handlers remain). Each step
    /// is attempted; the first failure is reported.
    pub fn shutdown(&self) -> Result<()> {
        let mut first_err: Option<Error> = None;
        let mut run = |what: &str, result: Result<()>| {
            if let Err(err) = result {
                tracing::warn!("shutdown: {what}: {err}");
                first_err.get_or_insert(err);
            }
        };

        run(
            "remove control node",
            self.tree.node_remove(&self.ctl_name, Some(self.dev_dir)),
        );
        run(
            "remove control module dir",
            self.tree.rmdir(&self.ctl_name, Some(self.mod_dir)),
        );
        run("rmdir /dev", self.tree.rmdir("dev", None));
        run(
            "rmdir /sys/module",
            self.tree.rmdir("module", Some(self.sys_dir)),
        );
        run("rmdir /sys", self.tree.rmdir("sys", None));
        run("tree exit", self.tree.shutdown());
        run("registry exit", self.registry.shutdown());

        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::BuiltinLoader;

    fn gateway() -> Arc<Gateway> {
        Gateway::new(GatewayConfig::default(), Box::new(BuiltinLoader::new())).unwrap()
    }

    #[test]
    fn skeleton_directories_exist_on_construction() {
        let gw = gateway();
        assert!(gw.tree().lookup("/dev").is_some());
        assert!(gw.tree().lookup("/sys").is_some());
        assert!(gw.tree().lookup("/sys/module").is_some());
        assert!(gw.tree().lookup("/dev/tcmur").is_some());
        assert!(gw.tree().lookup("/sys/module/tcmur").is_some());
    }

    #[test]
    fn custom_ctl_name_is_respected() {
        let config = GatewayConfig {
            ctl_name: "gate".to_string(),
            ..GatewayConfig::default()
        };
        let gw = Gateway::new(config, Box::new(BuiltinLoader::new())).unwrap();
        assert!(gw.tree().lookup("/dev/gate").is_some());
    }

    #[tokio::test]
    async fn load_add_remove_unload_lifecycle() {
        let gw = gateway();
        gw.load_handler("ram").unwrap();
        gw.add_device(0, "/ram/@/1m").await.unwrap();

        assert!(matches!(gw.unload_handler("ram"), Err(Error::Busy(_))));

        gw.remove_device(0).await.unwrap();
        gw.unload_handler("ram").unwrap();
        assert!(gw.registry().find("ram").is_none());
    }

    #[tokio::test]
    async fn remove_device_fails_busy_while_node_open() {
        let gw = gateway();
        gw.load_handler("ram").unwrap();
        gw.add_device(0, "/ram/@/1m").await.unwrap();

        let node = gw.tree().lookup("/dev/ram000").unwrap();
        gw.tree().open(node).await.unwrap();

        assert!(matches!(
            gw.remove_device(0).await,
            Err(Error::Busy(_))
        ));
        // Binding still intact.
        assert!(gw.devices().get(0).is_ok());

        gw.tree().release(node).await.unwrap();
        gw.remove_device(0).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_clean_after_teardown() {
        let gw = gateway();
        gw.load_handler("ram").unwrap();
        gw.add_device(0, "/ram/@/1m").await.unwrap();

        gw.remove_device(0).await.unwrap();
        gw.unload_handler("ram").unwrap();
        gw.shutdown().unwrap();
    }

    #[tokio::test]
    async fn shutdown_busy_with_leftover_state() {
        let gw = gateway();
        gw.load_handler("ram").unwrap();
        assert!(gw.shutdown().is_err());
    }

    #[tokio::test]
    async fn exit_fires_after_grace_period() {
        let gw = gateway();
        gw.schedule_exit();
        tokio::time::timeout(Duration::from_secs(5), gw.exited())
            .await
            .expect("exit should fire");
    }
}
