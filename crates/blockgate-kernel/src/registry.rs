//! The backend handler registry.
//!
//! A fixed-capacity table mapping subtype strings to loaded handlers.
//! `load` drives the module loader and the module's `handler_init` calls
//! [`BackendRegistry::register`] back to fill a slot. Unloading never
//! closes the loader handle — handles retire until process exit, since
//! handler code may still be referenced.
//!
//! Unload ordering with the device table is enforced by the gateway: a
//! handler with bound devices is refused there before this table is
//! touched.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use blockgate_types::{CfgString, Error, MAX_HANDLERS, Result};

use crate::handler::BackendHandler;
use crate::loader::ModuleLoader;

/// Default search prefix for handler modules: the module for subtype
/// `ram` is expected at `<prefix>ram<platform dylib suffix>`.
pub const DEFAULT_HANDLER_PREFIX: &str = "/usr/local/lib/tcmu-runner/handler_";

pub struct BackendRegistry {
    slots: Mutex<Vec<Option<Arc<dyn BackendHandler>>>>,
    prefix: String,
    loader: Box<dyn ModuleLoader>,
    /// Live loader handles by subtype.
    modules: Mutex<HashMap<String, libloading::Library>>,
    /// Handles of unloaded (or failed) modules, kept mapped until exit.
    retired: Mutex<Vec<libloading::Library>>,
}

impl BackendRegistry {
    /// Create a registry over the given loader. `prefix` defaults to
    /// [`DEFAULT_HANDLER_PREFIX`].
    pub fn new(prefix: Option<&str>, loader: Box<dyn ModuleLoader>) -> BackendRegistry {
        BackendRegistry {
            slots: Mutex::new(vec![None; MAX_HANDLERS]),
            prefix: prefix.unwrap_or(DEFAULT_HANDLER_PREFIX).to_string(),
            loader,
            modules: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Load the handler module for `subtype` and run its `handler_init`.
    pub fn load(&self, subtype: &str) -> Result<()> {
        if let Some(h) = self.find(subtype) {
            tracing::error!("handler {} is already registered", h.subtype());
            return Err(Error::Exists(subtype.to_string()));
        }
        if !self.has_free_slot() {
            tracing::error!("out of handler slots trying to register {subtype}");
            return Err(Error::NoSpace(format!("handler registry full ({MAX_HANDLERS})")));
        }

        let path = PathBuf::from(format!(
            "{}{}{}",
            self.prefix,
            subtype,
            std::env::consts::DLL_SUFFIX
        ));
        let module = self.loader.load(subtype, &path)?;

        match (module.init)(self) {
            Ok(()) => {
                if let Some(library) = module.library {
                    self.modules
                        .lock()
                        .expect("registry lock poisoned")
                        .insert(subtype.to_string(), library);
                }
                Ok(())
            }
            Err(err) => {
                tracing::error!("handler_init failed on {}: {err}", path.display());
                if let Some(library) = module.library {
                    self.retired
                        .lock()
                        .expect("registry lock poisoned")
                        .push(library);
                }
                Err(err)
            }
        }
    }

    /// Remove the handler for `subtype` from the registry, retiring its
    /// loader handle. Callers must have verified no device binds it.
    pub fn unload(&self, subtype: &str) -> Result<()> {
        let mut slots = self.slots.lock().expect("registry lock poisoned");
        let slot = slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|h| h.subtype() == subtype));
        let Some(slot) = slot else {
            tracing::error!("handler {subtype} is not registered");
            return Err(Error::NotFound(subtype.to_string()));
        };
        slots[slot] = None;
        drop(slots);

        if let Some(library) = self
            .modules
            .lock()
            .expect("registry lock poisoned")
            .remove(subtype)
        {
            self.retired
                .lock()
                .expect("registry lock poisoned")
                .push(library);
        }
        tracing::info!("handler {subtype} unregistered, slot={slot}");
        Ok(())
    }

    /// Store a handler in an empty slot. Called by module `handler_init`
    /// entry points.
    pub fn register(&self, handler: Arc<dyn BackendHandler>) -> Result<()> {
        let mut slots = self.slots.lock().expect("registry lock poisoned");

        let mut empty = None;
        for (i, slot) in slots.iter().enumerate() {
            match slot {
                Some(h) if h.subtype() == handler.subtype() => {
                    tracing::error!(
                        "handler {} has already been registered",
                        handler.subtype()
                    );
                    return Err(Error::Exists(handler.subtype().to_string()));
                }
                None if empty.is_none() => empty = Some(i),
                _ => {}
            }
        }

        let Some(slot) = empty else {
            return Err(Error::NoSpace(format!("handler registry full ({MAX_HANDLERS})")));
        };
        tracing::info!("handler {} registered, slot={}", handler.subtype(), slot);
        slots[slot] = Some(handler);
        Ok(())
    }

    /// Find the handler whose subtype matches.
    pub fn find(&self, subtype: &str) -> Option<Arc<dyn BackendHandler>> {
        self.slots
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .flatten()
            .find(|h| h.subtype() == subtype)
            .cloned()
    }

    /// Subtypes currently registered, in slot order.
    pub fn subtypes(&self) -> Vec<String> {
        self.slots
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .flatten()
            .map(|h| h.subtype().to_string())
            .collect()
    }

    /// Validate a device configuration string: shape, a loaded handler
    /// for the subtype, then the handler's own check. The handler's
    /// reason string is logged and dropped regardless of outcome.
    pub fn check_config(&self, cfgstring: &str) -> Result<CfgString> {
        let cfg = CfgString::parse(cfgstring)?;
        let handler = self.find(cfg.subtype()).ok_or_else(|| {
            Error::NoEnt(format!(
                "no handler subtype matches '{}'",
                cfg.subtype()
            ))
        })?;

        if let Err(reason) = handler.check_config(cfg.handler_cfg()) {
            tracing::warn!(
                "handler {} failed check_config({}): {reason}",
                handler.display_name(),
                cfg.handler_cfg()
            );
            return Err(Error::Invalid(format!(
                "bad config for {}: {reason}",
                cfg.subtype()
            )));
        }
        Ok(cfg)
    }

    /// Release the registry. Fails with `busy` while handlers remain.
    pub fn shutdown(&self) -> Result<()> {
        let slots = self.slots.lock().expect("registry lock poisoned");
        if let Some(h) = slots.iter().flatten().next() {
            return Err(Error::Busy(format!(
                "handler {} still registered",
                h.subtype()
            )));
        }
        Ok(())
    }

    fn has_free_slot(&self) -> bool {
        self.slots
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .any(|s| s.is_none())
    }
}
