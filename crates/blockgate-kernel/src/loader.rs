//! Backend module loading.
//!
//! Loading shared objects is the gateway's only FFI point, so it hides
//! behind the [`ModuleLoader`] trait: [`BuiltinLoader`] resolves handlers
//! compiled into this crate, [`DylibLoader`] opens shared objects through
//! the platform dynamic loader. Either way a module yields a
//! `handler_init` entry point that registers its handlers back into the
//! registry.

use std::path::Path;

use blockgate_types::{Error, Result};

use crate::registry::BackendRegistry;

/// Entry point every backend module exports.
pub type HandlerInit = fn(&BackendRegistry) -> Result<()>;

/// A loaded module: its entry point, plus the loader handle that must stay
/// alive for the handler code to remain mapped.
#[derive(Debug)]
pub struct LoadedModule {
    pub(crate) init: HandlerInit,
    pub(crate) library: Option<libloading::Library>,
}

/// Locates backend modules and resolves their entry points.
pub trait ModuleLoader: Send + Sync {
    /// Load the module for `subtype`, expected at `path`.
    fn load(&self, subtype: &str, path: &Path) -> Result<LoadedModule>;
}

/// Resolves the handlers compiled into this crate (see
/// [`crate::backends`]). Statically linked modules go through the same
/// load/`handler_init`/register sequence as shared objects.
pub struct BuiltinLoader {
    table: Vec<(&'static str, HandlerInit)>,
}

impl BuiltinLoader {
    /// A loader carrying the stock `ram` and `file` handlers.
    pub fn new() -> BuiltinLoader {
        BuiltinLoader {
            table: vec![
                ("ram", crate::backends::ram::handler_init as HandlerInit),
                ("file", crate::backends::file::handler_init as HandlerInit),
            ],
        }
    }

    /// A loader with an explicit module table.
    pub fn with_table(table: Vec<(&'static str, HandlerInit)>) -> BuiltinLoader {
        BuiltinLoader { table }
    }
}

impl Default for BuiltinLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleLoader for BuiltinLoader {
    fn load(&self, subtype: &str, path: &Path) -> Result<LoadedModule> {
        let init = self
            .table
            .iter()
            .find(|(name, _)| *name == subtype)
            .map(|(_, init)| *init)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "could not open handler at {}: no builtin module '{subtype}'",
                    path.display()
                ))
            })?;
        Ok(LoadedModule {
            init,
            library: None,
        })
    }
}

/// Loads backend modules as shared objects.
///
/// A module must be built against the same blockgate-kernel (and
/// compiler) as the gateway; `handler_init` is resolved with the Rust ABI.
pub struct DylibLoader;

impl ModuleLoader for DylibLoader {
    fn load(&self, _subtype: &str, path: &Path) -> Result<LoadedModule> {
        // SAFETY: library initializers run on load; the path is operator
        // supplied, which is the trust model for handler modules.
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| {
            Error::NotFound(format!(
                "could not open handler at {}: {e}",
                path.display()
            ))
        })?;

        // SAFETY: the exported symbol must have the HandlerInit signature;
        // part of the module contract above.
        let init: HandlerInit = unsafe {
            *library.get::<HandlerInit>(b"handler_init").map_err(|e| {
                Error::BadFile(format!(
                    "entry point lookup failed on {}: {e}",
                    path.display()
                ))
            })?
        };

        Ok(LoadedModule {
            init,
            library: Some(library),
        })
    }
}
