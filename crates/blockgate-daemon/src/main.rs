//! blockgated entry point.
//!
//! Usage:
//!   blockgated                          # mount at /tcmur, builtin handlers
//!   blockgated --mountpoint=/mnt/gate   # mount elsewhere
//!   blockgated --handler-prefix=PATH    # load handler modules as dylibs
//!   blockgated --ctl-name=NAME          # control node name under /dev

mod fuse;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use blockgate_kernel::{
    BuiltinLoader, DylibLoader, Gateway, GatewayConfig, ModuleLoader,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let mut config = GatewayConfig::default();
    let mut dylib_handlers = false;

    for arg in std::env::args().skip(1) {
        if let Some(path) = arg.strip_prefix("--mountpoint=") {
            config.mountpoint = path.to_string();
        } else if let Some(prefix) = arg.strip_prefix("--handler-prefix=") {
            config.handler_prefix = Some(prefix.to_string());
            dylib_handlers = true;
        } else if let Some(name) = arg.strip_prefix("--ctl-name=") {
            config.ctl_name = name.to_string();
        } else if arg == "--dylib-handlers" {
            dylib_handlers = true;
        } else if arg == "--help" || arg == "-h" {
            print_help();
            return Ok(ExitCode::SUCCESS);
        } else if arg == "--version" || arg == "-V" {
            println!("blockgated {}", env!("CARGO_PKG_VERSION"));
            return Ok(ExitCode::SUCCESS);
        } else {
            eprintln!("Unknown option: {arg}");
            eprintln!("Run 'blockgated --help' for usage.");
            return Ok(ExitCode::FAILURE);
        }
    }

    let loader: Box<dyn ModuleLoader> = if dylib_handlers {
        Box::new(DylibLoader)
    } else {
        Box::new(BuiltinLoader::new())
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let gateway = Gateway::new(config.clone(), loader).context("gateway init failed")?;

    prepare_mountpoint(&config.mountpoint)?;

    let adapter = fuse::FuseAdapter::new(gateway.clone(), runtime.handle().clone());
    let options = [
        fuser::MountOption::FSName("blockgate".to_string()),
        fuser::MountOption::Subtype("fnode".to_string()),
        fuser::MountOption::AllowOther,
        fuser::MountOption::AutoUnmount,
        fuser::MountOption::DefaultPermissions,
    ];
    let session = fuser::spawn_mount2(adapter, &config.mountpoint, &options)
        .with_context(|| format!("mount at {} failed", config.mountpoint))?;
    tracing::info!(
        "serving {} (control node /dev/{})",
        config.mountpoint,
        config.ctl_name
    );

    runtime.block_on(wait_for_shutdown(&gateway));

    // Unmount, then tear the gateway down in order.
    drop(session);
    if let Err(err) = gateway.shutdown() {
        tracing::warn!("unclean shutdown: {err}");
    }

    Ok(ExitCode::SUCCESS)
}

async fn wait_for_shutdown(gateway: &Arc<Gateway>) {
    tokio::select! {
        _ = gateway.exited() => {
            tracing::info!("exit requested through the control node");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::warn!("signal wait failed: {err}");
            } else {
                tracing::info!("interrupted");
            }
        }
    }
}

/// Create the mountpoint directory, world-accessible when run as root.
fn prepare_mountpoint(path: &str) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("cannot create mountpoint {path}"))?;
    // SAFETY: geteuid has no preconditions.
    if unsafe { libc::geteuid() } == 0 {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
            .with_context(|| format!("cannot chmod mountpoint {path}"))?;
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"blockgated v{} — block-storage gateway over FUSE

Usage:
  blockgated [OPTIONS]

Options:
  --mountpoint=<path>      Mountpoint (default: /tcmur)
  --ctl-name=<name>        Control node name under /dev (default: tcmur)
  --handler-prefix=<path>  Handler module prefix; implies dylib loading
                           (default: /usr/local/lib/tcmu-runner/handler_)
  --dylib-handlers         Load handler modules as shared objects
  -h, --help               Show this help
  -V, --version            Show version

The control node accepts line-oriented commands; try:
  echo help > /tcmur/dev/tcmur
"#,
        env!("CARGO_PKG_VERSION")
    );
}
