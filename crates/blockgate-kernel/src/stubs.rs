//! Neutral stubs for richer-host entry points.
//!
//! Handler modules built against a SCSI-capable host may carry code that
//! references these entry points, even though that code only runs for
//! command paths this gateway never drives. They resolve here instead of
//! failing the load: each stub returns a neutral value, and logs a
//! backtrace on its first two invocations so a caller that does show up
//! is noticed, then goes silent.

use crate::devices::Device;

macro_rules! stub_warn {
    ($name:literal) => {{
        use std::sync::atomic::{AtomicU32, Ordering};
        static CALLS: AtomicU32 = AtomicU32::new(0);
        if CALLS.fetch_add(1, Ordering::Relaxed) < 2 {
            tracing::warn!(
                "unexpected call to {}\n{}",
                $name,
                std::backtrace::Backtrace::force_capture()
            );
        }
    }};
}

pub fn dev_get_opt_unmap_gran(_dev: &Device) -> u32 {
    stub_warn!("dev_get_opt_unmap_gran");
    0
}

pub fn dev_get_unmap_enabled(_dev: &Device) -> bool {
    stub_warn!("dev_get_unmap_enabled");
    false
}

pub fn dev_get_unmap_gran_align(_dev: &Device) -> u32 {
    stub_warn!("dev_get_unmap_gran_align");
    0
}

pub fn dev_set_max_unmap_len(_dev: &Device, _len: u32) {
    stub_warn!("dev_set_max_unmap_len");
}

pub fn dev_set_opt_unmap_gran(_dev: &Device, _len: u32, _split: bool) {
    stub_warn!("dev_set_opt_unmap_gran");
}

pub fn dev_set_opt_xcopy_rw_len(_dev: &Device, _len: u32) {
    stub_warn!("dev_set_opt_xcopy_rw_len");
}

pub fn cfgfs_dev_get_wwn(_dev: &Device) -> Option<String> {
    stub_warn!("cfgfs_dev_get_wwn");
    None
}

pub fn cfgfs_dev_get_info_u64(_dev: &Device, _name: &str) -> u64 {
    stub_warn!("cfgfs_dev_get_info_u64");
    0
}

pub fn handle_caw(_dev: &Device) -> i32 {
    stub_warn!("handle_caw");
    -1
}

pub fn handle_writesame(_dev: &Device) -> i32 {
    stub_warn!("handle_writesame");
    -1
}

pub fn notify_lock_lost(_dev: &Device) {
    stub_warn!("notify_lock_lost");
}

pub fn notify_conn_lost(_dev: &Device) {
    stub_warn!("notify_conn_lost");
}

pub fn make_absolute_logfile(_path: &str) -> i32 {
    stub_warn!("make_absolute_logfile");
    -1
}

pub fn dev_get_solid_state_media(_dev: &Device) -> bool {
    stub_warn!("dev_get_solid_state_media");
    false
}

pub fn dev_set_solid_state_media(_dev: &Device, _solid_state: bool) {
    stub_warn!("dev_set_solid_state_media");
}

pub fn dev_update_size(_dev: &Device, _new_size: u64) -> i32 {
    stub_warn!("dev_update_size");
    -1
}
