//! Boot-disk management: partition-table grow and filesystem resize.

pub mod gpt;
pub mod grow;

pub use grow::{flush_disk, grow_disks};

/// Switch the boot disk to the noop scheduler; a virtual disk gains
/// nothing from request reordering.
pub fn change_disk_scheduler(vdisk: &str) {
    // path is always /dev/<name>
    let Some(disk) = vdisk.trim().strip_prefix("/dev/") else {
        return;
    };
    let path = format!("/sys/block/{}/queue/scheduler", disk);
    if let Err(e) = std::fs::write(&path, "noop") {
        tracing::debug!("can not set disk scheduler on {}: {}", path, e);
    }
}
