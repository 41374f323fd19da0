//! Pseudo-filesystem mounts and the root remount.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::mount::{mount, MsFlags};
use vinitd_shared::{VinitdError, VinitdResult};

use crate::vcfg::shm_size;

/// Mount a kernel filesystem on `target`, creating the mount point when
/// missing. /proc and /sys are expected to exist in the image; their
/// absence is unrecoverable.
pub fn mount_fs(target: &str, fstype: &str, options: &str) -> VinitdResult<()> {
    if !Path::new(target).exists() {
        if target == "/proc" || target == "/sys" {
            return Err(VinitdError::Mount {
                source_fs: fstype.to_string(),
                dest: target.to_string(),
                detail: "mount point does not exist".to_string(),
            });
        }
        std::fs::create_dir_all(target)?;
    }

    let data = if options.is_empty() {
        None
    } else {
        Some(options)
    };

    mount(Some("none"), target, Some(fstype), MsFlags::empty(), data).map_err(|e| {
        VinitdError::Mount {
            source_fs: fstype.to_string(),
            dest: target.to_string(),
            detail: e.to_string(),
        }
    })
}

/// Mount /proc, /sys and /dev/pts and create the /dev/fd symlink.
pub fn setup_basic_directories() -> VinitdResult<()> {
    let _ = std::fs::set_permissions("/tmp", std::fs::Permissions::from_mode(0o777));

    for (target, fstype) in [("/proc", "proc"), ("/sys", "sysfs"), ("/dev/pts", "devpts")] {
        mount_fs(target, fstype, "")?;
    }

    let _ = std::os::unix::fs::symlink("/proc/self/fd", "/dev/fd");

    Ok(())
}

/// Mount the cgroup hierarchy so workloads can use controllers. A
/// controller that refuses to mount is logged and skipped.
pub fn enable_cgroups() -> VinitdResult<()> {
    tracing::debug!("mounting cgroups");

    mount(
        Some("cgroup"),
        "/sys/fs/cgroup",
        Some("tmpfs"),
        MsFlags::empty(),
        Some("uid=0,gid=0,mode=0755"),
    )
    .map_err(|_| VinitdError::Mount {
        source_fs: "tmpfs".to_string(),
        dest: "/sys/fs/cgroup".to_string(),
        detail: "can not mount cgroup".to_string(),
    })?;

    let contents = std::fs::read_to_string("/proc/cgroups")?;
    for name in cgroup_controllers(&contents) {
        let target = format!("/sys/fs/cgroup/{}", name);
        if let Err(e) = std::fs::create_dir_all(&target) {
            tracing::error!("can not create {}: {}", target, e);
            continue;
        }
        if let Err(e) = mount(
            Some("cgroup"),
            target.as_str(),
            Some("cgroup"),
            MsFlags::empty(),
            Some(name.as_str()),
        ) {
            tracing::debug!("can not mount cgroup {}: {}", name, e);
        }
    }

    Ok(())
}

/// Controller names from /proc/cgroups, skipping the comment header.
fn cgroup_controllers(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.split_whitespace().next())
        .map(|s| s.to_string())
        .collect()
}

/// Mount /dev/shm when the kernel command line requests a size.
pub fn setup_shared_memory() -> VinitdResult<()> {
    let cmdline = std::fs::read_to_string("/proc/cmdline")?;
    if let Some(size) = shm_size(&cmdline) {
        mount_fs("/dev/shm", "tmpfs", &format!("size={}", size))?;
    }
    Ok(())
}

/// Filesystem-specific remount options for the root filesystem.
fn root_remount_options(fstype: &str) -> VinitdResult<&'static str> {
    match fstype {
        "ext2" => Ok("barrier=0"),
        "ext4" => Ok("nodiscard,commit=30,inode_readahead_blks=64"),
        "xfs" => Ok("nodiscard,attr2,inode64,noquota"),
        other => Err(VinitdError::Mount {
            source_fs: other.to_string(),
            dest: "/".to_string(),
            detail: format!("unknown filesystem format: {}", other),
        }),
    }
}

/// Filesystem type of the root mount, from /proc/mounts contents.
fn root_fs_type(proc_mounts: &str) -> Option<String> {
    for line in proc_mounts.lines() {
        let mut fields = line.split_whitespace();
        let _dev = fields.next()?;
        let path = fields.next()?;
        let fstype = fields.next()?;
        if path == "/" {
            return Some(fstype.to_string());
        }
    }
    None
}

/// Remount the root filesystem with the performance options for its
/// format. Root is always the second partition of the boot disk.
pub fn setup_mount_options(diskname: &str, read_only: bool) -> VinitdResult<()> {
    let part = format!("{}2", diskname);

    let contents = std::fs::read_to_string("/proc/mounts")?;
    let fstype = root_fs_type(&contents).ok_or_else(|| VinitdError::Mount {
        source_fs: String::new(),
        dest: "/".to_string(),
        detail: "can not find root filesystem".to_string(),
    })?;

    let opts = root_remount_options(&fstype)?;

    let mut flags = MsFlags::MS_REMOUNT | MsFlags::MS_NOATIME | MsFlags::MS_LAZYTIME;
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }

    tracing::debug!(fstype, opts, ?flags, "remounting root from {}", part);

    mount(
        Some(part.as_str()),
        "/",
        Some(fstype.as_str()),
        flags,
        Some(opts),
    )
    .map_err(|e| VinitdError::Mount {
        source_fs: fstype,
        dest: "/".to_string(),
        detail: e.to_string(),
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_fs_type() {
        let mounts = "\
/dev/root / ext4 rw,relatime 0 0
proc /proc proc rw 0 0
sysfs /sys sysfs rw 0 0
";
        assert_eq!(root_fs_type(mounts).as_deref(), Some("ext4"));
        assert_eq!(root_fs_type("proc /proc proc rw 0 0\n"), None);
        assert_eq!(root_fs_type(""), None);
    }

    #[test]
    fn test_root_remount_options() {
        assert_eq!(root_remount_options("ext2").unwrap(), "barrier=0");
        assert!(root_remount_options("ext4").unwrap().contains("commit=30"));
        assert!(root_remount_options("xfs").unwrap().contains("inode64"));
        assert!(root_remount_options("btrfs").is_err());
    }

    #[test]
    fn test_cgroup_controllers() {
        let contents = "\
#subsys_name\thierarchy\tnum_cgroups\tenabled
cpuset\t0\t1\t1
cpu\t0\t1\t1
memory\t0\t1\t1
";
        assert_eq!(cgroup_controllers(contents), vec!["cpuset", "cpu", "memory"]);
    }
}
