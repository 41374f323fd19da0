//! Online filesystem grow after the partition table has been rewritten.
//!
//! The kernel is told about the resized partition through BLKPG, then the
//! filesystem is extended in place with the format-specific ioctl. The
//! filesystem is identified by sniffing superblock bytes at the partition
//! start.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

use vinitd_shared::{VinitdError, VinitdResult};

use super::gpt::{GptModifier, SECTOR_SIZE};
use crate::vcfg::boot_disk;

const BLKPG: libc::c_ulong = 0x1269;
const BLKPG_RESIZE_PARTITION: libc::c_int = 3;
const BLKFLSBUF: libc::c_ulong = 0x1261;

const EXT4_IOC_RESIZE_FS: libc::c_ulong = 0x4008_6610;
const XFS_IOC_FSGROWFSDATA: libc::c_ulong = 0x4010_586e;
const XFS_IOC_FSGEOMETRY: libc::c_ulong = 0x8100_587e;

/// ext superblock magic at offset 56 of the 1024-byte superblock.
const EXT_SIGNATURE: [u8; 2] = [0x53, 0xef];
const XFS_SIGNATURE: [u8; 4] = *b"XFSB";

#[repr(C)]
struct BlkpgIoctlArg {
    op: libc::c_int,
    flags: libc::c_int,
    datalen: libc::c_int,
    data: *mut libc::c_void,
}

#[repr(C)]
struct BlkpgPartition {
    start: libc::c_longlong,
    length: libc::c_longlong,
    pno: libc::c_int,
    devname: [u8; 64],
    volname: [u8; 64],
}

#[repr(C)]
struct XfsGrowfsData {
    newblocks: u64,
    imaxpct: u32,
}

#[repr(C)]
#[derive(Default)]
struct XfsFsopGeom {
    blocksize: u32,
    rtextsize: u32,
    agblocks: u32,
    agcount: u32,
    logblocks: u32,
    sectsize: u32,
    inodesize: u32,
    imaxpct: u32,
    datablocks: u64,
    rtblocks: u64,
    rtextents: u64,
    logstart: u64,
    uuid: [u8; 16],
    sunit: u32,
    swidth: i32,
    version: u32,
    flags: u32,
    logsectsize: u32,
    rtsectsize: u32,
    dirblocksize: u32,
    logsunit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsFormat {
    Ext,
    Xfs,
    Unknown,
}

/// Sniff the filesystem starting at byte offset `start`.
pub fn detect_format(f: &mut File, start: u64) -> VinitdResult<FsFormat> {
    // ext magic lives at offset 56 of the superblock, 1024 bytes in
    let mut b = [0u8; 2];
    f.seek(SeekFrom::Start(start + 1080))?;
    f.read_exact(&mut b)?;
    if b == EXT_SIGNATURE {
        return Ok(FsFormat::Ext);
    }

    let mut b = [0u8; 4];
    f.seek(SeekFrom::Start(start))?;
    f.read_exact(&mut b)?;
    if b == XFS_SIGNATURE {
        return Ok(FsFormat::Xfs);
    }

    Ok(FsFormat::Unknown)
}

/// Drop the block-device buffers and sync the filesystems on the disk.
pub fn flush_disk(path: &str) {
    if let Ok(f) = File::open(path) {
        unsafe {
            libc::ioctl(f.as_raw_fd(), BLKFLSBUF, 0);
            libc::syscall(libc::SYS_syncfs, f.as_raw_fd());
        }
    }
    unsafe { libc::sync() };
}

/// Grow the boot disk: rewrite the GPT, notify the kernel and extend the
/// root filesystem. A disk that already fills the device is left alone.
pub fn grow_disks() -> VinitdResult<()> {
    let path = boot_disk()?;

    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(&path)?;

    grow_disk(f)?;
    flush_disk(&path);
    Ok(())
}

fn grow_disk(file: File) -> VinitdResult<()> {
    let mut modifier = GptModifier::new(file)?;

    if !modifier.needs_resize() {
        return Ok(());
    }

    modifier.grow()?;

    let (first_lba, last_lba) = {
        let entry = modifier
            .tail_entry()
            .ok_or_else(|| VinitdError::Disk("grow left no tail partition".into()))?;
        (entry.first_lba.get(), entry.last_lba.get())
    };

    let mut file = modifier.into_file();

    notify_partition_resize(&file, first_lba, last_lba)?;

    let root = File::open("/")?;
    let block_size = root_block_size(&root)?;
    let blocks = (last_lba - first_lba) * SECTOR_SIZE / block_size;

    match detect_format(&mut file, first_lba * SECTOR_SIZE)? {
        FsFormat::Ext => {
            tracing::debug!("detected ext filesystem");
            resize_ext(&root, blocks)?;
        }
        FsFormat::Xfs => {
            tracing::debug!("detected xfs filesystem");
            resize_xfs(&root, blocks)?;
        }
        FsFormat::Unknown => {
            // partition is resized, filesystem left untouched
            tracing::debug!("unknown filesystem, skipping online resize");
        }
    }

    Ok(())
}

/// BLKPG with BLKPG_RESIZE_PARTITION; offsets and lengths in bytes,
/// partition number 2 (root is always the second partition).
fn notify_partition_resize(file: &File, first_lba: u64, last_lba: u64) -> VinitdResult<()> {
    let mut part = BlkpgPartition {
        start: (first_lba * SECTOR_SIZE) as libc::c_longlong,
        length: ((last_lba - first_lba) * SECTOR_SIZE) as libc::c_longlong,
        pno: 2,
        devname: [0; 64],
        volname: [0; 64],
    };

    let mut arg = BlkpgIoctlArg {
        op: BLKPG_RESIZE_PARTITION,
        flags: 0,
        datalen: std::mem::size_of::<BlkpgPartition>() as libc::c_int,
        data: &mut part as *mut _ as *mut libc::c_void,
    };

    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKPG, &mut arg) };
    if rc != 0 {
        return Err(VinitdError::Disk(format!(
            "error resizing gpt: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn root_block_size(root: &File) -> VinitdResult<u64> {
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstatfs(root.as_raw_fd(), &mut stat) };
    if rc != 0 {
        return Err(VinitdError::Disk(format!(
            "can not stat root filesystem: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(stat.f_bsize as u64)
}

fn resize_ext(root: &File, blocks: u64) -> VinitdResult<()> {
    let rc = unsafe { libc::ioctl(root.as_raw_fd(), EXT4_IOC_RESIZE_FS, &blocks) };
    if rc != 0 {
        return Err(VinitdError::Disk(format!(
            "error resizing ext filesystem: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn resize_xfs(root: &File, blocks: u64) -> VinitdResult<()> {
    let mut geom = XfsFsopGeom::default();
    let rc = unsafe { libc::ioctl(root.as_raw_fd(), XFS_IOC_FSGEOMETRY, &mut geom) };
    if rc != 0 {
        return Err(VinitdError::Disk(format!(
            "error getting xfs geometry: {}",
            std::io::Error::last_os_error()
        )));
    }

    let grow = XfsGrowfsData {
        newblocks: blocks,
        imaxpct: geom.imaxpct,
    };
    let rc = unsafe { libc::ioctl(root.as_raw_fd(), XFS_IOC_FSGROWFSDATA, &grow) };
    if rc != 0 {
        return Err(VinitdError::Disk(format!(
            "error resizing xfs filesystem: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_with(at: u64, bytes: &[u8], len: u64) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.set_len(len).unwrap();
        f.seek(SeekFrom::Start(at)).unwrap();
        f.write_all(bytes).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f
    }

    #[test]
    fn test_detect_ext() {
        let mut f = file_with(4096 + 1080, &EXT_SIGNATURE, 16384);
        assert_eq!(detect_format(&mut f, 4096).unwrap(), FsFormat::Ext);
    }

    #[test]
    fn test_detect_xfs() {
        let mut f = file_with(4096, &XFS_SIGNATURE, 16384);
        assert_eq!(detect_format(&mut f, 4096).unwrap(), FsFormat::Xfs);
    }

    #[test]
    fn test_detect_unknown() {
        let mut f = file_with(0, b"garbage", 16384);
        assert_eq!(detect_format(&mut f, 0).unwrap(), FsFormat::Unknown);
    }

    #[test]
    fn test_detect_short_file() {
        let mut f = tempfile::tempfile().unwrap();
        assert!(detect_format(&mut f, 0).is_err());
    }
}
