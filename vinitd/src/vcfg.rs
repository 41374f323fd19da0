//! On-disk image configuration.
//!
//! The bootloader writes a packed header 34 sectors into the boot disk. It
//! carries the kernel arguments and the offset/length of a JSON blob that
//! deserializes into [`Vcfg`]. The kernel exports the boot device path as
//! plain text in /proc/bootdev.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::str::FromStr;

use nix::sys::signal::Signal;
use serde::Deserialize;
use vinitd_shared::{VinitdError, VinitdResult};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::util::terminated_null_string;

pub const SECTOR_SIZE: u64 = 512;

/// The bootloader config lives 34 sectors into the disk.
pub const VCFG_OFFSET: u64 = SECTOR_SIZE * 34;

const BOOTDEV: &str = "/proc/bootdev";

/// Packed bootloader header at [`VCFG_OFFSET`].
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BootloaderConfig {
    pub version: [u8; 16],
    pub reserved_a: [u8; 12],
    pub preload_sectors: U32,
    pub kernel_args_len: U16,
    pub reserved_b: [u8; 222],
    pub kernel_args: [u8; 256],
    pub config_offset: U32,
    pub config_len: U32,
}

pub const BOOTLOADER_CONFIG_SIZE: usize = 520;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdoutMode {
    #[default]
    Default,
    Screen,
    Serial,
    Disabled,
    All,
}

impl StdoutMode {
    /// Mode value understood by the vtty output ioctl.
    pub fn ioctl_value(self) -> u32 {
        match self {
            StdoutMode::Default => 0,
            StdoutMode::Screen => 1,
            StdoutMode::Serial => 2,
            StdoutMode::Disabled => 3,
            StdoutMode::All => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    Root,
    Superuser,
    #[default]
    User,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SystemCfg {
    pub user: String,
    pub hostname: String,
    pub dns: Vec<String>,
    #[serde(rename = "stdout-mode")]
    pub stdout_mode: StdoutMode,
    #[serde(rename = "max-fds")]
    pub max_fds: u32,
    /// Grace period in milliseconds between terminate signals and kill.
    #[serde(rename = "terminate-wait")]
    pub terminate_wait: u64,
    pub ntp: Vec<String>,
    #[serde(rename = "kernel-args")]
    pub kernel_args: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkCfg {
    pub ip: String,
    pub mask: String,
    pub gateway: String,
    pub mtu: u32,
    #[serde(rename = "disable-tso")]
    pub disable_tso: bool,
    pub tcpdump: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouteCfg {
    pub destination: String,
    pub gateway: String,
    pub interface: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProgramCfg {
    pub binary: String,
    pub cwd: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub privilege: Privilege,
    pub strace: bool,
    pub bootstrap: Vec<String>,
    #[serde(rename = "log-files")]
    pub log_files: Vec<String>,
    pub terminate: String,
}

impl ProgramCfg {
    /// Signal sent on shutdown; defaults to SIGTERM when unset or unknown.
    pub fn terminate_signal(&self) -> Signal {
        if self.terminate.is_empty() {
            return Signal::SIGTERM;
        }
        let name = if self.terminate.starts_with("SIG") {
            self.terminate.clone()
        } else {
            format!("SIG{}", self.terminate)
        };
        Signal::from_str(&name).unwrap_or(Signal::SIGTERM)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingCfg {
    #[serde(rename = "type")]
    pub log_type: String,
    pub config: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NfsCfg {
    pub server: String,
    #[serde(rename = "mount-point")]
    pub mount_point: String,
    pub arguments: String,
}

/// Parsed image configuration. Read once during pre-setup, shared
/// read-only afterwards.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Vcfg {
    pub system: SystemCfg,
    pub networks: Vec<NetworkCfg>,
    pub routing: Vec<RouteCfg>,
    pub programs: Vec<ProgramCfg>,
    pub logging: Vec<LoggingCfg>,
    pub nfs: Vec<NfsCfg>,
    pub sysctl: HashMap<String, String>,
}

impl Vcfg {
    /// Hostname template from the config; programs fall back to a salted
    /// default so every instance gets a valid, unique name.
    pub fn hostname_template(&self) -> String {
        if self.system.hostname.is_empty() {
            "vorteil-$SALT".to_string()
        } else {
            self.system.hostname.clone()
        }
    }
}

/// Boot device path as exported by the kernel.
pub fn boot_disk() -> VinitdResult<String> {
    let s = std::fs::read_to_string(BOOTDEV)
        .map_err(|e| VinitdError::Config(format!("can not read {}: {}", BOOTDEV, e)))?;
    Ok(s.trim().to_string())
}

/// Check the kernel arguments for the read-only token.
pub fn is_read_only(kernel_args: &str) -> bool {
    kernel_args.split_whitespace().any(|o| o == "ro")
}

/// Extract `shm=<size>` from the kernel command line, if present.
pub fn shm_size(cmdline: &str) -> Option<String> {
    cmdline
        .split_whitespace()
        .find_map(|tok| tok.strip_prefix("shm=").map(|s| s.to_string()))
}

/// Read the bootloader header and the embedded JSON configuration from the
/// boot disk. Short reads, bad offsets and JSON errors are all fatal.
pub fn read_vcfg(disk: &str) -> VinitdResult<(Vcfg, String)> {
    tracing::debug!(disk, "reading vcfg from disk");

    let mut f = File::open(disk)?;

    let off = f.seek(SeekFrom::Start(VCFG_OFFSET))?;
    if off != VCFG_OFFSET {
        return Err(VinitdError::Config("can not read vcfg, wrong offset".into()));
    }

    let mut hdr = [0u8; BOOTLOADER_CONFIG_SIZE];
    f.read_exact(&mut hdr)?;

    let blc = BootloaderConfig::ref_from_bytes(&hdr)
        .map_err(|_| VinitdError::Config("bootloader config header malformed".into()))?;

    let kernel_args = terminated_null_string(&blc.kernel_args);
    tracing::debug!(kernel_args, "bootloader kernel args");

    let cfg_off = VCFG_OFFSET + u64::from(blc.config_offset.get());
    let cfg_len = blc.config_len.get() as usize;
    tracing::debug!(offset = cfg_off, len = cfg_len, "config location");

    f.seek(SeekFrom::Start(cfg_off))?;
    let mut vb = vec![0u8; cfg_len];
    f.read_exact(&mut vb)?;

    let vcfg: Vcfg = serde_json::from_slice(&vb)
        .map_err(|e| VinitdError::Config(format!("can not parse vcfg: {}", e)))?;

    Ok((vcfg, kernel_args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_bootloader_config_layout() {
        assert_eq!(
            std::mem::size_of::<BootloaderConfig>(),
            BOOTLOADER_CONFIG_SIZE
        );
    }

    fn write_test_image(json: &str) -> tempfile::NamedTempFile {
        let mut blc = BootloaderConfig {
            version: [0; 16],
            reserved_a: [0; 12],
            preload_sectors: U32::new(0),
            kernel_args_len: U16::new(0),
            reserved_b: [0; 222],
            kernel_args: [0; 256],
            config_offset: U32::new(0x1000),
            config_len: U32::new(json.len() as u32),
        };
        blc.version[..4].copy_from_slice(b"test");
        let args = b"console=ttyS0 ro";
        blc.kernel_args[..args.len()].copy_from_slice(args);
        blc.kernel_args_len = U16::new(args.len() as u16);

        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; VCFG_OFFSET as usize]).unwrap();
        f.write_all(blc.as_bytes()).unwrap();
        let pad = 0x1000 - BOOTLOADER_CONFIG_SIZE;
        f.write_all(&vec![0u8; pad]).unwrap();
        f.write_all(json.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_read_vcfg_roundtrip() {
        let json = r#"{
            "system": {
                "user": "app",
                "hostname": "box-$SALT",
                "dns": ["8.8.8.8"],
                "max-fds": 2048,
                "terminate-wait": 5000,
                "kernel-args": "console=ttyS0 ro"
            },
            "networks": [
                {"ip": "dhcp", "mtu": 1500}
            ],
            "programs": [
                {"binary": "/bin/app", "args": ["-v"], "privilege": "superuser",
                 "terminate": "SIGINT", "bootstrap": ["SLEEP 100"]}
            ],
            "sysctl": {"net.core.somaxconn": "1024"}
        }"#;

        let f = write_test_image(json);
        let (vcfg, kargs) = read_vcfg(f.path().to_str().unwrap()).unwrap();

        assert_eq!(kargs, "console=ttyS0 ro");
        assert_eq!(vcfg.system.user, "app");
        assert_eq!(vcfg.system.max_fds, 2048);
        assert_eq!(vcfg.system.terminate_wait, 5000);
        assert_eq!(vcfg.networks.len(), 1);
        assert_eq!(vcfg.networks[0].ip, "dhcp");
        assert_eq!(vcfg.programs.len(), 1);
        assert_eq!(vcfg.programs[0].terminate_signal(), Signal::SIGINT);
        assert_eq!(vcfg.programs[0].privilege, Privilege::Superuser);
        assert_eq!(
            vcfg.sysctl.get("net.core.somaxconn").map(String::as_str),
            Some("1024")
        );
        assert!(is_read_only(&vcfg.system.kernel_args));
    }

    #[test]
    fn test_read_vcfg_bad_json() {
        let f = write_test_image("{not json");
        assert!(read_vcfg(f.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_read_vcfg_missing_file() {
        assert!(read_vcfg("/does/not/exist").is_err());
    }

    #[test]
    fn test_read_only_token() {
        assert!(is_read_only("console=ttyS0 ro quiet"));
        assert!(!is_read_only("console=ttyS0 root=/dev/sda2"));
        assert!(!is_read_only(""));
    }

    #[test]
    fn test_shm_size() {
        assert_eq!(shm_size("quiet shm=256m ro"), Some("256m".to_string()));
        assert_eq!(shm_size("quiet ro"), None);
    }

    #[test]
    fn test_terminate_signal_defaults() {
        let p = ProgramCfg::default();
        assert_eq!(p.terminate_signal(), Signal::SIGTERM);

        let p = ProgramCfg {
            terminate: "KILL".into(),
            ..Default::default()
        };
        assert_eq!(p.terminate_signal(), Signal::SIGKILL);

        let p = ProgramCfg {
            terminate: "bogus".into(),
            ..Default::default()
        };
        assert_eq!(p.terminate_signal(), Signal::SIGTERM);
    }

    #[test]
    fn test_hostname_template_default() {
        let v = Vcfg::default();
        assert_eq!(v.hostname_template(), "vorteil-$SALT");
    }
}
