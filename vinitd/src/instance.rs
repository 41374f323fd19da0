//! Process-wide instance state.
//!
//! One [`Vinitd`] value is created in `main` and threaded through every
//! subsystem as `Arc<Vinitd>`. Each mutable field has a single writing
//! component; readers only observe after a phase join.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use nix::sys::signal::Signal;
use parking_lot::{Mutex, RwLock};
use vinitd_shared::VinitdResult;

use crate::console::Console;
use crate::supervisor::bootstrap::{self, BootstrapStep};
use crate::vcfg::{ProgramCfg, Vcfg};

pub const ROOT_ID: u32 = 0;
pub const USER_ID: u32 = 1000;
pub const DEFAULT_TTY: &str = "/dev/vtty";
pub const DEFAULT_CWD: &str = "/";

pub const ENV_HYPERVISOR: &str = "HYPERVISOR";
pub const ENV_CLOUD_PROVIDER: &str = "CLOUD_PROVIDER";
pub const ENV_ETH_COUNT: &str = "ETH_COUNT";
pub const ENV_HOSTNAME: &str = "HOSTNAME";
pub const ENV_EXT_HOSTNAME: &str = "EXT_HOSTNAME";
pub const ENV_USERDATA: &str = "USERDATA";
pub const ENV_INSTANCE_ID: &str = "INSTANCE_ID";

/// `IP<n>` / `EXT_IP<n>` per interface index.
pub fn env_ip(idx: usize) -> String {
    format!("IP{}", idx)
}

pub fn env_ext_ip(idx: usize) -> String {
    format!("EXT_IP{}", idx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InitStatus {
    Setup = 0,
    Run = 1,
    Launched = 2,
    Poweroff = 3,
}

impl InitStatus {
    fn from_u8(v: u8) -> InitStatus {
        match v {
            0 => InitStatus::Setup,
            1 => InitStatus::Run,
            2 => InitStatus::Launched,
            _ => InitStatus::Poweroff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hypervisor {
    #[default]
    Unknown,
    Kvm,
    Vmware,
    Hyperv,
    Virtualbox,
    Xen,
}

impl Hypervisor {
    pub fn as_str(self) -> &'static str {
        match self {
            Hypervisor::Unknown => "UNKNOWN",
            Hypervisor::Kvm => "KVM",
            Hypervisor::Vmware => "VMWARE",
            Hypervisor::Hyperv => "HYPERV",
            Hypervisor::Virtualbox => "VIRTUALBOX",
            Hypervisor::Xen => "XEN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cloud {
    #[default]
    Unknown,
    None,
    Gcp,
    Ec2,
    Azure,
}

impl Cloud {
    pub fn as_str(self) -> &'static str {
        match self {
            Cloud::Unknown => "UNKNOWN",
            Cloud::None => "NONE",
            Cloud::Gcp => "GCP",
            Cloud::Ec2 => "EC2",
            Cloud::Azure => "AZURE",
        }
    }
}

/// Hypervisor and cloud detection results plus the runtime environment
/// variables exposed to programs.
#[derive(Debug, Default)]
pub struct HypervisorInfo {
    pub hypervisor: Hypervisor,
    pub cloud: Cloud,
    pub envs: HashMap<String, String>,
}

/// One configured NIC. `idx` matches the position in `Vinitd::ifcs` and
/// selects the `vcfg.networks[idx]` settings; `name` is the synthetic
/// `eth<idx>` name.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub idx: usize,
    pub kernel_name: String,
    pub kernel_index: u32,
    pub mac: [u8; 6],
    pub addr: Option<Ipv4Addr>,
    pub mask: Option<Ipv4Addr>,
    pub gw: Option<Ipv4Addr>,
}

#[derive(Debug, Default)]
pub struct ProgramState {
    pub path: String,
    pub env: Vec<String>,
    pub args: Vec<String>,
    pub pid: Option<i32>,
}

/// One supervised program. The declared config is immutable; launch state
/// lives behind the mutex. Once `pid` is set it never changes; `reaped`
/// transitions false to true at most once. Bootstrap instructions are
/// parsed here so malformed ones fail the setup phase, not the launch.
pub struct Program {
    pub index: usize,
    pub cfg: ProgramCfg,
    pub terminate: Signal,
    pub bootstrap: Vec<BootstrapStep>,
    pub state: Mutex<ProgramState>,
    pub exited: AtomicBool,
    pub reaped: AtomicBool,
}

impl Program {
    pub fn new(index: usize, cfg: ProgramCfg) -> VinitdResult<Program> {
        let terminate = cfg.terminate_signal();
        let bootstrap = cfg
            .bootstrap
            .iter()
            .map(|line| bootstrap::parse(line))
            .collect::<VinitdResult<Vec<BootstrapStep>>>()?;
        Ok(Program {
            index,
            cfg,
            terminate,
            bootstrap,
            state: Mutex::new(ProgramState::default()),
            exited: AtomicBool::new(false),
            reaped: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> Option<i32> {
        self.state.lock().pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn mark_reaped(&self) {
        self.reaped.store(true, Ordering::SeqCst);
        self.exited.store(true, Ordering::SeqCst);
    }
}

/// The init instance. Created once at startup, frozen once the machine
/// enters `Poweroff`.
pub struct Vinitd {
    pub disk_name: RwLock<String>,
    pub hostname: RwLock<String>,
    pub user: RwLock<String>,
    pub vcfg: RwLock<Vcfg>,
    pub hypervisor_info: Mutex<HypervisorInfo>,
    pub ifcs: Mutex<Vec<Interface>>,
    pub dns: Mutex<Vec<Ipv4Addr>>,
    pub programs: RwLock<Vec<Arc<Program>>>,
    pub console: Console,
    pub read_only: AtomicBool,
    pub instant_shutdown: AtomicBool,
    pub is_firecracker: AtomicBool,
    status: AtomicU8,
}

impl Vinitd {
    pub fn new() -> Arc<Vinitd> {
        Arc::new(Vinitd {
            disk_name: RwLock::new(String::new()),
            hostname: RwLock::new(String::new()),
            user: RwLock::new(String::new()),
            vcfg: RwLock::new(Vcfg::default()),
            hypervisor_info: Mutex::new(HypervisorInfo::default()),
            ifcs: Mutex::new(Vec::new()),
            dns: Mutex::new(Vec::new()),
            programs: RwLock::new(Vec::new()),
            console: Console::new(),
            read_only: AtomicBool::new(false),
            instant_shutdown: AtomicBool::new(false),
            is_firecracker: AtomicBool::new(false),
            status: AtomicU8::new(InitStatus::Setup as u8),
        })
    }

    pub fn status(&self) -> InitStatus {
        InitStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, s: InitStatus) {
        self.status.store(s as u8, Ordering::SeqCst);
    }

    /// Transition into `Poweroff`. Returns false if the machine is already
    /// powering off, which makes the shutdown path run exactly once.
    pub fn try_enter_poweroff(&self) -> bool {
        let prev = self.status.swap(InitStatus::Poweroff as u8, Ordering::SeqCst);
        prev != InitStatus::Poweroff as u8
    }

    pub fn set_env(&self, key: &str, value: &str) {
        self.hypervisor_info
            .lock()
            .envs
            .insert(key.to_string(), value.to_string());
    }

    pub fn envs_snapshot(&self) -> HashMap<String, String> {
        self.hypervisor_info.lock().envs.clone()
    }

    pub fn eth_count(&self) -> usize {
        self.ifcs.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poweroff_transition_runs_once() {
        let v = Vinitd::new();
        assert_eq!(v.status(), InitStatus::Setup);
        assert!(v.try_enter_poweroff());
        assert_eq!(v.status(), InitStatus::Poweroff);
        // subsequent attempts are no-ops
        assert!(!v.try_enter_poweroff());
        assert!(!v.try_enter_poweroff());
    }

    #[test]
    fn test_status_ordering() {
        let v = Vinitd::new();
        v.set_status(InitStatus::Run);
        assert_eq!(v.status(), InitStatus::Run);
        v.set_status(InitStatus::Launched);
        assert_eq!(v.status(), InitStatus::Launched);
    }

    #[test]
    fn test_program_reap_marks_exit() {
        let p = Program::new(0, ProgramCfg::default()).unwrap();
        assert!(!p.has_exited());
        p.mark_reaped();
        assert!(p.has_exited());
        assert!(p.reaped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_program_rejects_bad_bootstrap() {
        let cfg = ProgramCfg {
            bootstrap: vec!["FROBNICATE now".to_string()],
            ..Default::default()
        };
        assert!(Program::new(0, cfg).is_err());
    }

    #[test]
    fn test_env_names() {
        assert_eq!(env_ip(0), "IP0");
        assert_eq!(env_ext_ip(3), "EXT_IP3");
    }
}
