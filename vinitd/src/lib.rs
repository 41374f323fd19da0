//! vinitd - init process for micro-VMs.
//!
//! The kernel starts this binary as pid 1. It boots the machine through
//! a four-phase pipeline (pre-setup, setup, post-setup, launch),
//! supervises the declared programs for the lifetime of the VM, and
//! powers the machine off when the last program exits, a power event
//! arrives, or it is invoked through its poweroff/reboot aliases.

pub mod boot;
pub mod console;
pub mod disk;
pub mod dns;
pub mod entropy;
pub mod etc;
pub mod instance;
pub mod logging;
pub mod mounts;
pub mod net;
pub mod nfs;
pub mod ntp;
pub mod pipeline;
pub mod power;
pub mod supervisor;
pub mod sysctl;
pub mod util;
pub mod vcfg;

pub use instance::Vinitd;
pub use vinitd_shared::{VinitdError, VinitdResult};
