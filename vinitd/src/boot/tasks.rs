//! Boot tasks. Each task wraps one subsystem call and decides what is
//! fatal for the boot.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use vinitd_shared::VinitdResult;

use crate::console;
use crate::disk;
use crate::dns;
use crate::etc;
use crate::instance::Vinitd;
use crate::logging;
use crate::mounts;
use crate::net;
use crate::nfs;
use crate::ntp;
use crate::pipeline::PipelineTask;
use crate::power;
use crate::supervisor;
use crate::sysctl;
use crate::vcfg::{self, StdoutMode};

type InitCtx = Arc<Vinitd>;

/// Console first: vtty mode, the log fan-out and the entropy feeder.
pub struct ConsoleTask;

#[async_trait]
impl PipelineTask<InitCtx> for ConsoleTask {
    async fn run(self: Box<Self>, v: InitCtx) -> VinitdResult<()> {
        v.console.setup_vtty(StdoutMode::Default);
        v.console.spawn_log_reader();
        crate::entropy::spawn_entropy_feeder();
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

pub struct MountTask;

#[async_trait]
impl PipelineTask<InitCtx> for MountTask {
    async fn run(self: Box<Self>, _v: InitCtx) -> VinitdResult<()> {
        mounts::setup_basic_directories().map_err(|e| {
            tracing::error!("error prep directories: {}", e);
            e
        })
    }

    fn name(&self) -> &str {
        "mounts"
    }
}

/// Locate the boot disk and decode the image configuration.
pub struct ConfigTask;

#[async_trait]
impl PipelineTask<InitCtx> for ConfigTask {
    async fn run(self: Box<Self>, v: InitCtx) -> VinitdResult<()> {
        let disk = vcfg::boot_disk()?;
        let (cfg, header_args) = vcfg::read_vcfg(&disk).map_err(|e| {
            tracing::warn!("error loading vcfg: {}", e);
            e
        })?;

        let kernel_args = if cfg.system.kernel_args.is_empty() {
            header_args
        } else {
            cfg.system.kernel_args.clone()
        };
        v.read_only
            .store(vcfg::is_read_only(&kernel_args), Ordering::SeqCst);

        *v.disk_name.write() = disk;
        *v.user.write() = cfg.system.user.clone();
        *v.vcfg.write() = cfg;

        Ok(())
    }

    fn name(&self) -> &str {
        "config"
    }
}

/// Remount root with the options for its filesystem. Failure hurts
/// performance but the machine can still run.
pub struct RemountTask;

#[async_trait]
impl PipelineTask<InitCtx> for RemountTask {
    async fn run(self: Box<Self>, v: InitCtx) -> VinitdResult<()> {
        let disk = v.disk_name.read().clone();
        let read_only = v.read_only.load(Ordering::SeqCst);
        if let Err(e) = mounts::setup_mount_options(&disk, read_only) {
            tracing::error!("can not setup mount options: {}", e);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "remount"
    }
}

pub struct GrowDiskTask;

#[async_trait]
impl PipelineTask<InitCtx> for GrowDiskTask {
    async fn run(self: Box<Self>, _v: InitCtx) -> VinitdResult<()> {
        tokio::task::spawn_blocking(disk::grow_disks)
            .await
            .map_err(|e| vinitd_shared::VinitdError::Internal(e.to_string()))?
    }

    fn name(&self) -> &str {
        "grow-disk"
    }
}

/// Arm the power paths and pick the hostname before the parallel setup
/// work starts.
pub struct SetupPrepTask;

#[async_trait]
impl PipelineTask<InitCtx> for SetupPrepTask {
    async fn run(self: Box<Self>, v: InitCtx) -> VinitdResult<()> {
        let stdout_mode = v.vcfg.read().system.stdout_mode;
        tracing::debug!("output mode: {:?}", stdout_mode);
        v.console.setup_vtty(stdout_mode);

        tokio::spawn(power::wait_for_signal(v.clone()));
        power::listen_to_power_event(v.clone());

        if !v.read_only.load(Ordering::SeqCst) {
            power::prep_sbin_power();
        }
        power::disable_cad();

        let disk = v.disk_name.read().clone();
        tokio::task::spawn_blocking(move || disk::change_disk_scheduler(&disk));

        console::print_version();

        let template = v.vcfg.read().hostname_template();
        match net::set_hostname(&template) {
            Ok(hn) => {
                tracing::debug!("set hostname to {}", hn);
                *v.hostname.write() = hn;
            }
            Err(e) => tracing::warn!("could not set hostname: {}", e),
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "setup-prep"
    }
}

pub struct NetworkTask;

#[async_trait]
impl PipelineTask<InitCtx> for NetworkTask {
    async fn run(self: Box<Self>, v: InitCtx) -> VinitdResult<()> {
        net::network_setup(&v).await.map_err(|e| {
            tracing::error!("error setting up network: {}", e);
            e
        })
    }

    fn name(&self) -> &str {
        "network"
    }
}

/// System tunables are best-effort; a rejected sysctl never stops the
/// boot.
pub struct TunablesTask;

#[async_trait]
impl PipelineTask<InitCtx> for TunablesTask {
    async fn run(self: Box<Self>, v: InitCtx) -> VinitdResult<()> {
        let sysctls = v.vcfg.read().sysctl.clone();
        let hostname = v.hostname.read().clone();
        let max_fds = v.vcfg.read().system.max_fds;
        let read_only = v.read_only.load(Ordering::SeqCst);

        let result = tokio::task::spawn_blocking(move || {
            sysctl::system_config(&sysctls, &hostname, max_fds, read_only)
        })
        .await;

        if let Ok(Err(e)) = result {
            tracing::error!("can not setup basic config: {}", e);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "tunables"
    }
}

pub struct EtcTask;

#[async_trait]
impl PipelineTask<InitCtx> for EtcTask {
    async fn run(self: Box<Self>, v: InitCtx) -> VinitdResult<()> {
        if v.read_only.load(Ordering::SeqCst) {
            return Ok(());
        }
        let hostname = v.hostname.read().clone();
        let user = v.user.read().clone();
        etc::etc_generate_files(std::path::Path::new("/etc"), &hostname, &user).map_err(|e| {
            tracing::error!("error creating etc files: {}", e);
            e
        })
    }

    fn name(&self) -> &str {
        "etc"
    }
}

pub struct PrepProgramsTask;

#[async_trait]
impl PipelineTask<InitCtx> for PrepProgramsTask {
    async fn run(self: Box<Self>, v: InitCtx) -> VinitdResult<()> {
        supervisor::prep_programs(&v)
    }

    fn name(&self) -> &str {
        "prep-programs"
    }
}

/// A failed local resolver is only a warning; programs fall back to the
/// upstream servers in resolv.conf.
pub struct DnsTask;

#[async_trait]
impl PipelineTask<InitCtx> for DnsTask {
    async fn run(self: Box<Self>, v: InitCtx) -> VinitdResult<()> {
        if let Err(e) = dns::start_dns(&v, dns::DEFAULT_DNS_ADDR, true).await {
            tracing::warn!("can not start local DNS server: {}", e);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "dns"
    }
}

pub struct NfsTask;

#[async_trait]
impl PipelineTask<InitCtx> for NfsTask {
    async fn run(self: Box<Self>, v: InitCtx) -> VinitdResult<()> {
        let mounts = v.vcfg.read().nfs.clone();
        tokio::task::spawn_blocking(move || nfs::setup_nfs(&mounts))
            .await
            .ok();
        Ok(())
    }

    fn name(&self) -> &str {
        "nfs"
    }
}

pub struct LoggingTask;

#[async_trait]
impl PipelineTask<InitCtx> for LoggingTask {
    async fn run(self: Box<Self>, v: InitCtx) -> VinitdResult<()> {
        if v.vcfg.read().logging.is_empty() {
            return Ok(());
        }
        if v.read_only.load(Ordering::SeqCst) {
            tracing::warn!("filesystem read-only, can not start logging");
            return Ok(());
        }
        tokio::task::spawn_blocking(move || logging::start_logging(&v))
            .await
            .ok();
        Ok(())
    }

    fn name(&self) -> &str {
        "logging"
    }
}

pub struct CloudTask;

#[async_trait]
impl PipelineTask<InitCtx> for CloudTask {
    async fn run(self: Box<Self>, v: InitCtx) -> VinitdResult<()> {
        net::cloud::detect_cloud(&v).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "cloud"
    }
}

pub struct BusyboxTask;

#[async_trait]
impl PipelineTask<InitCtx> for BusyboxTask {
    async fn run(self: Box<Self>, _v: InitCtx) -> VinitdResult<()> {
        tokio::task::spawn_blocking(supervisor::run_busybox_script)
            .await
            .map_err(|e| vinitd_shared::VinitdError::Internal(e.to_string()))?
    }

    fn name(&self) -> &str {
        "busybox"
    }
}

pub struct NtpTask;

#[async_trait]
impl PipelineTask<InitCtx> for NtpTask {
    async fn run(self: Box<Self>, v: InitCtx) -> VinitdResult<()> {
        let ntps = v.vcfg.read().system.ntp.clone();
        tokio::task::spawn_blocking(move || ntp::setup_chronyd(&ntps))
            .await
            .map_err(|e| vinitd_shared::VinitdError::Internal(e.to_string()))?
    }

    fn name(&self) -> &str {
        "ntp"
    }
}

/// Start the workload. The exit listeners come up inside `launch_all`
/// before the first spawn so an early exit is never missed.
pub struct LaunchTask;

#[async_trait]
impl PipelineTask<InitCtx> for LaunchTask {
    async fn run(self: Box<Self>, v: InitCtx) -> VinitdResult<()> {
        v.set_status(crate::instance::InitStatus::Run);

        let count = v.programs.read().len();
        tracing::debug!("starting {} programs", count);

        supervisor::launch_all(&v).await
    }

    fn name(&self) -> &str {
        "launch"
    }
}
