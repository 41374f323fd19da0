//! Boot orchestration.
//!
//! The machine boots through four phases; pre-setup and setup prepare
//! disk, config and system state, post-setup brings up the services that
//! need the network, launch starts the workload:
//!
//! ```text
//! pre-setup  (sequential): console → mounts → config → remount → grow
//! setup      (sequential): power/hostname prep
//!            (parallel)  : network | tunables | /etc
//!            (sequential): program prep
//! post-setup (sequential): local dns
//!            (parallel)  : nfs | logging | cloud | shell | ntp
//! launch     (sequential): subscribe to exits, start programs
//! ```
//!
//! Any task error ends the boot in a panic-shutdown; pid 1 never exits.

mod tasks;

use std::sync::Arc;

use vinitd_shared::VinitdResult;

use crate::console::announce;
use crate::instance::Vinitd;
use crate::pipeline::{BoxedTask, ExecutionPlan, Phase, Pipeline, PipelineExecutor};

use tasks::{
    BusyboxTask, CloudTask, ConfigTask, ConsoleTask, DnsTask, EtcTask, GrowDiskTask, LaunchTask,
    LoggingTask, MountTask, NetworkTask, NfsTask, NtpTask, PrepProgramsTask, RemountTask,
    SetupPrepTask, TunablesTask,
};

type InitCtx = Arc<Vinitd>;

fn execution_plan() -> ExecutionPlan<InitCtx> {
    let phases: Vec<Phase<BoxedTask<InitCtx>>> = vec![
        Phase::sequential(
            "pre-setup",
            vec![
                Box::new(ConsoleTask),
                Box::new(MountTask),
                Box::new(ConfigTask),
                Box::new(RemountTask),
                Box::new(GrowDiskTask),
            ],
        ),
        Phase::sequential("setup", vec![Box::new(SetupPrepTask)]),
        Phase::parallel(
            "system-setup",
            vec![
                Box::new(NetworkTask),
                Box::new(TunablesTask),
                Box::new(EtcTask),
            ],
        ),
        Phase::sequential("prep-programs", vec![Box::new(PrepProgramsTask)]),
        Phase::sequential("dns", vec![Box::new(DnsTask)]),
        Phase::parallel(
            "post-setup",
            vec![
                Box::new(NfsTask),
                Box::new(LoggingTask),
                Box::new(CloudTask),
                Box::new(BusyboxTask),
                Box::new(NtpTask),
            ],
        ),
        Phase::sequential("launch", vec![Box::new(LaunchTask)]),
    ];

    ExecutionPlan::new(phases)
}

/// Run the whole boot. On success the programs are running and the
/// supervisor owns the machine until the last one exits.
pub async fn run(v: InitCtx) -> VinitdResult<()> {
    let pipeline = Pipeline::from_plan(execution_plan());
    let metrics = PipelineExecutor::execute(pipeline, v).await?;

    metrics.log_phases();
    announce(&format!("boot time: {}ms", metrics.total_duration_ms));

    Ok(())
}
