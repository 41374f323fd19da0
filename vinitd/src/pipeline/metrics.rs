use crate::pipeline::ExecutionMode;

#[derive(Debug, Clone)]
pub struct TaskMetrics {
    pub name: String,
    pub duration_ms: u128,
}

#[derive(Debug, Clone)]
pub struct PhaseMetrics {
    pub name: &'static str,
    pub execution: ExecutionMode,
    pub duration_ms: u128,
    pub tasks: Vec<TaskMetrics>,
}

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_duration_ms: u128,
    pub phases: Vec<PhaseMetrics>,
}

impl PipelineMetrics {
    pub fn task_duration_ms(&self, name: &str) -> Option<u128> {
        self.phases
            .iter()
            .flat_map(|phase| phase.tasks.iter())
            .find(|task| task.name == name)
            .map(|task| task.duration_ms)
    }

    /// One debug line per phase for the boot summary.
    pub fn log_phases(&self) {
        for phase in &self.phases {
            tracing::debug!(
                "phase {} finished in {} ms ({} tasks)",
                phase.name,
                phase.duration_ms,
                phase.tasks.len()
            );
        }
    }
}
