//! Pipeline executor.

use std::time::Instant;

use futures::future::try_join_all;
use vinitd_shared::{VinitdError, VinitdResult};

use super::metrics::{PhaseMetrics, PipelineMetrics, TaskMetrics};
use super::stage::{ExecutionMode, Phase};
use super::task::BoxedTask;

pub struct ExecutionPlan<Ctx> {
    phases: Vec<Phase<BoxedTask<Ctx>>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(phases: Vec<Phase<BoxedTask<Ctx>>>) -> Self {
        Self { phases }
    }
}

pub struct Pipeline<Ctx> {
    phases: Vec<Phase<BoxedTask<Ctx>>>,
}

impl<Ctx> Pipeline<Ctx> {
    pub fn from_plan(plan: ExecutionPlan<Ctx>) -> Pipeline<Ctx> {
        Pipeline {
            phases: plan.phases,
        }
    }
}

/// Executes phases in order; within a phase, tasks run according to the
/// phase's mode. A parallel phase joins fail-fast: the first task error
/// aborts the join and surfaces as the pipeline result. Sibling tasks
/// are not cancelled; a fatal error ends in reboot anyway.
pub struct PipelineExecutor;

impl PipelineExecutor {
    pub async fn execute<Ctx>(pipeline: Pipeline<Ctx>, ctx: Ctx) -> VinitdResult<PipelineMetrics>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut phase_metrics = Vec::new();

        for phase in pipeline.phases.into_iter() {
            tracing::debug!("starting phase {}", phase.name);
            let phase_start = Instant::now();
            let name = phase.name;
            let execution = phase.execution;

            let task_metrics = match execution {
                ExecutionMode::Parallel => {
                    let futures = phase.tasks.into_iter().map(|task| {
                        let ctx = ctx.clone();
                        async move {
                            let name = task.name().to_string();
                            let task_start = Instant::now();
                            task.run(ctx).await.map_err(|e| {
                                tracing::error!("task {} failed: {}", name, e);
                                e
                            })?;
                            Ok::<TaskMetrics, VinitdError>(TaskMetrics {
                                name,
                                duration_ms: task_start.elapsed().as_millis(),
                            })
                        }
                    });
                    try_join_all(futures).await?
                }
                ExecutionMode::Sequential => {
                    let mut task_metrics = Vec::new();
                    for task in phase.tasks {
                        let name = task.name().to_string();
                        let task_start = Instant::now();
                        task.run(ctx.clone()).await.map_err(|e| {
                            tracing::error!("task {} failed: {}", name, e);
                            e
                        })?;
                        task_metrics.push(TaskMetrics {
                            name,
                            duration_ms: task_start.elapsed().as_millis(),
                        });
                    }
                    task_metrics
                }
            };

            phase_metrics.push(PhaseMetrics {
                name,
                execution,
                duration_ms: phase_start.elapsed().as_millis(),
                tasks: task_metrics,
            });
        }

        Ok(PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            phases: phase_metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineTask;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountTask(Arc<AtomicUsize>);

    #[async_trait]
    impl PipelineTask<()> for CountTask {
        async fn run(self: Box<Self>, _ctx: ()) -> VinitdResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "count"
        }
    }

    struct FailTask;

    #[async_trait]
    impl PipelineTask<()> for FailTask {
        async fn run(self: Box<Self>, _ctx: ()) -> VinitdResult<()> {
            Err(VinitdError::Internal("boom".into()))
        }

        fn name(&self) -> &str {
            "fail"
        }
    }

    #[tokio::test]
    async fn test_all_phases_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        let plan = ExecutionPlan::new(vec![
            Phase::sequential("one", vec![Box::new(CountTask(counter.clone())) as _]),
            Phase::parallel(
                "two",
                vec![
                    Box::new(CountTask(counter.clone())) as _,
                    Box::new(CountTask(counter.clone())) as _,
                ],
            ),
        ]);

        let metrics = PipelineExecutor::execute(Pipeline::from_plan(plan), ())
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.phases.len(), 2);
        assert!(metrics.task_duration_ms("count").is_some());
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_pipeline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let plan = ExecutionPlan::new(vec![
            Phase::parallel(
                "one",
                vec![
                    Box::new(FailTask) as _,
                    Box::new(CountTask(counter.clone())) as _,
                ],
            ),
            Phase::sequential("never", vec![Box::new(CountTask(counter.clone())) as _]),
        ]);

        let result = PipelineExecutor::execute(Pipeline::from_plan(plan), ()).await;
        assert!(result.is_err());
        // the second phase never ran
        assert!(counter.load(Ordering::SeqCst) <= 1);
    }
}
