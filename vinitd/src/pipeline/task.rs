//! Task trait for pipeline execution.

use async_trait::async_trait;
use vinitd_shared::VinitdResult;

/// One unit of boot work. Tasks share a cloneable context and report
/// fatal errors by returning them; the executor aborts the run on the
/// first error.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> VinitdResult<()>;

    /// Human-readable task name for logging.
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;
