//! Built-in background tasks.

pub mod analysis;
pub mod batch;
pub mod report;

use std::sync::Arc;
use std::time::Duration;

use crate::cache::ResultCache;
use crate::jobs::{JobRunner, TaskError};
use crate::persistence::{EstimateRepository, RepositoryError};

pub use analysis::{
    AnalysisError, AnalyzeImagesArgs, ImageAnalysis, ImageAnalyzer, MockImageAnalyzer, ProcessImageArgs,
};
pub use batch::BatchArgs;
pub use report::GenerateReportArgs;

pub const PROCESS_IMAGE: &str = "process_image";
pub const GENERATE_PDF: &str = "generate_pdf";
pub const BATCH_PROCESS: &str = "batch_process";
pub const ANALYZE_IMAGES: &str = "analyze_images";

/// Cached estimate reads; dropped whenever a task changes an estimate.
pub const ESTIMATE_CACHE_PATTERN: &str = "estimate:*";

/// Collaborators shared by the built-in tasks.
#[derive(Clone)]
pub struct TaskDeps {
    pub cache: Arc<ResultCache>,
    pub estimates: Arc<dyn EstimateRepository>,
    pub analyzer: Arc<dyn ImageAnalyzer>,
    pub analysis_ttl: Duration,
}

/// A missing estimate will not appear on retry; anything else might recover.
pub(crate) fn repository_error(e: RepositoryError) -> TaskError {
    match e {
        RepositoryError::NotFound(_) | RepositoryError::AlreadyExists(_) => {
            TaskError::permanent(e.to_string())
        }
        RepositoryError::Unavailable(_) => TaskError::transient(e.to_string()),
    }
}

/// Register the built-in tasks on `runner`.
pub fn register_builtin_tasks(runner: &JobRunner, deps: TaskDeps) {
    let d = deps.clone();
    runner.register_task(PROCESS_IMAGE, move |ctx| analysis::process_image(d.clone(), ctx));
    let d = deps.clone();
    runner.register_task(ANALYZE_IMAGES, move |ctx| analysis::analyze_images(d.clone(), ctx));
    runner.register_task(GENERATE_PDF, move |ctx| report::generate_pdf(deps.clone(), ctx));
    runner.register_task(BATCH_PROCESS, batch::batch_process);
}
