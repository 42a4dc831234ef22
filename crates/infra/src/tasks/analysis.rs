//! Image analysis tasks.
//!
//! `process_image` analyzes one uploaded image and folds the result into its
//! estimate; `analyze_images` analyzes a set of images concurrently. Both key
//! the analysis cache by the SHA-256 of the image bytes, so a re-upload under
//! a new name reuses the result and new content at an old path does not.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use estimator_core::{Estimate, EstimateId, EstimatePatch, EstimateStatus, MaterialLine};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{ComputeError, KeyArgs};
use crate::jobs::{JobContext, TaskError};

use super::{TaskDeps, repository_error};

/// Cache namespace for analysis results.
pub const ANALYSIS_NAMESPACE: &str = "ai_analysis";

/// Images analyzed at once by `analyze_images`.
pub const BATCH_ANALYSIS_CONCURRENCY: usize = 5;

/// Output of an image analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub materials_detected: Vec<MaterialLine>,
    pub estimated_cost: f64,
    pub confidence: f64,
    /// Seconds the analyzer reported spending.
    pub analysis_time: f64,
}

/// Analyzer error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    /// The analyzer could not be reached or is overloaded.
    #[error("analyzer unavailable: {0}")]
    Unavailable(String),
    /// The image cannot be analyzed.
    #[error("image rejected: {0}")]
    Rejected(String),
}

impl From<ComputeError<AnalysisError>> for TaskError {
    fn from(e: ComputeError<AnalysisError>) -> Self {
        match e {
            ComputeError::Failed(AnalysisError::Rejected(msg)) => TaskError::permanent(msg),
            ComputeError::Failed(AnalysisError::Unavailable(msg)) => TaskError::transient(msg),
            timed_out @ ComputeError::TimedOut(_) => TaskError::transient(timed_out.to_string()),
        }
    }
}

/// Image analysis backend.
#[async_trait]
pub trait ImageAnalyzer: Send + Sync {
    async fn analyze(&self, image_ref: &str) -> Result<ImageAnalysis, AnalysisError>;
}

/// Analyzer returning a fixed electrical-materials result.
#[derive(Debug, Clone, Default)]
pub struct MockImageAnalyzer {
    delay: Duration,
}

impl MockImageAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate analysis latency.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ImageAnalyzer for MockImageAnalyzer {
    async fn analyze(&self, image_ref: &str) -> Result<ImageAnalysis, AnalysisError> {
        if image_ref.trim().is_empty() {
            return Err(AnalysisError::Rejected("empty image reference".to_string()));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let line = |name: &str, quantity, unit: &str| MaterialLine {
            name: name.to_string(),
            quantity,
            unit: unit.to_string(),
        };
        Ok(ImageAnalysis {
            materials_detected: vec![
                line("Electrical Wire (14 AWG)", 250, "feet"),
                line("Outlet Box", 12, "pieces"),
                line("Circuit Breaker (20A)", 3, "pieces"),
            ],
            estimated_cost: 450.0,
            confidence: 0.85,
            analysis_time: 2.3,
        })
    }
}

/// Arguments of `process_image`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessImageArgs {
    pub image_path: String,
    pub estimate_id: EstimateId,
}

/// Arguments of `analyze_images`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeImagesArgs {
    pub image_paths: Vec<String>,
}

/// Hex SHA-256 of the file at `path`.
pub async fn image_digest(path: &str) -> Result<String, TaskError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => TaskError::permanent(format!("image not found: {path}")),
        _ => TaskError::transient(format!("failed to read image {path}: {e}")),
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Analyze one image through the content-keyed cache.
async fn analyze_image(deps: &TaskDeps, image_path: &str) -> Result<ImageAnalysis, TaskError> {
    let digest = image_digest(image_path).await?;
    let analysis = deps
        .cache
        .cache_around(
            ANALYSIS_NAMESPACE,
            deps.analysis_ttl,
            &KeyArgs::new().arg(&digest),
            || deps.analyzer.analyze(image_path),
        )
        .await?;
    Ok(analysis)
}

/// Whether `estimate` already carries `analysis`.
fn holds_analysis(estimate: &Estimate, analysis: &ImageAnalysis) -> bool {
    estimate.status == EstimateStatus::Analyzed
        && estimate.total_cost == analysis.estimated_cost
        && estimate.analysis_confidence == Some(analysis.confidence)
        && estimate.materials == analysis.materials_detected
}

pub(super) async fn process_image(deps: TaskDeps, ctx: JobContext) -> Result<JsonValue, TaskError> {
    let args: ProcessImageArgs = ctx.args_as()?;
    ctx.report_message("Analyzing image...")?;

    // Fail before analyzing if the estimate is gone.
    let current = deps.estimates.fetch(args.estimate_id).map_err(repository_error)?;

    let analysis = analyze_image(&deps, &args.image_path).await?;
    ctx.checkpoint("Analysis finished after soft timeout; saving results")?;

    // An earlier attempt may have saved the analysis without recording it.
    if holds_analysis(&current, &analysis) {
        debug!(job_id = %ctx.job_id(), estimate_id = %args.estimate_id, "estimate already holds this analysis");
    } else {
        let patch = EstimatePatch {
            materials: Some(analysis.materials_detected.clone()),
            total_cost: Some(analysis.estimated_cost),
            analysis_confidence: Some(analysis.confidence),
            status: Some(EstimateStatus::Analyzed),
            ..Default::default()
        };
        let applied = ctx
            .apply_once("estimate.analysis", || async {
                deps.estimates
                    .update(args.estimate_id, &patch)
                    .map(|_| ())
                    .map_err(repository_error)
            })
            .await?;

        if applied {
            deps.cache.invalidate(super::ESTIMATE_CACHE_PATTERN);
        }
    }
    info!(
        job_id = %ctx.job_id(),
        estimate_id = %args.estimate_id,
        confidence = analysis.confidence,
        "image analysis applied"
    );

    Ok(json!({ "status": "completed", "result": analysis }))
}

pub(super) async fn analyze_images(deps: TaskDeps, ctx: JobContext) -> Result<JsonValue, TaskError> {
    let args: AnalyzeImagesArgs = ctx.args_as()?;
    let total = args.image_paths.len();
    ctx.report_progress(0, total as u64)?;

    let permits = Arc::new(Semaphore::new(BATCH_ANALYSIS_CONCURRENCY));
    let mut running = JoinSet::new();
    for (index, path) in args.image_paths.iter().cloned().enumerate() {
        let deps = deps.clone();
        let permits = permits.clone();
        running.spawn(async move {
            let _permit = permits.acquire_owned().await;
            (index, analyze_image(&deps, &path).await)
        });
    }

    let mut results = vec![JsonValue::Null; total];
    let mut done = 0;
    while let Some(joined) = running.join_next().await {
        let (index, outcome) =
            joined.map_err(|e| TaskError::permanent(format!("image analysis aborted: {e}")))?;
        let path = &args.image_paths[index];
        results[index] = match outcome {
            Ok(analysis) => json!({ "image_path": path, "result": analysis }),
            Err(TaskError::Permanent(reason)) => {
                warn!(job_id = %ctx.job_id(), image_path = %path, %reason, "image skipped");
                json!({ "image_path": path, "error": reason })
            }
            // Finished images stay cached for the retry.
            Err(transient) => return Err(transient),
        };
        done += 1;
        ctx.report_progress(done, total as u64)?;
    }
    ctx.checkpoint(format!("analyzed {total} images after soft timeout"))?;

    info!(job_id = %ctx.job_id(), images = total, "batch image analysis finished");
    Ok(json!({ "status": "completed", "results": results }))
}
