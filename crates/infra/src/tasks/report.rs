//! `generate_pdf`: produce the estimate report and record where it lives.

use estimator_core::{Estimate, EstimateId, EstimatePatch};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info};

use crate::jobs::{JobContext, TaskError};

use super::{TaskDeps, repository_error};

/// Arguments of `generate_pdf`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateReportArgs {
    pub estimate_id: EstimateId,
}

/// Storage path of an estimate's report.
pub fn report_path(id: EstimateId) -> String {
    format!("reports/estimate_{id}.pdf")
}

/// Plain-text body of the report.
pub fn render_report(estimate: &Estimate) -> String {
    let mut out = format!(
        "Estimate {}\nProject: {}\nDescription: {}\nStatus: {:?}\n",
        estimate.id, estimate.project_name, estimate.description, estimate.status
    );
    if let Some(hours) = estimate.labor_hours {
        out.push_str(&format!("Labor hours: {hours}\n"));
    }
    if !estimate.materials.is_empty() {
        out.push_str("Materials:\n");
        for m in &estimate.materials {
            out.push_str(&format!("  - {} x{} {}\n", m.name, m.quantity, m.unit));
        }
    }
    out.push_str(&format!("Total: {:.2}\n", estimate.total_cost));
    out
}

pub(super) async fn generate_pdf(deps: TaskDeps, ctx: JobContext) -> Result<JsonValue, TaskError> {
    let args: GenerateReportArgs = ctx.args_as()?;
    ctx.report_message("Creating PDF...")?;

    let estimate = deps.estimates.fetch(args.estimate_id).map_err(repository_error)?;
    let body = render_report(&estimate);
    let path = report_path(estimate.id);

    // An earlier attempt may have saved the path without recording it.
    if estimate.report_path.as_deref() == Some(path.as_str()) {
        debug!(job_id = %ctx.job_id(), estimate_id = %estimate.id, "report path already recorded");
    } else {
        let patch = EstimatePatch {
            report_path: Some(path.clone()),
            ..Default::default()
        };
        let applied = ctx
            .apply_once("estimate.report_path", || async {
                deps.estimates
                    .update(estimate.id, &patch)
                    .map(|_| ())
                    .map_err(repository_error)
            })
            .await?;
        if applied {
            deps.cache.invalidate(super::ESTIMATE_CACHE_PATTERN);
        }
    }

    info!(job_id = %ctx.job_id(), estimate_id = %estimate.id, pdf_path = %path, "report generated");
    Ok(json!({ "status": "completed", "pdf_path": path, "bytes": body.len() }))
}
