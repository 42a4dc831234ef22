//! `batch_process`: work through a list of items, reporting progress per item.

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::jobs::{JobContext, TaskError};

/// Arguments of `batch_process`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchArgs {
    pub items: Vec<JsonValue>,
}

fn process_item(index: usize, item: &JsonValue) -> JsonValue {
    json!({ "index": index, "item": item, "status": "processed" })
}

pub(super) async fn batch_process(ctx: JobContext) -> Result<JsonValue, TaskError> {
    let args: BatchArgs = ctx.args_as()?;
    let total = args.items.len() as u64;

    let mut results = Vec::with_capacity(args.items.len());
    for (i, item) in args.items.iter().enumerate() {
        results.push(process_item(i, item));
        ctx.report_progress(i as u64 + 1, total)?;
        ctx.checkpoint(format!("processed {} of {total} items", i + 1))?;
        tokio::task::yield_now().await;
    }

    Ok(json!({ "status": "completed", "results": results }))
}
