use anyhow::{Context, Result};
use arrow::util::pretty::pretty_format_batches;
use compactor::columnar;

use crate::common::StoreContext;

/// Render every row of a columnar target as a table
pub async fn cat_command(ctx: &StoreContext, target: &str) -> Result<String> {
    let store = ctx.store()?;
    let data = store
        .read_all(target)
        .await
        .with_context(|| format!("Failed to read {target}"))?;
    let contents = columnar::read(data)?;

    let batches: Vec<_> = contents.batches().cloned().collect();
    if batches.is_empty() {
        return Ok(format!("{target} has no rows\n"));
    }
    Ok(format!("{}\n", pretty_format_batches(&batches)?))
}
