use anyhow::{Result, bail};
use compactor::CancellationToken;
use diagnostics::*;

use crate::common::StoreContext;

/// Append JSON records, one per element, to `buffer`
pub async fn append_command(
    ctx: &StoreContext,
    buffer: &str,
    records: &[String],
    cancel: &CancellationToken,
) -> Result<String> {
    let records: Vec<&str> = records
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .collect();
    if records.is_empty() {
        bail!("No records to append to {buffer}");
    }

    let count = records.len();
    log_debug!("Appending {count} records to {buffer}", count: count, buffer: buffer);

    let writer = ctx.compactor()?.writer();
    let receipt = writer.append_records(buffer, &records, cancel).await?;

    Ok(format!(
        "Appended {count} records ({} bytes) to {buffer} at offset {}\n",
        receipt.length, receipt.offset
    ))
}
