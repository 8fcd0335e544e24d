use anyhow::{Context, Result};
use compactor::columnar;

use crate::common::StoreContext;

/// Describe the schema of a columnar target from its footer
pub async fn schema_command(ctx: &StoreContext, target: &str) -> Result<String> {
    let store = ctx.store()?;
    let data = store
        .read_all(target)
        .await
        .with_context(|| format!("Failed to read {target}"))?;
    let schema = columnar::read_schema_footer(data)
        .with_context(|| format!("{target} is not a readable columnar file"))?;

    let mut out = String::new();
    for field in schema.fields() {
        let nullable = if field.is_nullable() { "" } else { " not null" };
        out.push_str(&format!(
            "{}: {}{nullable}\n",
            field.name(),
            field.data_type()
        ));
    }
    Ok(out)
}
