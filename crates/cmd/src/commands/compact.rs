use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::{Args, ValueEnum};
use compactor::{
    CancellationToken, CompactionOptions, CompactionOutcome, CompactionReport, CompactionRequest,
    WriteStrategy,
};

use crate::common::StoreContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    Rewrite,
    AppendRowGroup,
}

impl From<StrategyArg> for WriteStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Rewrite => WriteStrategy::Rewrite,
            StrategyArg::AppendRowGroup => WriteStrategy::AppendRowGroup,
        }
    }
}

#[derive(Debug, Clone, Default, Args)]
pub struct CompactArgs {
    /// Buffer to isolate
    pub buffer: String,
    /// Columnar target to fold the buffer into
    pub target: String,
    /// Overrides the configured write strategy
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyArg>,
    /// Abandon the pass after this many milliseconds
    #[arg(long)]
    pub deadline_ms: Option<u64>,
    /// Delete the snapshot of a failed pass instead of keeping it
    #[arg(long)]
    pub discard_failed: bool,
}

impl CompactArgs {
    pub fn new(buffer: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            buffer: buffer.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    fn options(&self) -> CompactionOptions {
        let mut options = CompactionOptions::new();
        if let Some(strategy) = self.strategy {
            options = options.with_write_strategy(strategy.into());
        }
        if let Some(ms) = self.deadline_ms {
            options = options.with_deadline(Duration::from_millis(ms));
        }
        if self.discard_failed {
            options = options.with_preserve_failed(false);
        }
        options
    }
}

pub async fn compact_command(
    ctx: &StoreContext,
    args: &CompactArgs,
    cancel: &CancellationToken,
) -> Result<String> {
    let compactor = ctx.compactor()?;
    let request = CompactionRequest::new(&args.buffer, &args.target);

    let report = compactor
        .compact(&request, &args.options(), cancel)
        .await
        .map_err(|e| anyhow!("Compaction of {} into {} failed: {e}", args.buffer, args.target))?;

    Ok(format_report(&report))
}

fn format_report(report: &CompactionReport) -> String {
    let mut out = String::new();
    if report.outcome == CompactionOutcome::Skipped {
        let _ = writeln!(out, "Nothing to compact in {}", report.buffer);
        return out;
    }

    let _ = writeln!(
        out,
        "Compacted {} into {}: {} rows appended, {} total",
        report.buffer,
        report.target,
        report.rows_appended,
        report.rows_total()
    );
    if report.bytes_written > 0 {
        let _ = writeln!(out, "  wrote {} bytes", report.bytes_written);
    }
    if !report.added_fields.is_empty() {
        let _ = writeln!(out, "  new fields: {}", report.added_fields.join(", "));
    }
    if report.snapshot_retained {
        if let Some(path) = &report.isolated_path {
            let _ = writeln!(out, "  snapshot retained at {path}");
        }
    }
    out
}
