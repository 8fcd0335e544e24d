use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use cmd::commands::{CompactArgs, append_command, cat_command, compact_command, schema_command};
use cmd::common::StoreContext;
use compactor::CancellationToken;
use diagnostics::*;

#[derive(Parser)]
#[command(author, version, about = "Append buffers compacted into Parquet files")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Named store to operate on
    #[arg(long, global = true)]
    store: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append JSON records to a buffer (from arguments, or one per stdin line)
    Append {
        buffer: String,
        records: Vec<String>,
    },
    /// Fold a buffer into its columnar target
    Compact(CompactArgs),
    /// Show the schema of a columnar target
    Schema { target: String },
    /// Print the rows of a columnar target
    Cat { target: String },
}

fn read_stdin_records() -> Result<Vec<String>> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Err(anyhow!("No records given and stdin is a terminal"));
    }
    let mut records = Vec::new();
    for line in stdin.lock().lines() {
        let line = line?;
        if !line.trim().is_empty() {
            records.push(line);
        }
    }
    Ok(records)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_diagnostics();

    let cli = Cli::parse();
    let ctx = StoreContext::open(cli.config.as_deref(), cli.store.as_deref())?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let _ = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log_warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let output = match cli.command {
        Commands::Append { buffer, records } => {
            let records = if records.is_empty() {
                read_stdin_records()?
            } else {
                records
            };
            append_command(&ctx, &buffer, &records, &cancel).await?
        }
        Commands::Compact(args) => compact_command(&ctx, &args, &cancel).await?,
        Commands::Schema { target } => schema_command(&ctx, &target).await?,
        Commands::Cat { target } => cat_command(&ctx, &target).await?,
    };

    #[allow(clippy::print_stdout)]
    {
        print!("{output}");
    }
    Ok(())
}
