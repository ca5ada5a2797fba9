//! `probeflow promote`: drive the dedup/promote workflow over a warehouse
//! snapshot file.
//!
//! The production warehouse binding lives outside this repo; the command
//! operates on a JSON snapshot of warehouse state (datasets, tables, rows),
//! which also makes promotion runs reproducible in review.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use probeflow_engine::dedup::{process_tables_matching, Options};
use probeflow_engine::warehouse::{MemoryWarehouse, Snapshot};

#[derive(Args, Debug)]
pub struct PromoteArgs {
    /// Warehouse snapshot file (JSON); rewritten in place unless --dry-run
    #[arg(long)]
    pub snapshot: PathBuf,

    /// Dataset holding the per-day templated tables
    #[arg(long, default_value = "batch")]
    pub intermediate_dataset: String,

    /// Templated-table pattern, e.g. "ndt_"
    #[arg(long)]
    pub pattern: String,

    /// Destination dataset
    #[arg(long)]
    pub dest_dataset: String,

    /// Destination table base name
    #[arg(long)]
    pub dest_base: String,

    /// Minimum hours since the source table was last modified
    #[arg(long, default_value_t = 8)]
    pub min_src_age_hours: u64,

    /// Skip the destination-partition age comparison
    #[arg(long)]
    pub ignore_dest_age: bool,

    /// Run every check but mutate nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Skip dedup; copy the existing partitioned sibling
    #[arg(long)]
    pub copy_only: bool,
}

pub async fn execute(args: PromoteArgs) -> Result<()> {
    let contents = std::fs::read_to_string(&args.snapshot)
        .with_context(|| format!("failed to read snapshot {}", args.snapshot.display()))?;
    let snapshot: Snapshot =
        serde_json::from_str(&contents).context("failed to parse warehouse snapshot")?;
    let warehouse = MemoryWarehouse::from_snapshot(snapshot);

    let options = Options {
        min_src_age: Duration::from_secs(args.min_src_age_hours * 3600),
        ignore_dest_age: args.ignore_dest_age,
        dry_run: args.dry_run,
        copy_only: args.copy_only,
    };

    process_tables_matching(
        &warehouse,
        &args.intermediate_dataset,
        &args.pattern,
        &args.dest_dataset,
        &args.dest_base,
        options,
    )
    .await?;

    if !args.dry_run {
        let updated = serde_json::to_string_pretty(&warehouse.snapshot())
            .context("failed to serialize warehouse snapshot")?;
        std::fs::write(&args.snapshot, updated)
            .with_context(|| format!("failed to write snapshot {}", args.snapshot.display()))?;
    }
    tracing::info!(pattern = %args.pattern, dest = %args.dest_dataset, "promotion complete");
    Ok(())
}
