//! Offline dedup and promote.
//!
//! Per-day templated tables (`<base>_YYYYMMDD`) accumulate duplicate rows
//! from at-least-once processing. This module validates each one against a
//! set of safety gates, deduplicates it by `test_id` into its partitioned
//! sibling (`<base>$YYYYMMDD`), re-validates, and copies the partition into
//! the destination dataset with truncate-write semantics.
//!
//! Every gate failure is a typed error; the bulk driver deliberately aborts
//! the whole run on the first failure rather than promoting around it.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use probeflow_types::EtlError;
use regex::Regex;

use crate::warehouse::{Detail, JobHandle, TableInfo, Warehouse};

/// Backoff ceiling for job status polling.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

const MIN_TASK_RATIO: f64 = 0.99;
const MIN_TEST_RATIO: f64 = 0.95;

static DENSE_DATE_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*)([_$])(\d{4}[01]\d[0123]\d)$").expect("valid table suffix regex")
});

/// Processing options for a dedup/promote run.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Minimum time since the source table was last modified.
    pub min_src_age: Duration,
    /// Skip the destination-partition age comparison.
    pub ignore_dest_age: bool,
    /// Run every check but mutate nothing.
    pub dry_run: bool,
    /// Skip the dedup step; copy the existing partitioned sibling.
    pub copy_only: bool,
}

/// A templated table or partition name, broken into base, separator kind,
/// and date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNameParts {
    pub prefix: String,
    pub is_partitioned: bool,
    pub yyyymmdd: String,
}

/// Splits `<base>_YYYYMMDD` / `<base>$YYYYMMDD` into parts; anything else
/// is rejected.
pub fn table_parts(table_name: &str) -> Result<TableNameParts> {
    let caps = DENSE_DATE_SUFFIX
        .captures(table_name)
        .with_context(|| format!("invalid template suffix: {table_name}"))?;
    Ok(TableNameParts {
        prefix: caps[1].to_string(),
        is_partitioned: &caps[2] == "$",
        yyyymmdd: caps[3].to_string(),
    })
}

/// Sanity predicates over task and test counts.
///
/// The source must reflect at least 99% of the destination's task files and
/// 95% of its tests; shortfalls inside those bands warn but proceed (the
/// destination may still hold duplicates).
pub fn check_details(src: &Detail, dest: &Detail) -> Result<(), EtlError> {
    if (src.task_file_count as f64) < MIN_TASK_RATIO * dest.task_file_count as f64 {
        return Err(EtlError::TooFewTasks {
            src: src.task_file_count,
            dest: dest.task_file_count,
        });
    } else if src.task_file_count < dest.task_file_count {
        tracing::warn!(
            src = src.task_file_count,
            dest = dest.task_file_count,
            "fewer task files than destination"
        );
    }

    if (src.test_count as f64) < MIN_TEST_RATIO * dest.test_count as f64 {
        return Err(EtlError::TooFewTests { src: src.test_count, dest: dest.test_count });
    } else if src.test_count < dest.test_count {
        tracing::warn!(
            src = src.test_count,
            dest = dest.test_count,
            "fewer tests than destination"
        );
    }
    Ok(())
}

/// Polls a job to completion with Fibonacci backoff (10 ms, 10 ms, 20 ms,
/// 30 ms, ...) capped at `max_backoff`, returning the job's terminal error
/// if any. Polling stops early if the task is cancelled.
pub async fn wait_for_job(
    warehouse: &dyn Warehouse,
    job: &JobHandle,
    max_backoff: Duration,
) -> Result<()> {
    let mut previous = Duration::ZERO;
    let mut backoff = Duration::from_millis(10);
    loop {
        let status = warehouse.job_status(job).await?;
        if status.done {
            return match status.error {
                Some(message) => bail!("job {} failed: {message}", job.0),
                None => Ok(()),
            };
        }
        tokio::time::sleep(backoff.min(max_backoff)).await;
        if backoff < max_backoff {
            let next = previous + backoff;
            previous = backoff;
            backoff = next;
        }
    }
}

fn age_of(info: &TableInfo) -> Duration {
    Utc::now()
        .signed_duration_since(info.last_modified)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Validates one templated source table against its destination partition
/// and, if every gate passes, dedups and copies it.
///
/// Gates, in order:
/// 1. the source name has a valid `_YYYYMMDD` suffix;
/// 2. the source is at least `min_src_age` old;
/// 3. source and destination datasets differ;
/// 4. source and destination carry the same date;
/// 5. unless `ignore_dest_age`, the destination partition is not newer
///    than the source;
/// 6. task/test counts pass [`check_details`], before and after dedup.
pub async fn check_and_dedup(
    warehouse: &dyn Warehouse,
    src_dataset: &str,
    src_info: &TableInfo,
    dest_dataset: &str,
    dest_table: &str,
    options: Options,
) -> Result<()> {
    let src_parts = table_parts(&src_info.name)?;

    if age_of(src_info) < options.min_src_age {
        bail!("source table is too recent: {}.{}", src_dataset, src_info.name);
    }
    if src_dataset == dest_dataset {
        bail!("source and destination must be in different datasets: {src_dataset}");
    }

    let dest_parts = table_parts(dest_table)?;
    if dest_parts.yyyymmdd != src_parts.yyyymmdd {
        bail!(
            "source and destination must share a partition date: {} vs {}",
            src_info.name,
            dest_table
        );
    }

    // The dedup lands in the partitioned sibling of the source template.
    let dedup_table = format!("{}${}", src_parts.prefix, src_parts.yyyymmdd);

    // Confirm the source actually exists (and is a regular table).
    warehouse.table_info(src_dataset, &src_info.name).await?;

    if !options.ignore_dest_age {
        let dest_partition = warehouse
            .partition_info(dest_dataset, &dest_parts.prefix, &dest_parts.yyyymmdd)
            .await?;
        if let Some(partition) = dest_partition {
            if src_info.last_modified < partition.last_modified {
                return Err(EtlError::SrcOlderThanDest { src: src_info.name.clone() }.into());
            }
        }
    }

    let src_detail = warehouse.table_detail(src_dataset, &src_info.name).await?;
    let dest_detail = warehouse.table_detail(dest_dataset, dest_table).await?;
    check_details(&src_detail, &dest_detail)?;

    if options.dry_run {
        tracing::info!(
            src = %src_info.name,
            dedup = %dedup_table,
            dest = %dest_table,
            "dry run: would dedup and copy"
        );
        return Ok(());
    }

    if !options.copy_only {
        tracing::info!(src = %src_info.name, dedup = %dedup_table, "deduplicating");
        let job = warehouse
            .dedup(src_dataset, &src_info.name, "test_id", &dedup_table)
            .await?;
        wait_for_job(warehouse, &job, DEFAULT_MAX_BACKOFF).await?;
    }

    // Re-check counts against what dedup actually produced.
    let dedup_detail = warehouse.table_detail(src_dataset, &dedup_table).await?;
    check_details(&dedup_detail, &dest_detail)?;

    tracing::info!(src = %dedup_table, dest = %dest_table, "copying partition");
    let job = warehouse
        .copy_partition(src_dataset, &dedup_table, dest_dataset, dest_table)
        .await?;
    wait_for_job(warehouse, &job, DEFAULT_MAX_BACKOFF).await?;
    Ok(())
}

/// Finds every templated table in `src_dataset` matching `src_pattern`
/// (e.g. `ndt_`) and promotes each into the corresponding partition of
/// `dest_dataset.dest_base`, oldest first.
///
/// Tables younger than `min_src_age` are skipped; the first gate failure
/// aborts the whole run.
pub async fn process_tables_matching(
    warehouse: &dyn Warehouse,
    src_dataset: &str,
    src_pattern: &str,
    dest_dataset: &str,
    dest_base: &str,
    options: Options,
) -> Result<()> {
    // The pattern may lack the date, so table_parts does not apply here.
    if src_pattern.split('_').count() != 2 {
        bail!("invalid source pattern: {src_pattern}");
    }

    let mut info = warehouse.list_tables(src_dataset, src_pattern).await?;
    info.sort_by_key(|t| t.last_modified);

    tracing::info!(count = info.len(), pattern = %src_pattern, "examining source tables");
    for src_info in &info {
        if age_of(src_info) < options.min_src_age {
            continue;
        }
        let parts = table_parts(&src_info.name)?;
        let dest_table = format!("{dest_base}${}", parts.yyyymmdd);
        if let Err(e) = check_and_dedup(
            warehouse,
            src_dataset,
            src_info,
            dest_dataset,
            &dest_table,
            options,
        )
        .await
        {
            tracing::error!(
                src = %format!("{src_dataset}.{}", src_info.name),
                dest = %format!("{dest_dataset}.{dest_base}"),
                error = %e,
                "dedup failed"
            );
            return Err(e);
        }
    }
    Ok(())
}
