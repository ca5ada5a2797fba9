//! Warehouse client contract for the offline dedup/promote path.
//!
//! The production binding (queries, copy jobs, metadata reads against the
//! analytics warehouse) is a collaborator; this module fixes the contract
//! and ships [`MemoryWarehouse`], an in-memory implementation backing tests
//! and local dry runs. Templated tables are addressed as `<base>_YYYYMMDD`
//! and partitions as `<base>$YYYYMMDD`, both as plain table names.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use probeflow_types::EtlError;
use serde::{Deserialize, Serialize};

/// Basic stats for one table or partition.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub is_partitioned: bool,
    pub num_bytes: i64,
    pub num_rows: u64,
    pub creation_time: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// Grouped-aggregate detail over `test_id` / `task_filename`.
#[derive(Debug, Clone, Default)]
pub struct Detail {
    /// Populated when the detail describes a single partition.
    pub partition_id: String,
    pub task_file_count: u64,
    pub test_count: u64,
}

/// Metadata for one partition of a partitioned table.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub partition_id: String,
    pub creation_time: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle(pub String);

#[derive(Debug, Clone)]
pub struct JobStatus {
    pub done: bool,
    pub error: Option<String>,
}

/// Query/copy/metadata access to the analytics warehouse.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Lists regular tables in `dataset` whose name contains `filter`.
    async fn list_tables(&self, dataset: &str, filter: &str) -> Result<Vec<TableInfo>>;

    /// Stats for a single table; [`EtlError::NotRegularTable`] for views.
    async fn table_info(&self, dataset: &str, table: &str) -> Result<TableInfo>;

    /// Task/test counts for a table or partition. A missing partition
    /// counts as empty rather than erroring.
    async fn table_detail(&self, dataset: &str, table: &str) -> Result<Detail>;

    /// Partition metadata, or `None` when the partition does not exist.
    async fn partition_info(
        &self,
        dataset: &str,
        base: &str,
        yyyymmdd: &str,
    ) -> Result<Option<PartitionInfo>>;

    /// Starts a warehouse-native dedup of `src_table`, writing one
    /// representative row per `dedup_key` value into `dest_partition`
    /// within the same dataset.
    async fn dedup(
        &self,
        dataset: &str,
        src_table: &str,
        dedup_key: &str,
        dest_partition: &str,
    ) -> Result<JobHandle>;

    /// Starts a truncate-write copy of one partition into another, possibly
    /// across datasets.
    async fn copy_partition(
        &self,
        src_dataset: &str,
        src_partition: &str,
        dest_dataset: &str,
        dest_partition: &str,
    ) -> Result<JobHandle>;

    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// One warehouse row, reduced to the columns the offline path depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseRow {
    pub test_id: String,
    pub task_filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableState {
    pub rows: Vec<WarehouseRow>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub is_view: bool,
}

/// Serializable warehouse contents: dataset name -> table name -> state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub datasets: BTreeMap<String, BTreeMap<String, TableState>>,
}

/// In-memory [`Warehouse`]. Jobs complete after a configurable number of
/// status polls so the waiter's backoff is exercised.
pub struct MemoryWarehouse {
    state: Mutex<Snapshot>,
    jobs: Mutex<HashMap<String, u32>>,
    next_job: Mutex<u64>,
    /// Polls a job reports in-flight before completing.
    pub job_poll_delay: u32,
}

impl MemoryWarehouse {
    pub fn new() -> MemoryWarehouse {
        MemoryWarehouse::from_snapshot(Snapshot::default())
    }

    pub fn from_snapshot(snapshot: Snapshot) -> MemoryWarehouse {
        MemoryWarehouse {
            state: Mutex::new(snapshot),
            jobs: Mutex::new(HashMap::new()),
            next_job: Mutex::new(0),
            job_poll_delay: 0,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.lock().expect("warehouse lock poisoned").clone()
    }

    /// Creates or replaces a table.
    pub fn put_table(&self, dataset: &str, table: &str, state: TableState) {
        self.state
            .lock()
            .expect("warehouse lock poisoned")
            .datasets
            .entry(dataset.to_string())
            .or_default()
            .insert(table.to_string(), state);
    }

    fn start_job(&self) -> JobHandle {
        let mut next = self.next_job.lock().expect("job counter poisoned");
        *next += 1;
        let handle = JobHandle(format!("job-{}", *next));
        self.jobs
            .lock()
            .expect("jobs lock poisoned")
            .insert(handle.0.clone(), self.job_poll_delay);
        handle
    }

    fn info_from(table: &str, state: &TableState) -> TableInfo {
        TableInfo {
            name: table.to_string(),
            is_partitioned: table.contains('$'),
            num_bytes: (state.rows.len() * 64) as i64,
            num_rows: state.rows.len() as u64,
            creation_time: state.created,
            last_modified: state.modified,
        }
    }
}

impl Default for MemoryWarehouse {
    fn default() -> MemoryWarehouse {
        MemoryWarehouse::new()
    }
}

fn distinct_tasks(rows: &[WarehouseRow]) -> u64 {
    rows.iter()
        .map(|r| r.task_filename.as_str())
        .collect::<std::collections::HashSet<_>>()
        .len() as u64
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn list_tables(&self, dataset: &str, filter: &str) -> Result<Vec<TableInfo>> {
        let state = self.state.lock().expect("warehouse lock poisoned");
        let Some(tables) = state.datasets.get(dataset) else {
            return Ok(Vec::new());
        };
        Ok(tables
            .iter()
            .filter(|(name, t)| name.contains(filter) && !t.is_view)
            .map(|(name, t)| MemoryWarehouse::info_from(name, t))
            .collect())
    }

    async fn table_info(&self, dataset: &str, table: &str) -> Result<TableInfo> {
        let state = self.state.lock().expect("warehouse lock poisoned");
        let t = state
            .datasets
            .get(dataset)
            .and_then(|tables| tables.get(table))
            .with_context(|| format!("no such table: {dataset}.{table}"))?;
        if t.is_view {
            return Err(EtlError::NotRegularTable(format!("{dataset}.{table}")).into());
        }
        Ok(MemoryWarehouse::info_from(table, t))
    }

    async fn table_detail(&self, dataset: &str, table: &str) -> Result<Detail> {
        let state = self.state.lock().expect("warehouse lock poisoned");
        let partition_id = table.split_once('$').map(|(_, p)| p.to_string()).unwrap_or_default();
        match state.datasets.get(dataset).and_then(|tables| tables.get(table)) {
            Some(t) => Ok(Detail {
                partition_id,
                task_file_count: distinct_tasks(&t.rows),
                test_count: t.rows.len() as u64,
            }),
            // Absent partitions aggregate to zero, like a partition filter
            // over days with no data.
            None => Ok(Detail { partition_id, ..Detail::default() }),
        }
    }

    async fn partition_info(
        &self,
        dataset: &str,
        base: &str,
        yyyymmdd: &str,
    ) -> Result<Option<PartitionInfo>> {
        let state = self.state.lock().expect("warehouse lock poisoned");
        let name = format!("{base}${yyyymmdd}");
        Ok(state
            .datasets
            .get(dataset)
            .and_then(|tables| tables.get(&name))
            .map(|t| PartitionInfo {
                partition_id: yyyymmdd.to_string(),
                creation_time: t.created,
                last_modified: t.modified,
            }))
    }

    async fn dedup(
        &self,
        dataset: &str,
        src_table: &str,
        dedup_key: &str,
        dest_partition: &str,
    ) -> Result<JobHandle> {
        if dedup_key != "test_id" {
            bail!("unsupported dedup key: {dedup_key}");
        }
        let mut state = self.state.lock().expect("warehouse lock poisoned");
        let tables = state
            .datasets
            .get_mut(dataset)
            .with_context(|| format!("no such dataset: {dataset}"))?;
        let src = tables
            .get(src_table)
            .with_context(|| format!("no such table: {dataset}.{src_table}"))?;

        // One representative row per test_id; last writer wins.
        let mut by_key: BTreeMap<String, WarehouseRow> = BTreeMap::new();
        for row in &src.rows {
            by_key.insert(row.test_id.clone(), row.clone());
        }
        let created = src.created;
        tables.insert(
            dest_partition.to_string(),
            TableState {
                rows: by_key.into_values().collect(),
                created,
                modified: Utc::now(),
                is_view: false,
            },
        );
        Ok(self.start_job())
    }

    async fn copy_partition(
        &self,
        src_dataset: &str,
        src_partition: &str,
        dest_dataset: &str,
        dest_partition: &str,
    ) -> Result<JobHandle> {
        let mut state = self.state.lock().expect("warehouse lock poisoned");
        let src = state
            .datasets
            .get(src_dataset)
            .and_then(|tables| tables.get(src_partition))
            .with_context(|| format!("no such table: {src_dataset}.{src_partition}"))?
            .clone();
        state
            .datasets
            .entry(dest_dataset.to_string())
            .or_default()
            .insert(
                dest_partition.to_string(),
                TableState {
                    rows: src.rows,
                    created: src.created,
                    modified: Utc::now(),
                    is_view: false,
                },
            );
        Ok(self.start_job())
    }

    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus> {
        let mut jobs = self.jobs.lock().expect("jobs lock poisoned");
        let remaining = jobs
            .get_mut(&job.0)
            .with_context(|| format!("unknown job: {}", job.0))?;
        if *remaining == 0 {
            Ok(JobStatus { done: true, error: None })
        } else {
            *remaining -= 1;
            Ok(JobStatus { done: false, error: None })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[(&str, &str)]) -> TableState {
        TableState {
            rows: rows
                .iter()
                .map(|(test_id, task)| WarehouseRow {
                    test_id: test_id.to_string(),
                    task_filename: task.to_string(),
                })
                .collect(),
            created: Utc::now(),
            modified: Utc::now(),
            is_view: false,
        }
    }

    #[tokio::test]
    async fn test_table_detail_counts_distinct_tasks() {
        let wh = MemoryWarehouse::new();
        wh.put_table(
            "batch",
            "ndt_20160301",
            table(&[("t1", "a.tgz"), ("t2", "a.tgz"), ("t3", "b.tgz")]),
        );
        let detail = wh.table_detail("batch", "ndt_20160301").await.unwrap();
        assert_eq!(detail.test_count, 3);
        assert_eq!(detail.task_file_count, 2);

        // Missing partitions count as empty.
        let empty = wh.table_detail("batch", "ndt$20160301").await.unwrap();
        assert_eq!(empty.test_count, 0);
        assert_eq!(empty.partition_id, "20160301");
    }

    #[tokio::test]
    async fn test_views_are_not_regular_tables() {
        let wh = MemoryWarehouse::new();
        let mut view = table(&[]);
        view.is_view = true;
        wh.put_table("batch", "ndt_view", view);
        let err = wh.table_info("batch", "ndt_view").await.unwrap_err();
        let etl = err.downcast_ref::<EtlError>().expect("typed error");
        assert_eq!(etl.kind(), "not_regular_table");
        // And they are invisible to listing.
        assert!(wh.list_tables("batch", "ndt").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dedup_preserves_test_id_set() {
        let wh = MemoryWarehouse::new();
        wh.put_table(
            "batch",
            "ndt_20160301",
            table(&[("t1", "a.tgz"), ("t1", "a.tgz"), ("t2", "b.tgz"), ("t3", "b.tgz")]),
        );
        wh.dedup("batch", "ndt_20160301", "test_id", "ndt$20160301")
            .await
            .unwrap();

        let snapshot = wh.snapshot();
        let deduped = &snapshot.datasets["batch"]["ndt$20160301"];
        let mut ids: Vec<&str> = deduped.rows.iter().map(|r| r.test_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
    }

    #[tokio::test]
    async fn test_copy_truncates_destination() {
        let wh = MemoryWarehouse::new();
        wh.put_table("batch", "ndt$20160301", table(&[("t1", "a.tgz")]));
        wh.put_table("prod", "ndt$20160301", table(&[("old1", "z.tgz"), ("old2", "z.tgz")]));
        wh.copy_partition("batch", "ndt$20160301", "prod", "ndt$20160301")
            .await
            .unwrap();
        let snapshot = wh.snapshot();
        let dest = &snapshot.datasets["prod"]["ndt$20160301"];
        assert_eq!(dest.rows.len(), 1);
        assert_eq!(dest.rows[0].test_id, "t1");
    }

    #[tokio::test]
    async fn test_jobs_complete_after_configured_polls() {
        let mut wh = MemoryWarehouse::new();
        wh.job_poll_delay = 2;
        wh.put_table("batch", "ndt$20160301", table(&[("t1", "a.tgz")]));
        let job = wh
            .copy_partition("batch", "ndt$20160301", "prod", "ndt$20160301")
            .await
            .unwrap();
        assert!(!wh.job_status(&job).await.unwrap().done);
        assert!(!wh.job_status(&job).await.unwrap().done);
        assert!(wh.job_status(&job).await.unwrap().done);
    }

    #[test]
    fn test_snapshot_roundtrips_through_json() {
        let wh = MemoryWarehouse::new();
        wh.put_table("batch", "ndt_20160301", table(&[("t1", "a.tgz")]));
        let json = serde_json::to_string(&wh.snapshot()).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        let restored = MemoryWarehouse::from_snapshot(back);
        assert_eq!(restored.snapshot().datasets["batch"]["ndt_20160301"].rows.len(), 1);
    }
}
