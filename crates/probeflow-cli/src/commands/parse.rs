//! `probeflow parse`: run one archive through its datatype's parser with a
//! JSON-lines sink, for local inspection and backfills.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use probeflow_engine::objstore::FsClient;
use probeflow_engine::parser::new_parser;
use probeflow_engine::row::{JsonlWriter, Sink};
use probeflow_engine::storage::DEFAULT_OPEN_TIMEOUT;
use probeflow_engine::task::NullCloser;
use probeflow_engine::{ArchiveSource, Task};
use probeflow_types::DataPath;

#[derive(Args, Debug)]
pub struct ParseArgs {
    /// Archive URI, e.g. gs://bucket/ndt/2016/01/26/...-mlab1-prg01-ndt-0007.tgz
    pub uri: String,

    /// Directory backing the object store (bucket directories below it)
    #[arg(long)]
    pub data_root: PathBuf,

    /// Output JSON-lines file, one row per line
    #[arg(long)]
    pub out: PathBuf,
}

pub async fn execute(args: ParseArgs) -> Result<()> {
    let data_path = DataPath::validate(&args.uri)?;
    let data_type = data_path.data_type();

    let out = File::create(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let sink = Arc::new(JsonlWriter::new(BufWriter::new(out)));
    let parser = new_parser(data_type, sink.clone(), "")
        .with_context(|| format!("no parser registered for datatype {data_type}"))?;

    let client = FsClient::new(&args.data_root);
    let source = ArchiveSource::open(&client, &args.uri, DEFAULT_OPEN_TIMEOUT)?;

    let uri = args.uri.clone();
    let (tests, stats) = tokio::task::spawn_blocking(move || {
        let mut task = Task::new(uri, Box::new(source), parser, Box::new(NullCloser));
        let tests = task.process_all_tests(false)?;
        Ok::<_, anyhow::Error>((tests, task.stats()))
    })
    .await??;

    sink.close()?;
    tracing::info!(
        datatype = %data_type,
        tests,
        committed = stats.committed,
        failed = stats.failed,
        out = %args.out.display(),
        "archive processed"
    );
    Ok(())
}
