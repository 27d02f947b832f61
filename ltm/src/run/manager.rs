//! Run Manager (`spec.md` §4.4), grounded on
//! `original_source/.../testrunmanager.py` (the fuller `usr/local/lib/gce-ltm`
//! variant). Rewritten per the Design Notes as a spawned `tokio::task`
//! fanning out one task per shard, rather than a forked process tree.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use ltm_config::{Catalog, ConfigError, Invocation};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use crate::cloud::compute::ComputeClient;
use crate::cloud::storage::StorageClient;
use crate::run::mailer::{send_report_best_effort, ReportMailer};
use crate::run::report::{write_report, PlainTextReport, ReportGenerator};
use crate::shard::monitor::{MonitorOutcome, ShardMonitor, ShardMonitorConfig};
use crate::shard::ShardSpec;
use crate::sharder::Sharder;
use crate::unique_id::UniqueIdAllocator;

const LAUNCH_THROTTLE: Duration = Duration::from_millis(500);
const AGGREGATE_FILES: &[&str] = &[
    "runtests.log",
    "cmdline",
    "summary",
    "failures",
    "run-stats",
    "testrunid",
    "kernel_version",
];

#[derive(Debug, Error)]
pub enum Error {
    #[error("unique id allocation failed: {0}")]
    UniqueId(#[from] crate::unique_id::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("sharder error: {0}")]
    Sharder(#[from] crate::sharder::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardInfo {
    pub index: usize,
    pub shard_id: String,
    pub cfg: String,
    pub zone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub id: String,
    pub num_shards: usize,
    pub shard_info: Vec<ShardInfo>,
}

#[derive(Debug, Clone)]
pub struct RunManagerConfig {
    pub user: String,
    pub log_root: PathBuf,
    pub gce_project: String,
    pub gce_region: String,
    pub gce_zone_default: Option<String>,
    pub gs_bucket: String,
    pub bucket_subdir: String,
    pub image_project: String,
    pub keep_dead_vm: bool,
    pub region_shard: bool,
    pub max_shards: i64,
    pub gs_kernel: Option<String>,
    pub upload_summary: bool,
    pub report_email: Option<String>,
}

/// Live record held for the lifetime of one run, per the `TestRun` data
/// model in `spec.md` §3.
pub struct RunManager {
    pub id: String,
    pub shards: Vec<ShardSpec>,
    pub log_dir: PathBuf,
    pub orig_cmdline: String,
    kernel_version: Mutex<String>,
    config: RunManagerConfig,
    compute: Arc<dyn ComputeClient>,
    storage: Arc<dyn StorageClient>,
    mailer: Option<Arc<dyn ReportMailer>>,
    cancel: CancellationToken,
    runs: Arc<DashMap<String, CancellationToken>>,
}

impl RunManager {
    /// Allocates a unique run id, parses and shards the invocation. Any
    /// failure here is fatal — the frontend returns `{status:false}`.
    ///
    /// `runs` is the process-wide in-flight run registry (`SPEC_FULL.md`
    /// §4.4/§5): each run registers its `CancellationToken` under its id so
    /// a future shutdown path can cancel in-flight monitoring without
    /// tracking every shard task by hand.
    #[allow(clippy::too_many_arguments)]
    pub async fn construct(
        invocation: &Invocation,
        catalog: &Catalog,
        allocator: &UniqueIdAllocator,
        config: RunManagerConfig,
        compute: Arc<dyn ComputeClient>,
        storage: Arc<dyn StorageClient>,
        mailer: Option<Arc<dyn ReportMailer>>,
        runs: Arc<DashMap<String, CancellationToken>>,
    ) -> Result<Self, Error> {
        let id = allocator.next_id().await?;
        let log_dir = config.log_root.join(&id);
        fs::create_dir_all(&log_dir).await?;

        let mut config = config;
        if let Some(bucket_subdir) = &invocation.options.bucket_subdir {
            config.bucket_subdir = bucket_subdir.clone();
        }
        if let Some(gs_kernel) = &invocation.options.gs_kernel {
            config.gs_kernel = Some(gs_kernel.clone());
        }
        if let Some(report_email) = &invocation.options.report_email {
            config.report_email = Some(report_email.clone());
        }

        let plan = catalog.parse(&invocation.orig_cmdline);
        let region_shard = config.region_shard && !invocation.options.no_region_shard;

        let sharder = Sharder::new(compute.clone(), config.gce_region.clone());
        let shards = sharder
            .get_shards(&plan, &plan.extra_args, &id, &config.user, &log_dir, region_shard, config.max_shards)
            .await?;

        let cancel = CancellationToken::new();
        runs.insert(id.clone(), cancel.clone());

        Ok(Self {
            id,
            shards,
            log_dir,
            orig_cmdline: invocation.orig_cmdline.clone(),
            kernel_version: Mutex::new("unknown_kernel_version".to_string()),
            config,
            compute,
            storage,
            mailer,
            cancel,
            runs,
        })
    }

    pub fn get_info(&self) -> RunInfo {
        RunInfo {
            id: self.id.clone(),
            num_shards: self.shards.len(),
            shard_info: self
                .shards
                .iter()
                .enumerate()
                .map(|(index, s)| ShardInfo {
                    index,
                    shard_id: s.id.clone(),
                    cfg: s.test_fs_cfg.clone(),
                    zone: s.zone.clone(),
                })
                .collect(),
        }
    }

    /// Signals every shard task of this run to stop monitoring at its next
    /// check-in rather than running the full 3600s wedge window.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    fn agg_dir(&self) -> PathBuf {
        self.log_dir.join(format!("results-{}-{}", self.config.user, self.id))
    }

    /// Spawns the run's task and returns immediately; the caller (the
    /// frontend handler) never awaits this, matching the original's
    /// "parent keeps no handle beyond the process id".
    pub fn run(self: Arc<Self>) {
        let span = tracing::info_span!("run", run_id = %self.id);
        tokio::spawn(async move { self.execute().await }.instrument(span));
    }

    async fn execute(self: Arc<Self>) {
        let outcomes = self.wait_for_shards().await;
        let any_results = self.aggregate_results(&outcomes).await;
        if any_results {
            self.create_ltm_info().await;
            self.create_ltm_run_stats().await;
            self.generate_and_send_report().await;
            self.pack_and_upload().await;
        } else {
            error!(run_id = %self.id, "finishing without uploading anything");
        }
        self.cleanup().await;
        self.runs.remove(&self.id);
        info!(run_id = %self.id, "run finished");
    }

    /// Launches every shard monitor in id order, 500ms apart, then joins
    /// all of them before aggregating. Each shard is driven to completion
    /// (start, monitor, finish) on its own task.
    async fn wait_for_shards(&self) -> Vec<(ShardSpec, MonitorOutcome)> {
        let mut monitors = Vec::with_capacity(self.shards.len());
        for (index, spec) in self.shards.iter().cloned().enumerate() {
            if index > 0 {
                sleep(LAUNCH_THROTTLE).await;
            }
            info!(run_id = %self.id, shard = %spec.id, "starting shard");

            let compute = self.compute.clone();
            let storage = self.storage.clone();
            let monitor_config = ShardMonitorConfig {
                gce_project: self.config.gce_project.clone(),
                gce_zone_default: self.config.gce_zone_default.clone(),
                gs_bucket: self.config.gs_bucket.clone(),
                bucket_subdir: self.config.bucket_subdir.clone(),
                image_project: self.config.image_project.clone(),
                keep_dead_vm: self.config.keep_dead_vm,
            };
            let monitor = ShardMonitor::new(spec.clone(), compute, storage, monitor_config);
            let cancel = self.cancel.clone();
            let span = tracing::info_span!("shard", shard_id = %spec.id);
            monitors.push(tokio::spawn(
                async move {
                    let outcome = match monitor.start().await {
                        Ok(true) => monitor.monitor(&cancel).await,
                        _ => MonitorOutcome::StartFailed,
                    };
                    monitor.finish(outcome).await;
                    (spec, outcome)
                }
                .instrument(span),
            ));
        }

        join_all(monitors)
            .await
            .into_iter()
            .filter_map(|r| r.ok())
            .collect()
    }

    /// Step 3: move each shard's artifacts into the aggregate directory.
    async fn aggregate_results(&self, outcomes: &[(ShardSpec, MonitorOutcome)]) -> bool {
        let agg_dir = self.agg_dir();
        let _ = fs::create_dir_all(&agg_dir).await;

        let mut any = false;
        for (shard, _outcome) in outcomes {
            let mut found = false;
            if fs::metadata(&shard.unpacked_results_dir).await.is_ok() {
                let dest = agg_dir.join(&shard.id);
                if fs::rename(&shard.unpacked_results_dir, &dest).await.is_ok() {
                    found = true;
                }
            }
            if fs::metadata(&shard.serial_path).await.is_ok() {
                let dest = agg_dir.join(format!("{}.serial", shard.id));
                if fs::rename(&shard.serial_path, &dest).await.is_ok() {
                    found = true;
                }
            }
            if found {
                any = true;
            } else {
                warn!(run_id = %self.id, shard = %shard.id, "shard produced no artifacts");
            }
        }

        if !any {
            return false;
        }

        self.concatenate_shard_files(outcomes, &agg_dir).await;
        true
    }

    /// Step 4: concatenate each well-known per-shard file into one
    /// top-level aggregate file, with `SHARD <id>`/config banners.
    async fn concatenate_shard_files(&self, outcomes: &[(ShardSpec, MonitorOutcome)], agg_dir: &Path) {
        for filename in AGGREGATE_FILES {
            let mut out = format!(
                "LTM aggregate file for {filename}\nTest run ID: {}\nAggregate results from {} shards\n",
                self.id,
                outcomes.len()
            );
            for (shard, outcome) in outcomes {
                out.push_str(&format!("============SHARD {}============\n", shard.id));
                out.push_str(&format!("============CONFIG: {}============\n", shard.test_fs_cfg));
                let per_shard_path = agg_dir.join(&shard.id).join(filename);
                match fs::read_to_string(&per_shard_path).await {
                    Ok(contents) => out.push_str(&contents),
                    Err(_) if matches!(outcome, MonitorOutcome::Completed { timed_out: true }) => {
                        out.push_str("(shard timed out, no results file; see serial output)\n");
                    }
                    Err(_) => {
                        out.push_str("(could not open or read this shard's file)\n");
                    }
                }
                out.push_str(&format!("==========END SHARD {}==========\n", shard.id));
            }
            let _ = fs::write(agg_dir.join(filename), &out).await;
        }

        if let Ok(kv) = fs::read_to_string(agg_dir.join("kernel_version")).await {
            if let Some(first) = kv.lines().find(|l| !l.trim().is_empty()) {
                *self.kernel_version.lock() = first.trim().to_string();
            }
        }
    }

    /// Step 5a: human summary of original cmd + per-shard instance/config.
    async fn create_ltm_info(&self) {
        let mut out = format!("LTM run {}\nOriginal command: {}\n", self.id, self.orig_cmdline);
        for shard in &self.shards {
            out.push_str(&format!(
                "shard {}: instance={} cfg={}\n",
                shard.id, shard.instance_name, shard.test_fs_cfg
            ));
        }
        let _ = fs::write(self.agg_dir().join("ltm-info"), out).await;
    }

    /// Step 5b: machine-readable `TESTRUNID`/`CMDLINE`.
    async fn create_ltm_run_stats(&self) {
        let out = format!("TESTRUNID: {}-{}\nCMDLINE: {}\n", self.config.user, self.id, self.orig_cmdline);
        let _ = fs::write(self.agg_dir().join("ltm-run-stats"), out).await;
    }

    /// Step 7: generate the report, email it if configured.
    async fn generate_and_send_report(&self) {
        let kernel_version = self.kernel_version.lock().clone();
        let generator = PlainTextReport;
        let body = generator.generate(&self.agg_dir(), &self.id, &kernel_version, self.shards.len());
        let _ = write_report(&self.agg_dir(), &body).await;

        let subject = format!("LTM results for {}", self.id);
        send_report_best_effort(
            self.mailer.as_deref(),
            self.config.report_email.as_deref(),
            &subject,
            &body,
        )
        .await;
    }

    /// Step 8: tar + xz -6e the aggregate directory, upload, optionally
    /// also upload the summary file.
    async fn pack_and_upload(&self) {
        let agg_dir = self.agg_dir();
        let tar_path = agg_dir.with_extension("tar");
        let tar_xz_path = agg_dir.with_extension("tar.xz");

        let tar_ok = Command::new("tar")
            .args(["-C", agg_dir.to_string_lossy().as_ref(), "-cf", tar_path.to_string_lossy().as_ref(), "."])
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        if !tar_ok {
            warn!(run_id = %self.id, "tar failed, skipping upload");
            return;
        }

        let xz_ok = Command::new("xz")
            .args(["-6e", "-k", tar_path.to_string_lossy().as_ref()])
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        if !xz_ok {
            warn!(run_id = %self.id, "xz failed, skipping upload");
            return;
        }

        let kernel_version = self.kernel_version.lock().clone();
        let blob_name = self.results_blob_name(&kernel_version, false);
        if let Err(e) = self.storage.upload_from_file(&blob_name, &tar_xz_path).await {
            warn!(run_id = %self.id, error = %e, "upload failed");
        }

        if self.config.upload_summary {
            let summary_path = agg_dir.join("summary");
            let summary_blob = self.results_blob_name(&kernel_version, true);
            let _ = self.storage.upload_from_file(&summary_blob, &summary_path).await;
        }
    }

    fn results_blob_name(&self, kernel_version: &str, summary: bool) -> String {
        let subdir = &self.config.bucket_subdir;
        if summary {
            format!("{subdir}/summary.{}-{}.{kernel_version}.txt", self.config.user, self.id)
        } else {
            format!("{subdir}/results.{}-{}.{kernel_version}.tar.xz", self.config.user, self.id)
        }
    }

    /// Step 9: remove local tar/tar.xz + aggregate dir; delete the
    /// `gs_kernel` blob if it was a one-run kernel.
    async fn cleanup(&self) {
        let agg_dir = self.agg_dir();
        let _ = fs::remove_file(agg_dir.with_extension("tar")).await;
        let _ = fs::remove_file(agg_dir.with_extension("tar.xz")).await;
        let _ = fs::remove_dir_all(&agg_dir).await;

        if let Some(gs_kernel) = &self.config.gs_kernel {
            if gs_kernel.ends_with("-onerun") {
                if let Some(blob_name) = gs_kernel.splitn(4, '/').nth(3) {
                    let _ = self.storage.delete(blob_name).await;
                }
            }
        }
    }
}
