//! Shard Monitor (`spec.md` §4.3): drives one shard's remote VM from launch
//! through wedge-detection to result retrieval. Runs as one `tokio::task`
//! per shard rather than one OS process, per the Design Notes
//! "process-per-shard → task-per-shard" rewrite; a per-task `tracing::Span`
//! replaces the original's per-process logger re-pointing.
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cloud::compute::{ComputeClient, MonitorStatusWrite};
use crate::cloud::storage::StorageClient;
use crate::shard::ShardSpec;

const MONITOR_INTERVAL: Duration = Duration::from_secs(60);
const WEDGE_THRESHOLD: Duration = Duration::from_secs(3600);
const RESULTS_POLL_INTERVAL: Duration = Duration::from_secs(5);
const RESULTS_POLL_ATTEMPTS: u32 = 5;
const SHUTDOWN_REASON_KEY: &str = "shutdown_reason";
const SHUTDOWN_REASON_VALUE: &str = "ltm detected test timeout";

/// Three-way tagged outcome of the monitor loop, per the Design Notes'
/// "dynamic typing → tagged variants" guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    Completed { timed_out: bool },
    Wedged,
    StartFailed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to launch shard command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to write shard log file {0}: {1}")]
    Log(std::path::PathBuf, #[source] std::io::Error),
}

pub struct ShardMonitorConfig {
    pub gce_project: String,
    pub gce_zone_default: Option<String>,
    pub gs_bucket: String,
    pub bucket_subdir: String,
    pub image_project: String,
    pub keep_dead_vm: bool,
}

pub struct ShardMonitor {
    pub spec: ShardSpec,
    compute: Arc<dyn ComputeClient>,
    storage: Arc<dyn StorageClient>,
    config: ShardMonitorConfig,
}

impl ShardMonitor {
    pub fn new(
        spec: ShardSpec,
        compute: Arc<dyn ComputeClient>,
        storage: Arc<dyn StorageClient>,
        config: ShardMonitorConfig,
    ) -> Self {
        Self {
            spec,
            compute,
            storage,
            config,
        }
    }

    fn zone(&self) -> &str {
        self.spec
            .zone
            .as_deref()
            .or(self.config.gce_zone_default.as_deref())
            .unwrap_or("us-central1-a")
    }

    fn launch_args(&self) -> Vec<String> {
        let mut args = vec!["--instance-name".to_string(), self.spec.instance_name.clone()];
        if let Some(zone) = &self.spec.zone {
            args.push("--gce-zone".to_string());
            args.push(zone.clone());
        }
        args.push("--gs-bucket".to_string());
        args.push(self.config.gs_bucket.clone());
        args.push("--bucket-subdir".to_string());
        args.push(self.config.bucket_subdir.clone());
        args.push("--image-project".to_string());
        args.push(self.config.image_project.clone());
        args.push("-c".to_string());
        args.push(self.spec.test_fs_cfg.clone());
        if let Some(extra) = crate::util::decode_extra_args(&self.spec.extra_args_b64) {
            args.extend(extra);
        }
        args
    }

    /// Launches the external `gce-xfstests` tool; returns whether it exited
    /// with code 0 (`running`) or not (`start_failed`), per §4.3.
    pub async fn start(&self) -> Result<bool, Error> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.spec.cmdlog_path)
            .await
            .map_err(|e| Error::Log(self.spec.cmdlog_path.clone(), e))?;

        let output = Command::new("gce-xfstests")
            .args(self.launch_args())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(Error::Spawn)?;

        let mut combined = output.stdout;
        combined.extend(output.stderr);
        file.write_all(&combined).await.map_err(|e| Error::Log(self.spec.cmdlog_path.clone(), e))?;

        let success = output.status.success();
        info!(shard = %self.spec.id, success, "shard launch finished");
        Ok(success)
    }

    /// Every 60s: stream serial output, poll instance status, detect wedge,
    /// detect normal completion (404). Returns once the loop can determine
    /// a terminal `MonitorOutcome`.
    pub async fn monitor(&self, cancel: &CancellationToken) -> MonitorOutcome {
        let mut serial_offset: u64 = 0;
        let mut last_status: Option<String> = None;
        let mut wait_time_at_last_change = Instant::now();
        let mut vm_timed_out = false;

        loop {
            if let Err(e) = self.stream_serial(&mut serial_offset).await {
                warn!(shard = %self.spec.id, error = %e, "serial read failed");
            }

            match self.compute.get_instance(&self.spec.instance_name, self.zone()).await {
                Ok(None) => {
                    return MonitorOutcome::Completed { timed_out: vm_timed_out };
                }
                Ok(Some(instance)) => {
                    let appliance_status = instance.metadata.get("status").map(String::as_str);
                    if last_status.as_deref() != appliance_status {
                        last_status = appliance_status.map(str::to_string);
                        wait_time_at_last_change = Instant::now();
                    } else if wait_time_at_last_change.elapsed() > WEDGE_THRESHOLD {
                        if self.config.keep_dead_vm {
                            return MonitorOutcome::Wedged;
                        }
                        let _ = self
                            .compute
                            .set_metadata(
                                &self.spec.instance_name,
                                self.zone(),
                                SHUTDOWN_REASON_KEY,
                                SHUTDOWN_REASON_VALUE,
                                MonitorStatusWrite::OnlyIfAbsent,
                            )
                            .await;
                        let _ = self.compute.delete_instance(&self.spec.instance_name, self.zone()).await;
                        vm_timed_out = true;
                    }
                }
                Err(e) => {
                    warn!(shard = %self.spec.id, error = %e, "transient compute API error, continuing");
                }
            }

            tokio::select! {
                _ = sleep(MONITOR_INTERVAL) => {}
                _ = cancel.cancelled() => {
                    return MonitorOutcome::Completed { timed_out: vm_timed_out };
                }
            }
        }
    }

    async fn stream_serial(&self, offset: &mut u64) -> Result<(), crate::cloud::compute::Error> {
        let output = self
            .compute
            .get_serial_port_output(&self.spec.instance_name, self.zone(), *offset)
            .await?;

        let mut text = String::new();
        if output.start > *offset {
            text.push_str(&format!(
                "!=====Missing data from {} to {}=====!\n",
                offset, output.start
            ));
        }
        text.push_str(&output.contents);

        if !text.is_empty() {
            if let Some(parent) = self.spec.serial_path.parent() {
                let _ = fs::create_dir_all(parent).await;
            }
            if let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(&self.spec.serial_path).await {
                let _ = file.write_all(text.as_bytes()).await;
            }
        }

        *offset = output.next;
        Ok(())
    }

    /// Poll object storage for the results tarball, unpack, and clean up
    /// bucket-side artifacts, per §4.3 "Finish".
    pub async fn finish(&self, outcome: MonitorOutcome) {
        if matches!(outcome, MonitorOutcome::StartFailed | MonitorOutcome::Wedged) {
            info!(shard = %self.spec.id, "finishing with serial only");
            return;
        }

        let prefix = format!("{}/results.", self.config.bucket_subdir);
        let mut found = None;
        for _ in 0..RESULTS_POLL_ATTEMPTS {
            if let Ok(blobs) = self.storage.list_blobs(&prefix).await {
                if let Some(blob) = blobs.into_iter().find(|b| b.contains(&self.spec.instance_name)) {
                    found = Some(blob);
                    break;
                }
            }
            sleep(RESULTS_POLL_INTERVAL).await;
        }

        let Some(blob) = found else {
            warn!(shard = %self.spec.id, "results tarball never appeared, falling back to serial");
            return;
        };

        let unpack = Command::new("gce-xfstests")
            .args(["get-results", "--unpack", &format!("gs://{}/{}", self.config.gs_bucket, blob)])
            .output()
            .await;
        if !matches!(unpack, Ok(ref out) if out.status.success()) {
            warn!(shard = %self.spec.id, "get-results --unpack failed");
            return;
        }

        // `get-results --unpack` drops its output, named after the blob's
        // basename with the `.tar.xz` suffix stripped, in the current
        // working directory. Move it into the path ShardSpec expects.
        let blob_basename = blob.rsplit('/').next().unwrap_or(&blob);
        let unpacked_name = blob_basename.strip_suffix(".tar.xz").unwrap_or(blob_basename);
        let unpack_source = std::path::PathBuf::from(unpacked_name);
        if let Some(parent) = self.spec.unpacked_results_dir.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        if let Err(e) = fs::rename(&unpack_source, &self.spec.unpacked_results_dir).await {
            warn!(shard = %self.spec.id, error = %e, source = %unpack_source.display(), "failed to move unpacked results into place");
        }

        let _ = self.storage.delete(&blob).await;
        let summary_blob = blob.replacen("results.", "summary.", 1);
        let _ = self.storage.delete(&summary_blob).await;

        if let MonitorOutcome::Completed { timed_out: false } = outcome {
            let _ = fs::remove_file(&self.spec.serial_path).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zone_falls_back_to_config_default() {
        let spec = ShardSpec::new(0, "ext4/4k".into(), &[], None, "20240501120000", "alice", std::path::Path::new("/tmp"));
        let monitor = ShardMonitor::new(
            spec,
            Arc::new(crate::cloud::compute::tests_support::FakeComputeClient::default()),
            Arc::new(crate::cloud::storage::tests_support::FakeStorageClient::default()),
            ShardMonitorConfig {
                gce_project: "proj".into(),
                gce_zone_default: Some("us-central1-a".into()),
                gs_bucket: "bucket".into(),
                bucket_subdir: "results".into(),
                image_project: "proj".into(),
                keep_dead_vm: false,
            },
        );
        assert_eq!(monitor.zone(), "us-central1-a");
    }
}
