//! Per-shard types: the immutable `ShardSpec` produced by the Sharder, and
//! the monitoring state machine that drives it to completion.
pub mod monitor;

use std::path::PathBuf;

pub use monitor::{MonitorOutcome, ShardMonitor};

use crate::util::{encode_extra_args, instance_name, shard_letters};

/// Immutable per-shard record, per the `ShardSpec` data model in `spec.md` §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSpec {
    pub id: String,
    pub test_fs_cfg: String,
    pub extra_args_b64: String,
    pub zone: Option<String>,
    pub run_id: String,
    pub instance_name: String,
    pub log_path: PathBuf,
    pub cmdlog_path: PathBuf,
    pub serial_path: PathBuf,
    pub unpacked_results_dir: PathBuf,
}

impl ShardSpec {
    pub fn new(
        index: usize,
        test_fs_cfg: String,
        extra_args: &[String],
        zone: Option<String>,
        run_id: &str,
        user: &str,
        log_dir: &std::path::Path,
    ) -> Self {
        let id = shard_letters(index);
        let instance = instance_name(user, run_id, &id);
        Self {
            log_path: log_dir.join(&id),
            cmdlog_path: log_dir.join(format!("{id}.cmdlog")),
            serial_path: log_dir.join(format!("{id}.serial")),
            unpacked_results_dir: log_dir.join(format!("{id}.results")),
            extra_args_b64: encode_extra_args(extra_args),
            instance_name: instance,
            run_id: run_id.to_string(),
            test_fs_cfg,
            zone,
            id,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shard_spec_paths_and_instance_name() {
        let dir = std::path::Path::new("/var/lib/ltm/logs/20240501120000");
        let spec = ShardSpec::new(0, "ext4/4k".into(), &["-g".into(), "quick".into()], None, "20240501120000", "alice", dir);
        assert_eq!(spec.id, "aa");
        assert_eq!(spec.instance_name, "xfstests-alice-20240501120000-aa");
        assert_eq!(spec.log_path, dir.join("aa"));
    }
}
