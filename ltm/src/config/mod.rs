//! Configuration singleton.
//!
//! Mirrors the teacher's `CONFIG: Lazy<ArcSwap<ConfigAndUsers>>` pattern:
//! one process-wide hot-reloadable record, swapped in whole on reload
//! (triggered by SIGHUP, see `crate::sighup`) rather than mutated in place.
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ltm_config::{Catalog, ConfigError, EnvConfig};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Process-wide settings: the environment config plus the paths needed to
/// construct a `Catalog` and locate on-disk state.
#[derive(Debug, Clone)]
pub struct Settings {
    pub env: EnvConfig,
    pub catalog_root: PathBuf,
    pub default_fs: String,
    pub state_dir: PathBuf,
    pub user: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: EnvConfig::default(),
            catalog_root: PathBuf::from("/root/"),
            default_fs: "ext4".to_string(),
            state_dir: PathBuf::from("/var/lib/ltm"),
            user: "ltm".to_string(),
        }
    }
}

impl Settings {
    pub fn catalog(&self) -> Result<Catalog, ConfigError> {
        Catalog::new(&self.catalog_root, &self.default_fs)
    }
}

static SETTINGS: Lazy<ArcSwap<Settings>> = Lazy::new(|| ArcSwap::from_pointee(Settings::default()));
static LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub fn settings() -> Arc<Settings> {
    SETTINGS.load().clone()
}

/// Loads (or reloads) settings from disk, swapping the whole record.
pub fn load(env_config_path: &PathBuf, mut settings: Settings) -> Result<Arc<Settings>, ConfigError> {
    let _lock = LOCK.lock();
    settings.env = EnvConfig::load(env_config_path)?;
    let arc = Arc::new(settings);
    SETTINGS.store(arc.clone());
    Ok(arc)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_settings_have_sane_bucket_subdir() {
        let s = Settings::default();
        assert_eq!(s.env.bucket_subdir, "results");
    }
}
