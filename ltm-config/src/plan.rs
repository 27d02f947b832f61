use std::fs;
use std::path::{Path, PathBuf};

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Options recognized from an invocation's command line, per §3.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationOptions {
    pub no_region_shard: bool,
    pub bucket_subdir: Option<String>,
    pub gs_kernel: Option<String>,
    pub report_email: Option<String>,
}

/// The opaque original command plus its recognized options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub orig_cmdline: String,
    pub options: InvocationOptions,
}

impl Invocation {
    pub fn new(orig_cmdline: impl Into<String>, options: InvocationOptions) -> Self {
        Self {
            orig_cmdline: orig_cmdline.into(),
            options,
        }
    }
}

/// A fully resolved test plan: `{filesystem -> ordered configs}` plus the
/// extra arguments the shard launch command is invoked with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPlan {
    pub fsconfigs: IndexMap<String, IndexSet<String>>,
    pub extra_args: Vec<String>,
}

impl ParsedPlan {
    /// An empty plan, used when `--no-action` short-circuits parsing.
    pub fn no_action(extra_args: Vec<String>) -> Self {
        Self {
            fsconfigs: IndexMap::new(),
            extra_args,
        }
    }

    fn insert(&mut self, fs: &str, cfg: &str) {
        let entry = self.fsconfigs.entry(fs.to_string()).or_default();
        entry.insert(cfg.to_string());
    }
}

/// No-argument flags removed unconditionally, on first occurrence.
const ZERO_ARG_FLAGS: &[&str] = &["ltm", "--no-region-shard", "--no-email"];

/// Flags removed together with their immediately following argument.
const ONE_ARG_FLAGS: &[&str] = &[
    "--instance-name",
    "--bucket-subdir",
    "--gs-bucket",
    "--email",
    "--gce-zone",
    "--image-project",
    "--testrunid",
    "--hooks",
    "--update-xfstests-tar",
    "--update-xfstests",
    "--update-files",
    "-n",
    "-r",
    "--machtype",
    "--kernel",
];

/// Resolves on-disk test-config catalogs rooted at a fixed directory, of
/// the shape `<root>/fs/<fs>/cfg/<cfg>` and `<root>/fs/<fs>/cfg/<cfg>.list`.
#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
    default_fs: String,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>, default_fs: impl Into<String>) -> Result<Self, ConfigError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ConfigError::MissingCatalogRoot(root));
        }
        let default_fs = default_fs.into();
        let catalog = Self { root, default_fs };
        if !catalog.fs_dir(&catalog.default_fs).is_dir() {
            return Err(ConfigError::UnknownFilesystem(catalog.default_fs.clone()));
        }
        Ok(catalog)
    }

    fn fs_dir(&self, fs: &str) -> PathBuf {
        self.root.join("fs").join(fs)
    }

    fn cfg_path(&self, fs: &str, cfg: &str) -> PathBuf {
        self.fs_dir(fs).join("cfg").join(cfg)
    }

    fn list_path(&self, fs: &str, cfg: &str) -> PathBuf {
        let mut p = self.cfg_path(fs, cfg).into_os_string();
        p.push(".list");
        PathBuf::from(p)
    }

    fn read_list(&self, path: &Path) -> Result<Vec<String>, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::ListFile(path.to_path_buf(), e))?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Resolves one `-c` element (either `fs/cfg` or a bare token) into
    /// `(fs, [cfg...])` pairs, per the table in §4.1. Returns an empty
    /// vector for anything that cannot be resolved — callers drop silently.
    fn resolve_element(&self, element: &str) -> Vec<(String, String)> {
        if let Some((fs, cfg)) = element.split_once('/') {
            let list = self.list_path(fs, cfg);
            if list.is_file() {
                return self
                    .read_list(&list)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|line| (fs.to_string(), line))
                    .collect();
            }
            if self.cfg_path(fs, cfg).is_file() {
                return vec![(fs.to_string(), cfg.to_string())];
            }
            return Vec::new();
        }

        if self.fs_dir(element).is_dir() {
            return vec![(element.to_string(), "default".to_string())];
        }

        let list = self.list_path(&self.default_fs, element);
        if list.is_file() {
            return self
                .read_list(&list)
                .unwrap_or_default()
                .into_iter()
                .map(|line| (self.default_fs.clone(), line))
                .collect();
        }
        if self.cfg_path(&self.default_fs, element).is_file() {
            return vec![(self.default_fs.clone(), element.to_string())];
        }
        Vec::new()
    }

    fn default_all_list(&self) -> Vec<String> {
        let path = self.list_path(&self.default_fs, "all");
        self.read_list(&path).unwrap_or_default()
    }

    /// Parses a raw invocation string into a `ParsedPlan`, per §4.1.
    pub fn parse(&self, orig_cmdline: &str) -> ParsedPlan {
        let mut tokens: Vec<String> = orig_cmdline.split_whitespace().map(str::to_string).collect();

        if tokens.iter().any(|t| t == "--no-action") {
            return ParsedPlan::no_action(tokens);
        }

        sanitize(&mut tokens);
        expand_smoke(&mut tokens);

        let mut plan = ParsedPlan::default();
        match take_c_spec(&mut tokens) {
            Some(spec) => {
                for element in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                    for (fs, cfg) in self.resolve_element(element) {
                        plan.insert(&fs, &cfg);
                    }
                }
            }
            None => {
                for line in self.default_all_list() {
                    plan.insert(&self.default_fs, &line);
                }
            }
        }

        plan.extra_args = tokens;
        plan
    }
}

fn sanitize(tokens: &mut Vec<String>) {
    for flag in ZERO_ARG_FLAGS {
        if let Some(pos) = tokens.iter().position(|t| t == flag) {
            tokens.remove(pos);
        }
    }
    for flag in ONE_ARG_FLAGS {
        if let Some(pos) = tokens.iter().position(|t| t == flag) {
            tokens.remove(pos);
            if pos < tokens.len() {
                tokens.remove(pos);
            }
        }
    }
}

fn expand_smoke(tokens: &mut Vec<String>) {
    if let Some(pos) = tokens.iter().position(|t| t == "smoke") {
        tokens.remove(pos);
        let mut expanded: Vec<String> = ["-c", "4k", "-g", "quick"].iter().map(|s| s.to_string()).collect();
        expanded.append(tokens);
        *tokens = expanded;
    }
}

fn take_c_spec(tokens: &mut Vec<String>) -> Option<String> {
    let pos = tokens.iter().position(|t| t == "-c")?;
    if pos + 1 >= tokens.len() {
        tokens.remove(pos);
        return Some(String::new());
    }
    let spec = tokens.remove(pos + 1);
    tokens.remove(pos);
    Some(spec)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        let cfg = |fs_name: &str, names: &[&str]| {
            let cfg_dir = dir.path().join("fs").join(fs_name).join("cfg");
            fs::create_dir_all(&cfg_dir).unwrap();
            for n in names {
                fs::write(cfg_dir.join(n), "").unwrap();
            }
        };
        cfg("ext4", &["4k", "1k", "dax"]);
        fs::write(dir.path().join("fs/ext4/cfg/all.list"), "4k\n1k\n").unwrap();
        cfg("xfs", &["default"]);
        dir
    }

    fn catalog(dir: &TempDir) -> Catalog {
        Catalog::new(dir.path(), "ext4").unwrap()
    }

    #[test]
    fn missing_root_is_error() {
        let err = Catalog::new("/does/not/exist", "ext4");
        assert!(matches!(err, Err(ConfigError::MissingCatalogRoot(_))));
    }

    #[test]
    fn smoke_expansion() {
        let dir = fixture();
        let cat = catalog(&dir);
        let plan = cat.parse("./gce-xfstests smoke");
        assert_eq!(plan.fsconfigs["ext4"].iter().collect::<Vec<_>>(), vec!["4k"]);
        assert_eq!(plan.extra_args, vec!["-g", "quick"]);
    }

    #[test]
    fn two_config_explicit_spec() {
        let dir = fixture();
        let cat = catalog(&dir);
        let plan = cat.parse("./gce-xfstests -c ext4/4k,ext4/1k");
        let got: Vec<_> = plan.fsconfigs["ext4"].iter().cloned().collect();
        assert_eq!(got, vec!["4k".to_string(), "1k".to_string()]);
    }

    #[test]
    fn default_all_list_used_when_c_absent() {
        let dir = fixture();
        let cat = catalog(&dir);
        let plan = cat.parse("./gce-xfstests");
        let got: Vec<_> = plan.fsconfigs["ext4"].iter().cloned().collect();
        assert_eq!(got, vec!["4k".to_string(), "1k".to_string()]);
    }

    #[test]
    fn unresolvable_element_silently_dropped() {
        let dir = fixture();
        let cat = catalog(&dir);
        let plan = cat.parse("./gce-xfstests -c ext4/nope,btrfs/none");
        assert!(plan.fsconfigs.is_empty());
    }

    #[test]
    fn bare_token_names_fs_directory() {
        let dir = fixture();
        let cat = catalog(&dir);
        let plan = cat.parse("./gce-xfstests -c xfs");
        let got: Vec<_> = plan.fsconfigs["xfs"].iter().cloned().collect();
        assert_eq!(got, vec!["default".to_string()]);
    }

    #[test]
    fn removal_rules_strip_flags_with_and_without_args() {
        let dir = fixture();
        let cat = catalog(&dir);
        let plan = cat.parse(
            "./gce-xfstests ltm --no-region-shard --email foo@bar.com -c ext4/4k --kernel abc -g quick",
        );
        assert_eq!(plan.extra_args, vec!["-g", "quick"]);
    }

    #[test]
    fn duplicates_collapse_preserving_first_seen_order() {
        let dir = fixture();
        let cat = catalog(&dir);
        let plan = cat.parse("./gce-xfstests -c ext4/1k,ext4/4k,ext4/1k");
        let got: Vec<_> = plan.fsconfigs["ext4"].iter().cloned().collect();
        assert_eq!(got, vec!["1k".to_string(), "4k".to_string()]);
    }

    #[test]
    fn no_action_short_circuits() {
        let dir = fixture();
        let cat = catalog(&dir);
        let plan = cat.parse("./gce-xfstests --no-action -c ext4/4k");
        assert!(plan.fsconfigs.is_empty());
        assert!(plan.extra_args.contains(&"-c".to_string()));
    }
}
