use std::fs;
use std::path::Path;

use regex::Regex;

use crate::error::ConfigError;

/// Environment-driven configuration parsed from a shell `declare -p`-style
/// file, per §6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub upload_summary: bool,
    pub bucket_subdir: String,
    pub min_scratch_size: u64,
    pub keep_dead_vm: bool,
    pub sendgrid_api_key: Option<String>,
    pub report_sender: Option<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            upload_summary: false,
            bucket_subdir: "results".to_string(),
            min_scratch_size: 0,
            keep_dead_vm: false,
            sendgrid_api_key: None,
            report_sender: None,
        }
    }
}

fn truthy(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y")
}

/// Setter table, one entry per recognized key — the "table lookup on
/// (flag, arity)" shape called for in the Design Notes, generalized here to
/// environment keys.
const SETTERS: &[(&str, fn(&mut EnvConfig, &str))] = &[
    ("GCE_UPLOAD_SUMMARY", |c, v| c.upload_summary = truthy(v)),
    ("BUCKET_SUBDIR", |c, v| {
        if !v.trim().is_empty() {
            c.bucket_subdir = v.trim().to_string();
        }
    }),
    ("GCE_MIN_SCR_SIZE", |c, v| {
        if let Ok(n) = v.trim().parse() {
            c.min_scratch_size = n;
        }
    }),
    ("GCE_LTM_KEEP_DEAD_VM", |c, v| c.keep_dead_vm = truthy(v)),
    ("SENDGRID_API_KEY", |c, v| {
        c.sendgrid_api_key = (!v.trim().is_empty()).then(|| v.trim().to_string())
    }),
    ("GCE_REPORT_SENDER", |c, v| {
        c.report_sender = (!v.trim().is_empty()).then(|| v.trim().to_string())
    }),
];

impl EnvConfig {
    /// Parses lines of the form `declare -- NAME="VALUE"` (or any prefix
    /// before `NAME=`), ignoring malformed lines and unrecognized keys.
    pub fn parse(text: &str) -> Self {
        let line_re = Regex::new(r#"^.*[[:space:]](\w+)="((?:[^"\\]|\\.)*)"\s*$"#).unwrap();
        let mut config = EnvConfig::default();
        for line in text.lines() {
            let Some(caps) = line_re.captures(line) else {
                continue;
            };
            let name = &caps[1];
            let value = &caps[2];
            if let Some((_, setter)) = SETTERS.iter().find(|(key, _)| *key == name) {
                setter(&mut config, value);
            }
        }
        config
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::EnvFile(path.to_path_buf(), e))?;
        Ok(Self::parse(&text))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_declare_style_lines() {
        let text = r#"
declare -- GCE_UPLOAD_SUMMARY="1"
declare -- BUCKET_SUBDIR="my-results"
declare -- GCE_MIN_SCR_SIZE="20"
declare -- GCE_LTM_KEEP_DEAD_VM="yes"
declare -- SENDGRID_API_KEY="SG.abc123"
declare -- GCE_REPORT_SENDER="ltm@example.com"
"#;
        let cfg = EnvConfig::parse(text);
        assert!(cfg.upload_summary);
        assert_eq!(cfg.bucket_subdir, "my-results");
        assert_eq!(cfg.min_scratch_size, 20);
        assert!(cfg.keep_dead_vm);
        assert_eq!(cfg.sendgrid_api_key.as_deref(), Some("SG.abc123"));
        assert_eq!(cfg.report_sender.as_deref(), Some("ltm@example.com"));
    }

    #[test]
    fn defaults_when_absent() {
        let cfg = EnvConfig::parse("");
        assert_eq!(cfg.bucket_subdir, "results");
        assert!(!cfg.upload_summary);
        assert!(cfg.sendgrid_api_key.is_none());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let cfg = EnvConfig::parse("not a declare line\nGCE_UPLOAD_SUMMARY=1\n");
        assert!(!cfg.upload_summary);
    }

    #[test]
    fn empty_bucket_subdir_falls_back_to_default() {
        let cfg = EnvConfig::parse(r#"declare -- BUCKET_SUBDIR="""#);
        assert_eq!(cfg.bucket_subdir, "results");
    }
}
