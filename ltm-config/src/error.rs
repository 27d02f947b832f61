use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("catalog root {0} does not exist")]
    MissingCatalogRoot(PathBuf),

    #[error("no config catalog for filesystem {0}")]
    UnknownFilesystem(String),

    #[error("failed to read list file {0}: {1}")]
    ListFile(PathBuf, #[source] io::Error),

    #[error("failed to read environment config file {0}: {1}")]
    EnvFile(PathBuf, #[source] io::Error),

    #[error("malformed line in environment config file {0}: {1:?}")]
    EnvLine(PathBuf, String),
}
