//! Cloud Metadata Client (`spec.md` §4.6): reads per-instance/project
//! metadata with a local-file cache, grounded on
//! `original_source/.../gce_funcs.py`'s `get_metadata_value`.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;

const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR_VALUE: &str = "Google";

#[derive(Debug, Error)]
pub enum Error {
    #[error("metadata request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to write metadata cache file {0}: {1}")]
    CacheWrite(PathBuf, #[source] std::io::Error),
}

#[async_trait]
pub trait MetadataClient: Send + Sync {
    async fn instance_value(&self, name: &str) -> Result<String, Error>;
    async fn project_value(&self, name: &str) -> Result<String, Error>;
}

/// Queries `http://metadata.google.internal/computeMetadata/v1/...`, caching
/// every successful response under `cache_dir` so a later call for the same
/// key never issues an HTTP request again (§8 round-trip property).
pub struct GceMetadataClient {
    client: reqwest::Client,
    cache_dir: PathBuf,
    base_url: String,
}

impl GceMetadataClient {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            cache_dir: cache_dir.into(),
            base_url: "http://metadata.google.internal/computeMetadata/v1".to_string(),
        }
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(key.replace('/', "_"))
    }

    async fn cached_or_fetch(&self, cache_key: &str, url: &str) -> Result<String, Error> {
        let path = self.cache_path(cache_key);
        if let Ok(cached) = fs::read_to_string(&path).await {
            return Ok(cached);
        }

        let value = match self
            .client
            .get(url)
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR_VALUE)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp.text().await?.trim().to_string(),
            Ok(_) => String::new(),
            Err(_) => String::new(),
        };

        if !value.is_empty() {
            write_cache(&path, &value).await?;
        }
        Ok(value)
    }
}

async fn write_cache(path: &Path, value: &str) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent).await;
    }
    fs::write(path, value)
        .await
        .map_err(|e| Error::CacheWrite(path.to_path_buf(), e))
}

#[async_trait]
impl MetadataClient for GceMetadataClient {
    async fn instance_value(&self, name: &str) -> Result<String, Error> {
        let url = format!("{}/instance/{name}", self.base_url);
        self.cached_or_fetch(name, &url).await
    }

    async fn project_value(&self, name: &str) -> Result<String, Error> {
        let url = format!("{}/project/{name}", self.base_url);
        self.cached_or_fetch(&format!("project_{name}"), &url).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn cache_hit_avoids_network_and_returns_same_bytes() {
        let dir = TempDir::new().unwrap();
        let client = GceMetadataClient::new(dir.path());
        fs::write(dir.path().join("zone"), "us-central1-a").await.unwrap();
        let value = client.instance_value("zone").await.unwrap();
        assert_eq!(value, "us-central1-a");
    }
}
