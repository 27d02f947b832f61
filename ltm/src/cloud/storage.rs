//! Object Storage Client (`spec.md` §4.6): list/get/delete/upload blobs in a
//! named bucket, grounded on
//! `original_source/.../testrunmanager.py`'s `storage_client.lookup_bucket(...)
//! .blob(...).upload_from_file`/`.delete` usage.
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to read local file {0}: {1}")]
    LocalFile(std::path::PathBuf, #[source] std::io::Error),
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn list_blobs(&self, prefix: &str) -> Result<Vec<String>, Error>;
    async fn download_as_string(&self, blob: &str) -> Result<String, Error>;
    async fn upload_from_file(&self, blob: &str, path: &Path) -> Result<(), Error>;
    async fn delete(&self, blob: &str) -> Result<(), Error>;
}

pub struct GcsStorageClient {
    client: reqwest::Client,
    bucket: String,
}

impl GcsStorageClient {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bucket: bucket.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    name: String,
}

#[async_trait]
impl StorageClient for GcsStorageClient {
    async fn list_blobs(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let url = format!("https://storage.googleapis.com/storage/v1/b/{}/o", self.bucket);
        let resp: ListResponse = self
            .client
            .get(url)
            .query(&[("prefix", prefix)])
            .send()
            .await?
            .json()
            .await?;
        Ok(resp.items.into_iter().map(|i| i.name).collect())
    }

    async fn download_as_string(&self, blob: &str) -> Result<String, Error> {
        let url = format!(
            "https://storage.googleapis.com/storage/v1/b/{}/o/{}?alt=media",
            self.bucket,
            urlencoding(blob)
        );
        Ok(self.client.get(url).send().await?.text().await?)
    }

    async fn upload_from_file(&self, blob: &str, path: &Path) -> Result<(), Error> {
        let mut file = File::open(path).await.map_err(|e| Error::LocalFile(path.to_path_buf(), e))?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .await
            .map_err(|e| Error::LocalFile(path.to_path_buf(), e))?;

        let url = format!(
            "https://storage.googleapis.com/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.bucket,
            urlencoding(blob)
        );
        self.client.post(url).body(contents).send().await?;
        Ok(())
    }

    async fn delete(&self, blob: &str) -> Result<(), Error> {
        let url = format!(
            "https://storage.googleapis.com/storage/v1/b/{}/o/{}",
            self.bucket,
            urlencoding(blob)
        );
        self.client.delete(url).send().await?;
        Ok(())
    }
}

fn urlencoding(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct FakeStorageClient {
        pub blobs: Mutex<std::collections::HashMap<String, String>>,
    }

    #[async_trait]
    impl StorageClient for FakeStorageClient {
        async fn list_blobs(&self, prefix: &str) -> Result<Vec<String>, Error> {
            Ok(self
                .blobs
                .lock()
                .await
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn download_as_string(&self, blob: &str) -> Result<String, Error> {
            Ok(self.blobs.lock().await.get(blob).cloned().unwrap_or_default())
        }

        async fn upload_from_file(&self, blob: &str, path: &Path) -> Result<(), Error> {
            let contents = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| Error::LocalFile(path.to_path_buf(), e))?;
            self.blobs.lock().await.insert(blob.to_string(), contents);
            Ok(())
        }

        async fn delete(&self, blob: &str) -> Result<(), Error> {
            self.blobs.lock().await.remove(blob);
            Ok(())
        }
    }
}
