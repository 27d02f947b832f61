//! 14-digit (`YYYYMMDDhhmmss`) run-id allocator, unique across every call in
//! this process.
//!
//! The original implementation (one OS process per invocation) used a
//! cross-process advisory file lock. This rewrite runs every caller inside
//! one process, so the Design Notes' "cross-process id allocator → in-process
//! mutex + persistence" applies: a single `tokio::sync::Mutex` is the whole
//! critical section, and the last-issued id is persisted to a small file so
//! a restart within the same second still can't reissue it.
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read id state file {0}: {1}")]
    Read(PathBuf, #[source] io::Error),

    #[error("failed to persist id state file {0}: {1}")]
    Write(PathBuf, #[source] io::Error),
}

fn now_id() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

#[derive(Debug)]
struct State {
    last_id: Option<String>,
}

/// Allocates run ids. One instance is shared by every caller in the
/// process; `next_id` is the sole critical section.
#[derive(Debug)]
pub struct UniqueIdAllocator {
    state_path: PathBuf,
    inner: Mutex<State>,
}

impl UniqueIdAllocator {
    pub async fn load(state_path: impl Into<PathBuf>) -> Result<Self, Error> {
        let state_path = state_path.into();
        let last_id = match fs::read_to_string(&state_path).await {
            Ok(text) => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::Read(state_path, e)),
        };
        Ok(Self {
            state_path,
            inner: Mutex::new(State { last_id }),
        })
    }

    /// Returns a freshly allocated, unique run id. If the wall clock has not
    /// advanced past the previously issued id, spins until the next second
    /// ticks over — see §8 scenario 6 (two concurrent callers in the same
    /// second get consecutive distinct ids).
    pub async fn next_id(&self) -> Result<String, Error> {
        let mut state = self.inner.lock().await;
        let mut id = now_id();
        while state.last_id.as_deref() == Some(id.as_str()) {
            sleep(Duration::from_millis(50)).await;
            id = now_id();
        }
        persist(&self.state_path, &id).await?;
        state.last_id = Some(id.clone());
        Ok(id)
    }
}

async fn persist(path: &Path, id: &str) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent).await;
    }
    fs::write(path, id)
        .await
        .map_err(|e| Error::Write(path.to_path_buf(), e))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[tokio::test]
    async fn ids_are_14_digits() {
        let dir = TempDir::new().unwrap();
        let alloc = UniqueIdAllocator::load(dir.path().join("state")).await.unwrap();
        let id = alloc.next_id().await.unwrap();
        assert_eq!(id.len(), 14);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn concurrent_calls_never_collide() {
        let dir = TempDir::new().unwrap();
        let alloc = std::sync::Arc::new(UniqueIdAllocator::load(dir.path().join("state")).await.unwrap());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let alloc = alloc.clone();
            handles.push(tokio::spawn(async move { alloc.next_id().await.unwrap() }));
        }
        let mut ids = HashSet::new();
        for h in handles {
            assert!(ids.insert(h.await.unwrap()));
        }
    }

    #[tokio::test]
    async fn restart_resumes_from_persisted_state() {
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state");
        let first_id = {
            let alloc = UniqueIdAllocator::load(&state_path).await.unwrap();
            alloc.next_id().await.unwrap()
        };
        let alloc = UniqueIdAllocator::load(&state_path).await.unwrap();
        assert_eq!(alloc.inner.lock().await.last_id.as_deref(), Some(first_id.as_str()));
    }

    #[tokio::test]
    async fn missing_state_file_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let alloc = UniqueIdAllocator::load(dir.path().join("does-not-exist")).await.unwrap();
        assert!(alloc.inner.lock().await.last_id.is_none());
    }
}
