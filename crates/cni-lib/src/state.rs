//! On-disk record of interfaces bound into containers
//!
//! One JSON file per container interface, `<dir>/<container_id>-<ifname>.json`.
//! Writes go to a temporary file first and are renamed into place.

use crate::models::IfaceInfo;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("no state for {container_id}/{ifname}")]
    NotFound { container_id: String, ifname: String },

    #[error("invalid state key {0:?}")]
    InvalidKey(String),

    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state file {path} holds invalid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

fn check_key(part: &str) -> Result<(), StateError> {
    if part.is_empty() || part == "." || part == ".." || part.contains('/') {
        return Err(StateError::InvalidKey(part.to_string()));
    }
    Ok(())
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, container_id: &str, ifname: &str) -> Result<PathBuf, StateError> {
        check_key(container_id)?;
        check_key(ifname)?;
        Ok(self.dir.join(format!("{}-{}.json", container_id, ifname)))
    }

    fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StateError + '_ {
        move |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub async fn get(&self, container_id: &str, ifname: &str) -> Result<IfaceInfo, StateError> {
        let path = self.path_for(container_id, ifname)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StateError::NotFound {
                    container_id: container_id.to_string(),
                    ifname: ifname.to_string(),
                })
            }
            Err(err) => return Err(Self::io_err(&path)(err)),
        };
        serde_json::from_slice(&data).map_err(|source| StateError::Json { path, source })
    }

    pub async fn put(&self, info: &IfaceInfo) -> Result<(), StateError> {
        let path = self.path_for(&info.container_id, &info.ifname)?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(Self::io_err(&self.dir))?;

        let data = serde_json::to_vec_pretty(info).map_err(|source| StateError::Json {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &data).await.map_err(Self::io_err(&tmp))?;
        fs::rename(&tmp, &path).await.map_err(Self::io_err(&path))?;

        debug!(path = %path.display(), "Stored interface state");
        Ok(())
    }

    pub async fn delete(&self, container_id: &str, ifname: &str) -> Result<(), StateError> {
        let path = self.path_for(container_id, ifname)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StateError::NotFound {
                container_id: container_id.to_string(),
                ifname: ifname.to_string(),
            }),
            Err(err) => Err(Self::io_err(&path)(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info() -> IfaceInfo {
        IfaceInfo {
            container_id: "abc123".to_string(),
            ifname: "eth1".to_string(),
            netns: "/proc/42/ns/net".to_string(),
            ip_address: "10.0.0.10/24".to_string(),
            pod_name: "web".to_string(),
            namespace: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path().join("state"));

        store.put(&info()).await.unwrap();
        assert!(dir.path().join("state/abc123-eth1.json").exists());
        assert_eq!(store.get("abc123", "eth1").await.unwrap(), info());

        store.delete("abc123", "eth1").await.unwrap();
        assert!(matches!(
            store.get("abc123", "eth1").await,
            Err(StateError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());

        assert!(matches!(
            store.delete("nope", "eth1").await,
            Err(StateError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());

        assert!(matches!(
            store.get("../etc", "eth1").await,
            Err(StateError::InvalidKey(_))
        ));
        let mut bad = info();
        bad.ifname = "..".to_string();
        assert!(matches!(store.put(&bad).await, Err(StateError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_corrupt_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("abc123-eth1.json"), b"{").unwrap();
        let store = FileStateStore::new(dir.path());

        assert!(matches!(
            store.get("abc123", "eth1").await,
            Err(StateError::Json { .. })
        ));
    }
}
