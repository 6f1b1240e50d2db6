//! Artifact retrieval
//!
//! Archives are named `<service>-<version>-<platform>.tgz` and come either
//! from an HTTP base URL (downloaded to a temp file) or a local directory.
//! Downloads are removed once extracted; local archives are left alone.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::ArtifactsConfig;
use crate::error::{AgentError, AgentResult};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Make the archive for `(service, version)` available locally
    async fn fetch(&self, service: &str, version: &str) -> AgentResult<FetchedArchive>;
}

/// A local archive, possibly a download owned by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArchive {
    pub path: PathBuf,
    /// Downloaded copy to delete after use
    pub temporary: bool,
}

impl FetchedArchive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove a downloaded copy. Failures are only logged.
    pub async fn discard(self) {
        if !self.temporary {
            return;
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!("Removed downloaded archive {}", self.path.display()),
            Err(e) => warn!("Could not remove {}: {}", self.path.display(), e),
        }
    }
}

pub fn archive_name(service: &str, version: &str, platform_suffix: &str) -> String {
    format!("{}-{}-{}.tgz", service, version, platform_suffix)
}

/// Build the store described by `config`
pub fn from_config(config: &ArtifactsConfig) -> Box<dyn ArtifactStore> {
    match &config.base_url {
        Some(base_url) => Box::new(HttpArtifactStore::new(base_url, &config.platform_suffix)),
        None => Box::new(LocalArtifactStore::new(
            config.local_dir.clone(),
            &config.platform_suffix,
        )),
    }
}

pub struct HttpArtifactStore {
    client: reqwest::Client,
    base_url: String,
    platform_suffix: String,
}

impl HttpArtifactStore {
    pub fn new(base_url: &str, platform_suffix: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            platform_suffix: platform_suffix.to_string(),
        }
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn fetch(&self, service: &str, version: &str) -> AgentResult<FetchedArchive> {
        let name = archive_name(service, version, &self.platform_suffix);
        let url = format!("{}/{}", self.base_url, name);
        let fail = |message: String| AgentError::Artifact {
            service: service.to_string(),
            version: version.to_string(),
            message,
        };

        info!("Downloading artifact {}", url);
        let response = self
            .client
            .get(&url)
            .header("User-Agent", "helios-agent")
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;

        if !response.status().is_success() {
            return Err(fail(format!("download failed: {}", response.status())));
        }

        let bytes = response.bytes().await.map_err(|e| fail(e.to_string()))?;
        let temp_path = std::env::temp_dir().join(format!("{}-{}", uuid::Uuid::new_v4(), name));
        tokio::fs::write(&temp_path, bytes)
            .await
            .map_err(|e| AgentError::io(&temp_path, e))?;

        Ok(FetchedArchive {
            path: temp_path,
            temporary: true,
        })
    }
}

pub struct LocalArtifactStore {
    directory: PathBuf,
    platform_suffix: String,
}

impl LocalArtifactStore {
    pub fn new(directory: PathBuf, platform_suffix: &str) -> Self {
        Self {
            directory,
            platform_suffix: platform_suffix.to_string(),
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn fetch(&self, service: &str, version: &str) -> AgentResult<FetchedArchive> {
        let path = self
            .directory
            .join(archive_name(service, version, &self.platform_suffix));
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(AgentError::Artifact {
                service: service.to_string(),
                version: version.to_string(),
                message: format!("{} not found", path.display()),
            });
        }
        Ok(FetchedArchive {
            path,
            temporary: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_name() {
        assert_eq!(archive_name("svcA", "2.0", "sunos"), "svcA-2.0-sunos.tgz");
    }

    #[tokio::test]
    async fn test_local_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("svcA-1.0-linux.tgz"), b"archive").unwrap();
        let store = LocalArtifactStore::new(dir.path().to_path_buf(), "linux");

        let archive = store.fetch("svcA", "1.0").await.unwrap();
        assert_eq!(archive.path(), dir.path().join("svcA-1.0-linux.tgz"));
        assert!(!archive.temporary);
        assert!(matches!(
            store.fetch("svcA", "2.0").await,
            Err(AgentError::Artifact { .. })
        ));

        // the store's own copy survives an install
        archive.discard().await;
        assert!(dir.path().join("svcA-1.0-linux.tgz").exists());
    }

    #[tokio::test]
    async fn test_downloaded_archive_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0b1c-svcA-1.0-linux.tgz");
        std::fs::write(&path, b"archive").unwrap();

        let archive = FetchedArchive {
            path: path.clone(),
            temporary: true,
        };
        archive.discard().await;
        assert!(!path.exists());

        // already gone: only logged
        FetchedArchive { path, temporary: true }.discard().await;
    }
}
