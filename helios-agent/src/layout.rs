//! On-disk install layout
//!
//! ```text
//! <root>/<service>/
//!     <service>-<version>/        one tree per installed version
//!         helios/default.json     service defaults
//!         helios/hooks/*.sh       install + config hooks
//!         helios/checks/*.json    check manifests
//!         helios/smf/<service>.xml | helios/systemd/<service>.service
//!     current -> <service>-<version>/
//! ```

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::UnitFlavor;
use crate::error::{AgentError, AgentResult};

pub const TEMPLATE_EXTENSION: &str = "mustache";

#[derive(Debug, Clone)]
pub struct InstallLayout {
    root: PathBuf,
    service: String,
}

/// Paths inside the currently installed version
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    current: PathBuf,
    service: String,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>, service: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn service_dir(&self) -> PathBuf {
        self.root.join(&self.service)
    }

    pub fn current_link(&self) -> PathBuf {
        self.service_dir().join("current")
    }

    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.service_dir().join(format!("{}-{}", self.service, version))
    }

    pub fn definition(&self) -> ServiceDefinition {
        ServiceDefinition {
            current: self.current_link(),
            service: self.service.clone(),
        }
    }

    /// Version embedded in the `current` symlink target, if any
    pub async fn symlink_version(&self) -> Option<String> {
        let target = tokio::fs::read_link(self.current_link()).await.ok()?;
        parse_version_dir(&target, &self.service)
    }

    /// Installed version, trusted only when the symlink agrees with the
    /// version this node last published.
    pub async fn installed_version(&self, published: Option<&str>) -> Option<String> {
        let on_disk = self.symlink_version().await;
        match (on_disk, published) {
            (Some(disk), Some(tag)) if disk == tag => Some(disk),
            (disk, tag) => {
                debug!(
                    "Install state for {} not trusted (symlink: {:?}, tag: {:?})",
                    self.service, disk, tag
                );
                None
            }
        }
    }

    /// Point `current` at the tree for `version`. The new link is created
    /// beside the old one and renamed over it.
    pub async fn repoint_current(&self, version: &str) -> AgentResult<()> {
        let service_dir = self.service_dir();
        let target = PathBuf::from(format!("{}/", self.version_dir(version).display()));
        let staging = service_dir.join(format!(".current-{}", uuid::Uuid::new_v4()));

        tokio::fs::symlink(&target, &staging)
            .await
            .map_err(|e| AgentError::io(&staging, e))?;

        let current = self.current_link();
        if let Err(e) = tokio::fs::rename(&staging, &current).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(AgentError::io(current, e));
        }
        Ok(())
    }
}

impl ServiceDefinition {
    pub fn root(&self) -> &Path {
        &self.current
    }

    fn helios_dir(&self) -> PathBuf {
        self.current.join("helios")
    }

    pub fn default_config(&self) -> PathBuf {
        self.helios_dir().join("default.json")
    }

    pub fn install_hook(&self) -> PathBuf {
        self.helios_dir().join("hooks").join("install.sh")
    }

    pub fn config_hook(&self) -> PathBuf {
        self.helios_dir().join("hooks").join("config.sh")
    }

    pub fn unit_definition(&self, flavor: UnitFlavor) -> PathBuf {
        match flavor {
            UnitFlavor::Smf => self.helios_dir().join("smf").join(format!("{}.xml", self.service)),
            UnitFlavor::Systemd => self
                .helios_dir()
                .join("systemd")
                .join(format!("{}.service", self.service)),
        }
    }

    pub fn checks_pattern(&self) -> String {
        format!("{}/checks/*.json", self.helios_dir().display())
    }

    pub fn templates_pattern(&self) -> String {
        format!("{}/**/*.{}", self.current.display(), TEMPLATE_EXTENSION)
    }
}

/// `<service>-<version>[/]` → `<version>`
fn parse_version_dir(target: &Path, service: &str) -> Option<String> {
    // Path::file_name ignores a trailing separator
    let name = target.file_name()?.to_str()?;
    let version = name.strip_prefix(service)?.strip_prefix('-')?;
    if version.is_empty() {
        return None;
    }
    Some(version.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_dir() {
        assert_eq!(
            parse_version_dir(Path::new("/opt/helium/svcA/svcA-1.0/"), "svcA"),
            Some("1.0".to_string())
        );
        assert_eq!(
            parse_version_dir(Path::new("svcA-2.0.1-rc1"), "svcA"),
            Some("2.0.1-rc1".to_string())
        );
        assert_eq!(parse_version_dir(Path::new("/opt/helium/svcA/other-1.0"), "svcA"), None);
        assert_eq!(parse_version_dir(Path::new("/opt/helium/svcA/svcA-"), "svcA"), None);
        assert_eq!(parse_version_dir(Path::new("/opt/helium/svcA/svcAB-1.0"), "svcA"), None);
    }

    #[tokio::test]
    async fn test_installed_version_requires_matching_tag() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path(), "svcA");
        tokio::fs::create_dir_all(layout.version_dir("1.0")).await.unwrap();
        layout.repoint_current("1.0").await.unwrap();

        assert_eq!(layout.symlink_version().await.as_deref(), Some("1.0"));
        assert_eq!(layout.installed_version(Some("1.0")).await.as_deref(), Some("1.0"));
        assert_eq!(layout.installed_version(Some("0.9")).await, None);
        assert_eq!(layout.installed_version(None).await, None);
    }

    #[tokio::test]
    async fn test_repoint_replaces_link() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path(), "svcA");
        tokio::fs::create_dir_all(layout.version_dir("1.0")).await.unwrap();
        tokio::fs::create_dir_all(layout.version_dir("2.0")).await.unwrap();

        layout.repoint_current("1.0").await.unwrap();
        layout.repoint_current("2.0").await.unwrap();

        assert_eq!(layout.symlink_version().await.as_deref(), Some("2.0"));
        let leftovers: Vec<_> = std::fs::read_dir(layout.service_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".current-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_no_symlink_means_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path(), "svcA");
        assert_eq!(layout.symlink_version().await, None);
        assert_eq!(layout.installed_version(Some("1.0")).await, None);
    }
}
