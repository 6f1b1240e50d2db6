//! Catalog tags a node publishes for its managed service
//!
//! On the wire the tags are plain strings (`version-<v>`, `config-<h>`);
//! in memory they are a [`ServiceTags`] record.

use std::collections::HashMap;

use crate::coordination::AgentService;

const VERSION_PREFIX: &str = "version-";
const CONFIG_PREFIX: &str = "config-";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTags {
    pub version: Option<String>,
    pub config_fingerprint: Option<String>,
}

impl ServiceTags {
    pub fn new(version: impl Into<String>, config_fingerprint: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            config_fingerprint: Some(config_fingerprint.into()),
        }
    }

    /// Parse the wire form. Unknown tags are ignored; the last occurrence
    /// of a prefix wins.
    pub fn from_tags<S: AsRef<str>>(tags: &[S]) -> Self {
        let mut parsed = Self::default();
        for tag in tags {
            let tag = tag.as_ref();
            if let Some(fingerprint) = tag.strip_prefix(CONFIG_PREFIX) {
                parsed.config_fingerprint = Some(fingerprint.to_string());
            } else if let Some(version) = tag.strip_prefix(VERSION_PREFIX) {
                parsed.version = Some(version.to_string());
            }
        }
        parsed
    }

    /// Tags currently published by this node for `service`
    pub fn published(services: &HashMap<String, AgentService>, service: &str) -> Self {
        services
            .get(service)
            .map(|s| Self::from_tags(&s.tags))
            .unwrap_or_default()
    }

    pub fn to_tags(&self) -> Vec<String> {
        let mut tags = Vec::with_capacity(2);
        if let Some(version) = &self.version {
            tags.push(format!("{}{}", VERSION_PREFIX, version));
        }
        if let Some(fingerprint) = &self.config_fingerprint {
            tags.push(format!("{}{}", CONFIG_PREFIX, fingerprint));
        }
        tags
    }
}
