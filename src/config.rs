//! Engine settings, read from TOML
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where the sled database lives.
    pub db_path: PathBuf,
    /// Prefix of the link attached to every notification.
    pub link_base: String,
    pub max_approvers: usize,
    pub require_reject_comment: bool,
    /// Delivery attempts per notification, at least one is always made.
    pub notify_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("approvals.sled"),
            link_base: "/approvals".to_string(),
            max_approvers: 10,
            require_reject_comment: false,
            notify_attempts: 2,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("invalid engine configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn document_link(&self, document_id: &str) -> String {
        format!("{}/{}", self.link_base.trim_end_matches('/'), document_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config = EngineConfig::from_toml_str("max_approvers = 3").unwrap();

        assert_eq!(config.max_approvers, 3);
        assert_eq!(config.link_base, "/approvals");
        assert_eq!(config.notify_attempts, 2);
    }

    #[test]
    fn link_ignores_trailing_slash() {
        let config = EngineConfig {
            link_base: "/e-sign/".into(),
            ..Default::default()
        };
        assert_eq!(config.document_link("doc_1"), "/e-sign/doc_1");
    }

    #[test]
    fn bad_types_are_reported() {
        assert!(EngineConfig::from_toml_str("max_approvers = \"many\"").is_err());
    }
}
