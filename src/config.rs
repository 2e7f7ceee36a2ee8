use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Engine-wide settings. Collaborators construct one of these (or load it
/// from a YAML file / the environment) and hand it to `Engine::new`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Explicit daemon endpoint. When unset, `DOCKER_HOST` and the usual
    /// socket locations are probed.
    pub docker_host: Option<String>,
    /// Seconds to wait for a graceful stop before killing on destroy.
    pub stop_timeout_secs: i64,
    /// Architecture retried when a native pull fails on arm64 hosts.
    pub pull_fallback_arch: String,
    /// Root directory for per-process staging areas.
    pub staging_root: PathBuf,
    /// Skip the derived-image cache and always rebuild.
    pub disable_image_cache: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            stop_timeout_secs: 1,
            pull_fallback_arch: "amd64".to_string(),
            staging_root: std::env::temp_dir(),
            disable_image_cache: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `ABOX_*` environment variables. Loads a
    /// `.env` file first when one is present.
    pub fn from_env() -> Self {
        Self::default().overlay_env()
    }

    fn overlay_env(mut self) -> Self {
        dotenvy::dotenv().ok();

        if let Ok(host) = std::env::var("ABOX_DOCKER_HOST") {
            self.docker_host = Some(host);
        }
        if let Ok(timeout) = std::env::var("ABOX_STOP_TIMEOUT") {
            self.stop_timeout_secs = timeout.parse::<i64>().unwrap_or(self.stop_timeout_secs);
        }
        if let Ok(arch) = std::env::var("ABOX_PULL_FALLBACK_ARCH") {
            self.pull_fallback_arch = arch;
        }
        if let Ok(root) = std::env::var("ABOX_STAGING_ROOT") {
            self.staging_root = PathBuf::from(root);
        }
        if let Ok(flag) = std::env::var("ABOX_DISABLE_IMAGE_CACHE") {
            self.disable_image_cache = flag == "1" || flag.eq_ignore_ascii_case("true");
        }
        self
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))
    }

    /// File settings when the file exists, then environment overrides on
    /// top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(p) if p.exists() => Self::from_file(p)?,
            _ => Self::default(),
        };
        Ok(base.overlay_env())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.stop_timeout_secs, 1);
        assert_eq!(config.pull_fallback_arch, "amd64");
        assert!(!config.disable_image_cache);
        assert!(config.docker_host.is_none());
    }

    #[test]
    fn yaml_round_trip() {
        let config = EngineConfig {
            docker_host: Some("tcp://10.0.0.5:2375".to_string()),
            stop_timeout_secs: 5,
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: EngineConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.docker_host.as_deref(), Some("tcp://10.0.0.5:2375"));
        assert_eq!(back.stop_timeout_secs, 5);
    }
}
