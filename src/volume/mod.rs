//! Host/container volume mappings and the strategy used to materialize
//! them on the daemon side.

use bollard::models::{Mount, MountTypeEnum};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};

pub(crate) fn short_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

/// Consistency/access mode of a mapping. Everything except `Ro` counts as
/// writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VolumeMode {
    Rw,
    Ro,
    Delegated,
    Cached,
    Consistent,
    #[default]
    Unspecified,
}

impl VolumeMode {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "rw" => Some(Self::Rw),
            "ro" => Some(Self::Ro),
            "delegated" => Some(Self::Delegated),
            "cached" => Some(Self::Cached),
            "consistent" => Some(Self::Consistent),
            "" => Some(Self::Unspecified),
            _ => None,
        }
    }

    /// Suffix appended to a daemon bind spec, when one applies.
    pub fn bind_suffix(&self) -> Option<&'static str> {
        match self {
            Self::Rw => Some("rw"),
            Self::Ro => Some("ro"),
            Self::Delegated => Some("delegated"),
            Self::Cached => Some("cached"),
            Self::Consistent => Some("consistent"),
            Self::Unspecified => None,
        }
    }
}

/// One host↔container mapping. Identity for caching is the
/// `(host_path, cont_path)` pair; the name only matters when a named
/// daemon volume has to exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Volume {
    pub name: Option<String>,
    pub host_path: String,
    pub cont_path: String,
    pub mode: VolumeMode,
}

impl Volume {
    pub fn new(host_path: impl Into<String>, cont_path: impl Into<String>) -> Self {
        Self {
            name: None,
            host_path: host_path.into(),
            cont_path: cont_path.into(),
            mode: VolumeMode::Unspecified,
        }
    }

    pub fn with_mode(mut self, mode: VolumeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Parses `host:cont` or `host:cont:mode`. A leading `~` in the host
    /// part expands to the caller's home directory.
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        let invalid = |reason: &str| EngineError::InvalidVolume {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        if parts.len() < 2 || parts.len() > 3 {
            return Err(invalid("expected host:cont or host:cont:mode"));
        }
        let host = expand_home(parts[0]);
        let cont = parts[1].to_string();
        if host.is_empty() {
            return Err(invalid("empty host path"));
        }
        if !cont.starts_with('/') {
            return Err(invalid("container path must be absolute"));
        }
        let mode = match parts.get(2) {
            Some(token) => VolumeMode::parse(token)
                .ok_or_else(|| invalid("unknown mode, use rw|ro|delegated|cached|consistent"))?,
            None => VolumeMode::Unspecified,
        };

        Ok(Self {
            name: None,
            host_path: host,
            cont_path: cont,
            mode,
        })
    }

    pub fn is_rw(&self) -> bool {
        self.mode != VolumeMode::Ro
    }

    /// Explicit name, or a stable one derived from the host path.
    pub fn effective_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("abox-vol-{}", short_sha256(&self.host_path)),
        }
    }

    /// Canonical `host:cont[:mode]` string, used for daemon binds and as
    /// the volume's contribution to the session config hash.
    pub fn spec_string(&self) -> String {
        match self.mode.bind_suffix() {
            Some(suffix) => format!("{}:{}:{suffix}", self.host_path, self.cont_path),
            None => format!("{}:{}", self.host_path, self.cont_path),
        }
    }

    /// Mount spec referencing the named daemon volume.
    pub fn to_named_mount(&self) -> Mount {
        Mount {
            target: Some(self.cont_path.clone()),
            source: Some(self.effective_name()),
            typ: Some(MountTypeEnum::VOLUME),
            read_only: Some(!self.is_rw()),
            ..Default::default()
        }
    }

    /// Mount spec binding the host path directly.
    pub fn to_bind_mount(&self) -> Mount {
        Mount {
            target: Some(self.cont_path.clone()),
            source: Some(self.host_path.clone()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(!self.is_rw()),
            ..Default::default()
        }
    }
}

fn expand_home(path: &str) -> String {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// How volume content reaches the container. Selected once per session,
/// then possibly downgraded by `resolve_approach`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeApproach {
    /// Bind-mount host directories.
    Bind,
    /// Copy content in after start, copy writable content back after run.
    Copy,
    /// Bake content into the derived build image with ADD lines.
    Add,
    /// Leave provisioning to an external sync tool.
    External,
    /// Mount pre-existing named daemon volumes.
    Volume,
}

impl VolumeApproach {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "bind" => Some(Self::Bind),
            "copy" => Some(Self::Copy),
            "add" => Some(Self::Add),
            "external" => Some(Self::External),
            "volume" => Some(Self::Volume),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bind => "bind",
            Self::Copy => "copy",
            Self::Add => "add",
            Self::External => "external",
            Self::Volume => "volume",
        }
    }

    /// Does a run need host-side copy-back of writable volumes?
    pub fn copies_back(&self) -> bool {
        matches!(self, Self::Copy | Self::Add)
    }
}

/// Facts about the environment that drive approach downgrades.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproachContext {
    /// The engine itself runs inside a container.
    pub inside_container: bool,
    /// The daemon lives on another machine.
    pub remote_daemon: bool,
    /// The base image is a Linux-family OS.
    pub image_is_linux: bool,
}

/// Applies the downgrade rules: host-path binds are meaningless when the
/// engine is containerized or the daemon is remote, and content injection
/// requires a Linux base.
pub fn resolve_approach(
    requested: VolumeApproach,
    fallback: VolumeApproach,
    ctx: &ApproachContext,
) -> VolumeApproach {
    let mut approach = requested;
    if approach == VolumeApproach::Bind && (ctx.inside_container || ctx.remote_daemon) {
        approach = fallback;
    }
    if matches!(approach, VolumeApproach::Add | VolumeApproach::Copy) && !ctx.image_is_linux {
        approach = VolumeApproach::Bind;
    }
    approach
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_two_and_three_parts() {
        let plain = Volume::parse("/src:/app").unwrap();
        assert_eq!(plain.mode, VolumeMode::Unspecified);
        assert!(plain.is_rw());

        let ro = Volume::parse("/src:/app:ro").unwrap();
        assert_eq!(ro.mode, VolumeMode::Ro);
        assert!(!ro.is_rw());
    }

    #[test]
    fn parse_rejects_malformed_specs() {
        assert!(Volume::parse("/src").is_err());
        assert!(Volume::parse("/src:relative").is_err());
        assert!(Volume::parse("/src:/app:bogus").is_err());
        assert!(Volume::parse(":/app").is_err());
    }

    #[test]
    fn derived_name_is_stable_per_host_path() {
        let a = Volume::new("/data", "/x");
        let b = Volume::new("/data", "/y");
        let c = Volume::new("/other", "/x");
        assert_eq!(a.effective_name(), b.effective_name());
        assert_ne!(a.effective_name(), c.effective_name());
    }
}
