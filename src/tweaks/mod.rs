//! Host-integration tweaks. Each tweak inspects the session's facts and
//! contributes volumes, env, labels, build commands, init commands or
//! post-create actions to an accumulated bundle. Tweaks are individually
//! best-effort: a failing tweak is logged and skipped, never fatal.

pub mod dind;
pub mod platform;
pub mod ssh;
pub mod users;

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::daemon::DaemonClient;
use crate::distro::DistroFamily;
use crate::volume::{Volume, VolumeApproach};

/// Host operating system the engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl HostOs {
    pub fn detect() -> Self {
        match std::env::consts::OS {
            "linux" => Self::Linux,
            "macos" => Self::MacOs,
            "windows" => Self::Windows,
            _ => Self::Other,
        }
    }
}

/// Command run inside the container right after each start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitCommand {
    pub command: String,
    pub user: Option<String>,
    /// Companion processes start detached; one-shot fixes attach.
    pub detach: bool,
}

/// Action applied once after the container is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostCreateAction {
    Exec {
        user: Option<String>,
        command: String,
    },
    ConnectNetwork {
        network: String,
    },
}

/// Everything the tweaks decided to add to a session.
#[derive(Debug, Default, Clone)]
pub struct TweakBundle {
    pub extra_volumes: Vec<Volume>,
    pub extra_env: Vec<String>,
    pub extra_labels: HashMap<String, String>,
    pub build_commands: Vec<String>,
    pub init_commands: Vec<InitCommand>,
    pub post_create: Vec<PostCreateAction>,
}

impl TweakBundle {
    pub fn is_empty(&self) -> bool {
        self.extra_volumes.is_empty()
            && self.extra_env.is_empty()
            && self.extra_labels.is_empty()
            && self.build_commands.is_empty()
            && self.init_commands.is_empty()
            && self.post_create.is_empty()
    }
}

/// Session-derived inputs the tweaks read. Built by the session before
/// image derivation so contributions can land in the build image.
#[derive(Debug, Clone)]
pub struct SessionFacts {
    pub run_id: String,
    pub image: String,
    pub volumes: Vec<Volume>,
    pub approach: VolumeApproach,
    pub mount_docker_socket: bool,
    pub privileged: bool,
    pub inside_container: bool,
    pub remote_daemon: bool,
    pub daemon_tcp_address: Option<String>,
    pub host_os: HostOs,
    pub distro_family: DistroFamily,
    pub mirror_host_user: bool,
    pub host_uid: u32,
    pub host_gid: u32,
    pub host_username: String,
    /// Labels of an existing container being reused, for tweaks that
    /// must re-apply restart-sensitive effects.
    pub existing_labels: HashMap<String, String>,
}

impl SessionFacts {
    /// Container paths of the volumes the session will provide.
    pub fn mount_targets(&self) -> Vec<String> {
        self.volumes.iter().map(|v| v.cont_path.clone()).collect()
    }
}

#[async_trait]
pub trait Tweak: Send + Sync {
    fn name(&self) -> &'static str;

    /// Contributes to the bundle before the image is derived and the
    /// container created.
    async fn prepare(
        &self,
        facts: &SessionFacts,
        daemon: &DaemonClient,
        bundle: &mut TweakBundle,
    ) -> anyhow::Result<()>;

    /// Re-establishes effects that do not survive a container restart,
    /// when a session reuses an existing container.
    async fn reapply(
        &self,
        _facts: &SessionFacts,
        _daemon: &DaemonClient,
        _container: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Runs the configured tweaks and enforces the never-fails contract in
/// one place.
pub struct TweakRunner {
    tweaks: Vec<Box<dyn Tweak>>,
}

impl TweakRunner {
    pub fn standard() -> Self {
        Self {
            tweaks: vec![
                Box::new(dind::DockerSocketTweak),
                Box::new(users::UserProvisioningTweak),
                Box::new(ssh::SshAgentTweak),
                Box::new(platform::MacOsPermissionsTweak),
            ],
        }
    }

    pub fn with_tweaks(tweaks: Vec<Box<dyn Tweak>>) -> Self {
        Self { tweaks }
    }

    /// Collects every tweak's contribution. Failures are logged at warn
    /// and the remaining tweaks still run.
    pub async fn collect(&self, facts: &SessionFacts, daemon: &DaemonClient) -> TweakBundle {
        let mut bundle = TweakBundle::default();
        for tweak in &self.tweaks {
            match tweak.prepare(facts, daemon, &mut bundle).await {
                Ok(()) => debug!("Tweak {} applied", tweak.name()),
                Err(e) => warn!("Tweak {} skipped: {:#}", tweak.name(), e),
            }
        }
        bundle
    }

    /// Re-applies the restart-sensitive subset against a reused
    /// container. Same never-fails contract as `collect`.
    pub async fn reapply(&self, facts: &SessionFacts, daemon: &DaemonClient, container: &str) {
        for tweak in &self.tweaks {
            if let Err(e) = tweak.reapply(facts, daemon, container).await {
                warn!("Tweak {} re-apply skipped: {:#}", tweak.name(), e);
            }
        }
    }
}
