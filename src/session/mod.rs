//! Container session lifecycle: configuration hashing, reuse discovery,
//! derived-image preparation, container creation, command execution and
//! teardown.

pub mod hash;
pub mod runspec;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bollard::container::Config;
use bollard::models::{HostConfig, Mount, PortBinding};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelContext;
use crate::config::EngineConfig;
use crate::context::RunContext;
use crate::daemon::{running_in_container, sanitize_name, DaemonClient, DiffEntry};
use crate::distro::{parse_os_release, OsDistribution};
use crate::error::{EngineError, Result};
use crate::image::{DerivedImageParts, ImageBuilder, CONFIG_HASH_LABEL, RUN_ID_LABEL};
use crate::registry::RegistryAuth;
use crate::tweaks::users::host_identity;
use crate::tweaks::{HostOs, PostCreateAction, SessionFacts, TweakBundle, TweakRunner};
use crate::volume::{resolve_approach, ApproachContext, Volume, VolumeApproach};

/// A host-to-container TCP port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl PortMapping {
    /// Parses `host:container` or a single port mapped onto itself.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || EngineError::Session(format!("invalid port mapping '{spec}'"));
        match spec.split_once(':') {
            Some((host, container)) => Ok(Self {
                host: host.parse().map_err(|_| invalid())?,
                container: container.parse().map_err(|_| invalid())?,
            }),
            None => {
                let port: u16 = spec.parse().map_err(|_| invalid())?;
                Ok(Self {
                    host: port,
                    container: port,
                })
            }
        }
    }

    pub fn spec_string(&self) -> String {
        format!("{}:{}", self.host, self.container)
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unprepared,
    FoundExisting,
    Created,
    Running,
    Detached,
    Completed,
    Destroyed,
}

/// Caller-facing configuration of one session. Everything that shapes
/// the container's behavior feeds the config hash; bookkeeping fields
/// (run id, exec commands, reuse flags) do not.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub run_id: String,
    pub image: String,
    /// Host mappings provisioned per the session's volume approach.
    pub bind_volumes: Vec<Volume>,
    /// Named daemon volumes, always mounted and asserted to exist.
    pub mount_volumes: Vec<Volume>,
    pub ports: Vec<PortMapping>,
    pub privileged: bool,
    pub mount_docker_socket: bool,
    pub allow_reuse: bool,
    pub cleanup_orphans: bool,
    pub disable_cache: bool,
    pub env: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub command: Option<Vec<String>>,
    /// Commands executed sequentially inside the running container.
    pub exec_commands: Vec<String>,
    /// Extra RUN lines for the derived build image.
    pub build_commands: Vec<String>,
    pub user: Option<String>,
    pub simulated_os: Option<String>,
    pub ci_name: Option<String>,
    pub approach: VolumeApproach,
    /// Approach used when `Bind` is downgraded.
    pub fallback_approach: VolumeApproach,
    pub create_network: bool,
    pub detach: bool,
    /// Treat a nonzero exit of the container's own command as an error.
    pub fatal_exit: bool,
}

impl SessionSettings {
    pub fn new(run_id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            image: image.into(),
            bind_volumes: Vec::new(),
            mount_volumes: Vec::new(),
            ports: Vec::new(),
            privileged: false,
            mount_docker_socket: false,
            allow_reuse: false,
            cleanup_orphans: false,
            disable_cache: false,
            env: Vec::new(),
            entrypoint: None,
            command: None,
            exec_commands: Vec::new(),
            build_commands: Vec::new(),
            user: None,
            simulated_os: None,
            ci_name: None,
            approach: VolumeApproach::Bind,
            fallback_approach: VolumeApproach::Copy,
            create_network: false,
            detach: false,
            fatal_exit: true,
        }
    }
}

/// One build step's container, from configuration to teardown. The
/// session is the single writer of its own derived state; background
/// tasks only ever stream output.
pub struct ContainerSession {
    daemon: DaemonClient,
    config: EngineConfig,
    cancel: Arc<CancelContext>,
    tweaks: Arc<TweakRunner>,
    auth: Arc<RegistryAuth>,
    pub settings: SessionSettings,

    state: SessionState,
    container_id: Option<String>,
    network: Option<String>,
    distro: Option<OsDistribution>,
    config_hash: Option<String>,
    approach: Option<VolumeApproach>,
    pulled_platform: Option<String>,
    uses_default_command: bool,
    cleanup_id: Option<u64>,
    log_task: Option<tokio::task::JoinHandle<()>>,
}

impl ContainerSession {
    pub fn new(
        daemon: DaemonClient,
        config: EngineConfig,
        cancel: Arc<CancelContext>,
        tweaks: Arc<TweakRunner>,
        auth: Arc<RegistryAuth>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            daemon,
            config,
            cancel,
            tweaks,
            auth,
            settings,
            state: SessionState::Unprepared,
            container_id: None,
            network: None,
            distro: None,
            config_hash: None,
            approach: None,
            pulled_platform: None,
            uses_default_command: false,
            cleanup_id: None,
            log_task: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn config_hash(&self) -> Option<&str> {
        self.config_hash.as_deref()
    }

    pub fn distro(&self) -> Option<&OsDistribution> {
        self.distro.as_ref()
    }

    /// Full lifecycle: prepare (or adopt), execute, and tear down unless
    /// the container is kept for reuse or left detached.
    pub async fn run(&mut self, ctx: &RunContext) -> Result<()> {
        let prepared = if matches!(self.state, SessionState::Unprepared) {
            self.prepare(ctx).await
        } else {
            Ok(())
        };
        let outcome = match prepared {
            Ok(()) => self.execute(ctx).await,
            Err(e) => Err(e),
        };

        let keep = self.settings.allow_reuse || (self.settings.detach && outcome.is_ok());
        if !keep {
            self.destroy_defensively().await;
        }
        outcome
    }

    /// Computes the config hash, sweeps stale objects under this run id
    /// when asked, and either adopts a hash-matching container or
    /// creates a fresh one.
    pub async fn prepare(&mut self, ctx: &RunContext) -> Result<()> {
        if !matches!(self.state, SessionState::Unprepared) {
            return Err(EngineError::Session(
                "session was already prepared".to_string(),
            ));
        }

        let config_hash = hash::compute(&self.settings)?;
        debug!(
            "Session {} config hash {}",
            self.settings.run_id, config_hash
        );
        self.config_hash = Some(config_hash.clone());

        if self.settings.cleanup_orphans || !self.settings.allow_reuse {
            self.sweep_labeled().await?;
        }

        if self.settings.allow_reuse {
            let candidates = self
                .daemon
                .list_containers_by_label(CONFIG_HASH_LABEL, &config_hash, true)
                .await?;
            if let Some(existing) = candidates.first() {
                if let Some(id) = existing.id.clone() {
                    return self.adopt_existing(id, &config_hash, ctx).await;
                }
            }
        }

        self.create(ctx).await
    }

    /// Removes every container and network labeled with this run id.
    /// Containers go first (and in parallel) so their networks can be
    /// deleted afterwards.
    async fn sweep_labeled(&self) -> Result<()> {
        let run_id = &self.settings.run_id;
        let (containers, networks) = tokio::try_join!(
            self.daemon
                .list_containers_by_label(RUN_ID_LABEL, run_id, true),
            self.daemon.list_networks_by_label(RUN_ID_LABEL, run_id),
        )?;

        if containers.is_empty() && networks.is_empty() {
            return Ok(());
        }
        info!(
            "Sweeping {} container(s) and {} network(s) labeled {}",
            containers.len(),
            networks.len(),
            run_id
        );

        let removals = containers
            .iter()
            .filter_map(|c| c.id.as_deref())
            .map(|id| self.daemon.remove_container(id));
        futures::future::try_join_all(removals).await?;

        for network in &networks {
            if let Some(name) = &network.name {
                self.daemon.remove_network(name).await?;
            }
        }
        Ok(())
    }

    /// Takes over a container whose config-hash label matches. The
    /// container is started when stopped, and restart-sensitive tweaks
    /// are re-applied.
    async fn adopt_existing(&mut self, id: String, config_hash: &str, ctx: &RunContext) -> Result<()> {
        info!("Reusing container {} for hash {}", id, config_hash);

        let inspect = self
            .daemon
            .inspect_container(&id)
            .await?
            .ok_or_else(|| EngineError::Session(format!("container {id} vanished during reuse")))?;
        let existing_labels = inspect
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default();

        if !self.daemon.is_container_running(&id).await? {
            self.daemon.start_container(&id).await?;
        }

        let image_is_linux = self.daemon.image_is_linux(&self.settings.image).await?;
        let approach = resolve_approach(
            self.settings.approach,
            self.settings.fallback_approach,
            &ApproachContext {
                inside_container: running_in_container(),
                remote_daemon: self.daemon.is_remote(),
                image_is_linux,
            },
        );
        self.approach = Some(approach);

        let distro = self.detect_running_distro(&id).await;
        let facts = self.facts(approach, &distro, existing_labels);
        self.distro = Some(distro);
        self.tweaks.reapply(&facts, &self.daemon, &id).await;

        if approach == VolumeApproach::Copy {
            self.copy_volumes_in(&id).await?;
        }

        self.uses_default_command =
            self.settings.command.is_none() && self.settings.exec_commands.is_empty();
        if self.uses_default_command || self.settings.detach {
            // Follow from now; replaying the container's whole history
            // would duplicate output from earlier runs.
            self.log_task = Some(self.daemon.follow_logs(&id, Some(chrono::Utc::now()), ctx));
        }
        self.container_id = Some(id);
        self.state = SessionState::FoundExisting;
        Ok(())
    }

    /// Builds the derived image and creates and starts a fresh
    /// container for this session.
    async fn create(&mut self, ctx: &RunContext) -> Result<()> {
        let config_hash = self
            .config_hash
            .clone()
            .ok_or_else(|| EngineError::Session("create before prepare".to_string()))?;
        let image = self.settings.image.clone();

        if !self.daemon.image_exists(&image).await? {
            self.pulled_platform = self
                .daemon
                .pull_with_fallback(&image, &self.config.pull_fallback_arch, ctx)
                .await?;
        }
        let image_is_linux = self.daemon.image_is_linux(&image).await?;

        let approach = resolve_approach(
            self.settings.approach,
            self.settings.fallback_approach,
            &ApproachContext {
                inside_container: running_in_container(),
                remote_daemon: self.daemon.is_remote(),
                image_is_linux,
            },
        );
        self.approach = Some(approach);
        debug!(
            "Session {} uses the {} volume approach",
            self.settings.run_id,
            approach.as_str()
        );

        let distro = self.detect_image_distro(&image, image_is_linux).await;
        let facts = self.facts(approach, &distro, HashMap::new());
        self.distro = Some(distro);
        let bundle = self.tweaks.collect(&facts, &self.daemon).await;

        // Non-Linux bases cannot carry a derived layer; they run with
        // their declared entrypoint and command untouched.
        let run_image = if image_is_linux {
            let mut parts = DerivedImageParts {
                mount_targets: self.all_mount_targets(&bundle),
                build_commands: self.settings.build_commands.clone(),
                add_entries: Vec::new(),
            };
            parts
                .build_commands
                .extend(bundle.build_commands.iter().cloned());
            if approach == VolumeApproach::Add {
                parts.add_entries = self
                    .settings
                    .bind_volumes
                    .iter()
                    .map(|v| (PathBuf::from(&v.host_path), v.cont_path.clone()))
                    .collect();
            }

            let builder = ImageBuilder::new(
                self.daemon.clone(),
                self.auth.clone(),
                self.config.disable_image_cache || self.settings.disable_cache,
            );
            builder
                .build_derived(&image, &self.settings.run_id, &config_hash, &parts, ctx)
                .await?
        } else {
            image
        };

        self.assert_named_volumes(approach).await?;

        let network_mode = if self.settings.create_network {
            let name = format!("abox-{}", sanitize_name(&self.settings.run_id));
            let mut labels = HashMap::new();
            labels.insert(RUN_ID_LABEL.to_string(), self.settings.run_id.clone());
            self.daemon.ensure_network(&name, labels).await?;
            self.network = Some(name.clone());
            Some(name)
        } else {
            None
        };

        let mounts = build_mounts(
            approach,
            &self.settings.bind_volumes,
            &self.settings.mount_volumes,
            &bundle,
        );
        let (command, uses_default) = choose_command(&self.settings);
        self.uses_default_command = uses_default;
        let (exposed_ports, port_bindings) = port_maps(&self.settings.ports);

        let host_config = HostConfig {
            mounts: (!mounts.is_empty()).then_some(mounts),
            privileged: Some(self.settings.privileged),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            network_mode,
            ..Default::default()
        };
        let container_config = Config::<String> {
            image: Some(run_image),
            cmd: command,
            entrypoint: self.settings.entrypoint.clone(),
            env: Some(merged_env(&self.settings, &bundle)),
            user: self.settings.user.clone(),
            labels: Some(session_labels(
                &self.settings.run_id,
                &config_hash,
                &bundle,
            )),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = container_name(&self.settings.run_id, &config_hash);
        let id = self
            .daemon
            .create_container(&name, self.pulled_platform.as_deref(), container_config)
            .await?;
        self.container_id = Some(id.clone());
        self.state = SessionState::Created;

        // Interrupts tear the session down unless reuse was requested.
        if !self.settings.allow_reuse {
            let daemon = self.daemon.clone();
            let container = id.clone();
            let network = self.network.clone();
            let stop_timeout = self.config.stop_timeout_secs;
            self.cleanup_id = Some(self.cancel.register(move || async move {
                if let Err(e) = destroy_resources(
                    &daemon,
                    Some(&container),
                    network.as_deref(),
                    stop_timeout,
                )
                .await
                {
                    debug!("Interrupt cleanup for {} incomplete: {}", container, e);
                }
            }));
        }

        self.daemon.start_container(&id).await?;
        self.apply_post_create(&bundle, &id).await;
        self.run_init_commands(&bundle, &id).await;

        if approach == VolumeApproach::Copy {
            self.copy_volumes_in(&id).await?;
        }

        if uses_default || self.settings.detach {
            self.log_task = Some(self.daemon.follow_logs(&id, None, ctx));
        }
        Ok(())
    }

    /// Runs the session's work: waits for the container's own command,
    /// or executes the supplied commands sequentially. The first failed
    /// command aborts the rest.
    async fn execute(&mut self, ctx: &RunContext) -> Result<()> {
        let id = self
            .container_id
            .clone()
            .ok_or_else(|| EngineError::Session("no container to run in".to_string()))?;
        self.state = SessionState::Running;
        let approach = self.approach.unwrap_or(self.settings.approach);

        if self.settings.exec_commands.is_empty() {
            if self.settings.detach {
                self.state = SessionState::Detached;
                return Ok(());
            }
            let code = self.daemon.wait_container(&id).await?;
            if approach.copies_back() {
                self.daemon
                    .copy_back_volumes(&id, &self.settings.bind_volumes)
                    .await?;
            }
            self.state = SessionState::Completed;
            if code != 0 && self.settings.fatal_exit {
                return Err(EngineError::ContainerExited {
                    container: id,
                    code,
                });
            }
            return Ok(());
        }

        for command in &self.settings.exec_commands {
            ctx.run_before_hook(command)
                .map_err(|e| EngineError::Session(format!("before-exec hook failed: {e:#}")))?;
            let code = self.daemon.exec_streamed(&id, command, ctx).await?;
            ctx.run_after_hook(command)
                .map_err(|e| EngineError::Session(format!("after-exec hook failed: {e:#}")))?;
            if code != 0 {
                return Err(EngineError::CommandFailed {
                    container: id,
                    command: command.clone(),
                    code,
                });
            }
        }

        if approach.copies_back() {
            self.daemon
                .copy_back_volumes(&id, &self.settings.bind_volumes)
                .await?;
        }
        self.state = if self.settings.detach {
            SessionState::Detached
        } else {
            SessionState::Completed
        };
        Ok(())
    }

    /// Interactive command in the session's container, attached to the
    /// caller's terminal.
    pub async fn exec_interactive(&self, command: &str, ctx: &RunContext) -> Result<i64> {
        let id = self
            .container_id
            .as_deref()
            .ok_or_else(|| EngineError::Session("no container to attach to".to_string()))?;
        self.daemon.exec_interactive(id, command, ctx).await
    }

    /// Filesystem changes the session made relative to its image.
    pub async fn diff(&self) -> Result<Vec<DiffEntry>> {
        let id = self
            .container_id
            .as_deref()
            .ok_or_else(|| EngineError::Session("no container to diff".to_string()))?;
        self.daemon.container_diff(id).await
    }

    /// Explicit teardown; failures to remove daemon objects are
    /// surfaced.
    pub async fn destroy(&mut self) -> Result<()> {
        let result = self.teardown().await;
        self.state = SessionState::Destroyed;
        result
    }

    /// Teardown on behalf of an error path or end-of-run cleanup. Never
    /// fails; an incomplete removal must not mask the run's own result.
    async fn destroy_defensively(&mut self) {
        if let Err(e) = self.teardown().await {
            debug!(
                "Defensive teardown of session {} incomplete: {}",
                self.settings.run_id, e
            );
        }
        self.state = SessionState::Destroyed;
    }

    async fn teardown(&mut self) -> Result<()> {
        if let Some(task) = self.log_task.take() {
            task.abort();
        }
        if let Some(id) = self.cleanup_id.take() {
            self.cancel.deregister(id);
        }
        let container = self.container_id.take();
        let network = self.network.take();
        destroy_resources(
            &self.daemon,
            container.as_deref(),
            network.as_deref(),
            self.config.stop_timeout_secs,
        )
        .await
    }

    async fn copy_volumes_in(&self, container: &str) -> Result<()> {
        for volume in &self.settings.bind_volumes {
            self.daemon
                .copy_to_container(container, Path::new(&volume.host_path), &volume.cont_path)
                .await?;
        }
        Ok(())
    }

    /// Named volumes must exist before the container references them.
    async fn assert_named_volumes(&self, approach: VolumeApproach) -> Result<()> {
        let mut named: Vec<&Volume> = self.settings.mount_volumes.iter().collect();
        if approach == VolumeApproach::Volume {
            named.extend(self.settings.bind_volumes.iter());
        }
        for volume in named {
            let name = volume.effective_name();
            if !self.daemon.volume_exists(&name).await? {
                return Err(EngineError::NamedVolumeMissing(name));
            }
        }
        Ok(())
    }

    async fn apply_post_create(&self, bundle: &TweakBundle, container: &str) {
        for action in &bundle.post_create {
            let result = match action {
                PostCreateAction::ConnectNetwork { network } => {
                    self.daemon.connect_network(network, container).await
                }
                PostCreateAction::Exec { user, command } => self
                    .daemon
                    .exec_capture(container, shell(command), user.as_deref())
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = result {
                warn!("Post-create action skipped: {}", e);
            }
        }
    }

    async fn run_init_commands(&self, bundle: &TweakBundle, container: &str) {
        for init in &bundle.init_commands {
            let result = if init.detach {
                self.daemon
                    .exec_detached(container, shell(&init.command), init.user.as_deref())
                    .await
            } else {
                match self
                    .daemon
                    .exec_capture(container, shell(&init.command), init.user.as_deref())
                    .await
                {
                    Ok((0, _)) => Ok(()),
                    Ok((code, output)) => {
                        warn!(
                            "Init command '{}' exited {}: {}",
                            init.command,
                            code,
                            output.trim()
                        );
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = result {
                warn!("Init command '{}' skipped: {}", init.command, e);
            }
        }
    }

    fn facts(
        &self,
        approach: VolumeApproach,
        distro: &OsDistribution,
        existing_labels: HashMap<String, String>,
    ) -> SessionFacts {
        let (host_uid, host_gid, identity_name) = host_identity();
        let host_username = self.settings.user.clone().unwrap_or(identity_name);
        let mirror_host_user = self
            .settings
            .user
            .as_deref()
            .map(|u| u != "root")
            .unwrap_or(false);

        let mut volumes = self.settings.bind_volumes.clone();
        volumes.extend(self.settings.mount_volumes.iter().cloned());

        SessionFacts {
            run_id: self.settings.run_id.clone(),
            image: self.settings.image.clone(),
            volumes,
            approach,
            mount_docker_socket: self.settings.mount_docker_socket,
            privileged: self.settings.privileged,
            inside_container: running_in_container(),
            remote_daemon: self.daemon.is_remote(),
            daemon_tcp_address: self
                .daemon
                .endpoint()
                .tcp_address()
                .map(|a| a.to_string()),
            host_os: HostOs::detect(),
            distro_family: distro.family,
            mirror_host_user,
            host_uid,
            host_gid,
            host_username,
            existing_labels,
        }
    }

    /// Every container path a mount will cover, including paths the
    /// tweaks contribute. The derived image guards each one against
    /// stale symlinks.
    fn all_mount_targets(&self, bundle: &TweakBundle) -> Vec<String> {
        self.settings
            .bind_volumes
            .iter()
            .chain(self.settings.mount_volumes.iter())
            .chain(bundle.extra_volumes.iter())
            .map(|v| v.cont_path.clone())
            .collect()
    }

    async fn detect_image_distro(&self, image: &str, image_is_linux: bool) -> OsDistribution {
        if let Some(simulated) = &self.settings.simulated_os {
            return OsDistribution::from_id(simulated);
        }
        if !image_is_linux {
            return OsDistribution::from_id("");
        }
        match self.probe_os_release(image).await {
            Ok(Some(content)) => parse_os_release(&content),
            Ok(None) => OsDistribution::from_id(""),
            Err(e) => {
                debug!("OS probe for {} failed: {}", image, e);
                OsDistribution::from_id("")
            }
        }
    }

    async fn detect_running_distro(&self, container: &str) -> OsDistribution {
        if let Some(simulated) = &self.settings.simulated_os {
            return OsDistribution::from_id(simulated);
        }
        match self
            .daemon
            .exec_capture(container, shell("cat /etc/os-release"), None)
            .await
        {
            Ok((0, output)) => parse_os_release(&output),
            Ok((code, _)) => {
                debug!("os-release read in {} exited {}", container, code);
                OsDistribution::from_id("")
            }
            Err(e) => {
                debug!("os-release read in {} failed: {}", container, e);
                OsDistribution::from_id("")
            }
        }
    }

    /// Reads `/etc/os-release` out of a throwaway created (never
    /// started) container, through the archive endpoint.
    async fn probe_os_release(&self, image: &str) -> Result<Option<String>> {
        let name = format!("abox-probe-{}", Uuid::new_v4());
        let config = Config::<String> {
            image: Some(image.to_string()),
            cmd: Some(vec!["/bin/sh".to_string()]),
            ..Default::default()
        };
        let id = self
            .daemon
            .create_container(&name, self.pulled_platform.as_deref(), config)
            .await?;

        let content = self.daemon.read_container_file(&id, "/etc/os-release").await;
        if let Err(e) = self.daemon.remove_container(&id).await {
            debug!("Probe container {} not removed: {}", id, e);
        }
        content
    }
}

fn shell(command: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command.to_string()]
}

fn container_name(run_id: &str, config_hash: &str) -> String {
    format!(
        "abox-{}-{}",
        sanitize_name(run_id),
        &config_hash[..12.min(config_hash.len())]
    )
}

/// The container's command and whether the image default is in play.
/// Sessions that exec commands need a live target, so an idle keepalive
/// stands in when no command override was supplied.
fn choose_command(settings: &SessionSettings) -> (Option<Vec<String>>, bool) {
    match &settings.command {
        Some(command) => (Some(command.clone()), false),
        None if !settings.exec_commands.is_empty() => (
            Some(vec!["sleep".to_string(), "infinity".to_string()]),
            false,
        ),
        None => (None, true),
    }
}

fn merged_env(settings: &SessionSettings, bundle: &TweakBundle) -> Vec<String> {
    let mut env = settings.env.clone();
    env.extend(bundle.extra_env.iter().cloned());
    env
}

fn session_labels(
    run_id: &str,
    config_hash: &str,
    bundle: &TweakBundle,
) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(RUN_ID_LABEL.to_string(), run_id.to_string());
    labels.insert(CONFIG_HASH_LABEL.to_string(), config_hash.to_string());
    labels.extend(bundle.extra_labels.clone());
    labels
}

/// Daemon mount specs for the resolved approach. Session volumes follow
/// the approach; named mount volumes and tweak-contributed paths are
/// mounted regardless.
fn build_mounts(
    approach: VolumeApproach,
    bind_volumes: &[Volume],
    mount_volumes: &[Volume],
    bundle: &TweakBundle,
) -> Vec<Mount> {
    let mut mounts: Vec<Mount> = Vec::new();
    match approach {
        VolumeApproach::Bind => {
            mounts.extend(bind_volumes.iter().map(Volume::to_bind_mount));
        }
        VolumeApproach::Volume => {
            mounts.extend(bind_volumes.iter().map(Volume::to_named_mount));
        }
        VolumeApproach::Copy | VolumeApproach::Add | VolumeApproach::External => {}
    }
    mounts.extend(mount_volumes.iter().map(Volume::to_named_mount));
    mounts.extend(bundle.extra_volumes.iter().map(Volume::to_bind_mount));
    mounts
}

fn port_maps(
    ports: &[PortMapping],
) -> (
    HashMap<String, HashMap<(), ()>>,
    HashMap<String, Option<Vec<PortBinding>>>,
) {
    let mut exposed = HashMap::new();
    let mut bindings = HashMap::new();
    for port in ports {
        let key = format!("{}/tcp", port.container);
        exposed.insert(key.clone(), HashMap::new());
        bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(port.host.to_string()),
            }]),
        );
    }
    (exposed, bindings)
}

/// Best-effort removal of a session's daemon objects: graceful stop,
/// then kill, then disconnect from the session network, then forced
/// removal with volumes, then the network itself. The first removal
/// error is reported; stop, kill and disconnect hiccups are not.
async fn destroy_resources(
    daemon: &DaemonClient,
    container: Option<&str>,
    network: Option<&str>,
    stop_timeout: i64,
) -> Result<()> {
    let mut first_error = None;
    if let Some(id) = container {
        if let Err(e) = daemon.stop_container(id, stop_timeout).await {
            debug!("Stop of {} skipped: {}", id, e);
        }
        if let Err(e) = daemon.kill_container(id).await {
            debug!("Kill of {} skipped: {}", id, e);
        }
        if let Some(name) = network {
            if let Err(e) = daemon.disconnect_network(name, id, true).await {
                debug!("Disconnect of {} from {} skipped: {}", id, name, e);
            }
        }
        match daemon.remove_container(id).await {
            Ok(()) => info!("Destroyed container {}", id),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(name) = network {
        if let Err(e) = daemon.remove_network(name).await {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
