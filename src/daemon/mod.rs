//! Thin utility layer over the daemon API: connection discovery, image
//! and container queries, pulls with architecture fallback, diffs and
//! log streaming. Higher-level lifecycle logic lives in `session`.

pub mod copy;
pub mod exec;
pub mod network;

use std::path::PathBuf;

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, ContainerSummary,
    ImageInspect, ImageSummary};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::stream::StreamExt;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::protocol::from_create_image_info;

/// Where the daemon lives, as far as the engine can tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEndpoint {
    /// Local unix socket (explicit path or the platform default).
    Socket(Option<String>),
    /// TCP endpoint; `remote` is false for loopback hosts.
    Tcp { address: String, remote: bool },
}

impl DaemonEndpoint {
    fn parse(spec: &str) -> Self {
        if let Some(path) = spec.strip_prefix("unix://") {
            return Self::Socket(Some(path.to_string()));
        }
        if spec.starts_with('/') {
            return Self::Socket(Some(spec.to_string()));
        }
        if spec.starts_with("tcp://") || spec.starts_with("http://") || spec.starts_with("https://")
        {
            let host = spec
                .split("://")
                .nth(1)
                .unwrap_or_default()
                .split(':')
                .next()
                .unwrap_or_default();
            let remote = !matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]");
            return Self::Tcp {
                address: spec.to_string(),
                remote,
            };
        }
        Self::Socket(None)
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Tcp { remote: true, .. })
    }

    /// Address an in-container client could dial, for DinD rewrites.
    pub fn tcp_address(&self) -> Option<&str> {
        match self {
            Self::Tcp { address, .. } => Some(address),
            Self::Socket(_) => None,
        }
    }
}

/// Shared handle to the daemon. Cheap to clone; every session and tweak
/// works through one of these.
#[derive(Clone)]
pub struct DaemonClient {
    pub(crate) docker: Docker,
    endpoint: DaemonEndpoint,
}

fn default_socket_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from("/var/run/docker.sock")];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".docker/run/docker.sock"));
        candidates.push(home.join(".colima/default/docker.sock"));
        candidates.push(home.join(".rd/docker.sock"));
    }
    candidates
}

/// Native architecture in the daemon's naming.
pub fn native_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Platform spec for the second pull attempt, when one applies. Only
/// arm64 hosts retry, and only toward a genuinely different
/// architecture; everywhere else the first pull error stands.
pub fn pull_retry_platform(native_arch: &str, fallback_arch: &str) -> Option<String> {
    (native_arch == "arm64" && fallback_arch != native_arch)
        .then(|| format!("linux/{fallback_arch}"))
}

/// True when this process itself runs inside a container.
pub fn running_in_container() -> bool {
    if std::path::Path::new("/.dockerenv").exists() {
        return true;
    }
    match std::fs::read_to_string("/proc/1/cgroup") {
        Ok(content) => ["docker", "containerd", "kubepods", "libpod"]
            .iter()
            .any(|marker| content.contains(marker)),
        Err(_) => false,
    }
}

/// Container id of the engine's own container, when containerized.
pub fn own_container_id() -> Option<String> {
    if !running_in_container() {
        return None;
    }
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

/// Lowercases and strips characters the daemon rejects in object names.
pub fn sanitize_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    while name.starts_with(['-', '.', '_']) {
        name.remove(0);
    }
    name.truncate(63);
    if name.is_empty() {
        name.push_str("abox");
    }
    name
}

fn label_filters(key: &str, value: &str) -> std::collections::HashMap<String, Vec<String>> {
    let mut filters = std::collections::HashMap::new();
    filters.insert("label".to_string(), vec![format!("{key}={value}")]);
    filters
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

impl DaemonClient {
    /// Connects using, in order: the engine config override, the
    /// `DOCKER_HOST` variable, the first existing default socket. The
    /// connection is verified with a version ping.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let spec = config
            .docker_host
            .clone()
            .or_else(|| std::env::var("DOCKER_HOST").ok());

        let endpoint = match spec {
            Some(spec) => DaemonEndpoint::parse(&spec),
            None => {
                let found = default_socket_candidates()
                    .into_iter()
                    .find(|p| p.exists())
                    .map(|p| p.to_string_lossy().into_owned());
                DaemonEndpoint::Socket(found)
            }
        };

        let docker = match &endpoint {
            DaemonEndpoint::Socket(Some(path)) => {
                Docker::connect_with_socket(path, 120, &API_DEFAULT_VERSION)?
            }
            DaemonEndpoint::Socket(None) => Docker::connect_with_socket_defaults()?,
            DaemonEndpoint::Tcp { address, .. } => {
                Docker::connect_with_http(address, 120, &API_DEFAULT_VERSION)?
            }
        };

        let version = docker.version().await?;
        info!(
            "Connected to daemon version {} at {:?}",
            version.version.unwrap_or_default(),
            endpoint
        );

        Ok(Self { docker, endpoint })
    }

    pub fn endpoint(&self) -> &DaemonEndpoint {
        &self.endpoint
    }

    pub fn is_remote(&self) -> bool {
        self.endpoint.is_remote()
    }

    /// Pulls one reference, streaming normalized progress into the
    /// context sink when debugging.
    pub async fn pull_image(
        &self,
        reference: &str,
        platform: Option<&str>,
        ctx: &RunContext,
    ) -> Result<()> {
        info!("Pulling image {} (platform {:?})", reference, platform);
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            platform: platform.unwrap_or_default().to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(item) = stream.next().await {
            let item = item.map_err(|e| EngineError::Pull {
                reference: reference.to_string(),
                reason: e.to_string(),
            })?;
            for message in from_create_image_info(item) {
                if let crate::protocol::ResponseMessage::Error(error) = message {
                    return Err(EngineError::Pull {
                        reference: reference.to_string(),
                        reason: error,
                    });
                }
                if ctx.debug {
                    ctx.emit(&message.summary());
                } else {
                    debug!("Pull: {}", message.summary());
                }
            }
        }
        Ok(())
    }

    /// Pulls for the native architecture; on arm64 hosts a failed pull is
    /// retried for the configured fallback architecture as the normal
    /// path. Returns the platform that ended up pulled, when explicit.
    pub async fn pull_with_fallback(
        &self,
        reference: &str,
        fallback_arch: &str,
        ctx: &RunContext,
    ) -> Result<Option<String>> {
        match self.pull_image(reference, None, ctx).await {
            Ok(()) => Ok(None),
            Err(native_err) => match pull_retry_platform(native_arch(), fallback_arch) {
                Some(platform) => {
                    info!(
                        "Native pull of {} failed ({}), retrying as {}",
                        reference, native_err, platform
                    );
                    self.pull_image(reference, Some(&platform), ctx).await?;
                    Ok(Some(platform))
                }
                None => Err(native_err),
            },
        }
    }

    pub async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInspect>> {
        match self.docker.inspect_image(reference).await {
            Ok(inspect) => Ok(Some(inspect)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn image_exists(&self, reference: &str) -> Result<bool> {
        Ok(self.inspect_image(reference).await?.is_some())
    }

    /// Whether the image's declared OS is a Linux family.
    pub async fn image_is_linux(&self, reference: &str) -> Result<bool> {
        let inspect = self.inspect_image(reference).await?;
        Ok(inspect
            .and_then(|i| i.os)
            .map(|os| os.eq_ignore_ascii_case("linux"))
            .unwrap_or(true))
    }

    pub async fn list_images_by_label(&self, key: &str, value: &str) -> Result<Vec<ImageSummary>> {
        let options = ListImagesOptions {
            all: false,
            filters: label_filters(key, value),
            ..Default::default()
        };
        Ok(self.docker.list_images(Some(options)).await?)
    }

    pub async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInspectResponse>> {
        match self.docker.inspect_container(id, None).await {
            Ok(inspect) => Ok(Some(inspect)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn container_exists(&self, id: &str) -> Result<bool> {
        Ok(self.inspect_container(id).await?.is_some())
    }

    pub async fn is_container_running(&self, id: &str) -> Result<bool> {
        let inspect = self.inspect_container(id).await?;
        Ok(inspect
            .and_then(|i| i.state)
            .and_then(|s| s.status)
            .map(|s| s == ContainerStateStatusEnum::RUNNING)
            .unwrap_or(false))
    }

    pub async fn list_containers_by_label(
        &self,
        key: &str,
        value: &str,
        all: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions {
            all,
            filters: label_filters(key, value),
            ..Default::default()
        };
        Ok(self.docker.list_containers(Some(options)).await?)
    }

    /// Creates a named container, optionally pinned to a platform when
    /// the image was pulled for a foreign architecture.
    pub async fn create_container(
        &self,
        name: &str,
        platform: Option<&str>,
        config: Config<String>,
    ) -> Result<String> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: platform.map(str::to_string),
        };
        let response = self.docker.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            warn!("Daemon warning creating {}: {}", name, warning);
        }
        debug!("Created container {} ({})", name, response.id);
        Ok(response.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        info!("Started container {}", id);
        Ok(())
    }

    pub async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<()> {
        let options = StopContainerOptions { t: timeout_secs };
        self.docker.stop_container(id, Some(options)).await?;
        Ok(())
    }

    pub async fn kill_container(&self, id: &str) -> Result<()> {
        match self
            .docker
            .kill_container(id, None::<bollard::container::KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Force-removes a container together with its anonymous volumes.
    pub async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn wait_container(&self, id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(EngineError::Stream(
                "container wait ended without a status".to_string(),
            )),
        }
    }

    pub async fn volume_exists(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Filesystem changes relative to the image, classified.
    pub async fn container_diff(&self, id: &str) -> Result<Vec<DiffEntry>> {
        let changes = self.docker.container_changes(id).await?.unwrap_or_default();
        Ok(changes
            .into_iter()
            .map(|change| DiffEntry {
                kind: DiffKind::classify(serde_json::to_value(&change.kind).ok()),
                path: change.path,
            })
            .collect())
    }

    /// Spawns a task that follows the container's log stream and writes
    /// complete lines to the context sink. The task ends when the stream
    /// does; dropping the handle detaches it.
    pub fn follow_logs(
        &self,
        id: &str,
        since: Option<chrono::DateTime<chrono::Utc>>,
        ctx: &RunContext,
    ) -> tokio::task::JoinHandle<()> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            since: since.map(|t| t.timestamp()).unwrap_or(0),
            tail: "all".to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let ctx = ctx.clone();
        let id = id.to_string();

        tokio::spawn(async move {
            let mut pending = String::new();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => {
                        pending.push_str(&chunk.to_string());
                        while let Some(pos) = pending.find('\n') {
                            let line: String = pending.drain(..=pos).collect();
                            ctx.emit(line.trim_end_matches(['\n', '\r']));
                        }
                    }
                    Err(e) => {
                        warn!("Log stream for {} ended: {}", id, e);
                        break;
                    }
                }
            }
            if !pending.is_empty() {
                ctx.emit(pending.trim_end_matches(['\n', '\r']));
            }
        })
    }

}

/// One classified entry of a container diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub kind: DiffKind,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    Modified,
    Added,
    Deleted,
    Unknown,
}

impl DiffKind {
    /// The daemon encodes the change kind as 0/1/2, some proxies as
    /// strings; both spellings classify.
    fn classify(value: Option<serde_json::Value>) -> Self {
        match value {
            Some(serde_json::Value::Number(n)) => match n.as_i64() {
                Some(0) => Self::Modified,
                Some(1) => Self::Added,
                Some(2) => Self::Deleted,
                _ => Self::Unknown,
            },
            Some(serde_json::Value::String(s)) => match s.as_str() {
                "0" | "C" | "modified" => Self::Modified,
                "1" | "A" | "added" => Self::Added,
                "2" | "D" | "deleted" => Self::Deleted,
                _ => Self::Unknown,
            },
            _ => Self::Unknown,
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            Self::Modified => 'C',
            Self::Added => 'A',
            Self::Deleted => 'D',
            Self::Unknown => '?',
        }
    }
}

/// Client with no verified connection, for unit tests that exercise
/// code paths returning before any daemon call. The http transport
/// defers dialing until the first request, so construction succeeds
/// with no socket and no daemon anywhere.
#[cfg(test)]
pub(crate) fn test_client() -> DaemonClient {
    DaemonClient {
        docker: Docker::connect_with_http("http://127.0.0.1:2375", 4, API_DEFAULT_VERSION)
            .expect("test client"),
        endpoint: DaemonEndpoint::Socket(None),
    }
}
