//! Engine facade: one connected value bundling the daemon client,
//! configuration, staging and cancellation, with the `RunSpec` entry
//! point collaborators drive the engine through, plus host-side command
//! execution.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use super::{ContainerSession, SessionSettings};
use crate::cancel::CancelContext;
use crate::config::EngineConfig;
use crate::context::{OutputSink, RunContext};
use crate::daemon::DaemonClient;
use crate::error::{EngineError, Result};
use crate::image::{derived_tag, DockerfileSpec, ImageBuilder};
use crate::registry::RegistryAuth;
use crate::staging::StagingArea;
use crate::tweaks::TweakRunner;
use crate::volume::{Volume, VolumeApproach};

/// One build step to run in a container, as collaborators describe it.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub run_id: String,
    /// Registry image to run in; ignored when `custom_image` is set.
    pub image: Option<String>,
    /// Dockerfile to build and run instead of a registry image.
    pub custom_image: Option<CustomImage>,
    pub commands: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    /// Volume specs in `host:cont[:mode]` form.
    pub volumes: Vec<String>,
    pub user: Option<String>,
    pub allow_reuse: bool,
}

/// A Dockerfile build requested by a run spec.
#[derive(Debug, Clone)]
pub struct CustomImage {
    pub dockerfile: PathBuf,
    pub context: Option<PathBuf>,
    pub build_args: Vec<(String, String)>,
}

/// What a run produced: the step's exit code and its captured output.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: i64,
    pub output: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Parses volume specs into the settings. When an external sync tool
/// owns content placement the engine provisions nothing itself.
pub fn configure_volumes(
    settings: &mut SessionSettings,
    specs: &[String],
    external_sync: bool,
) -> Result<()> {
    for spec in specs {
        settings.bind_volumes.push(Volume::parse(spec)?);
    }
    if external_sync {
        settings.approach = VolumeApproach::External;
    }
    Ok(())
}

fn spec_settings(spec: &RunSpec, image: String) -> Result<SessionSettings> {
    let mut settings = SessionSettings::new(spec.run_id.clone(), image);
    settings.env = spec.env.clone();
    settings.exec_commands = spec.commands.clone();
    settings.user = spec.user.clone();
    settings.allow_reuse = spec.allow_reuse;
    configure_volumes(&mut settings, &spec.volumes, false)?;
    Ok(settings)
}

/// Runs a shell command on the host, streaming its output lines into
/// the context sink. Nonzero exits are errors carrying the code.
pub async fn run_on_host(command: &str, ctx: &RunContext) -> Result<()> {
    info!("Running on host: {}", command);
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    if let Some(dir) = &ctx.working_dir {
        cmd.current_dir(dir);
    }
    for entry in &ctx.env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let stdout_task = child.stdout.take().map(|out| {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                ctx.emit(&line);
            }
        })
    });
    let stderr_task = child.stderr.take().map(|err| {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                ctx.emit(&line);
            }
        })
    });

    let status = child.wait().await?;
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    if !status.success() {
        return Err(EngineError::HostCommandFailed {
            command: command.to_string(),
            code: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

/// A connected engine. Holds everything sessions need so collaborators
/// construct one of these and hand out sessions from it.
pub struct Engine {
    daemon: DaemonClient,
    config: EngineConfig,
    staging: Arc<StagingArea>,
    cancel: Arc<CancelContext>,
    tweaks: Arc<TweakRunner>,
    auth: Arc<RegistryAuth>,
}

impl Engine {
    /// Connects to the daemon and sets up the process-wide contexts. The
    /// interrupt handler is installed once; losing it is not fatal.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let daemon = DaemonClient::connect(&config).await?;
        let staging = Arc::new(StagingArea::new(&config.staging_root)?);
        let cancel = CancelContext::new();
        if let Err(e) = cancel.install_signal_handler() {
            warn!("Interrupt handler not installed: {}", e);
        }

        Ok(Self {
            daemon,
            config,
            staging,
            cancel,
            tweaks: Arc::new(TweakRunner::standard()),
            auth: Arc::new(RegistryAuth::load()),
        })
    }

    pub fn daemon(&self) -> &DaemonClient {
        &self.daemon
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cancel(&self) -> &Arc<CancelContext> {
        &self.cancel
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn session(&self, settings: SessionSettings) -> ContainerSession {
        ContainerSession::new(
            self.daemon.clone(),
            self.config.clone(),
            self.cancel.clone(),
            self.tweaks.clone(),
            self.auth.clone(),
            settings,
        )
    }

    pub fn image_builder(&self, disable_cache: bool) -> ImageBuilder {
        ImageBuilder::new(
            self.daemon.clone(),
            self.auth.clone(),
            self.config.disable_image_cache || disable_cache,
        )
    }

    /// Writes a Docker credential file for the named registries into the
    /// staging area and returns its path.
    pub async fn materialize_credentials(&self, registries: &[&str]) -> Result<PathBuf> {
        self.auth.materialize(&self.staging, registries).await
    }

    /// Runs one spec end to end and returns its exit code and captured
    /// output. Step failures (a command or the container exiting
    /// nonzero) are part of the output; only infrastructure trouble is
    /// an error.
    pub async fn run_spec(&self, spec: &RunSpec) -> Result<RunOutput> {
        let (sink, buffer) = OutputSink::capture();
        let base = RunContext {
            sink,
            ..Default::default()
        };
        let ctx = base.derive(spec.user.as_deref(), spec.working_dir.as_deref());

        let image = match &spec.custom_image {
            Some(custom) => self.build_custom_image(custom, &spec.run_id, &ctx).await?,
            None => spec.image.clone().ok_or_else(|| {
                EngineError::Config("run spec names neither an image nor a Dockerfile".to_string())
            })?,
        };

        let settings = spec_settings(spec, image)?;
        let mut session = self.session(settings);
        let outcome = session.run(&ctx).await;

        let output = {
            let lines = buffer.lock().unwrap_or_else(|e| e.into_inner());
            lines.join("\n")
        };
        match outcome {
            Ok(()) => Ok(RunOutput {
                exit_code: 0,
                output,
            }),
            Err(EngineError::CommandFailed { code, .. })
            | Err(EngineError::ContainerExited { code, .. }) => Ok(RunOutput {
                exit_code: code,
                output,
            }),
            Err(e) => Err(e),
        }
    }

    /// Session convenience: build settings elsewhere, run them here.
    pub async fn run_in_container(
        &self,
        settings: SessionSettings,
        ctx: &RunContext,
    ) -> Result<()> {
        self.session(settings).run(ctx).await
    }

    pub async fn run_on_host(&self, command: &str, ctx: &RunContext) -> Result<()> {
        run_on_host(command, ctx).await
    }

    async fn build_custom_image(
        &self,
        custom: &CustomImage,
        run_id: &str,
        ctx: &RunContext,
    ) -> Result<String> {
        let name = custom
            .dockerfile
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "custom".to_string());
        let tag = derived_tag(&name, run_id, "latest");

        let mut file_spec = DockerfileSpec::new(&custom.dockerfile).with_tag(&tag);
        if let Some(context) = &custom.context {
            file_spec = file_spec.with_context(context);
        }
        for (key, value) in &custom.build_args {
            file_spec = file_spec.with_build_arg(key, value);
        }

        let id = self.image_builder(false).build(&file_spec, ctx).await?;
        debug!("Custom image {} built as {}", tag, id);
        Ok(tag)
    }
}
