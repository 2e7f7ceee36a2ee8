//! Command execution inside running containers: quiet capture, streamed
//! build-step execution and fully interactive sessions.

use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use futures::stream::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::DaemonClient;
use crate::context::RunContext;
use crate::error::{EngineError, Result};

impl DaemonClient {
    /// Runs `cmd` and captures combined output. Used for probes where
    /// the output is data, not user-facing logs.
    pub async fn exec_capture(
        &self,
        container: &str,
        cmd: Vec<String>,
        user: Option<&str>,
    ) -> Result<(i64, String)> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            user: user.map(|u| u.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(container, options).await?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => output.push_str(&chunk.to_string()),
                    Err(e) => {
                        warn!("Error reading exec output: {}", e);
                        break;
                    }
                }
            }
        }

        let exit = self.exec_exit_code(&exec.id).await?;
        Ok((exit, output))
    }

    /// Runs a shell command with the context's user, directory and env,
    /// streaming output lines into the context sink. Returns the exit
    /// code without judging it.
    pub async fn exec_streamed(
        &self,
        container: &str,
        command: &str,
        ctx: &RunContext,
    ) -> Result<i64> {
        debug!("Exec in {}: {}", container, command);
        let options = CreateExecOptions {
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            env: Some(ctx.env.clone()),
            user: ctx.user.clone(),
            working_dir: ctx.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(container, options).await?;

        if let StartExecResults::Attached { output: mut stream, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            let mut pending = String::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        pending.push_str(&chunk.to_string());
                        while let Some(pos) = pending.find('\n') {
                            let line: String = pending.drain(..=pos).collect();
                            ctx.emit(line.trim_end_matches(['\n', '\r']));
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if !pending.is_empty() {
                ctx.emit(pending.trim_end_matches(['\n', '\r']));
            }
        }

        self.exec_exit_code(&exec.id).await
    }

    /// Starts `cmd` in the container without attaching. Used for
    /// long-lived companion processes.
    pub async fn exec_detached(
        &self,
        container: &str,
        cmd: Vec<String>,
        user: Option<&str>,
    ) -> Result<()> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            user: user.map(|u| u.to_string()),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            ..Default::default()
        };
        let exec = self.docker.create_exec(container, options).await?;
        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    /// Interactive exec with a TTY: stdin is relayed in, output is
    /// relayed raw to stdout, and terminal resizes are propagated while
    /// the session runs. The relay and the resize forwarder are joined
    /// and the first error wins.
    pub async fn exec_interactive(
        &self,
        container: &str,
        command: &str,
        ctx: &RunContext,
    ) -> Result<i64> {
        let options = CreateExecOptions {
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            env: Some(ctx.env.clone()),
            user: ctx.user.clone(),
            working_dir: ctx.working_dir.clone(),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(container, options).await?;

        if let Some((height, width)) = terminal_size() {
            let _ = self
                .docker
                .resize_exec(&exec.id, ResizeExecOptions { height, width })
                .await;
        }

        let (done_tx, done_rx) = tokio::sync::watch::channel(false);
        let resize_task = tokio::spawn(resize_loop(self.clone(), exec.id.clone(), done_rx));

        let _raw = RawModeGuard::enable();
        let io_result = self.relay_exec_io(&exec.id).await;
        drop(_raw);

        let _ = done_tx.send(true);
        match resize_task.await {
            Ok(resize_result) => {
                io_result?;
                resize_result?;
            }
            Err(e) => {
                io_result?;
                warn!("Resize forwarder ended abnormally: {}", e);
            }
        }

        self.exec_exit_code(&exec.id).await
    }

    async fn relay_exec_io(&self, exec_id: &str) -> Result<()> {
        match self.docker.start_exec(exec_id, None).await? {
            StartExecResults::Attached {
                mut output,
                mut input,
            } => {
                let stdin_task = tokio::spawn(async move {
                    let mut stdin = tokio::io::stdin();
                    let _ = tokio::io::copy(&mut stdin, &mut input).await;
                });

                let mut stdout = tokio::io::stdout();
                let mut result = Ok(());
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(chunk) => {
                            if stdout.write_all(&chunk.into_bytes()).await.is_ok() {
                                let _ = stdout.flush().await;
                            }
                        }
                        Err(e) => {
                            result = Err(e.into());
                            break;
                        }
                    }
                }
                stdin_task.abort();
                result
            }
            StartExecResults::Detached => Ok(()),
        }
    }

    /// Exit code after an exec's stream closed. Polls briefly while the
    /// daemon still reports it running.
    pub async fn exec_exit_code(&self, exec_id: &str) -> Result<i64> {
        for _ in 0..50 {
            let inspect = self.docker.inspect_exec(exec_id).await?;
            if inspect.running != Some(true) {
                return Ok(inspect.exit_code.unwrap_or(0));
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        Err(EngineError::Stream(format!(
            "exec {exec_id} did not settle after its stream closed"
        )))
    }
}

/// Forwards terminal resizes until `done` flips. Returns early on the
/// first daemon error so the joint wait can surface it.
async fn resize_loop(
    client: DaemonClient,
    exec_id: String,
    mut done: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigwinch =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
                .map_err(EngineError::Io)?;
        loop {
            tokio::select! {
                _ = sigwinch.recv() => {
                    if let Some((height, width)) = terminal_size() {
                        client
                            .docker
                            .resize_exec(&exec_id, ResizeExecOptions { height, width })
                            .await?;
                    }
                }
                _ = done.changed() => return Ok(()),
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = client;
        let _ = exec_id;
        let _ = done.changed().await;
        Ok(())
    }
}

#[cfg(unix)]
fn terminal_size() -> Option<(u16, u16)> {
    unsafe {
        let mut ws: libc::winsize = std::mem::zeroed();
        if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) == 0 && ws.ws_col > 0 {
            Some((ws.ws_row, ws.ws_col))
        } else {
            None
        }
    }
}

#[cfg(not(unix))]
fn terminal_size() -> Option<(u16, u16)> {
    None
}

/// Puts the local terminal into raw mode for the lifetime of the guard.
#[cfg(unix)]
struct RawModeGuard {
    original: libc::termios,
}

#[cfg(unix)]
impl RawModeGuard {
    fn enable() -> Option<Self> {
        unsafe {
            if libc::isatty(libc::STDIN_FILENO) == 0 {
                return None;
            }
            let mut term: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut term) != 0 {
                return None;
            }
            let original = term;
            libc::cfmakeraw(&mut term);
            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &term) != 0 {
                return None;
            }
            Some(Self { original })
        }
    }
}

#[cfg(unix)]
impl Drop for RawModeGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.original);
        }
    }
}

#[cfg(not(unix))]
struct RawModeGuard;

#[cfg(not(unix))]
impl RawModeGuard {
    fn enable() -> Option<Self> {
        None
    }
}
