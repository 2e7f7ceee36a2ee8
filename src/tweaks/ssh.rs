//! SSH agent forwarding. When the caller mounts their `~/.ssh` into the
//! container, key operations inside it need the host agent: on Linux the
//! agent socket is bound straight in, on macOS a TCP bridge spans the VM
//! boundary and a companion process re-creates a socket in-container.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{HostOs, InitCommand, SessionFacts, Tweak, TweakBundle};
use crate::daemon::DaemonClient;
use crate::volume::Volume;

/// Label carrying the host-side bridge port, read back on reuse.
pub const SSH_PORT_LABEL: &str = "abox.ssh-agent-port";

const CONTAINER_AGENT_SOCK: &str = "/tmp/abox-ssh-agent.sock";

pub struct SshAgentTweak;

fn wants_agent(facts: &SessionFacts) -> bool {
    let Some(home) = dirs::home_dir() else {
        return false;
    };
    let ssh_dir = home.join(".ssh");
    facts
        .volumes
        .iter()
        .any(|v| std::path::Path::new(&v.host_path).starts_with(&ssh_dir))
}

fn companion_command(port: u16) -> String {
    format!(
        "socat UNIX-LISTEN:{CONTAINER_AGENT_SOCK},fork,unlink-early,mode=600 \
         TCP:host.docker.internal:{port}"
    )
}

#[async_trait]
impl Tweak for SshAgentTweak {
    fn name(&self) -> &'static str {
        "ssh-agent"
    }

    async fn prepare(
        &self,
        facts: &SessionFacts,
        _daemon: &DaemonClient,
        bundle: &mut TweakBundle,
    ) -> anyhow::Result<()> {
        if !wants_agent(facts) {
            return Ok(());
        }
        let auth_sock = std::env::var("SSH_AUTH_SOCK")
            .map_err(|_| anyhow::anyhow!("SSH_AUTH_SOCK is not set, agent forwarding skipped"))?;

        match facts.host_os {
            HostOs::Linux => {
                bundle
                    .extra_volumes
                    .push(Volume::new(auth_sock, "/ssh-agent.sock"));
                bundle
                    .extra_env
                    .push("SSH_AUTH_SOCK=/ssh-agent.sock".to_string());
                info!("Forwarding SSH agent via socket bind");
                Ok(())
            }
            HostOs::MacOs => {
                #[cfg(unix)]
                {
                    let port = start_agent_bridge(auth_sock.into(), None).await?;
                    bundle
                        .extra_labels
                        .insert(SSH_PORT_LABEL.to_string(), port.to_string());
                    bundle
                        .extra_env
                        .push(format!("SSH_AUTH_SOCK={CONTAINER_AGENT_SOCK}"));
                    bundle.init_commands.push(InitCommand {
                        command: companion_command(port),
                        user: None,
                        detach: true,
                    });
                    info!("Forwarding SSH agent via TCP bridge on port {}", port);
                    Ok(())
                }
                #[cfg(not(unix))]
                {
                    anyhow::bail!("agent bridge requires a unix host")
                }
            }
            _ => {
                debug!("SSH agent forwarding not supported on this host OS");
                Ok(())
            }
        }
    }

    /// A reused container keeps its port label but the host-side bridge
    /// and the in-container companion died with the previous process;
    /// both are restarted on the recorded port.
    async fn reapply(
        &self,
        facts: &SessionFacts,
        daemon: &DaemonClient,
        container: &str,
    ) -> anyhow::Result<()> {
        if facts.host_os != HostOs::MacOs {
            return Ok(());
        }
        let Some(port) = facts
            .existing_labels
            .get(SSH_PORT_LABEL)
            .and_then(|p| p.parse::<u16>().ok())
        else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            let auth_sock = std::env::var("SSH_AUTH_SOCK")
                .map_err(|_| anyhow::anyhow!("SSH_AUTH_SOCK is not set"))?;
            start_agent_bridge(auth_sock.into(), Some(port)).await?;
            daemon
                .exec_detached(
                    container,
                    vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        companion_command(port),
                    ],
                    None,
                )
                .await?;
            info!("Re-established SSH agent bridge on port {}", port);
        }
        #[cfg(not(unix))]
        {
            let _ = (daemon, container, port);
        }
        Ok(())
    }
}

/// Listens on a local TCP port and forwards each connection to the unix
/// agent socket. Returns the bound port; the accept loop runs for the
/// rest of the process.
#[cfg(unix)]
async fn start_agent_bridge(
    auth_sock: std::path::PathBuf,
    port: Option<u16>,
) -> anyhow::Result<u16> {
    use anyhow::Context;

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port.unwrap_or(0)))
        .await
        .context("binding agent bridge listener")?;
    let local_port = listener.local_addr().context("agent bridge address")?.port();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut tcp, _)) => {
                    let auth_sock = auth_sock.clone();
                    tokio::spawn(async move {
                        match tokio::net::UnixStream::connect(&auth_sock).await {
                            Ok(mut unix) => {
                                let _ = tokio::io::copy_bidirectional(&mut tcp, &mut unix).await;
                            }
                            Err(e) => debug!("Agent socket connect failed: {}", e),
                        }
                    });
                }
                Err(e) => {
                    warn!("Agent bridge accept loop ended: {}", e);
                    break;
                }
            }
        }
    });

    Ok(local_port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tweaks::tests::facts;

    #[test]
    fn detects_ssh_dir_volumes() {
        let home = dirs::home_dir().unwrap();
        let mut with_ssh = facts();
        with_ssh.volumes = vec![Volume::new(
            home.join(".ssh").to_string_lossy().into_owned(),
            "/root/.ssh",
        )];
        assert!(wants_agent(&with_ssh));

        let mut without = facts();
        without.volumes = vec![Volume::new("/src", "/app")];
        assert!(!wants_agent(&without));
    }

    #[test]
    fn companion_listens_on_injected_port() {
        let command = companion_command(45123);
        assert!(command.contains("TCP:host.docker.internal:45123"));
        assert!(command.contains(CONTAINER_AGENT_SOCK));
    }
}
