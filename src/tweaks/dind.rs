//! Docker-in-Docker support. Sessions that ask for the daemon socket get
//! it bound in with usable permissions; when the daemon is remote a TCP
//! proxy stands in and `DOCKER_HOST` is rewritten to point at it. When
//! the engine itself runs containerized, new containers join its own
//! network so they can reach each other.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{InitCommand, PostCreateAction, SessionFacts, Tweak, TweakBundle};
use crate::daemon::{own_container_id, DaemonClient};
use crate::volume::Volume;

const DAEMON_SOCKET: &str = "/var/run/docker.sock";

pub struct DockerSocketTweak;

#[async_trait]
impl Tweak for DockerSocketTweak {
    fn name(&self) -> &'static str {
        "docker-socket"
    }

    async fn prepare(
        &self,
        facts: &SessionFacts,
        daemon: &DaemonClient,
        bundle: &mut TweakBundle,
    ) -> anyhow::Result<()> {
        if facts.inside_container {
            attach_own_network(daemon, bundle).await;
        }

        if !facts.mount_docker_socket {
            return Ok(());
        }

        if facts.remote_daemon {
            let Some(upstream) = facts.daemon_tcp_address.clone() else {
                anyhow::bail!("remote daemon without a TCP address, DinD skipped");
            };
            let port = start_daemon_proxy(upstream).await?;
            bundle
                .extra_env
                .push(format!("DOCKER_HOST=tcp://host.docker.internal:{port}"));
            info!("DinD via daemon proxy on port {}", port);
        } else {
            bundle
                .extra_volumes
                .push(Volume::new(DAEMON_SOCKET, DAEMON_SOCKET));
            // The bound socket arrives owned by the host's docker group,
            // which rarely exists inside the image.
            bundle.init_commands.push(InitCommand {
                command: format!("chmod 666 {DAEMON_SOCKET}"),
                user: Some("root".to_string()),
                detach: false,
            });
            info!("DinD via daemon socket bind");
        }
        Ok(())
    }
}

/// Joins the session container to the network the engine's own container
/// sits on. Best-effort: failure to resolve our container or network
/// just logs.
async fn attach_own_network(daemon: &DaemonClient, bundle: &mut TweakBundle) {
    let Some(own_id) = own_container_id() else {
        debug!("Containerized but no own container id resolvable");
        return;
    };
    match daemon.network_of_container(&own_id).await {
        Ok(Some(network)) => {
            info!("Session containers will join own network {}", network);
            bundle
                .post_create
                .push(PostCreateAction::ConnectNetwork { network });
        }
        Ok(None) => debug!("Own container {} has no attached network", own_id),
        Err(e) => warn!("Could not resolve own network: {}", e),
    }
}

/// Accepts connections on a local port and forwards them to the remote
/// daemon's TCP endpoint for the rest of the process.
async fn start_daemon_proxy(upstream: String) -> anyhow::Result<u16> {
    use anyhow::Context;

    let upstream_addr = upstream
        .split("://")
        .nth(1)
        .unwrap_or(&upstream)
        .to_string();
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", 0))
        .await
        .context("binding daemon proxy listener")?;
    let port = listener.local_addr().context("daemon proxy address")?.port();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut inbound, _)) => {
                    let upstream_addr = upstream_addr.clone();
                    tokio::spawn(async move {
                        match tokio::net::TcpStream::connect(&upstream_addr).await {
                            Ok(mut outbound) => {
                                let _ =
                                    tokio::io::copy_bidirectional(&mut inbound, &mut outbound)
                                        .await;
                            }
                            Err(e) => debug!("Daemon proxy connect failed: {}", e),
                        }
                    });
                }
                Err(e) => {
                    warn!("Daemon proxy accept loop ended: {}", e);
                    break;
                }
            }
        }
    });

    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tweaks::tests::facts;
    use crate::tweaks::TweakRunner;

    #[tokio::test]
    async fn socket_mounting_requires_the_flag() {
        let runner = TweakRunner::with_tweaks(vec![Box::new(DockerSocketTweak)]);
        let facts = facts();
        assert!(!facts.mount_docker_socket && !facts.inside_container);

        let bundle = runner.collect(&facts, &crate::daemon::test_client()).await;
        assert!(bundle.is_empty());
    }

    #[tokio::test]
    async fn local_socket_mount_adds_bind_and_chmod() {
        let runner = TweakRunner::with_tweaks(vec![Box::new(DockerSocketTweak)]);
        let mut facts = facts();
        facts.mount_docker_socket = true;

        let bundle = runner.collect(&facts, &crate::daemon::test_client()).await;
        assert_eq!(bundle.extra_volumes.len(), 1);
        assert_eq!(bundle.extra_volumes[0].cont_path, DAEMON_SOCKET);
        assert!(bundle.init_commands[0].command.contains("chmod 666"));
        assert!(!bundle.init_commands[0].detach);
    }

    #[tokio::test]
    async fn daemon_proxy_round_trips() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let upstream = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let upstream_addr = format!("tcp://{}", upstream.local_addr().unwrap());
        tokio::spawn(async move {
            if let Ok((mut conn, _)) = upstream.accept().await {
                let mut buf = [0u8; 4];
                if conn.read_exact(&mut buf).await.is_ok() {
                    let _ = conn.write_all(&buf).await;
                }
            }
        });

        let port = start_daemon_proxy(upstream_addr).await.unwrap();
        let mut client = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }
}
