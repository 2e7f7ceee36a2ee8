//! In-container user provisioning. Mirrors the host's UID and username
//! into the build image so files written through bind volumes keep sane
//! ownership, and grants daemon-socket access when DinD is on.

use async_trait::async_trait;
use tracing::debug;

use super::{SessionFacts, Tweak, TweakBundle};
use crate::daemon::DaemonClient;
use crate::distro::DistroFamily;

/// UID, GID and username of the invoking host user.
pub fn host_identity() -> (u32, u32, String) {
    #[cfg(unix)]
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    #[cfg(not(unix))]
    let (uid, gid) = (1000u32, 1000u32);

    let username = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "abox".to_string());
    (uid, gid, username)
}

pub struct UserProvisioningTweak;

fn create_user_command(family: DistroFamily, uid: u32, name: &str) -> String {
    match family {
        DistroFamily::Alpine => {
            format!("adduser -D -u {uid} {name} 2>/dev/null || true")
        }
        _ => format!("useradd -m -u {uid} {name} 2>/dev/null || true"),
    }
}

fn docker_group_command(family: DistroFamily, name: &str) -> String {
    match family {
        DistroFamily::Alpine => {
            format!("addgroup docker 2>/dev/null; addgroup {name} docker || true")
        }
        _ => format!("groupadd -f docker && usermod -aG docker {name} || true"),
    }
}

#[async_trait]
impl Tweak for UserProvisioningTweak {
    fn name(&self) -> &'static str {
        "user-provisioning"
    }

    async fn prepare(
        &self,
        facts: &SessionFacts,
        _daemon: &DaemonClient,
        bundle: &mut TweakBundle,
    ) -> anyhow::Result<()> {
        if !facts.mirror_host_user {
            return Ok(());
        }
        let uid = facts.host_uid;
        let gid = facts.host_gid;
        let name = &facts.host_username;
        debug!("Provisioning in-container user {} ({}:{})", name, uid, gid);

        bundle
            .build_commands
            .push(create_user_command(facts.distro_family, uid, name));
        bundle
            .build_commands
            .push(format!("chown -R {uid}:{gid} /home/{name} || true"));
        if facts.mount_docker_socket {
            bundle
                .build_commands
                .push(docker_group_command(facts.distro_family, name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tweaks::tests::facts;
    use crate::tweaks::TweakRunner;

    #[tokio::test]
    async fn disabled_without_mirror_flag() {
        let runner = TweakRunner::with_tweaks(vec![Box::new(UserProvisioningTweak)]);
        let bundle = runner.collect(&facts(), &crate::daemon::test_client()).await;
        assert!(bundle.build_commands.is_empty());
    }

    #[tokio::test]
    async fn alpine_gets_adduser_and_debian_gets_useradd() {
        let runner = TweakRunner::with_tweaks(vec![Box::new(UserProvisioningTweak)]);

        let mut alpine = facts();
        alpine.mirror_host_user = true;
        alpine.distro_family = DistroFamily::Alpine;
        let bundle = runner.collect(&alpine, &crate::daemon::test_client()).await;
        assert!(bundle.build_commands[0].starts_with("adduser -D -u 1000 dev"));

        let mut debian = facts();
        debian.mirror_host_user = true;
        debian.distro_family = DistroFamily::Debian;
        let bundle = runner.collect(&debian, &crate::daemon::test_client()).await;
        assert!(bundle.build_commands[0].starts_with("useradd -m -u 1000 dev"));
    }

    #[tokio::test]
    async fn socket_mounting_grants_docker_group() {
        let runner = TweakRunner::with_tweaks(vec![Box::new(UserProvisioningTweak)]);
        let mut with_socket = facts();
        with_socket.mirror_host_user = true;
        with_socket.mount_docker_socket = true;
        with_socket.distro_family = DistroFamily::Debian;

        let bundle = runner
            .collect(&with_socket, &crate::daemon::test_client())
            .await;
        assert!(bundle
            .build_commands
            .iter()
            .any(|c| c.contains("usermod -aG docker dev")));
    }
}
