//! Platform-specific accommodations. Today that is macOS, where the
//! VM-level file sharing used for bind mounts presents files as root
//! until ownership is corrected inside the container.

use async_trait::async_trait;
use tracing::debug;

use super::{PostCreateAction, SessionFacts, Tweak, TweakBundle};
use crate::daemon::DaemonClient;
use crate::tweaks::HostOs;
use crate::volume::VolumeApproach;

pub struct MacOsPermissionsTweak;

#[async_trait]
impl Tweak for MacOsPermissionsTweak {
    fn name(&self) -> &'static str {
        "macos-permissions"
    }

    async fn prepare(
        &self,
        facts: &SessionFacts,
        _daemon: &DaemonClient,
        bundle: &mut TweakBundle,
    ) -> anyhow::Result<()> {
        if facts.host_os != HostOs::MacOs || facts.approach != VolumeApproach::Bind {
            return Ok(());
        }
        let targets = facts.mount_targets();
        if targets.is_empty() {
            return Ok(());
        }
        debug!("Scheduling ownership fix for {} bind mounts", targets.len());
        bundle.post_create.push(PostCreateAction::Exec {
            user: Some("root".to_string()),
            command: format!(
                "chown -R {}:{} {}",
                facts.host_uid,
                facts.host_gid,
                targets.join(" ")
            ),
        });
        Ok(())
    }
}
