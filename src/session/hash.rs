//! Session configuration hashing. The digest is the cache key for both
//! container reuse and derived-image reuse.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{PortMapping, SessionSettings};
use crate::error::Result;
use crate::volume::Volume;

/// The behavior-affecting subset of a session's settings, serialized in
/// a fixed field order so the digest is stable across processes.
#[derive(Serialize)]
struct HashedFields<'a> {
    image: &'a str,
    privileged: bool,
    mount_docker_socket: bool,
    env: &'a [String],
    entrypoint: Option<&'a [String]>,
    command: Option<&'a [String]>,
    build_commands: &'a [String],
    volumes: Vec<String>,
    ports: Vec<String>,
    create_network: bool,
    user: Option<&'a str>,
    simulated_os: Option<&'a str>,
    ci_name: Option<&'a str>,
}

/// Digest over everything that shapes the resulting container's
/// observable behavior. Sessions with equal hashes are interchangeable,
/// so this value is the sole cache-validity test; fields outside it
/// (run id, exec commands, reuse flags) never influence identity.
pub fn compute(settings: &SessionSettings) -> Result<String> {
    let fields = HashedFields {
        image: &settings.image,
        privileged: settings.privileged,
        mount_docker_socket: settings.mount_docker_socket,
        env: &settings.env,
        entrypoint: settings.entrypoint.as_deref(),
        command: settings.command.as_deref(),
        build_commands: &settings.build_commands,
        volumes: settings
            .bind_volumes
            .iter()
            .chain(settings.mount_volumes.iter())
            .map(Volume::spec_string)
            .collect(),
        ports: settings.ports.iter().map(PortMapping::spec_string).collect(),
        create_network: settings.create_network,
        user: settings.user.as_deref(),
        simulated_os: settings.simulated_os.as_deref(),
        ci_name: settings.ci_name.as_deref(),
    };

    let canonical = serde_json::to_vec(&fields)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumeMode;

    fn settings() -> SessionSettings {
        let mut settings = SessionSettings::new("t1", "alpine:3.20");
        settings.bind_volumes.push(Volume::new("/tmp/x", "/data"));
        settings.env.push("CI=true".to_string());
        settings.ports.push(PortMapping {
            host: 8080,
            container: 80,
        });
        settings
    }

    #[test]
    fn equal_settings_hash_equal() {
        let a = compute(&settings()).unwrap();
        let b = compute(&settings()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn every_hashed_field_changes_the_digest() {
        let base = compute(&settings()).unwrap();

        let mutations: Vec<Box<dyn Fn(&mut SessionSettings)>> = vec![
            Box::new(|s| s.image = "alpine:3.19".to_string()),
            Box::new(|s| s.privileged = true),
            Box::new(|s| s.mount_docker_socket = true),
            Box::new(|s| s.env.push("EXTRA=1".to_string())),
            Box::new(|s| s.entrypoint = Some(vec!["/init".to_string()])),
            Box::new(|s| s.command = Some(vec!["true".to_string()])),
            Box::new(|s| s.build_commands.push("apk add git".to_string())),
            Box::new(|s| s.bind_volumes[0].mode = VolumeMode::Ro),
            Box::new(|s| s.bind_volumes.push(Volume::new("/etc", "/host-etc"))),
            Box::new(|s| {
                s.mount_volumes
                    .push(Volume::new("/cache", "/cache").with_name("build-cache"))
            }),
            Box::new(|s| s.ports[0].host = 9090),
            Box::new(|s| s.create_network = true),
            Box::new(|s| s.user = Some("builder".to_string())),
            Box::new(|s| s.simulated_os = Some("centos".to_string())),
            Box::new(|s| s.ci_name = Some("pipelines".to_string())),
        ];

        for (index, mutate) in mutations.iter().enumerate() {
            let mut changed = settings();
            mutate(&mut changed);
            assert_ne!(
                compute(&changed).unwrap(),
                base,
                "mutation {index} did not change the hash"
            );
        }
    }

    #[test]
    fn identity_ignores_run_bookkeeping() {
        let base = compute(&settings()).unwrap();

        let mut other = settings();
        other.run_id = "different-run".to_string();
        other.exec_commands.push("echo hi".to_string());
        other.allow_reuse = true;
        other.cleanup_orphans = true;
        other.disable_cache = true;
        other.detach = true;

        assert_eq!(compute(&other).unwrap(), base);
    }

    #[test]
    fn volume_modes_are_part_of_identity() {
        let rw = compute(&settings()).unwrap();
        let mut ro_settings = settings();
        ro_settings.bind_volumes[0] =
            Volume::new("/tmp/x", "/data").with_mode(VolumeMode::Ro);
        assert_ne!(compute(&ro_settings).unwrap(), rw);
    }
}
