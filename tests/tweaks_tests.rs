//! Tests for the tweak data model: bundles, session facts and host
//! identity. Tweak contribution logic runs against a daemon client and
//! is covered by the in-module tests.

use std::collections::HashMap;

use abox::distro::DistroFamily;
use abox::tweaks::users::host_identity;
use abox::tweaks::{HostOs, InitCommand, PostCreateAction, SessionFacts, TweakRunner};
use abox::volume::VolumeApproach;
use abox::{TweakBundle, Volume};

fn facts() -> SessionFacts {
    SessionFacts {
        run_id: "run-1".to_string(),
        image: "alpine:3.20".to_string(),
        volumes: vec![
            Volume::parse("/repo:/work").unwrap(),
            Volume::parse("/cache:/cache").unwrap(),
        ],
        approach: VolumeApproach::Bind,
        mount_docker_socket: false,
        privileged: false,
        inside_container: false,
        remote_daemon: false,
        daemon_tcp_address: None,
        host_os: HostOs::Linux,
        distro_family: DistroFamily::Alpine,
        mirror_host_user: false,
        host_uid: 1000,
        host_gid: 1000,
        host_username: "dev".to_string(),
        existing_labels: HashMap::new(),
    }
}

// =============================================================================
// Bundle
// =============================================================================

#[test]
fn test_default_bundle_is_empty() {
    assert!(TweakBundle::default().is_empty());
}

#[test]
fn test_any_contribution_makes_the_bundle_non_empty() {
    let mut with_env = TweakBundle::default();
    with_env.extra_env.push("A=1".to_string());
    assert!(!with_env.is_empty());

    let mut with_init = TweakBundle::default();
    with_init.init_commands.push(InitCommand {
        command: "dockerd &".to_string(),
        user: None,
        detach: true,
    });
    assert!(!with_init.is_empty());

    let mut with_action = TweakBundle::default();
    with_action.post_create.push(PostCreateAction::ConnectNetwork {
        network: "ci-net".to_string(),
    });
    assert!(!with_action.is_empty());
}

// =============================================================================
// Facts
// =============================================================================

#[test]
fn test_mount_targets_follow_volume_order() {
    assert_eq!(
        facts().mount_targets(),
        vec!["/work".to_string(), "/cache".to_string()]
    );
}

#[test]
fn test_host_os_detection_matches_the_build_target() {
    let expected = match std::env::consts::OS {
        "linux" => HostOs::Linux,
        "macos" => HostOs::MacOs,
        "windows" => HostOs::Windows,
        _ => HostOs::Other,
    };
    assert_eq!(HostOs::detect(), expected);
}

#[test]
fn test_host_identity_is_usable() {
    let (_uid, _gid, name) = host_identity();
    assert!(!name.is_empty());
}

// =============================================================================
// Runner construction
// =============================================================================

#[test]
fn test_standard_runner_constructs() {
    let _runner = TweakRunner::standard();
    let _empty = TweakRunner::with_tweaks(Vec::new());
}
