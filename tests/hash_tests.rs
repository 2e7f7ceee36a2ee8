//! Tests for the session configuration hash.
//!
//! The hash is the engine's only cache key: two sessions with the same
//! hash must be interchangeable, and run bookkeeping must never leak
//! into the identity.

use abox::session::hash;
use abox::{PortMapping, SessionSettings, Volume, VolumeMode};

fn base_settings() -> SessionSettings {
    let mut settings = SessionSettings::new("step-1", "rust:1.80");
    settings.env = vec!["CARGO_HOME=/cache/cargo".to_string()];
    settings.bind_volumes = vec![Volume::parse("/repo:/work").unwrap()];
    settings.ports = vec![PortMapping {
        host: 8080,
        container: 80,
    }];
    settings.user = Some("builder".to_string());
    settings
}

// =============================================================================
// Identity
// =============================================================================

#[test]
fn test_identical_settings_are_interchangeable() {
    let a = hash::compute(&base_settings()).unwrap();
    let b = hash::compute(&base_settings()).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_hash_is_hex_sha256() {
    let digest = hash::compute(&base_settings()).unwrap();
    assert_eq!(digest.len(), 64);
    assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn test_behavioral_fields_change_the_identity() {
    let baseline = hash::compute(&base_settings()).unwrap();

    let mut other_image = base_settings();
    other_image.image = "rust:1.81".to_string();
    assert_ne!(hash::compute(&other_image).unwrap(), baseline);

    let mut other_env = base_settings();
    other_env.env.push("RUSTFLAGS=-Dwarnings".to_string());
    assert_ne!(hash::compute(&other_env).unwrap(), baseline);

    let mut privileged = base_settings();
    privileged.privileged = true;
    assert_ne!(hash::compute(&privileged).unwrap(), baseline);

    let mut other_user = base_settings();
    other_user.user = Some("root".to_string());
    assert_ne!(hash::compute(&other_user).unwrap(), baseline);
}

#[test]
fn test_volume_mode_is_part_of_the_identity() {
    let baseline = hash::compute(&base_settings()).unwrap();
    let mut readonly = base_settings();
    readonly.bind_volumes = vec![Volume::parse("/repo:/work").unwrap().with_mode(VolumeMode::Ro)];
    assert_ne!(hash::compute(&readonly).unwrap(), baseline);
}

#[test]
fn test_derived_image_inputs_change_the_identity() {
    // Extra RUN lines change the derived Dockerfile, so a container or
    // image built without them must not be adopted for a session that
    // wants them.
    let baseline = hash::compute(&base_settings()).unwrap();

    let mut with_build = base_settings();
    with_build
        .build_commands
        .push("apk add --no-cache git".to_string());
    assert_ne!(hash::compute(&with_build).unwrap(), baseline);

    let mut with_network = base_settings();
    with_network.create_network = true;
    assert_ne!(hash::compute(&with_network).unwrap(), baseline);
}

// =============================================================================
// Bookkeeping exclusions
// =============================================================================

#[test]
fn test_run_bookkeeping_never_leaks_into_the_identity() {
    let baseline = hash::compute(&base_settings()).unwrap();

    let mut other_run = base_settings();
    other_run.run_id = "step-2".to_string();
    other_run.exec_commands = vec!["cargo test".to_string()];
    other_run.allow_reuse = true;
    other_run.cleanup_orphans = true;
    other_run.disable_cache = true;
    other_run.detach = true;

    assert_eq!(hash::compute(&other_run).unwrap(), baseline);
}
