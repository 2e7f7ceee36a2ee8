//! Tests for image naming, Dockerfile analysis and synthesis, and the
//! build-record digest map.

use std::path::PathBuf;

use abox::image::{base_references, derived_tag, split_reference, synthesize_dockerfile};
use abox::{DerivedImageParts, DockerfileSpec, PushedDigest};

// =============================================================================
// Reference handling
// =============================================================================

#[test]
fn test_split_reference_simple() {
    assert_eq!(
        split_reference("alpine:3.20"),
        ("alpine".to_string(), "3.20".to_string())
    );
}

#[test]
fn test_split_reference_defaults_to_latest() {
    assert_eq!(
        split_reference("alpine"),
        ("alpine".to_string(), "latest".to_string())
    );
}

#[test]
fn test_split_reference_keeps_registry_ports() {
    // The colon in the registry port is not a tag separator.
    assert_eq!(
        split_reference("registry.local:5000/team/tool"),
        ("registry.local:5000/team/tool".to_string(), "latest".to_string())
    );
    assert_eq!(
        split_reference("registry.local:5000/team/tool:v2"),
        ("registry.local:5000/team/tool".to_string(), "v2".to_string())
    );
}

#[test]
fn test_derived_tags_are_daemon_safe() {
    let tag = derived_tag("registry.local:5000/team/My Tool:v2", "Step 1", "abcd1234");
    assert_eq!(tag, "ab-registry.local-5000-team-my-tool-step-1:abcd1234");
}

// =============================================================================
// Dockerfile analysis
// =============================================================================

#[test]
fn test_base_references_skip_aliases_and_scratch() {
    let dockerfile = r#"
FROM rust:1.80 AS builder
RUN cargo build --release
FROM scratch
FROM builder AS test
FROM debian:bookworm-slim
COPY --from=builder /app /app
"#;
    assert_eq!(
        base_references(dockerfile),
        vec!["rust:1.80".to_string(), "debian:bookworm-slim".to_string()]
    );
}

#[test]
fn test_base_references_skip_platform_flags() {
    let dockerfile = "FROM --platform=linux/amd64 alpine:3.20\n";
    assert_eq!(base_references(dockerfile), vec!["alpine:3.20".to_string()]);
}

// =============================================================================
// Derived Dockerfile synthesis
// =============================================================================

#[test]
fn test_synthesized_dockerfile_layers_in_order() {
    let parts = DerivedImageParts {
        mount_targets: vec!["/work".to_string()],
        build_commands: vec!["apk add --no-cache git".to_string()],
        add_entries: vec![(PathBuf::from("/repo"), "/work".to_string())],
    };
    let text = synthesize_dockerfile("alpine:3.20", &parts);
    let lines: Vec<&str> = text.lines().collect();

    assert_eq!(lines[0], "FROM alpine:3.20");
    assert_eq!(lines[1], "USER root");
    assert_eq!(lines[2], "RUN [ -L /work ] && rm -f /work || true");
    assert_eq!(lines[3], "RUN apk add --no-cache git");
    assert_eq!(lines[4], "ADD add0 /work");
}

#[test]
fn test_empty_parts_still_pin_root() {
    let text = synthesize_dockerfile("alpine:3.20", &DerivedImageParts::default());
    assert_eq!(text, "FROM alpine:3.20\nUSER root\n");
}

// =============================================================================
// Build record
// =============================================================================

#[test]
fn test_spec_builder_accumulates() {
    let spec = DockerfileSpec::new("/tmp/Dockerfile")
        .with_context("/tmp")
        .with_tag("app:1")
        .with_tag("app:latest")
        .with_build_arg("VERSION", "1.0")
        .with_label("team", "ci");
    assert_eq!(spec.tags, vec!["app:1".to_string(), "app:latest".to_string()]);
    assert_eq!(spec.build_args.get("VERSION").map(String::as_str), Some("1.0"));
    assert_eq!(spec.context_root(), PathBuf::from("/tmp"));
}

#[test]
fn test_context_root_falls_back_to_the_dockerfile_parent() {
    let spec = DockerfileSpec::new("/srv/build/Dockerfile");
    assert_eq!(spec.context_root(), PathBuf::from("/srv/build"));
}

#[test]
fn test_context_root_of_a_bare_dockerfile_is_the_current_dir() {
    let spec = DockerfileSpec::new("Dockerfile");
    assert_eq!(spec.context_root(), PathBuf::from("."));
}

#[test]
fn test_digests_are_recorded_once_per_tag() {
    let spec = DockerfileSpec::new("/tmp/Dockerfile").with_tag("app:1");
    spec.record_digest(
        "app:1",
        PushedDigest {
            digest: "sha256:first".to_string(),
            size: 100,
        },
    );
    spec.record_digest(
        "app:1",
        PushedDigest {
            digest: "sha256:second".to_string(),
            size: 200,
        },
    );

    let recorded = spec.digest_for("app:1").unwrap();
    assert_eq!(recorded.digest, "sha256:first");
    assert_eq!(spec.digests().len(), 1);
    assert!(spec.digest_for("app:other").is_none());
}
