//! Tests for OS classification and install-command generation.
//!
//! Pins the family mapping for the distributions the engine meets in
//! practice, including the deliberate RHEL classification of centos and
//! fedora.

use abox::distro::parse_os_release;
use abox::{DistroFamily, OsDistribution};

// =============================================================================
// os-release parsing
// =============================================================================

#[test]
fn test_ubuntu_release_file() {
    let content = r#"
NAME="Ubuntu"
VERSION="22.04.4 LTS (Jammy Jellyfish)"
ID=ubuntu
ID_LIKE=debian
PRETTY_NAME="Ubuntu 22.04.4 LTS"
"#;
    let distro = parse_os_release(content);
    assert_eq!(distro.id, "ubuntu");
    assert_eq!(distro.family, DistroFamily::Debian);
    assert_eq!(distro.pretty_name.as_deref(), Some("Ubuntu 22.04.4 LTS"));
}

#[test]
fn test_alpine_release_file() {
    let distro = parse_os_release("ID=alpine\nVERSION_ID=3.20.1\n");
    assert_eq!(distro.family, DistroFamily::Alpine);
}

#[test]
fn test_centos_is_rhel_family() {
    let content = "ID=\"centos\"\nID_LIKE=\"rhel fedora\"\n";
    assert_eq!(parse_os_release(content).family, DistroFamily::Rhel);
}

#[test]
fn test_fedora_is_rhel_family() {
    assert_eq!(parse_os_release("ID=fedora\n").family, DistroFamily::Rhel);
    assert_eq!(OsDistribution::from_id("fedora").family, DistroFamily::Rhel);
}

#[test]
fn test_amazon_linux_is_rhel_family() {
    let content = "ID=\"amzn\"\nID_LIKE=\"fedora\"\n";
    assert_eq!(parse_os_release(content).family, DistroFamily::Rhel);
}

#[test]
fn test_id_like_rescues_derivatives() {
    let content = "ID=neon\nID_LIKE=\"ubuntu debian\"\n";
    assert_eq!(parse_os_release(content).family, DistroFamily::Debian);
}

#[test]
fn test_unknown_ids_map_to_unknown() {
    assert_eq!(parse_os_release("ID=plan9\n").family, DistroFamily::Unknown);
    assert_eq!(OsDistribution::from_id("").family, DistroFamily::Unknown);
}

#[test]
fn test_arch_and_suse_families() {
    assert_eq!(parse_os_release("ID=arch\n").family, DistroFamily::Arch);
    assert_eq!(
        parse_os_release("ID=opensuse-leap\n").family,
        DistroFamily::Suse
    );
}

// =============================================================================
// Install commands
// =============================================================================

#[test]
fn test_debian_install_command() {
    assert_eq!(
        DistroFamily::Debian.install_command(&["git", "curl"]),
        "apt-get update && apt-get install -y git curl"
    );
}

#[test]
fn test_alpine_install_command() {
    assert_eq!(
        DistroFamily::Alpine.install_command(&["git"]),
        "apk add --no-cache git"
    );
}

#[test]
fn test_rhel_tries_every_package_manager() {
    // RHEL-family images disagree about which manager is installed, so
    // the command tries dnf, yum and microdnf in order.
    let command = DistroFamily::Rhel.install_command(&["git"]);
    assert_eq!(
        command,
        "dnf install -y git || yum install -y git || microdnf install git"
    );
}

#[test]
fn test_centos_and_fedora_get_the_rhel_command() {
    for id in ["centos", "fedora"] {
        let command = OsDistribution::from_id(id).install_command(&["git"]);
        assert!(command.contains("dnf"), "{id} should use the RHEL command");
        assert!(command.contains("microdnf"), "{id} should fall back to microdnf");
    }
}

#[test]
fn test_unknown_family_defaults_to_debian_style() {
    assert!(DistroFamily::Unknown
        .install_command(&["git"])
        .starts_with("apt-get update"));
}
