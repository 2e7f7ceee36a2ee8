//! Classification of container operating systems from `/etc/os-release`
//! and generation of the matching package-install command lines.

use std::collections::HashMap;

/// Package-manager family a distribution resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistroFamily {
    Debian,
    Alpine,
    Rhel,
    Arch,
    Suse,
    Unknown,
}

impl DistroFamily {
    fn for_id(id: &str) -> Option<Self> {
        match id {
            "debian" | "ubuntu" | "raspbian" | "linuxmint" | "pop" | "kali" | "elementary" => {
                Some(Self::Debian)
            }
            "alpine" => Some(Self::Alpine),
            // centos and fedora deliberately take the multi-package-manager
            // path rather than the Debian-style fall-through.
            "rhel" | "centos" | "fedora" | "almalinux" | "rocky" | "ol" | "amzn"
            | "scientific" => Some(Self::Rhel),
            "arch" | "manjaro" => Some(Self::Arch),
            "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" | "sles" | "sled" => {
                Some(Self::Suse)
            }
            _ => None,
        }
    }

    /// Shell command installing `packages` with this family's package
    /// manager. Unknown families get the Debian-style default.
    pub fn install_command(&self, packages: &[&str]) -> String {
        let pkgs = packages.join(" ");
        match self {
            Self::Debian | Self::Unknown => {
                format!("apt-get update && apt-get install -y {pkgs}")
            }
            Self::Alpine => format!("apk add --no-cache {pkgs}"),
            Self::Rhel => format!(
                "dnf install -y {pkgs} || yum install -y {pkgs} || microdnf install {pkgs}"
            ),
            Self::Arch => format!("pacman -Sy --noconfirm {pkgs}"),
            Self::Suse => format!("zypper install -y {pkgs}"),
        }
    }
}

/// Parsed identity of a container's OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsDistribution {
    pub id: String,
    pub id_like: Vec<String>,
    pub pretty_name: Option<String>,
    pub family: DistroFamily,
}

impl OsDistribution {
    /// Identity for a bare distribution id, used for simulated-OS
    /// overrides where no os-release content exists.
    pub fn from_id(id: &str) -> Self {
        let id = id.trim().to_ascii_lowercase();
        let family = DistroFamily::for_id(&id).unwrap_or(DistroFamily::Unknown);
        Self {
            id,
            id_like: Vec::new(),
            pretty_name: None,
            family,
        }
    }

    pub fn install_command(&self, packages: &[&str]) -> String {
        self.family.install_command(packages)
    }
}

/// Parses `/etc/os-release` content. `ID` wins; `ID_LIKE` tokens are
/// consulted in order when `ID` maps to no known family.
pub fn parse_os_release(content: &str) -> OsDistribution {
    let fields = os_release_fields(content);

    let id = fields
        .get("ID")
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();
    let id_like: Vec<String> = fields
        .get("ID_LIKE")
        .map(|v| {
            v.split_whitespace()
                .map(|t| t.to_ascii_lowercase())
                .collect()
        })
        .unwrap_or_default();
    let pretty_name = fields.get("PRETTY_NAME").cloned();

    let family = DistroFamily::for_id(&id)
        .or_else(|| id_like.iter().find_map(|t| DistroFamily::for_id(t)))
        .unwrap_or(DistroFamily::Unknown);

    OsDistribution {
        id,
        id_like,
        pretty_name,
        family,
    }
}

fn os_release_fields(content: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            fields.insert(key.trim().to_string(), value.to_string());
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_values() {
        let distro = parse_os_release("ID=\"ubuntu\"\nPRETTY_NAME=\"Ubuntu 22.04\"\n");
        assert_eq!(distro.id, "ubuntu");
        assert_eq!(distro.family, DistroFamily::Debian);
        assert_eq!(distro.pretty_name.as_deref(), Some("Ubuntu 22.04"));
    }

    #[test]
    fn id_like_rescues_unknown_id() {
        let distro = parse_os_release("ID=neon\nID_LIKE=\"ubuntu debian\"\n");
        assert_eq!(distro.family, DistroFamily::Debian);
    }

    #[test]
    fn unknown_everything_falls_through() {
        let distro = parse_os_release("ID=plan9\n");
        assert_eq!(distro.family, DistroFamily::Unknown);
        assert!(distro
            .install_command(&["git"])
            .starts_with("apt-get update"));
    }
}
