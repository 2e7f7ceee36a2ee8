//! Registry credential resolution from the Docker credential file, with
//! credential-helper fallback and temporary credential-file staging for
//! processes that need one on disk.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bollard::auth::DockerCredentials;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::staging::StagingArea;

const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
    identitytoken: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(rename = "credsStore")]
    creds_store: Option<String>,
    #[serde(rename = "credHelpers", default)]
    cred_helpers: HashMap<String, String>,
}

/// Parsed view of `~/.docker/config.json` (or `$DOCKER_CONFIG`).
#[derive(Debug, Default)]
pub struct RegistryAuth {
    config: DockerConfigFile,
}

impl RegistryAuth {
    /// Loads the caller's credential file. A missing or unreadable file
    /// yields an empty store, not an error.
    pub fn load() -> Self {
        let path = config_file_path();
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => Self { config },
                Err(e) => {
                    warn!("Ignoring malformed {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config = serde_json::from_str(raw)
            .map_err(|e| EngineError::Credentials(format!("credential file: {e}")))?;
        Ok(Self { config })
    }

    /// Credentials for one registry host. Lookup order: exact auths key,
    /// https-prefixed key, the Docker Hub alias key, then the registry's
    /// credential helper, then the store-wide helper.
    pub async fn credentials_for(&self, registry: &str) -> Option<DockerCredentials> {
        for key in candidate_keys(registry) {
            if let Some(entry) = self.config.auths.get(&key) {
                if let Some(creds) = entry_credentials(entry, &key) {
                    return Some(creds);
                }
            }
        }

        let helper = self
            .config
            .cred_helpers
            .get(registry)
            .or(self.config.creds_store.as_ref())?;
        run_credential_helper(helper, registry).await
    }

    /// Auth map keyed by registry, shaped for the daemon's build call.
    pub async fn auth_map_for(&self, references: &[&str]) -> HashMap<String, DockerCredentials> {
        let mut map = HashMap::new();
        for reference in references {
            let registry = registry_of(reference);
            if map.contains_key(&registry) {
                continue;
            }
            if let Some(creds) = self.credentials_for(&registry).await {
                map.insert(registry, creds);
            }
        }
        map
    }

    /// Writes a minimal credential file covering `registries` into the
    /// staging area, for tools that read credentials from disk.
    pub async fn materialize(
        &self,
        staging: &StagingArea,
        registries: &[&str],
    ) -> Result<PathBuf> {
        let mut auths = serde_json::Map::new();
        for registry in registries {
            if let Some(creds) = self.credentials_for(registry).await {
                let user = creds.username.unwrap_or_default();
                let pass = creds.password.unwrap_or_default();
                let encoded = BASE64.encode(format!("{user}:{pass}"));
                auths.insert(
                    auth_key(registry),
                    serde_json::json!({ "auth": encoded }),
                );
            }
        }
        let body = serde_json::json!({ "auths": auths });
        let path = staging.write_file("docker-config/config.json", body.to_string().as_bytes())?;
        debug!("Materialized registry credentials at {}", path.display());
        Ok(path)
    }
}

fn config_file_path() -> PathBuf {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        return PathBuf::from(dir).join("config.json");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".docker")
        .join("config.json")
}

fn is_hub(registry: &str) -> bool {
    matches!(
        registry,
        "" | "docker.io" | "index.docker.io" | "registry-1.docker.io"
    )
}

fn auth_key(registry: &str) -> String {
    if is_hub(registry) {
        DOCKER_HUB_AUTH_KEY.to_string()
    } else {
        registry.to_string()
    }
}

fn candidate_keys(registry: &str) -> Vec<String> {
    if is_hub(registry) {
        return vec![DOCKER_HUB_AUTH_KEY.to_string(), "docker.io".to_string()];
    }
    vec![
        registry.to_string(),
        format!("https://{registry}"),
        format!("https://{registry}/v1/"),
    ]
}

fn entry_credentials(entry: &AuthEntry, server: &str) -> Option<DockerCredentials> {
    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        return Some(DockerCredentials {
            username: Some(username.clone()),
            password: Some(password.clone()),
            serveraddress: Some(server.to_string()),
            ..Default::default()
        });
    }
    if let Some(token) = &entry.identitytoken {
        return Some(DockerCredentials {
            identitytoken: Some(token.clone()),
            serveraddress: Some(server.to_string()),
            ..Default::default()
        });
    }
    let decoded = BASE64.decode(entry.auth.as_deref()?.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(DockerCredentials {
        username: Some(username.to_string()),
        password: Some(password.to_string()),
        serveraddress: Some(server.to_string()),
        ..Default::default()
    })
}

#[derive(Debug, Deserialize)]
struct HelperOutput {
    #[serde(rename = "Username")]
    username: Option<String>,
    #[serde(rename = "Secret")]
    secret: Option<String>,
    #[serde(rename = "ServerURL")]
    server_url: Option<String>,
}

/// Asks `docker-credential-<helper> get` for one registry. Helper
/// failures resolve to no credentials rather than an error.
async fn run_credential_helper(helper: &str, registry: &str) -> Option<DockerCredentials> {
    use tokio::io::AsyncWriteExt;

    let mut child = match Command::new(format!("docker-credential-{helper}"))
        .arg("get")
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            debug!("Credential helper '{}' not runnable: {}", helper, e);
            return None;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(auth_key(registry).as_bytes()).await;
    }
    let output = child.wait_with_output().await.ok()?;
    if !output.status.success() {
        debug!(
            "Credential helper '{}' returned {} for {}",
            helper, output.status, registry
        );
        return None;
    }
    let parsed: HelperOutput = serde_json::from_slice(&output.stdout).ok()?;
    Some(DockerCredentials {
        username: parsed.username,
        password: parsed.secret,
        serveraddress: parsed.server_url.or_else(|| Some(auth_key(registry))),
        ..Default::default()
    })
}

/// Registry host of an image reference. References without a
/// host-looking first component belong to Docker Hub.
pub fn registry_of(reference: &str) -> String {
    let first = reference.split('/').next().unwrap_or_default();
    let has_more = reference.contains('/');
    if has_more && (first.contains('.') || first.contains(':') || first == "localhost") {
        first.to_string()
    } else {
        "docker.io".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_extraction() {
        assert_eq!(registry_of("alpine:3.20"), "docker.io");
        assert_eq!(registry_of("library/alpine"), "docker.io");
        assert_eq!(registry_of("ghcr.io/acme/tool:1"), "ghcr.io");
        assert_eq!(registry_of("reg.local:5000/app"), "reg.local:5000");
        assert_eq!(registry_of("localhost/app"), "localhost");
    }

    #[tokio::test]
    async fn decodes_basic_auth_entries() {
        let encoded = BASE64.encode("alice:s3cret");
        let raw = format!(r#"{{"auths":{{"ghcr.io":{{"auth":"{encoded}"}}}}}}"#);
        let auth = RegistryAuth::from_json(&raw).unwrap();

        let creds = auth.credentials_for("ghcr.io").await.unwrap();
        assert_eq!(creds.username.as_deref(), Some("alice"));
        assert_eq!(creds.password.as_deref(), Some("s3cret"));
    }

    #[tokio::test]
    async fn hub_aliases_share_one_key() {
        let encoded = BASE64.encode("bob:pw");
        let raw = format!(
            r#"{{"auths":{{"https://index.docker.io/v1/":{{"auth":"{encoded}"}}}}}}"#
        );
        let auth = RegistryAuth::from_json(&raw).unwrap();

        for registry in ["", "docker.io", "index.docker.io"] {
            let creds = auth.credentials_for(registry).await.unwrap();
            assert_eq!(creds.username.as_deref(), Some("bob"));
        }
    }

    #[tokio::test]
    async fn unknown_registry_resolves_to_none() {
        let auth = RegistryAuth::from_json(r#"{"auths":{}}"#).unwrap();
        assert!(auth.credentials_for("nowhere.example").await.is_none());
    }
}
