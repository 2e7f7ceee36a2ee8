//! Image building and pushing: user Dockerfiles, derived session build
//! images with content-hash reuse, and per-registry authenticated
//! pushes that record resulting digests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use bollard::image::{BuildImageOptions, PushImageOptions, TagImageOptions};
use futures::stream::StreamExt;
use tracing::{debug, info};

use crate::context::RunContext;
use crate::daemon::{sanitize_name, DaemonClient};
use crate::error::{EngineError, Result};
use crate::protocol::{
    from_build_info, from_push_info, message_channel, AuxPayload, MessageSender, ResponseMessage,
};
use crate::registry::{registry_of, RegistryAuth};

pub const CONFIG_HASH_LABEL: &str = "abox.config-hash";
pub const RUN_ID_LABEL: &str = "abox.run-id";

/// Digest recorded after pushing one tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedDigest {
    pub digest: String,
    pub size: i64,
}

/// A Dockerfile-based image definition plus everything learned while
/// building and pushing it. The digest map fills in from concurrent
/// push tasks.
#[derive(Debug)]
pub struct DockerfileSpec {
    pub dockerfile_path: PathBuf,
    pub context_dir: Option<PathBuf>,
    pub tags: Vec<String>,
    pub build_args: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    digests: RwLock<HashMap<String, PushedDigest>>,
}

impl DockerfileSpec {
    pub fn new(dockerfile_path: impl Into<PathBuf>) -> Self {
        Self {
            dockerfile_path: dockerfile_path.into(),
            context_dir: None,
            tags: Vec::new(),
            build_args: HashMap::new(),
            labels: HashMap::new(),
            digests: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_context(mut self, dir: impl Into<PathBuf>) -> Self {
        self.context_dir = Some(dir.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_build_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.build_args.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Directory the build context is read from.
    pub fn context_root(&self) -> PathBuf {
        if let Some(dir) = &self.context_dir {
            return dir.clone();
        }
        match self.dockerfile_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Records the digest one push produced. Each tag is written once;
    /// a repeated record for the same tag is ignored.
    pub fn record_digest(&self, tag: &str, digest: PushedDigest) {
        let mut map = self.digests.write().unwrap_or_else(|e| e.into_inner());
        map.entry(tag.to_string()).or_insert(digest);
    }

    pub fn digest_for(&self, tag: &str) -> Option<PushedDigest> {
        let map = self.digests.read().unwrap_or_else(|e| e.into_inner());
        map.get(tag).cloned()
    }

    pub fn digests(&self) -> HashMap<String, PushedDigest> {
        let map = self.digests.read().unwrap_or_else(|e| e.into_inner());
        map.clone()
    }
}

/// Tag for a session's derived build image.
pub fn derived_tag(image: &str, run_id: &str, tag: &str) -> String {
    let (name, _) = split_reference(image);
    format!("ab-{}-{}:{tag}", sanitize_name(&name), sanitize_name(run_id))
}

/// `repo:tag` split that leaves registry ports alone.
pub fn split_reference(reference: &str) -> (String, String) {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (reference.to_string(), "latest".to_string()),
    }
}

/// Base-image references named by a Dockerfile's FROM lines, skipping
/// stage aliases and `scratch`.
pub fn base_references(dockerfile: &str) -> Vec<String> {
    let mut stages: Vec<String> = Vec::new();
    let mut references = Vec::new();
    for line in dockerfile.lines() {
        let line = line.trim();
        let rest = match line.get(..4) {
            Some(keyword) if keyword.eq_ignore_ascii_case("from") => &line[4..],
            _ => continue,
        };
        if !rest.starts_with(char::is_whitespace) {
            continue;
        }
        let mut tokens = rest.split_whitespace().peekable();
        while matches!(tokens.peek(), Some(t) if t.starts_with("--")) {
            tokens.next();
        }
        let Some(reference) = tokens.next() else { continue };
        if let (Some(kw), Some(alias)) = (tokens.next(), tokens.next()) {
            if kw.eq_ignore_ascii_case("as") {
                stages.push(alias.to_ascii_lowercase());
            }
        }
        let lowered = reference.to_ascii_lowercase();
        if lowered == "scratch" || stages.contains(&lowered) {
            continue;
        }
        references.push(reference.to_string());
    }
    references
}

/// Everything a derived session image bakes in on top of its base.
#[derive(Debug, Default, Clone)]
pub struct DerivedImageParts {
    /// Container paths that will be mounted over; a stale symlink at any
    /// of them breaks the mount.
    pub mount_targets: Vec<String>,
    /// Extra RUN commands contributed by tweaks and callers.
    pub build_commands: Vec<String>,
    /// Host content baked in with ADD, as (host source, container dest).
    pub add_entries: Vec<(PathBuf, String)>,
}

/// Dockerfile text for a derived image. The base keeps its entrypoint
/// and command; only root-level preparation is layered on.
pub fn synthesize_dockerfile(base: &str, parts: &DerivedImageParts) -> String {
    let mut text = String::new();
    text.push_str(&format!("FROM {base}\n"));
    text.push_str("USER root\n");
    for target in &parts.mount_targets {
        text.push_str(&format!("RUN [ -L {target} ] && rm -f {target} || true\n"));
    }
    for command in &parts.build_commands {
        text.push_str(&format!("RUN {command}\n"));
    }
    for (index, (_, dest)) in parts.add_entries.iter().enumerate() {
        text.push_str(&format!("ADD add{index} {dest}\n"));
    }
    text
}

async fn archive_build_context(
    context_dir: Option<PathBuf>,
    dockerfile_name: String,
    dockerfile_bytes: Option<Vec<u8>>,
    add_entries: Vec<(PathBuf, String)>,
) -> Result<Vec<u8>> {
    let bytes = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(true);
        if let Some(dir) = context_dir {
            builder.append_dir_all(".", &dir)?;
        }
        if let Some(bytes) = dockerfile_bytes {
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, &dockerfile_name, bytes.as_slice())?;
        }
        for (index, (source, _)) in add_entries.iter().enumerate() {
            let name = format!("add{index}");
            if source.is_dir() {
                builder.append_dir_all(&name, source)?;
            } else {
                builder.append_path_with_name(source, &name)?;
            }
        }
        builder.into_inner()
    })
    .await
    .map_err(|e| EngineError::Build(format!("context archive task failed: {e}")))??;
    Ok(bytes)
}

/// Builds and pushes images through the daemon, reusing prior builds by
/// config-hash label.
pub struct ImageBuilder {
    daemon: DaemonClient,
    auth: Arc<RegistryAuth>,
    disable_cache: bool,
}

impl ImageBuilder {
    pub fn new(daemon: DaemonClient, auth: Arc<RegistryAuth>, disable_cache: bool) -> Self {
        Self {
            daemon,
            auth,
            disable_cache,
        }
    }

    /// Builds a user-supplied Dockerfile spec and returns the image id.
    pub async fn build(&self, spec: &DockerfileSpec, ctx: &RunContext) -> Result<String> {
        let dockerfile_text = std::fs::read_to_string(&spec.dockerfile_path)?;
        let context_root = spec.context_root();

        // When the Dockerfile lives inside the context it is referenced
        // in place; otherwise its bytes ride along under a private name.
        let (dockerfile_name, extra_dockerfile) =
            match spec.dockerfile_path.strip_prefix(&context_root) {
                Ok(relative) => (relative.to_string_lossy().into_owned(), None),
                Err(_) => (
                    "Dockerfile.abox".to_string(),
                    Some(dockerfile_text.clone().into_bytes()),
                ),
            };

        let tar = archive_build_context(
            Some(context_root),
            dockerfile_name.clone(),
            extra_dockerfile,
            Vec::new(),
        )
        .await?;

        let options = BuildImageOptions {
            dockerfile: dockerfile_name,
            t: spec.tags.first().cloned().unwrap_or_default(),
            nocache: self.disable_cache,
            rm: true,
            forcerm: true,
            buildargs: spec.build_args.clone(),
            labels: spec.labels.clone(),
            ..Default::default()
        };
        let id = self
            .build_archive(tar, options, &dockerfile_text, ctx)
            .await?
            .ok_or_else(|| EngineError::Build("daemon reported no image id".to_string()))?;
        debug!("Built {} from {}", id, spec.dockerfile_path.display());

        // One build serves every requested tag.
        for full_tag in spec.tags.iter().skip(1) {
            let (repo, tag) = split_reference(full_tag);
            let options = TagImageOptions { repo, tag };
            self.daemon.docker.tag_image(&id, Some(options)).await?;
        }
        Ok(id)
    }

    /// Builds a derived session image, or reuses the one labeled with
    /// the same config hash. Returns the reference to run.
    pub async fn build_derived(
        &self,
        base: &str,
        run_id: &str,
        config_hash: &str,
        parts: &DerivedImageParts,
        ctx: &RunContext,
    ) -> Result<String> {
        if !self.disable_cache {
            if let Some(existing) = self.find_by_hash(config_hash).await? {
                info!("Reusing derived image {} for hash {}", existing, config_hash);
                return Ok(existing);
            }
        }

        let reference = derived_tag(base, run_id, &config_hash[..12.min(config_hash.len())]);
        let dockerfile_text = synthesize_dockerfile(base, parts);
        debug!("Derived Dockerfile for {}:\n{}", reference, dockerfile_text);

        let tar = archive_build_context(
            None,
            "Dockerfile".to_string(),
            Some(dockerfile_text.clone().into_bytes()),
            parts.add_entries.clone(),
        )
        .await?;

        let mut labels = HashMap::new();
        labels.insert(CONFIG_HASH_LABEL.to_string(), config_hash.to_string());
        labels.insert(RUN_ID_LABEL.to_string(), run_id.to_string());

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: reference.clone(),
            nocache: self.disable_cache,
            rm: true,
            forcerm: true,
            labels,
            ..Default::default()
        };
        self.build_archive(tar, options, &dockerfile_text, ctx).await?;
        Ok(reference)
    }

    /// First image carrying the given config-hash label, preferring its
    /// tag over the raw id.
    pub async fn find_by_hash(&self, config_hash: &str) -> Result<Option<String>> {
        let images = self
            .daemon
            .list_images_by_label(CONFIG_HASH_LABEL, config_hash)
            .await?;
        Ok(images.first().map(|image| {
            image
                .repo_tags
                .first()
                .cloned()
                .unwrap_or_else(|| image.id.clone())
        }))
    }

    async fn build_archive(
        &self,
        tar: Vec<u8>,
        options: BuildImageOptions<String>,
        dockerfile_text: &str,
        ctx: &RunContext,
    ) -> Result<Option<String>> {
        let bases = base_references(dockerfile_text);
        let base_refs: Vec<&str> = bases.iter().map(String::as_str).collect();
        let credentials = self.auth.auth_map_for(&base_refs).await;

        let (sender, reader) = message_channel(1);
        // The build stream borrows the client it came from, so the task
        // owns a clone and constructs the stream itself.
        let docker = self.daemon.docker.clone();
        let producer = tokio::spawn(async move {
            let mut stream = docker.build_image(options, Some(credentials), Some(tar.into()));
            while let Some(item) = stream.next().await {
                match item {
                    Ok(info) => {
                        for message in from_build_info(info) {
                            sender.send(message);
                        }
                    }
                    Err(e) => {
                        sender.send(ResponseMessage::Error(e.to_string()));
                        break;
                    }
                }
            }
            sender.finish();
        });

        let listen = reader.listen(|message| {
            if ctx.debug {
                ctx.emit(&message.summary());
            } else {
                debug!("Build: {}", message.summary());
            }
        });

        let (aux, join) = tokio::join!(listen, producer);
        join.map_err(|e| EngineError::Build(format!("build stream task failed: {e}")))?;
        let aux = aux.map_err(|e| match e {
            EngineError::Stream(reason) => EngineError::Build(reason),
            other => other,
        })?;

        Ok(aux.into_iter().find_map(|payload| match payload {
            AuxPayload::ImageId(id) => Some(id),
            _ => None,
        }))
    }

    /// Pushes every tag of the spec concurrently through one merged
    /// message stream, recording each tag's digest as its terminal
    /// status arrives.
    pub async fn push(&self, spec: &DockerfileSpec, ctx: &RunContext) -> Result<()> {
        if spec.tags.is_empty() {
            return Ok(());
        }

        // Terminal push lines carry only the repo-less tag; map them
        // back to the full references being pushed.
        let short_to_full: HashMap<String, String> = spec
            .tags
            .iter()
            .map(|full| (split_reference(full).1, full.clone()))
            .collect();

        let (sender, reader) = message_channel(spec.tags.len());
        let mut tasks = Vec::new();
        for full_tag in &spec.tags {
            tasks.push(self.push_one(full_tag.clone(), sender.clone()));
        }
        drop(sender);

        let render = reader.listen(|message| {
            if let ResponseMessage::Aux(AuxPayload::PushResult { tag, digest, size }) = message {
                if let Some(full) = short_to_full.get(tag) {
                    spec.record_digest(
                        full,
                        PushedDigest {
                            digest: digest.clone(),
                            size: *size,
                        },
                    );
                }
            }
            ctx.emit(&message.summary());
        });

        let (results, render_result) = tokio::join!(futures::future::join_all(tasks), render);
        for result in results {
            result?;
        }
        render_result?;
        info!("Pushed {} tag(s)", spec.tags.len());
        Ok(())
    }

    async fn push_one(&self, full_tag: String, sender: MessageSender) -> Result<()> {
        let (repo, tag) = split_reference(&full_tag);
        let credentials = self.auth.credentials_for(&registry_of(&repo)).await;
        let options = PushImageOptions { tag };

        let mut stream = self
            .daemon
            .docker
            .push_image(&repo, Some(options), credentials);

        let mut failure: Option<String> = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    for message in from_push_info(info) {
                        if let ResponseMessage::Error(error) = &message {
                            failure.get_or_insert_with(|| error.clone());
                        }
                        sender.send(message);
                    }
                }
                Err(e) => {
                    failure.get_or_insert_with(|| e.to_string());
                    sender.send(ResponseMessage::Error(e.to_string()));
                    break;
                }
            }
        }
        sender.finish();

        match failure {
            Some(reason) => Err(EngineError::Push {
                tag: full_tag,
                reason,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_tag_format_is_exact() {
        assert_eq!(derived_tag("alpine", "t1", "abcdef123456"), "ab-alpine-t1:abcdef123456");
        assert_eq!(
            derived_tag("ghcr.io/acme/tool:2.1", "run 7", "latest"),
            "ab-ghcr.io-acme-tool-run-7:latest"
        );
    }

    #[test]
    fn reference_splitting_keeps_registry_ports() {
        assert_eq!(
            split_reference("reg.local:5000/app"),
            ("reg.local:5000/app".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_reference("reg.local:5000/app:1.2"),
            ("reg.local:5000/app".to_string(), "1.2".to_string())
        );
    }

    #[test]
    fn from_lines_skip_stages_and_scratch() {
        let dockerfile = "FROM --platform=linux/amd64 rust:1.79 AS build\n\
                          RUN cargo build\n\
                          FROM scratch\n\
                          FROM build\n\
                          FROM alpine:3.20\n";
        assert_eq!(base_references(dockerfile), vec!["rust:1.79", "alpine:3.20"]);
    }

    #[test]
    fn dockerfile_synthesis_orders_sections() {
        let parts = DerivedImageParts {
            mount_targets: vec!["/data".to_string()],
            build_commands: vec!["apk add --no-cache git".to_string()],
            add_entries: vec![(PathBuf::from("/src"), "/app".to_string())],
        };
        let text = synthesize_dockerfile("alpine:3.20", &parts);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "FROM alpine:3.20");
        assert_eq!(lines[1], "USER root");
        assert_eq!(lines[2], "RUN [ -L /data ] && rm -f /data || true");
        assert_eq!(lines[3], "RUN apk add --no-cache git");
        assert_eq!(lines[4], "ADD add0 /app");
    }

    #[test]
    fn digest_map_writes_once_per_tag() {
        let spec = DockerfileSpec::new("/tmp/Dockerfile").with_tag("repo:one");
        spec.record_digest(
            "repo:one",
            PushedDigest {
                digest: "sha256:aaa".to_string(),
                size: 10,
            },
        );
        spec.record_digest(
            "repo:one",
            PushedDigest {
                digest: "sha256:bbb".to_string(),
                size: 20,
            },
        );
        assert_eq!(
            spec.digest_for("repo:one").unwrap().digest,
            "sha256:aaa"
        );
    }
}
