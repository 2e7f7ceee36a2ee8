//! Archive-based file transfer between host and container, built on the
//! daemon's tar endpoints.

use std::io::Cursor;
use std::path::{Component, Path, PathBuf};

use bollard::container::{DownloadFromContainerOptions, UploadToContainerOptions};
use futures::stream::StreamExt;
use tracing::{debug, info};

use super::DaemonClient;
use crate::error::{EngineError, Result};
use crate::volume::Volume;

/// Tars a host file or directory in a blocking task. Directories are
/// archived as their contents (no wrapping root entry).
pub(crate) async fn archive_host_path(path: &Path) -> Result<Vec<u8>> {
    let path = path.to_path_buf();
    let bytes = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(true);
        let meta = std::fs::metadata(&path)?;
        if meta.is_dir() {
            builder.append_dir_all(".", &path)?;
        } else {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            builder.append_path_with_name(&path, name)?;
        }
        builder.into_inner()
    })
    .await
    .map_err(|e| EngineError::Stream(format!("archive task failed: {e}")))??;
    Ok(bytes)
}

fn unpack_stripping_root(bytes: Vec<u8>, dest: &Path) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    archive.set_preserve_permissions(true);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();

        // The daemon roots the archive at the requested path's last
        // element; that element maps onto `dest` itself.
        let mut components = raw_path.components();
        components.next();
        let stripped: PathBuf = components.as_path().to_path_buf();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        if stripped
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("archive entry escapes destination: {}", raw_path.display()),
            ));
        }

        let target = dest.join(&stripped);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }
    Ok(())
}

impl DaemonClient {
    async fn upload_archive(&self, container: &str, dest: &str, bytes: Vec<u8>) -> Result<()> {
        let options = UploadToContainerOptions {
            path: dest.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(container, Some(options), bytes.into())
            .await?;
        Ok(())
    }

    /// Copies a host file or directory into `cont_dest`. A missing
    /// destination is created once and the upload retried.
    pub async fn copy_to_container(
        &self,
        container: &str,
        host_path: &Path,
        cont_dest: &str,
    ) -> Result<()> {
        let bytes = archive_host_path(host_path).await?;
        match self
            .upload_archive(container, cont_dest, bytes.clone())
            .await
        {
            Ok(()) => Ok(()),
            Err(first) => {
                debug!(
                    "Upload to {}:{} failed ({}), creating destination and retrying",
                    container, cont_dest, first
                );
                self.exec_capture(
                    container,
                    vec![
                        "mkdir".to_string(),
                        "-p".to_string(),
                        cont_dest.to_string(),
                    ],
                    None,
                )
                .await?;
                self.upload_archive(container, cont_dest, bytes).await
            }
        }
    }

    /// Copies `cont_path` out of the container into `host_dest`,
    /// mapping the archived root onto `host_dest` itself.
    pub async fn copy_from_container(
        &self,
        container: &str,
        cont_path: &str,
        host_dest: &Path,
    ) -> Result<()> {
        let options = DownloadFromContainerOptions {
            path: cont_path.to_string(),
        };
        let mut stream = self.docker.download_from_container(container, Some(options));
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            bytes.extend_from_slice(&chunk?);
        }

        std::fs::create_dir_all(host_dest)?;
        let dest = host_dest.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_stripping_root(bytes, &dest))
            .await
            .map_err(|e| EngineError::Stream(format!("unpack task failed: {e}")))??;
        Ok(())
    }

    /// Reads one file out of a container (running or merely created)
    /// through the archive endpoint. `None` when the path is absent.
    pub async fn read_container_file(&self, container: &str, path: &str) -> Result<Option<String>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.docker.download_from_container(container, Some(options));
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(data) => bytes.extend_from_slice(&data),
                Err(e) if super::is_not_found(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }

        let content = tokio::task::spawn_blocking(move || -> std::io::Result<Option<String>> {
            use std::io::Read;
            let mut archive = tar::Archive::new(Cursor::new(bytes));
            for entry in archive.entries()? {
                let mut entry = entry?;
                if entry.header().entry_type().is_file() {
                    let mut content = String::new();
                    entry.read_to_string(&mut content)?;
                    return Ok(Some(content));
                }
            }
            Ok(None)
        })
        .await
        .map_err(|e| EngineError::Stream(format!("archive read task failed: {e}")))??;
        Ok(content)
    }

    /// Copies every writable volume's container content back to its host
    /// path. Used by approaches that inject content instead of binding.
    pub async fn copy_back_volumes(&self, container: &str, volumes: &[Volume]) -> Result<()> {
        for volume in volumes.iter().filter(|v| v.is_rw()) {
            info!(
                "Copying {}:{} back to {}",
                container, volume.cont_path, volume.host_path
            );
            self.copy_from_container(container, &volume.cont_path, Path::new(&volume.host_path))
                .await?;
        }
        Ok(())
    }
}
