//! Where an image comes from.
//!
//! The target string is classified into an [`ImageType`]. Local archives and
//! filesystem roots are used in place; registry identifiers are fetched by an
//! [`ImageFetcher`] into an [`ImageArchive`] that removes itself when
//! dropped.

pub mod archive;
pub mod docker;

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::config::Credentials;

pub use archive::{archive_identifier, validate_archive_path};
pub use docker::DockerSaveFetcher;

pub const DOCKER_ARCHIVE_PREFIX: &str = "docker-archive:";
pub const OCI_ARCHIVE_PREFIX: &str = "oci-archive:";
pub const FILESYSTEM_PREFIX: &str = "fs:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageType {
    DockerArchive(PathBuf),
    OciArchive(PathBuf),
    Filesystem(PathBuf),
    /// Registry identifier, e.g. `alpine:3.20` or `gcr.io/project/app@sha256:...`.
    Identifier(String),
}

impl ImageType {
    pub fn classify(target: &str) -> Result<Self> {
        let target = target.trim();
        if target.is_empty() {
            bail!("Unhandled image type: empty target");
        }
        if let Some(path) = target.strip_prefix(DOCKER_ARCHIVE_PREFIX) {
            return Ok(ImageType::DockerArchive(PathBuf::from(path)));
        }
        if let Some(path) = target.strip_prefix(OCI_ARCHIVE_PREFIX) {
            return Ok(ImageType::OciArchive(PathBuf::from(path)));
        }
        if let Some(path) = target.strip_prefix(FILESYSTEM_PREFIX) {
            return Ok(ImageType::Filesystem(PathBuf::from(path)));
        }
        if let Some((prefix, _)) = target.split_once(':') {
            if let Some(kind) = prefix.strip_suffix("-archive") {
                if !kind.is_empty() && kind.chars().all(|c| c.is_ascii_lowercase()) {
                    bail!("Unhandled image type for image {}", target);
                }
            }
        }
        Ok(ImageType::Identifier(target.to_string()))
    }
}

/// Appends `:latest` to identifiers that carry no `:` at all.
pub fn append_latest_tag_if_missing(identifier: &str) -> String {
    if identifier.contains(':') {
        identifier.to_string()
    } else {
        format!("{}:latest", identifier)
    }
}

/// A fetched image archive living in its own directory below the save path.
/// The directory is removed on drop; a removal failure is only logged.
#[derive(Debug)]
pub struct ImageArchive {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl ImageArchive {
    /// Reserves a fresh directory below `save_dir` for an archive called
    /// `file_name`. The archive itself is written by the fetcher.
    pub fn new_in(save_dir: &Path, file_name: &str) -> Result<Self> {
        std::fs::create_dir_all(save_dir)
            .with_context(|| format!("Failed to create image save path: {}", save_dir.display()))?;
        let dir = tempfile::Builder::new()
            .prefix("oci-inventory-archive-")
            .tempdir_in(save_dir)
            .with_context(|| format!("Failed to create archive directory in {}", save_dir.display()))?;
        Ok(Self {
            path: dir.path().join(file_name),
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the archive; gone once this value is dropped.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(|d| d.path())
    }
}

impl Drop for ImageArchive {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let location = dir.path().display().to_string();
            if let Err(e) = dir.close() {
                log::warn!("Failed to remove downloaded image archive {}: {}", location, e);
            }
        }
    }
}

/// Fetches a registry image and saves it as a local archive.
pub trait ImageFetcher {
    fn fetch(
        &self,
        image: &str,
        save_dir: &Path,
        credentials: &Credentials,
        platform: Option<&str>,
    ) -> Result<ImageArchive>;
}
