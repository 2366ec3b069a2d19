use anyhow::{anyhow, Context, Result};
use log::info;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use super::{ImageArchive, ImageFetcher};
use crate::config::Credentials;
use crate::oci_distribution::registry_host;

const ARCHIVE_FILE_NAME: &str = "image.tar";

/// Fetches images with the `docker` CLI: optional `login`, `pull`, then
/// `save` into the archive directory.
pub struct DockerSaveFetcher {
    binary: String,
}

impl Default for DockerSaveFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerSaveFetcher {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    /// Uses a different docker-compatible CLI (e.g. `podman`, `nerdctl`).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run_command(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute {} command: {:?}", self.binary, args.first()))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .with_context(|| format!("Failed to write to {} stdin", self.binary))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for {} command", self.binary))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("{} command failed: {}", self.binary, error.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl ImageFetcher for DockerSaveFetcher {
    fn fetch(
        &self,
        image: &str,
        save_dir: &Path,
        credentials: &Credentials,
        platform: Option<&str>,
    ) -> Result<ImageArchive> {
        let archive = ImageArchive::new_in(save_dir, ARCHIVE_FILE_NAME)?;
        let archive_path = archive
            .path()
            .to_str()
            .ok_or_else(|| anyhow!("Archive path is not valid UTF-8: {}", archive.path().display()))?
            .to_string();

        if let Some((username, password)) = credentials.pair() {
            let host = registry_host(image);
            info!("Logging in to {}", host);
            self.run_command(&["login", "--username", username, "--password-stdin", host], Some(password))?;
        }

        info!("Pulling image '{}'...", image);
        let mut pull_args = vec!["pull"];
        if let Some(platform) = platform {
            pull_args.extend(["--platform", platform]);
        }
        pull_args.push(image);
        self.run_command(&pull_args, None)?;

        info!("Exporting image '{}' to archive...", image);
        self.run_command(&["save", "-o", &archive_path, image], None)?;

        Ok(archive)
    }
}
