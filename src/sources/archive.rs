use anyhow::{anyhow, bail, Result};
use std::fs;
use std::path::Path;

/// Fails fast unless `path` is an existing regular file. Only a stat is
/// performed.
pub fn validate_archive_path(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path).map_err(|_| {
        anyhow!(
            "The provided archive path does not exist on the filesystem: {}",
            path.display()
        )
    })?;
    if !metadata.is_file() {
        bail!("The provided archive path is not a file: {}", path.display());
    }
    Ok(())
}

/// Identifier reported for a local archive: the explicit override, else the
/// archive's base name (`archive.tar` for `/var/tmp/archive.tar`).
pub fn archive_identifier(path: &Path, image_name_and_tag: Option<&str>) -> String {
    if let Some(name) = image_name_and_tag.filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
