use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use tar_rs as tar;

use crate::extractor::{normalize_image_path, stream_to_buffer, ActionRegistry, ExtractAction, ExtractedLayers};

const OPAQUE_MARKER: &str = ".wh..wh..opq";
const WHITEOUT_PREFIX: &str = ".wh.";

/// Opens a tar archive, transparently decompressing gzip (detected by magic
/// bytes rather than file name).
pub fn open_archive(tar_path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = File::open(tar_path)
        .with_context(|| format!("Failed to open tar file: {}", tar_path.display()))?;

    let mut buf_reader = BufReader::new(file);
    let mut magic_bytes = [0u8; 2];
    buf_reader
        .read_exact(&mut magic_bytes)
        .with_context(|| format!("Failed to read magic bytes from tar file: {}", tar_path.display()))?;

    // Reopen the file since we consumed some bytes
    let file = File::open(tar_path)?;

    let reader: Box<dyn Read> = if magic_bytes == [0x1f, 0x8b] {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(tar::Archive::new(reader))
}

/// A link entry in the outer image archive, replayed once every regular
/// file has been written.
struct PendingLink {
    dest: PathBuf,
    /// Target below `dest`'s unpack root.
    target: PathBuf,
}

/// Unpacks an image archive (`docker save` or OCI layout) below `dest`.
/// Entry paths are normalized so nothing lands outside `dest`.
///
/// Symlinks and hardlinks are recreated as copies of their target, resolved
/// inside `dest`. Older `docker save` archives store a repeated layer as a
/// symlink to the tarball already written for the first occurrence.
pub fn unpack_archive(tar_path: &Path, dest: &Path) -> Result<()> {
    let mut archive = open_archive(tar_path)?;
    let mut pending_links = Vec::new();

    for entry_result in archive.entries()? {
        let mut entry = entry_result.context("Failed to read tar entry")?;
        let entry_type = entry.header().entry_type();
        let entry_path = entry.path().context("Failed to get entry path")?.into_owned();
        let rel_path = relative_path(&entry_path);
        if rel_path.as_os_str().is_empty() {
            continue;
        }
        let out_path = dest.join(&rel_path);

        match entry_type {
            tar::EntryType::Directory => {
                fs::create_dir_all(&out_path)
                    .with_context(|| format!("Failed to create directory: {}", out_path.display()))?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                create_parent(&out_path)?;
                let mut out_file = File::create(&out_path)
                    .with_context(|| format!("Failed to create file: {}", out_path.display()))?;
                std::io::copy(&mut entry, &mut out_file)
                    .with_context(|| format!("Failed to write file: {}", out_path.display()))?;
            }
            tar::EntryType::Symlink | tar::EntryType::Link => {
                let Some(link_name) = entry.link_name().context("Failed to get link target")? else {
                    log::debug!("Skipping link without target: {}", rel_path.display());
                    continue;
                };
                let target = if entry_type == tar::EntryType::Symlink && link_name.is_relative() {
                    // Relative symlinks resolve from the directory holding the link.
                    let parent = rel_path.parent().unwrap_or_else(|| Path::new(""));
                    relative_path(&parent.join(&link_name))
                } else {
                    // Hardlink names and absolute symlinks are relative to the archive root.
                    relative_path(&link_name)
                };
                pending_links.push(PendingLink {
                    dest: out_path,
                    target: dest.join(target),
                });
            }
            _ => log::debug!("Skipping archive entry of type {:?}: {}", entry_type, rel_path.display()),
        }
    }

    // Links may point at other links; retry until no pass makes progress.
    while !pending_links.is_empty() {
        let before = pending_links.len();
        let mut unresolved = Vec::new();
        for link in pending_links {
            if link.target.is_file() {
                create_parent(&link.dest)?;
                fs::copy(&link.target, &link.dest).with_context(|| {
                    format!(
                        "Failed to copy link target {} to {}",
                        link.target.display(),
                        link.dest.display()
                    )
                })?;
            } else {
                unresolved.push(link);
            }
        }
        if unresolved.len() == before {
            for link in &unresolved {
                log::debug!(
                    "Skipping link with missing target: {} -> {}",
                    link.dest.display(),
                    link.target.display()
                );
            }
            break;
        }
        pending_links = unresolved;
    }

    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn relative_path(path: &Path) -> PathBuf {
    PathBuf::from(normalize_image_path(path).trim_start_matches('/'))
}

struct PendingHardlink {
    dest: String,
    target: String,
}

/// Everything one layer changes in the merged view.
#[derive(Debug, Default)]
pub struct LayerChanges {
    /// Captured content of this layer's entries, path → action → bytes.
    pub entries: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    /// Paths deleted by `.wh.<name>` markers.
    pub whiteouts: Vec<String>,
    /// Directories whose lower-layer content is hidden by `.wh..wh..opq`.
    pub opaque_dirs: Vec<String>,
    /// Paths this layer turns into something other than a regular file.
    pub shadowed: Vec<String>,
}

impl LayerChanges {
    /// Applies the layer on top of `layers`. Whiteouts and opaque markers
    /// only hide lower layers, so they run before this layer's entries go in.
    pub fn apply_to(self, layers: &mut ExtractedLayers) {
        for dir in &self.opaque_dirs {
            layers.clear_dir(dir);
        }
        for path in self.whiteouts.iter().chain(&self.shadowed) {
            layers.remove_tree(path);
        }
        for (path, content) in self.entries {
            layers.replace(path, content);
        }
    }
}

/// Runs every action matching `path` over the entry content. The stream is
/// read once; with several matching actions it is buffered first.
fn capture(actions: &[&ExtractAction], reader: &mut dyn Read) -> std::io::Result<BTreeMap<String, Vec<u8>>> {
    let mut captured = BTreeMap::new();
    match actions {
        [] => {}
        [action] => {
            captured.insert(action.name.clone(), (action.callback)(reader)?);
        }
        _ => {
            let buffer = stream_to_buffer(reader)?;
            for action in actions {
                let content = (action.callback)(&mut Cursor::new(buffer.as_slice()))?;
                captured.insert(action.name.clone(), content);
            }
        }
    }
    Ok(captured)
}

/// Streams one layer tarball, recording the content of entries matched by
/// `registry` along with the layer's whiteouts. Nothing is written to disk.
pub fn read_layer(
    layer_path: &Path,
    registry: &ActionRegistry,
    lower: &ExtractedLayers,
) -> Result<LayerChanges> {
    let mut archive = open_archive(layer_path)?;
    let mut changes = LayerChanges::default();
    let mut pending_hardlinks = Vec::new();

    for entry_result in archive.entries()? {
        let mut entry = entry_result.context("Failed to read tar entry")?;
        let entry_type = entry.header().entry_type();
        let path = normalize_image_path(&entry.path().context("Failed to get entry path")?);

        let (parent, file_name) = match path.rsplit_once('/') {
            Some((parent, name)) if !name.is_empty() => (parent, name),
            _ => continue,
        };
        let parent = if parent.is_empty() { "/" } else { parent };

        if file_name == OPAQUE_MARKER {
            log::debug!("Found opaque directory marker, hiding lower content of {}", parent);
            changes.opaque_dirs.push(parent.to_string());
            continue;
        }
        if let Some(deleted) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let deleted_path = normalize_image_path(&Path::new(parent).join(deleted));
            log::debug!("Found whiteout marker, deleting: {}", deleted_path);
            changes.whiteouts.push(deleted_path);
            continue;
        }

        match entry_type {
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                // A regular file replaces whatever lower layers held at this path.
                changes.shadowed.push(path.clone());
                let actions: Vec<&ExtractAction> = registry.matching(&path).collect();
                if actions.is_empty() {
                    continue;
                }
                match capture(&actions, &mut entry) {
                    Ok(captured) => {
                        changes.entries.insert(path, captured);
                    }
                    Err(e) => log::warn!("Failed to read {} from layer: {}", path, e),
                }
            }
            tar::EntryType::Link => {
                let target = match entry.link_name() {
                    Ok(Some(target)) => normalize_image_path(&target),
                    _ => {
                        log::debug!("Skipping hardlink without target: {}", path);
                        continue;
                    }
                };
                changes.shadowed.push(path.clone());
                pending_hardlinks.push(PendingHardlink { dest: path, target });
            }
            tar::EntryType::Directory => {}
            _ => {
                // Symlinks and special files hide lower content but carry none.
                changes.shadowed.push(path);
            }
        }
    }

    for hardlink in pending_hardlinks {
        let actions: Vec<&ExtractAction> = registry.matching(&hardlink.dest).collect();
        if actions.is_empty() {
            continue;
        }
        let source = changes
            .entries
            .get(&hardlink.target)
            .or_else(|| lower.get(&hardlink.target))
            .and_then(|content| content.values().next())
            .cloned();
        let Some(source) = source else {
            log::warn!(
                "Skipping hardlink with uncaptured target: {} -> {}",
                hardlink.dest,
                hardlink.target
            );
            continue;
        };
        match capture(&actions, &mut Cursor::new(source.as_slice())) {
            Ok(captured) => {
                changes.entries.insert(hardlink.dest, captured);
            }
            Err(e) => log::warn!("Failed to read hardlink {}: {}", hardlink.dest, e),
        }
    }

    Ok(changes)
}

/// Reads `layer_path` and merges it on top of `layers`.
pub fn apply_layer(layer_path: &Path, registry: &ActionRegistry, layers: &mut ExtractedLayers) -> Result<()> {
    let changes = read_layer(layer_path, registry, layers)
        .with_context(|| format!("Failed to read layer: {}", layer_path.display()))?;
    changes.apply_to(layers);
    Ok(())
}

/// Builds the merged view from layer tarballs given oldest first.
pub fn merge_layers<P: AsRef<Path>>(layer_paths: &[P], registry: &ActionRegistry) -> Result<ExtractedLayers> {
    let mut layers = ExtractedLayers::new();
    for layer_path in layer_paths {
        let layer_path = layer_path.as_ref();
        if !layer_path.is_file() {
            return Err(anyhow!("Layer tarball not found: {}", layer_path.display()));
        }
        apply_layer(layer_path, registry, &mut layers)?;
    }
    Ok(layers)
}
