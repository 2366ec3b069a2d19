//! Load an image archive into the merged layer view.
//!
//! [`ExtractedImage::from_archive`] unpacks a `docker save` or OCI image-layout
//! tarball into a scoped temporary directory and reads:
//! - `manifest.json` (docker layout): config path, repo tags, layer paths;
//! - `index.json` (OCI layout, also written by recent docker versions): the
//!   manifest digest and, without `manifest.json`, the manifest blob itself.
//!   Multi-platform layouts point at a nested image index first; the entry
//!   for the requested platform is picked from it;
//! - the image config, through `oci_spec`, for os and architecture.
//!
//! Layers are then replayed oldest first through [`crate::tar_extractor`]
//! into an [`ExtractedLayers`] restricted to the registered actions. The
//! temporary directory is gone by the time this returns; only the captured
//! content stays in memory.

use crate::extractor::{ActionRegistry, ExtractedLayers};
use crate::metadata::{self, ImageMetadata};
use crate::notifier::Notifier;
use crate::tar_extractor;
use anyhow::{anyhow, bail, Context, Result};
use oci_spec::image::{Descriptor, ImageConfiguration, ImageIndex, ImageManifest, MediaType};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";
const CONTAINERD_NAME_ANNOTATION: &str = "io.containerd.image.name";
const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
const MAX_INDEX_DEPTH: usize = 4;

#[derive(Debug, Deserialize)]
struct DockerManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(default, rename = "RepoTags")]
    repo_tags: Option<Vec<String>>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Archive layout as discovered on disk, before any layer is read.
#[derive(Debug)]
struct ImageLayout {
    metadata: ImageMetadata,
    layer_ids: Vec<String>,
    layer_paths: Vec<PathBuf>,
}

pub struct ExtractedImage {
    metadata: ImageMetadata,
    layer_ids: Vec<String>,
    layers: ExtractedLayers,
}

impl ExtractedImage {
    /// `platform` (`os/arch[/variant]`) selects the image from a
    /// multi-platform archive; the first runnable image is used otherwise.
    pub fn from_archive<P: AsRef<Path>>(
        archive_path: P,
        registry: &ActionRegistry,
        platform: Option<&str>,
        notifier: &Notifier,
    ) -> Result<Self> {
        let archive_path = archive_path.as_ref();
        notifier.debug(&format!("Extracting image archive: {}", archive_path.display()));

        let temp_dir = tempfile::Builder::new()
            .prefix("oci-inventory-")
            .tempdir()
            .context("Failed to create temporary directory")?;
        let extract_dir = temp_dir.path();

        tar_extractor::unpack_archive(archive_path, extract_dir)
            .with_context(|| format!("Failed to extract image archive: {}", archive_path.display()))?;

        notifier.debug("Loading image layout...");
        let layout = load_layout(extract_dir, platform)?;

        notifier.info(&format!("Reading {} layers", layout.layer_paths.len()));
        let progress = notifier.create_progress_bar(layout.layer_paths.len() as u64, "Reading layers");
        let total = layout.layer_paths.len() as u64;
        let mut layers = ExtractedLayers::new();
        for (index, layer_path) in layout.layer_paths.iter().enumerate() {
            if !layer_path.is_file() {
                bail!("Layer tarball not found in archive: {}", layer_path.display());
            }
            tar_extractor::apply_layer(layer_path, registry, &mut layers)?;
            match &progress {
                Some(bar) => bar.inc(1),
                None => notifier.progress(index as u64 + 1, total, "Layers read"),
            }
        }
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }

        if let Err(e) = temp_dir.close() {
            notifier.warn(&format!("Failed to remove temporary extraction directory: {}", e));
        }

        Ok(Self {
            metadata: layout.metadata,
            layer_ids: layout.layer_ids,
            layers,
        })
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    /// Layer identifiers, oldest first.
    pub fn layer_ids(&self) -> &[String] {
        &self.layer_ids
    }

    pub fn into_layers(self) -> ExtractedLayers {
        self.layers
    }
}

fn load_layout(extract_dir: &Path, platform: Option<&str>) -> Result<ImageLayout> {
    let manifest_path = extract_dir.join("manifest.json");
    let index_path = extract_dir.join("index.json");

    let index = if index_path.is_file() {
        Some(read_json::<ImageIndex>(&index_path, "index.json")?)
    } else {
        None
    };

    if manifest_path.is_file() {
        load_docker_layout(extract_dir, &manifest_path, index.as_ref(), platform)
    } else if let Some(index) = index {
        load_oci_layout(extract_dir, &index, platform)
    } else {
        Err(anyhow!(
            "Invalid image archive: neither manifest.json nor index.json found. This does not appear to be a docker or OCI image archive."
        ))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", what))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", what))
}

fn read_config(extract_dir: &Path, config_path: &str) -> Result<ImageMetadata> {
    let config: ImageConfiguration = read_json(
        &safe_join(extract_dir, config_path),
        &format!("image configuration {}", config_path),
    )?;
    Ok(metadata::from_oci_config(&config))
}

/// Joins an archive-relative path below `root` without leaving it.
fn safe_join(root: &Path, relative: &str) -> PathBuf {
    let normalized = crate::extractor::normalize_image_path(Path::new(relative));
    root.join(normalized.trim_start_matches('/'))
}

/// `blobs/<algorithm>/<hex>` for a `<algorithm>:<hex>` digest.
fn blob_path(digest: &str) -> Result<String> {
    let (algorithm, hex) = digest
        .split_once(':')
        .ok_or_else(|| anyhow!("Malformed digest: {}", digest))?;
    Ok(format!("blobs/{}/{}", algorithm, hex))
}

/// `sha256:<hex>` for blob-style paths, the path itself otherwise.
fn digest_from_blob_path(path: &str) -> String {
    let trimmed = path.trim_start_matches("./");
    if let Some(rest) = trimmed.strip_prefix("blobs/") {
        if let Some((algorithm, hex)) = rest.split_once('/') {
            return format!("{}:{}", algorithm, hex);
        }
    }
    if let Some(hex) = trimmed.strip_suffix(".json") {
        return format!("sha256:{}", hex);
    }
    trimmed.to_string()
}

/// The image manifest an index resolves to.
#[derive(Debug)]
struct ManifestChoice {
    manifest: Descriptor,
    /// Digest of the nested image index the manifest was picked from.
    index_digest: Option<String>,
    /// Names recorded on the top-level `index.json` entry.
    ref_names: Vec<String>,
}

fn is_image_index(descriptor: &Descriptor) -> bool {
    let media_type = descriptor.media_type();
    matches!(media_type, MediaType::ImageIndex) || media_type.to_string() == DOCKER_MANIFEST_LIST
}

fn platform_matches(descriptor: &Descriptor, wanted: &str) -> bool {
    let Some(platform) = descriptor.platform() else {
        return false;
    };
    let base = format!("{}/{}", platform.os(), platform.architecture());
    match platform.variant() {
        Some(variant) => wanted == base || wanted == format!("{}/{}", base, variant),
        None => wanted == base,
    }
}

/// Attestation manifests carry an `unknown/unknown` platform.
fn is_runnable(descriptor: &Descriptor) -> bool {
    descriptor
        .platform()
        .as_ref()
        .map_or(true, |platform| platform.os().to_string() != "unknown")
}

/// The entry for `platform` when listed, else the first runnable entry, else
/// the first entry.
fn pick_descriptor<'a>(manifests: &'a [Descriptor], platform: Option<&str>) -> Option<&'a Descriptor> {
    platform
        .and_then(|wanted| manifests.iter().find(|d| platform_matches(d, wanted)))
        .or_else(|| manifests.iter().find(|d| is_runnable(d)))
        .or_else(|| manifests.first())
}

fn select_manifest(extract_dir: &Path, index: &ImageIndex, platform: Option<&str>) -> Result<ManifestChoice> {
    let top = pick_descriptor(index.manifests(), platform)
        .ok_or_else(|| anyhow!("index.json lists no manifests"))?;
    let ref_names = ref_names(top);
    let mut descriptor = top.clone();
    let mut index_digest = None;

    for _ in 0..MAX_INDEX_DEPTH {
        if !is_image_index(&descriptor) {
            return Ok(ManifestChoice {
                manifest: descriptor,
                index_digest,
                ref_names,
            });
        }
        let digest = descriptor.digest().to_string();
        let nested: ImageIndex = read_json(
            &safe_join(extract_dir, &blob_path(&digest)?),
            &format!("image index {}", digest),
        )?;
        descriptor = pick_descriptor(nested.manifests(), platform)
            .ok_or_else(|| anyhow!("image index {} lists no manifests", digest))?
            .clone();
        log::debug!("Descending into image index {}, picked {}", digest, descriptor.digest());
        index_digest = Some(digest);
    }
    bail!("image indexes are nested more than {} levels deep", MAX_INDEX_DEPTH)
}

fn ref_names(descriptor: &Descriptor) -> Vec<String> {
    let Some(annotations) = descriptor.annotations() else {
        return Vec::new();
    };
    annotations
        .get(CONTAINERD_NAME_ANNOTATION)
        .or_else(|| annotations.get(REF_NAME_ANNOTATION))
        .map(|name| vec![name.clone()])
        .unwrap_or_default()
}

fn load_docker_layout(
    extract_dir: &Path,
    manifest_path: &Path,
    index: Option<&ImageIndex>,
    platform: Option<&str>,
) -> Result<ImageLayout> {
    let manifest: Vec<DockerManifestEntry> = read_json(manifest_path, "manifest.json")?;
    let entry = manifest
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Empty manifest.json"))?;

    let mut metadata = read_config(extract_dir, &entry.config)?;
    metadata.id = digest_from_blob_path(&entry.config);
    metadata.repo_tags = entry.repo_tags.unwrap_or_default();

    // manifest.json already names the layers; index.json only adds digests.
    if let Some(index) = index {
        let wanted = platform.map(str::to_string).or_else(|| metadata.platform());
        match select_manifest(extract_dir, index, wanted.as_deref()) {
            Ok(choice) => {
                metadata.manifest_digest = Some(choice.manifest.digest().to_string());
                metadata.index_digest = choice.index_digest;
            }
            Err(e) => log::debug!("No manifest digest available from index.json: {:#}", e),
        }
    }

    Ok(ImageLayout {
        metadata,
        layer_ids: entry.layers.iter().map(|l| digest_from_blob_path(l)).collect(),
        layer_paths: entry.layers.iter().map(|l| safe_join(extract_dir, l)).collect(),
    })
}

fn load_oci_layout(extract_dir: &Path, index: &ImageIndex, platform: Option<&str>) -> Result<ImageLayout> {
    let choice = select_manifest(extract_dir, index, platform)?;
    let manifest_digest = choice.manifest.digest().to_string();
    let manifest: ImageManifest = read_json(
        &safe_join(extract_dir, &blob_path(&manifest_digest)?),
        &format!("image manifest {}", manifest_digest),
    )?;

    let config_digest = manifest.config().digest().to_string();
    let mut metadata = read_config(extract_dir, &blob_path(&config_digest)?)?;
    metadata.id = config_digest;
    metadata.repo_tags = choice.ref_names;
    metadata.manifest_digest = Some(manifest_digest);
    metadata.index_digest = choice.index_digest;

    let mut layer_ids = Vec::new();
    let mut layer_paths = Vec::new();
    for layer in manifest.layers() {
        let digest = layer.digest().to_string();
        layer_paths.push(safe_join(extract_dir, &blob_path(&digest)?));
        layer_ids.push(digest);
    }

    Ok(ImageLayout {
        metadata,
        layer_ids,
        layer_paths,
    })
}
