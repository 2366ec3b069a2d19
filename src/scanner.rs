//! Scan orchestration.
//!
//! [`Scanner::scan`] classifies the target, builds the merged layer view for
//! it and runs every extractor over that view:
//!
//! - local archives (`docker-archive:`/`oci-archive:`) are checked with a
//!   single stat before anything is read;
//! - registry identifiers are fetched through the [`ImageFetcher`], and the
//!   downloaded archive is removed whether or not extraction succeeds;
//! - `fs:` roots are walked in place.
//!
//! Extractor failures never abort the scan. Only bad options, an unknown
//! image type, a bad archive path or an unreadable archive do.

use anyhow::Result;
use std::path::Path;

use crate::config::ScanOptions;
use crate::extracted_image::ExtractedImage;
use crate::extractor::{ActionRegistry, ExtractAction, ExtractedLayers, MANIFEST_FILES_ACTION};
use crate::facts::{ImageSummary, ImageTarget, ManifestFile, PluginResponse, ScanResult};
use crate::java;
use crate::metadata::ImageMetadata;
use crate::notifier::Notifier;
use crate::oci_distribution::{construct_oci_distribution_metadata, OciDistributionMetadata};
use crate::os_release;
use crate::rpm::{self, NativeRpmCodec, RpmDatabaseCodec};
use crate::sources::{
    append_latest_tag_if_missing, archive_identifier, validate_archive_path, DockerSaveFetcher,
    ImageFetcher, ImageType,
};

const PACKAGE_FORMAT_RPM: &str = "rpm";
const PACKAGE_FORMAT_LINUX: &str = "linux";

/// What the layer view was built from.
struct ScannedImage {
    identifier: String,
    layers: ExtractedLayers,
    metadata: Option<ImageMetadata>,
    layer_ids: Vec<String>,
}

impl ScannedImage {
    fn from_extracted(identifier: String, image: ExtractedImage) -> Self {
        let metadata = image.metadata().clone();
        let layer_ids = image.layer_ids().to_vec();
        Self {
            identifier,
            layers: image.into_layers(),
            metadata: Some(metadata),
            layer_ids,
        }
    }
}

pub struct Scanner<F: ImageFetcher = DockerSaveFetcher> {
    fetcher: F,
    codec: Box<dyn RpmDatabaseCodec>,
    notifier: Notifier,
}

impl Scanner<DockerSaveFetcher> {
    pub fn with_docker(notifier: Notifier) -> Self {
        Self::new(DockerSaveFetcher::new(), notifier)
    }
}

impl<F: ImageFetcher> Scanner<F> {
    pub fn new(fetcher: F, notifier: Notifier) -> Self {
        Self {
            fetcher,
            codec: Box::new(NativeRpmCodec),
            notifier,
        }
    }

    pub fn with_codec(mut self, codec: impl RpmDatabaseCodec + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    pub fn scan(&self, options: &ScanOptions) -> Result<PluginResponse> {
        options.validate()?;
        let image_type = ImageType::classify(&options.path)?;
        let registry = ActionRegistry::with_filters(&options.glob_filters()?);

        let scanned = match image_type {
            ImageType::DockerArchive(path) | ImageType::OciArchive(path) => {
                self.scan_local_archive(&path, &registry, options)?
            }
            ImageType::Identifier(identifier) => self.scan_identifier(&identifier, &registry, options)?,
            ImageType::Filesystem(root) => {
                self.notifier.info(&format!("Walking filesystem at {}", root.display()));
                let layers = ExtractedLayers::from_filesystem(&root, &registry)?;
                ScannedImage {
                    identifier: options
                        .image_name_and_tag
                        .clone()
                        .unwrap_or_else(|| root.display().to_string()),
                    layers,
                    metadata: None,
                    layer_ids: Vec::new(),
                }
            }
        };

        let response = self.analyze(scanned, &registry, options);
        self.notifier.finish();
        Ok(response)
    }

    fn scan_local_archive(
        &self,
        path: &Path,
        registry: &ActionRegistry,
        options: &ScanOptions,
    ) -> Result<ScannedImage> {
        validate_archive_path(path)?;
        let identifier = archive_identifier(path, options.image_name_and_tag.as_deref());
        self.notifier.info(&format!("Scanning archive {}", path.display()));

        let image = ExtractedImage::from_archive(path, registry, options.platform.as_deref(), &self.notifier)?;
        Ok(ScannedImage::from_extracted(identifier, image))
    }

    fn scan_identifier(
        &self,
        identifier: &str,
        registry: &ActionRegistry,
        options: &ScanOptions,
    ) -> Result<ScannedImage> {
        let identifier = append_latest_tag_if_missing(identifier);
        let credentials = options.credentials();
        let save_dir = options
            .image_save_path
            .clone()
            .unwrap_or_else(std::env::temp_dir);

        self.notifier.info(&format!("Fetching {}", identifier));
        let archive = self
            .fetcher
            .fetch(&identifier, &save_dir, &credentials, options.platform.as_deref())?;

        let extracted = ExtractedImage::from_archive(
            archive.path(),
            registry,
            options.platform.as_deref(),
            &self.notifier,
        );
        drop(archive);

        Ok(ScannedImage::from_extracted(identifier, extracted?))
    }

    fn analyze(&self, scanned: ScannedImage, registry: &ActionRegistry, options: &ScanOptions) -> PluginResponse {
        let layers = &scanned.layers;
        let mut scan_results: Vec<ScanResult> =
            rpm::extract_rpm_scan_results(layers, self.codec.as_ref(), options.dockerfile_analysis.as_ref());

        if options.app_vulns {
            let jars = layers.resolve_all(&ExtractAction::jar());
            self.notifier.debug(&format!("Fingerprinting {} jars", jars.len()));
            scan_results.extend(java::jar_files_to_scan_results(
                jars,
                &scanned.identifier,
                options.shaded_jars,
            ));
        }

        let manifest_files = registry
            .get(MANIFEST_FILES_ACTION)
            .map(|action| manifest_files(layers, action))
            .unwrap_or_default();

        let package_format = if scan_results.iter().any(|r| r.identity.kind == rpm::RPM_IDENTITY_TYPE) {
            PACKAGE_FORMAT_RPM
        } else {
            PACKAGE_FORMAT_LINUX
        };
        let target_os = os_release::detect_target_os(layers);

        let metadata = scanned.metadata.as_ref();
        let oci_distribution_metadata = metadata.and_then(|m| distribution_metadata(m, &scanned.identifier));

        PluginResponse {
            target: ImageTarget {
                image: scanned.identifier.clone(),
            },
            scan_results,
            image: ImageSummary {
                identifier: scanned.identifier.clone(),
                image_id: metadata.map(|m| m.id.clone()).filter(|id| !id.is_empty()),
                platform: metadata.and_then(ImageMetadata::platform),
                target_os,
                package_format: package_format.to_string(),
                layers: scanned.layer_ids.clone(),
                names: metadata.map(|m| m.repo_tags.clone()).unwrap_or_default(),
                oci_distribution_metadata,
                dockerfile_analysis: options.dockerfile_analysis.clone(),
                manifest_files,
            },
        }
    }
}

/// Canonical identity for the image, named by its first repo tag when the
/// archive records one.
fn distribution_metadata(metadata: &ImageMetadata, identifier: &str) -> Option<OciDistributionMetadata> {
    let manifest_digest = metadata.manifest_digest.as_deref()?;
    let platform = metadata.platform()?;
    let image_name = metadata
        .repo_tags
        .first()
        .map(String::as_str)
        .unwrap_or(identifier);
    construct_oci_distribution_metadata(
        image_name,
        manifest_digest,
        metadata.index_digest.as_deref(),
        &platform,
    )
}

fn manifest_files(layers: &ExtractedLayers, action: &ExtractAction) -> Vec<ManifestFile> {
    layers
        .resolve_all(action)
        .into_iter()
        .map(|(path, content)| {
            let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
            ManifestFile {
                name: name.to_string(),
                path: if dir.is_empty() { "/".to_string() } else { dir.to_string() },
                contents: String::from_utf8_lossy(content).into_owned(),
            }
        })
        .collect()
}
