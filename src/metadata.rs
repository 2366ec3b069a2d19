use oci_spec::image::ImageConfiguration;
use serde::{Deserialize, Serialize};

/// Image facts gathered from the archive manifest and image config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(default, rename = "RepoTags")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Architecture")]
    pub architecture: String,
    #[serde(rename = "Os")]
    pub os: String,
    /// Digest of the image manifest, when the archive carries an `index.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_digest: Option<String>,
    /// Digest of the image index the manifest was picked from, for
    /// multi-platform archives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_digest: Option<String>,
}

impl ImageMetadata {
    /// `os/architecture`, or `None` when the config leaves either out.
    pub fn platform(&self) -> Option<String> {
        if self.os.is_empty() || self.architecture.is_empty() {
            None
        } else {
            Some(format!("{}/{}", self.os, self.architecture))
        }
    }
}

// Conversion function from oci-spec types to our internal types
pub fn from_oci_config(config: &ImageConfiguration) -> ImageMetadata {
    ImageMetadata {
        id: String::new(),    // Filled in from the archive layout
        repo_tags: vec![],    // This usually comes from the manifest, not the config
        architecture: config.architecture().to_string(),
        os: config.os().to_string(),
        manifest_digest: None,
        index_digest: None,
    }
}
