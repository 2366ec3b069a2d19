//! Canonical OCI distribution identity of a scanned image.
//!
//! [`construct_oci_distribution_metadata`] turns an image name as the user
//! typed it (`repo:tag`, `gcr.io/org/repo@sha256:...`, `localhost:5000/app`)
//! plus the digests and platform read from the image into an
//! [`OciDistributionMetadata`]. Everything is validated first; the record is
//! either fully valid or not built at all.
//!
//! Grammar follows the OCI distribution specification:
//! - host: hostname labels of alphanumerics and `-`, optional `:port`, at most 255 chars
//! - repository: `/`-separated components of lowercase alphanumerics joined by
//!   `.`, `_`, `__` or runs of `-`, at most 2048 chars
//! - tag: `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`
//! - digest: `sha256:` and 64 lowercase hex characters
//! - platform: `os/arch`, at most 64 chars

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_NAMESPACE: &str = "library";

const MAX_HOST_LENGTH: usize = 255;
const MAX_HOST_LABEL_LENGTH: usize = 63;
const MAX_REPOSITORY_LENGTH: usize = 2048;
const MAX_TAG_LENGTH: usize = 128;
const MAX_PLATFORM_LENGTH: usize = 64;
const SHA256_PREFIX: &str = "sha256:";
const SHA256_HEX_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDistributionMetadata {
    pub registry_host: String,
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
    pub manifest_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_digest: Option<String>,
    pub platform: String,
}

/// Builds the metadata, or returns `None` when any input fails validation.
///
/// A rejection is not an error for the scan: the caller simply reports the
/// image without distribution metadata.
pub fn construct_oci_distribution_metadata(
    image_name: &str,
    manifest_digest: &str,
    index_digest: Option<&str>,
    platform: &str,
) -> Option<OciDistributionMetadata> {
    match build(image_name, manifest_digest, index_digest, platform) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            log::debug!(
                "Not constructing OCI distribution metadata for '{}': {:#}",
                image_name,
                e
            );
            None
        }
    }
}

fn build(
    image_name: &str,
    manifest_digest: &str,
    index_digest: Option<&str>,
    platform: &str,
) -> Result<OciDistributionMetadata> {
    validate_digest(manifest_digest).context("invalid manifest digest")?;
    if let Some(index_digest) = index_digest {
        validate_digest(index_digest).context("invalid index digest")?;
    }
    validate_platform(platform)?;

    let (name, image_tag) = split_tag(image_name);
    let (registry_host, repository) = split_host(name);

    validate_host(registry_host).context("invalid registry host")?;
    validate_repository(&repository).context("invalid repository")?;
    if let Some(tag) = image_tag {
        validate_tag(tag).context("invalid tag")?;
    }

    Ok(OciDistributionMetadata {
        registry_host: registry_host.to_string(),
        repository,
        image_tag: image_tag.map(str::to_string),
        manifest_digest: manifest_digest.to_string(),
        index_digest: index_digest.map(str::to_string),
        platform: platform.to_string(),
    })
}

/// Registry host an image name refers to, `docker.io` when none is given.
pub fn registry_host(image_name: &str) -> &str {
    split_host(split_tag(image_name).0).0
}

/// Splits `name[:tag][@digest]` into the name and the tag. A digest suffix
/// always wins over a tag, so the tag is dropped when `@` is present.
fn split_tag(image_name: &str) -> (&str, Option<&str>) {
    let (name_and_tag, has_digest) = match image_name.find('@') {
        Some(at) => (&image_name[..at], true),
        None => (image_name, false),
    };

    // Only a colon in the last path segment separates a tag; an earlier
    // one belongs to a host:port.
    let last_segment_start = name_and_tag.rfind('/').map_or(0, |slash| slash + 1);
    let (name, tag) = match name_and_tag[last_segment_start..].rfind(':') {
        Some(colon) => {
            let colon = last_segment_start + colon;
            (&name_and_tag[..colon], Some(&name_and_tag[colon + 1..]))
        }
        None => (name_and_tag, None),
    };

    if has_digest {
        (name, None)
    } else {
        (name, tag)
    }
}

fn split_host(name: &str) -> (&str, String) {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (first, rest.to_string());
        }
        return (DEFAULT_REGISTRY, name.to_string());
    }
    (DEFAULT_REGISTRY, format!("{}/{}", DEFAULT_NAMESPACE, name))
}

fn validate_digest(digest: &str) -> Result<()> {
    let hex = digest
        .strip_prefix(SHA256_PREFIX)
        .ok_or_else(|| anyhow!("digest '{}' is not a sha256 digest", digest))?;
    if hex.len() != SHA256_HEX_LENGTH {
        bail!(
            "digest '{}' has {} hex characters, expected {}",
            digest,
            hex.len(),
            SHA256_HEX_LENGTH
        );
    }
    if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        bail!("digest '{}' is not lowercase hex", digest);
    }
    Ok(())
}

fn validate_platform(platform: &str) -> Result<()> {
    if platform.len() > MAX_PLATFORM_LENGTH {
        bail!(
            "platform is {} characters, maximum is {}",
            platform.len(),
            MAX_PLATFORM_LENGTH
        );
    }
    let segments: Vec<&str> = platform.split('/').collect();
    if segments.len() != 2 || segments.iter().any(|s| s.is_empty()) {
        bail!("platform '{}' is not of the form os/arch", platform);
    }
    Ok(())
}

fn validate_host(host: &str) -> Result<()> {
    if host.is_empty() || host.len() > MAX_HOST_LENGTH {
        bail!("host is {} characters, maximum is {}", host.len(), MAX_HOST_LENGTH);
    }

    let hostname = match host.rsplit_once(':') {
        Some((hostname, port)) => {
            if port.is_empty() || port.len() > 5 || !port.bytes().all(|b| b.is_ascii_digit()) {
                bail!("host '{}' has an invalid port", host);
            }
            hostname
        }
        None => host,
    };

    for label in hostname.split('.') {
        let valid = !label.is_empty()
            && label.len() <= MAX_HOST_LABEL_LENGTH
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !valid {
            bail!("host '{}' has an invalid label '{}'", host, label);
        }
    }
    Ok(())
}

fn validate_repository(repository: &str) -> Result<()> {
    if repository.len() > MAX_REPOSITORY_LENGTH {
        bail!(
            "repository is {} characters, maximum is {}",
            repository.len(),
            MAX_REPOSITORY_LENGTH
        );
    }
    for component in repository.split('/') {
        if !is_valid_path_component(component) {
            bail!("repository component '{}' is not valid", component);
        }
    }
    Ok(())
}

/// `[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*`
fn is_valid_path_component(component: &str) -> bool {
    let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let bytes = component.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(&first), Some(&last)) if is_alnum(first) && is_alnum(last) => {}
        _ => return false,
    }

    let mut i = 0;
    while i < bytes.len() {
        if is_alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !is_alnum(bytes[i]) {
            i += 1;
        }
        let separator = &component[start..i];
        let valid = matches!(separator, "." | "_" | "__")
            || separator.bytes().all(|b| b == b'-');
        if !valid {
            return false;
        }
    }
    true
}

fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() || tag.len() > MAX_TAG_LENGTH {
        bail!("tag is {} characters, expected 1 to {}", tag.len(), MAX_TAG_LENGTH);
    }
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let bytes = tag.as_bytes();
    if !is_word(bytes[0]) {
        bail!("tag '{}' must start with an alphanumeric or '_'", tag);
    }
    if !bytes.iter().all(|&b| is_word(b) || b == b'.' || b == b'-') {
        bail!("tag '{}' contains invalid characters", tag);
    }
    Ok(())
}
