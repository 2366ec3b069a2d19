//! Serializable scan output.
//!
//! Each extractor wraps its findings in a [`ScanResult`]: a list of [`Fact`]s
//! plus the [`Identity`] of the ecosystem unit they came from. Results from
//! different ecosystems are never merged; the scanner collects them into a
//! [`PluginResponse`] together with the image summary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::dockerfile::DockerFileAnalysis;
use crate::oci_distribution::OciDistributionMetadata;
use crate::os_release::TargetOs;
use crate::rpm::PackageInfo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Fact {
    /// Package listing decoded from a Berkeley DB `Packages` file.
    RpmDbContent(String),
    RpmSqlitePackages(Vec<PackageInfo>),
    JarFingerprints(JarFingerprintsFact),
    /// Package name to the Dockerfile instruction that installed it.
    DockerfilePackageAttribution(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JarFingerprint {
    pub location: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JarFingerprintsFact {
    pub fingerprints: Vec<JarFingerprint>,
    pub origin: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_file: Option<String>,
}

impl Identity {
    pub fn new(kind: impl Into<String>, target_file: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            target_file: Some(target_file.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub facts: Vec<Fact>,
    pub identity: Identity,
}

impl ScanResult {
    pub fn new(facts: Vec<Fact>, identity: Identity) -> Self {
        Self { facts, identity }
    }
}

/// A file captured by an include glob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub contents: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSummary {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, rename = "targetOS", skip_serializing_if = "Option::is_none")]
    pub target_os: Option<TargetOs>,
    /// `rpm` when an rpm database produced packages, `linux` otherwise.
    #[serde(default)]
    pub package_format: String,
    #[serde(default)]
    pub layers: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci_distribution_metadata: Option<OciDistributionMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile_analysis: Option<DockerFileAnalysis>,
    #[serde(default)]
    pub manifest_files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageTarget {
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginResponse {
    pub target: ImageTarget,
    pub scan_results: Vec<ScanResult>,
    pub image: ImageSummary,
}
