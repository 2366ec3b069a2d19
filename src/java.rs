//! Jar fingerprinting.
//!
//! Jars are grouped by the directory they live in and every group becomes one
//! `maven` [`ScanResult`] carrying a single [`Fact::JarFingerprints`]. A
//! fingerprint is the hex SHA-1 of the jar content.
//!
//! In shaded mode each jar is opened as a zip archive first: when it bundles
//! other jars (entries ending in `.jar`), those entries are fingerprinted
//! instead of the outer jar. Only one level is unpacked.

use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::io::{self, Cursor, Read};
use std::path::Path;
use zip::ZipArchive;

use crate::facts::{Fact, Identity, JarFingerprint, JarFingerprintsFact, ScanResult};

pub const MAVEN_IDENTITY_TYPE: &str = "maven";

/// Largest nested entry that will be read into memory.
const MAX_NESTED_JAR_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// A jar found in the image, borrowed from the layer view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JarBuffer<'a> {
    pub location: &'a str,
    pub content: &'a [u8],
}

pub fn sha1_hex(content: &[u8]) -> String {
    hex::encode(Sha1::digest(content))
}

/// Directory of `location` as reported in results. A bare file name lives in
/// `.`.
fn dirname(location: &str) -> String {
    match Path::new(location).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().into_owned(),
        _ => ".".to_string(),
    }
}

/// Groups jars by directory. Neither key order nor order inside a group
/// affects the fingerprints a group produces beyond their listing order.
fn group_by_directory<'a, I>(jars: I) -> BTreeMap<String, Vec<JarBuffer<'a>>>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut groups: BTreeMap<String, Vec<JarBuffer<'a>>> = BTreeMap::new();
    for (location, content) in jars {
        groups
            .entry(dirname(location))
            .or_default()
            .push(JarBuffer { location, content });
    }
    groups
}

fn plain_fingerprints(jars: &[JarBuffer<'_>]) -> Vec<JarFingerprint> {
    jars.iter()
        .map(|jar| JarFingerprint {
            location: jar.location.to_string(),
            digest: sha1_hex(jar.content),
        })
        .collect()
}

/// Fingerprints of the jars bundled directly inside `jar`, skipping entries
/// that inflate past `limit` bytes. `None` when the jar is not a readable zip
/// archive.
fn nested_fingerprints(jar: &JarBuffer<'_>, limit: u64) -> Option<Vec<JarFingerprint>> {
    let mut archive = match ZipArchive::new(Cursor::new(jar.content)) {
        Ok(archive) => archive,
        Err(e) => {
            log::debug!("{} is not a readable zip archive: {}", jar.location, e);
            return None;
        }
    };

    let mut fingerprints = Vec::new();
    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable entry {} in {}: {}", index, jar.location, e);
                continue;
            }
        };
        if entry.is_dir() || !entry.name().ends_with(".jar") {
            continue;
        }

        let name = entry.name().to_string();
        if entry.size() > limit {
            log::warn!("Skipping oversized nested jar {} in {}", name, jar.location);
            continue;
        }

        // Hash while decompressing; the declared size can lie.
        let mut hasher = Sha1::new();
        match io::copy(&mut (&mut entry).take(limit + 1), &mut hasher) {
            Ok(read) if read > limit => {
                log::warn!("Skipping oversized nested jar {} in {}", name, jar.location);
            }
            Ok(_) => fingerprints.push(JarFingerprint {
                location: name,
                digest: hex::encode(hasher.finalize()),
            }),
            Err(e) => log::warn!("Skipping unreadable nested jar {} in {}: {}", name, jar.location, e),
        }
    }
    Some(fingerprints)
}

/// Shaded-mode fingerprints: nested jars when a jar bundles any, the jar
/// itself otherwise. Fingerprints of every jar in the group are concatenated.
fn unpacked_fingerprints(jars: &[JarBuffer<'_>]) -> Vec<JarFingerprint> {
    let mut fingerprints = Vec::new();
    for jar in jars {
        match nested_fingerprints(jar, MAX_NESTED_JAR_SIZE) {
            Some(nested) if !nested.is_empty() => fingerprints.extend(nested),
            _ => fingerprints.push(JarFingerprint {
                location: jar.location.to_string(),
                digest: sha1_hex(jar.content),
            }),
        }
    }
    fingerprints
}

/// One `maven` scan result per directory holding jars.
pub fn jar_files_to_scan_results<'a, I>(jars: I, target_image: &str, shaded: bool) -> Vec<ScanResult>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    group_by_directory(jars)
        .into_iter()
        .map(|(path, group)| {
            let fingerprints = if shaded {
                unpacked_fingerprints(&group)
            } else {
                plain_fingerprints(&group)
            };
            let fact = Fact::JarFingerprints(JarFingerprintsFact {
                fingerprints,
                origin: target_image.to_string(),
                path: path.clone(),
            });
            ScanResult::new(vec![fact], Identity::new(MAVEN_IDENTITY_TYPE, path))
        })
        .collect()
}
