//! RPM package database extraction.
//!
//! Two database formats can appear in an image, each at a couple of canonical
//! locations (see [`crate::extractor::RPM_DB_PATHS`] and
//! [`crate::extractor::RPM_SQLITE_DB_PATHS`]):
//!
//! - the legacy Berkeley DB `Packages` file, decoded to a tab-separated
//!   package listing;
//! - the sqlite database, decoded to [`PackageInfo`] records. The sqlite
//!   library needs a real file, so the resolved bytes are written to a scoped
//!   temporary directory that is removed when the decode returns.
//!
//! The two formats are extracted independently. A decode failure in one is
//! logged and reported as "nothing found" without affecting the other.

pub mod berkeley;
pub mod header;
pub mod sqlite;

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::dockerfile::DockerFileAnalysis;
use crate::extractor::{ExtractAction, ExtractedLayers};
use crate::facts::{Fact, Identity, ScanResult};

pub use header::PackageInfo;

pub const RPM_IDENTITY_TYPE: &str = "rpm";

/// File name of the materialized sqlite database inside its temp directory.
const SQLITE_TEMP_NAME: &str = "rpmdb.sqlite";

/// Decoder for the two rpm database formats.
pub trait RpmDatabaseCodec {
    /// Decodes a Berkeley DB `Packages` file into its textual package listing.
    fn decode_berkeley(&self, db: &[u8]) -> Result<String>;

    /// Decodes the sqlite database at `db_path`.
    fn decode_sqlite(&self, db_path: &Path) -> Result<Vec<PackageInfo>>;
}

/// Built-in codec.
///
/// The Berkeley listing has one line per package:
/// `name\t[epoch:]version-release\tsize`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeRpmCodec;

impl RpmDatabaseCodec for NativeRpmCodec {
    fn decode_berkeley(&self, db: &[u8]) -> Result<String> {
        let blobs = berkeley::read_values(db)?;
        let mut lines = Vec::with_capacity(blobs.len());
        for blob in blobs {
            match header::parse_header_blob(&blob) {
                Ok(package) => lines.push(format!(
                    "{}\t{}\t{}",
                    package.name,
                    package.full_version(),
                    package.size.unwrap_or(0)
                )),
                Err(e) => log::debug!("Skipping undecodable rpm header: {:#}", e),
            }
        }
        Ok(lines.join("\n"))
    }

    fn decode_sqlite(&self, db_path: &Path) -> Result<Vec<PackageInfo>> {
        sqlite::read_packages(db_path)
    }
}

/// Outcome of reading one database format.
#[derive(Debug)]
pub enum DbRead<T> {
    Found { path: String, value: T },
    NotFound,
    DecodeFailed { path: String, cause: anyhow::Error },
}

impl<T: Default> DbRead<T> {
    /// Collapses "not found" and "decode failed" into the empty value.
    pub fn into_value(self) -> T {
        match self {
            DbRead::Found { value, .. } => value,
            DbRead::NotFound => T::default(),
            DbRead::DecodeFailed { path, cause } => {
                log_decode_failure(&path, &cause);
                T::default()
            }
        }
    }
}

fn log_decode_failure(path: &str, cause: &anyhow::Error) {
    log::debug!("An error occurred while analysing RPM packages at {}: {:#}", path, cause);
}

pub fn read_rpm_db(layers: &ExtractedLayers, codec: &dyn RpmDatabaseCodec) -> DbRead<String> {
    let Some(resolved) = layers.resolve(&ExtractAction::rpm_db()) else {
        return DbRead::NotFound;
    };
    let path = resolved.path.to_string();
    match codec.decode_berkeley(resolved.content) {
        Ok(value) => DbRead::Found { path, value },
        Err(cause) => DbRead::DecodeFailed { path, cause },
    }
}

pub fn read_rpm_sqlite_db(
    layers: &ExtractedLayers,
    codec: &dyn RpmDatabaseCodec,
) -> DbRead<Vec<PackageInfo>> {
    let Some(resolved) = layers.resolve(&ExtractAction::rpm_sqlite_db()) else {
        return DbRead::NotFound;
    };
    let path = resolved.path.to_string();
    match decode_sqlite_bytes(resolved.content, codec) {
        Ok(value) => DbRead::Found { path, value },
        Err(cause) => DbRead::DecodeFailed { path, cause },
    }
}

/// Writes the database into a fresh temp directory and decodes it there. The
/// directory, including any journal files sqlite creates next to the
/// database, is removed when this returns.
fn decode_sqlite_bytes(content: &[u8], codec: &dyn RpmDatabaseCodec) -> Result<Vec<PackageInfo>> {
    let temp_dir = tempfile::Builder::new()
        .prefix("rpmdb-")
        .tempdir()
        .context("Failed to create temporary directory for rpm sqlite database")?;
    let db_path = temp_dir.path().join(SQLITE_TEMP_NAME);
    fs::write(&db_path, content).context("Failed to write rpm sqlite database")?;

    let result = codec.decode_sqlite(&db_path);

    if let Err(e) = temp_dir.close() {
        log::warn!("Failed to remove temporary rpm sqlite database: {}", e);
    }
    result
}

/// Legacy database listing, or an empty string when absent or undecodable.
pub fn rpm_db_file_content(layers: &ExtractedLayers, codec: &dyn RpmDatabaseCodec) -> String {
    read_rpm_db(layers, codec).into_value()
}

/// Sqlite database packages, or an empty list when absent or undecodable.
pub fn rpm_sqlite_db_file_content(
    layers: &ExtractedLayers,
    codec: &dyn RpmDatabaseCodec,
) -> Vec<PackageInfo> {
    read_rpm_sqlite_db(layers, codec).into_value()
}

/// One scan result per rpm database that decoded to something.
pub fn extract_rpm_scan_results(
    layers: &ExtractedLayers,
    codec: &dyn RpmDatabaseCodec,
    dockerfile: Option<&DockerFileAnalysis>,
) -> Vec<ScanResult> {
    let mut results = Vec::new();

    if let DbRead::Found { path, value } = collapse_failure(read_rpm_db(layers, codec)) {
        if !value.is_empty() {
            let names: Vec<&str> = value.lines().filter_map(|l| l.split('\t').next()).collect();
            let mut facts = vec![Fact::RpmDbContent(value.clone())];
            facts.extend(attribution_fact(names, dockerfile));
            results.push(ScanResult::new(facts, Identity::new(RPM_IDENTITY_TYPE, path)));
        }
    }

    if let DbRead::Found { path, value } = collapse_failure(read_rpm_sqlite_db(layers, codec)) {
        if !value.is_empty() {
            let names: Vec<&str> = value.iter().map(|p| p.name.as_str()).collect();
            let attribution = attribution_fact(names, dockerfile);
            let mut facts = vec![Fact::RpmSqlitePackages(value)];
            facts.extend(attribution);
            results.push(ScanResult::new(facts, Identity::new(RPM_IDENTITY_TYPE, path)));
        }
    }

    results
}

/// Logs a decode failure and turns it into "not found".
fn collapse_failure<T>(read: DbRead<T>) -> DbRead<T> {
    match read {
        DbRead::DecodeFailed { path, cause } => {
            log_decode_failure(&path, &cause);
            DbRead::NotFound
        }
        other => other,
    }
}

/// Dockerfile instructions that installed any of `names`.
fn attribution_fact(names: Vec<&str>, dockerfile: Option<&DockerFileAnalysis>) -> Option<Fact> {
    let dockerfile = dockerfile?;
    let attribution: BTreeMap<String, String> = names
        .into_iter()
        .filter_map(|name| {
            dockerfile
                .instruction_for(name)
                .map(|instruction| (name.to_string(), instruction.to_string()))
        })
        .collect();
    if attribution.is_empty() {
        None
    } else {
        Some(Fact::DockerfilePackageAttribution(attribution))
    }
}
