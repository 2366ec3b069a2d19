//! Reader for the sqlite rpm database (`rpmdb.sqlite`, `Packages.db`).

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

use super::header::{parse_header_blob, PackageInfo};

/// Decodes every header blob in the `Packages` table.
///
/// Headers that fail to decode are skipped; a missing table or an unreadable
/// file is an error.
pub fn read_packages(db_path: &Path) -> Result<Vec<PackageInfo>> {
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("Failed to open rpm sqlite database: {}", db_path.display()))?;

    let mut stmt = conn
        .prepare("SELECT blob FROM Packages")
        .context("Failed to query the Packages table")?;
    let blobs = stmt
        .query_map([], |row| row.get::<_, Vec<u8>>(0))
        .context("Failed to read package blobs")?;

    let mut packages = Vec::new();
    for blob in blobs {
        let blob = blob.context("Failed to read package blob")?;
        match parse_header_blob(&blob) {
            Ok(package) => packages.push(package),
            Err(e) => log::debug!("Skipping undecodable rpm header: {:#}", e),
        }
    }
    Ok(packages)
}
