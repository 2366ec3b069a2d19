//! `fs:` scans over a directory tree standing in for a root filesystem.

use crate::integration::common::{rpm_header, rpm_sqlite_db, sha1_hex};
use anyhow::Result;
use oci_inventory::facts::Fact;
use oci_inventory::{Notifier, ScanOptions, Scanner};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write(root: &Path, path: &str, content: &[u8]) {
    let full = root.join(path);
    fs::create_dir_all(full.parent().unwrap()).unwrap();
    fs::write(full, content).unwrap();
}

#[test]
fn test_filesystem_scan_finds_rpm_and_jars() -> Result<()> {
    let root = TempDir::new()?;
    let sqlite = rpm_sqlite_db(&[
        rpm_header("bash", "5.1.8", "6.el9", None, 7_000_000),
        rpm_header("curl", "7.76.1", "26.el9", None, 1_000),
    ]);
    write(root.path(), "var/lib/rpm/rpmdb.sqlite", &sqlite);
    write(root.path(), "opt/app/lib/service.jar", b"service");
    write(root.path(), "opt/app/lib/client.war", b"client");

    let mut options = ScanOptions::new(format!("fs:{}", root.path().display()));
    options.image_name_and_tag = Some("host-root".to_string());
    let response = Scanner::with_docker(Notifier::silent()).scan(&options)?;

    assert_eq!(response.target.image, "host-root");
    assert!(response.image.layers.is_empty());
    assert!(response.image.platform.is_none());
    assert!(response.image.oci_distribution_metadata.is_none());
    assert_eq!(response.scan_results.len(), 2);

    let rpm = &response.scan_results[0];
    assert_eq!(rpm.identity.kind, "rpm");
    assert_eq!(rpm.identity.target_file.as_deref(), Some("/var/lib/rpm/rpmdb.sqlite"));
    match &rpm.facts[..] {
        [Fact::RpmSqlitePackages(packages)] => assert_eq!(packages.len(), 2),
        other => panic!("unexpected rpm facts: {:?}", other),
    }

    let jars = &response.scan_results[1];
    assert_eq!(jars.identity.target_file.as_deref(), Some("/opt/app/lib"));
    match &jars.facts[..] {
        [Fact::JarFingerprints(fact)] => {
            assert_eq!(fact.origin, "host-root");
            let mut digests: Vec<(&str, &str)> = fact
                .fingerprints
                .iter()
                .map(|f| (f.location.as_str(), f.digest.as_str()))
                .collect();
            digests.sort();
            assert_eq!(
                digests,
                vec![
                    ("/opt/app/lib/client.war", sha1_hex(b"client").as_str()),
                    ("/opt/app/lib/service.jar", sha1_hex(b"service").as_str()),
                ]
            );
        }
        other => panic!("unexpected jar facts: {:?}", other),
    }
    Ok(())
}

#[test]
fn test_filesystem_scan_honours_exclude_and_include_globs() -> Result<()> {
    let root = TempDir::new()?;
    write(root.path(), "opt/app/a.jar", b"a");
    write(root.path(), "opt/vendor/b.jar", b"b");
    write(root.path(), "srv/app/requirements.txt", b"flask==3.0\n");

    let mut options = ScanOptions::new(format!("fs:{}", root.path().display()));
    options.exclude_globs = vec!["/opt/vendor/*".to_string()];
    options.include_globs = vec!["/srv/app/*.txt".to_string()];
    let response = Scanner::with_docker(Notifier::silent()).scan(&options)?;

    assert_eq!(response.target.image, root.path().display().to_string());
    let targets: Vec<_> = response
        .scan_results
        .iter()
        .filter_map(|r| r.identity.target_file.as_deref())
        .collect();
    assert_eq!(targets, vec!["/opt/app"]);

    assert_eq!(response.image.manifest_files.len(), 1);
    assert_eq!(response.image.manifest_files[0].name, "requirements.txt");
    assert_eq!(response.image.manifest_files[0].path, "/srv/app");
    Ok(())
}

#[test]
fn test_missing_filesystem_root_is_an_error() {
    let root = TempDir::new().unwrap();
    let options = ScanOptions::new(format!("fs:{}", root.path().join("nope").display()));
    assert!(Scanner::with_docker(Notifier::silent()).scan(&options).is_err());
}
