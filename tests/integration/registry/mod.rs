//! Registry identifier scans, driven through a fetcher that writes a fixture
//! archive instead of talking to a registry.

use crate::integration::common::{layer_tar, rpm_header, rpm_sqlite_db, ArchiveFormat, ImageArchiveBuilder, TEST_TAG};
use anyhow::Result;
use oci_inventory::config::{PASSWORD_ENV, USERNAME_ENV};
use oci_inventory::{Credentials, ImageArchive, ImageFetcher, Notifier, ScanOptions, Scanner};
use serial_test::serial;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

#[derive(Debug, Clone)]
struct FetchCall {
    image: String,
    archive_dir: Option<PathBuf>,
    credentials: Credentials,
    platform: Option<String>,
}

/// Writes `archive` (or garbage when `None`) where a real fetcher would save
/// the image, and records every call.
struct FixtureFetcher {
    archive: Option<Vec<u8>>,
    calls: Rc<RefCell<Vec<FetchCall>>>,
}

impl ImageFetcher for FixtureFetcher {
    fn fetch(
        &self,
        image: &str,
        save_dir: &Path,
        credentials: &Credentials,
        platform: Option<&str>,
    ) -> Result<ImageArchive> {
        let archive = ImageArchive::new_in(save_dir, "image.tar")?;
        let bytes = self.archive.clone().unwrap_or_else(|| b"not a tarball at all".to_vec());
        fs::write(archive.path(), bytes)?;
        self.calls.borrow_mut().push(FetchCall {
            image: image.to_string(),
            archive_dir: archive.dir().map(Path::to_path_buf),
            credentials: credentials.clone(),
            platform: platform.map(str::to_string),
        });
        Ok(archive)
    }
}

fn fixture_archive() -> Vec<u8> {
    let work = TempDir::new().unwrap();
    let path = work.path().join("fixture.tar");
    let sqlite = rpm_sqlite_db(&[rpm_header("bash", "5.1.8", "6.el9", None, 7_000_000)]);
    ImageArchiveBuilder::new(ArchiveFormat::Docker)
        .layer(layer_tar(&[("var/lib/rpm/rpmdb.sqlite", &sqlite), ("app/a.jar", b"jar")]))
        .write_to(&path);
    fs::read(path).unwrap()
}

fn scanner_with(archive: Option<Vec<u8>>) -> (Scanner<FixtureFetcher>, Rc<RefCell<Vec<FetchCall>>>) {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let fetcher = FixtureFetcher {
        archive,
        calls: Rc::clone(&calls),
    };
    (Scanner::new(fetcher, Notifier::silent()), calls)
}

fn clear_env() {
    std::env::remove_var(USERNAME_ENV);
    std::env::remove_var(PASSWORD_ENV);
}

#[test]
#[serial]
fn test_registry_scan_removes_downloaded_archive() -> Result<()> {
    clear_env();
    let save = TempDir::new()?;
    let (scanner, calls) = scanner_with(Some(fixture_archive()));

    let mut options = ScanOptions::new("gcr.io/example/repo");
    options.image_save_path = Some(save.path().to_path_buf());
    options.platform = Some("linux/amd64".to_string());
    let response = scanner.scan(&options)?;

    assert_eq!(response.target.image, "gcr.io/example/repo:latest");
    assert_eq!(response.image.names, vec![TEST_TAG.to_string()]);
    assert_eq!(response.scan_results.len(), 2);
    let oci = response.image.oci_distribution_metadata.expect("distribution metadata");
    assert_eq!(oci.registry_host, "gcr.io");
    assert_eq!(oci.manifest_digest, ImageArchiveBuilder::manifest_digest());

    let calls = calls.borrow();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].image, "gcr.io/example/repo:latest");
    assert_eq!(calls[0].platform.as_deref(), Some("linux/amd64"));
    let archive_dir = calls[0].archive_dir.clone().expect("archive directory");
    assert!(archive_dir.starts_with(save.path()));
    assert!(!archive_dir.exists());
    assert_eq!(fs::read_dir(save.path())?.count(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_unreadable_download_is_fatal_and_still_removed() {
    clear_env();
    let save = TempDir::new().unwrap();
    let (scanner, calls) = scanner_with(None);

    let mut options = ScanOptions::new("alpine:3.20");
    options.image_save_path = Some(save.path().to_path_buf());
    assert!(scanner.scan(&options).is_err());

    let calls = calls.borrow();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].image, "alpine:3.20");
    assert!(!calls[0].archive_dir.as_ref().unwrap().exists());
    assert_eq!(fs::read_dir(save.path()).unwrap().count(), 0);
}

#[test]
#[serial]
fn test_credentials_from_flags_reach_the_fetcher() -> Result<()> {
    clear_env();
    let save = TempDir::new()?;
    let (scanner, calls) = scanner_with(Some(fixture_archive()));

    let mut options = ScanOptions::new("registry.example.com:5000/team/app@sha256:".to_string() + &"a".repeat(64));
    options.image_save_path = Some(save.path().to_path_buf());
    options.username = Some("robot".to_string());
    options.password = Some("s3cret".to_string());
    scanner.scan(&options)?;

    let calls = calls.borrow();
    assert!(calls[0].image.contains("@sha256:"));
    assert!(!calls[0].image.ends_with(":latest"));
    assert_eq!(calls[0].credentials.pair(), Some(("robot", "s3cret")));
    Ok(())
}

#[test]
#[serial]
fn test_credentials_fall_back_to_environment() -> Result<()> {
    clear_env();
    std::env::set_var(USERNAME_ENV, "env-user");
    std::env::set_var(PASSWORD_ENV, "env-pass");
    let save = TempDir::new()?;
    let (scanner, calls) = scanner_with(Some(fixture_archive()));

    let mut options = ScanOptions::new("repo:test");
    options.image_save_path = Some(save.path().to_path_buf());
    let result = scanner.scan(&options);
    clear_env();
    result?;

    let calls = calls.borrow();
    assert_eq!(calls[0].credentials.pair(), Some(("env-user", "env-pass")));
    Ok(())
}
