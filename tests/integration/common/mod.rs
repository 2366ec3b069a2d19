//! Fixture builders shared by the integration tests: layer tarballs, docker
//! and OCI image archives, rpm header blobs, rpm databases and jars.

use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{params, Connection};
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use tar_rs as tar;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const TEST_TAG: &str = "gcr.io/example/repo:test";

/// Tarball with one regular file per entry. Names are written as given, so
/// whiteout markers (`dir/.wh.name`) can be expressed directly.
pub fn layer_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

/// Deterministic stand-in for a sha256 digest.
pub fn fake_digest(seed: u64) -> String {
    format!("sha256:{:064x}", seed)
}

fn hex_of(digest: &str) -> &str {
    digest.trim_start_matches("sha256:")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// `docker save`: `manifest.json` plus an `index.json`.
    Docker,
    /// Docker layout without `index.json`, as older docker versions write it.
    LegacyDocker,
    /// OCI image layout: `index.json` and manifest blob only.
    Oci,
}

pub struct ImageArchiveBuilder {
    format: ArchiveFormat,
    layers: Vec<Vec<u8>>,
    /// Manifest layer entries stored as symlinks to an earlier layer tarball.
    linked_layers: Vec<usize>,
    repo_tags: Vec<String>,
    /// `index.json` points at a nested index that also lists a linux/arm64
    /// image ahead of this one.
    multi_platform: bool,
    os: String,
    architecture: String,
}

impl ImageArchiveBuilder {
    pub fn new(format: ArchiveFormat) -> Self {
        Self {
            format,
            layers: Vec::new(),
            linked_layers: Vec::new(),
            repo_tags: vec![TEST_TAG.to_string()],
            multi_platform: false,
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
        }
    }

    pub fn layer(mut self, tarball: Vec<u8>) -> Self {
        self.layers.push(tarball);
        self
    }

    /// Repeats layer `source` on top of the stack the way older `docker save`
    /// versions do: a `<id>/layer.tar` symlink to the tarball already written.
    pub fn linked_layer(mut self, source: usize) -> Self {
        self.linked_layers.push(source);
        self
    }

    pub fn repo_tags(mut self, tags: &[&str]) -> Self {
        self.repo_tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn multi_platform(mut self) -> Self {
        self.multi_platform = true;
        self
    }

    pub fn nested_index_digest() -> String {
        fake_digest(0x1de5)
    }

    pub fn arm64_manifest_digest() -> String {
        fake_digest(0xbeee)
    }

    pub fn arm64_config_digest() -> String {
        fake_digest(0xc0fe)
    }

    pub fn manifest_digest() -> String {
        fake_digest(0xbeef)
    }

    pub fn config_digest() -> String {
        fake_digest(0xc0ff)
    }

    pub fn layer_digest(index: usize) -> String {
        fake_digest(0x1000 + index as u64)
    }

    pub fn write_to(&self, path: &Path) {
        let config_digest = Self::config_digest();
        let manifest_digest = Self::manifest_digest();
        let config = serde_json::json!({
            "created": "2024-01-15T10:30:00Z",
            "architecture": self.architecture,
            "os": self.os,
            "config": {},
            "rootfs": { "type": "layers", "diff_ids": [] }
        })
        .to_string();

        let mut files: Vec<(String, Vec<u8>)> = Vec::new();
        files.push((format!("blobs/sha256/{}", hex_of(&config_digest)), config.clone().into_bytes()));
        let mut layer_paths = Vec::new();
        let mut layer_descriptors = Vec::new();
        for (index, layer) in self.layers.iter().enumerate() {
            let digest = Self::layer_digest(index);
            let blob = format!("blobs/sha256/{}", hex_of(&digest));
            files.push((blob.clone(), layer.clone()));
            layer_paths.push(blob);
            layer_descriptors.push(serde_json::json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": digest,
                "size": layer.len()
            }));
        }
        let mut links: Vec<(String, String)> = Vec::new();
        for (n, source) in self.linked_layers.iter().enumerate() {
            let link = format!("link{}/layer.tar", n);
            links.push((link.clone(), format!("../{}", layer_paths[*source])));
            layer_paths.push(link);
            layer_descriptors.push(layer_descriptors[*source].clone());
        }

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config.len()
            },
            "layers": layer_descriptors
        })
        .to_string();

        let mut descriptor = serde_json::json!({
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": manifest_digest,
            "size": manifest.len()
        });
        if self.multi_platform {
            let arm64_config = serde_json::json!({
                "architecture": "arm64",
                "os": "linux",
                "config": {},
                "rootfs": { "type": "layers", "diff_ids": [] }
            })
            .to_string();
            let arm64_manifest = serde_json::json!({
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "config": {
                    "mediaType": "application/vnd.oci.image.config.v1+json",
                    "digest": Self::arm64_config_digest(),
                    "size": arm64_config.len()
                },
                "layers": layer_descriptors
            })
            .to_string();
            descriptor["platform"] = serde_json::json!({ "os": self.os, "architecture": self.architecture });
            let nested = serde_json::json!({
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.index.v1+json",
                "manifests": [
                    {
                        "mediaType": "application/vnd.oci.image.manifest.v1+json",
                        "digest": Self::arm64_manifest_digest(),
                        "size": arm64_manifest.len(),
                        "platform": { "os": "linux", "architecture": "arm64" }
                    },
                    descriptor
                ]
            })
            .to_string();
            descriptor = serde_json::json!({
                "mediaType": "application/vnd.oci.image.index.v1+json",
                "digest": Self::nested_index_digest(),
                "size": nested.len()
            });
            files.push((
                format!("blobs/sha256/{}", hex_of(&Self::arm64_config_digest())),
                arm64_config.into_bytes(),
            ));
            files.push((
                format!("blobs/sha256/{}", hex_of(&Self::arm64_manifest_digest())),
                arm64_manifest.into_bytes(),
            ));
            files.push((
                format!("blobs/sha256/{}", hex_of(&Self::nested_index_digest())),
                nested.into_bytes(),
            ));
        }
        if let Some(tag) = self.repo_tags.first() {
            descriptor["annotations"] = serde_json::json!({ "io.containerd.image.name": tag });
        }
        let index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [descriptor]
        })
        .to_string();

        if self.format != ArchiveFormat::LegacyDocker {
            files.push(("index.json".to_string(), index.into_bytes()));
            files.push((format!("blobs/sha256/{}", hex_of(&manifest_digest)), manifest.into_bytes()));
        }
        if self.format != ArchiveFormat::Oci {
            let docker_manifest = serde_json::json!([{
                "Config": format!("blobs/sha256/{}", hex_of(&config_digest)),
                "RepoTags": self.repo_tags,
                "Layers": layer_paths
            }])
            .to_string();
            files.push(("manifest.json".to_string(), docker_manifest.into_bytes()));
        }

        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in &files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, name, content.as_slice()).unwrap();
        }
        for (name, target) in &links {
            let mut header = tar::Header::new_gnu();
            header.set_size(0);
            header.set_mode(0o777);
            header.set_entry_type(tar::EntryType::Symlink);
            builder.append_link(&mut header, name, target).unwrap();
        }
        fs::write(path, builder.into_inner().unwrap()).unwrap();
    }
}

const TAG_NAME: i32 = 1000;
const TAG_VERSION: i32 = 1001;
const TAG_RELEASE: i32 = 1002;
const TAG_EPOCH: i32 = 1003;
const TAG_SIZE: i32 = 1009;

/// RPM header blob for `name-[epoch:]version-release` of `size` bytes.
pub fn rpm_header(name: &str, version: &str, release: &str, epoch: Option<u32>, size: u32) -> Vec<u8> {
    let mut index: Vec<(i32, u32, u32)> = Vec::new();
    let mut data: Vec<u8> = Vec::new();
    for (tag, value) in [(TAG_NAME, name), (TAG_VERSION, version), (TAG_RELEASE, release)] {
        index.push((tag, 6, data.len() as u32));
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    let mut ints = vec![(TAG_SIZE, size)];
    if let Some(epoch) = epoch {
        ints.push((TAG_EPOCH, epoch));
    }
    for (tag, value) in ints {
        while data.len() % 4 != 0 {
            data.push(0);
        }
        index.push((tag, 4, data.len() as u32));
        data.extend_from_slice(&value.to_be_bytes());
    }

    let mut blob = Vec::new();
    blob.extend_from_slice(&(index.len() as u32).to_be_bytes());
    blob.extend_from_slice(&(data.len() as u32).to_be_bytes());
    for (tag, kind, offset) in index {
        blob.extend_from_slice(&tag.to_be_bytes());
        blob.extend_from_slice(&kind.to_be_bytes());
        blob.extend_from_slice(&offset.to_be_bytes());
        blob.extend_from_slice(&1u32.to_be_bytes());
    }
    blob.extend_from_slice(&data);
    blob
}

/// Bytes of an rpm sqlite database holding `blobs`.
pub fn rpm_sqlite_db(blobs: &[Vec<u8>]) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rpmdb.sqlite");
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE Packages (hnum INTEGER PRIMARY KEY AUTOINCREMENT, blob BLOB NOT NULL);")
            .unwrap();
        for blob in blobs {
            conn.execute("INSERT INTO Packages (blob) VALUES (?1)", params![blob]).unwrap();
        }
    }
    fs::read(&path).unwrap()
}

/// Little-endian Berkeley DB hash database with each blob stored off-page on
/// a single overflow page.
pub fn rpm_berkeley_db(blobs: &[Vec<u8>]) -> Vec<u8> {
    const PAGE_SIZE: usize = 4096;
    const HEADER: usize = 26;

    fn put_u16(page: &mut [u8], at: usize, v: u16) {
        page[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }
    fn put_u32(page: &mut [u8], at: usize, v: u32) {
        page[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    let mut meta = vec![0u8; PAGE_SIZE];
    put_u32(&mut meta, 12, 0x0006_1561);
    put_u32(&mut meta, 20, PAGE_SIZE as u32);
    put_u32(&mut meta, 32, 1 + blobs.len() as u32);

    let mut hash = vec![0u8; PAGE_SIZE];
    hash[25] = 13;
    put_u16(&mut hash, 20, (blobs.len() * 2) as u16);
    let mut cursor = PAGE_SIZE;
    let mut overflow_pages = Vec::new();
    for (i, blob) in blobs.iter().enumerate() {
        assert!(blob.len() <= PAGE_SIZE - HEADER, "fixture blobs must fit one page");
        let pgno = 2 + i;

        cursor -= 12;
        let value_at = cursor;
        hash[value_at] = 3;
        put_u32(&mut hash, value_at + 4, pgno as u32);
        put_u32(&mut hash, value_at + 8, blob.len() as u32);
        cursor -= 5;
        let key_at = cursor;
        hash[key_at] = 1;
        put_u32(&mut hash, key_at + 1, i as u32 + 1);
        put_u16(&mut hash, HEADER + i * 4, key_at as u16);
        put_u16(&mut hash, HEADER + i * 4 + 2, value_at as u16);

        let mut page = vec![0u8; PAGE_SIZE];
        page[25] = 7;
        put_u16(&mut page, 22, blob.len() as u16);
        page[HEADER..HEADER + blob.len()].copy_from_slice(blob);
        overflow_pages.push(page);
    }

    let mut db = meta;
    db.extend_from_slice(&hash);
    for page in overflow_pages {
        db.extend_from_slice(&page);
    }
    db
}

pub fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn sha1_hex(content: &[u8]) -> String {
    oci_inventory::java::sha1_hex(content)
}
