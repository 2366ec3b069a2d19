//! RPM header blob decoding.
//!
//! Both database formats store each installed package as a header blob
//! without the leading header magic:
//!
//! ```text
//! u32 BE  index entry count (il)
//! u32 BE  data store length (dl)
//! il × { i32 tag, u32 type, i32 offset, u32 count }   (big-endian)
//! dl bytes of data store
//! ```

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

const TAG_NAME: i32 = 1000;
const TAG_VERSION: i32 = 1001;
const TAG_RELEASE: i32 = 1002;
const TAG_EPOCH: i32 = 1003;
const TAG_SIZE: i32 = 1009;
const TAG_ARCH: i32 = 1022;
const TAG_SOURCERPM: i32 = 1044;
const TAG_MODULARITYLABEL: i32 = 5096;

const TYPE_INT32: u32 = 4;
const TYPE_STRING: u32 = 6;
const TYPE_STRING_ARRAY: u32 = 8;
const TYPE_I18NSTRING: u32 = 9;

const ENTRY_SIZE: usize = 16;
const PREAMBLE_SIZE: usize = 8;
/// rpm itself refuses headers with more entries than this.
const MAX_INDEX_ENTRIES: usize = 0xffff;
/// rpm's header size limit (256 MiB).
const MAX_DATA_LENGTH: usize = 256 * 1024 * 1024;

/// One installed package as recorded in the rpm database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    pub release: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_rpm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modularity_label: Option<String>,
}

impl PackageInfo {
    /// `[epoch:]version-release`; an epoch of 0 is omitted.
    pub fn full_version(&self) -> String {
        match self.epoch {
            Some(epoch) if epoch != 0 => format!("{}:{}-{}", epoch, self.version, self.release),
            _ => format!("{}-{}", self.version, self.release),
        }
    }
}

struct IndexEntry {
    tag: i32,
    kind: u32,
    offset: usize,
}

fn be_u32(bytes: &[u8], at: usize) -> Result<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| anyhow!("header truncated at offset {}", at))
}

/// Decodes a header blob into a [`PackageInfo`]. A blob without a name is
/// rejected.
pub fn parse_header_blob(blob: &[u8]) -> Result<PackageInfo> {
    let index_count = be_u32(blob, 0)? as usize;
    let data_length = be_u32(blob, 4)? as usize;

    if index_count == 0 || index_count > MAX_INDEX_ENTRIES {
        bail!("header has an implausible index entry count: {}", index_count);
    }
    if data_length > MAX_DATA_LENGTH {
        bail!("header data store too large: {} bytes", data_length);
    }

    let data_start = PREAMBLE_SIZE + index_count * ENTRY_SIZE;
    let data = blob
        .get(data_start..data_start + data_length)
        .ok_or_else(|| {
            anyhow!(
                "header blob is {} bytes, expected at least {}",
                blob.len(),
                data_start + data_length
            )
        })?;

    let mut package = PackageInfo::default();
    for i in 0..index_count {
        let at = PREAMBLE_SIZE + i * ENTRY_SIZE;
        let entry = IndexEntry {
            tag: be_u32(blob, at)? as i32,
            kind: be_u32(blob, at + 4)?,
            offset: be_u32(blob, at + 8)? as usize,
        };

        match entry.tag {
            TAG_NAME => package.name = read_string(data, &entry)?,
            TAG_VERSION => package.version = read_string(data, &entry)?,
            TAG_RELEASE => package.release = read_string(data, &entry)?,
            TAG_EPOCH => package.epoch = Some(read_int32(data, &entry)?),
            TAG_SIZE => package.size = Some(read_int32(data, &entry)?),
            TAG_ARCH => package.arch = Some(read_string(data, &entry)?),
            TAG_SOURCERPM => package.source_rpm = Some(read_string(data, &entry)?),
            TAG_MODULARITYLABEL => package.modularity_label = Some(read_string(data, &entry)?),
            _ => {}
        }
    }

    if package.name.is_empty() {
        bail!("header has no package name");
    }
    Ok(package)
}

fn read_string(data: &[u8], entry: &IndexEntry) -> Result<String> {
    if !matches!(entry.kind, TYPE_STRING | TYPE_STRING_ARRAY | TYPE_I18NSTRING) {
        bail!("tag {} has type {}, expected a string", entry.tag, entry.kind);
    }
    let tail = data
        .get(entry.offset..)
        .ok_or_else(|| anyhow!("tag {} offset {} is out of bounds", entry.tag, entry.offset))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| anyhow!("tag {} string is not terminated", entry.tag))?;
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

fn read_int32(data: &[u8], entry: &IndexEntry) -> Result<u32> {
    if entry.kind != TYPE_INT32 {
        bail!("tag {} has type {}, expected int32", entry.tag, entry.kind);
    }
    be_u32(data, entry.offset)
}
