//! Operating system identification from `os-release`.

use serde::{Deserialize, Serialize};

use crate::extractor::{ExtractAction, ExtractedLayers};

/// Distribution the image was built from, as named by `os-release`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOs {
    /// `ID`, e.g. `rhel`.
    pub name: String,
    /// `VERSION_ID`, e.g. `9.3`. Rolling distributions leave it out.
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pretty_name: Option<String>,
}

/// Reads the first `os-release` the layers carry. `None` when there is none
/// or it names no `ID`.
pub fn detect_target_os(layers: &ExtractedLayers) -> Option<TargetOs> {
    let resolved = layers.resolve(&ExtractAction::os_release())?;
    let target = parse_os_release(&String::from_utf8_lossy(resolved.content));
    if target.is_none() {
        log::debug!("{} does not name a distribution", resolved.path);
    }
    target
}

pub fn parse_os_release(contents: &str) -> Option<TargetOs> {
    let mut target = TargetOs::default();
    for line in contents.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = unquote(value.trim());
        match key.trim() {
            "ID" => target.name = value.to_string(),
            "VERSION_ID" => target.version = value.to_string(),
            "PRETTY_NAME" => target.pretty_name = Some(value.to_string()),
            _ => {}
        }
    }
    if target.name.is_empty() {
        None
    } else {
        Some(target)
    }
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|q| value.strip_prefix(*q).and_then(|v| v.strip_suffix(*q)))
        .unwrap_or(value)
}
