//! Dockerfile analysis record supplied by an external parser.
//!
//! The scanner never parses Dockerfiles itself. It accepts this record as
//! JSON, copies it into the response, and uses `dockerfile_packages` to label
//! which instruction installed an OS package.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub instruction: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerFileAnalysis {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    #[serde(default)]
    pub dockerfile_packages: BTreeMap<String, Instruction>,
    #[serde(default)]
    pub dockerfile_layers: BTreeMap<String, Instruction>,
}

impl DockerFileAnalysis {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read Dockerfile analysis: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse Dockerfile analysis: {}", path.display()))
    }

    /// Instruction that installed `package`, if the Dockerfile mentions it.
    pub fn instruction_for(&self, package: &str) -> Option<&str> {
        self.dockerfile_packages
            .get(package)
            .map(|i| i.instruction.as_str())
    }
}
