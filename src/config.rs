//! Scan options, registry credentials and glob filters.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

use crate::dockerfile::DockerFileAnalysis;

pub const USERNAME_ENV: &str = "OCI_INVENTORY_REGISTRY_USERNAME";
pub const PASSWORD_ENV: &str = "OCI_INVENTORY_REGISTRY_PASSWORD";

/// Library-level configuration for one scan.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanOptions {
    /// Image target: `docker-archive:<path>`, `oci-archive:<path>`,
    /// `fs:<root>` or a registry identifier.
    pub path: String,
    /// Overrides the identifier derived for local archives.
    pub image_name_and_tag: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub platform: Option<String>,
    /// Directory under which fetched archives are saved.
    pub image_save_path: Option<PathBuf>,
    /// Unpack one level of nested jars.
    pub shaded_jars: bool,
    /// Fingerprint application artifacts (jars) in addition to OS packages.
    pub app_vulns: bool,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    #[serde(skip)]
    pub dockerfile_analysis: Option<DockerFileAnalysis>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            path: String::new(),
            image_name_and_tag: None,
            username: None,
            password: None,
            platform: None,
            image_save_path: None,
            shaded_jars: false,
            app_vulns: true,
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
            dockerfile_analysis: None,
        }
    }
}

impl ScanOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Rejects option combinations that cannot produce a meaningful scan.
    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            bail!("No image identifier or path provided");
        }
        if self.shaded_jars && !self.app_vulns {
            bail!("To use shaded jar unpacking, application scanning must be enabled");
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::from_flags_or_env(self.username.clone(), self.password.clone())
    }

    pub fn glob_filters(&self) -> Result<GlobFilters> {
        GlobFilters::compile(&self.include_globs, &self.exclude_globs)
    }
}

/// Registry credentials.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    /// Flags take precedence; each missing flag falls back to its environment
    /// variable.
    pub fn from_flags_or_env(username: Option<String>, password: Option<String>) -> Self {
        Self {
            username: username.or_else(|| non_empty_env(USERNAME_ENV)),
            password: password.or_else(|| non_empty_env(PASSWORD_ENV)),
        }
    }

    /// Both halves, if both are present.
    pub fn pair(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some((username.as_str(), password.as_str())),
            _ => None,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Compiled include/exclude globs over in-image paths.
#[derive(Debug, Clone, Default)]
pub struct GlobFilters {
    pub include: Vec<glob::Pattern>,
    pub exclude: Vec<glob::Pattern>,
}

impl GlobFilters {
    pub fn compile(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: compile_patterns(include)?,
            exclude: compile_patterns(exclude)?,
        })
    }
}

fn compile_patterns(raw: &[String]) -> Result<Vec<glob::Pattern>> {
    raw.iter()
        .map(|pattern| {
            glob::Pattern::new(pattern).with_context(|| format!("Invalid glob pattern: {}", pattern))
        })
        .collect()
}
