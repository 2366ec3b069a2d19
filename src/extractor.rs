//! Extract actions and the merged, read-only view of image layers.
//!
//! An [`ExtractAction`] names a rule that decides which in-image paths an
//! ecosystem cares about. While layers are read (see [`crate::tar_extractor`])
//! or a live filesystem is walked ([`ExtractedLayers::from_filesystem`]), every
//! path matched by a registered action has its content recorded under that
//! action's name. Extractors then ask [`ExtractedLayers::resolve`] for their
//! action and get the content back, or `None` when the image does not carry it.
//!
//! Paths are always normalized absolute paths (`/var/lib/rpm/Packages`).

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path};
use walkdir::WalkDir;

use crate::config::GlobFilters;

pub const RPM_DB_ACTION: &str = "rpm-db";
pub const RPM_SQLITE_DB_ACTION: &str = "rpm-sqlite-db";
pub const JAR_ACTION: &str = "jar";
pub const OS_RELEASE_ACTION: &str = "os-release";
pub const MANIFEST_FILES_ACTION: &str = "manifest-files";

/// Legacy (Berkeley DB) rpm database locations, in lookup order.
pub const RPM_DB_PATHS: &[&str] = &["/var/lib/rpm/Packages", "/usr/lib/sysimage/rpm/Packages"];

/// Sqlite rpm database locations, in lookup order.
pub const RPM_SQLITE_DB_PATHS: &[&str] = &[
    "/var/lib/rpm/rpmdb.sqlite",
    "/usr/lib/sysimage/rpm/rpmdb.sqlite",
    "/usr/lib/sysimage/rpm/Packages.db",
];

/// `os-release` locations, in lookup order.
pub const OS_RELEASE_PATHS: &[&str] = &["/etc/os-release", "/usr/lib/os-release"];

/// Top-level directories never worth walking on a live root filesystem.
const PSEUDO_FILESYSTEMS: &[&str] = &["/proc", "/sys", "/dev"];

/// How an action decides whether a path belongs to it.
#[derive(Debug, Clone)]
pub enum PathMatcher {
    /// Exact match against one of the candidate paths. Candidate order is the
    /// lookup order used by [`ExtractedLayers::resolve`].
    Exact(Vec<String>),
    /// Path ends with one of the suffixes.
    Suffix(Vec<String>),
    /// Path matches one of the glob patterns.
    Globs(Vec<glob::Pattern>),
}

impl PathMatcher {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Exact(candidates) => candidates.iter().any(|c| c == path),
            PathMatcher::Suffix(suffixes) => suffixes.iter().any(|s| path.ends_with(s.as_str())),
            PathMatcher::Globs(patterns) => patterns.iter().any(|p| p.matches(path)),
        }
    }
}

/// Reads a matched entry into memory.
pub type ContentCallback = fn(&mut dyn Read) -> io::Result<Vec<u8>>;

pub fn stream_to_buffer(reader: &mut dyn Read) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// A named path-matching rule with the callback that captures its content.
#[derive(Debug, Clone)]
pub struct ExtractAction {
    pub name: String,
    pub matcher: PathMatcher,
    pub callback: ContentCallback,
}

impl ExtractAction {
    pub fn new(name: impl Into<String>, matcher: PathMatcher) -> Self {
        Self {
            name: name.into(),
            matcher,
            callback: stream_to_buffer,
        }
    }

    pub fn rpm_db() -> Self {
        Self::new(RPM_DB_ACTION, exact(RPM_DB_PATHS))
    }

    pub fn rpm_sqlite_db() -> Self {
        Self::new(RPM_SQLITE_DB_ACTION, exact(RPM_SQLITE_DB_PATHS))
    }

    pub fn os_release() -> Self {
        Self::new(OS_RELEASE_ACTION, exact(OS_RELEASE_PATHS))
    }

    pub fn jar() -> Self {
        Self::new(
            JAR_ACTION,
            PathMatcher::Suffix(vec![".jar".to_string(), ".war".to_string()]),
        )
    }

    pub fn matches(&self, path: &str) -> bool {
        self.matcher.matches(path)
    }
}

fn exact(paths: &[&str]) -> PathMatcher {
    PathMatcher::Exact(paths.iter().map(|p| p.to_string()).collect())
}

/// The set of actions consulted while reading layers, plus the exclude globs
/// that keep paths out of the resolver entirely.
#[derive(Debug, Clone)]
pub struct ActionRegistry {
    actions: Vec<ExtractAction>,
    exclude: Vec<glob::Pattern>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self {
            actions: vec![
                ExtractAction::rpm_db(),
                ExtractAction::rpm_sqlite_db(),
                ExtractAction::jar(),
                ExtractAction::os_release(),
            ],
            exclude: Vec::new(),
        }
    }
}

impl ActionRegistry {
    /// Built-in actions, extended with a `manifest-files` action for the
    /// include globs and restricted by the exclude globs.
    pub fn with_filters(filters: &GlobFilters) -> Self {
        let mut registry = Self::default();
        if !filters.include.is_empty() {
            registry.register(ExtractAction::new(
                MANIFEST_FILES_ACTION,
                PathMatcher::Globs(filters.include.clone()),
            ));
        }
        registry.exclude = filters.exclude.clone();
        registry
    }

    pub fn register(&mut self, action: ExtractAction) {
        self.actions.push(action);
    }

    pub fn get(&self, name: &str) -> Option<&ExtractAction> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude.iter().any(|p| p.matches(path))
    }

    /// Actions interested in `path`; empty when the path is excluded.
    pub fn matching<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a ExtractAction> + 'a {
        let excluded = self.is_excluded(path);
        self.actions
            .iter()
            .filter(move |action| !excluded && action.matches(path))
    }
}

/// Normalizes an archive or filesystem path into an absolute in-image path.
/// `..` never climbs above the root.
pub fn normalize_image_path(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(c) => parts.push(c.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    format!("/{}", parts.join("/"))
}

/// Content resolved for an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedContent<'a> {
    pub path: &'a str,
    pub content: &'a [u8],
}

/// Merged view of image content: path → action name → bytes.
///
/// Owned by the orchestrator for one scan and only read by extractors.
#[derive(Debug, Default, Clone)]
pub struct ExtractedLayers {
    files: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

impl ExtractedLayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, action: impl Into<String>, content: Vec<u8>) {
        self.files
            .entry(path.into())
            .or_default()
            .insert(action.into(), content);
    }

    /// Replaces everything recorded for `path` with the content captured by a
    /// newer layer.
    pub fn replace(&mut self, path: String, content: BTreeMap<String, Vec<u8>>) {
        self.files.insert(path, content);
    }

    /// Removes `path` and everything beneath it (a whiteout).
    pub fn remove_tree(&mut self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.files
            .retain(|p, _| p != path && !p.starts_with(&prefix));
    }

    /// Removes everything beneath `dir` but not `dir` itself (an opaque
    /// directory marker).
    pub fn clear_dir(&mut self, dir: &str) {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.files.retain(|p, _| !p.starts_with(&prefix));
    }

    /// Everything recorded for `path`, keyed by action name.
    pub fn get(&self, path: &str) -> Option<&BTreeMap<String, Vec<u8>>> {
        self.files.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(|p| p.as_str())
    }

    /// Resolves an action to the first matching content. Exact matchers are
    /// looked up in candidate order; other matchers return the first path in
    /// sorted order.
    pub fn resolve(&self, action: &ExtractAction) -> Option<ResolvedContent<'_>> {
        if let PathMatcher::Exact(candidates) = &action.matcher {
            return candidates.iter().find_map(|candidate| {
                let (path, contents) = self.files.get_key_value(candidate)?;
                contents.get(&action.name).map(|content| ResolvedContent {
                    path: path.as_str(),
                    content: content.as_slice(),
                })
            });
        }

        self.files.iter().find_map(|(path, contents)| {
            contents.get(&action.name).map(|content| ResolvedContent {
                path: path.as_str(),
                content: content.as_slice(),
            })
        })
    }

    /// Byte-stream form of [`ExtractedLayers::resolve`].
    pub fn resolve_reader(&self, action: &ExtractAction) -> Option<Cursor<&[u8]>> {
        self.resolve(action).map(|resolved| Cursor::new(resolved.content))
    }

    /// Every path recorded for an action.
    pub fn resolve_all(&self, action: &ExtractAction) -> BTreeMap<&str, &[u8]> {
        self.files
            .iter()
            .filter_map(|(path, contents)| {
                contents
                    .get(&action.name)
                    .map(|content| (path.as_str(), content.as_slice()))
            })
            .collect()
    }

    /// Builds the view from a live filesystem rooted at `root`.
    ///
    /// Only regular files matched by a registered action are read. Unreadable
    /// files are skipped.
    pub fn from_filesystem(root: &Path, registry: &ActionRegistry) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve filesystem root: {}", root.display()))?;
        let walking_host_root = root == Path::new("/");
        let mut layers = Self::new();

        let walker = WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                if !walking_host_root || entry.depth() != 1 {
                    return true;
                }
                let path = normalize_image_path(entry.path());
                !PSEUDO_FILESYSTEMS.contains(&path.as_str())
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::debug!("Skipping unreadable directory entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = match entry.path().strip_prefix(&root) {
                Ok(relative) => relative,
                Err(_) => continue,
            };
            let image_path = normalize_image_path(relative);

            for action in registry.matching(&image_path) {
                let captured = File::open(entry.path())
                    .and_then(|mut file| (action.callback)(&mut file));
                match captured {
                    Ok(content) => layers.insert(image_path.clone(), action.name.clone(), content),
                    Err(e) => log::debug!("Failed to read {}: {}", entry.path().display(), e),
                }
            }
        }

        Ok(layers)
    }
}
