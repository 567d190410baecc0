//! Media catalog for the media root.
//!
//! Scans the root non-recursively, classifies entries as raw playable files or
//! prepared streaming assets, and links the two through a deterministic
//! naming scheme: `clip.mp4` -> `clip_stream/playlist.m3u8`.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Suffix appended to the sanitized base name of a source.
pub const STREAM_DIR_SUFFIX: &str = "_stream";

/// Manifest file name inside a streaming asset directory.
pub const MANIFEST_FILE_NAME: &str = "playlist.m3u8";

/// Errors returned by catalog lookups.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Neither the raw file nor a prepared asset exists.
    #[error("No source or streaming asset named '{0}'")]
    NotFound(String),

    /// The media root could not be created or read.
    #[error("Media root unavailable: {0}")]
    Io(#[from] io::Error),
}

/// A raw video file directly under the media root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceAsset {
    /// File name within the root.
    pub name: String,
    /// Lower-cased extension without the dot.
    pub extension: String,
    /// File size at scan time.
    pub size_bytes: u64,
    /// Sanitized base name, `None` if nothing survives sanitization.
    pub stream_key: Option<String>,
}

/// A prepared, segmented version of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamingAsset {
    /// Sanitized base name shared with the source.
    pub key: String,
    /// `<key>_stream`
    pub directory_name: String,
    /// Manifest path relative to the root, with `/` separators.
    pub manifest_path: String,
}

impl StreamingAsset {
    fn for_key(key: &str) -> Self {
        let directory_name = format!("{}{}", key, STREAM_DIR_SUFFIX);
        let manifest_path = format!("{}/{}", directory_name, MANIFEST_FILE_NAME);
        Self {
            key: key.to_string(),
            directory_name,
            manifest_path,
        }
    }
}

/// Raw and prepared views of one name, joined by the naming scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolved {
    pub source: Option<SourceAsset>,
    pub stream: Option<StreamingAsset>,
}

impl Resolved {
    /// True once the streaming asset's manifest is published.
    pub fn is_ready(&self) -> bool {
        self.stream.is_some()
    }
}

/// Keep alphanumerics, spaces, hyphens and underscores, then trim whitespace.
///
/// Distinct inputs can collide (`a.b` and `ab` both become `ab`); callers
/// treat that as a known limitation.
pub fn sanitize(base_name: &str) -> String {
    base_name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '-' || *c == '_')
        .collect::<String>()
        .trim()
        .to_string()
}

/// File stem of a file name: `my.clip.mp4` -> `my.clip`.
pub fn base_name(file_name: &str) -> &str {
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => &file_name[..idx],
        _ => file_name,
    }
}

/// Lower-cased extension of a file name, if any.
pub fn extension_of(file_name: &str) -> Option<String> {
    match file_name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < file_name.len() => {
            Some(file_name[idx + 1..].to_lowercase())
        }
        _ => None,
    }
}

/// Sanitized key for a source file name, `None` when it sanitizes to nothing.
pub fn stream_key(source_name: &str) -> Option<String> {
    let key = sanitize(base_name(source_name));
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

/// `<sanitized base>_stream` for a source file name.
pub fn stream_dir_name(source_name: &str) -> Option<String> {
    stream_key(source_name).map(|key| format!("{}{}", key, STREAM_DIR_SUFFIX))
}

/// Read-only view over the media root.
#[derive(Debug, Clone)]
pub struct MediaCatalog {
    root: PathBuf,
    extensions: Vec<String>,
}

impl MediaCatalog {
    /// Create a catalog, creating the root directory if it is missing.
    pub fn open(root: impl Into<PathBuf>, extensions: Vec<String>) -> Result<Self, CatalogError> {
        let extensions = extensions
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();
        let catalog = Self {
            root: root.into(),
            extensions,
        };
        catalog.ensure_root()?;
        Ok(catalog)
    }

    /// Creates the media root if it does not exist.
    pub fn ensure_root(&self) -> Result<(), CatalogError> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Checks an extension against the allow-list (case-insensitive).
    pub fn is_allowed(&self, file_name: &str) -> bool {
        extension_of(file_name)
            .map(|ext| self.extensions.iter().any(|allowed| *allowed == ext))
            .unwrap_or(false)
    }

    /// Absolute path of a raw source.
    pub fn source_path(&self, source_name: &str) -> PathBuf {
        self.root.join(source_name)
    }

    /// Absolute path of the streaming directory for a key.
    pub fn stream_dir(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}{}", key, STREAM_DIR_SUFFIX))
    }

    /// Absolute path of the manifest for a key.
    pub fn manifest_path(&self, key: &str) -> PathBuf {
        self.stream_dir(key).join(MANIFEST_FILE_NAME)
    }

    /// Whether a published manifest exists for the key.
    pub fn is_ready(&self, key: &str) -> bool {
        self.manifest_path(key).is_file()
    }

    /// Lists raw playable files sorted by name.
    ///
    /// Entries that vanish between the directory read and the metadata call
    /// are skipped, so a concurrent job publishing into the root never makes
    /// the scan fail.
    pub fn list_sources(&self) -> Vec<SourceAsset> {
        if let Err(e) = self.ensure_root() {
            tracing::warn!(root = %self.root.display(), "Cannot create media root: {}", e);
        }
        let mut sources = Vec::new();
        let mut keys: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if !self.is_allowed(name) {
                continue;
            }
            // follow symlinks to regular files
            let Ok(metadata) = std::fs::metadata(entry.path()) else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }

            let stream_key = stream_key(name);
            if let Some(key) = &stream_key {
                keys.entry(key.clone()).or_default().push(name.to_string());
            }

            sources.push(SourceAsset {
                name: name.to_string(),
                extension: extension_of(name).unwrap_or_default(),
                size_bytes: metadata.len(),
                stream_key,
            });
        }

        for (key, names) in keys.iter().filter(|(_, names)| names.len() > 1) {
            tracing::warn!(
                key = %key,
                sources = ?names,
                "Sources share one streaming directory; their conversions overwrite each other"
            );
        }

        sources.sort_by(|a, b| a.name.cmp(&b.name));
        sources
    }

    /// Names of `_stream` directories that contain a manifest.
    pub fn list_streaming_assets(&self) -> BTreeSet<String> {
        WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .filter(|name| !name.starts_with('.') && name.ends_with(STREAM_DIR_SUFFIX))
            .filter(|name| self.root.join(name).join(MANIFEST_FILE_NAME).is_file())
            .collect()
    }

    /// Joins the raw and prepared views for a source file name.
    ///
    /// Only names directly under the root resolve; `../clip.mp4` or
    /// `sub/clip.mp4` are `NotFound` even though they share a stream key.
    pub fn resolve(&self, source_name: &str) -> Result<Resolved, CatalogError> {
        if !is_plain_file_name(source_name) {
            return Err(CatalogError::NotFound(source_name.to_string()));
        }
        let source = self.lookup_source(source_name);
        let stream = stream_key(source_name)
            .filter(|key| self.is_ready(key))
            .map(|key| StreamingAsset::for_key(&key));

        if source.is_none() && stream.is_none() {
            return Err(CatalogError::NotFound(source_name.to_string()));
        }
        Ok(Resolved { source, stream })
    }

    /// Runs a filesystem lookup on the blocking pool.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T, CatalogError>
    where
        F: FnOnce(&MediaCatalog) -> T + Send + 'static,
        T: Send + 'static,
    {
        let catalog = self.clone();
        tokio::task::spawn_blocking(move || f(&catalog))
            .await
            .map_err(|e| CatalogError::Io(io::Error::other(e)))
    }

    fn lookup_source(&self, source_name: &str) -> Option<SourceAsset> {
        if !self.is_allowed(source_name) {
            return None;
        }
        let metadata = std::fs::metadata(self.source_path(source_name)).ok()?;
        if !metadata.is_file() {
            return None;
        }
        Some(SourceAsset {
            name: source_name.to_string(),
            extension: extension_of(source_name).unwrap_or_default(),
            size_bytes: metadata.len(),
            stream_key: stream_key(source_name),
        })
    }
}

/// A name that stays directly under the root. Leading dots are fine.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
        && !is_work_dir_name(name)
}

/// Staging and set-aside directories: `.<key>_stream.partial-<id>` and
/// `.<key>_stream.stale-<id>`. Never listed or served.
pub fn is_work_dir_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('.') else {
        return false;
    };
    [".partial-", ".stale-"].iter().any(|marker| {
        rest.split_once(marker)
            .is_some_and(|(dir, _)| dir.ends_with(STREAM_DIR_SUFFIX))
    })
}
