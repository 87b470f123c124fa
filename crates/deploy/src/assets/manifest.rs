//! Local build output scanning.

use std::path::{Path, PathBuf};

use crate::DeployError;

/// Content type used for extensions missing from [`CONTENT_TYPES`].
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Extension to MIME type table. Lookups are case-insensitive.
const CONTENT_TYPES: &[(&str, &str)] = &[
    ("html", "text/html; charset=utf-8"),
    ("htm", "text/html; charset=utf-8"),
    ("css", "text/css; charset=utf-8"),
    ("js", "application/javascript; charset=utf-8"),
    ("mjs", "application/javascript; charset=utf-8"),
    ("json", "application/json"),
    ("map", "application/json"),
    ("webmanifest", "application/manifest+json"),
    ("txt", "text/plain; charset=utf-8"),
    ("xml", "application/xml"),
    ("svg", "image/svg+xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("avif", "image/avif"),
    ("ico", "image/x-icon"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
    ("otf", "font/otf"),
    ("pdf", "application/pdf"),
    ("wasm", "application/wasm"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("mp3", "audio/mpeg"),
];

/// Content type for a file, derived from its extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return FALLBACK_CONTENT_TYPE;
    };

    CONTENT_TYPES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(ext))
        .map(|(_, content_type)| *content_type)
        .unwrap_or(FALLBACK_CONTENT_TYPE)
}

/// One file of the build output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetEntry {
    /// Path relative to the scanned root, `/`-separated. Used as the object key.
    pub key: String,
    pub content: Vec<u8>,
    pub content_type: &'static str,
}

/// Every file under a build output directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetManifest {
    /// Entries sorted by key.
    pub entries: Vec<AssetEntry>,
}

impl AssetManifest {
    /// Recursively read every regular file under `root`.
    pub async fn scan(root: &Path) -> Result<Self, DeployError> {
        if !tokio::fs::try_exists(root).await.unwrap_or(false) {
            return Err(DeployError::Configuration(format!(
                "build output directory not found: {}",
                root.display()
            )));
        }

        let mut entries = Vec::new();
        let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut read_dir = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() || tokio::fs::metadata(&path).await?.is_file() {
                    let content = tokio::fs::read(&path).await?;
                    entries.push(AssetEntry {
                        key: object_key(root, &path)?,
                        content_type: content_type_for(&path),
                        content,
                    });
                }
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));

        tracing::debug!(root = %root.display(), files = entries.len(), "Scanned build output");
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.key.as_str())
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|entry| entry.content.len()).sum()
    }
}

fn object_key(root: &Path, path: &Path) -> Result<String, DeployError> {
    let relative = path.strip_prefix(root).map_err(|_| {
        DeployError::Configuration(format!(
            "{} is outside of {}",
            path.display(),
            root.display()
        ))
    })?;

    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}
