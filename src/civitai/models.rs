//! Civitai API payloads.
//!
//! Only the fields the cache acts on are typed; everything else is kept in
//! `extra` so metadata written back to the store round-trips unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub model_versions: Vec<ModelVersion>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelVersion {
    pub id: u64,
    /// Absent when the version is nested inside a [`Model`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub metadata: FileMetadata,
    #[serde(default)]
    pub hashes: FileHashes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileHashes {
    #[serde(rename = "SHA256", default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl File {
    /// Content-addressed store key, `blobs/sha256:<lowercase digest>`.
    pub fn cache_key(&self) -> Option<String> {
        self.hashes
            .sha256
            .as_deref()
            .filter(|h| !h.is_empty())
            .map(|h| format!("blobs/sha256:{}", h.to_ascii_lowercase()))
    }
}

// ---------------------------------------------------------------------------
// File selection
// ---------------------------------------------------------------------------

/// Download query parameters narrowing which file of a version is wanted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FileFilter {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub format: Option<String>,
    pub size: Option<String>,
    pub fp: Option<String>,
}

impl FileFilter {
    pub fn is_empty(&self) -> bool {
        [&self.kind, &self.format, &self.size, &self.fp]
            .iter()
            .all(|p| p.as_deref().is_none_or(str::is_empty))
    }

    fn matches(&self, file: &File) -> bool {
        fn check(wanted: &Option<String>, actual: Option<&str>) -> bool {
            match wanted.as_deref() {
                None | Some("") => true,
                Some(w) => actual == Some(w),
            }
        }
        check(&self.kind, Some(file.kind.as_str()))
            && check(&self.format, file.metadata.format.as_deref())
            && check(&self.size, file.metadata.size.as_deref())
            && check(&self.fp, file.metadata.fp.as_deref())
    }
}

/// Pick the file a download request refers to.
///
/// Without parameters this is the primary file (or the first one if none is
/// flagged primary); otherwise the first file matching every parameter.
pub fn select_file<'a>(files: &'a [File], filter: &FileFilter) -> Option<&'a File> {
    if filter.is_empty() {
        return files.iter().find(|f| f.primary).or_else(|| files.first());
    }
    files.iter().find(|f| filter.matches(f))
}
