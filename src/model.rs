//! Typed application records.
//!
//! Field names serialize in camelCase, which is also how they appear in the
//! record collections of a backup.

use serde::{Deserialize, Serialize};

use crate::store::CollectionSpec;

/// Collection holding [`Note`]s.
pub const NOTES: &str = "notes.json";
/// Collection holding [`FileItem`]s.
pub const FILE_ITEMS: &str = "file_items.json";
/// Field of a [`FileItem`] that names its blob.
pub const FILE_NAME_FIELD: &str = "originalFileName";

/// Collections in export order: notes first, then attached files.
pub fn default_collections() -> Vec<CollectionSpec> {
    vec![
        CollectionSpec::records(NOTES),
        CollectionSpec::with_blobs(FILE_ITEMS, FILE_NAME_FIELD),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: i64,
    pub title: String,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// A file attached to the vault. The bytes live in the blob store under
/// `original_file_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileItem {
    pub id: i64,
    pub original_file_name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub encrypted_file_path: String,
    pub file_size: u64,
    pub timestamp: i64,
}
