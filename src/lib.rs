pub mod archive;
pub mod backup;
pub mod blob;
pub mod crypto;
pub mod error;
pub mod model;
mod storage;
pub mod store;

pub use crate::backup::{
    BackupExporter, BackupImporter, BackupSummary, BackupWarning, CancelToken, export_backup,
    import_backup,
};
pub use crate::blob::{BlobSink, BlobSource, DirBlobStore, MemoryBlobStore};
pub use crate::error::{BackupError, StoreError};
pub use crate::model::{FileItem, Note};
pub use crate::storage::Storage;
pub use crate::store::{JsonRecordStore, MemoryRecordStore, Record, RecordSink, RecordSource};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use directories::ProjectDirs;
use std::fs::File;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const RECORDS_FILE: &str = "records.json";
const FILES_DIR: &str = "files";

/// A vault of notes and attached files kept in one data directory:
/// `records.json` plus one file per attachment under `files/`.
pub struct Notevault {
    records: JsonRecordStore,
    blobs: DirBlobStore,
}

impl Notevault {
    /// Opens the vault in `dir`, starting empty if nothing is there yet.
    pub fn open_in(dir: &Path) -> Result<Self> {
        let records = JsonRecordStore::open(
            Storage::new(dir.join(RECORDS_FILE)),
            model::default_collections(),
        )
        .with_context(|| format!("failed to load records from {}", dir.display()))?;

        Ok(Self {
            records,
            blobs: DirBlobStore::new(dir.join(FILES_DIR)),
        })
    }

    pub fn add_note(&mut self, title: &str, content: &str) -> Result<Note> {
        let note = Note {
            id: self.records.next_id(model::NOTES),
            title: title.to_string(),
            content: content.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        };
        self.records
            .insert(model::NOTES, Record::from_typed(&note)?)?;
        Ok(note)
    }

    /// Copies the file at `path` into the vault and records it.
    ///
    /// Attachments are keyed by file name; a second file with the same name
    /// is refused.
    pub fn attach_file(&mut self, path: &Path, mime_type: Option<String>) -> Result<FileItem> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{} has no usable file name", path.display()))?
            .to_string();

        if self.file_items()?.iter().any(|f| f.original_file_name == name) {
            bail!("a file named '{name}' is already attached");
        }

        let mut source =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let file_size = self
            .blobs
            .store_blob(&name, &mut source)
            .with_context(|| format!("failed to copy {} into the vault", path.display()))?;

        let item = FileItem {
            id: self.records.next_id(model::FILE_ITEMS),
            encrypted_file_path: self.blobs.path_of(&name)?.display().to_string(),
            original_file_name: name,
            mime_type,
            file_size,
            timestamp: Utc::now().timestamp_millis(),
        };
        self.records
            .insert(model::FILE_ITEMS, Record::from_typed(&item)?)?;
        Ok(item)
    }

    pub fn notes(&self) -> Result<Vec<Note>> {
        self.typed(model::NOTES)
    }

    pub fn file_items(&self) -> Result<Vec<FileItem>> {
        self.typed(model::FILE_ITEMS)
    }

    fn typed<T: serde::de::DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        self.records
            .records(collection)
            .map(|r| {
                r.to_typed::<T>()
                    .with_context(|| format!("record {} in {collection} is unreadable", r.id()))
            })
            .collect()
    }

    /// Writes an encrypted backup of the whole vault to `path`.
    pub fn export_backup<P>(
        &self,
        path: &Path,
        password: Zeroizing<String>,
        cancel: CancelToken,
        on_progress: P,
    ) -> Result<BackupSummary, BackupError>
    where
        P: FnMut(i32, &str),
    {
        BackupExporter::new(&self.records, &self.blobs)
            .with_cancel(cancel)
            .export_to_path(path, password, on_progress)
    }

    /// Restores the backup at `path` into the vault. Records with the same id
    /// are overwritten, everything else is kept.
    pub fn import_backup<P>(
        &mut self,
        path: &Path,
        password: Zeroizing<String>,
        cancel: CancelToken,
        on_progress: P,
    ) -> Result<BackupSummary, BackupError>
    where
        P: FnMut(i32, &str),
    {
        BackupImporter::new(&mut self.records, &mut self.blobs)
            .with_cancel(cancel)
            .import_from_path(path, password, on_progress)
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    let project_dirs =
        ProjectDirs::from("", "", "notevault").context("could not determine platform directories")?;

    Ok(project_dirs.data_dir().to_path_buf())
}
