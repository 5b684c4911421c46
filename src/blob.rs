//! Blob store collaborators.
//!
//! Blob bytes pass through untouched: whatever the store reads or writes is
//! exactly what ends up in (or comes out of) the archive.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::storage::Storage;

/// Read side used by the exporter.
pub trait BlobSource {
    /// Opens a blob for reading. `Ok(None)` means the blob does not exist.
    fn open_blob(&self, name: &str) -> io::Result<Option<Box<dyn Read + '_>>>;
}

/// Write side used by the importer.
pub trait BlobSink {
    /// Stores the whole of `content` under `name`, replacing any existing blob.
    /// Returns the number of bytes stored.
    fn store_blob(&mut self, name: &str, content: &mut dyn Read) -> io::Result<u64>;
}

/// Rejects names that could escape a blob directory.
pub fn validate_blob_name(name: &str) -> io::Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || Path::new(name).is_absolute();
    if bad {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid blob name '{name}'"),
        ));
    }
    Ok(())
}

/// In-memory blob store.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: BTreeMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.blobs.insert(name.into(), bytes.into());
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.blobs.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.blobs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobSource for MemoryBlobStore {
    fn open_blob(&self, name: &str) -> io::Result<Option<Box<dyn Read + '_>>> {
        Ok(self
            .blobs
            .get(name)
            .map(|bytes| Box::new(bytes.as_slice()) as Box<dyn Read + '_>))
    }
}

impl BlobSink for MemoryBlobStore {
    fn store_blob(&mut self, name: &str, content: &mut dyn Read) -> io::Result<u64> {
        let mut bytes = Vec::new();
        content.read_to_end(&mut bytes)?;
        let len = bytes.len() as u64;
        self.blobs.insert(name.to_string(), bytes);
        Ok(len)
    }
}

/// Blob store keeping one file per blob in a directory.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Where the blob `name` lives on disk.
    pub fn path_of(&self, name: &str) -> io::Result<PathBuf> {
        validate_blob_name(name)?;
        Ok(self.root.join(name))
    }
}

impl BlobSource for DirBlobStore {
    fn open_blob(&self, name: &str) -> io::Result<Option<Box<dyn Read + '_>>> {
        match File::open(self.path_of(name)?) {
            Ok(file) => Ok(Some(Box::new(io::BufReader::new(file)))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl BlobSink for DirBlobStore {
    fn store_blob(&mut self, name: &str, content: &mut dyn Read) -> io::Result<u64> {
        let mut pending = Storage::new(self.path_of(name)?).begin_write()?;
        let written = io::copy(content, &mut pending)?;
        pending.flush()?;
        pending.commit()?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn unsafe_names_are_rejected() {
        for name in ["", ".", "..", "../x", "a/b", "a\\b", "/etc/passwd", "a\0b"] {
            assert!(validate_blob_name(name).is_err(), "{name:?}");
        }
        for name in ["scan.pdf", "photo 1.jpg", "..hidden", "a..b"] {
            assert!(validate_blob_name(name).is_ok(), "{name:?}");
        }
    }

    #[test]
    fn memory_store_roundtrip() {
        let mut store = MemoryBlobStore::new();
        assert_eq!(store.store_blob("a", &mut &b"bytes"[..]).unwrap(), 5);

        let mut out = Vec::new();
        store.open_blob("a").unwrap().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"bytes");
        assert!(store.open_blob("missing").unwrap().is_none());
    }

    #[test]
    fn dir_store_writes_and_reads_files() {
        let dir = tempdir().unwrap();
        let mut store = DirBlobStore::new(dir.path().join("files"));

        store.store_blob("doc.txt", &mut &b"hello"[..]).unwrap();
        assert_eq!(fs::read(dir.path().join("files").join("doc.txt")).unwrap(), b"hello");

        let mut out = Vec::new();
        store
            .open_blob("doc.txt")
            .unwrap()
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn dir_store_reports_missing_blob_as_none() {
        let dir = tempdir().unwrap();
        let store = DirBlobStore::new(dir.path().to_path_buf());

        assert!(store.open_blob("nope.bin").unwrap().is_none());
    }

    #[test]
    fn dir_store_refuses_path_traversal() {
        let dir = tempdir().unwrap();
        let mut store = DirBlobStore::new(dir.path().join("files"));

        let err = store.store_blob("../escape", &mut &b"x"[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!dir.path().join("escape").exists());
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("source broke"))
        }
    }

    #[test]
    fn failed_store_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        let mut store = DirBlobStore::new(dir.path().to_path_buf());
        store.store_blob("keep.bin", &mut &b"original"[..]).unwrap();

        assert!(store.store_blob("keep.bin", &mut FailingReader).is_err());

        assert_eq!(fs::read(dir.path().join("keep.bin")).unwrap(), b"original");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
