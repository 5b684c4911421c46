//! Atomic file persistence.

use getrandom::fill;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A file on disk that is only ever replaced atomically.
///
/// Used for the record store file, restored blobs and backup destinations.
#[derive(Clone, Debug)]
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    /// Creates a new Storage instance with the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Returns `true` if the storage file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Returns the path to the storage file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the entire storage file into memory.
    pub fn load(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }

    /// Saves data to the storage file using atomic write.
    pub fn save(&self, data: &[u8]) -> io::Result<()> {
        let mut pending = self.begin_write()?;
        pending.write_all(data)?;
        pending.commit()
    }

    /// Starts an atomic write.
    ///
    /// Data goes to a temporary file with a random name next to the target.
    /// [`PendingFile::commit`] syncs it and renames it over the target; if the
    /// `PendingFile` is dropped without committing, the temporary file is
    /// removed and the target is left untouched.
    ///
    /// Creates parent directories if they don't exist.
    pub fn begin_write(&self) -> io::Result<PendingFile> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.random_tmp_path()?;

        // securely create temp file (fail if exists)
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;

        Ok(PendingFile {
            file: Some(file),
            tmp_path,
            target: self.path.clone(),
        })
    }

    /// Generates a unique temporary file path in the same directory.
    ///
    /// Format: `filename.tmp.<randomhex>`
    fn random_tmp_path(&self) -> io::Result<PathBuf> {
        let mut buf = [0u8; 8]; // 64 bit entropy
        fill(&mut buf).map_err(|_| io::Error::other("OS random generator unavailable"))?;

        let rand_string = buf.iter().map(|b| format!("{:02x}", b)).collect::<String>();

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
            .to_string_lossy();

        let tmp_name = format!("{}.tmp.{}", file_name, rand_string);

        Ok(self.path.with_file_name(tmp_name))
    }
}

/// An in-progress atomic write. See [`Storage::begin_write`].
#[derive(Debug)]
pub struct PendingFile {
    file: Option<File>,
    tmp_path: PathBuf,
    target: PathBuf,
}

impl PendingFile {
    /// Makes the written data visible at the target path.
    pub fn commit(mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?; //fsync file
        }

        atomic_replace(&self.tmp_path, &self.target)?;

        sync_parent_dir(&self.target)
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("pending file already committed"))
    }
}

impl Write for PendingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        // Still holding the handle means commit() never ran or failed before
        // the rename; either way the temporary file is garbage.
        if self.file.take().is_some() || self.tmp_path.exists() {
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.tmp_path.display(), error = %e, "failed to remove temporary file");
                }
            }
        }
    }
}

/// Makes a rename inside the parent directory durable.
#[cfg(not(target_os = "windows"))]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => File::open(parent)?.sync_all(),
        _ => Ok(()),
    }
}

// Directories cannot be opened as files on Windows; ReplaceFileW with
// write-through already flushes the rename.
#[cfg(target_os = "windows")]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Atomically replaces the target file with the temporary file.
///
/// Uses Windows `ReplaceFileW` API with `REPLACEFILE_WRITE_THROUGH` flag
/// when the target already exists.
#[cfg(target_os = "windows")]
fn atomic_replace(tmp_path: &Path, target: &Path) -> io::Result<()> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Storage::FileSystem::{REPLACEFILE_WRITE_THROUGH, ReplaceFileW};

    // ReplaceFileW needs an existing file to replace.
    if !target.exists() {
        return fs::rename(tmp_path, target);
    }

    fn to_wide(s: &OsStr) -> Vec<u16> {
        s.encode_wide().chain(std::iter::once(0)).collect()
    }

    let target_w = to_wide(target.as_os_str());
    let tmp_w = to_wide(tmp_path.as_os_str());

    // SAFETY:
    // - Strings are valid UTF-16 and null-terminated
    // - Pointers remain valid during the call
    // - Windows does not retain the pointers after return
    let result = unsafe {
        ReplaceFileW(
            target_w.as_ptr(),
            tmp_w.as_ptr(),
            std::ptr::null(),
            REPLACEFILE_WRITE_THROUGH,
            std::ptr::null(),
            std::ptr::null(),
        )
    };

    if result == 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Atomically replaces the target file with the temporary file.
///
/// On Unix, `rename()` is atomic when both paths are on the same filesystem.
#[cfg(not(target_os = "windows"))]
fn atomic_replace(tmp_path: &Path, target: &Path) -> io::Result<()> {
    fs::rename(tmp_path, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn dir_entries(dir: &Path) -> Vec<std::ffi::OsString> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect()
    }

    #[test]
    fn load_returns_written_data() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("store.db"));
        storage.save(b"hello world").unwrap();

        assert_eq!(storage.load().unwrap(), b"hello world");
    }

    #[test]
    fn load_fails_if_file_does_not_exist() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("missing.db"));

        assert!(!storage.exists());
        assert!(storage.load().is_err());
    }

    #[test]
    fn save_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let storage = Storage::new(path.clone());

        storage.save(b"first").unwrap();
        storage.save(b"second").unwrap();

        assert_eq!(fs::read(path).unwrap(), b"second");
    }

    #[test]
    fn tmp_file_is_removed_after_success() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("store.db"));
        storage.save(b"data").unwrap();

        assert_eq!(dir_entries(dir.path()), vec!["store.db"]);
    }

    #[test]
    fn dropped_pending_file_leaves_target_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.nvb");
        let storage = Storage::new(path.clone());
        storage.save(b"old backup").unwrap();

        {
            let mut pending = storage.begin_write().unwrap();
            pending.write_all(b"half written").unwrap();
        }

        assert_eq!(fs::read(&path).unwrap(), b"old backup");
        assert_eq!(dir_entries(dir.path()), vec!["backup.nvb"]);
    }

    #[test]
    fn nothing_is_created_without_commit() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("new.nvb"));

        drop(storage.begin_write().unwrap());

        assert!(!storage.exists());
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn tmp_names_are_unique_and_local() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        let storage = Storage::new(path.clone());

        let a = storage.random_tmp_path().unwrap();
        let b = storage.random_tmp_path().unwrap();

        assert_ne!(a, b);
        assert_ne!(a, path);
        assert_eq!(a.parent(), path.parent());
    }

    #[test]
    fn parent_directory_is_created() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b").join("c").join("store.db");

        Storage::new(nested.clone()).save(b"data").unwrap();

        assert!(nested.exists());
    }
}
