//! Encrypted backup export and import.
//!
//! Both directions run as one blocking call on the caller's thread and report
//! progress through a plain `FnMut(i32, &str)` callback invoked on that same
//! thread. A percentage of `-1` means the operation failed.

mod export;
mod import;

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use export::{BackupExporter, export_backup};
pub use import::{BackupImporter, import_backup};

use tracing::{error, info};

use crate::error::BackupError;

/// Archive name prefix for blob entries.
pub const BLOB_ENTRY_PREFIX: &str = "files/";

/// Cooperative cancellation flag, checked between archive entries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), BackupError> {
        if self.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        Ok(())
    }
}

/// Non-fatal problem met while processing a single entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupWarning {
    /// A record references a blob the blob store does not have.
    BlobMissing { name: String, reason: Option<String> },
    /// A blob could not be written to the blob store.
    BlobRestoreFailed { name: String, reason: String },
    /// A restored blob is not referenced by any restored record.
    OrphanBlob { name: String },
    /// An entry this version does not know how to restore.
    UnknownEntry { name: String },
}

impl fmt::Display for BackupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupWarning::BlobMissing { name, reason: None } => {
                write!(f, "file '{name}' not found, skipped")
            }
            BackupWarning::BlobMissing {
                name,
                reason: Some(reason),
            } => write!(f, "file '{name}' could not be read ({reason}), skipped"),
            BackupWarning::BlobRestoreFailed { name, reason } => {
                write!(f, "file '{name}' could not be restored: {reason}")
            }
            BackupWarning::OrphanBlob { name } => {
                write!(f, "file '{name}' is not referenced by any record")
            }
            BackupWarning::UnknownEntry { name } => write!(f, "unknown entry '{name}' ignored"),
        }
    }
}

/// What an export or import did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupSummary {
    pub collections: usize,
    pub records: usize,
    pub blobs: usize,
    pub blob_bytes: u64,
    pub warnings: Vec<BackupWarning>,
}

impl fmt::Display for BackupSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records in {} collections, {} files ({} bytes)",
            self.records, self.collections, self.blobs, self.blob_bytes
        )?;
        if !self.warnings.is_empty() {
            write!(f, ", {} warnings", self.warnings.len())?;
        }
        Ok(())
    }
}

/// Short text for the `-1` progress report. Never more specific than the
/// error's own Display, and never distinguishes password from corruption.
fn failure_reason(err: &BackupError) -> &'static str {
    match err {
        BackupError::KeyDerivation(_) => "could not derive the encryption key",
        BackupError::ExportIo(_) | BackupError::ImportIo(_) => "I/O error",
        BackupError::BlobSource { .. } => "a file could not be read",
        BackupError::Authentication => "wrong password or corrupted backup",
        BackupError::MalformedArchive(_) => "the backup file is damaged",
        BackupError::Serialization(_) => "records could not be processed",
        BackupError::Store(_) => "the record store rejected the data",
        BackupError::Cancelled => "cancelled",
    }
}

/// Runs one whole operation and turns its outcome into the final progress
/// report: 100 on success, -1 with a generic reason on failure.
fn run_reported<T, P>(
    operation: &str,
    on_progress: &mut P,
    body: impl FnOnce(&mut P) -> Result<T, BackupError>,
) -> Result<T, BackupError>
where
    T: fmt::Display,
    P: FnMut(i32, &str),
{
    info!("{operation} started");
    match body(on_progress) {
        Ok(value) => {
            info!(summary = %value, "{operation} complete");
            on_progress(100, &format!("{operation} complete"));
            Ok(value)
        }
        Err(err) => {
            error!(error = %err, "{operation} failed");
            on_progress(-1, &format!("{operation} failed: {}", failure_reason(&err)));
            Err(err)
        }
    }
}

/// Keeps the read error of a blob's source so it can be told apart from a
/// failure of whatever consumes the bytes.
struct SourceTracker<R> {
    inner: R,
    error: Option<io::Error>,
}

impl<R: Read> SourceTracker<R> {
    fn new(inner: R) -> Self {
        Self { inner, error: None }
    }

    fn into_source_error(self) -> Option<io::Error> {
        self.error
    }
}

impl<R: Read> Read for SourceTracker<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Err(e) if e.kind() != io::ErrorKind::Interrupted => {
                let kind = e.kind();
                self.error = Some(e);
                Err(io::Error::new(kind, "blob source failed"))
            }
            other => other,
        }
    }
}

fn percent(done: usize, total: usize, from: i32, span: i32) -> i32 {
    if total == 0 {
        return from + span;
    }
    from + (done as i64 * span as i64 / total as i64) as i32
}
