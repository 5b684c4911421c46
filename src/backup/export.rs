use std::collections::HashSet;
use std::io::{self, Write};
use std::path::Path;

use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{
    BLOB_ENTRY_PREFIX, BackupSummary, BackupWarning, CancelToken, SourceTracker, percent,
    run_reported,
};
use crate::archive::ArchiveWriter;
use crate::blob::BlobSource;
use crate::crypto::{derive_key, open_encrypting_sink};
use crate::error::{BackupError, CryptoError};
use crate::storage::Storage;
use crate::store::{BlobReference, RecordSource};

/// Writes every record collection and every referenced blob of a store into
/// one encrypted archive.
pub struct BackupExporter<'a, S: ?Sized, B: ?Sized> {
    records: &'a S,
    blobs: &'a B,
    cancel: CancelToken,
}

impl<'a, S, B> BackupExporter<'a, S, B>
where
    S: RecordSource + ?Sized,
    B: BlobSource + ?Sized,
{
    pub fn new(records: &'a S, blobs: &'a B) -> Self {
        Self {
            records,
            blobs,
            cancel: CancelToken::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Streams the encrypted backup into `destination`.
    ///
    /// On failure `destination` holds an unusable partial stream; use
    /// [`BackupExporter::export_to_path`] when that matters.
    pub fn export<W, P>(
        &self,
        destination: W,
        password: Zeroizing<String>,
        mut on_progress: P,
    ) -> Result<BackupSummary, BackupError>
    where
        W: Write,
        P: FnMut(i32, &str),
    {
        run_reported("Backup", &mut on_progress, |progress| {
            self.write_backup(destination, password, progress)
        })
    }

    /// Writes the backup to `path`, replacing it atomically only once the
    /// whole archive has been sealed.
    pub fn export_to_path<P>(
        &self,
        path: &Path,
        password: Zeroizing<String>,
        mut on_progress: P,
    ) -> Result<BackupSummary, BackupError>
    where
        P: FnMut(i32, &str),
    {
        run_reported("Backup", &mut on_progress, |progress| {
            let mut pending = Storage::new(path.to_path_buf())
                .begin_write()
                .map_err(BackupError::ExportIo)?;
            let summary = self.write_backup(&mut pending, password, progress)?;
            pending.commit().map_err(BackupError::ExportIo)?;
            debug!(path = %path.display(), "backup file committed");
            Ok(summary)
        })
    }

    fn write_backup<W, P>(
        &self,
        destination: W,
        password: Zeroizing<String>,
        progress: &mut P,
    ) -> Result<BackupSummary, BackupError>
    where
        W: Write,
        P: FnMut(i32, &str),
    {
        // Nothing touches the destination before the key exists.
        let key = derive_key(&password).map_err(BackupError::KeyDerivation)?;
        drop(password);

        let (_nonce, sink) = open_encrypting_sink(destination, &key).map_err(sink_error)?;
        drop(key);
        let mut archive = ArchiveWriter::begin(sink).map_err(BackupError::from_export_io)?;

        let mut summary = BackupSummary::default();
        let specs = self.records.collections();
        let mut references: Vec<BlobReference> = Vec::new();

        for (i, spec) in specs.iter().enumerate() {
            self.cancel.check()?;

            let snapshot = self.records.snapshot(spec.name())?;
            let text = Zeroizing::new(serde_json::to_string(&snapshot)?);
            archive
                .write_record_collection(spec.name(), &text)
                .map_err(BackupError::from_export_io)?;

            references.extend(snapshot.iter().filter_map(|r| spec.blob_reference(r)));
            summary.collections += 1;
            summary.records += snapshot.len();
            debug!(collection = spec.name(), records = snapshot.len(), "collection written");
            progress(
                percent(i + 1, specs.len(), 0, 50),
                &format!("Saving {}...", spec.name()),
            );
        }

        // Two records may share one blob; it is stored once.
        let mut seen = HashSet::new();
        references.retain(|r| seen.insert(r.name.clone()));

        for (i, reference) in references.iter().enumerate() {
            self.cancel.check()?;

            match self.blobs.open_blob(&reference.name) {
                Ok(Some(content)) => {
                    let entry = format!("{BLOB_ENTRY_PREFIX}{}", reference.name);
                    // The entry is already half written once its content
                    // fails, so the archive cannot be completed.
                    let mut content = SourceTracker::new(content);
                    let written = archive.write_blob(&entry, &mut content);
                    if let Some(source) = content.into_source_error() {
                        return Err(BackupError::BlobSource {
                            name: reference.name.clone(),
                            source,
                        });
                    }
                    let written = written.map_err(BackupError::from_export_io)?;
                    summary.blobs += 1;
                    summary.blob_bytes += written;
                    debug!(blob = %reference.name, bytes = written, "file written");
                }
                Ok(None) => {
                    warn!(
                        blob = %reference.name,
                        collection = %reference.collection,
                        record = reference.record_id,
                        "referenced file not found, skipping"
                    );
                    summary.warnings.push(BackupWarning::BlobMissing {
                        name: reference.name.clone(),
                        reason: None,
                    });
                }
                Err(e) => {
                    warn!(
                        blob = %reference.name,
                        collection = %reference.collection,
                        record = reference.record_id,
                        error = %e,
                        "referenced file unreadable, skipping"
                    );
                    summary.warnings.push(BackupWarning::BlobMissing {
                        name: reference.name.clone(),
                        reason: Some(e.to_string()),
                    });
                }
            }

            progress(
                percent(i + 1, references.len(), 50, 50),
                &format!("Saving file {}", reference.name),
            );
        }

        let sink = archive.close().map_err(BackupError::from_export_io)?;
        let mut destination = sink.finish().map_err(BackupError::from_export_io)?;
        destination.flush().map_err(BackupError::ExportIo)?;

        Ok(summary)
    }
}

fn sink_error(err: CryptoError) -> BackupError {
    match err {
        CryptoError::Io(e) => BackupError::ExportIo(e),
        other => BackupError::ExportIo(io::Error::other(other)),
    }
}

/// Exports `records` and `blobs` to `destination` in one call.
pub fn export_backup<W, S, B, P>(
    destination: W,
    password: Zeroizing<String>,
    records: &S,
    blobs: &B,
    on_progress: P,
) -> Result<BackupSummary, BackupError>
where
    W: Write,
    S: RecordSource + ?Sized,
    B: BlobSource + ?Sized,
    P: FnMut(i32, &str),
{
    BackupExporter::new(records, blobs).export(destination, password, on_progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::store::{CollectionSpec, MemoryRecordStore, Record};
    use serde_json::json;
    use std::io::Read;

    fn store_with_attachment() -> (MemoryRecordStore, MemoryBlobStore) {
        let mut records = MemoryRecordStore::new(vec![
            CollectionSpec::records("notes.json"),
            CollectionSpec::with_blobs("file_items.json", "originalFileName"),
        ]);
        let note = json!({"title": "t", "content": "c"});
        records
            .insert("notes.json", Record::new(1, note.as_object().unwrap().clone()))
            .unwrap();
        let item = json!({"originalFileName": "a.bin"});
        records
            .insert("file_items.json", Record::new(1, item.as_object().unwrap().clone()))
            .unwrap();
        let mut blobs = MemoryBlobStore::new();
        blobs.insert("a.bin", vec![7u8; 100]);
        (records, blobs)
    }

    fn password(p: &str) -> Zeroizing<String> {
        Zeroizing::new(p.to_string())
    }

    #[test]
    fn progress_is_monotonic_and_ends_at_100() {
        let (records, blobs) = store_with_attachment();
        let mut reports = Vec::new();

        let summary = export_backup(Vec::new(), password("pw"), &records, &blobs, |p, m: &str| {
            reports.push((p, m.to_string()))
        })
        .unwrap();

        assert_eq!(summary.records, 2);
        assert_eq!(summary.blobs, 1);
        assert_eq!(summary.blob_bytes, 100);

        let percents: Vec<i32> = reports.iter().map(|(p, _)| *p).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
        assert_eq!(reports.last().unwrap(), &(100, "Backup complete".to_string()));
        assert!(percents.contains(&50));
    }

    #[test]
    fn shared_blob_is_written_once() {
        let (mut records, blobs) = store_with_attachment();
        let item = json!({"originalFileName": "a.bin"});
        records
            .insert("file_items.json", Record::new(2, item.as_object().unwrap().clone()))
            .unwrap();

        let summary = export_backup(Vec::new(), password("pw"), &records, &blobs, |_, _| {}).unwrap();

        assert_eq!(summary.blobs, 1);
    }

    #[test]
    fn cancelled_export_reports_failure() {
        let (records, blobs) = store_with_attachment();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut last = None;

        let err = BackupExporter::new(&records, &blobs)
            .with_cancel(cancel)
            .export(Vec::new(), password("pw"), |p, m: &str| last = Some((p, m.to_string())))
            .unwrap_err();

        assert!(matches!(err, BackupError::Cancelled));
        assert_eq!(last, Some((-1, "Backup failed: cancelled".to_string())));
    }

    struct BrokenDestination;

    impl Write for BrokenDestination {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn destination_failure_is_export_io() {
        let (records, blobs) = store_with_attachment();
        let mut reports = Vec::new();

        let err = export_backup(BrokenDestination, password("pw"), &records, &blobs, |p, m: &str| {
            reports.push((p, m.to_string()))
        })
        .unwrap_err();

        assert!(matches!(err, BackupError::ExportIo(_)), "{err:?}");
        let failures: Vec<_> = reports.iter().filter(|(p, _)| *p == -1).collect();
        assert_eq!(failures, vec![&(-1, "Backup failed: I/O error".to_string())]);
        assert_eq!(reports.last().unwrap().0, -1);
    }

    struct UnreadableFile;

    impl Read for UnreadableFile {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("device removed"))
        }
    }

    struct FlakyBlobs;

    impl BlobSource for FlakyBlobs {
        fn open_blob(&self, _name: &str) -> io::Result<Option<Box<dyn Read + '_>>> {
            Ok(Some(Box::new((&b"partial"[..]).chain(UnreadableFile))))
        }
    }

    #[test]
    fn blob_read_failure_names_the_file() {
        let (records, _) = store_with_attachment();
        let mut reports = Vec::new();

        let err = export_backup(Vec::new(), password("pw"), &records, &FlakyBlobs, |p, m: &str| {
            reports.push((p, m.to_string()))
        })
        .unwrap_err();

        match &err {
            BackupError::BlobSource { name, source } => {
                assert_eq!(name, "a.bin");
                assert_eq!(source.to_string(), "device removed");
            }
            other => panic!("expected BlobSource, got: {other:?}"),
        }
        assert_eq!(
            reports.last(),
            Some(&(-1, "Backup failed: a file could not be read".to_string()))
        );
    }
}
