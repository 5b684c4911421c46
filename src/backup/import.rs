use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{
    BLOB_ENTRY_PREFIX, BackupSummary, BackupWarning, CancelToken, SourceTracker, percent,
    run_reported,
};
use crate::archive::{ArchiveReader, EntryKind};
use crate::blob::BlobSink;
use crate::crypto::{derive_key, open_decrypting_source};
use crate::error::BackupError;
use crate::store::{CollectionSpec, Record, RecordSink};

/// Restores an encrypted archive into a record store and a blob store.
///
/// The whole archive is authenticated and parsed before any record reaches
/// the record store, so a wrong password or a damaged file leaves the
/// records untouched. Blobs are written as they stream past.
pub struct BackupImporter<'a, S: ?Sized, B: ?Sized> {
    records: &'a mut S,
    blobs: &'a mut B,
    cancel: CancelToken,
}

impl<'a, S, B> BackupImporter<'a, S, B>
where
    S: RecordSink + ?Sized,
    B: BlobSink + ?Sized,
{
    pub fn new(records: &'a mut S, blobs: &'a mut B) -> Self {
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

    pub fn import<R, P>(
        &mut self,
        source: R,
        password: Zeroizing<String>,
        mut on_progress: P,
    ) -> Result<BackupSummary, BackupError>
    where
        R: Read,
        P: FnMut(i32, &str),
    {
        run_reported("Restore", &mut on_progress, |progress| {
            self.restore(source, password, progress)
        })
    }

    pub fn import_from_path<P>(
        &mut self,
        path: &Path,
        password: Zeroizing<String>,
        mut on_progress: P,
    ) -> Result<BackupSummary, BackupError>
    where
        P: FnMut(i32, &str),
    {
        run_reported("Restore", &mut on_progress, |progress| {
            let file = File::open(path).map_err(BackupError::ImportIo)?;
            self.restore(BufReader::new(file), password, progress)
        })
    }

    fn restore<R, P>(
        &mut self,
        source: R,
        password: Zeroizing<String>,
        progress: &mut P,
    ) -> Result<BackupSummary, BackupError>
    where
        R: Read,
        P: FnMut(i32, &str),
    {
        let key = derive_key(&password).map_err(BackupError::KeyDerivation)?;
        drop(password);

        let plaintext = open_decrypting_source(source, &key)?;
        drop(key);
        let mut archive = ArchiveReader::open(plaintext).map_err(BackupError::from_import_io)?;

        let specs = self.records.collections();
        let mut loaded: Vec<(String, Vec<Record>)> = Vec::new();
        let mut referenced: Option<HashSet<String>> = None;
        let mut summary = BackupSummary::default();

        loop {
            self.cancel.check()?;

            let Some(entry) = archive.next_entry().map_err(BackupError::from_import_io)? else {
                break;
            };

            match entry.kind() {
                EntryKind::RecordCollection => {
                    let name = entry.name().to_string();
                    let text = Zeroizing::new(entry.read_text().map_err(BackupError::from_import_io)?);
                    let records: Vec<Record> = serde_json::from_str(&text)?;
                    check_collection(&name, &records, &loaded)?;

                    debug!(collection = %name, records = records.len(), "collection read");
                    progress(25, &format!("Loading {name}..."));
                    loaded.push((name, records));
                }
                EntryKind::Blob => {
                    let Some(blob_name) = entry.name().strip_prefix(BLOB_ENTRY_PREFIX) else {
                        warn!(entry = entry.name(), "unknown archive entry, skipping");
                        summary.warnings.push(BackupWarning::UnknownEntry {
                            name: entry.name().to_string(),
                        });
                        continue;
                    };
                    let blob_name = blob_name.to_string();

                    // Record collections precede blobs, so the set is complete here.
                    let known = referenced.get_or_insert_with(|| referenced_blobs(&specs, &loaded));
                    if !known.contains(&blob_name) {
                        warn!(blob = %blob_name, "file not referenced by any record");
                        summary.warnings.push(BackupWarning::OrphanBlob {
                            name: blob_name.clone(),
                        });
                    }

                    let mut content = SourceTracker::new(entry);
                    let stored = self.blobs.store_blob(&blob_name, &mut content);
                    if let Some(err) = content.into_source_error() {
                        return Err(BackupError::from_import_io(err));
                    }
                    match stored {
                        Ok(bytes) => {
                            summary.blobs += 1;
                            summary.blob_bytes += bytes;
                            debug!(blob = %blob_name, bytes, "file restored");
                        }
                        Err(e) => {
                            warn!(blob = %blob_name, error = %e, "could not restore file, skipping");
                            summary.warnings.push(BackupWarning::BlobRestoreFailed {
                                name: blob_name.clone(),
                                reason: e.to_string(),
                            });
                        }
                    }
                    progress(50, &format!("Restoring file {blob_name}"));
                }
            }
        }

        // Reaching here means the end marker was read and the final
        // segment authenticated.
        progress(60, "Backup verified");

        let total = loaded.len();
        for (i, (name, records)) in loaded.into_iter().enumerate() {
            summary.collections += 1;
            summary.records += records.len();
            if !records.is_empty() {
                let written = self.records.replace_all(&name, records)?;
                debug!(collection = %name, records = written, "collection restored");
            }
            progress(
                percent(i + 1, total, 60, 35),
                &format!("Restoring {name} into the database..."),
            );
        }
        self.records.commit()?;

        Ok(summary)
    }
}

fn check_collection(
    name: &str,
    records: &[Record],
    loaded: &[(String, Vec<Record>)],
) -> Result<(), BackupError> {
    if loaded.iter().any(|(seen, _)| seen == name) {
        return Err(BackupError::MalformedArchive(format!(
            "record collection '{name}' appears twice"
        )));
    }

    let mut ids = HashSet::with_capacity(records.len());
    for record in records {
        if !ids.insert(record.id()) {
            return Err(BackupError::MalformedArchive(format!(
                "duplicate id {} in '{name}'",
                record.id()
            )));
        }
    }
    Ok(())
}

fn referenced_blobs(specs: &[CollectionSpec], loaded: &[(String, Vec<Record>)]) -> HashSet<String> {
    loaded
        .iter()
        .filter_map(|(name, records)| {
            let spec = specs.iter().find(|s| s.name() == name)?;
            Some(records.iter().filter_map(move |r| spec.blob_reference(r)))
        })
        .flatten()
        .map(|reference| reference.name)
        .collect()
}

/// Imports the backup in `source` into `records` and `blobs` in one call.
pub fn import_backup<R, S, B, P>(
    source: R,
    password: Zeroizing<String>,
    records: &mut S,
    blobs: &mut B,
    on_progress: P,
) -> Result<BackupSummary, BackupError>
where
    R: Read,
    S: RecordSink + ?Sized,
    B: BlobSink + ?Sized,
    P: FnMut(i32, &str),
{
    BackupImporter::new(records, blobs).import(source, password, on_progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveWriter;
    use crate::blob::MemoryBlobStore;
    use crate::crypto::{EncryptingWriter, derive_key};
    use crate::store::MemoryRecordStore;
    use std::io;

    fn password(p: &str) -> Zeroizing<String> {
        Zeroizing::new(p.to_string())
    }

    fn sink() -> (MemoryRecordStore, MemoryBlobStore) {
        (
            MemoryRecordStore::new(vec![
                CollectionSpec::records("notes.json"),
                CollectionSpec::with_blobs("file_items.json", "originalFileName"),
            ]),
            MemoryBlobStore::new(),
        )
    }

    // Builds a correctly encrypted archive with arbitrary content.
    fn sealed(pw: &str, build: impl FnOnce(&mut ArchiveWriter<EncryptingWriter<Vec<u8>>>)) -> Vec<u8> {
        let key = derive_key(pw).unwrap();
        let (_, writer) = crate::crypto::open_encrypting_sink(Vec::new(), &key).unwrap();
        let mut archive = ArchiveWriter::begin(writer).unwrap();
        build(&mut archive);
        archive.close().unwrap().finish().unwrap()
    }

    #[test]
    fn duplicate_ids_are_malformed() {
        let bytes = sealed("pw", |a| {
            a.write_record_collection("notes.json", r#"[{"id":1},{"id":1}]"#)
                .unwrap();
        });
        let (mut records, mut blobs) = sink();

        let err = import_backup(&bytes[..], password("pw"), &mut records, &mut blobs, |_, _| {})
            .unwrap_err();

        assert!(matches!(err, BackupError::MalformedArchive(_)), "{err:?}");
        assert!(records.is_empty());
    }

    #[test]
    fn repeated_collection_is_malformed() {
        let bytes = sealed("pw", |a| {
            a.write_record_collection("notes.json", "[]").unwrap();
            a.write_record_collection("notes.json", "[]").unwrap();
        });
        let (mut records, mut blobs) = sink();

        let err = import_backup(&bytes[..], password("pw"), &mut records, &mut blobs, |_, _| {})
            .unwrap_err();

        assert!(matches!(err, BackupError::MalformedArchive(_)));
    }

    #[test]
    fn invalid_record_json_is_serialization_error() {
        let bytes = sealed("pw", |a| {
            a.write_record_collection("notes.json", "{not json").unwrap();
        });
        let (mut records, mut blobs) = sink();

        let err = import_backup(&bytes[..], password("pw"), &mut records, &mut blobs, |_, _| {})
            .unwrap_err();

        assert!(matches!(err, BackupError::Serialization(_)));
    }

    #[test]
    fn orphan_and_unknown_entries_are_warnings() {
        let bytes = sealed("pw", |a| {
            a.write_record_collection("notes.json", "[]").unwrap();
            a.write_blob("files/stray.bin", &mut &b"stray"[..]).unwrap();
            a.write_blob("thumbnails/x.png", &mut &b"png"[..]).unwrap();
        });
        let (mut records, mut blobs) = sink();

        let summary =
            import_backup(&bytes[..], password("pw"), &mut records, &mut blobs, |_, _| {}).unwrap();

        assert_eq!(blobs.get("stray.bin"), Some(&b"stray"[..]));
        assert_eq!(
            summary.warnings,
            vec![
                BackupWarning::OrphanBlob {
                    name: "stray.bin".into()
                },
                BackupWarning::UnknownEntry {
                    name: "thumbnails/x.png".into()
                },
            ]
        );
    }

    #[test]
    fn unsafe_blob_name_is_skipped_not_fatal() {
        let bytes = sealed("pw", |a| {
            a.write_record_collection(
                "file_items.json",
                r#"[{"id":1,"originalFileName":"../evil"}]"#,
            )
            .unwrap();
            a.write_blob("files/../evil", &mut &b"x"[..]).unwrap();
        });
        let (mut records, _) = sink();
        let dir = tempfile::tempdir().unwrap();
        let mut blobs = crate::blob::DirBlobStore::new(dir.path().join("files"));

        let summary =
            import_backup(&bytes[..], password("pw"), &mut records, &mut blobs, |_, _| {}).unwrap();

        assert!(matches!(
            summary.warnings.as_slice(),
            [BackupWarning::BlobRestoreFailed { .. }]
        ));
        assert!(!dir.path().join("evil").exists());
        assert_eq!(records.len(), 1);
    }

    struct FailingSink;

    impl BlobSink for FailingSink {
        fn store_blob(&mut self, _name: &str, content: &mut dyn Read) -> io::Result<u64> {
            let mut first = [0u8; 1];
            content.read_exact(&mut first)?;
            Err(io::Error::other("disk full"))
        }
    }

    #[test]
    fn blob_sink_failure_is_a_warning() {
        let bytes = sealed("pw", |a| {
            a.write_record_collection(
                "file_items.json",
                r#"[{"id":1,"originalFileName":"a.bin"}]"#,
            )
            .unwrap();
            a.write_blob("files/a.bin", &mut &[1u8; 20][..]).unwrap();
        });
        let (mut records, _) = sink();

        let summary =
            import_backup(&bytes[..], password("pw"), &mut records, &mut FailingSink, |_, _| {})
                .unwrap();

        assert_eq!(summary.blobs, 0);
        assert_eq!(summary.records, 1);
        assert!(matches!(
            summary.warnings.as_slice(),
            [BackupWarning::BlobRestoreFailed { name, .. }] if name == "a.bin"
        ));
    }

    #[test]
    fn tampered_blob_is_fatal_even_if_sink_swallows_it() {
        // A blob large enough to span several cipher segments.
        let payload = vec![3u8; 200 * 1024];
        let mut bytes = sealed("pw", |a| {
            a.write_record_collection("notes.json", r#"[{"id":1}]"#).unwrap();
            a.write_blob("files/big.bin", &mut &payload[..]).unwrap();
        });
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0x01;

        struct Swallowing;
        impl BlobSink for Swallowing {
            fn store_blob(&mut self, _name: &str, content: &mut dyn Read) -> io::Result<u64> {
                let mut sink = Vec::new();
                let _ = content.read_to_end(&mut sink);
                Ok(0)
            }
        }

        let (mut records, _) = sink();
        let err = import_backup(&bytes[..], password("pw"), &mut records, &mut Swallowing, |_, _| {})
            .unwrap_err();

        assert!(matches!(err, BackupError::Authentication), "{err:?}");
        assert!(records.is_empty());
    }

    #[test]
    fn progress_reports_verification_before_records() {
        let bytes = sealed("pw", |a| {
            a.write_record_collection("notes.json", r#"[{"id":4,"title":"x"}]"#)
                .unwrap();
        });
        let (mut records, mut blobs) = sink();
        let mut reports = Vec::new();

        import_backup(&bytes[..], password("pw"), &mut records, &mut blobs, |p, m: &str| {
            reports.push((p, m.to_string()))
        })
        .unwrap();

        let percents: Vec<i32> = reports.iter().map(|(p, _)| *p).collect();
        assert_eq!(percents, vec![25, 60, 95, 100]);
        assert_eq!(reports[1].1, "Backup verified");
        assert_eq!(reports[3].1, "Restore complete");
        assert!(records.get("notes.json", 4).is_some());
    }

    /// Remembers the order of sink calls.
    #[derive(Default)]
    struct CallLog {
        calls: Vec<String>,
    }

    impl crate::store::RecordCollections for CallLog {
        fn collections(&self) -> Vec<CollectionSpec> {
            vec![CollectionSpec::records("notes.json")]
        }
    }

    impl RecordSink for CallLog {
        fn replace_all(
            &mut self,
            collection: &str,
            records: Vec<Record>,
        ) -> Result<usize, crate::error::StoreError> {
            self.calls.push(format!("replace {collection}"));
            Ok(records.len())
        }

        fn commit(&mut self) -> Result<(), crate::error::StoreError> {
            self.calls.push("commit".to_string());
            Ok(())
        }
    }

    #[test]
    fn records_are_committed_once_after_all_collections() {
        let bytes = sealed("pw", |a| {
            a.write_record_collection("notes.json", r#"[{"id":1}]"#).unwrap();
            a.write_record_collection("file_items.json", r#"[{"id":2}]"#)
                .unwrap();
        });
        let mut log = CallLog::default();
        let mut blobs = MemoryBlobStore::new();

        import_backup(&bytes[..], password("pw"), &mut log, &mut blobs, |_, _| {}).unwrap();

        assert_eq!(
            log.calls,
            vec!["replace notes.json", "replace file_items.json", "commit"]
        );
    }

    #[test]
    fn failed_import_never_commits() {
        let bytes = sealed("pw", |a| {
            a.write_record_collection("notes.json", r#"[{"id":1},{"id":1}]"#)
                .unwrap();
        });
        let mut log = CallLog::default();
        let mut blobs = MemoryBlobStore::new();

        assert!(import_backup(&bytes[..], password("pw"), &mut log, &mut blobs, |_, _| {}).is_err());
        assert!(log.calls.is_empty());
    }

    #[test]
    fn truncated_header_is_malformed() {
        let (mut records, mut blobs) = sink();

        let err = import_backup(&[1u8, 2, 3][..], password("pw"), &mut records, &mut blobs, |_, _| {})
            .unwrap_err();

        assert!(matches!(err, BackupError::MalformedArchive(_)));
    }

    #[test]
    fn header_without_segments_fails_authentication() {
        let (mut records, mut blobs) = sink();

        let err = import_backup(&[0u8; 12][..], password("pw"), &mut records, &mut blobs, |_, _| {})
            .unwrap_err();

        assert!(matches!(err, BackupError::Authentication), "{err:?}");
    }
}
