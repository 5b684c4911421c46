use std::io;

use thiserror::Error;

/// Failures of the key derivation and stream cipher layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("OS random generator unavailable")]
    Random,

    #[error("backup is too short to contain a nonce header")]
    TruncatedHeader,

    /// Tag mismatch. Deliberately says nothing about the cause.
    #[error("wrong password or corrupted backup")]
    Authentication,

    #[error("encryption failed")]
    Encryption,

    #[error("too many segments in one stream")]
    SegmentOverflow,

    #[error("encrypted stream is unusable after an earlier write failure")]
    StreamFailed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Structural problems of the entry container.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("not a notevault archive")]
    InvalidMagic,

    #[error("unsupported archive version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown entry kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("invalid entry name")]
    InvalidName,

    #[error("entry chunk of {0} bytes exceeds the limit")]
    ChunkTooLarge(u32),

    #[error("record collection '{0}' after blob entries")]
    OutOfOrder(String),

    #[error("record collection '{0}' is too large")]
    TextTooLarge(String),

    #[error("record collection '{0}' is not valid UTF-8")]
    InvalidText(String),

    #[error("unexpected data after end of archive")]
    TrailingData,

    #[error("archive ended unexpectedly")]
    UnexpectedEnd,
}

impl ArchiveError {
    pub(crate) fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }
}

/// Failures reported by the record and blob collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown record collection '{0}'")]
    UnknownCollection(String),

    #[error("duplicate record id {id} in '{collection}'")]
    DuplicateId { collection: String, id: i64 },

    #[error("record store is corrupted: {0}")]
    Corrupted(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Top-level result taxonomy of an export or import.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("key derivation failed")]
    KeyDerivation(#[source] CryptoError),

    #[error("I/O error while writing backup")]
    ExportIo(#[source] io::Error),

    #[error("I/O error while reading backup")]
    ImportIo(#[source] io::Error),

    /// A blob's own content failed mid-read after its entry was started.
    #[error("could not read file '{name}' for the backup")]
    BlobSource {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("wrong password or corrupted backup")]
    Authentication,

    #[error("malformed backup archive: {0}")]
    MalformedArchive(String),

    #[error("record serialization failed")]
    Serialization(#[from] serde_json::Error),

    #[error("record store failed")]
    Store(#[from] StoreError),

    #[error("operation cancelled")]
    Cancelled,
}

impl BackupError {
    /// Sorts an `io::Error` raised while reading a backup back into the taxonomy.
    ///
    /// Cipher and container errors travel through `Read` as the inner payload of
    /// an `io::Error`; anything else is a plain source failure.
    pub(crate) fn from_import_io(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return BackupError::MalformedArchive(ArchiveError::UnexpectedEnd.to_string());
        }
        if let Some(inner) = err.get_ref() {
            if let Some(crypto) = inner.downcast_ref::<CryptoError>() {
                return match crypto {
                    CryptoError::TruncatedHeader => {
                        BackupError::MalformedArchive(crypto.to_string())
                    }
                    _ => BackupError::Authentication,
                };
            }
            if let Some(archive) = inner.downcast_ref::<ArchiveError>() {
                return BackupError::MalformedArchive(archive.to_string());
            }
        }
        BackupError::ImportIo(err)
    }

    /// Same as [`BackupError::from_import_io`] for the write side.
    pub(crate) fn from_export_io(err: io::Error) -> Self {
        if let Some(inner) = err.get_ref() {
            if let Some(archive) = inner.downcast_ref::<ArchiveError>() {
                return BackupError::MalformedArchive(archive.to_string());
            }
        }
        BackupError::ExportIo(err)
    }
}

impl From<CryptoError> for BackupError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::KeyDerivation(_) | CryptoError::Random => BackupError::KeyDerivation(err),
            CryptoError::TruncatedHeader => BackupError::MalformedArchive(err.to_string()),
            CryptoError::Authentication => BackupError::Authentication,
            CryptoError::Io(io) => BackupError::from_import_io(io),
            CryptoError::Encryption | CryptoError::SegmentOverflow | CryptoError::StreamFailed => {
                BackupError::ExportIo(io::Error::other(err))
            }
        }
    }
}
