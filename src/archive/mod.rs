//! Streaming entry container carried inside the encrypted stream.
//!
//! Format v1:
//! ```text
//! MAGIC "NVBK" (4) | VERSION (1)
//! entry*:  KIND (1) | NAME_LEN u16 LE | NAME | (LEN u32 LE | bytes)* | 0u32
//! END (1) = 0x00
//! ```
//! Entries are written and read in one forward pass: there is no index and
//! no length known up front. Record collections always precede blobs.

mod reader;
mod writer;

use std::io::{self, Read};

pub use reader::{ArchiveEntry, ArchiveReader};
pub use writer::ArchiveWriter;

use crate::error::ArchiveError;

/// Magic bytes opening every archive ("NVBK").
pub const MAGIC: &[u8; 4] = b"NVBK";
/// Latest container version
pub const CURRENT_VERSION: u8 = 1;
/// Copy buffer used when streaming blob content into the archive.
pub const COPY_BUFFER_LEN: usize = 8 * 1024;
/// Largest chunk a reader accepts.
pub const MAX_CHUNK_LEN: u32 = 1024 * 1024;
/// Longest entry name in bytes.
pub const MAX_NAME_LEN: usize = 1024;
/// Upper bound for a record collection held in memory.
pub const MAX_TEXT_LEN: u64 = 256 * 1024 * 1024;

const END_MARKER: u8 = 0x00;

/// What an entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Serialized record collection (UTF-8 text).
    RecordCollection,
    /// Raw blob bytes.
    Blob,
}

impl EntryKind {
    fn to_byte(self) -> u8 {
        match self {
            EntryKind::RecordCollection => 0x01,
            EntryKind::Blob => 0x02,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, ArchiveError> {
        match byte {
            0x01 => Ok(EntryKind::RecordCollection),
            0x02 => Ok(EntryKind::Blob),
            other => Err(ArchiveError::UnknownKind(other)),
        }
    }
}

fn validate_name(name: &str) -> Result<(), ArchiveError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('\0') {
        return Err(ArchiveError::InvalidName);
    }
    Ok(())
}

fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16<R: Read>(r: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
