use std::io::{self, Read};

use super::{
    CURRENT_VERSION, END_MARKER, EntryKind, MAGIC, MAX_CHUNK_LEN, MAX_NAME_LEN, MAX_TEXT_LEN,
    read_u8, read_u16, read_u32, validate_name,
};
use crate::error::ArchiveError;

/// Forward-only reader over the entries of an archive.
///
/// Not restartable. Each entry borrows the reader; whatever is left of an
/// entry is skipped when the next one is requested.
pub struct ArchiveReader<R: Read> {
    inner: R,
    in_entry: bool,
    chunk_remaining: u32,
    seen_blob: bool,
    done: bool,
}

impl<R: Read> ArchiveReader<R> {
    /// Checks the container header.
    pub fn open(mut inner: R) -> io::Result<Self> {
        let mut magic = [0u8; MAGIC.len()];
        inner.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ArchiveError::InvalidMagic.into_io());
        }

        let version = read_u8(&mut inner)?;
        if version != CURRENT_VERSION {
            return Err(ArchiveError::UnsupportedVersion(version).into_io());
        }

        Ok(Self {
            inner,
            in_entry: false,
            chunk_remaining: 0,
            seen_blob: false,
            done: false,
        })
    }

    /// Advances to the next entry, or `None` after the end marker.
    pub fn next_entry(&mut self) -> io::Result<Option<ArchiveEntry<'_, R>>> {
        if self.done {
            return Ok(None);
        }
        self.skip_current()?;

        let kind = read_u8(&mut self.inner)?;
        if kind == END_MARKER {
            self.done = true;
            self.expect_end()?;
            return Ok(None);
        }
        let kind = EntryKind::from_byte(kind).map_err(ArchiveError::into_io)?;

        let name_len = read_u16(&mut self.inner)? as usize;
        if name_len > MAX_NAME_LEN {
            return Err(ArchiveError::InvalidName.into_io());
        }
        let mut name = vec![0u8; name_len];
        self.inner.read_exact(&mut name)?;
        let name = String::from_utf8(name).map_err(|_| ArchiveError::InvalidName.into_io())?;
        validate_name(&name).map_err(ArchiveError::into_io)?;

        match kind {
            EntryKind::RecordCollection if self.seen_blob => {
                return Err(ArchiveError::OutOfOrder(name).into_io());
            }
            EntryKind::Blob => self.seen_blob = true,
            EntryKind::RecordCollection => {}
        }

        self.in_entry = true;
        self.chunk_remaining = 0;
        Ok(Some(ArchiveEntry {
            name,
            kind,
            archive: self,
        }))
    }

    // The stream behind the end marker must be exhausted. Reading past it
    // also forces the cipher to verify the last segment.
    fn expect_end(&mut self) -> io::Result<()> {
        let mut probe = [0u8; 1];
        loop {
            match self.inner.read(&mut probe) {
                Ok(0) => return Ok(()),
                Ok(_) => return Err(ArchiveError::TrailingData.into_io()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn skip_current(&mut self) -> io::Result<u64> {
        let mut scratch = [0u8; 4096];
        let mut skipped = 0u64;
        loop {
            match self.read_content(&mut scratch)? {
                0 => return Ok(skipped),
                n => skipped += n as u64,
            }
        }
    }

    fn read_content(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.in_entry || buf.is_empty() {
            return Ok(0);
        }

        if self.chunk_remaining == 0 {
            let len = read_u32(&mut self.inner)?;
            if len == 0 {
                self.in_entry = false;
                return Ok(0);
            }
            if len > MAX_CHUNK_LEN {
                return Err(ArchiveError::ChunkTooLarge(len).into_io());
            }
            self.chunk_remaining = len;
        }

        let want = buf.len().min(self.chunk_remaining as usize);
        let n = loop {
            match self.inner.read(&mut buf[..want]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        self.chunk_remaining -= n as u32;
        Ok(n)
    }
}

/// One entry of an archive. Reading it yields the entry content.
pub struct ArchiveEntry<'a, R: Read> {
    name: String,
    kind: EntryKind,
    archive: &'a mut ArchiveReader<R>,
}

impl<R: Read> ArchiveEntry<'_, R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// Reads the whole entry as UTF-8 text, bounded by [`MAX_TEXT_LEN`].
    pub fn read_text(mut self) -> io::Result<String> {
        let mut bytes = Vec::new();
        (&mut self).take(MAX_TEXT_LEN + 1).read_to_end(&mut bytes)?;
        if bytes.len() as u64 > MAX_TEXT_LEN {
            return Err(ArchiveError::TextTooLarge(self.name).into_io());
        }

        String::from_utf8(bytes).map_err(|_| ArchiveError::InvalidText(self.name).into_io())
    }

    /// Discards the rest of the entry, returning how many bytes were skipped.
    pub fn skip(self) -> io::Result<u64> {
        self.archive.skip_current()
    }
}

impl<R: Read> Read for ArchiveEntry<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.archive.read_content(buf)
    }
}
