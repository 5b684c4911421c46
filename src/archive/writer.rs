use std::io::{self, Read, Write};

use super::{
    COPY_BUFFER_LEN, CURRENT_VERSION, END_MARKER, EntryKind, MAGIC, MAX_CHUNK_LEN, validate_name,
};
use crate::error::ArchiveError;

/// Writes entries into a sink in a single forward pass.
pub struct ArchiveWriter<W: Write> {
    inner: W,
    seen_blob: bool,
}

impl<W: Write> ArchiveWriter<W> {
    /// Writes the container header and returns a writer ready for entries.
    pub fn begin(mut inner: W) -> io::Result<Self> {
        inner.write_all(MAGIC)?;
        inner.write_all(&[CURRENT_VERSION])?;
        Ok(Self {
            inner,
            seen_blob: false,
        })
    }

    fn write_header(&mut self, kind: EntryKind, name: &str) -> io::Result<()> {
        validate_name(name).map_err(ArchiveError::into_io)?;

        self.inner.write_all(&[kind.to_byte()])?;
        self.inner.write_all(&(name.len() as u16).to_le_bytes())?;
        self.inner.write_all(name.as_bytes())
    }

    fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.inner.write_all(bytes)
    }

    fn end_entry(&mut self) -> io::Result<()> {
        self.inner.write_all(&0u32.to_le_bytes())
    }

    /// Writes one record collection entry.
    ///
    /// # Errors
    ///
    /// Fails with [`ArchiveError::OutOfOrder`] once a blob has been written.
    pub fn write_record_collection(&mut self, name: &str, text: &str) -> io::Result<()> {
        if self.seen_blob {
            return Err(ArchiveError::OutOfOrder(name.to_string()).into_io());
        }
        self.write_header(EntryKind::RecordCollection, name)?;
        for chunk in text.as_bytes().chunks(MAX_CHUNK_LEN as usize) {
            self.write_chunk(chunk)?;
        }
        self.end_entry()
    }

    /// Copies `source` into one blob entry until it is exhausted.
    ///
    /// Returns the number of content bytes written. A read error leaves the
    /// entry unterminated; the archive is unusable afterwards.
    pub fn write_blob<R: Read + ?Sized>(&mut self, name: &str, source: &mut R) -> io::Result<u64> {
        self.write_header(EntryKind::Blob, name)?;
        self.seen_blob = true;

        let mut buf = [0u8; COPY_BUFFER_LEN];
        let mut total = 0u64;
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.write_chunk(&buf[..n])?;
            total += n as u64;
        }

        self.end_entry()?;
        Ok(total)
    }

    /// Writes the end marker and returns the underlying sink.
    pub fn close(mut self) -> io::Result<W> {
        self.inner.write_all(&[END_MARKER])?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}
