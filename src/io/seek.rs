use std::{
    fs::File,
    io::{BufReader, ErrorKind, Read, Seek, SeekFrom},
    path::Path,
    sync::{Mutex, PoisonError},
};

use crate::{BbiError, ByteSource, Result};

/// Byte source over any `Read + Seek` handle.
///
/// Every seek+read pair runs under one mutex, so reads through a shared handle
/// are serialized. Open separate handles for parallel I/O on the same file.
///
/// # Examples
///
/// ```rust
/// use bbix::{ByteSource, SeekSource};
/// use std::io::Cursor;
///
/// # fn main() -> bbix::Result<()> {
/// let source = SeekSource::new(Cursor::new(b"chr11\0chr12".to_vec()));
/// let mut buf = [0u8; 5];
/// source.read_exact_at(6, &mut buf)?;
/// assert_eq!(&buf, b"chr12");
/// # Ok(())
/// # }
/// ```
pub struct SeekSource<R> {
    inner: Mutex<R>,
}
impl<R: Read + Seek + Send> SeekSource<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
impl SeekSource<BufReader<File>> {
    /// Opens a file with buffered, serialized reads.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path).map(BufReader::new)?;
        Ok(Self::new(file))
    }
}
impl<R: Read + Seek + Send> ByteSource for SeekSource<R> {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .seek(SeekFrom::Start(offset))
            .map_err(|source| BbiError::Seek { offset, source })?;
        inner.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => BbiError::TruncatedRead { offset, len },
            _ => BbiError::Io(e),
        })
    }
}
