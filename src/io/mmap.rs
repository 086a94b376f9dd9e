use std::{fs::File, path::Path, sync::Arc};

use memmap2::Mmap;

use crate::{BbiError, ByteSource, Result};

/// Memory-mapped byte source.
///
/// Reads are bounds-checked copies out of the map and take no lock, so clones
/// of one `MmapSource` can serve many threads at once.
#[derive(Clone)]
pub struct MmapSource {
    map: Arc<Mmap>,
}
#[allow(clippy::len_without_is_empty)]
impl MmapSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let map = unsafe { Arc::new(Mmap::map(&file)?) };
        Ok(Self { map })
    }

    /// Size of the mapped file in bytes.
    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    /// Borrows `len` mapped bytes at `offset`.
    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let truncated = || BbiError::TruncatedRead { offset, len };
        let start = usize::try_from(offset).map_err(|_| truncated())?;
        let end = start.checked_add(len).ok_or_else(truncated)?;
        self.map.get(start..end).ok_or_else(truncated)
    }
}
impl ByteSource for MmapSource {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        buf.copy_from_slice(self.slice(offset, buf.len())?);
        Ok(())
    }
}
