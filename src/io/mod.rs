mod mmap;
mod reader;
mod seek;

pub use mmap::MmapSource;
pub use reader::{BbiReader, Records};
pub use seek::SeekSource;

use crate::Result;

/// Random-access byte source backing an open bbi file.
///
/// Implementations must make each `read_exact_at` call atomic with respect to
/// other callers of the same handle, so a single source can be shared by the
/// threads of a [`TileCache`](crate::TileCache).
pub trait ByteSource: Send + Sync {
    /// Fills `buf` with the bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`BbiError::TruncatedRead`](crate::BbiError::TruncatedRead) when
    /// the source ends first and [`BbiError::Seek`](crate::BbiError::Seek) when
    /// positioning fails.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

impl<T: ByteSource + ?Sized> ByteSource for &T {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

impl<T: ByteSource + ?Sized> ByteSource for std::sync::Arc<T> {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}
