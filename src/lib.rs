//! # bbix - Indexed Range Queries over bigBed and bigWig Files
//!
//! `bbix` is a Rust library for answering genomic range queries against the
//! indexed binary formats bigBed and bigWig. A file is opened once; each query
//! then walks the on-disk indices and decodes only the data blocks that can
//! hold matching records. An optional tile cache keeps recently used regions
//! in memory and can be shared between threads.
//!
//! ## Format Overview
//!
//! A bbi file is a set of sections linked by absolute file offsets:
//!
//! ### Main header (64 bytes)
//! - Magic number: `0x8789F2EB` (bigBed) or `0x888FFC26` (bigWig), written in
//!   the byte order of the machine that produced the file
//! - Offsets of the chromosome tree, the data, and the data index
//! - `uncompressBufSize`: non-zero when data blocks are zlib-compressed
//!
//! ### Chromosome B+ tree (magic `0x78CA8C91`)
//! - Maps a NUL-padded chromosome name to its numeric id and length
//!
//! ### Data index R-tree (magic `0x2468ACE0`)
//! - Maps (chromosome, base) intervals to the data blocks that cover them
//!
//! ### Data blocks
//! - bigBed: rows of `chromId, start, end` followed by NUL-terminated BED text
//! - bigWig: sections of bedGraph, variableStep, or fixedStep items
//!
//! ## Basic Usage
//!
//! ### Querying a file
//!
//! ```rust,no_run
//! use bbix::{BbiReader, BedLayout, RecordFormat};
//!
//! # fn main() -> bbix::Result<()> {
//! let reader = BbiReader::from_path("methylation.bb")?
//!     .with_format(RecordFormat::Bed(BedLayout::methylation()));
//!
//! println!("{:?} with {} chromosomes", reader.kind(), reader.chroms().len());
//!
//! let records: Vec<_> = reader
//!     .query("chr11", 10_001_000, 10_002_000)?
//!     .collect::<Result<_, _>>()?;
//! for record in &records {
//!     println!("{}\t{}\t{}\t{:?}", record.start, record.end, record.score, record.count);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Caching tiles between queries
//!
//! ```rust,no_run
//! use bbix::{BbiReader, RangeQuery, TileCache, TileCacheConfig};
//! use std::sync::Arc;
//! use std::thread;
//!
//! # fn main() -> bbix::Result<()> {
//! let reader = BbiReader::from_path("signal.bw")?;
//! let cache = Arc::new(TileCache::new(reader, TileCacheConfig::default())?);
//!
//! let handles: Vec<_> = (0..4u32)
//!     .map(|i| {
//!         let cache = Arc::clone(&cache);
//!         thread::spawn(move || -> bbix::Result<usize> {
//!             let start = i * 50_000;
//!             Ok(cache.query("chr1", start, start + 200_000)?.count())
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     println!("{} records", handle.join().expect("query thread panicked")?);
//! }
//! println!("{:?}", cache.stats());
//! # Ok(())
//! # }
//! ```
//!
//! ## Byte Sources
//!
//! Files are read through the [`ByteSource`] trait. [`MmapSource`] maps the
//! file and serves reads from many threads without locking; [`SeekSource`]
//! wraps any `Read + Seek` handle behind a mutex.
//!
//! ## Error Handling
//!
//! All fallible operations return `Result<T, BbiError>`:
//!
//! ```rust
//! use bbix::{BbiError, BbiReader, SeekSource};
//! use std::io::Cursor;
//!
//! # fn main() {
//! let source = SeekSource::new(Cursor::new(vec![0u8; 64]));
//!
//! match BbiReader::open(source) {
//!     Err(BbiError::InvalidMagic { expected, actual, .. }) => {
//!         println!("Not a bbi file: expected {:#x}, got {:#x}", expected, actual);
//!     }
//!     Err(e) => println!("Other error: {}", e),
//!     Ok(_) => unreachable!(),
//! }
//! # }
//! ```

mod cache;
mod constructs;
mod decode;
mod error;
mod index;
mod io;
mod query;

#[cfg(test)]
#[path = "../tests/common/mod.rs"]
mod fixture;

pub use cache::{CacheStats, TileCache, TileCacheConfig, TileRecords};
pub use constructs::{
    read_extra_indices, read_header, read_summary, read_zoom_headers, BPlusTreeHeader, BbiHeader,
    BedLayout, Endianness, ExtensionHeader, ExtraIndex, FileKind, RTreeHeader, Record,
    RecordFormat, SectionHeader, Strand, Summary, ZoomHeader, BBI_HEADER_SIZE, BIGBED_MAGIC,
    BIGWIG_MAGIC, BPLUS_TREE_HEADER_SIZE, BPLUS_TREE_MAGIC, RTREE_HEADER_SIZE, RTREE_MAGIC,
};
pub use decode::{BlockDecoder, DecodedBlock};
pub use error::{BbiError, Result};
pub use index::{BPlusTree, Block, ChromInfo, ChromTable, ChromTree, NameIndex, RTree};
pub use io::{BbiReader, ByteSource, MmapSource, Records, SeekSource};
pub use query::RangeQuery;
