//! Error handling for the bbix library.
//!
//! This module defines every error that can surface while opening a bbi file,
//! walking its indices, decoding data blocks, or filling the tile cache.
//!
//! Two outcomes are deliberately *not* errors: a section header whose magic
//! matches neither byte order (the section is treated as absent, see
//! [`read_header`](crate::read_header)) and a query on a chromosome that the
//! file does not contain (the query yields nothing).

use thiserror::Error;

/// A specialized `Result` type for bbix operations.
///
/// # Examples
///
/// ```rust
/// use bbix::{Result, TileCacheConfig};
///
/// fn small_cache() -> Result<TileCacheConfig> {
///     let config = TileCacheConfig::new(16, 1_000);
///     config.validate()?;
///     Ok(config)
/// }
/// # small_cache().unwrap();
/// ```
pub type Result<T> = std::result::Result<T, BbiError>;

/// Error types for bbix operations.
///
/// # Examples
///
/// ```rust
/// use bbix::{BbiError, BbiReader, SeekSource};
/// use std::io::Cursor;
///
/// // 64 zero bytes: long enough for a main header, but the magic is wrong
/// let source = SeekSource::new(Cursor::new(vec![0u8; 64]));
///
/// match BbiReader::open(source) {
///     Err(BbiError::InvalidMagic { section, actual, .. }) => {
///         println!("not a {section}: found {actual:#x}");
///     }
///     Err(e) => println!("other error: {e}"),
///     Ok(_) => unreachable!(),
/// }
/// ```
#[derive(Error, Debug)]
pub enum BbiError {
    /// I/O error from the underlying byte source.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The byte source ended before a read of `len` bytes at `offset` completed.
    #[error("Truncated read of {len} bytes at offset {offset}")]
    TruncatedRead { offset: u64, len: usize },

    /// Seeking the byte source to `offset` failed.
    #[error("Seek to offset {offset} failed")]
    Seek {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    /// A mandatory section header matched neither byte order of its magic.
    ///
    /// Optional sections never produce this error; their readers return
    /// `Ok(None)` instead.
    #[error("Invalid {section} magic at offset {offset}: expected ({expected:#x}), found ({actual:#x})")]
    InvalidMagic {
        section: &'static str,
        offset: u64,
        expected: u32,
        actual: u32,
    },

    /// An index tree is malformed at `offset`.
    ///
    /// Raised for nodes that exceed the declared fan-out, unordered keys,
    /// invalid leaf flags, cycles, or byte-order disagreement between sections.
    #[error("Structural corruption at offset {offset}: {reason}")]
    StructuralCorruption { offset: u64, reason: String },

    /// A data block cannot be decoded past the point of failure.
    #[error("Corrupt data block at offset {offset}: {reason}")]
    BlockCorruption { offset: u64, reason: String },

    /// A query range with `start > end`.
    #[error("Invalid range {start}-{end}: start must not exceed end")]
    InvalidRange { start: u32, end: u32 },

    /// A configuration value outside its valid domain.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The wrapped source failed while a tile was being fetched.
    ///
    /// The tile is not cached, so the next access retries the fetch.
    #[error("Failed to fetch tile {tile} of {chrom}")]
    TileFetch {
        chrom: String,
        tile: u64,
        #[source]
        source: Box<BbiError>,
    },
}

impl BbiError {
    pub(crate) fn structural(offset: u64, reason: impl Into<String>) -> Self {
        Self::StructuralCorruption {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn block(offset: u64, reason: impl Into<String>) -> Self {
        Self::BlockCorruption {
            offset,
            reason: reason.into(),
        }
    }
}
