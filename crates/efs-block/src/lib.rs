#![forbid(unsafe_code)]
//! Read-only block access over a raw flash image.
//!
//! The whole image is read into memory once; every later operation is a
//! bounds-checked slice over that immutable buffer. There is no cache and
//! no write path — forensic analysis never mutates the evidence.

use efs_error::{EfsError, Result};
use efs_types::{BlockIndex, Geometry};
use std::fs;
use std::path::Path;

/// Immutable flash image plus its validated geometry.
///
/// Invariant: `geometry.total_bytes() <= bytes.len()`, so every in-range
/// block read is infallible slicing.
#[derive(Debug, Clone)]
pub struct Image {
    bytes: Vec<u8>,
    geometry: Geometry,
}

impl Image {
    /// Wrap an in-memory buffer.
    ///
    /// Fails with `Geometry` when the declared geometry does not fit in
    /// the buffer. Trailing bytes beyond the last block are allowed (dump
    /// tools often pad) and simply never addressed.
    pub fn from_bytes(bytes: Vec<u8>, geometry: Geometry) -> Result<Self> {
        let total = geometry.total_bytes();
        let len = u64::try_from(bytes.len())
            .map_err(|_| EfsError::Geometry("image length overflows u64".to_owned()))?;
        if total > len {
            return Err(EfsError::Geometry(format!(
                "geometry needs {total} bytes but image holds {len}"
            )));
        }
        Ok(Self { bytes, geometry })
    }

    /// Read an image file in one pass and wrap it.
    pub fn load(path: impl AsRef<Path>, geometry: Geometry) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        Self::from_bytes(bytes, geometry)
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// The full raw buffer, for the hex-dump and search collaborators.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Fetch one block by index.
    ///
    /// Returns a `block_size`-long slice, or `OutOfRange` when `block`
    /// is at or beyond the block count.
    pub fn read_block(&self, block: BlockIndex) -> Result<&[u8]> {
        if !self.geometry.contains(block) {
            return Err(EfsError::OutOfRange {
                block: block.0,
                block_count: self.geometry.block_count,
            });
        }

        let block_size = self.geometry.block_size.as_usize();
        let offset = block
            .to_byte_offset(self.geometry.block_size)
            .and_then(|off| usize::try_from(off).ok())
            .ok_or_else(|| EfsError::Geometry("block offset overflows usize".to_owned()))?;
        Ok(&self.bytes[offset..offset + block_size])
    }
}
