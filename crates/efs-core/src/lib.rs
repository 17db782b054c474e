#![forbid(unsafe_code)]
//! EmberFS core: directory resolution, CTZ file reconstruction, and the
//! best-effort tree walk.
//!
//! Layering follows the data flow on flash: `efs-block` hands out raw
//! blocks, `efs-ondisk` decodes them into commits and typed payloads, and
//! this crate applies policy — which block of a pair wins, how tag replay
//! produces a directory, how a file's skip-list is walked, and how damage
//! is confined to the branch it was found in.
//!
//! This crate is also the boundary where `efs-types::ParseError` converts
//! into the user-facing `efs-error::EfsError`; the parsing layer stays
//! independent of the error surface.

mod ctz;
mod report;
mod resolver;
mod walker;

pub use ctz::{ChainError, CtzFile, reconstruct_ctz};
pub use report::{DirNode, FileNode, FsReport, Node, RecoveryStatus, WalkStats, Warning};
pub use resolver::{DirEntry, EntryKind, EntryStruct, ResolvedDir, resolve_dir};
pub use walker::{PairTracker, Visit, WalkLimits, WalkOptions, walk_tree};

use efs_block::Image;
use efs_error::{EfsError, Result};
use efs_ondisk::probe_superblock;
use efs_types::Geometry;
use std::path::Path;
use tracing::warn;

/// Wrap image bytes with explicit or probed geometry.
///
/// When no geometry is supplied, the image's own superblock provides it;
/// a probed block count larger than the file is clamped with a warning,
/// since truncated dumps are everyday forensic input. With neither a
/// usable superblock nor explicit values, analysis cannot start.
pub fn image_from_bytes(bytes: Vec<u8>, geometry: Option<Geometry>) -> Result<Image> {
    let geometry = match geometry {
        Some(geometry) => geometry,
        None => {
            let superblock = probe_superblock(&bytes)
                .map_err(|err| EfsError::Parse(err.to_string()))?
                .ok_or_else(|| {
                    EfsError::Parse(
                        "no superblock found; supply block size and block count".to_owned(),
                    )
                })?;
            let mut geometry = superblock
                .geometry()
                .map_err(|err| EfsError::Geometry(err.to_string()))?;

            let available = bytes.len() as u64 / u64::from(geometry.block_size.get());
            if available < u64::from(geometry.block_count) {
                warn!(
                    declared = geometry.block_count,
                    available, "image shorter than superblock geometry, clamping"
                );
                geometry.block_count = u32::try_from(available)
                    .map_err(|_| EfsError::Geometry("block count overflows u32".to_owned()))?;
                if geometry.block_count == 0 {
                    return Err(EfsError::Geometry(
                        "image too short for even one block".to_owned(),
                    ));
                }
            }
            geometry
        }
    };
    Image::from_bytes(bytes, geometry)
}

/// Read an image file and wrap it, probing geometry when none is given.
pub fn load_image(path: impl AsRef<Path>, geometry: Option<Geometry>) -> Result<Image> {
    let bytes = std::fs::read(path.as_ref())?;
    image_from_bytes(bytes, geometry)
}

/// Walk an image with default options (root at blocks {0, 1}).
#[must_use]
pub fn analyze(image: &Image) -> FsReport {
    walk_tree(image, &WalkOptions::default())
}
