use efs_block::Image;
use efs_ondisk::CtzPtr;
use efs_types::{BlockIndex, ctz_data_offset, ctz_index, read_le_u32};
use std::collections::HashSet;
use thiserror::Error;

/// Why a CTZ skip-list walk could not complete.
///
/// Both cases degrade the affected file to partial/anomalous status; they
/// never abort the surrounding tree walk.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("truncated chain at block {block}: {detail}")]
    Truncated { block: u32, detail: String },
    #[error("cycle in chain: block {block} revisited")]
    Cycle { block: u32 },
}

/// A fully reconstructed CTZ file: ordered data blocks plus trimmed bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtzFile {
    /// Physical blocks in forward (list index 0 → head) order.
    pub blocks: Vec<BlockIndex>,
    pub content: Vec<u8>,
}

/// Walk a file's CTZ skip-list backward from its head and reassemble the
/// content in forward order.
///
/// The walk follows pointer 0 of each block (one step back per hop, as a
/// linear reconstruction wants) until list index 0. Every hop is bounds
/// checked against the image and against a visited set, so a corrupted
/// pointer yields [`ChainError`], never a hang or a crash.
pub fn reconstruct_ctz(image: &Image, ptr: CtzPtr) -> Result<CtzFile, ChainError> {
    if ptr.size == 0 {
        return Ok(CtzFile {
            blocks: Vec::new(),
            content: Vec::new(),
        });
    }

    let geometry = image.geometry();
    let block_size = geometry.block_size;
    let (head_index, last_off) = ctz_index(block_size, ptr.size - 1);

    let mut visited = HashSet::new();
    let mut reversed = Vec::new();
    let mut current = ptr.head;

    // Backward pass: head has the highest list index; pointer 0 always
    // names the previous list block.
    for list_index in (0..=head_index).rev() {
        if !geometry.contains(current) {
            return Err(ChainError::Truncated {
                block: current.0,
                detail: format!(
                    "pointer outside image (block_count={})",
                    geometry.block_count
                ),
            });
        }
        if !visited.insert(current.0) {
            return Err(ChainError::Cycle { block: current.0 });
        }
        reversed.push(current);

        if list_index > 0 {
            let block = image.read_block(current).map_err(|err| ChainError::Truncated {
                block: current.0,
                detail: err.to_string(),
            })?;
            let next = read_le_u32(block, 0).map_err(|err| ChainError::Truncated {
                block: current.0,
                detail: err.to_string(),
            })?;
            current = BlockIndex(next);
        }
    }
    reversed.reverse();
    let blocks = reversed;

    // Forward pass: every block contributes its full data capacity except
    // the head, which is trimmed to the remaining byte count.
    let mut content = Vec::with_capacity(ptr.size as usize);
    for (position, block) in blocks.iter().enumerate() {
        let list_index = u32::try_from(position).map_err(|_| ChainError::Truncated {
            block: block.0,
            detail: "list index overflows u32".to_owned(),
        })?;
        let bytes = image.read_block(*block).map_err(|err| ChainError::Truncated {
            block: block.0,
            detail: err.to_string(),
        })?;

        let data_off = ctz_data_offset(list_index);
        let end = if list_index == head_index {
            last_off as usize + 1
        } else {
            block_size.as_usize()
        };
        if end < data_off || end > bytes.len() {
            return Err(ChainError::Truncated {
                block: block.0,
                detail: "declared size inconsistent with block layout".to_owned(),
            });
        }
        content.extend_from_slice(&bytes[data_off..end]);
    }

    Ok(CtzFile { blocks, content })
}
