use crate::log::{BlockLog, decode_block};
use efs_types::{
    BlockIndex, Geometry, LFS_DISK_VERSION, LFS_MAGIC, MetadataPair, ParseError, TYPE_INLINESTRUCT,
    TYPE_SUPERBLOCK, ensure_slice, read_le_u32,
};
use serde::{Deserialize, Serialize};

/// How many leading bytes of an image the superblock probe may scan.
///
/// The superblock entry sits in the first commit of block 0, well inside
/// this window for every real geometry; the cap just keeps the probe from
/// chewing through a multi-gigabyte dump when block 0 is trashed.
const PROBE_WINDOW: usize = 64 * 1024;

/// Payload of a CTZ struct tag: skip-list head plus file size.
///
/// `head` is the *last* list block; reconstruction walks backward from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtzPtr {
    pub head: BlockIndex,
    pub size: u32,
}

/// Parse an 8-byte metadata-pair payload (dir struct or tail tag).
pub fn parse_pair_payload(block: &[u8], offset: usize) -> Result<MetadataPair, ParseError> {
    let a = read_le_u32(block, offset)?;
    let b = read_le_u32(block, offset + 4)?;
    Ok(MetadataPair::new(BlockIndex(a), BlockIndex(b)))
}

/// Parse an 8-byte CTZ struct payload.
pub fn parse_ctz_payload(block: &[u8], offset: usize) -> Result<CtzPtr, ParseError> {
    let head = read_le_u32(block, offset)?;
    let size = read_le_u32(block, offset + 4)?;
    Ok(CtzPtr {
        head: BlockIndex(head),
        size,
    })
}

/// Decode a name tag's payload.
///
/// Names on healthy images are UTF-8; on damaged flash they may not be,
/// and a forensic listing still has to show something, so the conversion
/// is lossy rather than failing.
pub fn parse_name_payload(block: &[u8], offset: usize, len: usize) -> Result<String, ParseError> {
    let bytes = ensure_slice(block, offset, len)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// The superblock entry's inline payload: format version, geometry, and
/// size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub version: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub name_max: u32,
    pub file_max: u32,
    pub attr_max: u32,
}

impl Superblock {
    /// Parse the six-word inline payload.
    ///
    /// Only the major version is enforced; minor revisions of format 2
    /// stay readable.
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let version = read_le_u32(payload, 0)?;
        if version >> 16 != LFS_DISK_VERSION >> 16 {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported major disk version (expected 2.x)",
            });
        }
        Ok(Self {
            version,
            block_size: read_le_u32(payload, 4)?,
            block_count: read_le_u32(payload, 8)?,
            name_max: read_le_u32(payload, 12)?,
            file_max: read_le_u32(payload, 16)?,
            attr_max: read_le_u32(payload, 20)?,
        })
    }

    /// Geometry as declared by the superblock.
    pub fn geometry(&self) -> Result<Geometry, ParseError> {
        Geometry::new(self.block_size, self.block_count)
    }

    /// Human-readable `major.minor` form of the version word.
    #[must_use]
    pub fn version_string(&self) -> String {
        format!("{}.{}", self.version >> 16, self.version & 0xFFFF)
    }
}

/// Find the superblock entry in a decoded block log.
///
/// Looks for a SUPERBLOCK name tag, checks its magic, and parses the
/// inline struct committed for the same id. Returns `Ok(None)` when the
/// log simply has no superblock entry; magic or payload violations are
/// reported as errors because they indicate a block that claims to be a
/// superblock and lies.
pub fn find_superblock(log: &BlockLog, block: &[u8]) -> Result<Option<Superblock>, ParseError> {
    let mut super_id = None;
    for commit in &log.commits {
        for entry in &commit.tags {
            if entry.tag.type3() == TYPE_SUPERBLOCK {
                let name = entry.payload(block);
                if name != LFS_MAGIC {
                    return Err(ParseError::InvalidMagic {
                        expected: "littlefs",
                        actual: String::from_utf8_lossy(name).into_owned(),
                    });
                }
                super_id = entry.tag.id();
            }
        }
    }
    let Some(super_id) = super_id else {
        return Ok(None);
    };

    // The inline struct may land in the same commit or a later one; the
    // last write wins, as everywhere in the log.
    let mut found = None;
    for commit in &log.commits {
        for entry in &commit.tags {
            if entry.tag.type3() == TYPE_INLINESTRUCT && entry.tag.id() == Some(super_id) {
                found = Some(Superblock::parse(entry.payload(block))?);
            }
        }
    }
    Ok(found)
}

/// Probe an image's leading bytes for the self-describing superblock.
///
/// Geometry varies per device and must never be assumed; when the caller
/// does not supply it, this reads it from the image itself. The probe
/// decodes the start of the image as a metadata block — commit checksums
/// do not depend on the block size, so this works before the geometry is
/// known.
pub fn probe_superblock(image: &[u8]) -> Result<Option<Superblock>, ParseError> {
    let window = &image[..image.len().min(PROBE_WINDOW)];
    let log = decode_block(window)?;
    find_superblock(&log, window)
}
