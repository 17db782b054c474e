#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// On-disk format version this tool is pinned to (LittleFS 2.0).
pub const LFS_DISK_VERSION: u32 = 0x0002_0000;

/// Magic string carried by the superblock's name tag.
pub const LFS_MAGIC: &[u8; 8] = b"littlefs";

/// Smallest block size that can hold a revision word plus one commit.
///
/// The format minimum is 104 bytes; block sizes are powers of two, so the
/// effective floor is 128.
pub const MIN_BLOCK_SIZE: u32 = 128;

/// Largest block size accepted (1 GiB, far beyond any real flash part).
pub const MAX_BLOCK_SIZE: u32 = 1 << 30;

/// Byte length of the revision count at the start of each metadata block.
pub const REVISION_SIZE: usize = 4;

/// Byte length of an encoded tag word.
pub const TAG_SIZE: usize = 4;

// ── Block addressing ────────────────────────────────────────────────────────

/// Physical block index within an image. LittleFS block pointers are 32-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u32);

impl BlockIndex {
    /// The all-ones value used on flash for "no block".
    pub const NULL: Self = Self(0xFFFF_FFFF);

    #[must_use]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// Byte offset of this block for a given block size.
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self, block_size: BlockSize) -> Option<u64> {
        u64::from(self.0).checked_mul(u64::from(block_size.get()))
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two blocks backing one directory's metadata log.
///
/// Order is as found on flash; the authoritative block is decided by
/// revision comparison, not position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataPair {
    pub a: BlockIndex,
    pub b: BlockIndex,
}

impl MetadataPair {
    #[must_use]
    pub fn new(a: BlockIndex, b: BlockIndex) -> Self {
        Self { a, b }
    }

    /// True when either half is the on-flash null pointer.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.a.is_null() || self.b.is_null()
    }

    /// Order-independent identity, for visited-set keys.
    #[must_use]
    pub fn normalized(self) -> (u32, u32) {
        if self.a.0 <= self.b.0 {
            (self.a.0, self.b.0)
        } else {
            (self.b.0, self.a.0)
        }
    }
}

impl fmt::Display for MetadataPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}}}", self.a, self.b)
    }
}

/// Validated block size (power of two in [`MIN_BLOCK_SIZE`], [`MAX_BLOCK_SIZE`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a power of two in 128..=1073741824",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Image geometry: block size plus block count.
///
/// Geometry is always supplied or probed, never assumed; flash parts vary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub block_size: BlockSize,
    pub block_count: u32,
}

impl Geometry {
    pub fn new(block_size: u32, block_count: u32) -> Result<Self, ParseError> {
        let block_size = BlockSize::new(block_size)?;
        if block_count == 0 {
            return Err(ParseError::InvalidField {
                field: "block_count",
                reason: "must be greater than zero",
            });
        }
        Ok(Self {
            block_size,
            block_count,
        })
    }

    /// Total byte span of the addressable blocks.
    #[must_use]
    pub fn total_bytes(self) -> u64 {
        u64::from(self.block_size.get()) * u64::from(self.block_count)
    }

    #[must_use]
    pub fn contains(self, block: BlockIndex) -> bool {
        block.0 < self.block_count
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} blocks x {} bytes", self.block_count, self.block_size)
    }
}

// ── Revision counts ─────────────────────────────────────────────────────────

/// True when revision `a` is strictly newer than revision `b`.
///
/// Revision counts wrap, so the comparison is modular: `a` is newer iff
/// `(a - b) mod 2^32` lies in (0, 2^31). Under this rule 0x0000_0001 is
/// newer than 0xFFFF_FFFF, and not the other way around.
#[must_use]
pub fn revision_newer(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000_0000
}

// ── Tag model ───────────────────────────────────────────────────────────────

/// Id field value meaning "no id" (CRC and tail tags).
pub const TAG_ID_NONE: u16 = 0x3FF;

/// Size field value meaning "no payload".
pub const TAG_SIZE_NONE: u16 = 0x3FF;

// 11-bit tag types. The high 3 bits are the supertype, the low 8 the chunk.
pub const TYPE1_NAME: u16 = 0x000;
pub const TYPE_REG: u16 = 0x001;
pub const TYPE_DIR: u16 = 0x002;
pub const TYPE_SUPERBLOCK: u16 = 0x0FF;
pub const TYPE1_STRUCT: u16 = 0x200;
pub const TYPE_DIRSTRUCT: u16 = 0x200;
pub const TYPE_INLINESTRUCT: u16 = 0x201;
pub const TYPE_CTZSTRUCT: u16 = 0x202;
pub const TYPE1_USERATTR: u16 = 0x300;
pub const TYPE1_SPLICE: u16 = 0x400;
pub const TYPE_CREATE: u16 = 0x401;
pub const TYPE_DELETE: u16 = 0x4FF;
pub const TYPE1_CRC: u16 = 0x500;
pub const TYPE1_TAIL: u16 = 0x600;
pub const TYPE_SOFTTAIL: u16 = 0x600;
pub const TYPE_HARDTAIL: u16 = 0x601;
pub const TYPE1_GLOBALS: u16 = 0x700;

/// One decoded 32-bit tag word.
///
/// Layout after XOR-delta decoding: bit 31 is the invalid marker, bits
/// 30..20 the 11-bit type, bits 19..10 the 10-bit id, bits 9..0 the 10-bit
/// payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag(pub u32);

impl Tag {
    /// Assemble a tag word from its fields (invalid marker clear).
    ///
    /// `id` of [`TAG_ID_NONE`] and `size` of [`TAG_SIZE_NONE`] encode the
    /// respective absent states.
    #[must_use]
    pub fn from_fields(type3: u16, id: u16, size: u16) -> Self {
        Self(
            (u32::from(type3) & 0x7FF) << 20
                | (u32::from(id) & 0x3FF) << 10
                | (u32::from(size) & 0x3FF),
        )
    }

    /// False when the invalid marker is set; an invalid tag ends the
    /// readable portion of a block's log.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 & 0x8000_0000 == 0
    }

    /// Full 11-bit type.
    #[must_use]
    pub fn type3(self) -> u16 {
        ((self.0 >> 20) & 0x7FF) as u16
    }

    /// 3-bit supertype, left in its `0xN00` position.
    #[must_use]
    pub fn type1(self) -> u16 {
        self.type3() & 0x700
    }

    /// Low 8 bits of the type.
    #[must_use]
    pub fn chunk(self) -> u8 {
        (self.type3() & 0xFF) as u8
    }

    /// Slot id, or `None` for id-less tags.
    #[must_use]
    pub fn id(self) -> Option<u16> {
        let raw = ((self.0 >> 10) & 0x3FF) as u16;
        if raw == TAG_ID_NONE { None } else { Some(raw) }
    }

    /// Payload length in bytes; the absent-payload encoding reads as zero.
    #[must_use]
    pub fn payload_len(self) -> usize {
        let raw = self.0 & 0x3FF;
        if raw == u32::from(TAG_SIZE_NONE) {
            0
        } else {
            raw as usize
        }
    }

    /// Total on-disk footprint: tag word plus payload.
    #[must_use]
    pub fn disk_len(self) -> usize {
        TAG_SIZE + self.payload_len()
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tag(type={:#05x}, id={}, len={})",
            self.type3(),
            self.id().map_or_else(|| "-".to_owned(), |id| id.to_string()),
            self.payload_len()
        )
    }
}

// ── Commit checksum ─────────────────────────────────────────────────────────

/// Advance the commit log's running CRC-32 over `data`.
///
/// The log uses the reflected CRC-32 register directly: seed 0xFFFF_FFFF,
/// no final inversion. `crc32fast` tracks the post-inversion value, so the
/// register is mapped through a complement on both sides.
#[must_use]
pub fn commit_crc(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(!seed);
    hasher.update(data);
    !hasher.finalize()
}

/// Seed for a fresh commit checksum (erased-flash register state).
pub const COMMIT_CRC_SEED: u32 = 0xFFFF_FFFF;

// ── CTZ skip-list math ──────────────────────────────────────────────────────

/// Number of back-pointers stored at the start of CTZ list block `n`.
///
/// Block 0 is pure data; block `n >= 1` starts with `ctz(n) + 1` pointers.
#[must_use]
pub fn ctz_pointer_count(n: u32) -> u32 {
    if n == 0 { 0 } else { n.trailing_zeros() + 1 }
}

/// Byte offset of file data within CTZ list block `n`.
#[must_use]
pub fn ctz_data_offset(n: u32) -> usize {
    ctz_pointer_count(n) as usize * 4
}

/// File-content capacity of CTZ list block `n`.
#[must_use]
pub fn ctz_block_capacity(block_size: BlockSize, n: u32) -> usize {
    block_size.as_usize() - ctz_data_offset(n)
}

/// Locate the CTZ list block holding file byte `byte_off`.
///
/// Returns `(list_index, offset_within_block)`; the in-block offset counts
/// from the block start, so it lands past the pointer region for `n >= 1`.
/// This is the popcount form fixed by disk version 2.0.
#[must_use]
pub fn ctz_index(block_size: BlockSize, byte_off: u32) -> (u32, u32) {
    let b = block_size.get() - 2 * 4;
    let i = byte_off / b;
    if i == 0 {
        return (0, byte_off);
    }
    let i = (byte_off - 4 * ((i - 1).count_ones() + 2)) / b;
    let off = byte_off - b * i - 4 * i.count_ones();
    (i, off)
}

// ── Parse errors and byte helpers ───────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic {
        expected: &'static str,
        actual: String,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(128).is_ok());
        assert!(BlockSize::new(512).is_ok());
        assert!(BlockSize::new(4096).is_ok());

        // Too small, even though a power of two.
        assert!(BlockSize::new(64).is_err());
        // Not a power of two (the format minimum before rounding).
        assert!(BlockSize::new(104).is_err());
        assert!(BlockSize::new(0).is_err());
    }

    #[test]
    fn geometry_validation() {
        let geo = Geometry::new(512, 128).expect("valid geometry");
        assert_eq!(geo.total_bytes(), 65536);
        assert!(geo.contains(BlockIndex(127)));
        assert!(!geo.contains(BlockIndex(128)));

        assert!(Geometry::new(512, 0).is_err());
        assert!(Geometry::new(100, 128).is_err());
    }

    #[test]
    fn revision_comparison_across_wraparound() {
        // Plain ordering.
        assert!(revision_newer(5, 4));
        assert!(!revision_newer(4, 5));
        assert!(!revision_newer(7, 7));

        // Wraparound: 0x0000_0001 superseded 0xFFFF_FFFF, not vice versa.
        assert!(revision_newer(0x0000_0001, 0xFFFF_FFFF));
        assert!(!revision_newer(0xFFFF_FFFF, 0x0000_0001));

        // Exactly half the ring apart is "not newer" in both directions is
        // impossible; the comparator must stay antisymmetric elsewhere.
        assert!(revision_newer(0x8000_0000, 0x0000_0001));
        assert!(!revision_newer(0x0000_0001, 0x8000_0000));
    }

    #[test]
    fn tag_field_extraction() {
        let tag = Tag::from_fields(TYPE_CREATE, 3, 0);
        assert!(tag.is_valid());
        assert_eq!(tag.type3(), TYPE_CREATE);
        assert_eq!(tag.type1(), TYPE1_SPLICE);
        assert_eq!(tag.chunk(), 0x01);
        assert_eq!(tag.id(), Some(3));
        assert_eq!(tag.payload_len(), 0);
        assert_eq!(tag.disk_len(), 4);

        let name = Tag::from_fields(TYPE_REG, 0, 9);
        assert_eq!(name.type1(), TYPE1_NAME);
        assert_eq!(name.payload_len(), 9);
        assert_eq!(name.disk_len(), 13);
    }

    #[test]
    fn tag_absent_id_and_size() {
        let crc = Tag::from_fields(TYPE1_CRC, TAG_ID_NONE, 4);
        assert_eq!(crc.id(), None);
        assert_eq!(crc.payload_len(), 4);

        let delete = Tag::from_fields(TYPE_DELETE, 2, TAG_SIZE_NONE);
        assert_eq!(delete.id(), Some(2));
        assert_eq!(delete.payload_len(), 0);
        assert_eq!(delete.disk_len(), 4);
    }

    #[test]
    fn tag_invalid_marker() {
        let tag = Tag(0x8000_0000 | Tag::from_fields(TYPE_REG, 0, 4).0);
        assert!(!tag.is_valid());
        assert!(Tag(0x0000_0000).is_valid());
    }

    #[test]
    fn commit_crc_register_semantics() {
        // Seeding with the erased-flash register and hashing nothing is a
        // fixed point.
        assert_eq!(commit_crc(COMMIT_CRC_SEED, &[]), COMMIT_CRC_SEED);

        // The register is the complement of the standard CRC-32.
        let data = b"littlefs";
        let standard = crc32fast::hash(data);
        assert_eq!(commit_crc(COMMIT_CRC_SEED, data), !standard);

        // Chaining is associative with splitting the input.
        let split = commit_crc(commit_crc(COMMIT_CRC_SEED, b"little"), b"fs");
        assert_eq!(split, commit_crc(COMMIT_CRC_SEED, data));
    }

    #[test]
    fn ctz_pointer_counts() {
        assert_eq!(ctz_pointer_count(0), 0);
        assert_eq!(ctz_pointer_count(1), 1);
        assert_eq!(ctz_pointer_count(2), 2);
        assert_eq!(ctz_pointer_count(3), 1);
        assert_eq!(ctz_pointer_count(4), 3);
        assert_eq!(ctz_pointer_count(8), 4);

        assert_eq!(ctz_data_offset(0), 0);
        assert_eq!(ctz_data_offset(4), 12);
    }

    #[test]
    fn ctz_index_round_trips_capacities() {
        let bs = BlockSize::new(512).expect("block size");

        // Walk a simulated file byte-by-byte and confirm the index formula
        // agrees with summed per-block capacities.
        let mut index = 0_u32;
        let mut used = 0_usize;
        for byte in 0_u32..5000 {
            if used == ctz_block_capacity(bs, index) {
                index += 1;
                used = 0;
            }
            let (i, off) = ctz_index(bs, byte);
            assert_eq!(i, index, "byte {byte}");
            assert_eq!(off as usize, ctz_data_offset(index) + used, "byte {byte}");
            used += 1;
        }
    }

    #[test]
    fn metadata_pair_identity() {
        let pair = MetadataPair::new(BlockIndex(7), BlockIndex(3));
        assert_eq!(pair.normalized(), (3, 7));
        assert_eq!(
            pair.normalized(),
            MetadataPair::new(BlockIndex(3), BlockIndex(7)).normalized()
        );
        assert!(!pair.is_null());
        assert!(MetadataPair::new(BlockIndex::NULL, BlockIndex(1)).is_null());
    }

    #[test]
    fn read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x00, 0x00, 0xDE, 0xAD, 0xBE, 0xEF];
        assert_eq!(read_le_u32(&bytes, 0).expect("le"), 0x1234);
        assert_eq!(read_be_u32(&bytes, 4).expect("be"), 0xDEAD_BEEF);
        assert!(read_le_u32(&bytes, 6).is_err());
        assert_eq!(read_fixed::<4>(&bytes, 4).expect("fixed"), [0xDE, 0xAD, 0xBE, 0xEF]);
    }
}
