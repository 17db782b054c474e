#![forbid(unsafe_code)]
//! Synthetic LittleFS v2.0 image construction for tests and benches.
//!
//! The builder is a deliberately small encoder: enough of the on-disk
//! format to produce checksum-valid commit logs, CTZ chains, and whole
//! images — and to break them precisely, one byte at a time, which is
//! what the decoder tests need. It is test tooling and panics on misuse
//! rather than returning errors.

use efs_block::Image;
use efs_ondisk::CtzPtr;
use efs_types::{
    BlockIndex, COMMIT_CRC_SEED, Geometry, LFS_DISK_VERSION, LFS_MAGIC, MetadataPair,
    TAG_ID_NONE, TYPE1_CRC, Tag, TYPE_CREATE, TYPE_CTZSTRUCT, TYPE_DELETE, TYPE_DIR,
    TYPE_DIRSTRUCT, TYPE_HARDTAIL, TYPE_INLINESTRUCT, TYPE_REG, TYPE_SOFTTAIL, TYPE_SUPERBLOCK,
    commit_crc, ctz_block_capacity, ctz_data_offset, ctz_pointer_count,
};

/// Encoder for one metadata block's commit log.
///
/// Mirrors the decoder's running state: XOR-delta tag encoding, the raw
/// running CRC, and the phase bit carried by a CRC tag's chunk field.
#[derive(Debug)]
pub struct MetaBuilder {
    bytes: Vec<u8>,
    ptag: u32,
    crc: u32,
}

impl MetaBuilder {
    #[must_use]
    pub fn new(revision: u32) -> Self {
        let bytes = revision.to_le_bytes().to_vec();
        let crc = commit_crc(COMMIT_CRC_SEED, &bytes);
        Self {
            bytes,
            ptag: 0xFFFF_FFFF,
            crc,
        }
    }

    /// Append an arbitrary tag with its payload.
    pub fn push(&mut self, tag: Tag, payload: &[u8]) {
        assert_eq!(
            tag.payload_len(),
            payload.len(),
            "tag length field disagrees with payload"
        );
        let raw = (tag.0 ^ self.ptag).to_be_bytes();
        self.ptag = tag.0;
        self.crc = commit_crc(self.crc, &raw);
        self.crc = commit_crc(self.crc, payload);
        self.bytes.extend_from_slice(&raw);
        self.bytes.extend_from_slice(payload);
    }

    pub fn push_create(&mut self, id: u16) {
        self.push(Tag::from_fields(TYPE_CREATE, id, 0), &[]);
    }

    pub fn push_delete(&mut self, id: u16) {
        self.push(Tag::from_fields(TYPE_DELETE, id, 0), &[]);
    }

    pub fn push_file_name(&mut self, id: u16, name: &str) {
        let len = u16::try_from(name.len()).expect("name fits tag length");
        self.push(Tag::from_fields(TYPE_REG, id, len), name.as_bytes());
    }

    pub fn push_dir_name(&mut self, id: u16, name: &str) {
        let len = u16::try_from(name.len()).expect("name fits tag length");
        self.push(Tag::from_fields(TYPE_DIR, id, len), name.as_bytes());
    }

    pub fn push_inline(&mut self, id: u16, data: &[u8]) {
        let len = u16::try_from(data.len()).expect("inline data fits tag length");
        self.push(Tag::from_fields(TYPE_INLINESTRUCT, id, len), data);
    }

    pub fn push_ctz(&mut self, id: u16, ptr: CtzPtr) {
        let mut payload = [0_u8; 8];
        payload[0..4].copy_from_slice(&ptr.head.0.to_le_bytes());
        payload[4..8].copy_from_slice(&ptr.size.to_le_bytes());
        self.push(Tag::from_fields(TYPE_CTZSTRUCT, id, 8), &payload);
    }

    pub fn push_dir_struct(&mut self, id: u16, pair: MetadataPair) {
        self.push(Tag::from_fields(TYPE_DIRSTRUCT, id, 8), &pair_payload(pair));
    }

    pub fn push_hard_tail(&mut self, pair: MetadataPair) {
        self.push(
            Tag::from_fields(TYPE_HARDTAIL, TAG_ID_NONE, 8),
            &pair_payload(pair),
        );
    }

    pub fn push_soft_tail(&mut self, pair: MetadataPair) {
        self.push(
            Tag::from_fields(TYPE_SOFTTAIL, TAG_ID_NONE, 8),
            &pair_payload(pair),
        );
    }

    /// The superblock entry: magic name plus the six-word inline struct.
    pub fn push_superblock_entry(&mut self, id: u16, geometry: Geometry) {
        self.push(Tag::from_fields(TYPE_SUPERBLOCK, id, 8), LFS_MAGIC);
        let mut payload = Vec::with_capacity(24);
        for word in [
            LFS_DISK_VERSION,
            geometry.block_size.get(),
            geometry.block_count,
            255,
            0x7FFF_FFFF,
            1022,
        ] {
            payload.extend_from_slice(&word.to_le_bytes());
        }
        self.push(Tag::from_fields(TYPE_INLINESTRUCT, id, 24), &payload);
    }

    /// Terminate the pending tags with a CRC tag (phase bit clear).
    pub fn commit(&mut self) {
        self.commit_with_chunk(0);
    }

    /// Terminate with a CRC tag carrying an explicit chunk byte; bit 0
    /// flips the valid-marker phase of everything after it.
    pub fn commit_with_chunk(&mut self, chunk: u8) {
        let tag = Tag::from_fields(TYPE1_CRC | u16::from(chunk), TAG_ID_NONE, 4);
        let raw = (tag.0 ^ self.ptag).to_be_bytes();
        self.ptag = tag.0;
        self.crc = commit_crc(self.crc, &raw);
        self.bytes.extend_from_slice(&raw);
        self.bytes.extend_from_slice(&self.crc.to_le_bytes());
        self.crc = COMMIT_CRC_SEED;
        self.ptag ^= u32::from(chunk & 1) << 31;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.len() <= 4
    }

    /// Pad to a full block with erased-flash bytes.
    #[must_use]
    pub fn finish(mut self, block_size: usize) -> Vec<u8> {
        assert!(
            self.bytes.len() <= block_size,
            "commit log overflows the block"
        );
        self.bytes.resize(block_size, 0xFF);
        self.bytes
    }
}

fn pair_payload(pair: MetadataPair) -> [u8; 8] {
    let mut payload = [0_u8; 8];
    payload[0..4].copy_from_slice(&pair.a.0.to_le_bytes());
    payload[4..8].copy_from_slice(&pair.b.0.to_le_bytes());
    payload
}

/// Whole-image builder: erased flash, sequential allocation, and helpers
/// for the structures the tests exercise.
#[derive(Debug)]
pub struct ImageBuilder {
    geometry: Geometry,
    bytes: Vec<u8>,
    next_free: u32,
}

impl ImageBuilder {
    /// A fully erased image (0xFF) with blocks 0 and 1 reserved for the
    /// root pair.
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        let total = usize::try_from(geometry.total_bytes()).expect("image fits memory");
        Self {
            geometry,
            bytes: vec![0xFF; total],
            next_free: 2,
        }
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Claim the next unused block.
    pub fn alloc(&mut self) -> BlockIndex {
        let block = BlockIndex(self.next_free);
        assert!(
            self.geometry.contains(block),
            "image out of blocks (count={})",
            self.geometry.block_count
        );
        self.next_free += 1;
        block
    }

    pub fn alloc_pair(&mut self) -> MetadataPair {
        MetadataPair::new(self.alloc(), self.alloc())
    }

    /// Overwrite bytes within a block, for surgical corruption.
    pub fn patch_block(&mut self, block: BlockIndex, offset: usize, bytes: &[u8]) {
        assert!(self.geometry.contains(block), "patch outside image");
        let base = block.0 as usize * self.geometry.block_size.as_usize();
        let end = offset + bytes.len();
        assert!(end <= self.geometry.block_size.as_usize(), "patch outside block");
        self.bytes[base + offset..base + end].copy_from_slice(bytes);
    }

    #[must_use]
    pub fn block_bytes(&self, block: BlockIndex) -> &[u8] {
        let base = block.0 as usize * self.geometry.block_size.as_usize();
        &self.bytes[base..base + self.geometry.block_size.as_usize()]
    }

    /// Write a finished commit log into a block.
    pub fn write_meta(&mut self, block: BlockIndex, meta: MetaBuilder) {
        let finished = meta.finish(self.geometry.block_size.as_usize());
        self.patch_block(block, 0, &finished);
    }

    /// Zero a block, as NAND parts read after an interrupted erase.
    pub fn zero_block(&mut self, block: BlockIndex) {
        let zeros = vec![0_u8; self.geometry.block_size.as_usize()];
        self.patch_block(block, 0, &zeros);
    }

    /// Lay `content` out as a CTZ skip-list and return its struct pointer.
    pub fn ctz_file(&mut self, content: &[u8]) -> CtzPtr {
        let size = u32::try_from(content.len()).expect("content fits u32");
        if content.is_empty() {
            return CtzPtr {
                head: BlockIndex::NULL,
                size: 0,
            };
        }

        let block_size = self.geometry.block_size;
        let mut physical: Vec<BlockIndex> = Vec::new();
        let mut remaining = content;
        let mut list_index: u32 = 0;
        while !remaining.is_empty() {
            let capacity = ctz_block_capacity(block_size, list_index);
            let take = remaining.len().min(capacity);
            let block = self.alloc();

            for pointer in 0..ctz_pointer_count(list_index) {
                let target = physical[(list_index - (1_u32 << pointer)) as usize];
                self.patch_block(block, pointer as usize * 4, &target.0.to_le_bytes());
            }
            self.patch_block(block, ctz_data_offset(list_index), &remaining[..take]);

            physical.push(block);
            remaining = &remaining[take..];
            list_index += 1;
        }

        CtzPtr {
            head: *physical.last().expect("at least one block"),
            size,
        }
    }

    /// Write a minimal root pair holding just the superblock entry.
    pub fn write_superblock(&mut self, revision: u32) {
        let mut meta = MetaBuilder::new(revision);
        meta.push_create(0);
        meta.push_superblock_entry(0, self.geometry);
        meta.commit();
        self.write_meta(BlockIndex(0), meta);
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    #[must_use]
    pub fn into_image(self) -> Image {
        let geometry = self.geometry;
        Image::from_bytes(self.bytes, geometry).expect("builder bytes match geometry")
    }
}
