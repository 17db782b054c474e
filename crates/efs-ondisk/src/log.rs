use efs_types::{
    COMMIT_CRC_SEED, ParseError, REVISION_SIZE, TAG_SIZE, Tag, TYPE1_CRC, commit_crc, read_be_u32,
    read_le_u32,
};
use serde::{Deserialize, Serialize};

/// One tag plus the block-relative offset of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagEntry {
    pub tag: Tag,
    /// Offset of the payload within the block (valid even when empty).
    pub payload_off: usize,
}

impl TagEntry {
    /// Slice this entry's payload out of the block it was decoded from.
    ///
    /// The decoder only emits entries whose payload extent was bounds
    /// checked, so this is plain slicing for the original block.
    #[must_use]
    pub fn payload<'a>(&self, block: &'a [u8]) -> &'a [u8] {
        &block[self.payload_off..self.payload_off + self.tag.payload_len()]
    }
}

/// A checksum-terminated batch of tags: one atomic metadata update.
///
/// The terminating CRC tag is consumed by the scanner and not included.
#[derive(Debug, Clone, Default)]
pub struct Commit {
    pub tags: Vec<TagEntry>,
}

/// Why decoding of a block's log stopped before the block end.
///
/// None of these are errors for a forensic reader — interrupted writes and
/// bit rot are the normal operating condition. They are recorded so the
/// caller can annotate the affected directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Truncation {
    /// A commit's stored checksum disagreed with the running CRC; the
    /// commit and everything after it in this block is stale.
    CrcMismatch {
        offset: usize,
        expected: u32,
        actual: u32,
    },
    /// A tag declared a payload running past the block end, or a CRC tag
    /// too short to hold its checksum.
    MalformedTag { offset: usize },
    /// Tags were pending when the log ended: a write that never reached
    /// its CRC tag (power loss mid-commit).
    PartialCommit { offset: usize },
}

/// Decoded view of one metadata block: revision, valid commits, and how
/// the log ended.
#[derive(Debug, Clone)]
pub struct BlockLog {
    pub revision: u32,
    pub commits: Vec<Commit>,
    pub truncation: Option<Truncation>,
}

impl BlockLog {
    /// True when at least one commit survived checksum validation.
    ///
    /// Only such blocks participate in revision comparison; an erased
    /// block's revision word is noise.
    #[must_use]
    pub fn has_valid_commits(&self) -> bool {
        !self.commits.is_empty()
    }

    /// True when decoding found corruption rather than a clean or merely
    /// interrupted log end.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self.truncation,
            Some(Truncation::CrcMismatch { .. } | Truncation::MalformedTag { .. })
        )
    }
}

/// Stateful decoder for one block's commit log.
///
/// Tag words are XOR-delta encoded against the previous decoded tag, the
/// running checksum covers raw on-disk bytes, and the CRC tag's chunk bit 0
/// flips the expected invalid-marker phase for subsequent tags. That state
/// lives here explicitly; tags cannot be decoded independently.
#[derive(Debug)]
pub struct CommitScanner<'a> {
    block: &'a [u8],
    offset: usize,
    prev_tag: u32,
    crc: u32,
}

impl<'a> CommitScanner<'a> {
    /// Start a scanner at the block's first tag.
    ///
    /// Fails only when the block cannot hold a revision word; anything
    /// after that is reported through [`BlockLog::truncation`].
    pub fn new(block: &'a [u8]) -> Result<Self, ParseError> {
        // The revision word is covered by the first commit's checksum.
        let revision_bytes = efs_types::ensure_slice(block, 0, REVISION_SIZE)?;
        Ok(Self {
            block,
            offset: REVISION_SIZE,
            prev_tag: 0xFFFF_FFFF,
            crc: commit_crc(COMMIT_CRC_SEED, revision_bytes),
        })
    }

    #[must_use]
    pub fn revision(&self) -> u32 {
        // new() guaranteed the first four bytes exist.
        read_le_u32(self.block, 0).unwrap_or(0)
    }

    /// Consume the scanner, decoding every commit in the block.
    #[must_use]
    pub fn scan(mut self) -> BlockLog {
        let revision = self.revision();
        let mut commits = Vec::new();
        let mut pending = Commit::default();
        let mut truncation = None;

        loop {
            let tag_off = self.offset;
            let Ok(raw) = read_be_u32(self.block, tag_off) else {
                // Ran into the block end mid-word.
                if !pending.tags.is_empty() {
                    truncation = Some(Truncation::PartialCommit { offset: tag_off });
                }
                break;
            };

            let tag = Tag(raw ^ self.prev_tag);
            if !tag.is_valid() {
                // Unwritten space; the log ends here.
                if !pending.tags.is_empty() {
                    truncation = Some(Truncation::PartialCommit { offset: tag_off });
                }
                break;
            }

            let payload_off = tag_off + TAG_SIZE;
            let payload_len = tag.payload_len();
            let Some(payload_end) = payload_off.checked_add(payload_len) else {
                truncation = Some(Truncation::MalformedTag { offset: tag_off });
                break;
            };
            if payload_end > self.block.len() {
                truncation = Some(Truncation::MalformedTag { offset: tag_off });
                break;
            }

            self.prev_tag = tag.0;
            self.crc = commit_crc(self.crc, &self.block[tag_off..payload_off]);

            if tag.type1() == TYPE1_CRC {
                if payload_len < 4 {
                    truncation = Some(Truncation::MalformedTag { offset: tag_off });
                    break;
                }
                let stored = match read_le_u32(self.block, payload_off) {
                    Ok(stored) => stored,
                    Err(_) => {
                        truncation = Some(Truncation::MalformedTag { offset: tag_off });
                        break;
                    }
                };
                if stored != self.crc {
                    truncation = Some(Truncation::CrcMismatch {
                        offset: tag_off,
                        expected: stored,
                        actual: self.crc,
                    });
                    break;
                }

                commits.push(std::mem::take(&mut pending));
                self.crc = COMMIT_CRC_SEED;
                // Chunk bit 0 flips the valid-marker phase of what follows.
                self.prev_tag ^= u32::from(tag.chunk() & 1) << 31;
            } else {
                self.crc = commit_crc(self.crc, &self.block[payload_off..payload_end]);
                pending.tags.push(TagEntry { tag, payload_off });
            }

            self.offset = payload_end;
        }

        BlockLog {
            revision,
            commits,
            truncation,
        }
    }
}

/// Decode one metadata block's commit log.
///
/// An erased block (all 0x00 or all 0xFF) decodes to zero commits with no
/// corruption marker — that is a state, not an error.
pub fn decode_block(block: &[u8]) -> Result<BlockLog, ParseError> {
    Ok(CommitScanner::new(block)?.scan())
}

#[cfg(test)]
mod tests {
    use super::*;
    use efs_types::{TAG_ID_NONE, TYPE_CREATE, TYPE_REG};

    /// Minimal commit-log encoder mirroring the decoder's running state.
    pub(crate) struct LogWriter {
        pub bytes: Vec<u8>,
        ptag: u32,
        crc: u32,
    }

    impl LogWriter {
        pub fn new(revision: u32) -> Self {
            let bytes = revision.to_le_bytes().to_vec();
            let crc = commit_crc(COMMIT_CRC_SEED, &bytes);
            Self {
                bytes,
                ptag: 0xFFFF_FFFF,
                crc,
            }
        }

        pub fn push(&mut self, tag: Tag, payload: &[u8]) {
            assert_eq!(tag.payload_len(), payload.len(), "payload length mismatch");
            let raw = (tag.0 ^ self.ptag).to_be_bytes();
            self.ptag = tag.0;
            self.crc = commit_crc(self.crc, &raw);
            self.crc = commit_crc(self.crc, payload);
            self.bytes.extend_from_slice(&raw);
            self.bytes.extend_from_slice(payload);
        }

        pub fn commit(&mut self) {
            self.commit_with_chunk(0);
        }

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

        pub fn finish(mut self, block_size: usize) -> Vec<u8> {
            assert!(self.bytes.len() <= block_size, "log overflows block");
            self.bytes.resize(block_size, 0xFF);
            self.bytes
        }
    }

    fn one_commit_block() -> Vec<u8> {
        let mut writer = LogWriter::new(1);
        writer.push(Tag::from_fields(TYPE_CREATE, 0, 0), &[]);
        writer.push(Tag::from_fields(TYPE_REG, 0, 5), b"a.txt");
        writer.commit();
        writer.finish(256)
    }

    #[test]
    fn all_zero_block_is_erased() {
        let log = decode_block(&[0_u8; 256]).expect("decode");
        assert_eq!(log.revision, 0);
        assert!(log.commits.is_empty());
        assert_eq!(log.truncation, None);
        assert!(!log.is_corrupt());
    }

    #[test]
    fn all_ones_block_has_no_valid_commits() {
        // Erased NOR flash reads 0xFF. The first word XOR-decodes to a
        // valid-looking null tag, but no CRC tag ever lands, so the
        // pending run is dropped as an interrupted write.
        let log = decode_block(&[0xFF_u8; 256]).expect("decode");
        assert!(log.commits.is_empty());
        assert!(!log.is_corrupt());
    }

    #[test]
    fn block_shorter_than_revision_fails() {
        assert!(decode_block(&[0_u8; 2]).is_err());
    }

    #[test]
    fn single_commit_round_trip() {
        let block = one_commit_block();
        let log = decode_block(&block).expect("decode");

        assert_eq!(log.revision, 1);
        assert_eq!(log.commits.len(), 1);
        assert_eq!(log.truncation, None);

        let tags = &log.commits[0].tags;
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].tag.type3(), TYPE_CREATE);
        assert_eq!(tags[0].tag.id(), Some(0));
        assert_eq!(tags[1].tag.type3(), TYPE_REG);
        assert_eq!(tags[1].payload(&block), b"a.txt");
    }

    #[test]
    fn multiple_commits_decode_in_order() {
        let mut writer = LogWriter::new(7);
        writer.push(Tag::from_fields(TYPE_CREATE, 0, 0), &[]);
        writer.commit();
        writer.push(Tag::from_fields(TYPE_REG, 0, 3), b"log");
        writer.commit();
        let block = writer.finish(256);

        let log = decode_block(&block).expect("decode");
        assert_eq!(log.commits.len(), 2);
        assert_eq!(log.commits[0].tags.len(), 1);
        assert_eq!(log.commits[1].tags.len(), 1);
        assert_eq!(log.commits[1].tags[0].payload(&block), b"log");
    }

    #[test]
    fn byte_flip_rejects_commit_and_everything_after() {
        let mut writer = LogWriter::new(3);
        writer.push(Tag::from_fields(TYPE_CREATE, 0, 0), &[]);
        writer.push(Tag::from_fields(TYPE_REG, 0, 5), b"a.txt");
        writer.commit();
        writer.push(Tag::from_fields(TYPE_CREATE, 1, 0), &[]);
        writer.push(Tag::from_fields(TYPE_REG, 1, 5), b"b.txt");
        writer.commit();
        let clean = writer.finish(256);

        let clean_log = decode_block(&clean).expect("decode");
        assert_eq!(clean_log.commits.len(), 2);

        // Flipping any covered byte of the first commit kills both commits:
        // the log is only readable up to the first checksum failure.
        for flip in 0..20 {
            let mut corrupt = clean.clone();
            corrupt[flip] ^= 0x01;
            let log = decode_block(&corrupt).expect("decode");
            assert!(
                log.commits.is_empty(),
                "flip at {flip} should reject the first commit"
            );
            assert!(log.is_corrupt() || log.truncation.is_some(), "flip at {flip}");
        }

        // Flipping a byte covered only by the second commit keeps the first.
        let second_commit_payload = clean
            .windows(5)
            .position(|w| w == b"b.txt")
            .expect("second payload present");
        let mut corrupt = clean;
        corrupt[second_commit_payload] ^= 0x01;
        let log = decode_block(&corrupt).expect("decode");
        assert_eq!(log.commits.len(), 1);
        assert!(matches!(
            log.truncation,
            Some(Truncation::CrcMismatch { .. })
        ));
    }

    #[test]
    fn payload_overrunning_block_is_malformed() {
        let mut writer = LogWriter::new(1);
        writer.push(Tag::from_fields(TYPE_CREATE, 0, 0), &[]);
        writer.commit();
        let mut block = writer.finish(64);

        // Hand-craft a tag at the current log end claiming a 300-byte
        // payload; 300 > the 64-byte block, so decoding must stop there.
        let log = decode_block(&block).expect("decode");
        assert_eq!(log.commits.len(), 1);
        let end = 4 + 4 + 4 + 4; // revision + create + crc tag + checksum
        let prev = Tag::from_fields(TYPE1_CRC, TAG_ID_NONE, 4);
        let huge = Tag::from_fields(TYPE_REG, 0, 300);
        block[end..end + 4].copy_from_slice(&(huge.0 ^ prev.0).to_be_bytes());

        let log = decode_block(&block).expect("decode");
        assert_eq!(log.commits.len(), 1);
        assert!(matches!(
            log.truncation,
            Some(Truncation::MalformedTag { .. })
        ));
        assert!(log.is_corrupt());
    }

    #[test]
    fn partial_commit_without_crc_is_recorded() {
        let mut writer = LogWriter::new(1);
        writer.push(Tag::from_fields(TYPE_CREATE, 0, 0), &[]);
        writer.commit();
        writer.push(Tag::from_fields(TYPE_REG, 0, 5), b"a.txt");
        // No commit() — simulates power loss before the CRC tag landed.
        let block = writer.finish(256);

        let log = decode_block(&block).expect("decode");
        assert_eq!(log.commits.len(), 1);
        assert!(matches!(
            log.truncation,
            Some(Truncation::PartialCommit { .. })
        ));
        assert!(!log.is_corrupt());
    }

    #[test]
    fn phase_flip_after_crc_chunk_bit() {
        let mut writer = LogWriter::new(9);
        writer.push(Tag::from_fields(TYPE_CREATE, 0, 0), &[]);
        writer.commit_with_chunk(1);
        writer.push(Tag::from_fields(TYPE_REG, 0, 5), b"a.txt");
        writer.commit();
        let block = writer.finish(256);

        let log = decode_block(&block).expect("decode");
        assert_eq!(log.commits.len(), 2, "phase-flipped tail must decode");
        assert_eq!(log.commits[1].tags[0].payload(&block), b"a.txt");
    }
}
