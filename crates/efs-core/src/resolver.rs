use crate::report::{RecoveryStatus, Warning};
use crate::walker::{PairTracker, Visit};
use efs_block::Image;
use efs_ondisk::{
    BlockLog, CtzPtr, Superblock, decode_block, parse_ctz_payload, parse_name_payload,
    parse_pair_payload,
};
use efs_types::{
    MetadataPair, TYPE1_NAME, TYPE1_SPLICE, TYPE1_STRUCT, TYPE1_TAIL, TYPE_CREATE, TYPE_CTZSTRUCT,
    TYPE_DELETE, TYPE_DIR, TYPE_DIRSTRUCT, TYPE_HARDTAIL, TYPE_INLINESTRUCT, TYPE_REG,
    TYPE_SOFTTAIL, TYPE_SUPERBLOCK, revision_newer,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// What a directory entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// The struct tag attached to an entry, carrying where its data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStruct {
    /// Small file stored directly in the metadata log.
    Inline(Vec<u8>),
    /// File data in a CTZ skip-list.
    Ctz(CtzPtr),
    /// Subdirectory backed by its own metadata pair.
    Dir(MetadataPair),
}

/// Merged logical view of one name within a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub kind: EntryKind,
    pub strct: Option<EntryStruct>,
}

/// Result of replaying a directory's metadata chain.
#[derive(Debug, Clone)]
pub struct ResolvedDir {
    pub entries: BTreeMap<String, DirEntry>,
    /// Superblock entry, present only in the root pair.
    pub superblock: Option<Superblock>,
    pub status: RecoveryStatus,
    /// Warnings with empty paths; the walker fills in tree locations.
    pub warnings: Vec<Warning>,
    /// Global threaded-list link, surfaced for diagnostics but not merged
    /// into this directory (it points at a sibling, not a continuation).
    pub soft_tail: Option<MetadataPair>,
}

// ── Tag replay ──────────────────────────────────────────────────────────────

/// One id slot while replaying a block's log.
///
/// Ids are dense indices into the slot list; CREATE splices a slot in and
/// DELETE splices one out, shifting everything after it. Compacted logs
/// write NAME/STRUCT tags without a preceding CREATE, so slots also
/// materialize on first reference.
#[derive(Debug, Clone, Default)]
struct Slot {
    name: Option<String>,
    kind: Option<EntryKind>,
    strct: Option<EntryStruct>,
    superblock: bool,
}

fn slot_mut(slots: &mut Vec<Slot>, id: u16) -> &mut Slot {
    let id = usize::from(id);
    if slots.len() <= id {
        slots.resize_with(id + 1, Slot::default);
    }
    &mut slots[id]
}

struct BlockReplay {
    slots: Vec<Slot>,
    hard_tail: Option<MetadataPair>,
    soft_tail: Option<MetadataPair>,
}

fn replay_block(
    block: &[u8],
    block_index: u32,
    log: &BlockLog,
    warnings: &mut Vec<Warning>,
) -> BlockReplay {
    let mut slots: Vec<Slot> = Vec::new();
    let mut hard_tail = None;
    let mut soft_tail = None;

    for commit in &log.commits {
        for entry in &commit.tags {
            let tag = entry.tag;
            match tag.type1() {
                TYPE1_SPLICE => match (tag.type3(), tag.id()) {
                    (TYPE_CREATE, Some(id)) => {
                        let at = usize::from(id).min(slots.len());
                        slots.insert(at, Slot::default());
                    }
                    (TYPE_DELETE, Some(id)) => {
                        if usize::from(id) < slots.len() {
                            // Removal shifts later ids down; that is how
                            // later tags supersede earlier ones for a slot.
                            slots.remove(usize::from(id));
                        } else {
                            debug!(block = block_index, id, "delete for unknown id");
                        }
                    }
                    _ => debug!(block = block_index, "unrecognized splice tag"),
                },
                TYPE1_NAME => {
                    let Some(id) = tag.id() else {
                        debug!(block = block_index, "name tag without id");
                        continue;
                    };
                    match parse_name_payload(block, entry.payload_off, tag.payload_len()) {
                        Ok(name) => {
                            let slot = slot_mut(&mut slots, id);
                            match tag.type3() {
                                TYPE_REG => {
                                    slot.kind = Some(EntryKind::File);
                                    slot.name = Some(name);
                                }
                                TYPE_DIR => {
                                    slot.kind = Some(EntryKind::Dir);
                                    slot.name = Some(name);
                                }
                                TYPE_SUPERBLOCK => slot.superblock = true,
                                _ => debug!(block = block_index, "unrecognized name tag"),
                            }
                        }
                        Err(err) => warnings.push(Warning {
                            path: String::new(),
                            block: Some(block_index),
                            detail: format!("unreadable name payload: {err}"),
                        }),
                    }
                }
                TYPE1_STRUCT => {
                    let Some(id) = tag.id() else {
                        debug!(block = block_index, "struct tag without id");
                        continue;
                    };
                    let parsed = match tag.type3() {
                        TYPE_DIRSTRUCT => parse_pair_payload(block, entry.payload_off)
                            .map(EntryStruct::Dir)
                            .map(Some),
                        TYPE_CTZSTRUCT => parse_ctz_payload(block, entry.payload_off)
                            .map(EntryStruct::Ctz)
                            .map(Some),
                        TYPE_INLINESTRUCT => Ok(Some(EntryStruct::Inline(
                            entry.payload(block).to_vec(),
                        ))),
                        _ => {
                            debug!(block = block_index, "unrecognized struct tag");
                            Ok(None)
                        }
                    };
                    match parsed {
                        Ok(Some(strct)) => slot_mut(&mut slots, id).strct = Some(strct),
                        Ok(None) => {}
                        Err(err) => warnings.push(Warning {
                            path: String::new(),
                            block: Some(block_index),
                            detail: format!("unreadable struct payload: {err}"),
                        }),
                    }
                }
                TYPE1_TAIL => match parse_pair_payload(block, entry.payload_off) {
                    Ok(pair) => match tag.type3() {
                        TYPE_HARDTAIL => hard_tail = Some(pair),
                        TYPE_SOFTTAIL => soft_tail = Some(pair),
                        _ => debug!(block = block_index, "unrecognized tail tag"),
                    },
                    Err(err) => warnings.push(Warning {
                        path: String::new(),
                        block: Some(block_index),
                        detail: format!("unreadable tail payload: {err}"),
                    }),
                },
                // Global move state and user attributes carry nothing a
                // tree reconstruction needs.
                _ => debug!(block = block_index, type3 = tag.type3(), "tag skipped"),
            }
        }
    }

    BlockReplay {
        slots,
        hard_tail,
        soft_tail,
    }
}

// ── Winning-block selection ─────────────────────────────────────────────────

struct Half<'a> {
    block_index: u32,
    bytes: &'a [u8],
    log: BlockLog,
}

fn decode_half<'a>(
    image: &'a Image,
    block: efs_types::BlockIndex,
    warnings: &mut Vec<Warning>,
) -> Option<Half<'a>> {
    let bytes = match image.read_block(block) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(block = block.0, "metadata block unreadable: {err}");
            warnings.push(Warning {
                path: String::new(),
                block: Some(block.0),
                detail: format!("metadata block unreadable: {err}"),
            });
            return None;
        }
    };
    match decode_block(bytes) {
        Ok(log) => Some(Half {
            block_index: block.0,
            bytes,
            log,
        }),
        Err(err) => {
            warnings.push(Warning {
                path: String::new(),
                block: Some(block.0),
                detail: format!("metadata block undecodable: {err}"),
            });
            None
        }
    }
}

/// Replay one metadata pair chain into its merged directory view.
///
/// The authoritative block of each pair is the one with the higher valid
/// revision under wrap-aware comparison; blocks with no checksum-valid
/// commit never compete. A hard tail links a split directory's next pair
/// and is followed here, bounded by the shared tracker so that a tail
/// loop terminates as an anomaly instead of hanging.
pub fn resolve_dir(image: &Image, pair: MetadataPair, tracker: &mut PairTracker) -> ResolvedDir {
    let mut entries = BTreeMap::new();
    let mut warnings = Vec::new();
    let mut status = RecoveryStatus::Ok;
    let mut superblock = None;
    let mut soft_tail = None;

    let mut next_pair = Some(pair);
    while let Some(pair) = next_pair.take() {
        match tracker.visit(pair) {
            Visit::Fresh => {}
            Visit::Revisit => {
                warn!(%pair, "metadata pair revisited");
                warnings.push(Warning {
                    path: String::new(),
                    block: Some(pair.a.0),
                    detail: format!("metadata pair {pair} revisited, cycle suspected"),
                });
                status = status.worst(RecoveryStatus::Anomaly);
                break;
            }
            Visit::Exhausted => {
                warnings.push(Warning {
                    path: String::new(),
                    block: None,
                    detail: "metadata pair budget exhausted, chain cut short".to_owned(),
                });
                status = status.worst(RecoveryStatus::Partial);
                break;
            }
        }

        let half_a = decode_half(image, pair.a, &mut warnings);
        let half_b = decode_half(image, pair.b, &mut warnings);

        let any_corrupt = [&half_a, &half_b]
            .into_iter()
            .flatten()
            .any(|half| half.log.is_corrupt());

        let winner = match (
            half_a.filter(|h| h.log.has_valid_commits()),
            half_b.filter(|h| h.log.has_valid_commits()),
        ) {
            (Some(a), Some(b)) => {
                if revision_newer(b.log.revision, a.log.revision) {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (Some(single), None) | (None, Some(single)) => Some(single),
            (None, None) => None,
        };

        let Some(winner) = winner else {
            if any_corrupt {
                // Checksum failure before any valid commit: nothing to
                // recover from this pair.
                warnings.push(Warning {
                    path: String::new(),
                    block: Some(pair.a.0),
                    detail: format!("metadata pair {pair} has no valid commit"),
                });
                status = status.worst(RecoveryStatus::Corrupt);
            }
            // Both halves erased: an empty directory, not an error.
            break;
        };

        if winner.log.is_corrupt() {
            // The winner's own log lost its tail; entries decoded so far
            // are kept and the directory degrades to partial.
            warnings.push(Warning {
                path: String::new(),
                block: Some(winner.block_index),
                detail: format!(
                    "commit log truncated by corruption: {:?}",
                    winner.log.truncation
                ),
            });
            status = status.worst(RecoveryStatus::Partial);
        }

        let replay = replay_block(winner.bytes, winner.block_index, &winner.log, &mut warnings);

        for slot in replay.slots {
            if slot.superblock {
                match &slot.strct {
                    Some(EntryStruct::Inline(payload)) => match Superblock::parse(payload) {
                        Ok(sb) => superblock = Some(sb),
                        Err(err) => warnings.push(Warning {
                            path: String::new(),
                            block: Some(winner.block_index),
                            detail: format!("superblock entry unreadable: {err}"),
                        }),
                    },
                    _ => warnings.push(Warning {
                        path: String::new(),
                        block: Some(winner.block_index),
                        detail: "superblock entry without inline struct".to_owned(),
                    }),
                }
                continue;
            }
            let (Some(name), Some(kind)) = (slot.name, slot.kind) else {
                // Struct-only remnants of moved or half-written entries.
                debug!(block = winner.block_index, "nameless slot dropped");
                continue;
            };
            entries.insert(
                name,
                DirEntry {
                    kind,
                    strct: slot.strct,
                },
            );
        }

        if replay.soft_tail.is_some() {
            soft_tail = replay.soft_tail;
        }
        match replay.hard_tail {
            Some(tail) if !tail.is_null() => next_pair = Some(tail),
            Some(tail) => {
                debug!(%tail, "null hard tail ignored");
            }
            None => {}
        }
    }

    ResolvedDir {
        entries,
        superblock,
        status,
        warnings,
        soft_tail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walker::WalkLimits;
    use efs_harness::{ImageBuilder, MetaBuilder};
    use efs_types::{BlockIndex, Geometry};

    fn geometry() -> Geometry {
        Geometry::new(512, 32).expect("geometry")
    }

    fn tracker() -> PairTracker {
        PairTracker::new(WalkLimits::default().max_pairs)
    }

    fn root_pair() -> MetadataPair {
        MetadataPair::new(BlockIndex(0), BlockIndex(1))
    }

    #[test]
    fn create_name_struct_replay() {
        let mut builder = ImageBuilder::new(geometry());
        let mut meta = MetaBuilder::new(1);
        meta.push_create(0);
        meta.push_file_name(0, "a.txt");
        meta.push_inline(0, b"hello");
        meta.commit();
        builder.write_meta(BlockIndex(0), meta);
        let image = builder.into_image();

        let resolved = resolve_dir(&image, root_pair(), &mut tracker());
        assert_eq!(resolved.status, RecoveryStatus::Ok);
        assert_eq!(resolved.entries.len(), 1);
        let entry = &resolved.entries["a.txt"];
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(
            entry.strct,
            Some(EntryStruct::Inline(b"hello".to_vec()))
        );
    }

    #[test]
    fn delete_splices_ids_down() {
        let mut builder = ImageBuilder::new(geometry());
        let mut meta = MetaBuilder::new(1);
        meta.push_create(0);
        meta.push_file_name(0, "a.txt");
        meta.push_inline(0, b"aa");
        meta.push_create(1);
        meta.push_file_name(1, "b.txt");
        meta.push_inline(1, b"bb");
        meta.commit();
        // Tombstone for id 0: b.txt shifts down to id 0.
        meta.push_delete(0);
        meta.commit();
        // A later write to id 0 must now hit b.txt.
        meta.push_inline(0, b"b2");
        meta.commit();
        builder.write_meta(BlockIndex(0), meta);
        let image = builder.into_image();

        let resolved = resolve_dir(&image, root_pair(), &mut tracker());
        assert_eq!(resolved.entries.len(), 1);
        let entry = &resolved.entries["b.txt"];
        assert_eq!(entry.strct, Some(EntryStruct::Inline(b"b2".to_vec())));
    }

    #[test]
    fn newer_revision_wins_including_wraparound() {
        let mut builder = ImageBuilder::new(geometry());

        let mut old = MetaBuilder::new(0xFFFF_FFFF);
        old.push_create(0);
        old.push_file_name(0, "old.txt");
        old.push_inline(0, b"old");
        old.commit();
        builder.write_meta(BlockIndex(0), old);

        // Revision 1 wrapped past 0xFFFFFFFF and is the newer block.
        let mut new = MetaBuilder::new(1);
        new.push_create(0);
        new.push_file_name(0, "new.txt");
        new.push_inline(0, b"new");
        new.commit();
        builder.write_meta(BlockIndex(1), new);

        let image = builder.into_image();
        let resolved = resolve_dir(&image, root_pair(), &mut tracker());
        assert_eq!(resolved.entries.len(), 1);
        assert!(resolved.entries.contains_key("new.txt"));
    }

    #[test]
    fn erased_pair_is_an_empty_directory() {
        let builder = ImageBuilder::new(geometry());
        let image = builder.into_image();

        let resolved = resolve_dir(&image, root_pair(), &mut tracker());
        assert_eq!(resolved.status, RecoveryStatus::Ok);
        assert!(resolved.entries.is_empty());
    }

    #[test]
    fn corrupt_pair_with_no_valid_commit_is_corrupt() {
        let mut builder = ImageBuilder::new(geometry());
        let mut meta = MetaBuilder::new(1);
        meta.push_create(0);
        meta.push_file_name(0, "a.txt");
        meta.commit();
        builder.write_meta(BlockIndex(0), meta);
        // Flip a byte inside the only commit of the only written block.
        builder.patch_block(BlockIndex(0), 9, &[0xEE]);
        let image = builder.into_image();

        let resolved = resolve_dir(&image, root_pair(), &mut tracker());
        assert_eq!(resolved.status, RecoveryStatus::Corrupt);
        assert!(resolved.entries.is_empty());
        assert!(!resolved.warnings.is_empty());
    }

    #[test]
    fn hard_tail_chains_into_same_directory() {
        let mut builder = ImageBuilder::new(geometry());
        let tail_pair = builder.alloc_pair();

        let mut first = MetaBuilder::new(1);
        first.push_create(0);
        first.push_file_name(0, "a.txt");
        first.push_inline(0, b"aa");
        first.push_hard_tail(tail_pair);
        first.commit();
        builder.write_meta(BlockIndex(0), first);

        let mut second = MetaBuilder::new(1);
        second.push_create(0);
        second.push_file_name(0, "b.txt");
        second.push_inline(0, b"bb");
        second.commit();
        builder.write_meta(tail_pair.a, second);

        let image = builder.into_image();
        let resolved = resolve_dir(&image, root_pair(), &mut tracker());
        assert_eq!(resolved.entries.len(), 2);
        assert!(resolved.entries.contains_key("a.txt"));
        assert!(resolved.entries.contains_key("b.txt"));
    }

    #[test]
    fn soft_tail_is_surfaced_but_not_merged() {
        let mut builder = ImageBuilder::new(geometry());
        let sibling = builder.alloc_pair();

        let mut meta = MetaBuilder::new(1);
        meta.push_create(0);
        meta.push_file_name(0, "a.txt");
        meta.push_inline(0, b"aa");
        meta.push_soft_tail(sibling);
        meta.commit();
        builder.write_meta(BlockIndex(0), meta);

        let mut other = MetaBuilder::new(1);
        other.push_create(0);
        other.push_file_name(0, "elsewhere.txt");
        other.push_inline(0, b"xx");
        other.commit();
        builder.write_meta(sibling.a, other);

        let image = builder.into_image();
        let resolved = resolve_dir(&image, root_pair(), &mut tracker());
        assert_eq!(resolved.entries.len(), 1);
        assert!(resolved.entries.contains_key("a.txt"));
        assert_eq!(resolved.soft_tail, Some(sibling));
    }

    #[test]
    fn tail_loop_terminates_as_anomaly() {
        let mut builder = ImageBuilder::new(geometry());

        // Root's hard tail points straight back at the root pair.
        let mut meta = MetaBuilder::new(1);
        meta.push_create(0);
        meta.push_file_name(0, "a.txt");
        meta.push_inline(0, b"aa");
        meta.push_hard_tail(root_pair());
        meta.commit();
        builder.write_meta(BlockIndex(0), meta);

        let image = builder.into_image();
        let resolved = resolve_dir(&image, root_pair(), &mut tracker());
        assert_eq!(resolved.status, RecoveryStatus::Anomaly);
        assert!(resolved.entries.contains_key("a.txt"));
    }
}
