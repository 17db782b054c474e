use crate::ctz::{ChainError, reconstruct_ctz};
use crate::report::{DirNode, FileNode, FsReport, Node, RecoveryStatus, WalkStats, Warning};
use crate::resolver::{EntryKind, EntryStruct, resolve_dir};
use efs_block::Image;
use efs_ondisk::Superblock;
use efs_types::{BlockIndex, MetadataPair};
use std::collections::HashSet;
use tracing::warn;

/// Budget capping a traversal of possibly adversarial structures.
///
/// The visited set already guarantees termination; the budget keeps a
/// pathological image from turning "terminates" into "terminates after
/// touching every block a thousand ways".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkLimits {
    /// Maximum directory nesting depth.
    pub max_depth: u32,
    /// Maximum metadata pairs resolved across the whole walk.
    pub max_pairs: u32,
}

impl Default for WalkLimits {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_pairs: 8192,
        }
    }
}

/// Where a walk starts and how far it may go.
#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    /// Root metadata pair; LittleFS formats the root at blocks {0, 1},
    /// but a forensic walk may be pointed anywhere.
    pub root: MetadataPair,
    pub limits: WalkLimits,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            root: MetadataPair::new(BlockIndex(0), BlockIndex(1)),
            limits: WalkLimits::default(),
        }
    }
}

/// Outcome of asking to visit one metadata pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Fresh,
    /// Already seen: a cycle through tails or dir pointers.
    Revisit,
    /// The pair budget ran out.
    Exhausted,
}

/// Shared visited-set and budget for one walk.
///
/// Keyed by normalized pair identity, not recursion depth, so any cycle
/// is caught regardless of the path that formed it.
#[derive(Debug)]
pub struct PairTracker {
    visited: HashSet<(u32, u32)>,
    remaining: u32,
}

impl PairTracker {
    #[must_use]
    pub fn new(max_pairs: u32) -> Self {
        Self {
            visited: HashSet::new(),
            remaining: max_pairs,
        }
    }

    pub fn visit(&mut self, pair: MetadataPair) -> Visit {
        if self.remaining == 0 {
            return Visit::Exhausted;
        }
        if !self.visited.insert(pair.normalized()) {
            return Visit::Revisit;
        }
        self.remaining -= 1;
        Visit::Fresh
    }

    #[must_use]
    pub fn pairs_visited(&self) -> u32 {
        u32::try_from(self.visited.len()).unwrap_or(u32::MAX)
    }
}

struct WalkState {
    tracker: PairTracker,
    warnings: Vec<Warning>,
    stats: WalkStats,
    superblock: Option<Superblock>,
}

/// Reconstruct the directory tree of an image, best effort.
///
/// Never fails: every inconsistency degrades only the branch it was found
/// in, and the result always covers whatever was reachable.
#[must_use]
pub fn walk_tree(image: &Image, options: &WalkOptions) -> FsReport {
    let mut state = WalkState {
        tracker: PairTracker::new(options.limits.max_pairs),
        warnings: Vec::new(),
        stats: WalkStats::default(),
        superblock: None,
    };

    let root = walk_dir(
        image,
        options.root,
        String::new(),
        "/",
        0,
        options.limits,
        &mut state,
    );

    state.stats.pairs_visited = state.tracker.pairs_visited();
    FsReport {
        geometry: image.geometry(),
        superblock: state.superblock,
        root,
        warnings: state.warnings,
        stats: state.stats,
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn walk_dir(
    image: &Image,
    pair: MetadataPair,
    name: String,
    path: &str,
    depth: u32,
    limits: WalkLimits,
    state: &mut WalkState,
) -> DirNode {
    let resolved = resolve_dir(image, pair, &mut state.tracker);
    state.stats.dirs += 1;
    for mut warning in resolved.warnings {
        warning.path = path.to_owned();
        state.warnings.push(warning);
    }
    if depth == 0 {
        state.superblock = resolved.superblock;
    }

    let mut status = resolved.status;
    let mut entries = Vec::new();

    for (entry_name, entry) in resolved.entries {
        let entry_path = child_path(path, &entry_name);
        match entry.kind {
            EntryKind::Dir => {
                let node = match entry.strct {
                    Some(EntryStruct::Dir(sub_pair)) => {
                        if depth + 1 > limits.max_depth {
                            state.warnings.push(Warning {
                                path: entry_path,
                                block: None,
                                detail: format!(
                                    "depth limit {} reached, subtree not descended",
                                    limits.max_depth
                                ),
                            });
                            status = status.worst(RecoveryStatus::Partial);
                            placeholder_dir(entry_name, RecoveryStatus::Partial, Some(sub_pair))
                        } else {
                            walk_dir(
                                image,
                                sub_pair,
                                entry_name,
                                &entry_path,
                                depth + 1,
                                limits,
                                state,
                            )
                        }
                    }
                    _ => {
                        warn!(path = %entry_path, "directory entry without pair struct");
                        state.warnings.push(Warning {
                            path: entry_path,
                            block: None,
                            detail: "directory entry carries no metadata pair".to_owned(),
                        });
                        placeholder_dir(entry_name, RecoveryStatus::Corrupt, None)
                    }
                };
                entries.push(Node::Dir(node));
            }
            EntryKind::File => {
                let node = walk_file(image, entry_name, &entry_path, entry.strct, state);
                entries.push(Node::File(node));
            }
        }
    }

    DirNode {
        name,
        status,
        pair: Some(pair),
        entries,
    }
}

fn placeholder_dir(name: String, status: RecoveryStatus, pair: Option<MetadataPair>) -> DirNode {
    DirNode {
        name,
        status,
        pair,
        entries: Vec::new(),
    }
}

fn walk_file(
    image: &Image,
    name: String,
    path: &str,
    strct: Option<EntryStruct>,
    state: &mut WalkState,
) -> FileNode {
    state.stats.files += 1;
    match strct {
        Some(EntryStruct::Inline(data)) => {
            let size = u32::try_from(data.len()).unwrap_or(u32::MAX);
            state.stats.bytes_recovered += data.len() as u64;
            FileNode {
                name,
                status: RecoveryStatus::Ok,
                size,
                recovered: data.len(),
                inline: true,
                content: Some(data),
            }
        }
        Some(EntryStruct::Ctz(ptr)) => match reconstruct_ctz(image, ptr) {
            Ok(file) => {
                state.stats.bytes_recovered += file.content.len() as u64;
                FileNode {
                    name,
                    status: RecoveryStatus::Ok,
                    size: ptr.size,
                    recovered: file.content.len(),
                    inline: false,
                    content: Some(file.content),
                }
            }
            Err(err @ ChainError::Truncated { .. }) => {
                state.warnings.push(Warning {
                    path: path.to_owned(),
                    block: chain_error_block(&err),
                    detail: err.to_string(),
                });
                FileNode {
                    name,
                    status: RecoveryStatus::Partial,
                    size: ptr.size,
                    recovered: 0,
                    inline: false,
                    content: None,
                }
            }
            Err(err @ ChainError::Cycle { .. }) => {
                state.warnings.push(Warning {
                    path: path.to_owned(),
                    block: chain_error_block(&err),
                    detail: err.to_string(),
                });
                FileNode {
                    name,
                    status: RecoveryStatus::Anomaly,
                    size: ptr.size,
                    recovered: 0,
                    inline: false,
                    content: None,
                }
            }
        },
        Some(EntryStruct::Dir(_)) | None => {
            state.warnings.push(Warning {
                path: path.to_owned(),
                block: None,
                detail: "file entry carries no usable struct".to_owned(),
            });
            FileNode {
                name,
                status: RecoveryStatus::Corrupt,
                size: 0,
                recovered: 0,
                inline: false,
                content: None,
            }
        }
    }
}

fn chain_error_block(err: &ChainError) -> Option<u32> {
    match err {
        ChainError::Truncated { block, .. } | ChainError::Cycle { block } => Some(*block),
    }
}
