#![forbid(unsafe_code)]
//! On-disk decoding for LittleFS metadata, pinned to disk version 2.0.
//!
//! This crate turns raw block bytes into typed structures and nothing
//! more: commit logs ([`decode_block`]), entry payloads ([`entry`]), and
//! the self-describing superblock ([`probe_superblock`]). Policy — which
//! block of a pair wins, how directories merge, what corruption means for
//! a subtree — lives upstream in `efs-core`.

mod entry;
mod log;

pub use entry::{
    CtzPtr, Superblock, find_superblock, parse_ctz_payload, parse_name_payload,
    parse_pair_payload, probe_superblock,
};
pub use log::{BlockLog, Commit, CommitScanner, TagEntry, Truncation, decode_block};
