#![forbid(unsafe_code)]
//! Error types for EmberFS.
//!
//! # Error Taxonomy
//!
//! EmberFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `efs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `EfsError` | `efs-error` (this crate) | User-facing errors for CLI and API consumers |
//!
//! `efs-error` is intentionally independent of `efs-types` to avoid cyclic
//! dependencies; `efs-core` converts `ParseError` into `EfsError::Parse` at
//! its boundary.
//!
//! # Severity
//!
//! A forensic reader treats most on-flash inconsistencies as expected.
//! Only two conditions abort an analysis: the image cannot be read at all,
//! or the geometry is unusable. Everything else degrades the affected
//! branch and is reported through the result tree, not raised:
//!
//! | Condition | Variant | Severity |
//! |-----------|---------|----------|
//! | unreadable image file | `Io` | fatal |
//! | invalid block size / count | `Geometry` | fatal |
//! | unparseable superblock when no geometry was supplied | `Parse` | fatal |
//! | block index outside the image | `OutOfRange` | local |
//! | decoded structure inconsistent at a known block | `Corruption` | local |
//! | CTZ pointer outside the image or chain cut short | `TruncatedChain` | local |
//! | metadata pair or data block revisited | `CycleDetected` | local |
//! | traversal budget exhausted | `BudgetExhausted` | local |
//!
//! Local variants exist so that strict callers (fixture validation, the
//! harness) can demand a clean decode; the tree walker itself converts
//! them into per-entry status annotations and keeps going.

use thiserror::Error;

/// Unified error type for all EmberFS operations.
#[derive(Debug, Error)]
pub enum EfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Block size or block count outside the usable range, or inconsistent
    /// with the image length.
    #[error("invalid geometry: {0}")]
    Geometry(String),

    /// Parse-layer error surfaced to the user.
    ///
    /// Carries the string form of a `ParseError` from `efs-types`. Prefer
    /// `Corruption` when the block number is known.
    #[error("parse error: {0}")]
    Parse(String),

    /// Block index beyond the image's block count.
    #[error("block out of range: block={block} block_count={block_count}")]
    OutOfRange { block: u32, block_count: u32 },

    /// Decoded flash structure is inconsistent at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    /// A CTZ skip-list walk hit a pointer it could not follow.
    #[error("truncated chain at block {block}: {detail}")]
    TruncatedChain { block: u32, detail: String },

    /// A traversal revisited a block or metadata pair.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// The walk budget (depth or visited pairs) ran out.
    #[error("traversal budget exhausted: {0}")]
    BudgetExhausted(String),
}

impl EfsError {
    /// True when this error must abort the analysis with a non-zero exit.
    ///
    /// Everything else is a local condition: the affected branch degrades
    /// and the best-effort walk continues.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Geometry(_) | Self::Parse(_)
        )
    }
}

/// Result alias using `EfsError`.
pub type Result<T> = std::result::Result<T, EfsError>;
