use efs_ondisk::Superblock;
use efs_types::{Geometry, MetadataPair};
use serde::Serialize;
use std::fmt::Write as _;

/// Per-entry recoverability after a best-effort walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStatus {
    /// Fully decoded and checksum-clean.
    Ok,
    /// Some data was unreachable: truncated log, broken chain, or an
    /// exhausted traversal budget.
    Partial,
    /// Nothing usable decoded before the structure failed validation.
    Corrupt,
    /// Structurally impossible state, e.g. a directory cycle.
    Anomaly,
}

impl RecoveryStatus {
    fn severity(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Partial => 1,
            Self::Corrupt => 2,
            Self::Anomaly => 3,
        }
    }

    /// The more severe of two statuses, for folding child findings into a
    /// parent.
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Partial => "partial",
            Self::Corrupt => "corrupt",
            Self::Anomaly => "anomaly",
        }
    }
}

/// A recorded, non-fatal inconsistency tied to a tree location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    /// Tree path the warning applies to ("/" for image-level findings).
    pub path: String,
    /// Physical block, when one is implicated.
    pub block: Option<u32>,
    pub detail: String,
}

/// A reconstructed file.
#[derive(Debug, Clone, Serialize)]
pub struct FileNode {
    pub name: String,
    pub status: RecoveryStatus,
    /// Size claimed by the struct tag.
    pub size: u32,
    /// Bytes actually recovered.
    pub recovered: usize,
    /// True for small files stored inline in the metadata log.
    pub inline: bool,
    /// Recovered content; kept out of serialized reports, which carry
    /// sizes and statuses only.
    #[serde(skip)]
    pub content: Option<Vec<u8>>,
}

/// A reconstructed directory.
#[derive(Debug, Clone, Serialize)]
pub struct DirNode {
    pub name: String,
    pub status: RecoveryStatus,
    /// Backing metadata pair, absent for anomalous placeholders.
    pub pair: Option<MetadataPair>,
    pub entries: Vec<Node>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Node {
    Dir(DirNode),
    File(FileNode),
}

/// Aggregate counters for one walk.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WalkStats {
    pub pairs_visited: u32,
    pub dirs: u32,
    pub files: u32,
    pub bytes_recovered: u64,
}

/// Complete result of analyzing an image: the best-effort tree plus every
/// inconsistency met along the way. Produced even for badly damaged
/// images — a walk never aborts on a local failure.
#[derive(Debug, Clone, Serialize)]
pub struct FsReport {
    pub geometry: Geometry,
    pub superblock: Option<Superblock>,
    pub root: DirNode,
    pub warnings: Vec<Warning>,
    pub stats: WalkStats,
}

impl FsReport {
    /// Render the human-readable tree listing.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "image: {}", self.geometry);
        match &self.superblock {
            Some(sb) => {
                let _ = writeln!(out, "superblock: littlefs v{}", sb.version_string());
            }
            None => {
                let _ = writeln!(out, "superblock: not found");
            }
        }
        render_dir(&mut out, &self.root, 0);
        let _ = writeln!(
            out,
            "recovered: {} dirs, {} files, {} bytes ({} metadata pairs visited)",
            self.stats.dirs, self.stats.files, self.stats.bytes_recovered, self.stats.pairs_visited
        );
        if !self.warnings.is_empty() {
            let _ = writeln!(out, "warnings ({}):", self.warnings.len());
            for warning in &self.warnings {
                match warning.block {
                    Some(block) => {
                        let _ = writeln!(
                            out,
                            "  {}: block {}: {}",
                            warning.path, block, warning.detail
                        );
                    }
                    None => {
                        let _ = writeln!(out, "  {}: {}", warning.path, warning.detail);
                    }
                }
            }
        }
        out
    }
}

fn render_dir(out: &mut String, dir: &DirNode, depth: usize) {
    let indent = "  ".repeat(depth);
    let name = if depth == 0 { "" } else { dir.name.as_str() };
    let _ = writeln!(out, "{indent}{name}/  [{}]", dir.status.label());
    for node in &dir.entries {
        match node {
            Node::Dir(sub) => render_dir(out, sub, depth + 1),
            Node::File(file) => {
                let indent = "  ".repeat(depth + 1);
                let inline = if file.inline { ", inline" } else { "" };
                let _ = writeln!(
                    out,
                    "{indent}{}  ({} B{inline})  [{}]",
                    file.name,
                    file.size,
                    file.status.label()
                );
            }
        }
    }
}
