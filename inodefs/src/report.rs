use crate::alloc::BlockIndex;

use chrono::{DateTime, Utc};
use std::fmt;

/// Bits printed per row when rendering a bitmap.
const BITS_PER_ROW: usize = 32;

/// One line of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u32,
    pub modified: Option<DateTime<Utc>>,
}

impl fmt::Display for ListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_dir { 'd' } else { '-' };
        let modified = match self.modified {
            Some(at) => at.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => "-".repeat(19),
        };
        write!(f, "{} {:>10} {} {}", kind, self.size, modified, self.name)?;
        if self.is_dir {
            write!(f, "/")?;
        }
        Ok(())
    }
}

/// An occupied inode and the blocks it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeDump {
    pub index: BlockIndex,
    pub name: String,
    pub size: u32,
    /// Data blocks in file order followed by address blocks.
    pub blocks: Vec<BlockIndex>,
}

/// Summary of the whole image, as printed by `dumpe2fs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dump {
    pub block_size: u32,
    pub inode_count: u32,
    pub block_count: u32,
    pub free_inodes: u32,
    pub free_blocks: u32,
    pub inodes: Vec<InodeDump>,
}

impl fmt::Display for Dump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Inode count:     {}", self.inode_count)?;
        writeln!(f, "Block count:     {}", self.block_count)?;
        writeln!(f, "Free inodes:     {}", self.free_inodes)?;
        writeln!(f, "Free blocks:     {}", self.free_blocks)?;
        writeln!(f, "Block size:      {}", self.block_size)?;
        // Every inode fills exactly one block.
        writeln!(f, "Inode size:      {}", self.block_size)?;
        writeln!(f, "Occupied inodes:")?;
        for inode in &self.inodes {
            writeln!(
                f,
                "  Index: {:<5} Filename: {:<16} Size: {}",
                inode.index, inode.name, inode.size
            )?;
            let blocks: Vec<String> = inode.blocks.iter().map(|b| b.to_string()).collect();
            writeln!(f, "  Occupied blocks: {{ {} }}", blocks.join(", "))?;
        }
        Ok(())
    }
}

/// A disagreement between the bitmaps and the structures they describe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// Marked used but reachable from no inode.
    UnreferencedBlock(BlockIndex),
    /// Reachable from `inode` but marked free.
    UnallocatedBlock { inode: BlockIndex, block: BlockIndex },
    /// Reachable from more than one inode.
    SharedBlock { block: BlockIndex, inodes: Vec<BlockIndex> },
    /// A directory entry naming a free inode, typically an alias whose target
    /// was deleted.
    DanglingEntry { path: String, inode: BlockIndex },
    /// Marked used but named by no directory entry.
    OrphanInode(BlockIndex),
    /// An inode whose block chain cannot be followed.
    DamagedInode { inode: BlockIndex, reason: String },
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::UnreferencedBlock(block) => {
                write!(f, "block {} is marked used but unreferenced", block)
            }
            Finding::UnallocatedBlock { inode, block } => {
                write!(f, "block {} of inode {} is marked free", block, inode)
            }
            Finding::SharedBlock { block, inodes } => {
                write!(f, "block {} is claimed by inodes {:?}", block, inodes)
            }
            Finding::DanglingEntry { path, inode } => {
                write!(f, "{} refers to free inode {}", path, inode)
            }
            Finding::OrphanInode(inode) => {
                write!(f, "inode {} is marked used but has no directory entry", inode)
            }
            Finding::DamagedInode { inode, reason } => {
                write!(f, "inode {} is damaged: {}", inode, reason)
            }
        }
    }
}

/// Both bitmaps plus the problems found by walking the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsckReport {
    pub blocks_in_use: Vec<bool>,
    pub inodes_in_use: Vec<bool>,
    pub findings: Vec<Finding>,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

fn write_bitmap(f: &mut fmt::Formatter<'_>, title: &str, bits: &[bool]) -> fmt::Result {
    let used = bits.iter().filter(|&&b| b).count();
    writeln!(f, "{}: {} in use, {} free", title, used, bits.len() - used)?;
    for row in bits.chunks(BITS_PER_ROW) {
        let line: String = row.iter().map(|&b| if b { '1' } else { '0' }).collect();
        writeln!(f, "  {}", line)?;
    }
    Ok(())
}

impl fmt::Display for FsckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_bitmap(f, "Blocks", &self.blocks_in_use)?;
        write_bitmap(f, "Inodes", &self.inodes_in_use)?;
        if self.is_clean() {
            return writeln!(f, "No problems found.");
        }
        writeln!(f, "{} problem(s) found:", self.findings.len())?;
        for finding in &self.findings {
            writeln!(f, "  {}", finding)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn listing_marks_directories() {
        let entry = ListEntry {
            name: "docs".to_string(),
            is_dir: true,
            size: 52,
            modified: Utc.timestamp_opt(0, 0).single(),
        };
        assert_eq!(entry.to_string(), "d         52 1970-01-01 00:00:00 docs/");
    }

    #[test]
    fn fsck_rows_wrap_and_list_findings() {
        let report = FsckReport {
            blocks_in_use: (0..40).map(|i| i < 3).collect(),
            inodes_in_use: vec![true, false],
            findings: vec![Finding::OrphanInode(1)],
        };
        let text = report.to_string();
        assert!(text.starts_with("Blocks: 3 in use, 37 free\n  111000"));
        assert!(text.contains("\n  00000000\nInodes: 1 in use, 1 free\n  10\n"));
        assert!(text.contains("inode 1 is marked used but has no directory entry"));
        assert!(!report.is_clean());
    }
}
