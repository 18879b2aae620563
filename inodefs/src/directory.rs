use crate::alloc::BlockIndex;
use crate::error::{FsError, Result};

use std::collections::btree_map::{self, BTreeMap};
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Longest name a directory entry can hold.
pub const NAME_LEN: usize = 13;
/// Bytes of one encoded entry.
pub const ENTRY_SIZE: usize = 16;
/// Bytes of the entry count in front of an encoded directory.
const COUNT_SIZE: usize = 4;

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy)]
struct RawDirEntry {
    inode: U16<LittleEndian>,
    name: [u8; NAME_LEN],
    is_dir: u8,
}

const _: () = assert!(std::mem::size_of::<RawDirEntry>() == ENTRY_SIZE);

/// A name bound to an inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    inode: BlockIndex,
    name: String,
    is_dir: bool,
}

impl DirEntry {
    pub fn new(inode: BlockIndex, name: &str, is_dir: bool) -> Result<Self> {
        if name.is_empty() || name.len() > NAME_LEN || name.contains(&['/', '\0'][..]) {
            return Err(FsError::InvalidName(name.to_string()));
        }
        Ok(Self {
            inode,
            name: name.to_string(),
            is_dir,
        })
    }

    /// The entry stored after the inode table that anchors the tree.
    pub fn root(inode: BlockIndex) -> Self {
        Self {
            inode,
            name: "/".to_string(),
            is_dir: true,
        }
    }

    pub fn inode(&self) -> BlockIndex {
        self.inode
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut raw = RawDirEntry {
            inode: U16::new(self.inode),
            name: [0; NAME_LEN],
            is_dir: self.is_dir as u8,
        };
        let bytes = self.name.as_bytes();
        raw.name[..bytes.len()].copy_from_slice(bytes);
        let mut out = [0; ENTRY_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw = RawDirEntry::read_from_prefix(bytes)
            .ok_or_else(|| FsError::Corrupt("truncated directory entry".to_string()))?;
        let end = raw.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        let name = std::str::from_utf8(&raw.name[..end])
            .map_err(|_| FsError::Corrupt("directory entry name is not UTF-8".to_string()))?;
        if name.is_empty() {
            return Err(FsError::Corrupt("directory entry without a name".to_string()));
        }
        Ok(Self {
            inode: raw.inode.get(),
            name: name.to_string(),
            is_dir: raw.is_dir != 0,
        })
    }
}

/// The entries of one directory, kept sorted by name.
///
/// Every directory carries `.` and `..`; they resolve like any other name but
/// are left out of `entries`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    entries: BTreeMap<String, DirEntry>,
}

impl Directory {
    pub fn new(parent: BlockIndex, current: BlockIndex) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(".".to_string(), DirEntry::dot(".", current));
        entries.insert("..".to_string(), DirEntry::dot("..", parent));
        Self { entries }
    }

    pub fn add_entry(&mut self, entry: DirEntry) -> Result<()> {
        match self.entries.entry(entry.name.clone()) {
            btree_map::Entry::Occupied(_) => Err(FsError::DuplicateName(entry.name)),
            btree_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Drops the entry called `name`, if there is one.
    pub fn remove_entry(&mut self, name: &str) -> Option<DirEntry> {
        self.entries.remove(name)
    }

    pub fn lookup(&self, name: &str) -> Result<BlockIndex> {
        self.get(name)
            .map(DirEntry::inode)
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&DirEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Entries other than `.` and `..`, ordered by name.
    pub fn entries(&self) -> impl Iterator<Item = &DirEntry> + '_ {
        self.entries.values().filter(|e| !e.is_synthetic())
    }

    /// Number of stored entries, `.` and `..` included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(COUNT_SIZE + self.entries.len() * ENTRY_SIZE);
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in self.entries.values() {
            buf.extend_from_slice(&entry.encode());
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < COUNT_SIZE {
            return Err(FsError::Corrupt("directory without an entry count".to_string()));
        }
        let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let body = &bytes[COUNT_SIZE..];
        if count.saturating_mul(ENTRY_SIZE) > body.len() {
            return Err(FsError::Corrupt(format!(
                "directory claims {} entries but holds {} bytes",
                count,
                body.len()
            )));
        }
        let mut entries = BTreeMap::new();
        for raw in body.chunks_exact(ENTRY_SIZE).take(count) {
            let entry = DirEntry::decode(raw)?;
            if entries.insert(entry.name.clone(), entry).is_some() {
                return Err(FsError::Corrupt("directory repeats a name".to_string()));
            }
        }
        Ok(Self { entries })
    }
}

impl DirEntry {
    fn dot(name: &str, inode: BlockIndex) -> Self {
        Self {
            inode,
            name: name.to_string(),
            is_dir: true,
        }
    }

    fn is_synthetic(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_directory_links_itself_and_its_parent() {
        let dir = Directory::new(0, 3);
        assert_eq!(dir.lookup(".").unwrap(), 3);
        assert_eq!(dir.lookup("..").unwrap(), 0);
        assert_eq!(dir.len(), 2);
        assert!(dir.is_empty());
        assert_eq!(dir.entries().count(), 0);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut dir = Directory::new(0, 0);
        dir.add_entry(DirEntry::new(1, "a", false).unwrap()).unwrap();
        match dir.add_entry(DirEntry::new(2, "a", true).unwrap()) {
            Err(FsError::DuplicateName(name)) => assert_eq!(name, "a"),
            other => panic!("expected DuplicateName, got {:?}", other),
        }
        assert_eq!(dir.lookup("a").unwrap(), 1);
    }

    #[test]
    fn removing_missing_names_is_a_no_op() {
        let mut dir = Directory::new(0, 0);
        dir.add_entry(DirEntry::new(1, "a", false).unwrap()).unwrap();
        assert!(dir.remove_entry("b").is_none());
        assert!(dir.remove_entry("a").is_some());
        assert!(matches!(dir.lookup("a"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn entries_are_ordered_and_skip_dot_entries() {
        let mut dir = Directory::new(0, 5);
        for (inode, name) in [(3, "zeta"), (1, "alpha"), (2, "mid")] {
            dir.add_entry(DirEntry::new(inode, name, false).unwrap()).unwrap();
        }
        let names: Vec<_> = dir.entries().map(DirEntry::name).collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
        // Restartable.
        assert_eq!(dir.entries().count(), 3);
    }

    #[test]
    fn entry_names_are_validated() {
        assert!(DirEntry::new(1, "thirteen_char", false).is_ok());
        for bad in ["", "fourteen_chars", "a/b", "nul\0"] {
            assert!(matches!(
                DirEntry::new(1, bad, false),
                Err(FsError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn directory_survives_encoding() {
        let mut dir = Directory::new(7, 9);
        dir.add_entry(DirEntry::new(10, "docs", true).unwrap()).unwrap();
        dir.add_entry(DirEntry::new(11, "thirteen_char", false).unwrap())
            .unwrap();

        let bytes = dir.encode();
        assert_eq!(bytes.len(), 4 + 4 * ENTRY_SIZE);
        assert_eq!(&bytes[..4], &4u32.to_le_bytes());
        assert_eq!(Directory::decode(&bytes).unwrap(), dir);
    }

    #[test]
    fn entry_layout_is_inode_name_flag() {
        let bytes = DirEntry::new(0x0102, "ab", true).unwrap().encode();
        assert_eq!(&bytes[..2], &[0x02, 0x01]);
        assert_eq!(&bytes[2..4], b"ab");
        assert_eq!(bytes[15], 1);
    }

    #[test]
    fn short_buffers_are_corrupt() {
        let dir = Directory::new(0, 0);
        let bytes = dir.encode();
        assert!(matches!(
            Directory::decode(&bytes[..bytes.len() - 1]),
            Err(FsError::Corrupt(_))
        ));
        assert!(matches!(Directory::decode(&[1, 0]), Err(FsError::Corrupt(_))));

        let mut lying = bytes.clone();
        lying[0] = 200;
        assert!(matches!(Directory::decode(&lying), Err(FsError::Corrupt(_))));
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let dir = Directory::new(1, 2);
        let mut bytes = dir.encode();
        bytes.resize(128, 0);
        assert_eq!(Directory::decode(&bytes).unwrap(), dir);
    }
}
