use crate::alloc::{BlockIndex, BlockManager};
use crate::directory::{DirEntry, Directory, NAME_LEN};
use crate::error::{FsError, Result};
use crate::io::{DiskStorage, FileDisk};
use crate::node::{DataRegion, Geometry, Inode};
use crate::report::{Dump, Finding, FsckReport, InodeDump, ListEntry};
use crate::sb::{Layout, Settings, SuperBlock, ROOT_ENTRY_SIZE, SUPERBLOCK_SIZE};

use log::{debug, info, warn};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// An absolute path split into the directories to walk and, unless the path
/// names a directory itself, the final entry.
#[derive(Debug, PartialEq, Eq)]
struct ParsedPath<'p> {
    dirs: Vec<&'p str>,
    leaf: Option<&'p str>,
}

impl<'p> ParsedPath<'p> {
    fn parse(path: &'p str) -> Result<Self> {
        let invalid = || FsError::InvalidPath(path.to_string());
        let rest = path.strip_prefix('/').ok_or_else(invalid)?;
        if rest.starts_with('/') {
            return Err(invalid());
        }
        let (body, names_dir) = match rest.strip_suffix('/') {
            Some(body) => (body, true),
            None => (rest, rest.is_empty()),
        };
        let mut dirs: Vec<&str> = if body.is_empty() {
            Vec::new()
        } else {
            body.split('/').collect()
        };
        if dirs
            .iter()
            .any(|seg| seg.is_empty() || seg.len() > NAME_LEN || seg.contains('\0'))
        {
            return Err(invalid());
        }
        let leaf = if names_dir { None } else { dirs.pop() };
        Ok(Self { dirs, leaf })
    }

    /// Like `parse`, but a trailing `/` still names the final entry.
    fn parse_entry(path: &'p str) -> Result<Self> {
        match path.strip_suffix('/') {
            Some(trimmed) if !trimmed.is_empty() => Self::parse(trimmed),
            _ => Self::parse(path),
        }
    }
}

fn join(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

/// A formatted disk image.
///
/// # Layout
/// ==========================================================================
/// | SuperBlock | Bitmap (data) | Bitmap (inodes) | Inodes | Root | Data    |
/// ==========================================================================
///
/// The handle owns its medium. Both allocators are kept in memory and written
/// back after every operation that changes them; `close` writes the remaining
/// metadata and syncs.
pub struct FileSystem<D: DiskStorage> {
    dev: D,
    layout: Layout,
    geometry: Geometry,
    inodes: BlockManager,
    blocks: BlockManager,
    root: BlockIndex,
}

impl FileSystem<FileDisk> {
    /// Formats the image file at `path`, creating it if needed. The settings
    /// are validated before the file is touched.
    pub fn format<P: AsRef<Path>>(path: P, settings: &Settings) -> Result<Self> {
        settings.layout()?;
        let disk = FileDisk::create(path, settings.capacity())?;
        Self::create(disk, settings)
    }

    /// Opens the formatted image file at `path`.
    pub fn mount<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(FileDisk::open(path)?)
    }
}

impl<D: DiskStorage> FileSystem<D> {
    /// Initializes an empty file system with a root directory on a zeroed medium.
    pub fn create(dev: D, settings: &Settings) -> Result<Self> {
        let layout = settings.layout()?;
        if dev.capacity() < layout.data_end() {
            return Err(FsError::InvalidConfiguration(format!(
                "medium of {} bytes is smaller than the {} byte layout",
                dev.capacity(),
                layout.data_end()
            )));
        }
        let geometry = Geometry::new(layout.block_size)?;
        let mut fs = Self {
            inodes: BlockManager::new(
                "inode",
                layout.inode_count,
                layout.block_size,
                layout.inode_offset,
            )?,
            blocks: BlockManager::new(
                "data block",
                layout.block_count,
                layout.block_size,
                layout.block_offset,
            )?,
            dev,
            layout,
            geometry,
            root: 0,
        };

        fs.root = fs.inodes.allocate()?;
        let mut inode = Inode::new(&fs.geometry, "/");
        let root_dir = Directory::new(fs.root, fs.root);
        fs.region().write_data(&mut inode, &root_dir.encode())?;
        fs.write_inode(fs.root, &inode)?;
        fs.persist()?;
        fs.dev.sync_disk()?;
        info!(
            "created file system: {} inodes, {} blocks of {} bytes",
            layout.inode_count, layout.block_count, layout.block_size
        );
        Ok(fs)
    }

    /// Loads a file system previously written by `create`.
    pub fn open(mut dev: D) -> Result<Self> {
        if dev.capacity() < SUPERBLOCK_SIZE {
            return Err(FsError::NotInitialized(format!(
                "medium of {} bytes cannot hold a superblock",
                dev.capacity()
            )));
        }
        let mut buf = [0; SUPERBLOCK_SIZE as usize];
        dev.read_at(0, &mut buf)?;
        let sb = SuperBlock::parse(&buf)?;
        let layout = Layout::from_superblock(&sb, dev.capacity())?;
        let geometry = Geometry::new(layout.block_size)?;

        let mut inodes = BlockManager::new(
            "inode",
            layout.inode_count,
            layout.block_size,
            layout.inode_offset,
        )?;
        let mut blocks = BlockManager::new(
            "data block",
            layout.block_count,
            layout.block_size,
            layout.block_offset,
        )?;
        let mut bitmap = vec![0; blocks.snapshot_bitmap().len()];
        dev.read_at(layout.block_bitmap_offset, &mut bitmap)?;
        blocks.restore_bitmap(&bitmap)?;
        let mut bitmap = vec![0; inodes.snapshot_bitmap().len()];
        dev.read_at(layout.inode_bitmap_offset, &mut bitmap)?;
        inodes.restore_bitmap(&bitmap)?;

        let mut raw_root = [0; ROOT_ENTRY_SIZE as usize];
        dev.read_at(layout.root_entry_offset, &mut raw_root)?;
        let root = DirEntry::decode(&raw_root)?;
        if !root.is_dir() || inodes.is_free(root.inode()) {
            return Err(FsError::Corrupt(format!(
                "root entry points at unusable inode {}",
                root.inode()
            )));
        }

        info!(
            "opened file system: {}/{} inodes free, {}/{} blocks free",
            inodes.free_count(),
            inodes.total(),
            blocks.free_count(),
            blocks.total()
        );
        Ok(Self {
            dev,
            layout,
            geometry,
            inodes,
            blocks,
            root: root.inode(),
        })
    }

    /// Writes back all metadata, syncs, and hands the medium back.
    pub fn close(mut self) -> Result<D> {
        self.persist()?;
        self.dev.sync_disk()?;
        info!("closed file system");
        Ok(self.dev)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Finds the entry a path refers to. `/` resolves to the root entry.
    pub fn resolve(&mut self, path: &str) -> Result<DirEntry> {
        let parsed = ParsedPath::parse(path)?;
        let (dirs, leaf, want_dir) = match parsed.leaf {
            Some(leaf) => (&parsed.dirs[..], leaf, false),
            None => match parsed.dirs.split_last() {
                Some((last, dirs)) => (dirs, *last, true),
                None => return Ok(DirEntry::root(self.root)),
            },
        };
        let (_, dir) = self.walk(path, dirs)?;
        match dir.get(leaf) {
            Some(entry) if entry.is_dir() || !want_dir => Ok(entry.clone()),
            _ => Err(FsError::NoSuchPath(path.to_string())),
        }
    }

    /// Lists a directory. The path always names a directory, with or without
    /// a trailing `/`.
    pub fn list(&mut self, path: &str) -> Result<Vec<ListEntry>> {
        let target = self.resolve(path)?;
        if !target.is_dir() {
            return Err(FsError::NoSuchPath(path.to_string()));
        }
        let dir = self.read_dir(target.inode())?;
        let mut listing = Vec::with_capacity(dir.len());
        for entry in dir.entries() {
            let (size, modified) = match self.read_inode(entry.inode()) {
                Ok(inode) => (inode.size, inode.modified_at()),
                Err(FsError::NotAllocated { .. }) => {
                    warn!("{} refers to free inode {}", entry.name(), entry.inode());
                    (0, None)
                }
                Err(err) => return Err(err),
            };
            listing.push(ListEntry {
                name: entry.name().to_string(),
                is_dir: entry.is_dir(),
                size,
                modified,
            });
        }
        Ok(listing)
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let parsed = ParsedPath::parse_entry(path)?;
        let leaf = parsed
            .leaf
            .ok_or_else(|| FsError::AlreadyExists(path.to_string()))?;
        let index = self.mutate(|fs| {
            let (parent, mut dir) = fs.walk(path, &parsed.dirs)?;
            if dir.contains(leaf) {
                return Err(FsError::AlreadyExists(path.to_string()));
            }
            fs.install(parent, &mut dir, leaf, None)
        })?;
        info!("mkdir {} (inode {})", path, index);
        Ok(())
    }

    /// Removes a directory and everything below it.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let parsed = ParsedPath::parse_entry(path)?;
        let leaf = match parsed.leaf {
            Some(leaf) if leaf != "." && leaf != ".." => leaf,
            _ => return Err(FsError::InvalidPath(path.to_string())),
        };
        let released = self.mutate(|fs| {
            let (parent, mut dir) = fs.walk(path, &parsed.dirs)?;
            let top = match dir.get(leaf) {
                Some(entry) if entry.is_dir() => entry.inode(),
                _ => return Err(FsError::NoSuchPath(path.to_string())),
            };

            let doomed = fs.collect_subtree(top)?;
            for &index in doomed.iter() {
                fs.release_inode(index)?;
            }
            dir.remove_entry(leaf);
            fs.write_dir(parent, &dir)?;
            Ok(doomed.len())
        })?;
        info!("rmdir {} ({} inodes released)", path, released);
        Ok(())
    }

    /// Stores `data` as the file at `path`. An existing file of that name is
    /// deleted first and the content goes to a freshly allocated inode. If the
    /// new content cannot fit even with the old file's blocks returned, the old
    /// file is kept.
    pub fn write(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let parsed = ParsedPath::parse(path)?;
        let leaf = parsed
            .leaf
            .ok_or_else(|| FsError::IsDirectory(path.to_string()))?;
        let index = self.mutate(|fs| {
            let (parent, mut dir) = fs.walk(path, &parsed.dirs)?;
            if let Some(existing) = dir.get(leaf).cloned() {
                if existing.is_dir() {
                    return Err(FsError::IsDirectory(path.to_string()));
                }
                fs.check_room(existing.inode(), data.len() as u64)?;
                fs.release_inode(existing.inode())?;
                dir.remove_entry(leaf);
                fs.write_dir(parent, &dir)?;
                debug!("replacing {} (inode {})", path, existing.inode());
            }
            fs.install(parent, &mut dir, leaf, Some(data))
        })?;
        info!("wrote {} bytes to {} (inode {})", data.len(), path, index);
        Ok(())
    }

    pub fn read(&mut self, path: &str) -> Result<Vec<u8>> {
        let entry = self.file_entry(path)?;
        let inode = self.read_inode(entry.inode())?;
        self.region().read_data(&inode)
    }

    /// Deletes a file. Fails without touching the image if there is nothing to
    /// delete.
    pub fn del(&mut self, path: &str) -> Result<()> {
        let parsed = ParsedPath::parse(path)?;
        let leaf = parsed
            .leaf
            .ok_or_else(|| FsError::IsDirectory(path.to_string()))?;
        let index = self.mutate(|fs| {
            let (parent, mut dir) = fs.walk(path, &parsed.dirs)?;
            let entry = match dir.get(leaf) {
                Some(entry) if entry.is_dir() => {
                    return Err(FsError::IsDirectory(path.to_string()))
                }
                Some(entry) => entry.clone(),
                None => return Err(FsError::NoSuchPath(path.to_string())),
            };
            fs.release_inode(entry.inode())?;
            dir.remove_entry(leaf);
            fs.write_dir(parent, &dir)?;
            Ok(entry.inode())
        })?;
        info!("deleted {} (inode {})", path, index);
        Ok(())
    }

    /// Copies the content of the file at `src` into a new file at `dst`,
    /// replacing any file already there. The two never share an inode; see
    /// `lnsym` for that.
    pub fn ln(&mut self, src: &str, dst: &str) -> Result<()> {
        let data = self.read(src)?;
        self.write(dst, &data)
    }

    /// Adds `dst` as a second name for the inode of the file at `src`. Deleting
    /// or overwriting either name leaves the other pointing at a free inode.
    pub fn lnsym(&mut self, src: &str, dst: &str) -> Result<()> {
        let target = self.file_entry(src)?;
        let parsed = ParsedPath::parse(dst)?;
        let leaf = parsed
            .leaf
            .ok_or_else(|| FsError::AlreadyExists(dst.to_string()))?;
        self.mutate(|fs| {
            let (parent, mut dir) = fs.walk(dst, &parsed.dirs)?;
            if dir.contains(leaf) {
                return Err(FsError::AlreadyExists(dst.to_string()));
            }
            dir.add_entry(DirEntry::new(target.inode(), leaf, false)?)?;
            fs.write_dir(parent, &dir)
        })?;
        info!("linked {} to {} (inode {})", dst, src, target.inode());
        Ok(())
    }

    /// Counts and the block list of every occupied inode.
    pub fn dumpe2fs(&mut self) -> Result<Dump> {
        let occupied: Vec<BlockIndex> = self.inodes.occupied().collect();
        let mut inodes = Vec::with_capacity(occupied.len());
        for index in occupied {
            let inode = self.read_inode(index)?;
            let chain = self.region().resolve_blocks(&inode)?;
            inodes.push(InodeDump {
                index,
                name: inode.name(),
                size: inode.size,
                blocks: chain.all_blocks().collect(),
            });
        }
        Ok(Dump {
            block_size: self.layout.block_size,
            inode_count: self.inodes.total(),
            block_count: self.blocks.total(),
            free_inodes: self.inodes.free_count(),
            free_blocks: self.blocks.free_count(),
            inodes,
        })
    }

    /// Checks the bitmaps against the inodes and the directory tree.
    pub fn fsck(&mut self) -> Result<FsckReport> {
        let mut findings = Vec::new();

        let occupied: Vec<BlockIndex> = self.inodes.occupied().collect();
        let mut owners: BTreeMap<BlockIndex, Vec<BlockIndex>> = BTreeMap::new();
        for &index in occupied.iter() {
            let chain = self
                .read_inode(index)
                .and_then(|inode| self.region().resolve_blocks(&inode));
            match chain {
                Ok(chain) => {
                    for block in chain.all_blocks() {
                        owners.entry(block).or_default().push(index);
                    }
                }
                Err(err) => findings.push(Finding::DamagedInode {
                    inode: index,
                    reason: err.to_string(),
                }),
            }
        }
        for (&block, inodes) in owners.iter() {
            if self.blocks.is_free(block) {
                findings.push(Finding::UnallocatedBlock {
                    inode: inodes[0],
                    block,
                });
            }
            if inodes.len() > 1 {
                findings.push(Finding::SharedBlock {
                    block,
                    inodes: inodes.clone(),
                });
            }
        }
        findings.extend(
            self.blocks
                .occupied()
                .filter(|block| !owners.contains_key(block))
                .map(Finding::UnreferencedBlock),
        );

        let mut referenced = BTreeSet::new();
        referenced.insert(self.root);
        let mut pending = vec![("/".to_string(), self.root)];
        while let Some((path, index)) = pending.pop() {
            let dir = match self.read_dir(index) {
                Ok(dir) => dir,
                Err(err) => {
                    findings.push(Finding::DamagedInode {
                        inode: index,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            for entry in dir.entries() {
                let child = join(&path, entry.name());
                if self.inodes.is_free(entry.inode()) {
                    findings.push(Finding::DanglingEntry {
                        path: child,
                        inode: entry.inode(),
                    });
                } else if referenced.insert(entry.inode()) && entry.is_dir() {
                    pending.push((child, entry.inode()));
                }
            }
        }
        findings.extend(
            occupied
                .iter()
                .filter(|index| !referenced.contains(*index))
                .map(|&index| Finding::OrphanInode(index)),
        );

        for finding in findings.iter() {
            warn!("fsck: {}", finding);
        }
        Ok(FsckReport {
            blocks_in_use: (0..self.blocks.total())
                .map(|i| !self.blocks.is_free(i as BlockIndex))
                .collect(),
            inodes_in_use: (0..self.inodes.total())
                .map(|i| !self.inodes.is_free(i as BlockIndex))
                .collect(),
            findings,
        })
    }

    /// The entry of an existing regular file.
    fn file_entry(&mut self, path: &str) -> Result<DirEntry> {
        let parsed = ParsedPath::parse(path)?;
        let leaf = parsed
            .leaf
            .ok_or_else(|| FsError::IsDirectory(path.to_string()))?;
        let (_, dir) = self.walk(path, &parsed.dirs)?;
        match dir.get(leaf) {
            Some(entry) if entry.is_dir() => Err(FsError::IsDirectory(path.to_string())),
            Some(entry) => Ok(entry.clone()),
            None => Err(FsError::NoSuchPath(path.to_string())),
        }
    }

    /// Follows `dirs` down from the root, returning the last directory reached.
    fn walk(&mut self, path: &str, dirs: &[&str]) -> Result<(BlockIndex, Directory)> {
        let mut current = self.root;
        let mut dir = self.read_dir(current)?;
        for name in dirs {
            match dir.get(name) {
                Some(entry) if entry.is_dir() => current = entry.inode(),
                _ => return Err(FsError::NoSuchPath(path.to_string())),
            }
            dir = self.read_dir(current)?;
        }
        debug!("{} resolved through inode {}", path, current);
        Ok((current, dir))
    }

    /// Allocates a node and links it into `dir` as `name`. The node holds
    /// `content`, or is a new empty directory when `content` is `None`.
    /// Nothing stays allocated if any step fails.
    fn install(
        &mut self,
        parent: BlockIndex,
        dir: &mut Directory,
        name: &str,
        content: Option<&[u8]>,
    ) -> Result<BlockIndex> {
        let index = self.inodes.allocate()?;
        let mut inode = Inode::new(&self.geometry, name);
        let data = match content {
            Some(bytes) => Cow::Borrowed(bytes),
            None => Cow::Owned(Directory::new(parent, index).encode()),
        };
        if let Err(err) = self.region().write_data(&mut inode, &data) {
            self.inodes.deallocate(index)?;
            return Err(err);
        }

        let linked = self.write_inode(index, &inode).and_then(|()| {
            dir.add_entry(DirEntry::new(index, name, content.is_none())?)?;
            self.write_dir(parent, dir)
        });
        if let Err(err) = linked {
            dir.remove_entry(name);
            self.region().release(&mut inode)?;
            self.inodes.deallocate(index)?;
            return Err(err);
        }
        Ok(index)
    }

    /// Fails with `OutOfSpace` unless `size` bytes fit in the free blocks plus
    /// those held by the file at `index`.
    fn check_room(&mut self, index: BlockIndex, size: u64) -> Result<()> {
        if size > self.geometry.max_file_size() {
            return Err(FsError::FileTooLarge(size));
        }
        let held = if self.inodes.is_free(index) {
            0
        } else {
            let inode = self.read_inode(index)?;
            self.geometry.blocks_required(inode.size as u64)
        };
        if self.geometry.blocks_required(size) > self.blocks.free_count() as u64 + held {
            return Err(FsError::OutOfSpace(self.blocks.kind()));
        }
        Ok(())
    }

    /// Runs a mutating operation and writes both bitmaps whether or not it
    /// succeeded, so the image never keeps directory blocks written against
    /// stale maps.
    fn mutate<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let outcome = op(self);
        let flushed = self.flush_maps();
        let value = outcome?;
        flushed?;
        Ok(value)
    }

    /// Every inode below `top`, `top` included, each listed once and after
    /// all of its descendants.
    fn collect_subtree(&mut self, top: BlockIndex) -> Result<Vec<BlockIndex>> {
        let mut order = Vec::new();
        let mut seen = BTreeSet::new();
        seen.insert(top);
        let mut pending = vec![(top, true)];
        while let Some((index, is_dir)) = pending.pop() {
            order.push(index);
            if !is_dir {
                continue;
            }
            if self.inodes.is_free(index) {
                warn!("directory inode {} is already free", index);
                continue;
            }
            for entry in self.read_dir(index)?.entries() {
                if seen.insert(entry.inode()) {
                    pending.push((entry.inode(), entry.is_dir()));
                }
            }
        }
        order.reverse();
        Ok(order)
    }

    /// Frees an inode and its chain. Inodes already freed through another name
    /// are skipped.
    fn release_inode(&mut self, index: BlockIndex) -> Result<()> {
        if self.inodes.is_free(index) {
            warn!("inode {} is already free", index);
            return Ok(());
        }
        let mut inode = self.read_inode(index)?;
        self.region().release(&mut inode)?;
        self.inodes.deallocate(index)
    }

    fn read_inode(&mut self, index: BlockIndex) -> Result<Inode> {
        let raw = self.inodes.read_block(&mut self.dev, index)?;
        Inode::decode(&self.geometry, &raw)
    }

    fn write_inode(&mut self, index: BlockIndex, inode: &Inode) -> Result<()> {
        self.inodes
            .write_block(&mut self.dev, index, &inode.encode(&self.geometry))
    }

    fn read_dir(&mut self, index: BlockIndex) -> Result<Directory> {
        let inode = self.read_inode(index)?;
        Directory::decode(&self.region().read_data(&inode)?)
    }

    fn write_dir(&mut self, index: BlockIndex, dir: &Directory) -> Result<()> {
        let mut inode = self.read_inode(index)?;
        self.region().write_data(&mut inode, &dir.encode())?;
        self.write_inode(index, &inode)
    }

    fn region(&mut self) -> DataRegion<'_, D> {
        DataRegion::new(self.geometry, &mut self.blocks, &mut self.dev)
    }

    /// Writes both bitmaps.
    fn flush_maps(&mut self) -> Result<()> {
        self.dev
            .write_at(self.layout.block_bitmap_offset, &self.blocks.snapshot_bitmap())?;
        self.dev
            .write_at(self.layout.inode_bitmap_offset, &self.inodes.snapshot_bitmap())?;
        Ok(())
    }

    /// Writes the superblock, both bitmaps and the root entry.
    fn persist(&mut self) -> Result<()> {
        self.dev.write_at(0, self.layout.superblock().serialize())?;
        self.flush_maps()?;
        self.dev.write_at(
            self.layout.root_entry_offset,
            &DirEntry::root(self.root).encode(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileDiskBuilder;
    use crate::sb::DEFAULT_CAPACITY;

    fn create_test_fs(block_size: u32, inode_count: u32) -> FileSystem<FileDisk> {
        let dev = FileDiskBuilder::from(tempfile::tempfile().unwrap())
            .with_capacity(DEFAULT_CAPACITY)
            .build()
            .expect("Could not initialize disk emulator.");
        FileSystem::create(dev, &Settings::new(block_size, inode_count)).unwrap()
    }

    fn names(fs: &mut FileSystem<FileDisk>, path: &str) -> Vec<String> {
        fs.list(path).unwrap().into_iter().map(|e| e.name).collect()
    }

    #[test]
    fn paths_split_into_directories_and_leaf() {
        let parse = |p| ParsedPath::parse(p).unwrap();
        assert_eq!(parse("/"), ParsedPath { dirs: vec![], leaf: None });
        assert_eq!(parse("/a"), ParsedPath { dirs: vec![], leaf: Some("a") });
        assert_eq!(parse("/a/b"), ParsedPath { dirs: vec!["a"], leaf: Some("b") });
        assert_eq!(parse("/a/b/"), ParsedPath { dirs: vec!["a", "b"], leaf: None });
        assert_eq!(
            ParsedPath::parse_entry("/a/b/").unwrap(),
            ParsedPath { dirs: vec!["a"], leaf: Some("b") }
        );

        for bad in ["", "a", "a/b", "//", "/a//b", "/fourteen_chars"] {
            assert!(
                matches!(ParsedPath::parse(bad), Err(FsError::InvalidPath(_))),
                "{:?} parsed",
                bad
            );
        }
    }

    #[test]
    fn new_file_system_holds_only_the_root() {
        let mut fs = create_test_fs(64, 8);
        assert!(fs.list("/").unwrap().is_empty());

        let dump = fs.dumpe2fs().unwrap();
        assert_eq!(dump.inode_count, 8);
        assert_eq!(dump.free_inodes, 7);
        assert_eq!(dump.block_count, 16343);
        assert_eq!(dump.free_blocks, 16343 - 1);
        assert_eq!(dump.inodes.len(), 1);
        assert_eq!(dump.inodes[0].name, "/");
        assert!(fs.fsck().unwrap().is_clean());
    }

    #[test]
    fn root_resolves_to_itself() {
        let mut fs = create_test_fs(64, 8);
        let root = fs.resolve("/").unwrap();
        assert!(root.is_dir());
        assert_eq!(fs.resolve("/./../.").unwrap().inode(), root.inode());
    }

    #[test]
    fn mkdir_rejects_existing_and_unreachable_paths() {
        let mut fs = create_test_fs(64, 8);
        fs.mkdir("/a").unwrap();

        assert!(matches!(fs.mkdir("/a"), Err(FsError::AlreadyExists(_))));
        assert!(matches!(fs.mkdir("/a/"), Err(FsError::AlreadyExists(_))));
        assert!(matches!(fs.mkdir("/"), Err(FsError::AlreadyExists(_))));
        assert!(matches!(fs.mkdir("/x/y"), Err(FsError::NoSuchPath(_))));

        fs.write("/f", b"file").unwrap();
        assert!(matches!(fs.mkdir("/f/y"), Err(FsError::NoSuchPath(_))));
    }

    #[test]
    fn nested_directories_link_to_their_parent() {
        let mut fs = create_test_fs(64, 8);
        fs.mkdir("/a").unwrap();
        fs.mkdir("/a/b").unwrap();
        fs.write("/a/b/f", b"deep").unwrap();

        assert_eq!(fs.read("/a/b/../b/./f").unwrap(), b"deep");
        let a = fs.resolve("/a/").unwrap();
        assert_eq!(fs.resolve("/a/b/..").unwrap().inode(), a.inode());
        assert_eq!(names(&mut fs, "/a"), ["b"]);
        assert_eq!(names(&mut fs, "/a/b/"), ["f"]);
    }

    #[test]
    fn directories_are_not_files() {
        let mut fs = create_test_fs(64, 8);
        fs.mkdir("/d").unwrap();

        assert!(matches!(fs.write("/d", b"x"), Err(FsError::IsDirectory(_))));
        assert!(matches!(fs.read("/d"), Err(FsError::IsDirectory(_))));
        assert!(matches!(fs.read("/"), Err(FsError::IsDirectory(_))));
        assert!(matches!(fs.del("/d"), Err(FsError::IsDirectory(_))));
        assert!(matches!(fs.ln("/d", "/e"), Err(FsError::IsDirectory(_))));
        assert!(matches!(fs.lnsym("/d", "/e"), Err(FsError::IsDirectory(_))));
        assert!(matches!(fs.rmdir("/missing"), Err(FsError::NoSuchPath(_))));

        fs.write("/f", b"x").unwrap();
        assert!(matches!(fs.rmdir("/f"), Err(FsError::NoSuchPath(_))));
        assert!(matches!(fs.list("/f"), Err(FsError::NoSuchPath(_))));
        assert!(matches!(fs.rmdir("/"), Err(FsError::InvalidPath(_))));
    }

    #[test]
    fn overwriting_replaces_content_and_frees_old_blocks() {
        let mut fs = create_test_fs(64, 8);
        let before = fs.dumpe2fs().unwrap().free_blocks;

        fs.write("/f", &[7; 64 * 20]).unwrap();
        fs.write("/f", b"short").unwrap();
        assert_eq!(fs.read("/f").unwrap(), b"short");

        // One data block for the file, the root directory keeps its one block.
        assert_eq!(fs.dumpe2fs().unwrap().free_blocks, before - 1);
        assert!(fs.fsck().unwrap().is_clean());
    }

    #[test]
    fn empty_files_hold_no_blocks() {
        let mut fs = create_test_fs(64, 8);
        fs.write("/empty", b"").unwrap();
        assert_eq!(fs.read("/empty").unwrap(), b"");
        let listing = fs.list("/").unwrap();
        assert_eq!(listing[0].size, 0);
        assert!(!listing[0].is_dir);
    }

    #[test]
    fn ln_copies_and_lnsym_aliases() {
        let mut fs = create_test_fs(64, 8);
        fs.write("/src", b"original").unwrap();

        fs.ln("/src", "/copy").unwrap();
        fs.lnsym("/src", "/alias").unwrap();
        let src = fs.resolve("/src").unwrap().inode();
        assert_ne!(fs.resolve("/copy").unwrap().inode(), src);
        assert_eq!(fs.resolve("/alias").unwrap().inode(), src);

        assert!(matches!(
            fs.lnsym("/src", "/copy"),
            Err(FsError::AlreadyExists(_))
        ));
        assert!(matches!(fs.lnsym("/nope", "/x"), Err(FsError::NoSuchPath(_))));

        // ln overwrites its destination.
        fs.write("/other", b"other").unwrap();
        fs.ln("/other", "/copy").unwrap();
        assert_eq!(fs.read("/copy").unwrap(), b"other");
        assert_eq!(fs.read("/alias").unwrap(), b"original");
        assert!(fs.fsck().unwrap().is_clean());
    }

    #[test]
    fn rmdir_frees_the_whole_subtree_once() {
        let mut fs = create_test_fs(64, 8);
        let free_blocks = fs.dumpe2fs().unwrap().free_blocks;

        fs.mkdir("/a").unwrap();
        fs.mkdir("/a/b").unwrap();
        fs.write("/a/b/f", &[1; 200]).unwrap();
        fs.lnsym("/a/b/f", "/a/g").unwrap();
        fs.write("/a/h", b"h").unwrap();

        fs.rmdir("/a").unwrap();
        assert!(fs.list("/").unwrap().is_empty());
        let dump = fs.dumpe2fs().unwrap();
        assert_eq!(dump.free_inodes, 7);
        assert_eq!(dump.free_blocks, free_blocks);
        assert!(fs.fsck().unwrap().is_clean());
    }

    #[test]
    fn directories_grow_past_one_block() {
        let mut fs = create_test_fs(64, 16);
        for i in 0..12 {
            fs.write(&format!("/file{:02}", i), &[i as u8]).unwrap();
        }
        let listing = names(&mut fs, "/");
        assert_eq!(listing.len(), 12);
        assert_eq!(listing[0], "file00");
        assert_eq!(listing[11], "file11");

        // Count plus fourteen entries spans four blocks.
        let root = fs.dumpe2fs().unwrap().inodes.remove(0);
        assert_eq!(root.size, 4 + 14 * 16);
        assert_eq!(root.blocks.len(), 4);
        assert_eq!(fs.read("/file07").unwrap(), [7]);
    }

    #[test]
    fn running_out_of_inodes_leaves_nothing_behind() {
        let mut fs = create_test_fs(64, 2);
        fs.write("/one", b"1").unwrap();
        let before = fs.dumpe2fs().unwrap();

        assert!(matches!(fs.write("/two", b"2"), Err(FsError::OutOfSpace("inode"))));
        assert!(matches!(fs.mkdir("/d"), Err(FsError::OutOfSpace("inode"))));
        assert_eq!(fs.dumpe2fs().unwrap(), before);
        assert!(fs.fsck().unwrap().is_clean());
    }

    #[test]
    fn running_out_of_blocks_leaves_nothing_behind() {
        let mut fs = create_test_fs(64, 8);
        let free = fs.dumpe2fs().unwrap().free_blocks as usize;

        let too_much = vec![3; free * 64];
        assert!(matches!(
            fs.write("/big", &too_much),
            Err(FsError::OutOfSpace("data block"))
        ));
        assert_eq!(fs.dumpe2fs().unwrap().free_blocks as usize, free);
        assert_eq!(fs.dumpe2fs().unwrap().free_inodes, 7);
        assert!(matches!(fs.read("/big"), Err(FsError::NoSuchPath(_))));
    }

    #[test]
    fn failed_overwrite_keeps_the_old_file() {
        let mut fs = create_test_fs(64, 8);
        fs.write("/f", &[1; 64 * 3]).unwrap();
        let before = fs.dumpe2fs().unwrap();

        let too_much = vec![2; (before.free_blocks as usize + 10) * 64];
        assert!(matches!(
            fs.write("/f", &too_much),
            Err(FsError::OutOfSpace("data block"))
        ));
        assert_eq!(fs.dumpe2fs().unwrap(), before);
        assert_eq!(fs.read("/f").unwrap(), vec![1; 64 * 3]);
    }

    #[test]
    fn bitmaps_reach_the_disk_when_an_operation_fails() {
        let mut fs = create_test_fs(64, 8);
        let outcome: Result<()> = fs.mutate(|fs| {
            fs.blocks.allocate()?;
            fs.inodes.allocate()?;
            Err(FsError::InvalidState("interrupted".to_string()))
        });
        assert!(matches!(outcome, Err(FsError::InvalidState(_))));

        let mut on_disk = vec![0; fs.blocks.snapshot_bitmap().len()];
        fs.dev
            .read_at(fs.layout.block_bitmap_offset, &mut on_disk)
            .unwrap();
        assert_eq!(on_disk, fs.blocks.snapshot_bitmap());
        let mut on_disk = vec![0; fs.inodes.snapshot_bitmap().len()];
        fs.dev
            .read_at(fs.layout.inode_bitmap_offset, &mut on_disk)
            .unwrap();
        assert_eq!(on_disk, fs.inodes.snapshot_bitmap());
    }

    #[test]
    fn fsck_reports_leaked_blocks_and_orphans() {
        let mut fs = create_test_fs(64, 8);
        let leaked_block = fs.blocks.allocate().unwrap();
        let orphan = fs.inodes.allocate().unwrap();
        let empty = Inode::new(&fs.geometry, "orphan");
        fs.write_inode(orphan, &empty).unwrap();

        let report = fs.fsck().unwrap();
        assert!(report.blocks_in_use[leaked_block as usize]);
        assert_eq!(
            report.findings,
            vec![
                Finding::UnreferencedBlock(leaked_block),
                Finding::OrphanInode(orphan),
            ]
        );
    }

    #[test]
    fn opening_a_blank_medium_fails() {
        let dev = FileDiskBuilder::from(tempfile::tempfile().unwrap())
            .with_capacity(4096)
            .build()
            .unwrap();
        assert!(matches!(
            FileSystem::open(dev),
            Err(FsError::NotInitialized(_))
        ));
    }

    #[test]
    fn create_rejects_media_smaller_than_the_layout() {
        let dev = FileDiskBuilder::from(tempfile::tempfile().unwrap())
            .with_capacity(4096)
            .build()
            .unwrap();
        assert!(matches!(
            FileSystem::create(dev, &Settings::new(64, 8)),
            Err(FsError::InvalidConfiguration(_))
        ));
    }
}
