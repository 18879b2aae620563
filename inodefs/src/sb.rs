use crate::alloc::{Bitmap, MAX_INDICES};
use crate::error::{FsError, Result};
use crate::node::Geometry;

use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Bytes occupied by the superblock at the start of the image.
pub const SUPERBLOCK_SIZE: u64 = 20;
/// Bytes occupied by the root directory entry after the inode table.
pub const ROOT_ENTRY_SIZE: u64 = 16;
/// Capacity of a disk image unless configured otherwise.
pub const DEFAULT_CAPACITY: u64 = 1 << 20;

/// The first bytes of the image, describing where every other region lives.
///
/// The two bitmaps follow the superblock back to back, so their offsets are
/// implied by the counts rather than stored.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug, PartialEq)]
pub struct SuperBlock {
    block_size: U32<LittleEndian>,
    inode_count: U32<LittleEndian>,
    block_count: U32<LittleEndian>,
    /// Byte offset of the inode table.
    inode_offset: U32<LittleEndian>,
    /// Byte offset of the data block region.
    block_offset: U32<LittleEndian>,
}

const _: () = assert!(std::mem::size_of::<SuperBlock>() == SUPERBLOCK_SIZE as usize);

impl SuperBlock {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        Self::read_from_prefix(buf).ok_or_else(|| {
            FsError::Corrupt(format!(
                "superblock needs {} bytes, got {}",
                SUPERBLOCK_SIZE,
                buf.len()
            ))
        })
    }

    pub fn serialize(&self) -> &[u8] {
        self.as_bytes()
    }

    pub fn block_size(&self) -> u32 {
        self.block_size.get()
    }

    pub fn inode_count(&self) -> u32 {
        self.inode_count.get()
    }

    pub fn block_count(&self) -> u32 {
        self.block_count.get()
    }

    pub fn inode_offset(&self) -> u32 {
        self.inode_offset.get()
    }

    pub fn block_offset(&self) -> u32 {
        self.block_offset.get()
    }
}

/// Inputs for formatting a new image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    block_size: u32,
    inode_count: u32,
    capacity: u64,
}

impl Settings {
    pub fn new(block_size: u32, inode_count: u32) -> Self {
        Self {
            block_size,
            inode_count,
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Sets the number of bytes in the disk image.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = bytes;
        self
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Validates the settings and derives the region offsets. The data region
    /// gets every byte left over once the fixed regions and its own bitmap are
    /// accounted for.
    pub fn layout(&self) -> Result<Layout> {
        let invalid = |reason: String| Err(FsError::InvalidConfiguration(reason));
        let (bs, ic, cap) = (
            self.block_size as u64,
            self.inode_count as u64,
            self.capacity,
        );

        if ic == 0 {
            return invalid("inode count must be nonzero".to_string());
        }
        if ic > MAX_INDICES as u64 {
            return invalid(format!("at most {} inodes are addressable", MAX_INDICES));
        }
        Geometry::new(self.block_size)?;
        if cap > u32::MAX as u64 {
            return invalid(format!("capacity {} exceeds 32-bit offsets", cap));
        }
        if ic * bs >= cap {
            return invalid(format!(
                "{} inodes of {} bytes do not fit in {} bytes",
                ic, bs, cap
            ));
        }
        let fixed = SUPERBLOCK_SIZE + Bitmap::bytes_for(ic as usize) as u64 + ic * bs + ROOT_ENTRY_SIZE;
        if fixed >= cap {
            return invalid(format!("no room for a data region in {} bytes", cap));
        }
        let block_count = ((8 * (cap - fixed) - 8) / (8 * bs + 1)).min(MAX_INDICES as u64);
        if block_count == 0 {
            return invalid(format!("no room for a data block of {} bytes", bs));
        }

        Ok(Layout::derive(self.block_size, self.inode_count, block_count as u32))
    }
}

/// Byte offsets of every region of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub block_size: u32,
    pub inode_count: u32,
    pub block_count: u32,
    pub block_bitmap_offset: u64,
    pub inode_bitmap_offset: u64,
    pub inode_offset: u64,
    pub root_entry_offset: u64,
    pub block_offset: u64,
}

impl Layout {
    fn derive(block_size: u32, inode_count: u32, block_count: u32) -> Self {
        let block_bitmap_offset = SUPERBLOCK_SIZE;
        let inode_bitmap_offset = block_bitmap_offset + Bitmap::bytes_for(block_count as usize) as u64;
        let inode_offset = inode_bitmap_offset + Bitmap::bytes_for(inode_count as usize) as u64;
        let root_entry_offset = inode_offset + inode_count as u64 * block_size as u64;
        Self {
            block_size,
            inode_count,
            block_count,
            block_bitmap_offset,
            inode_bitmap_offset,
            inode_offset,
            root_entry_offset,
            block_offset: root_entry_offset + ROOT_ENTRY_SIZE,
        }
    }

    /// Rebuilds the layout recorded in a superblock read from a medium of
    /// `capacity` bytes, rejecting records that disagree with themselves.
    pub fn from_superblock(sb: &SuperBlock, capacity: u64) -> Result<Self> {
        if sb.block_size() == 0 {
            return Err(FsError::NotInitialized("superblock is blank".to_string()));
        }
        let corrupt = |reason: String| Err(FsError::Corrupt(reason));
        if Geometry::new(sb.block_size()).is_err() {
            return corrupt(format!("unusable block size {}", sb.block_size()));
        }
        for (what, count) in [("inode", sb.inode_count()), ("block", sb.block_count())] {
            if count == 0 || count > MAX_INDICES {
                return corrupt(format!("{} count {} out of range", what, count));
            }
        }

        let layout = Self::derive(sb.block_size(), sb.inode_count(), sb.block_count());
        if layout.inode_offset != sb.inode_offset() as u64 {
            return corrupt(format!(
                "inode table at {} but the bitmaps end at {}",
                sb.inode_offset(),
                layout.inode_offset
            ));
        }
        if layout.block_offset != sb.block_offset() as u64 {
            return corrupt(format!(
                "data region at {} but the root entry ends at {}",
                sb.block_offset(),
                layout.block_offset
            ));
        }
        if layout.data_end() > capacity {
            return corrupt(format!(
                "data region ends at {} past the {} byte image",
                layout.data_end(),
                capacity
            ));
        }
        Ok(layout)
    }

    pub fn superblock(&self) -> SuperBlock {
        SuperBlock {
            block_size: U32::new(self.block_size),
            inode_count: U32::new(self.inode_count),
            block_count: U32::new(self.block_count),
            inode_offset: U32::new(self.inode_offset as u32),
            block_offset: U32::new(self.block_offset as u32),
        }
    }

    pub fn data_end(&self) -> u64 {
        self.block_offset + self.block_count as u64 * self.block_size as u64
    }
}
