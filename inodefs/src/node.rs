use crate::alloc::{BlockIndex, BlockManager};
use crate::error::{FsError, Result};
use crate::io::DiskStorage;

use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use zerocopy::byteorder::{LittleEndian, I64, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Bytes reserved for the name stored inside an inode.
pub const INODE_NAME_LEN: usize = 16;
/// Width of a block index on disk.
pub const INDEX_WIDTH: u32 = 2;
/// Size of the fixed metadata at the front of every inode.
const HEADER_SIZE: usize = 28;
/// Single, double and triple indirect pointers.
const INDIRECT_LEVELS: usize = 3;

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy)]
/// Metadata header, followed on disk by the direct pointers and the three
/// indirect pointers.
struct InodeHeader {
    /// The total size of the file in bytes.
    size: U32<LittleEndian>,
    /// The time the file was last updated in seconds since epoch.
    modified: I64<LittleEndian>,
    /// NUL padded name of the file at the time it was created.
    name: [u8; INODE_NAME_LEN],
}

const _: () = assert!(std::mem::size_of::<InodeHeader>() == HEADER_SIZE);

/// Shape of the address structure for one block size.
///
/// An inode fills one block: the metadata header, `direct_count` direct
/// pointers, then the three indirect pointers. Every address block holds
/// `refs_per_block` indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    block_size: u32,
    direct: u32,
    refs_per_block: u32,
}

impl Geometry {
    pub fn new(block_size: u32) -> Result<Self> {
        if !block_size.is_power_of_two() {
            return Err(FsError::InvalidConfiguration(format!(
                "block size {} is not a power of two",
                block_size
            )));
        }
        let overhead = HEADER_SIZE as u32 + INDIRECT_LEVELS as u32 * INDEX_WIDTH;
        let direct = block_size.saturating_sub(overhead) / INDEX_WIDTH;
        if direct == 0 {
            return Err(FsError::InvalidConfiguration(format!(
                "block size {} leaves no room for direct block pointers",
                block_size
            )));
        }
        Ok(Self {
            block_size,
            direct,
            refs_per_block: block_size / INDEX_WIDTH,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn direct_count(&self) -> u32 {
        self.direct
    }

    pub fn refs_per_block(&self) -> u32 {
        self.refs_per_block
    }

    /// Data blocks needed for `size` bytes.
    pub fn block_count(&self, size: u64) -> u64 {
        (size + self.block_size as u64 - 1) / self.block_size as u64
    }

    /// Data blocks reachable below an address table `depth` levels deep.
    fn table_reach(&self, depth: u32) -> u64 {
        (self.refs_per_block as u64).saturating_pow(depth)
    }

    /// Data blocks addressable by one inode.
    pub fn max_blocks(&self) -> u64 {
        (1..=INDIRECT_LEVELS as u32).fold(self.direct as u64, |total, depth| {
            total.saturating_add(self.table_reach(depth))
        })
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_blocks()
            .saturating_mul(self.block_size as u64)
            .min(u32::MAX as u64)
    }

    /// Splits the data blocks of a `size` byte file over the address ranges.
    /// Each range only receives blocks once the previous one is full.
    pub fn span(&self, size: u64) -> BlockSpan {
        let mut remaining = self.block_count(size);
        let mut take = |limit: u64| {
            let n = remaining.min(limit);
            remaining -= n;
            n
        };
        BlockSpan {
            direct: take(self.direct as u64),
            single: take(self.table_reach(1)),
            double: take(self.table_reach(2)),
            triple: take(self.table_reach(3)),
        }
    }

    /// Data blocks plus address blocks a `size` byte file occupies.
    pub fn blocks_required(&self, size: u64) -> u64 {
        let span = self.span(size);
        span.total() + span.index_blocks(self.refs_per_block as u64)
    }
}

/// Number of data blocks held in each address range of one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockSpan {
    pub direct: u64,
    pub single: u64,
    pub double: u64,
    pub triple: u64,
}

impl BlockSpan {
    pub fn total(&self) -> u64 {
        self.direct + self.single + self.double + self.triple
    }

    /// Address blocks needed to reach the indirect ranges, counting every
    /// table level from the top table down to the tables of data pointers.
    pub fn index_blocks(&self, refs_per_block: u64) -> u64 {
        let tables = |count: u64, depth: u32| -> u64 {
            (1..=depth)
                .map(|level| {
                    let reach = refs_per_block.saturating_pow(level);
                    (count + reach - 1) / reach
                })
                .sum()
        };
        tables(self.single, 1) + tables(self.double, 2) + tables(self.triple, 3)
    }
}

/// One slot of the inode table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub size: u32,
    /// Seconds since epoch.
    pub modified: i64,
    name: [u8; INODE_NAME_LEN],
    direct: Vec<BlockIndex>,
    /// Single, double and triple indirect address blocks.
    indirect: [BlockIndex; INDIRECT_LEVELS],
}

impl Inode {
    /// An empty inode stamped with the current time.
    pub fn new(geometry: &Geometry, name: &str) -> Self {
        let mut stored = [0; INODE_NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(INODE_NAME_LEN);
        stored[..len].copy_from_slice(&bytes[..len]);
        Self {
            size: 0,
            modified: Utc::now().timestamp(),
            name: stored,
            direct: vec![0; geometry.direct_count() as usize],
            indirect: [0; INDIRECT_LEVELS],
        }
    }

    pub fn name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(INODE_NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.modified, 0).single()
    }

    pub fn touch(&mut self) {
        self.modified = Utc::now().timestamp();
    }

    /// Encodes the inode into exactly one block.
    pub fn encode(&self, geometry: &Geometry) -> Vec<u8> {
        let header = InodeHeader {
            size: U32::new(self.size),
            modified: I64::new(self.modified),
            name: self.name,
        };
        let mut buf = Vec::with_capacity(geometry.block_size() as usize);
        buf.extend_from_slice(header.as_bytes());
        for index in self.direct.iter().chain(self.indirect.iter()) {
            buf.extend_from_slice(&index.to_le_bytes());
        }
        buf.resize(geometry.block_size() as usize, 0);
        buf
    }

    pub fn decode(geometry: &Geometry, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < geometry.block_size() as usize {
            return Err(FsError::Corrupt(format!(
                "inode needs {} bytes, got {}",
                geometry.block_size(),
                bytes.len()
            )));
        }
        let header = InodeHeader::read_from(&bytes[..HEADER_SIZE])
            .ok_or_else(|| FsError::Corrupt("unreadable inode header".to_string()))?;
        let mut refs = decode_indices(&bytes[HEADER_SIZE..]).into_iter();
        let direct: Vec<_> = refs.by_ref().take(geometry.direct_count() as usize).collect();
        let mut indirect = [0; INDIRECT_LEVELS];
        for slot in indirect.iter_mut() {
            *slot = refs.next().unwrap_or(0);
        }
        Ok(Self {
            size: header.size.get(),
            modified: header.modified.get(),
            name: header.name,
            direct,
            indirect,
        })
    }
}

fn decode_indices(bytes: &[u8]) -> Vec<BlockIndex> {
    bytes
        .chunks_exact(INDEX_WIDTH as usize)
        .map(|pair| BlockIndex::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Every block reachable from one inode, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockChain {
    pub direct: Vec<BlockIndex>,
    /// Data blocks reached through the single indirect table.
    pub single: Vec<BlockIndex>,
    pub double: Vec<BlockIndex>,
    pub triple: Vec<BlockIndex>,
    /// The address blocks themselves.
    pub index: Vec<BlockIndex>,
}

impl BlockChain {
    /// Data blocks in the order their bytes appear in the file.
    pub fn data_blocks(&self) -> impl Iterator<Item = BlockIndex> + '_ {
        self.direct
            .iter()
            .chain(&self.single)
            .chain(&self.double)
            .chain(&self.triple)
            .copied()
    }

    /// Data blocks followed by address blocks.
    pub fn all_blocks(&self) -> impl Iterator<Item = BlockIndex> + '_ {
        self.data_blocks().chain(self.index.iter().copied())
    }
}

/// The data region seen through the address structure of inodes.
///
/// Borrows the data block manager and the disk for the duration of one
/// operation. Address tables are read from disk every time a chain is resolved;
/// nothing is cached between calls.
pub struct DataRegion<'a, D: DiskStorage> {
    geometry: Geometry,
    blocks: &'a mut BlockManager,
    dev: &'a mut D,
}

impl<'a, D: DiskStorage> DataRegion<'a, D> {
    pub fn new(geometry: Geometry, blocks: &'a mut BlockManager, dev: &'a mut D) -> Self {
        Self {
            geometry,
            blocks,
            dev,
        }
    }

    /// Reconstructs the chain of an inode from its size and stored pointers.
    pub fn resolve_blocks(&mut self, inode: &Inode) -> Result<BlockChain> {
        let span = self.geometry.span(inode.size as u64);
        let mut chain = BlockChain {
            direct: inode.direct[..span.direct as usize].to_vec(),
            ..BlockChain::default()
        };
        let ranges = [span.single, span.double, span.triple];
        for (level, &count) in ranges.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let mut data = Vec::with_capacity(count as usize);
            self.expand(
                inode.indirect[level],
                level as u32 + 1,
                count,
                &mut data,
                &mut chain.index,
            )?;
            match level {
                0 => chain.single = data,
                1 => chain.double = data,
                _ => chain.triple = data,
            }
        }
        Ok(chain)
    }

    /// Replaces the chain of `inode` with a fresh one sized for `new_size`.
    ///
    /// Every block of the old chain is released first. New address tables are
    /// written innermost first so a table only ever points at committed
    /// children. Fails before touching anything if the region cannot hold the
    /// new chain.
    pub fn grow_to(&mut self, inode: &mut Inode, new_size: u64) -> Result<()> {
        if new_size > self.geometry.max_file_size() {
            return Err(FsError::FileTooLarge(new_size));
        }
        let held = self.geometry.blocks_required(inode.size as u64);
        let needed = self.geometry.blocks_required(new_size);
        if needed > self.blocks.free_count() as u64 + held {
            return Err(FsError::OutOfSpace(self.blocks.kind()));
        }

        self.release(inode)?;
        let span = self.geometry.span(new_size);
        for slot in inode.direct.iter_mut().take(span.direct as usize) {
            *slot = self.blocks.allocate()?;
        }
        let ranges = [span.single, span.double, span.triple];
        for (level, &count) in ranges.iter().enumerate() {
            if count > 0 {
                inode.indirect[level] = self.build_table(level as u32 + 1, count)?;
            }
        }
        inode.size = new_size as u32;
        debug!(
            "chain of {:?} now spans {:?} ({} blocks)",
            inode.name(),
            span,
            needed
        );
        Ok(())
    }

    /// Frees every block of the chain and empties the inode.
    pub fn release(&mut self, inode: &mut Inode) -> Result<()> {
        let chain = self.resolve_blocks(inode)?;
        for index in chain.all_blocks() {
            self.blocks.deallocate(index)?;
        }
        inode.size = 0;
        inode.direct.iter_mut().for_each(|slot| *slot = 0);
        inode.indirect = [0; INDIRECT_LEVELS];
        Ok(())
    }

    /// Rewrites the whole content of the inode.
    pub fn write_data(&mut self, inode: &mut Inode, data: &[u8]) -> Result<()> {
        self.grow_to(inode, data.len() as u64)?;
        let chain = self.resolve_blocks(inode)?;
        let block_size = self.geometry.block_size() as usize;
        for (index, chunk) in chain.data_blocks().zip(data.chunks(block_size)) {
            self.blocks.write_block(&mut *self.dev, index, chunk)?;
        }
        inode.touch();
        Ok(())
    }

    /// Exactly `size` bytes of content.
    pub fn read_data(&mut self, inode: &Inode) -> Result<Vec<u8>> {
        let chain = self.resolve_blocks(inode)?;
        let mut data = Vec::with_capacity(inode.size as usize);
        for index in chain.data_blocks() {
            data.extend_from_slice(&self.blocks.read_block(&mut *self.dev, index)?);
        }
        data.truncate(inode.size as usize);
        Ok(data)
    }

    /// Collects `count` data blocks below the table at `table`, which sits
    /// `depth` levels above the data.
    fn expand(
        &mut self,
        table: BlockIndex,
        depth: u32,
        count: u64,
        data: &mut Vec<BlockIndex>,
        index: &mut Vec<BlockIndex>,
    ) -> Result<()> {
        index.push(table);
        let refs = self.read_table(table)?;
        if depth == 1 {
            data.extend_from_slice(&refs[..count as usize]);
            return Ok(());
        }
        let reach = self.geometry.table_reach(depth - 1);
        let mut remaining = count;
        for &child in refs.iter() {
            if remaining == 0 {
                break;
            }
            let n = remaining.min(reach);
            self.expand(child, depth - 1, n, data, index)?;
            remaining -= n;
        }
        Ok(())
    }

    /// Allocates `count` data blocks and the tables addressing them, returning
    /// the top table.
    fn build_table(&mut self, depth: u32, count: u64) -> Result<BlockIndex> {
        let mut refs = Vec::with_capacity(self.geometry.refs_per_block() as usize);
        if depth == 1 {
            for _ in 0..count {
                refs.push(self.blocks.allocate()?);
            }
        } else {
            let reach = self.geometry.table_reach(depth - 1);
            let mut remaining = count;
            while remaining > 0 {
                let n = remaining.min(reach);
                refs.push(self.build_table(depth - 1, n)?);
                remaining -= n;
            }
        }
        let table = self.blocks.allocate()?;
        self.write_table(table, &refs)?;
        Ok(table)
    }

    fn read_table(&mut self, table: BlockIndex) -> Result<Vec<BlockIndex>> {
        Ok(decode_indices(&self.blocks.read_block(&mut *self.dev, table)?))
    }

    fn write_table(&mut self, table: BlockIndex, refs: &[BlockIndex]) -> Result<()> {
        let bytes: Vec<u8> = refs.iter().flat_map(|index| index.to_le_bytes()).collect();
        self.blocks.write_block(&mut *self.dev, table, &bytes)
    }
}
