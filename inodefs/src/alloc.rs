use crate::error::{FsError, Result};
use crate::io::DiskStorage;
use log::debug;

/// Index of a slot in one of the allocators. Indices are stored on disk as
/// 16-bit little endian values.
pub type BlockIndex = u16;

/// Largest number of slots a single allocator can address with 16-bit indices.
pub const MAX_INDICES: u32 = 1 << 16;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    Free,
    Used,
}

/// One bit per slot, bit `i` living in byte `i / 8` at position `i % 8`. A set
/// bit marks the slot as used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: Vec<u8>,
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; Self::bytes_for(len)],
            len,
        }
    }

    /// Number of bytes needed to hold `len` bits.
    pub fn bytes_for(len: usize) -> usize {
        (len + 7) / 8
    }

    /// Reads a bitmap of `len` bits. Bits past `len` in the last byte are
    /// ignored.
    pub fn parse(len: usize, buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::bytes_for(len) {
            return Err(FsError::InvalidState(format!(
                "bitmap of {} bits needs {} bytes, got {}",
                len,
                Self::bytes_for(len),
                buf.len()
            )));
        }
        let mut bmp = Self {
            bits: buf.to_vec(),
            len,
        };
        if len % 8 != 0 {
            if let Some(last) = bmp.bits.last_mut() {
                *last &= (1u8 << (len % 8)) - 1;
            }
        }
        Ok(bmp)
    }

    pub fn serialize(&self) -> &[u8] {
        &self.bits
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, nr: usize) -> State {
        assert!(nr < self.len, "bit {} outside bitmap of {}", nr, self.len);
        match (self.bits[nr / 8] >> (nr % 8)) & 0b1 {
            0 => State::Free,
            _ => State::Used,
        }
    }

    pub fn set_reserved(&mut self, nr: usize) {
        assert!(nr < self.len, "bit {} outside bitmap of {}", nr, self.len);
        self.bits[nr / 8] |= 1 << (nr % 8);
    }

    pub fn set_free(&mut self, nr: usize) {
        assert!(nr < self.len, "bit {} outside bitmap of {}", nr, self.len);
        self.bits[nr / 8] &= !(1 << (nr % 8));
    }

    pub fn count_used(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }
}

/// Walks the free slots of a bitmap in ascending order, starting at a marker.
pub struct NextAvailable<'a> {
    /// Keeps track of the next starting place for looking for available slots.
    marker: usize,
    bitmap: &'a Bitmap,
}

impl<'a> Iterator for NextAvailable<'a> {
    type Item = BlockIndex;

    fn next(&mut self) -> Option<Self::Item> {
        while self.marker < self.bitmap.len() {
            let i = self.marker;
            // Skip whole bytes that are fully used.
            if i % 8 == 0 && self.bitmap.bits[i / 8] == 0xFF {
                self.marker += 8;
                continue;
            }
            self.marker += 1;
            if let State::Free = self.bitmap.get(i) {
                return Some(i as BlockIndex);
            }
        }
        None
    }
}

/// Hands out the equally sized slots of one region of the disk and performs the
/// raw reads and writes on them.
///
/// A file system owns two of these, one for the inode table and one for the
/// data region. The manager does not own the disk; every I/O call borrows it.
/// Slot `i` lives at byte `offset + i * block_size`.
#[derive(Debug)]
pub struct BlockManager {
    /// What the slots hold, used in errors and logs.
    kind: &'static str,
    bitmap: Bitmap,
    block_size: u32,
    offset: u64,
    /// No slot below this index is free.
    hint: usize,
}

impl BlockManager {
    pub fn new(kind: &'static str, total: u32, block_size: u32, offset: u64) -> Result<Self> {
        if total == 0 || block_size == 0 {
            return Err(FsError::InvalidConfiguration(format!(
                "{} table needs a nonzero slot count and size",
                kind
            )));
        }
        if total > MAX_INDICES {
            return Err(FsError::InvalidConfiguration(format!(
                "{} {} slots exceed the {} addressable with 16-bit indices",
                total, kind, MAX_INDICES
            )));
        }
        Ok(Self {
            kind,
            bitmap: Bitmap::new(total as usize),
            block_size,
            offset,
            hint: 0,
        })
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn total(&self) -> u32 {
        self.bitmap.len() as u32
    }

    pub fn free_count(&self) -> u32 {
        (self.bitmap.len() - self.bitmap.count_used()) as u32
    }

    pub fn is_free(&self, index: BlockIndex) -> bool {
        (index as usize) >= self.bitmap.len() || self.bitmap.get(index as usize) == State::Free
    }

    /// Used slots in ascending order.
    pub fn occupied(&self) -> impl Iterator<Item = BlockIndex> + '_ {
        (0..self.bitmap.len())
            .filter(move |&i| self.bitmap.get(i) == State::Used)
            .map(|i| i as BlockIndex)
    }

    /// Free slots in ascending order.
    pub fn free(&self) -> NextAvailable<'_> {
        NextAvailable {
            marker: 0,
            bitmap: &self.bitmap,
        }
    }

    /// Takes the lowest free slot and marks it used.
    pub fn allocate(&mut self) -> Result<BlockIndex> {
        let index = NextAvailable {
            marker: self.hint,
            bitmap: &self.bitmap,
        }
        .next()
        .ok_or(FsError::OutOfSpace(self.kind))?;
        self.bitmap.set_reserved(index as usize);
        self.hint = index as usize + 1;
        debug!("allocated {} {}", self.kind, index);
        Ok(index)
    }

    /// Returns a used slot to the free pool.
    pub fn deallocate(&mut self, index: BlockIndex) -> Result<()> {
        self.check_range(index)?;
        if self.bitmap.get(index as usize) == State::Free {
            return Err(FsError::InvalidState(format!(
                "{} {} deallocated twice",
                self.kind, index
            )));
        }
        self.bitmap.set_free(index as usize);
        self.hint = self.hint.min(index as usize);
        debug!("released {} {}", self.kind, index);
        Ok(())
    }

    /// Reads the whole slot. Only used slots may be read.
    pub fn read_block<D: DiskStorage>(&self, dev: &mut D, index: BlockIndex) -> Result<Vec<u8>> {
        self.check_allocated(index)?;
        let mut buf = vec![0; self.block_size as usize];
        dev.read_at(self.position(index), &mut buf)?;
        Ok(buf)
    }

    /// Writes `data` into a used slot, zero filling whatever `data` does not
    /// cover.
    pub fn write_block<D: DiskStorage>(
        &self,
        dev: &mut D,
        index: BlockIndex,
        data: &[u8],
    ) -> Result<()> {
        self.check_allocated(index)?;
        if data.len() > self.block_size as usize {
            return Err(FsError::InvalidState(format!(
                "{} bytes do not fit a {} of {} bytes",
                data.len(),
                self.kind,
                self.block_size
            )));
        }
        if data.len() == self.block_size as usize {
            dev.write_at(self.position(index), data)?;
        } else {
            let mut block = vec![0; self.block_size as usize];
            block[..data.len()].copy_from_slice(data);
            dev.write_at(self.position(index), &block)?;
        }
        Ok(())
    }

    /// Packs the occupancy into `ceil(total / 8)` bytes.
    pub fn snapshot_bitmap(&self) -> Vec<u8> {
        self.bitmap.serialize().to_vec()
    }

    /// Replaces the entire occupancy with a packed bitmap.
    pub fn restore_bitmap(&mut self, bytes: &[u8]) -> Result<()> {
        self.bitmap = Bitmap::parse(self.bitmap.len(), bytes)?;
        self.hint = 0;
        Ok(())
    }

    fn position(&self, index: BlockIndex) -> u64 {
        self.offset + index as u64 * self.block_size as u64
    }

    fn check_range(&self, index: BlockIndex) -> Result<()> {
        if index as usize >= self.bitmap.len() {
            return Err(FsError::OutOfRange {
                kind: self.kind,
                index: index as u32,
                total: self.total(),
            });
        }
        Ok(())
    }

    fn check_allocated(&self, index: BlockIndex) -> Result<()> {
        self.check_range(index)?;
        if self.bitmap.get(index as usize) == State::Free {
            return Err(FsError::NotAllocated {
                kind: self.kind,
                index,
            });
        }
        Ok(())
    }
}
