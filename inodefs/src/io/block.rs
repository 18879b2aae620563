/// Byte position on the medium, 0 being the first byte of the disk image.
pub type DiskOffset = u64;

/// A fixed-capacity storage medium addressed by byte offset.
///
/// The file system lays out blocks of its own choosing on top of this, so the
/// medium only has to support positioned reads and writes. Every structure is
/// written at an offset computed from the superblock, never appended.
pub trait DiskStorage {
    /// Total number of addressable bytes.
    fn capacity(&self) -> u64;
    /// Fills `buf` with the bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Attempting to read past the end of the medium will return an error.
    fn read_at(&mut self, offset: DiskOffset, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes all of `buf` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Attempting to write past the end of the medium will return an error.
    fn write_at(&mut self, offset: DiskOffset, buf: &[u8]) -> std::io::Result<()>;
    /// Flush any buffered disk IO from memory. This is useful if it must guaranteed
    /// the disk writes actually occurred, for instance, if being re-read from
    /// disk.
    fn sync_disk(&mut self) -> std::io::Result<()>;
}
