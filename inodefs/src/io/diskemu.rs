use crate::error::FsError;
use crate::io::{DiskOffset, DiskStorage};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Zeroing happens in chunks of this many bytes.
const ZERO_CHUNK: usize = 4096;

/// Canonical paths of every disk image currently held by a `FileDisk`.
static CLAIMED_IMAGES: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());

/// Exclusive hold on one disk image path for as long as the value lives.
#[derive(Debug)]
struct ImageClaim {
    path: PathBuf,
}

impl ImageClaim {
    fn acquire(path: &Path) -> Result<Self, FsError> {
        let path = path.canonicalize()?;
        let mut claimed = CLAIMED_IMAGES
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(path.clone()) {
            return Err(FsError::AlreadyInitialized(path.display().to_string()));
        }
        Ok(Self { path })
    }
}

impl Drop for ImageClaim {
    fn drop(&mut self) {
        CLAIMED_IMAGES
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

/// Emulates a flat disk in userspace using a regular file as the medium.
///
/// Disks opened by path through `create` or `open` hold a claim on that path, so
/// a second `FileDisk` for the same image cannot be opened while this one is
/// alive. Disks built from an already open `File` carry no claim.
#[derive(Debug)]
pub struct FileDisk {
    /// The file must be at least `capacity` bytes long.
    fd: File,
    /// The total number of bytes available in the file store.
    capacity: u64,
    claim: Option<ImageClaim>,
}

impl FileDisk {
    /// Creates (or reformats) the disk image at `path`, zeroing `capacity` bytes.
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self, FsError> {
        let path = path.as_ref();
        // Claim before touching the contents so an image in use is never zeroed.
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let claim = ImageClaim::acquire(path)?;
        let mut disk = FileDiskBuilder::from(fd).with_capacity(capacity).build()?;
        disk.claim = Some(claim);
        Ok(disk)
    }

    /// Opens an existing disk image without modifying it. The capacity is the
    /// length of the file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FsError> {
        let path = path.as_ref();
        // Return error if the file does not exist rather than create one.
        let fd = OpenOptions::new().read(true).write(true).open(path)?;
        let claim = ImageClaim::acquire(path)?;
        let mut disk = FileDiskBuilder::from(fd).clear_medium(false).build()?;
        disk.claim = Some(claim);
        Ok(disk)
    }

    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    fn check_range(&self, offset: DiskOffset, len: usize) -> std::io::Result<()> {
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > self.capacity) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "range out of bounds",
            ));
        }
        Ok(())
    }
}

impl DiskStorage for FileDisk {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: DiskOffset, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_range(offset, buf.len())?;
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.read_exact(buf)
    }

    fn write_at(&mut self, offset: DiskOffset, buf: &[u8]) -> std::io::Result<()> {
        self.check_range(offset, buf.len())?;
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.write_all(buf)
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub struct FileDiskBuilder {
    fd: File,
    capacity: u64,
    clear: bool,
}

impl From<File> for FileDiskBuilder {
    fn from(fd: File) -> Self {
        FileDiskBuilder {
            fd,
            // Zero means "the current length of the file" and is only valid
            // when the medium is not cleared.
            capacity: 0,
            clear: true,
        }
    }
}

impl FileDiskBuilder {
    /// Sets the number of bytes in the storage device.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = bytes;
        self
    }

    /// Whether `build` zeroes the medium. Defaults to true; set to false to
    /// reopen an initialized disk.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor used and, unless
    /// told otherwise, does destructive things to prepare the file for use.
    pub fn build(mut self) -> std::io::Result<FileDisk> {
        let len = self.fd.metadata()?.len();
        if self.clear {
            if self.capacity == 0 {
                return Err(std::io::Error::new(
                    ErrorKind::InvalidInput,
                    "capacity of a cleared medium must be nonzero",
                ));
            }
            self.zero_medium()?;
        } else if self.capacity == 0 {
            self.capacity = len;
        } else if len < self.capacity {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "medium is smaller than the requested capacity",
            ));
        }

        Ok(FileDisk {
            fd: self.fd,
            capacity: self.capacity,
            claim: None,
        })
    }

    fn zero_medium(&mut self) -> std::io::Result<()> {
        self.fd.set_len(0)?;
        self.fd.seek(SeekFrom::Start(0))?;
        let zeros = [0x00; ZERO_CHUNK];
        let mut remaining = self.capacity;
        let mut bfd = BufWriter::new(&self.fd);
        // Buffer each chunk to prevent excessive small writes.
        while remaining > 0 {
            let n = remaining.min(ZERO_CHUNK as u64) as usize;
            bfd.write_all(&zeros[..n])?;
            remaining -= n as u64;
        }
        bfd.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_of(capacity: u64) -> FileDisk {
        let medium = tempfile::tempfile().unwrap();
        FileDiskBuilder::from(medium)
            .with_capacity(capacity)
            .build()
            .expect("failed to allocate file disk")
    }

    #[test]
    fn file_disk_allocates_correct_num_bytes() {
        let mut disk = disk_of(4 * 4096);
        disk.sync_disk().unwrap();
        assert_eq!(disk.into_file().metadata().unwrap().len(), 4 * 4096);
    }

    #[test]
    fn can_read_and_write_ranges() {
        let mut disk = disk_of(1024);

        disk.write_at(100, &[0x55; 64]).unwrap();

        let mut untouched = vec![0xAA; 64];
        disk.read_at(200, &mut untouched).unwrap();
        assert_eq!(untouched, vec![0x00; 64]);

        let mut written = vec![0x00; 64];
        disk.read_at(100, &mut written).unwrap();
        assert_eq!(written, vec![0x55; 64]);
    }

    #[test]
    fn can_read_and_write_start_and_end_of_medium() {
        let mut disk = disk_of(512);

        disk.write_at(0, &[0x11; 16]).unwrap();
        disk.write_at(512 - 16, &[0x22; 16]).unwrap();

        let mut start = [0; 16];
        let mut end = [0; 16];
        disk.read_at(0, &mut start).unwrap();
        disk.read_at(512 - 16, &mut end).unwrap();
        assert_eq!(start, [0x11; 16]);
        assert_eq!(end, [0x22; 16]);
    }

    #[test]
    fn access_beyond_capacity_is_an_error() {
        let mut disk = disk_of(512);

        assert!(disk.write_at(500, &[0x55; 16]).is_err());
        let mut buf = [0; 1];
        assert!(disk.read_at(512, &mut buf).is_err());
        assert!(disk.read_at(u64::MAX, &mut buf).is_err());
    }

    #[test]
    fn reopening_keeps_contents_when_not_cleared() {
        let image = tempfile::NamedTempFile::new().unwrap();
        let mut disk = FileDiskBuilder::from(image.reopen().unwrap())
            .with_capacity(256)
            .build()
            .unwrap();
        disk.write_at(10, b"kept").unwrap();
        disk.sync_disk().unwrap();

        let mut reopened = FileDiskBuilder::from(image.reopen().unwrap())
            .clear_medium(false)
            .build()
            .unwrap();
        assert_eq!(reopened.capacity(), 256);
        let mut buf = [0; 4];
        reopened.read_at(10, &mut buf).unwrap();
        assert_eq!(&buf, b"kept");
    }

    #[test]
    fn image_path_can_only_be_claimed_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let first = FileDisk::create(&path, 1024).unwrap();
        match FileDisk::open(&path) {
            Err(FsError::AlreadyInitialized(_)) => (),
            other => panic!("expected AlreadyInitialized, got {:?}", other),
        }

        drop(first);
        let reopened = FileDisk::open(&path).unwrap();
        assert_eq!(reopened.capacity(), 1024);
    }
}
