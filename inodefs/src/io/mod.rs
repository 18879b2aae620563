mod block;
mod diskemu;

pub use block::{DiskOffset, DiskStorage};
pub use diskemu::{FileDisk, FileDiskBuilder};
