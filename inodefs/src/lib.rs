//! An inode file system living inside a single disk image.
//!
//! The image is a flat, fixed-capacity byte range split into a superblock, a
//! data block bitmap, an inode bitmap, an inode table, the root directory entry
//! and the data region. Files are addressed through direct, single, double and
//! triple indirect block pointers.
//!
//! ```no_run
//! use inodefs::{FileSystem, Settings};
//!
//! let mut fs = FileSystem::format("disk.img", &Settings::new(1024, 64))?;
//! fs.mkdir("/docs")?;
//! fs.write("/docs/hello", b"hello world")?;
//! assert_eq!(fs.read("/docs/hello")?, b"hello world");
//! fs.close()?;
//! # Ok::<(), inodefs::FsError>(())
//! ```
mod alloc;
mod directory;
mod error;
mod fs;
pub mod io;
mod node;
mod report;
mod sb;

pub use crate::alloc::{BlockIndex, BlockManager};
pub use crate::directory::{DirEntry, Directory};
pub use crate::error::{FsError, Result};
pub use crate::fs::FileSystem;
pub use crate::node::{BlockChain, BlockSpan, Geometry, Inode};
pub use crate::report::{Dump, Finding, FsckReport, InodeDump, ListEntry};
pub use crate::sb::{Layout, Settings, DEFAULT_CAPACITY};
