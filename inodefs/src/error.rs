use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("disk image is already open: {0}")]
    AlreadyInitialized(String),
    #[error("disk image holds no file system: {0}")]
    NotInitialized(String),
    #[error("no free {0} left")]
    OutOfSpace(&'static str),
    #[error("no entry named {0:?}")]
    NotFound(String),
    #[error("no such file or directory: {0}")]
    NoSuchPath(String),
    #[error("file or directory already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("{kind} {index} is not allocated")]
    NotAllocated { kind: &'static str, index: u16 },
    #[error("{kind} {index} is out of range, only {total} exist")]
    OutOfRange {
        kind: &'static str,
        index: u32,
        total: u32,
    },
    #[error("directory already has an entry named {0:?}")]
    DuplicateName(String),
    #[error("invalid file name {0:?}: names are 1 to 13 bytes without '/' or NUL")]
    InvalidName(String),
    #[error("invalid path {0:?}")]
    InvalidPath(String),
    #[error("is a directory: {0}")]
    IsDirectory(String),
    #[error("{0} bytes exceed the maximum file size")]
    FileTooLarge(u64),
    #[error("corrupt file system: {0}")]
    Corrupt(String),
    #[error("disk I/O failed")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;
