use clap::{Parser, Subcommand};
use inodefs::io::FileDisk;
use inodefs::{FileSystem, Settings, DEFAULT_CAPACITY};
use log::debug;
use std::error::Error;
use std::path::PathBuf;
use std::process;

const USAGE: &str = "\
usage: inodefs create <BLOCK_SIZE> <INODE_COUNT> <IMAGE>
         BLOCK_SIZE is in bytes, or in kilobytes with a K suffix (4K)
       inodefs oper <IMAGE> list|mkdir|rmdir|del <PATH>
       inodefs oper <IMAGE> write|read <PATH> <HOST_FILE>
       inodefs oper <IMAGE> ln|lnsym <SRC> <DST>
       inodefs oper <IMAGE> dumpe2fs|fsck";

#[derive(Debug, Parser)]
#[clap(name = "inodefs", version, about = "An inode file system inside a single disk image")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Formats a disk image
    Create {
        /// Block size in bytes (or kilobytes with a K suffix), a power of two
        /// no smaller than 64
        #[clap(parse(try_from_str = parse_block_size))]
        block_size: u32,
        inode_count: u32,
        image: PathBuf,
        /// Size of the image in bytes
        #[clap(short, long, default_value_t = DEFAULT_CAPACITY)]
        capacity: u64,
    },
    /// Runs one operation on a formatted image
    Oper {
        image: PathBuf,
        #[clap(subcommand)]
        operation: Operation,
    },
}

#[derive(Debug, Subcommand)]
enum Operation {
    /// Lists a directory
    List { path: String },
    Mkdir { path: String },
    /// Removes a directory and everything in it
    Rmdir { path: String },
    /// Copies a host file into the image
    Write { path: String, source: PathBuf },
    /// Copies a file out of the image into a host file
    Read { path: String, target: PathBuf },
    Del { path: String },
    /// Copies SRC to a new file DST
    Ln { src: String, dst: String },
    /// Makes DST another name for the file at SRC
    Lnsym { src: String, dst: String },
    /// Prints counts and the blocks held by every inode
    #[clap(name = "dumpe2fs")]
    Dumpe2fs,
    /// Prints both bitmaps and checks them against the tree
    Fsck,
}

/// Paths are often passed quoted, e.g. `"/usr/docs"`.
fn unquote(arg: &str) -> &str {
    arg.trim_matches(|c| c == '"' || c == '\'')
}

/// Accepts a byte count, or a kilobyte count with a `K` suffix.
fn parse_block_size(arg: &str) -> Result<u32, String> {
    let (digits, scale) = match arg.strip_suffix(|c| c == 'K' || c == 'k') {
        Some(digits) => (digits, 1024),
        None => (arg, 1),
    };
    digits
        .parse::<u32>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .ok_or_else(|| format!("invalid block size {:?}", arg))
}

fn apply(fs: &mut FileSystem<FileDisk>, operation: Operation) -> inodefs::Result<()> {
    match operation {
        Operation::List { path } => {
            for entry in fs.list(unquote(&path))? {
                println!("{}", entry);
            }
        }
        Operation::Mkdir { path } => fs.mkdir(unquote(&path))?,
        Operation::Rmdir { path } => fs.rmdir(unquote(&path))?,
        Operation::Write { path, source } => {
            let data = std::fs::read(&source)?;
            fs.write(unquote(&path), &data)?;
        }
        Operation::Read { path, target } => {
            let data = fs.read(unquote(&path))?;
            std::fs::write(&target, data)?;
        }
        Operation::Del { path } => fs.del(unquote(&path))?,
        Operation::Ln { src, dst } => fs.ln(unquote(&src), unquote(&dst))?,
        Operation::Lnsym { src, dst } => fs.lnsym(unquote(&src), unquote(&dst))?,
        Operation::Dumpe2fs => print!("{}", fs.dumpe2fs()?),
        Operation::Fsck => print!("{}", fs.fsck()?),
    }
    Ok(())
}

/// Closes the image even when the operation failed.
fn run(cli: Cli) -> inodefs::Result<()> {
    match cli.command {
        Command::Create {
            block_size,
            inode_count,
            image,
            capacity,
        } => {
            let settings = Settings::new(block_size, inode_count).with_capacity(capacity);
            let fs = FileSystem::format(&image, &settings)?;
            let layout = *fs.layout();
            fs.close()?;
            println!(
                "{}: {} inodes, {} blocks of {} bytes",
                image.display(),
                layout.inode_count,
                layout.block_count,
                layout.block_size
            );
        }
        Command::Oper { image, operation } => {
            let mut fs = FileSystem::mount(&image)?;
            debug!("running {:?} on {}", operation, image.display());
            let outcome = apply(&mut fs, operation);
            let closed = fs.close();
            outcome?;
            closed?;
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.use_stderr() => {
            eprintln!("{}", err);
            eprintln!("{}", USAGE);
            process::exit(1);
        }
        Err(err) => err.exit(),
    };

    if let Err(err) = run(cli) {
        eprint!("inodefs: {}", err);
        let mut source = err.source();
        while let Some(cause) = source {
            eprint!(": {}", cause);
            source = cause.source();
        }
        eprintln!();
        eprintln!("{}", USAGE);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_sizes_take_a_kilobyte_suffix() {
        assert_eq!(parse_block_size("64"), Ok(64));
        assert_eq!(parse_block_size("4K"), Ok(4096));
        assert_eq!(parse_block_size("1k"), Ok(1024));
        assert!(parse_block_size("K").is_err());
        assert!(parse_block_size("8M").is_err());
        assert!(parse_block_size("4194304K").is_err());
    }

    #[test]
    fn create_accepts_kilobyte_block_sizes() {
        let cli = Cli::try_parse_from(["inodefs", "create", "4K", "400", "disk.img"]).unwrap();
        match cli.command {
            Command::Create {
                block_size,
                inode_count,
                ..
            } => assert_eq!((block_size, inode_count), (4096, 400)),
            other => panic!("parsed as {:?}", other),
        }
    }
}
