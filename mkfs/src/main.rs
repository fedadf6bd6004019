//! Disk image utility: formats a fresh file system image, or lists the
//! root directory of an existing one. The programmatic equivalent of
//! `do_format`/`fsutil_ls`, built on top of [`filesys::FileSystem`] the
//! way a disk-image builder drives the on-disk layout directly through
//! `std::fs::File` rather than through a running kernel.

use std::fs::File;

use clap::{Parser, Subcommand};
use filesys::{FileDevice, FileSystem};

#[derive(Parser, Debug)]
#[command(about = "Format or inspect a filesys disk image")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Emit trace/debug logging from the file system core.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a fresh, zeroed image and write an empty file system to it.
    Format {
        /// Path of the image file to create (overwritten if it exists).
        path: String,
        /// Total number of 512-byte sectors in the image.
        sectors: u32,
    },
    /// Mount an existing image and list the contents of the root directory.
    Ls {
        /// Path of the image file to read.
        path: String,
    },
}

fn main() {
    let args = Args::parse();
    let level = if args.verbose { "trace" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match args.command {
        Command::Format { path, sectors } => format(&path, sectors),
        Command::Ls { path } => ls(&path),
    }
}

fn format(path: &str, sectors: u32) {
    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .unwrap_or_else(|e| panic!("mkfs: cannot create {path}: {e}"));
    let device = FileDevice::create(file, sectors)
        .unwrap_or_else(|e| panic!("mkfs: cannot zero {path}: {e}"));

    let fs = FileSystem::filesys_init(device, true);
    fs.filesys_done();
    println!("mkfs: formatted {path} ({sectors} sectors)");
}

fn ls(path: &str) {
    let file = File::options()
        .read(true)
        .write(true)
        .open(path)
        .unwrap_or_else(|e| panic!("mkfs: cannot open {path}: {e}"));
    let metadata = file.metadata().unwrap_or_else(|e| panic!("mkfs: cannot stat {path}: {e}"));
    let sectors = (metadata.len() / 512) as u32;
    let device = FileDevice::open(file, sectors);

    let fs = FileSystem::filesys_init(device, false);
    let mut root = fs
        .filesys_open("/")
        .unwrap_or_else(|| panic!("mkfs: {path}: root directory missing or corrupt"));
    while let Some(name) = fs.file_readdir(&mut root) {
        println!("{name}");
    }
    fs.file_close(root);
}
