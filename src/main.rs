//! hfs-boot - inspect HFS/HFS+ disk images the way the boot loader sees them
//!
//! Usage:
//!   hfs-boot disk.img info
//!   hfs-boot disk.img ls /System/Library
//!   hfs-boot disk.img cat '\System\Library\Foo' -o foo.bin

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{LevelFilter, Log, Metadata, Record};

use hfs_boot::{BootLoader, DirIndex, EntryKind, LoaderConfig, LOAD_FAILED};

const DEVICE: u32 = 0;

#[derive(Parser)]
#[command(name = "hfs-boot", version = env!("APP_VERSION"))]
#[command(about = "Read files from HFS and HFS+ volume images")]
struct Args {
    /// Disk or partition image
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    /// Loader settings (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Byte offset of the volume inside the image (overrides the config)
    #[arg(long, value_name = "BYTES")]
    offset: Option<u64>,

    /// Skip the ownership and mode check on loaded files
    #[arg(long)]
    no_ownership_check: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show volume geometry
    Info,
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
        /// Include thread records
        #[arg(short, long)]
        all: bool,
    },
    /// Load a file the way the boot loader does
    Cat {
        path: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => LoaderConfig::load(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => LoaderConfig::default(),
    };
    if let Some(offset) = args.offset {
        config.partition_offset = offset;
    }
    if args.no_ownership_check {
        config.enforce_ownership = false;
    }

    let file = File::open(&args.image)
        .with_context(|| format!("opening {}", args.image.display()))?;
    let mut loader = BootLoader::new(config);
    loader
        .mount(DEVICE, BufReader::new(file))
        .with_context(|| format!("mounting {}", args.image.display()))?;

    match args.command {
        Command::Info => info(&mut loader),
        Command::Ls { path, all } => ls(&mut loader, &path, all),
        Command::Cat { path, output } => cat(&mut loader, &path, output),
    }
}

fn info(loader: &mut BootLoader<BufReader<File>>) -> Result<()> {
    let volume = loader.volume(DEVICE)?;
    let header = volume.header().clone();
    println!("Volume:      {}", volume.volume_name());
    println!("Format:      {}", header.fs_type());
    println!("Block size:  {}", header.block_size);
    println!(
        "Blocks:      {} ({} free)",
        header.total_blocks, header.free_blocks
    );
    println!("Size:        {} bytes", header.total_size());
    println!("Data starts: byte {}", header.allocation_offset);
    if let Some(id) = header.system_dir_id() {
        println!("System dir:  {id}");
    }
    println!("Collation:   {:?}", volume.collation());
    let (hits, misses) = volume.cache_stats();
    log::debug!("block cache: {hits} hits, {misses} misses");
    Ok(())
}

fn ls(loader: &mut BootLoader<BufReader<File>>, path: &str, all: bool) -> Result<()> {
    // Surface the real error before falling back to the sentinel API.
    let dir = loader.volume(DEVICE)?.stat(path)?;
    if !dir.is_directory() {
        bail!("{path}: not a directory");
    }

    let mut cursor = DirIndex::START;
    while let Some(entry) = loader.get_dir_entry(DEVICE, path, &mut cursor) {
        let marker = match entry.flags.kind {
            EntryKind::Directory => 'd',
            EntryKind::File => '-',
            EntryKind::Unknown if all => '?',
            EntryKind::Unknown => continue,
        };
        let modified = entry
            .modified()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".repeat(16));
        println!(
            "{marker} {:>6o} {:>10} {modified}  {}",
            entry.flags.permissions(),
            entry.size,
            entry.name
        );
    }
    Ok(())
}

fn cat(
    loader: &mut BootLoader<BufReader<File>>,
    path: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let limit = loader.config().max_file_size;
    let entry = loader.volume(DEVICE)?.stat(path)?;
    if entry.size > limit {
        bail!("{path}: {} bytes exceeds the load limit of {limit}", entry.size);
    }

    let mut buf = vec![0u8; entry.size as usize];
    let n = loader.load_file(DEVICE, path, &mut buf);
    if n == LOAD_FAILED {
        // Repeat through the library API for a descriptive error.
        loader.volume(DEVICE)?.load_file(path)?;
        bail!("{path}: load failed");
    }
    buf.truncate(n as usize);

    match output {
        Some(dest) => std::fs::write(&dest, &buf)
            .with_context(|| format!("writing {}", dest.display()))?,
        None => io::stdout().lock().write_all(&buf)?,
    }
    Ok(())
}
