use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use loopalloc::{AllocatorConfig, LinuxHal, LoopAllocator, LoopFlags, LoopParams, LoopStatus};
use loopalloc_hal::OpenMode;
use nix::sys::stat::{major, minor};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "loopalloc")]
#[command(about = "Attach images to Linux loop devices")]
struct Cli {
    /// TOML file with a [loop] table
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log every probe and attach decision
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Bind an image to a loop device and print its path
    Attach(AttachArgs),

    /// Show the binding of a loop device
    Status { device: PathBuf },

    /// Drop the binding of a loop device
    Detach { device: PathBuf },
}

#[derive(Debug, Args)]
struct AttachArgs {
    image: PathBuf,

    /// Byte offset into the image
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// Bytes to expose, 0 for the rest of the file
    #[arg(long, default_value_t = 0)]
    size_limit: u64,

    /// Open the image and bind it writable
    #[arg(long)]
    read_write: bool,

    /// Let the kernel drop the binding on last close
    #[arg(long)]
    autoclear: bool,

    #[arg(long)]
    partscan: bool,

    #[arg(long)]
    direct_io: bool,

    /// Reuse an existing binding of the same image
    #[arg(long)]
    share: bool,

    /// Highest loop device number to consider, exclusive
    #[arg(long)]
    max_devices: Option<u32>,

    /// Label stored in the binding's file name field
    #[arg(long)]
    name: Option<String>,

    /// Keep the device open until stdin is closed
    #[arg(long)]
    hold: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Attach(args) => attach(config, &args)?,
        Commands::Status { device } => status(config, &device)?,
        Commands::Detach { device } => {
            LoopAllocator::new(LinuxHal::new(), config)
                .detach(&device)
                .with_context(|| format!("failed to detach {}", device.display()))?;
            log::info!("detached {}", device.display());
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<AllocatorConfig> {
    match path {
        Some(path) => AllocatorConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(AllocatorConfig::default()),
    }
}

fn attach(mut config: AllocatorConfig, args: &AttachArgs) -> Result<()> {
    if args.share {
        config.share = true;
    }
    if let Some(max) = args.max_devices {
        config.max_devices = max;
    }
    let mode = if args.read_write {
        OpenMode::ReadWrite
    } else {
        OpenMode::ReadOnly
    };
    config.mode = mode;

    let params = attach_params(args);
    let allocator = LoopAllocator::new(LinuxHal::new(), config);
    let mut handle = allocator
        .attach_from_path(&args.image, mode, &params)
        .with_context(|| format!("failed to attach {}", args.image.display()))?;

    println!("{}", handle.path().display());
    if handle.is_shared() {
        log::info!("reusing existing binding on {}", handle.path().display());
    }

    if args.hold {
        log::info!("holding {} until stdin is closed", handle.path().display());
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            line.context("failed to read stdin")?;
        }
    } else if args.autoclear && !handle.is_shared() {
        log::warn!(
            "{} is auto-clear and will be released on exit unless something else holds it",
            handle.path().display()
        );
    }

    handle.close()?;
    Ok(())
}

fn attach_params(args: &AttachArgs) -> LoopParams {
    let mut flags = LoopFlags::empty();
    if !args.read_write {
        flags |= LoopFlags::READ_ONLY;
    }
    if args.autoclear {
        flags |= LoopFlags::AUTO_CLEAR;
    }
    if args.partscan {
        flags |= LoopFlags::PART_SCAN;
    }
    if args.direct_io {
        flags |= LoopFlags::DIRECT_IO;
    }

    let mut params = LoopParams::new()
        .with_flags(flags)
        .with_offset(args.offset)
        .with_size_limit(args.size_limit);
    if let Some(name) = &args.name {
        params = params.with_file_name(name);
    }
    params
}

fn status(config: AllocatorConfig, device: &Path) -> Result<()> {
    let status = LoopAllocator::new(LinuxHal::new(), config)
        .status_from_path(device)
        .with_context(|| format!("failed to read status of {}", device.display()))?;
    if !status.is_bound() {
        return Err(anyhow!("{} has no image bound", device.display()));
    }
    print_status(device, &status);
    Ok(())
}

fn print_status(device: &Path, status: &LoopStatus) {
    println!("device:     {}", device.display());
    println!(
        "backing:    {}:{} inode {}",
        major(status.device),
        minor(status.device),
        status.inode
    );
    println!("offset:     {}", status.offset);
    println!("size limit: {}", status.size_limit);
    println!("flags:      {:?}", status.flags);
    let name = status.file_name_lossy();
    if !name.is_empty() {
        println!("file name:  {}", name);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn attach_defaults_to_read_only() {
        let cli = Cli::parse_from(["loopalloc", "attach", "/tmp/a.img"]);
        let Commands::Attach(args) = cli.command else {
            panic!("expected attach");
        };
        let params = attach_params(&args);
        assert_eq!(params.flags, LoopFlags::READ_ONLY);
        assert_eq!(params.offset, 0);
    }

    #[test]
    fn attach_flags_map_to_loop_flags() {
        let cli = Cli::parse_from([
            "loopalloc",
            "attach",
            "--read-write",
            "--autoclear",
            "--partscan",
            "--offset",
            "512",
            "--name",
            "disk",
            "/tmp/a.img",
        ]);
        let Commands::Attach(args) = cli.command else {
            panic!("expected attach");
        };
        let params = attach_params(&args);
        assert_eq!(params.flags, LoopFlags::AUTO_CLEAR | LoopFlags::PART_SCAN);
        assert_eq!(params.offset, 512);
        assert_eq!(&params.file_name[..4], b"disk");
    }
}
