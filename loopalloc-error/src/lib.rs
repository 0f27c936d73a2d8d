use nix::errno::Errno;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type LoopResult<T> = Result<T, LoopError>;

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cannot stat backing image: {source}")]
    ImageStat {
        #[source]
        source: Errno,
    },

    #[error("Cannot create /dev/loop{number}: {source}")]
    DeviceProvision {
        number: u32,
        #[source]
        source: Errno,
    },

    #[error("Cannot open /dev/loop{number}: {source}")]
    DeviceOpen {
        number: u32,
        #[source]
        source: Errno,
    },

    #[error("No loop devices available (scanned {max_devices})")]
    Exhausted { max_devices: u32 },

    #[error("Cache invalidate too slow on /dev/loop{number} (last error: {last})")]
    CacheInvalidateTimeout { number: u32, last: Errno },

    #[error("Failed to set close-on-exec on /dev/loop{number}: {source}")]
    SetCloseOnExec {
        number: u32,
        #[source]
        source: Errno,
    },

    #[error("Failed to set loop status on /dev/loop{number}: {source}")]
    SetStatus {
        number: u32,
        #[source]
        source: Errno,
    },

    #[error("Failed to get loop status: {source}")]
    GetStatus {
        #[source]
        source: Errno,
    },

    #[error("Failed to acquire exclusive lock on {}: {source}", .path.display())]
    LockAcquire {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("Failed to detach {}: {source}", .path.display())]
    Detach {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("nix errno: {0}")]
    Nix(#[from] Errno),
}
