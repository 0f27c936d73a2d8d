use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

pub const LOOP_CONTROL: &str = "/dev/loop-control";
pub const LOOP_DEV_PREFIX: &str = "/dev/loop";

/// Block major number of the loop driver.
pub const LOOP_MAJOR: u64 = 7;

/// Device node path for loop device `number`.
pub fn loop_device_path(number: u32) -> PathBuf {
    PathBuf::from(format!("{}{}", LOOP_DEV_PREFIX, number))
}

/// Inverse of [`loop_device_path`]. `/dev/loop-control` is not a device path.
pub fn loop_number_from_path(path: &Path) -> Option<u32> {
    path.to_str()?.strip_prefix(LOOP_DEV_PREFIX)?.parse().ok()
}

/// Path that reopens an already open descriptor of this process.
pub fn proc_fd_path(fd: RawFd) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", fd))
}
