//! Linux loop-device allocator.
//!
//! Given an open backing image, [`LoopAllocator::attach`] finds or provisions a
//! `/dev/loopN`, binds the image with the requested offset, size limit and
//! flags, and returns a [`DeviceHandle`] owning the loop descriptor. Several
//! processes may allocate concurrently: each candidate device is configured
//! under its own exclusive lock and rolled back with `LOOP_CLR_FD` if anything
//! after `LOOP_SET_FD` fails.
//!
//! All kernel access goes through [`loopalloc_hal::LoopHal`]; the free
//! functions below use the real [`LinuxHal`].

pub mod allocator;
pub mod attach;
pub mod config;
pub mod handle;
pub mod opener;
pub mod params;
pub mod provision;
pub mod share;
pub mod status;
pub mod transient;

pub use allocator::LoopAllocator;
pub use config::{AllocatorConfig, DEFAULT_MAX_LOOP_DEVICES};
pub use handle::DeviceHandle;
pub use loopalloc_error::{LoopError, LoopResult};
pub use loopalloc_hal::{LinuxHal, LoopFlags, LoopHal, OpenMode};
pub use params::{ImageFingerprint, LoopParams, LoopStatus};
pub use transient::TransientPolicy;

use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

pub fn attach<F: AsFd>(
    image: F,
    params: &LoopParams,
    config: AllocatorConfig,
) -> LoopResult<DeviceHandle> {
    LoopAllocator::new(LinuxHal::new(), config).attach(image, params)
}

pub fn attach_from_path(
    path: &Path,
    mode: OpenMode,
    params: &LoopParams,
    config: AllocatorConfig,
) -> LoopResult<DeviceHandle> {
    LoopAllocator::new(LinuxHal::new(), config).attach_from_path(path, mode, params)
}

pub fn get_status_from_fd<F: AsFd>(loop_fd: F) -> LoopResult<LoopStatus> {
    status::read_status(&LinuxHal::new(), loop_fd.as_fd())
}

pub fn get_status_from_path(path: &Path) -> LoopResult<LoopStatus> {
    status::status_from_path(&LinuxHal::new(), path)
}

pub fn detach(path: &Path) -> LoopResult<()> {
    status::detach(&LinuxHal::new(), path)
}

/// Attach `image` read-only with auto-clear, reusing an identical binding.
///
/// Returns the device path alongside the handle. The device goes away once
/// every holder (handles, mounts) has let go of it.
pub fn create_shared_loop<H: LoopHal, F: AsFd>(
    hal: H,
    image: F,
    offset: u64,
    size_limit: u64,
    max_devices: u32,
) -> LoopResult<(PathBuf, DeviceHandle)> {
    let config = AllocatorConfig::new(max_devices)
        .with_share(true)
        .with_mode(OpenMode::ReadOnly);
    let params = LoopParams::read_only()
        .with_flags(LoopFlags::AUTO_CLEAR)
        .with_offset(offset)
        .with_size_limit(size_limit);
    let handle = LoopAllocator::new(hal, config).attach(image, &params)?;
    Ok((handle.path(), handle))
}
