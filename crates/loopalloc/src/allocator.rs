//! The allocator front end: fingerprinting, sharing, fresh attach.

use crate::attach::attach_fresh;
use crate::config::AllocatorConfig;
use crate::handle::DeviceHandle;
use crate::params::{ImageFingerprint, LoopParams, LoopStatus};
use crate::share::try_share;
use crate::status;
use crate::transient::TransientPolicy;
use loopalloc_error::{LoopError, LoopResult};
use loopalloc_hal::path::proc_fd_path;
use loopalloc_hal::{LockGuard, LoopHal, OpenMode};
use nix::errno::Errno;
use nix::sys::stat::fstat;
use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;

/// Loop-device allocator over a system seam `H`.
///
/// Holds no mutable state; one allocator can serve any number of threads.
#[derive(Debug, Clone)]
pub struct LoopAllocator<H: LoopHal> {
    hal: H,
    config: AllocatorConfig,
    policy: TransientPolicy,
}

impl<H: LoopHal> LoopAllocator<H> {
    pub fn new(hal: H, config: AllocatorConfig) -> Self {
        Self {
            hal,
            config,
            policy: TransientPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: TransientPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bind `image` to a loop device, adopting an identical binding when
    /// sharing is enabled.
    ///
    /// The image descriptor is borrowed and stays open.
    pub fn attach<F: AsFd>(&self, image: F, params: &LoopParams) -> LoopResult<DeviceHandle> {
        if self.config.max_devices == 0 {
            return Err(LoopError::Exhausted { max_devices: 0 });
        }

        let image = image.as_fd();
        let st = fstat(image.as_raw_fd()).map_err(|source| LoopError::ImageStat { source })?;
        let fingerprint = ImageFingerprint::new(&st, params);

        let _window = if self.config.share {
            let window = self.lock_share_window(image.as_raw_fd());
            if let Some(handle) = try_share(&self.hal, &fingerprint, &self.config) {
                return Ok(handle);
            }
            window
        } else {
            None
        };

        attach_fresh(
            &self.hal,
            image,
            &fingerprint,
            params,
            &self.config,
            &self.policy,
        )
    }

    /// Open `path` in `mode` and attach it. The image descriptor is closed on
    /// return; the binding keeps the file alive.
    pub fn attach_from_path(
        &self,
        path: &Path,
        mode: OpenMode,
        params: &LoopParams,
    ) -> LoopResult<DeviceHandle> {
        if path.as_os_str().is_empty() {
            return Err(LoopError::InvalidArgument("empty image path".into()));
        }
        let image = OpenOptions::new()
            .read(true)
            .write(mode.is_writable())
            .open(path)
            .map_err(|err| LoopError::ImageStat {
                source: Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO)),
            })?;
        self.attach(&image, params)
    }

    pub fn status_from_fd<F: AsFd>(&self, loop_fd: F) -> LoopResult<LoopStatus> {
        status::read_status(&self.hal, loop_fd.as_fd())
    }

    pub fn status_from_path(&self, path: &Path) -> LoopResult<LoopStatus> {
        status::status_from_path(&self.hal, path)
    }

    pub fn detach(&self, path: &Path) -> LoopResult<()> {
        status::detach(&self.hal, path)
    }

    /// Serialise probe and attach for one image across processes.
    fn lock_share_window(&self, image_fd: RawFd) -> Option<LockGuard<'_, H>> {
        let path = proc_fd_path(image_fd);
        match LockGuard::acquire(&self.hal, &path) {
            Ok(guard) => Some(guard),
            Err(errno) => {
                log::debug!("couldn't lock image {}: {}, sharing unguarded", path.display(), errno);
                None
            }
        }
    }
}
