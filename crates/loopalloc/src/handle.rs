//! Ownership of an allocated loop device.

use loopalloc_error::LoopResult;
use loopalloc_hal::path::loop_device_path;
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::path::PathBuf;

/// A loop device bound to the caller's image.
///
/// Closing (or dropping) the handle releases the descriptor only. The binding
/// stays until the kernel drops it on last close (`AUTO_CLEAR`) or someone
/// detaches it explicitly, so shared handles never tear down each other's
/// device.
#[derive(Debug)]
pub struct DeviceHandle {
    number: u32,
    fd: Option<OwnedFd>,
    shared: bool,
}

impl DeviceHandle {
    pub(crate) fn new(number: u32, fd: OwnedFd, shared: bool) -> Self {
        Self {
            number,
            fd: Some(fd),
            shared,
        }
    }

    pub fn device_number(&self) -> u32 {
        self.number
    }

    /// True when an existing binding was adopted rather than created.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn path(&self) -> PathBuf {
        loop_device_path(self.number)
    }

    /// The open loop descriptor, until the handle is closed.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(AsFd::as_fd)
    }

    pub fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    /// Close the loop descriptor. A second call does nothing.
    pub fn close(&mut self) -> LoopResult<()> {
        if let Some(fd) = self.fd.take() {
            nix::unistd::close(fd.into_raw_fd())?;
        }
        Ok(())
    }
}
