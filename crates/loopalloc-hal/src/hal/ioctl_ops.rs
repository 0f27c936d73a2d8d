//! Loop driver ioctls on an open `/dev/loopN` descriptor.

use crate::LoopInfo64;
use nix::fcntl::OFlag;
use serde::{Deserialize, Serialize};
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;

/// Access mode used when opening a loop device or a backing image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpenMode {
    #[default]
    ReadOnly,
    ReadWrite,
}

impl OpenMode {
    pub fn oflag(self) -> OFlag {
        match self {
            OpenMode::ReadOnly => OFlag::O_RDONLY,
            OpenMode::ReadWrite => OFlag::O_RDWR,
        }
    }

    pub fn is_writable(self) -> bool {
        self == OpenMode::ReadWrite
    }
}

/// Typed wrappers for the loop ioctls plus the descriptor plumbing around them.
///
/// Errors are raw errno values: callers classify `EBUSY`, `EAGAIN`, `ENXIO`
/// and `ENOENT` themselves.
pub trait LoopIoctlOps {
    /// Open a device node. The descriptor is not close-on-exec until
    /// [`LoopIoctlOps::set_cloexec`] is called.
    ///
    /// `ENOENT` means the node is absent; `ENXIO` means the node exists but the
    /// kernel has no device behind it.
    fn open_device(&self, path: &Path, mode: OpenMode) -> nix::Result<OwnedFd>;

    /// `LOOP_SET_FD`: bind `image` to the loop device. `EBUSY` if already bound.
    fn set_fd(&self, loop_fd: BorrowedFd<'_>, image: BorrowedFd<'_>) -> nix::Result<()>;

    /// `LOOP_CLR_FD`: drop the binding.
    fn clear_fd(&self, loop_fd: BorrowedFd<'_>) -> nix::Result<()>;

    /// `LOOP_SET_STATUS64`.
    fn set_status(&self, loop_fd: BorrowedFd<'_>, info: &LoopInfo64) -> nix::Result<()>;

    /// `LOOP_GET_STATUS64`. `ENXIO` means nothing is bound.
    fn get_status(&self, loop_fd: BorrowedFd<'_>) -> nix::Result<LoopInfo64>;

    /// `fcntl(F_SETFD, FD_CLOEXEC)`.
    fn set_cloexec(&self, fd: BorrowedFd<'_>) -> nix::Result<()>;
}
