//! Reading and clearing bindings of existing loop devices.

use crate::params::LoopStatus;
use loopalloc_error::{LoopError, LoopResult};
use loopalloc_hal::{LoopIoctlOps, OpenMode};
use nix::errno::Errno;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;

/// `LOOP_GET_STATUS64` with `ENXIO` mapped to [`LoopStatus::unbound`].
pub fn read_status<H: LoopIoctlOps + ?Sized>(
    hal: &H,
    loop_fd: BorrowedFd<'_>,
) -> LoopResult<LoopStatus> {
    match hal.get_status(loop_fd) {
        Ok(info) => Ok(info.into()),
        Err(Errno::ENXIO) => Ok(LoopStatus::unbound()),
        Err(source) => Err(LoopError::GetStatus { source }),
    }
}

pub fn status_from_path<H: LoopIoctlOps + ?Sized>(hal: &H, path: &Path) -> LoopResult<LoopStatus> {
    if path.as_os_str().is_empty() {
        return Err(LoopError::InvalidArgument("empty loop device path".into()));
    }
    let fd = hal
        .open_device(path, OpenMode::ReadOnly)
        .map_err(|source| LoopError::GetStatus { source })?;
    read_status(hal, fd.as_fd())
}

/// Explicitly drop the binding of the device at `path` (`LOOP_CLR_FD`).
///
/// The kernel defers the teardown while other descriptors are open.
pub fn detach<H: LoopIoctlOps + ?Sized>(hal: &H, path: &Path) -> LoopResult<()> {
    let detach_err = |source| LoopError::Detach {
        path: path.to_path_buf(),
        source,
    };
    let fd = hal
        .open_device(path, OpenMode::ReadOnly)
        .map_err(detach_err)?;
    hal.clear_fd(fd.as_fd()).map_err(detach_err)?;
    log::debug!("detached {}", path.display());
    Ok(())
}
