//! Opening candidate `/dev/loopN` devices.

use loopalloc_error::{LoopError, LoopResult};
use loopalloc_hal::path::loop_device_path;
use loopalloc_hal::{LockGuard, LoopHal, OpenMode};
use nix::errno::Errno;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

/// An open loop device, optionally holding its per-device exclusive lock.
pub struct OpenedDevice<'a, H: LoopHal + ?Sized> {
    number: u32,
    fd: OwnedFd,
    lock: Option<LockGuard<'a, H>>,
}

impl<'a, H: LoopHal + ?Sized> OpenedDevice<'a, H> {
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.as_ref().is_some_and(LockGuard::is_held)
    }

    /// Release the per-device lock. Only the first call has an effect.
    pub fn release_lock(&mut self) {
        if let Some(mut guard) = self.lock.take() {
            if let Err(err) = guard.unlock() {
                log::warn!("failed to unlock /dev/loop{}: {}", self.number, err);
            }
        }
    }

    /// Release the lock and keep the descriptor.
    pub fn into_fd(mut self) -> OwnedFd {
        self.release_lock();
        self.fd
    }
}

/// Open `/dev/loopN`.
///
/// `Ok(None)` means the device is not usable as-is: the node is absent
/// (`ENOENT`) or the kernel has no device behind it (`ENXIO`). Callers that
/// can provision decide what to do with that; probes just move on.
pub fn open_device<H: LoopHal + ?Sized>(
    hal: &H,
    number: u32,
    mode: OpenMode,
    want_lock: bool,
) -> LoopResult<Option<OpenedDevice<'_, H>>> {
    let open_err = |source| LoopError::DeviceOpen { number, source };

    if !hal.loop_node_exists(number).map_err(open_err)? {
        return Ok(None);
    }

    let path = loop_device_path(number);
    let fd = match hal.open_device(&path, mode) {
        Ok(fd) => fd,
        Err(Errno::ENOENT) | Err(Errno::ENXIO) => return Ok(None),
        Err(source) => return Err(open_err(source)),
    };

    let lock = if want_lock {
        let guard = LockGuard::acquire(hal, &path)
            .map_err(|source| LoopError::LockAcquire { path, source })?;
        Some(guard)
    } else {
        None
    };

    Ok(Some(OpenedDevice { number, fd, lock }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopalloc_hal::{FakeHal, Operation};
    use std::path::PathBuf;

    #[test]
    fn missing_and_unregistered_devices_are_none() {
        let hal = FakeHal::new().with_unregistered_node(1);
        assert!(open_device(&hal, 0, OpenMode::ReadOnly, false)
            .unwrap()
            .is_none());
        assert!(open_device(&hal, 1, OpenMode::ReadOnly, true)
            .unwrap()
            .is_none());
        assert!(!hal.has_operation(|op| matches!(op, Operation::Lock { .. })));
    }

    #[test]
    fn locked_open_holds_lock_until_released() {
        let hal = FakeHal::new().with_devices(1);
        let mut device = open_device(&hal, 0, OpenMode::ReadWrite, true)
            .unwrap()
            .unwrap();
        assert_eq!(device.number(), 0);
        assert!(device.is_locked());
        assert!(hal.is_locked(&PathBuf::from("/dev/loop0")));

        device.release_lock();
        device.release_lock();
        assert!(!device.is_locked());
        assert!(!hal.is_locked(&PathBuf::from("/dev/loop0")));
        let unlocks = hal
            .operations()
            .into_iter()
            .filter(|op| matches!(op, Operation::Unlock { .. }))
            .count();
        assert_eq!(unlocks, 1);
    }

    #[test]
    fn unlocked_open_takes_no_lock() {
        let hal = FakeHal::new().with_devices(1);
        let device = open_device(&hal, 0, OpenMode::ReadOnly, false)
            .unwrap()
            .unwrap();
        assert!(!device.is_locked());
        let _fd = device.into_fd();
        assert!(!hal.has_operation(|op| matches!(op, Operation::Lock { .. })));
    }

    #[test]
    fn dropping_a_locked_device_unlocks_it() {
        let hal = FakeHal::new().with_devices(1);
        drop(open_device(&hal, 0, OpenMode::ReadOnly, true).unwrap());
        assert!(!hal.is_locked(&PathBuf::from("/dev/loop0")));
    }
}
