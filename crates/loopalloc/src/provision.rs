//! Making `/dev/loopN` exist: `LOOP_CTL_ADD` first, `mknod` as the fallback.

use loopalloc_error::{LoopError, LoopResult};
use loopalloc_hal::path::LOOP_CONTROL;
use loopalloc_hal::{LockGuard, LoopHal};
use nix::errno::Errno;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;

/// Ensure `/dev/loopN` exists and has a kernel device behind it.
pub fn ensure_node<H: LoopHal + ?Sized>(hal: &H, number: u32) -> LoopResult<()> {
    match hal.open_control() {
        Ok(control) => {
            if add_through_control(hal, control.as_fd(), number)? {
                return Ok(());
            }
        }
        Err(errno) => {
            log::debug!("cannot open {}: {}, falling back to mknod", LOOP_CONTROL, errno);
        }
    }
    mknod_node(hal, number)
}

/// Returns `Ok(false)` when the node still has to be created by hand.
fn add_through_control<H: LoopHal + ?Sized>(
    hal: &H,
    control: BorrowedFd<'_>,
    number: u32,
) -> LoopResult<bool> {
    let _guard = LockGuard::acquire(hal, Path::new(LOOP_CONTROL)).map_err(|source| {
        LoopError::LockAcquire {
            path: LOOP_CONTROL.into(),
            source,
        }
    })?;

    if !ctl_add(hal, control, number) {
        return Ok(false);
    }
    if node_present(hal, number)? {
        return Ok(true);
    }

    log::debug!("/dev/loop{} missing after LOOP_CTL_ADD, re-adding it", number);
    match hal.ctl_remove(control, number) {
        Ok(_) => {}
        Err(Errno::EBUSY) => log::debug!("/dev/loop{} is busy, keeping it", number),
        Err(errno) => log::debug!("LOOP_CTL_REMOVE({}) failed: {}", number, errno),
    }
    if ctl_add(hal, control, number) && node_present(hal, number)? {
        return Ok(true);
    }

    // The kernel has the device but this mount namespace has no node for it.
    log::debug!("no node for /dev/loop{} after LOOP_CTL_ADD, using mknod", number);
    Ok(false)
}

fn ctl_add<H: LoopHal + ?Sized>(hal: &H, control: BorrowedFd<'_>, number: u32) -> bool {
    match hal.ctl_add(control, number) {
        Ok(added) if added == number => true,
        Ok(added) => {
            log::debug!("LOOP_CTL_ADD({}) allocated {} instead", number, added);
            false
        }
        Err(Errno::EEXIST) => true,
        Err(errno) => {
            log::debug!("LOOP_CTL_ADD({}) failed: {}", number, errno);
            false
        }
    }
}

fn node_present<H: LoopHal + ?Sized>(hal: &H, number: u32) -> LoopResult<bool> {
    hal.loop_node_exists(number)
        .map_err(|source| LoopError::DeviceOpen { number, source })
}

fn mknod_node<H: LoopHal + ?Sized>(hal: &H, number: u32) -> LoopResult<()> {
    match hal.mknod_loop(number) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(source) => Err(LoopError::DeviceProvision { number, source }),
    }
}
