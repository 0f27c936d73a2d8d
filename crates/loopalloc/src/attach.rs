//! Binding an image to a free loop device.
//!
//! Per candidate: open (provisioning on demand) under the per-device lock,
//! `LOOP_SET_FD`, close-on-exec, `LOOP_SET_STATUS64`. A device that fails
//! after `LOOP_SET_FD` is cleared before its lock is released.

use crate::config::AllocatorConfig;
use crate::handle::DeviceHandle;
use crate::opener::{open_device, OpenedDevice};
use crate::params::{ImageFingerprint, LoopParams};
use crate::provision::ensure_node;
use crate::transient::{flush_backing_cache, is_transient, RetryAction, TransientPolicy};
use loopalloc_error::{LoopError, LoopResult};
use loopalloc_hal::{LoopHal, LoopInfo64, OpenMode};
use nix::errno::Errno;
use std::os::fd::BorrowedFd;
use std::thread;

enum ConfigureError {
    TimedOut(Errno),
    Fatal(Errno),
}

pub fn attach_fresh<H: LoopHal + ?Sized>(
    hal: &H,
    image: BorrowedFd<'_>,
    fingerprint: &ImageFingerprint,
    params: &LoopParams,
    config: &AllocatorConfig,
    policy: &TransientPolicy,
) -> LoopResult<DeviceHandle> {
    let info = params.to_info();
    let mut timed_out = None;
    let mut unusable = None;

    for number in 0..config.max_devices {
        let mut device = match open_for_attach(hal, number, config.mode) {
            Ok(Some(device)) => device,
            Ok(None) => {
                log::debug!("loop device {} unavailable after provisioning", number);
                continue;
            }
            Err(err @ (LoopError::DeviceOpen { .. } | LoopError::DeviceProvision { .. })) => {
                log::debug!("skipping loop device {}: {}", number, err);
                if unusable.is_none() {
                    unusable = Some(err);
                }
                continue;
            }
            Err(err) => return Err(err),
        };

        if let Err(errno) = hal.set_fd(device.fd(), image) {
            log::debug!("LOOP_SET_FD on loop device {}: {}, trying next", number, errno);
            device.release_lock();
            continue;
        }

        if let Err(source) = hal.set_cloexec(device.fd()) {
            roll_back(hal, &mut device);
            return Err(LoopError::SetCloseOnExec { number, source });
        }

        match configure(hal, &device, &info, fingerprint.device, policy) {
            Ok(()) => {
                log::debug!("attached image to loop device {}", number);
                return Ok(DeviceHandle::new(number, device.into_fd(), false));
            }
            Err(ConfigureError::TimedOut(last)) => {
                log::debug!("cache invalidate too slow on loop device {}, trying next", number);
                roll_back(hal, &mut device);
                timed_out = Some(LoopError::CacheInvalidateTimeout { number, last });
            }
            Err(ConfigureError::Fatal(source)) => {
                roll_back(hal, &mut device);
                return Err(LoopError::SetStatus { number, source });
            }
        }
    }

    Err(timed_out.or(unusable).unwrap_or(LoopError::Exhausted {
        max_devices: config.max_devices,
    }))
}

fn open_for_attach<H: LoopHal + ?Sized>(
    hal: &H,
    number: u32,
    mode: OpenMode,
) -> LoopResult<Option<OpenedDevice<'_, H>>> {
    if let Some(device) = open_device(hal, number, mode, true)? {
        return Ok(Some(device));
    }
    ensure_node(hal, number)?;
    open_device(hal, number, mode, true)
}

/// `LOOP_SET_STATUS64` under the transient-error schedule.
fn configure<H: LoopHal + ?Sized>(
    hal: &H,
    device: &OpenedDevice<'_, H>,
    info: &LoopInfo64,
    image_dev: u64,
    policy: &TransientPolicy,
) -> Result<(), ConfigureError> {
    let mut retry = 0;
    loop {
        let errno = match hal.set_status(device.fd(), info) {
            Ok(()) => return Ok(()),
            Err(errno) if is_transient(errno) => errno,
            Err(errno) => return Err(ConfigureError::Fatal(errno)),
        };
        match policy.action(retry) {
            RetryAction::Sleep(delay) => {
                log::debug!(
                    "transient error {} on loop device {}, retrying in {:?}",
                    errno,
                    device.number(),
                    delay
                );
                thread::sleep(delay);
            }
            RetryAction::FlushCache => {
                let outcome = flush_backing_cache(hal, image_dev);
                log::debug!("flushed backing cache for loop device {}: {:?}", device.number(), outcome);
            }
            RetryAction::GiveUp => return Err(ConfigureError::TimedOut(errno)),
        }
        retry += 1;
    }
}

/// Clear the binding while the device lock is still held, then unlock.
fn roll_back<H: LoopHal + ?Sized>(hal: &H, device: &mut OpenedDevice<'_, H>) {
    if let Err(errno) = hal.clear_fd(device.fd()) {
        log::warn!("LOOP_CLR_FD on loop device {} failed: {}", device.number(), errno);
    }
    device.release_lock();
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopalloc_hal::path::loop_device_path;
    use loopalloc_hal::{FakeHal, Operation};
    use nix::sys::stat::fstat;
    use std::os::fd::{AsFd, AsRawFd};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn quick() -> TransientPolicy {
        TransientPolicy {
            interval: Duration::from_millis(1),
            grace: Duration::from_millis(1),
            ..TransientPolicy::default()
        }
    }

    fn run(hal: &FakeHal, max: u32) -> (NamedTempFile, LoopResult<DeviceHandle>) {
        let image = NamedTempFile::new().unwrap();
        let params = LoopParams::read_only();
        let fingerprint = ImageFingerprint::new(&fstat(image.as_file().as_raw_fd()).unwrap(), &params);
        let result = attach_fresh(
            hal,
            image.as_file().as_fd(),
            &fingerprint,
            &params,
            &AllocatorConfig::new(max),
            &quick(),
        );
        (image, result)
    }

    #[test]
    fn busy_devices_are_skipped() {
        let hal = FakeHal::new()
            .with_devices(3)
            .with_binding(0, LoopInfo64 { lo_inode: 9, ..Default::default() });
        let (_image, result) = run(&hal, 3);
        assert_eq!(result.unwrap().device_number(), 1);
        assert!(!hal.is_locked(&loop_device_path(0)));
        assert!(!hal.is_locked(&loop_device_path(1)));
    }

    #[test]
    fn strict_ioctl_order() {
        let hal = FakeHal::new().with_devices(1);
        let (_image, result) = run(&hal, 1);
        result.unwrap();
        let set_fd = hal.position(&Operation::SetFd { number: 0 }).unwrap();
        let cloexec = hal.position(&Operation::SetCloexec { number: 0 }).unwrap();
        let status = hal.position(&Operation::SetStatus { number: 0 }).unwrap();
        let unlock = hal
            .position(&Operation::Unlock { path: loop_device_path(0) })
            .unwrap();
        assert!(set_fd < cloexec && cloexec < status && status < unlock);
    }

    #[test]
    fn fatal_status_error_rolls_back_under_lock() {
        let hal = FakeHal::new()
            .with_devices(2)
            .fail_set_status_always(Errno::EINVAL);
        let (_image, result) = run(&hal, 2);
        assert!(matches!(
            result,
            Err(LoopError::SetStatus { number: 0, source: Errno::EINVAL })
        ));
        let clear = hal.position(&Operation::ClearFd { number: 0 }).unwrap();
        let unlock = hal
            .position(&Operation::Unlock { path: loop_device_path(0) })
            .unwrap();
        assert!(clear < unlock);
        assert!(hal.binding(0).is_none());
        assert!(!hal.has_operation(|op| *op == Operation::SetFd { number: 1 }));
    }

    #[test]
    fn timeout_moves_to_next_device() {
        let hal = FakeHal::new().with_devices(2).fail_set_status(Errno::EAGAIN, 8);
        let (_image, result) = run(&hal, 2);
        let handle = result.unwrap();
        assert_eq!(handle.device_number(), 1);
        assert!(hal.binding(0).is_none());
        assert!(hal.has_operation(|op| *op == Operation::Sync));
    }

    #[test]
    fn set_fd_failures_everywhere_exhaust() {
        let hal = FakeHal::new().with_devices(2).fail_set_fd_always(Errno::EBUSY);
        let (_image, result) = run(&hal, 2);
        assert!(matches!(result, Err(LoopError::Exhausted { max_devices: 2 })));
        assert!(!hal.has_operation(|op| matches!(op, Operation::ClearFd { .. })));
    }

    #[test]
    fn unopenable_device_is_skipped() {
        let hal = FakeHal::new()
            .with_devices(4)
            .fail_open(0, Errno::EACCES);
        let (_image, result) = run(&hal, 4);
        assert_eq!(result.unwrap().device_number(), 1);
        assert!(!hal.has_operation(|op| *op == Operation::SetFd { number: 0 }));
    }

    #[test]
    fn open_failure_surfaces_when_nothing_else_works() {
        let hal = FakeHal::new()
            .with_devices(2)
            .fail_open(0, Errno::EACCES)
            .fail_set_fd_always(Errno::EBUSY);
        let (_image, result) = run(&hal, 2);
        assert!(matches!(
            result,
            Err(LoopError::DeviceOpen { number: 0, source: Errno::EACCES })
        ));
    }

    #[test]
    fn missing_node_is_provisioned() {
        let hal = FakeHal::new();
        let (_image, result) = run(&hal, 1);
        assert_eq!(result.unwrap().device_number(), 0);
        assert!(hal.has_operation(|op| *op == Operation::CtlAdd { number: 0 }));
        assert!(hal.binding(0).is_some());
    }
}
