//! Adopting a loop device that already carries the caller's image.

use crate::config::AllocatorConfig;
use crate::handle::DeviceHandle;
use crate::opener::open_device;
use crate::params::ImageFingerprint;
use crate::status::read_status;
use loopalloc_hal::LoopHal;

/// Scan existing devices for a binding equal to `fingerprint`.
///
/// Never creates nodes and never touches a binding. The adopted descriptor
/// keeps the device alive until the handle is closed.
pub fn try_share<H: LoopHal + ?Sized>(
    hal: &H,
    fingerprint: &ImageFingerprint,
    config: &AllocatorConfig,
) -> Option<DeviceHandle> {
    for number in 0..config.max_devices {
        let device = match open_device(hal, number, config.mode, false) {
            Ok(Some(device)) => device,
            Ok(None) => continue,
            Err(err) => {
                log::debug!("couldn't open loop device {}: {}", number, err);
                continue;
            }
        };

        let status = match read_status(hal, device.fd()) {
            Ok(status) => status,
            Err(err) => {
                log::debug!("couldn't get status from loop device {}: {}", number, err);
                continue;
            }
        };

        if fingerprint.matches(&status) {
            log::debug!("sharing loop device {}", number);
            return Some(DeviceHandle::new(number, device.into_fd(), true));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopalloc_hal::{FakeHal, LoopFlags, LoopInfo64, Operation};

    fn fingerprint() -> ImageFingerprint {
        ImageFingerprint {
            inode: 77,
            device: 2049,
            offset: 0,
            size_limit: 0,
            read_only: true,
        }
    }

    fn binding(flags: LoopFlags) -> LoopInfo64 {
        LoopInfo64 {
            lo_inode: 77,
            lo_device: 2049,
            lo_flags: flags.bits(),
            ..Default::default()
        }
    }

    #[test]
    fn adopts_matching_binding() {
        let hal = FakeHal::new()
            .with_devices(2)
            .with_binding(3, binding(LoopFlags::READ_ONLY));
        let handle = try_share(&hal, &fingerprint(), &AllocatorConfig::new(8)).unwrap();
        assert_eq!(handle.device_number(), 3);
        assert!(handle.is_shared());
    }

    #[test]
    fn read_only_bit_must_agree() {
        let hal = FakeHal::new().with_binding(0, binding(LoopFlags::empty()));
        assert!(try_share(&hal, &fingerprint(), &AllocatorConfig::new(8)).is_none());
    }

    #[test]
    fn probe_is_read_only() {
        let hal = FakeHal::new().with_devices(2);
        assert!(try_share(&hal, &fingerprint(), &AllocatorConfig::new(4)).is_none());
        assert!(hal.operations().iter().all(|op| matches!(
            op,
            Operation::Open { .. } | Operation::GetStatus { .. }
        )));
        assert!(!hal.node_exists(2));
    }
}
