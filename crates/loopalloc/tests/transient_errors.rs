use loopalloc::{AllocatorConfig, LoopAllocator, LoopError, LoopParams, TransientPolicy};
use loopalloc_hal::{FakeHal, Operation};
use nix::errno::Errno;
use nix::sys::stat::{fstat, major, minor};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

#[test]
fn eagain_twice_then_success() {
    let hal = FakeHal::new()
        .with_devices(1)
        .fail_set_status(Errno::EAGAIN, 2);
    let allocator = LoopAllocator::new(hal.clone(), AllocatorConfig::new(8));
    let image = NamedTempFile::new().unwrap();

    let started = Instant::now();
    let handle = allocator
        .attach(image.as_file(), &LoopParams::read_only())
        .expect("transient errors should clear");
    let elapsed = started.elapsed();

    assert_eq!(handle.device_number(), 0);
    assert!(elapsed >= Duration::from_millis(400), "took {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(800), "took {:?}", elapsed);
    assert!(!hal.has_operation(|op| *op == Operation::Sync));
}

#[test]
fn endless_eagain_times_out() {
    let hal = FakeHal::new()
        .with_devices(1)
        .fail_set_status_always(Errno::EAGAIN);
    let allocator = LoopAllocator::new(hal.clone(), AllocatorConfig::new(1));
    let image = NamedTempFile::new().unwrap();

    let started = Instant::now();
    let err = allocator
        .attach(image.as_file(), &LoopParams::read_only())
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(
        err,
        LoopError::CacheInvalidateTimeout {
            number: 0,
            last: Errno::EAGAIN
        }
    ));
    assert!(elapsed >= TransientPolicy::default().max_delay());
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    assert!(hal.has_operation(|op| *op == Operation::Sync));
    assert!(hal.has_operation(|op| *op == Operation::ClearFd { number: 0 }));
    assert!(hal.binding(0).is_none());
}

#[test]
fn ebusy_is_retried_like_eagain() {
    let hal = FakeHal::new()
        .with_devices(1)
        .fail_set_status(Errno::EBUSY, 6);
    let policy = TransientPolicy {
        interval: Duration::from_millis(1),
        grace: Duration::from_millis(1),
        ..TransientPolicy::default()
    };
    let allocator = LoopAllocator::new(hal.clone(), AllocatorConfig::new(1)).with_policy(policy);
    let image = NamedTempFile::new().unwrap();

    allocator
        .attach(image.as_file(), &LoopParams::read_only())
        .expect("EBUSY clears after the flush");
    let set_status = hal
        .operations()
        .iter()
        .filter(|op| matches!(op, Operation::SetStatus { .. }))
        .count();
    assert_eq!(set_status, 7);
}

#[test]
fn flush_hits_the_block_device_holding_the_image() {
    let image = NamedTempFile::new().unwrap();
    let st = fstat(image.as_file().as_raw_fd()).unwrap();
    let key = format!("{}:{}", major(st.st_dev as u64), minor(st.st_dev as u64));
    let mountinfo = format!("29 1 {} / / rw,relatime shared:1 - ext4 /dev/vdz1 rw\n", key);

    let hal = FakeHal::new()
        .with_devices(1)
        .with_mountinfo(mountinfo)
        .with_block_device("/dev/vdz1")
        .fail_set_status(Errno::EAGAIN, 6);
    let policy = TransientPolicy {
        interval: Duration::from_millis(1),
        grace: Duration::from_millis(1),
        ..TransientPolicy::default()
    };
    let allocator = LoopAllocator::new(hal.clone(), AllocatorConfig::new(1)).with_policy(policy);

    allocator
        .attach(image.as_file(), &LoopParams::read_only())
        .unwrap();
    assert!(hal.has_operation(|op| *op
        == Operation::FlushBuffers {
            device: "/dev/vdz1".into()
        }));
    assert!(!hal.has_operation(|op| *op == Operation::Sync));
}
