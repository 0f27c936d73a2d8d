//! Fake HAL implementation for testing.
//!
//! This implementation models the loop driver in memory and records every
//! operation, allowing CI-safe testing without root privileges or a real
//! `/dev`. Backing images are real files: `set_fd` fingerprints them with
//! `fstat` exactly like the kernel does.

use super::{CacheOps, LockOps, LockToken, LoopIoctlOps, NodeOps, OpenMode};
use crate::path::loop_number_from_path;
use crate::LoopInfo64;
use nix::errno::Errno;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs::File;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Open { number: u32, mode: OpenMode },
    SetFd { number: u32 },
    ClearFd { number: u32 },
    SetStatus { number: u32 },
    GetStatus { number: u32 },
    SetCloexec { number: u32 },
    OpenControl,
    CtlAdd { number: u32 },
    CtlRemove { number: u32 },
    Mknod { number: u32 },
    Lock { path: PathBuf },
    Unlock { path: PathBuf },
    FlushBuffers { device: PathBuf },
    Sync,
}

#[derive(Debug, Clone, Default)]
struct FakeDevice {
    /// `/dev/loopN` exists.
    node: bool,
    /// The kernel has a device behind the minor.
    registered: bool,
    binding: Option<LoopInfo64>,
}

/// Shared state for FakeHal operations.
#[derive(Debug, Default)]
struct FakeHalState {
    operations: Vec<Operation>,
    devices: BTreeMap<u32, FakeDevice>,
    /// Loop descriptors handed out by `open_device`, keyed by raw fd.
    open_fds: HashMap<RawFd, u32>,
    /// Errno returned when opening an existing node.
    open_errors: HashMap<u32, Errno>,
    control_absent: bool,
    /// Container case: LOOP_CTL_ADD succeeds but no node shows up.
    hide_added_nodes: bool,
    set_status_errors: VecDeque<Errno>,
    set_status_always: Option<Errno>,
    set_fd_always: Option<Errno>,
    cloexec_error: Option<Errno>,
    mountinfo: String,
    block_devices: HashSet<PathBuf>,
}

impl FakeHalState {
    fn device_for(&self, fd: BorrowedFd<'_>) -> nix::Result<u32> {
        self.open_fds
            .get(&fd.as_raw_fd())
            .copied()
            .ok_or(Errno::EBADF)
    }

    fn device_mut(&mut self, number: u32) -> &mut FakeDevice {
        self.devices.entry(number).or_default()
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<FakeHalState>,
    locks: Mutex<HashSet<PathBuf>>,
    lock_released: Condvar,
}

/// Fake HAL implementation that simulates the loop driver.
///
/// Clones share state, so a test can keep one handle for assertions while the
/// allocator owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeHal {
    inner: Arc<Inner>,
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn io_errno(err: std::io::Error) -> Errno {
    Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO))
}

/// A real descriptor standing in for a device node.
fn placeholder_fd() -> nix::Result<OwnedFd> {
    File::open("/dev/null").map(OwnedFd::from).map_err(io_errno)
}

impl FakeHal {
    /// Empty `/dev` with a working `/dev/loop-control`.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeHalState> {
        lock_ignoring_poison(&self.inner.state)
    }

    fn record_operation(&self, op: Operation) {
        self.state().operations.push(op);
    }

    /// Pre-create `/dev/loop0` .. `/dev/loop{count-1}`, registered and unbound.
    pub fn with_devices(self, count: u32) -> Self {
        {
            let mut state = self.state();
            for number in 0..count {
                let device = state.device_mut(number);
                device.node = true;
                device.registered = true;
            }
        }
        self
    }

    /// A node that exists without a kernel device behind it (`ENXIO` on open).
    pub fn with_unregistered_node(self, number: u32) -> Self {
        {
            let mut state = self.state();
            let device = state.device_mut(number);
            device.node = true;
            device.registered = false;
        }
        self
    }

    /// Bind `number` to an image owned by someone else.
    pub fn with_binding(self, number: u32, info: LoopInfo64) -> Self {
        {
            let mut state = self.state();
            let device = state.device_mut(number);
            device.node = true;
            device.registered = true;
            device.binding = Some(LoopInfo64 {
                lo_number: number,
                ..info
            });
        }
        self
    }

    /// Opening `/dev/loop{number}` fails with `errno` even though the node exists.
    pub fn fail_open(self, number: u32, errno: Errno) -> Self {
        self.state().open_errors.insert(number, errno);
        self
    }

    pub fn without_loop_control(self) -> Self {
        self.state().control_absent = true;
        self
    }

    pub fn hide_added_nodes(self) -> Self {
        self.state().hide_added_nodes = true;
        self
    }

    /// Fail the next `times` `LOOP_SET_STATUS64` calls with `errno`.
    pub fn fail_set_status(self, errno: Errno, times: usize) -> Self {
        self.state()
            .set_status_errors
            .extend(std::iter::repeat(errno).take(times));
        self
    }

    pub fn fail_set_status_always(self, errno: Errno) -> Self {
        self.state().set_status_always = Some(errno);
        self
    }

    pub fn fail_set_fd_always(self, errno: Errno) -> Self {
        self.state().set_fd_always = Some(errno);
        self
    }

    pub fn fail_cloexec(self, errno: Errno) -> Self {
        self.state().cloexec_error = Some(errno);
        self
    }

    pub fn with_mountinfo(self, content: impl Into<String>) -> Self {
        self.state().mountinfo = content.into();
        self
    }

    pub fn with_block_device(self, path: impl Into<PathBuf>) -> Self {
        self.state().block_devices.insert(path.into());
        self
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.state().operations.clone()
    }

    /// Check if a specific operation was recorded.
    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.state().operations.iter().any(check)
    }

    /// Index of the first recorded operation equal to `op`.
    pub fn position(&self, op: &Operation) -> Option<usize> {
        self.state().operations.iter().position(|o| o == op)
    }

    pub fn binding(&self, number: u32) -> Option<LoopInfo64> {
        self.state()
            .devices
            .get(&number)
            .and_then(|device| device.binding)
    }

    pub fn node_exists(&self, number: u32) -> bool {
        self.state()
            .devices
            .get(&number)
            .is_some_and(|device| device.node)
    }

    pub fn is_registered(&self, number: u32) -> bool {
        self.state()
            .devices
            .get(&number)
            .is_some_and(|device| device.registered)
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        lock_ignoring_poison(&self.inner.locks).contains(&lock_key(path))
    }
}

/// Descriptors reopened through `/proc/self/fd` lock the file they point at.
fn lock_key(path: &Path) -> PathBuf {
    if path.starts_with("/proc/self/fd") {
        if let Ok(target) = std::fs::canonicalize(path) {
            return target;
        }
    }
    path.to_path_buf()
}

impl LoopIoctlOps for FakeHal {
    fn open_device(&self, path: &Path, mode: OpenMode) -> nix::Result<OwnedFd> {
        let number = loop_number_from_path(path).ok_or(Errno::ENOENT)?;
        let mut state = self.state();
        state.operations.push(Operation::Open { number, mode });
        let device = state.devices.get(&number).cloned().unwrap_or_default();
        if !device.node {
            return Err(Errno::ENOENT);
        }
        if !device.registered {
            return Err(Errno::ENXIO);
        }
        if let Some(errno) = state.open_errors.get(&number) {
            return Err(*errno);
        }
        let fd = placeholder_fd()?;
        state.open_fds.insert(fd.as_raw_fd(), number);
        Ok(fd)
    }

    fn set_fd(&self, loop_fd: BorrowedFd<'_>, image: BorrowedFd<'_>) -> nix::Result<()> {
        let mut state = self.state();
        let number = state.device_for(loop_fd)?;
        state.operations.push(Operation::SetFd { number });
        if let Some(errno) = state.set_fd_always {
            return Err(errno);
        }
        if state.device_mut(number).binding.is_some() {
            return Err(Errno::EBUSY);
        }
        let st = nix::sys::stat::fstat(image.as_raw_fd())?;
        state.device_mut(number).binding = Some(LoopInfo64 {
            lo_device: st.st_dev as u64,
            lo_inode: st.st_ino as u64,
            lo_number: number,
            ..LoopInfo64::default()
        });
        Ok(())
    }

    fn clear_fd(&self, loop_fd: BorrowedFd<'_>) -> nix::Result<()> {
        let mut state = self.state();
        let number = state.device_for(loop_fd)?;
        state.operations.push(Operation::ClearFd { number });
        match state.device_mut(number).binding.take() {
            Some(_) => Ok(()),
            None => Err(Errno::ENXIO),
        }
    }

    fn set_status(&self, loop_fd: BorrowedFd<'_>, info: &LoopInfo64) -> nix::Result<()> {
        let mut state = self.state();
        let number = state.device_for(loop_fd)?;
        state.operations.push(Operation::SetStatus { number });
        if let Some(errno) = state.set_status_errors.pop_front() {
            return Err(errno);
        }
        if let Some(errno) = state.set_status_always {
            return Err(errno);
        }
        let binding = state
            .device_mut(number)
            .binding
            .as_mut()
            .ok_or(Errno::ENXIO)?;
        binding.lo_offset = info.lo_offset;
        binding.lo_sizelimit = info.lo_sizelimit;
        binding.lo_flags = info.lo_flags;
        binding.lo_encrypt_type = info.lo_encrypt_type;
        binding.lo_encrypt_key_size = info.lo_encrypt_key_size;
        binding.lo_encrypt_key = info.lo_encrypt_key;
        binding.lo_file_name = info.lo_file_name;
        binding.lo_crypt_name = info.lo_crypt_name;
        binding.lo_init = info.lo_init;
        Ok(())
    }

    fn get_status(&self, loop_fd: BorrowedFd<'_>) -> nix::Result<LoopInfo64> {
        let mut state = self.state();
        let number = state.device_for(loop_fd)?;
        state.operations.push(Operation::GetStatus { number });
        state.device_mut(number).binding.ok_or(Errno::ENXIO)
    }

    fn set_cloexec(&self, fd: BorrowedFd<'_>) -> nix::Result<()> {
        let mut state = self.state();
        let number = state.device_for(fd)?;
        state.operations.push(Operation::SetCloexec { number });
        match state.cloexec_error {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }
}

impl NodeOps for FakeHal {
    fn loop_node_exists(&self, number: u32) -> nix::Result<bool> {
        Ok(self.node_exists(number))
    }

    fn open_control(&self) -> nix::Result<OwnedFd> {
        let absent = {
            let mut state = self.state();
            state.operations.push(Operation::OpenControl);
            state.control_absent
        };
        if absent {
            return Err(Errno::ENOENT);
        }
        placeholder_fd()
    }

    fn ctl_add(&self, _control: BorrowedFd<'_>, number: u32) -> nix::Result<u32> {
        let mut state = self.state();
        state.operations.push(Operation::CtlAdd { number });
        let hide = state.hide_added_nodes;
        let device = state.device_mut(number);
        if device.registered {
            return Err(Errno::EEXIST);
        }
        device.registered = true;
        if !hide {
            device.node = true;
        }
        Ok(number)
    }

    fn ctl_remove(&self, _control: BorrowedFd<'_>, number: u32) -> nix::Result<u32> {
        let mut state = self.state();
        state.operations.push(Operation::CtlRemove { number });
        let hide = state.hide_added_nodes;
        let device = state.device_mut(number);
        if device.binding.is_some() {
            return Err(Errno::EBUSY);
        }
        if !device.registered {
            return Err(Errno::ENODEV);
        }
        device.registered = false;
        if !hide {
            device.node = false;
        }
        Ok(number)
    }

    fn mknod_loop(&self, number: u32) -> nix::Result<()> {
        let mut state = self.state();
        state.operations.push(Operation::Mknod { number });
        let device = state.device_mut(number);
        if device.node {
            return Err(Errno::EEXIST);
        }
        // Opening an unknown minor makes the loop driver probe it.
        device.node = true;
        device.registered = true;
        Ok(())
    }
}

impl LockOps for FakeHal {
    fn lock_exclusive(&self, path: &Path) -> nix::Result<LockToken> {
        let key = lock_key(path);
        {
            let mut locks = lock_ignoring_poison(&self.inner.locks);
            while locks.contains(&key) {
                locks = match self.inner.lock_released.wait(locks) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
            locks.insert(key.clone());
        }
        self.record_operation(Operation::Lock { path: key.clone() });
        Ok(LockToken::tracked(key))
    }

    fn unlock(&self, token: LockToken) -> nix::Result<()> {
        let (path, _) = token.into_parts();
        let removed = lock_ignoring_poison(&self.inner.locks).remove(&path);
        self.inner.lock_released.notify_all();
        if !removed {
            return Err(Errno::ENOLCK);
        }
        self.record_operation(Operation::Unlock { path });
        Ok(())
    }
}

impl CacheOps for FakeHal {
    fn read_mountinfo(&self) -> std::io::Result<String> {
        Ok(self.state().mountinfo.clone())
    }

    fn is_block_device(&self, path: &Path) -> bool {
        self.state().block_devices.contains(path)
    }

    fn flush_block_device(&self, path: &Path) -> nix::Result<()> {
        self.record_operation(Operation::FlushBuffers {
            device: path.to_path_buf(),
        });
        Ok(())
    }

    fn sync_all(&self) {
        self.record_operation(Operation::Sync);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::loop_device_path;
    use std::os::fd::AsFd;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn open(hal: &FakeHal, number: u32) -> nix::Result<OwnedFd> {
        hal.open_device(&loop_device_path(number), OpenMode::ReadOnly)
    }

    #[test]
    fn open_distinguishes_missing_and_unregistered() {
        let hal = FakeHal::new().with_unregistered_node(1);
        assert_eq!(open(&hal, 0).unwrap_err(), Errno::ENOENT);
        assert_eq!(open(&hal, 1).unwrap_err(), Errno::ENXIO);
    }

    #[test]
    fn set_fd_binds_image_identity_and_rejects_second_image() {
        let hal = FakeHal::new().with_devices(1);
        let image = NamedTempFile::new().unwrap();
        let st = nix::sys::stat::fstat(image.as_file().as_raw_fd()).unwrap();

        let fd = open(&hal, 0).unwrap();
        hal.set_fd(fd.as_fd(), image.as_file().as_fd()).unwrap();
        let info = hal.get_status(fd.as_fd()).unwrap();
        assert_eq!(info.lo_inode, st.st_ino as u64);
        assert_eq!(info.lo_device, st.st_dev as u64);

        let other = open(&hal, 0).unwrap();
        assert_eq!(
            hal.set_fd(other.as_fd(), image.as_file().as_fd()).unwrap_err(),
            Errno::EBUSY
        );
    }

    #[test]
    fn get_status_on_unbound_device_is_enxio() {
        let hal = FakeHal::new().with_devices(1);
        let fd = open(&hal, 0).unwrap();
        assert_eq!(hal.get_status(fd.as_fd()).unwrap_err(), Errno::ENXIO);
    }

    #[test]
    fn scripted_set_status_failures_run_out() {
        let hal = FakeHal::new()
            .with_devices(1)
            .fail_set_status(Errno::EAGAIN, 1);
        let image = NamedTempFile::new().unwrap();
        let fd = open(&hal, 0).unwrap();
        hal.set_fd(fd.as_fd(), image.as_file().as_fd()).unwrap();
        let info = LoopInfo64 {
            lo_offset: 512,
            ..Default::default()
        };
        assert_eq!(hal.set_status(fd.as_fd(), &info).unwrap_err(), Errno::EAGAIN);
        hal.set_status(fd.as_fd(), &info).unwrap();
        assert_eq!(hal.binding(0).unwrap().lo_offset, 512);
    }

    #[test]
    fn ctl_add_creates_node_unless_hidden() {
        let hal = FakeHal::new();
        let control = hal.open_control().unwrap();
        assert_eq!(hal.ctl_add(control.as_fd(), 3).unwrap(), 3);
        assert!(hal.node_exists(3));
        assert_eq!(hal.ctl_add(control.as_fd(), 3).unwrap_err(), Errno::EEXIST);

        let hidden = FakeHal::new().hide_added_nodes();
        let control = hidden.open_control().unwrap();
        hidden.ctl_add(control.as_fd(), 0).unwrap();
        assert!(hidden.is_registered(0));
        assert!(!hidden.node_exists(0));
    }

    #[test]
    fn ctl_remove_refuses_bound_device() {
        let hal = FakeHal::new().with_binding(2, LoopInfo64 {
            lo_inode: 42,
            ..Default::default()
        });
        let control = hal.open_control().unwrap();
        assert_eq!(hal.ctl_remove(control.as_fd(), 2).unwrap_err(), Errno::EBUSY);
    }

    #[test]
    fn missing_loop_control() {
        let hal = FakeHal::new().without_loop_control();
        assert_eq!(hal.open_control().unwrap_err(), Errno::ENOENT);
        hal.mknod_loop(0).unwrap();
        assert_eq!(hal.mknod_loop(0).unwrap_err(), Errno::EEXIST);
        assert!(open(&hal, 0).is_ok());
    }

    #[test]
    fn exclusive_lock_blocks_until_released() {
        let hal = FakeHal::new();
        let path = Path::new("/dev/loop0");
        let token = hal.lock_exclusive(path).unwrap();

        let peer = hal.clone();
        let waiter = std::thread::spawn(move || {
            let token = peer.lock_exclusive(Path::new("/dev/loop0")).unwrap();
            peer.unlock(token).unwrap();
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        hal.unlock(token).unwrap();
        waiter.join().unwrap();
        assert!(!hal.is_locked(path));
    }

    #[test]
    fn double_unlock_is_reported() {
        let hal = FakeHal::new();
        let token = hal.lock_exclusive(Path::new("/dev/loop0")).unwrap();
        hal.unlock(token).unwrap();
        let stale = LockToken::tracked("/dev/loop0");
        assert_eq!(hal.unlock(stale).unwrap_err(), Errno::ENOLCK);
    }
}
