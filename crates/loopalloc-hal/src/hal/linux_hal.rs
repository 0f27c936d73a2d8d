//! Linux HAL implementation using real system calls.

use super::{CacheOps, LockOps, LockToken, LoopIoctlOps, NodeOps, OpenMode};
use crate::path::{loop_device_path, LOOP_CONTROL, LOOP_MAJOR};
use crate::LoopInfo64;
use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, Flock, FlockArg, OFlag};
use libc::c_int;
use nix::sys::stat::{makedev, mknod, stat, Mode, SFlag};
use std::fs::{self, File};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;

// These are old-style ioctls, thus *_bad.
mod ioctl {
    use crate::sys::*;

    nix::ioctl_write_int_bad!(loop_set_fd, LOOP_SET_FD);
    nix::ioctl_none_bad!(loop_clr_fd, LOOP_CLR_FD);
    nix::ioctl_write_ptr_bad!(loop_set_status64, LOOP_SET_STATUS64, LoopInfo64);
    nix::ioctl_read_bad!(loop_get_status64, LOOP_GET_STATUS64, LoopInfo64);
    nix::ioctl_write_int_bad!(loop_ctl_add, LOOP_CTL_ADD);
    nix::ioctl_write_int_bad!(loop_ctl_remove, LOOP_CTL_REMOVE);
    nix::ioctl_none!(blk_flsbuf, 0x12, 97);
}

/// Real HAL implementation for Linux systems.
#[derive(Debug, Clone, Default)]
pub struct LinuxHal;

impl LinuxHal {
    pub fn new() -> Self {
        Self
    }
}

fn open_owned(path: &Path, flags: OFlag) -> nix::Result<OwnedFd> {
    let fd = open(path, flags, Mode::empty())?;
    // SAFETY: `open` just returned this descriptor and nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn is_block(mode: libc::mode_t) -> bool {
    mode & SFlag::S_IFMT.bits() == SFlag::S_IFBLK.bits()
}

impl LoopIoctlOps for LinuxHal {
    fn open_device(&self, path: &Path, mode: OpenMode) -> nix::Result<OwnedFd> {
        open_owned(path, mode.oflag())
    }

    fn set_fd(&self, loop_fd: BorrowedFd<'_>, image: BorrowedFd<'_>) -> nix::Result<()> {
        // SAFETY: both descriptors are borrowed for the duration of the call.
        unsafe { ioctl::loop_set_fd(loop_fd.as_raw_fd(), image.as_raw_fd()) }?;
        Ok(())
    }

    fn clear_fd(&self, loop_fd: BorrowedFd<'_>) -> nix::Result<()> {
        // SAFETY: this ioctl only changes kernel state of the loop device.
        unsafe { ioctl::loop_clr_fd(loop_fd.as_raw_fd()) }?;
        Ok(())
    }

    fn set_status(&self, loop_fd: BorrowedFd<'_>, info: &LoopInfo64) -> nix::Result<()> {
        // SAFETY: `info` is a valid `loop_info64` that outlives the call.
        unsafe { ioctl::loop_set_status64(loop_fd.as_raw_fd(), info) }?;
        Ok(())
    }

    fn get_status(&self, loop_fd: BorrowedFd<'_>) -> nix::Result<LoopInfo64> {
        let mut info = LoopInfo64::default();
        // SAFETY: the kernel writes at most `size_of::<LoopInfo64>()` bytes into `info`.
        unsafe { ioctl::loop_get_status64(loop_fd.as_raw_fd(), &mut info) }?;
        Ok(info)
    }

    fn set_cloexec(&self, fd: BorrowedFd<'_>) -> nix::Result<()> {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        Ok(())
    }
}

impl NodeOps for LinuxHal {
    fn loop_node_exists(&self, number: u32) -> nix::Result<bool> {
        match stat(loop_device_path(number).as_path()) {
            Ok(st) if is_block(st.st_mode) => Ok(true),
            Ok(_) => Err(Errno::ENOTBLK),
            Err(Errno::ENOENT) => Ok(false),
            Err(errno) => Err(errno),
        }
    }

    fn open_control(&self) -> nix::Result<OwnedFd> {
        open_owned(Path::new(LOOP_CONTROL), OFlag::O_RDWR)
    }

    fn ctl_add(&self, control: BorrowedFd<'_>, number: u32) -> nix::Result<u32> {
        // SAFETY: LOOP_CTL_ADD takes the device number by value.
        let added = unsafe { ioctl::loop_ctl_add(control.as_raw_fd(), number as c_int) }?;
        Ok(added as u32)
    }

    fn ctl_remove(&self, control: BorrowedFd<'_>, number: u32) -> nix::Result<u32> {
        // SAFETY: LOOP_CTL_REMOVE takes the device number by value.
        let removed = unsafe { ioctl::loop_ctl_remove(control.as_raw_fd(), number as c_int) }?;
        Ok(removed as u32)
    }

    fn mknod_loop(&self, number: u32) -> nix::Result<()> {
        mknod(
            loop_device_path(number).as_path(),
            SFlag::S_IFBLK,
            Mode::from_bits_truncate(0o660),
            makedev(LOOP_MAJOR, u64::from(number)),
        )
    }
}

impl LockOps for LinuxHal {
    fn lock_exclusive(&self, path: &Path) -> nix::Result<LockToken> {
        let file = File::from(open_owned(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC)?);
        let flock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| errno)?;
        Ok(LockToken::held(path, flock))
    }

    fn unlock(&self, token: LockToken) -> nix::Result<()> {
        let (_, flock) = token.into_parts();
        match flock {
            Some(flock) => flock.unlock().map(drop).map_err(|(_, errno)| errno),
            None => Ok(()),
        }
    }
}

impl CacheOps for LinuxHal {
    fn read_mountinfo(&self) -> std::io::Result<String> {
        fs::read_to_string("/proc/self/mountinfo")
    }

    fn is_block_device(&self, path: &Path) -> bool {
        stat(path).map(|st| is_block(st.st_mode)).unwrap_or(false)
    }

    fn flush_block_device(&self, path: &Path) -> nix::Result<()> {
        let device = open_owned(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC)?;
        // SAFETY: BLKFLSBUF takes no argument.
        unsafe { ioctl::blk_flsbuf(device.as_raw_fd()) }?;
        Ok(())
    }

    fn sync_all(&self) {
        nix::unistd::sync();
    }
}
