//! Device node provisioning (`/dev/loop-control`, mknod).

use std::os::fd::{BorrowedFd, OwnedFd};

/// Operations that make `/dev/loopN` exist.
pub trait NodeOps {
    /// Whether `/dev/loopN` exists. A node that is not a block device is
    /// reported as `ENOTBLK`.
    fn loop_node_exists(&self, number: u32) -> nix::Result<bool>;

    /// Open `/dev/loop-control` read/write.
    fn open_control(&self) -> nix::Result<OwnedFd>;

    /// `LOOP_CTL_ADD`. Returns the device number the kernel allocated.
    fn ctl_add(&self, control: BorrowedFd<'_>, number: u32) -> nix::Result<u32>;

    /// `LOOP_CTL_REMOVE`. `EBUSY` while the device is bound.
    fn ctl_remove(&self, control: BorrowedFd<'_>, number: u32) -> nix::Result<u32>;

    /// `mknod("/dev/loopN", S_IFBLK | 0660, makedev(7, N))`.
    fn mknod_loop(&self, number: u32) -> nix::Result<()>;
}
