//! Page-cache flushing for the filesystem that holds a backing image.

use std::path::Path;

pub trait CacheOps {
    /// Contents of `/proc/self/mountinfo`.
    fn read_mountinfo(&self) -> std::io::Result<String>;

    /// Whether `path` is a block device node.
    fn is_block_device(&self, path: &Path) -> bool;

    /// Open `path` and issue `BLKFLSBUF`.
    fn flush_block_device(&self, path: &Path) -> nix::Result<()>;

    /// Process-wide `sync()`.
    fn sync_all(&self);
}
