//! Handling of `EAGAIN`/`EBUSY` from `LOOP_SET_STATUS64`.
//!
//! The kernel invalidates the page cache of the backing file when the
//! offset/size window changes and bails out with `EAGAIN` if it finds dirty
//! pages. Waiting usually clears it; flushing the block device that holds the
//! image clears it for good.

use loopalloc_hal::procfs::mountinfo;
use loopalloc_hal::CacheOps;
use nix::errno::Errno;
use nix::sys::stat::{major, minor};
use std::path::Path;
use std::time::Duration;

/// Retry schedule for transient `LOOP_SET_STATUS64` failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransientPolicy {
    /// Sleep between the early retries.
    pub interval: Duration,
    /// Retry index at which the backing cache is flushed instead of sleeping.
    pub flush_at: u32,
    /// Sleep for the retries after the flush.
    pub grace: Duration,
    /// Retry index at which the attempt is abandoned.
    pub give_up_at: u32,
}

impl Default for TransientPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            flush_at: 5,
            grace: Duration::from_secs(1),
            give_up_at: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Sleep(Duration),
    FlushCache,
    GiveUp,
}

impl TransientPolicy {
    /// What to do before re-issuing the ioctl for the `retry`-th time (0-based).
    pub fn action(&self, retry: u32) -> RetryAction {
        if retry >= self.give_up_at {
            RetryAction::GiveUp
        } else if retry < self.flush_at {
            RetryAction::Sleep(self.interval)
        } else if retry == self.flush_at {
            RetryAction::FlushCache
        } else {
            RetryAction::Sleep(self.grace)
        }
    }

    /// Upper bound on time spent sleeping for one device.
    pub fn max_delay(&self) -> Duration {
        (0..self.give_up_at)
            .map(|retry| match self.action(retry) {
                RetryAction::Sleep(delay) => delay,
                RetryAction::FlushCache | RetryAction::GiveUp => Duration::ZERO,
            })
            .sum()
    }
}

pub fn is_transient(errno: Errno) -> bool {
    matches!(errno, Errno::EAGAIN | Errno::EBUSY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// `BLKFLSBUF` succeeded on this many block devices.
    BlockDevices(usize),
    /// No block device backs the image; a global `sync()` was issued.
    Synced,
}

/// Flush the page cache of whatever block device holds a file on `image_dev`.
pub fn flush_backing_cache<H: CacheOps + ?Sized>(hal: &H, image_dev: u64) -> FlushOutcome {
    let key = format!("{}:{}", major(image_dev), minor(image_dev));
    let mut flushed = 0;

    match hal.read_mountinfo() {
        Ok(content) => {
            for source in mountinfo::sources_for_device(&content, &key) {
                let device = Path::new(&source);
                if !hal.is_block_device(device) {
                    continue;
                }
                match hal.flush_block_device(device) {
                    Ok(()) => {
                        log::debug!("flushed buffers of {}", source);
                        flushed += 1;
                    }
                    Err(errno) => log::debug!("BLKFLSBUF on {} failed: {}", source, errno),
                }
            }
        }
        Err(err) => log::debug!("cannot read mountinfo: {}", err),
    }

    if flushed > 0 {
        return FlushOutcome::BlockDevices(flushed);
    }
    log::debug!("no block device found for {}, syncing", key);
    hal.sync_all();
    FlushOutcome::Synced
}
