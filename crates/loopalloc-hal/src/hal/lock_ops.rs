//! Exclusive whole-file locks used to fence peers off a device.

use nix::fcntl::Flock;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Proof that an exclusive lock on `path` is held. Hand it back to
/// [`LockOps::unlock`] to release it.
pub struct LockToken {
    path: PathBuf,
    flock: Option<Flock<File>>,
}

impl LockToken {
    /// Token backed by a real `flock(2)` on an open file.
    pub fn held(path: impl Into<PathBuf>, flock: Flock<File>) -> Self {
        Self {
            path: path.into(),
            flock: Some(flock),
        }
    }

    /// Token for a lock tracked outside the kernel (fakes).
    pub fn tracked(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            flock: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_parts(self) -> (PathBuf, Option<Flock<File>>) {
        (self.path, self.flock)
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockToken")
            .field("path", &self.path)
            .field("flock", &self.flock.is_some())
            .finish()
    }
}

/// Exclusive-lock primitive over a path.
pub trait LockOps {
    /// Block until an exclusive lock on `path` is held.
    fn lock_exclusive(&self, path: &Path) -> nix::Result<LockToken>;

    /// Release a lock obtained from [`LockOps::lock_exclusive`].
    fn unlock(&self, token: LockToken) -> nix::Result<()>;
}
