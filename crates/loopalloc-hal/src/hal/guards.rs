use crate::{LockOps, LockToken};
use std::path::Path;

/// RAII guard that releases an exclusive lock when dropped.
#[derive(Debug)]
pub struct LockGuard<'a, H: LockOps + ?Sized> {
    hal: &'a H,
    token: Option<LockToken>,
}

impl<'a, H: LockOps + ?Sized> LockGuard<'a, H> {
    /// Block until `path` is locked exclusively.
    pub fn acquire(hal: &'a H, path: &Path) -> nix::Result<Self> {
        let token = hal.lock_exclusive(path)?;
        Ok(Self {
            hal,
            token: Some(token),
        })
    }

    /// Release the lock now. Later calls, and the eventual drop, do nothing.
    pub fn unlock(&mut self) -> nix::Result<()> {
        match self.token.take() {
            Some(token) => self.hal.unlock(token),
            None => Ok(()),
        }
    }

    pub fn is_held(&self) -> bool {
        self.token.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.token.as_ref().map(LockToken::path)
    }
}

impl<'a, H: LockOps + ?Sized> Drop for LockGuard<'a, H> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let path = token.path().to_path_buf();
        if let Err(err) = self.hal.unlock(token) {
            log::warn!("lock guard failed to release {}: {}", path.display(), err);
        }
    }
}
