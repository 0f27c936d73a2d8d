//! HAL trait definitions and implementations.
//!
//! This module defines one trait per kernel concern the allocator touches and
//! provides both real (LinuxHal) and fake (FakeHal) implementations.

pub mod cache_ops;
pub mod fake_hal;
pub mod guards;
pub mod ioctl_ops;
pub mod linux_hal;
pub mod lock_ops;
pub mod node_ops;

pub use cache_ops::CacheOps;
pub use fake_hal::{FakeHal, Operation};
pub use guards::LockGuard;
pub use ioctl_ops::{LoopIoctlOps, OpenMode};
pub use linux_hal::LinuxHal;
pub use lock_ops::{LockOps, LockToken};
pub use node_ops::NodeOps;

/// Complete HAL combining all loop-device operation traits.
pub trait LoopHal: LoopIoctlOps + NodeOps + LockOps + CacheOps + Send + Sync {}

/// Automatically implement LoopHal for any type implementing all required traits.
impl<T> LoopHal for T where T: LoopIoctlOps + NodeOps + LockOps + CacheOps + Send + Sync {}
