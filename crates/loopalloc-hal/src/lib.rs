//! System seam for the loop-device allocator.
//!
//! Every kernel interaction the allocator performs goes through the traits in
//! [`hal`]. `LinuxHal` issues the real syscalls; `FakeHal` models the loop
//! driver in memory and records every call so tests can run without root.

pub mod hal;
pub mod path;
pub mod procfs;
pub mod sys;

pub use hal::*;
pub use sys::{LoopFlags, LoopInfo64};
