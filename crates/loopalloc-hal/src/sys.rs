//! Kernel ABI of the loop driver (`linux/loop.h`).

pub const LOOP_SET_FD: u32 = 0x4C00;
pub const LOOP_CLR_FD: u32 = 0x4C01;
pub const LOOP_SET_STATUS64: u32 = 0x4C04;
pub const LOOP_GET_STATUS64: u32 = 0x4C05;
pub const LOOP_CTL_ADD: u32 = 0x4C80;
pub const LOOP_CTL_REMOVE: u32 = 0x4C81;

pub const LO_NAME_SIZE: usize = 64;
pub const LO_KEY_SIZE: usize = 32;

bitflags::bitflags! {
    /// `lo_flags` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LoopFlags: u32 {
        const READ_ONLY = 1;
        const AUTO_CLEAR = 4;
        const PART_SCAN = 8;
        const DIRECT_IO = 16;
    }
}

/// Values of `lo_encrypt_type`. Carried through untouched.
pub mod crypt {
    pub const NONE: u32 = 0;
    pub const XOR: u32 = 1;
    pub const DES: u32 = 2;
    pub const FISH2: u32 = 3;
    pub const BLOW: u32 = 4;
    pub const CAST128: u32 = 5;
    pub const IDEA: u32 = 6;
    pub const DUMMY: u32 = 9;
    pub const SKIPJACK: u32 = 10;
    pub const CRYPTOAPI: u32 = 18;
}

/// `struct loop_info64`, passed verbatim to `LOOP_SET_STATUS64` / `LOOP_GET_STATUS64`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopInfo64 {
    pub lo_device: u64,
    pub lo_inode: u64,
    pub lo_rdevice: u64,
    pub lo_offset: u64,
    pub lo_sizelimit: u64,
    pub lo_number: u32,
    pub lo_encrypt_type: u32,
    pub lo_encrypt_key_size: u32,
    pub lo_flags: u32,
    pub lo_file_name: [u8; LO_NAME_SIZE],
    pub lo_crypt_name: [u8; LO_NAME_SIZE],
    pub lo_encrypt_key: [u8; LO_KEY_SIZE],
    pub lo_init: [u64; 2],
}

// Default is only derived for arrays up to 32 elements.
impl Default for LoopInfo64 {
    fn default() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

impl LoopInfo64 {
    pub fn flags(&self) -> LoopFlags {
        LoopFlags::from_bits_retain(self.lo_flags)
    }

    /// The kernel reports inode 0 for a device with nothing bound.
    pub fn is_bound(&self) -> bool {
        self.lo_inode != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn loop_info64_matches_kernel_layout() {
        assert_eq!(size_of::<LoopInfo64>(), 232);
        assert_eq!(align_of::<LoopInfo64>(), 8);
        assert_eq!(offset_of!(LoopInfo64, lo_number), 40);
        assert_eq!(offset_of!(LoopInfo64, lo_flags), 52);
        assert_eq!(offset_of!(LoopInfo64, lo_file_name), 56);
        assert_eq!(offset_of!(LoopInfo64, lo_encrypt_key), 184);
        assert_eq!(offset_of!(LoopInfo64, lo_init), 216);
    }

    #[test]
    fn unknown_flag_bits_survive() {
        let info = LoopInfo64 {
            lo_flags: LoopFlags::READ_ONLY.bits() | 0x200,
            ..Default::default()
        };
        assert!(info.flags().contains(LoopFlags::READ_ONLY));
        assert_eq!(info.flags().bits(), 0x201);
    }

    #[test]
    fn default_info_is_unbound() {
        assert!(!LoopInfo64::default().is_bound());
    }
}
