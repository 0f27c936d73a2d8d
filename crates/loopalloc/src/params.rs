//! Caller parameters and kernel-reported status for a loop binding.

use loopalloc_hal::sys::{LO_KEY_SIZE, LO_NAME_SIZE};
use loopalloc_hal::{LoopFlags, LoopInfo64};
use nix::sys::stat::FileStat;

/// Configuration for a binding. Encryption fields and labels are passed to the
/// kernel untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopParams {
    pub offset: u64,
    /// Zero means "up to the end of the file".
    pub size_limit: u64,
    pub flags: LoopFlags,
    pub encrypt_type: u32,
    pub encrypt_key_size: u32,
    pub encrypt_key: [u8; LO_KEY_SIZE],
    pub file_name: [u8; LO_NAME_SIZE],
    pub crypt_name: [u8; LO_NAME_SIZE],
}

impl Default for LoopParams {
    fn default() -> Self {
        Self {
            offset: 0,
            size_limit: 0,
            flags: LoopFlags::empty(),
            encrypt_type: 0,
            encrypt_key_size: 0,
            encrypt_key: [0; LO_KEY_SIZE],
            file_name: [0; LO_NAME_SIZE],
            crypt_name: [0; LO_NAME_SIZE],
        }
    }
}

impl LoopParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only() -> Self {
        Self::default().with_flags(LoopFlags::READ_ONLY)
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_size_limit(mut self, size_limit: u64) -> Self {
        self.size_limit = size_limit;
        self
    }

    /// Adds `flags` to the ones already set.
    pub fn with_flags(mut self, flags: LoopFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_file_name(mut self, name: &str) -> Self {
        copy_label(&mut self.file_name, name);
        self
    }

    pub fn with_crypt_name(mut self, name: &str) -> Self {
        copy_label(&mut self.crypt_name, name);
        self
    }

    /// Key bytes beyond the kernel's 32-byte field are dropped.
    pub fn with_encryption(mut self, encrypt_type: u32, key: &[u8]) -> Self {
        let len = key.len().min(LO_KEY_SIZE);
        self.encrypt_key = [0; LO_KEY_SIZE];
        self.encrypt_key[..len].copy_from_slice(&key[..len]);
        self.encrypt_type = encrypt_type;
        self.encrypt_key_size = len as u32;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(LoopFlags::READ_ONLY)
    }

    pub fn to_info(&self) -> LoopInfo64 {
        LoopInfo64 {
            lo_offset: self.offset,
            lo_sizelimit: self.size_limit,
            lo_flags: self.flags.bits(),
            lo_encrypt_type: self.encrypt_type,
            lo_encrypt_key_size: self.encrypt_key_size,
            lo_encrypt_key: self.encrypt_key,
            lo_file_name: self.file_name,
            lo_crypt_name: self.crypt_name,
            ..LoopInfo64::default()
        }
    }
}

/// Copies `src` into a NUL-terminated fixed-size label, truncating if needed.
fn copy_label(dst: &mut [u8; LO_NAME_SIZE], src: &str) {
    let len = src.len().min(LO_NAME_SIZE - 1);
    dst.fill(0);
    dst[..len].copy_from_slice(&src.as_bytes()[..len]);
}

fn label_lossy(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Binding as reported by `LOOP_GET_STATUS64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopStatus {
    pub device: u64,
    pub inode: u64,
    pub rdevice: u64,
    pub offset: u64,
    pub size_limit: u64,
    pub number: u32,
    pub flags: LoopFlags,
    pub encrypt_type: u32,
    pub encrypt_key_size: u32,
    pub file_name: [u8; LO_NAME_SIZE],
    pub crypt_name: [u8; LO_NAME_SIZE],
}

impl LoopStatus {
    /// Status of a device with nothing bound (`inode == 0`).
    pub fn unbound() -> Self {
        LoopInfo64::default().into()
    }

    pub fn is_bound(&self) -> bool {
        self.inode != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(LoopFlags::READ_ONLY)
    }

    pub fn file_name_lossy(&self) -> String {
        label_lossy(&self.file_name)
    }

    pub fn crypt_name_lossy(&self) -> String {
        label_lossy(&self.crypt_name)
    }
}

impl From<LoopInfo64> for LoopStatus {
    fn from(info: LoopInfo64) -> Self {
        Self {
            device: info.lo_device,
            inode: info.lo_inode,
            rdevice: info.lo_rdevice,
            offset: info.lo_offset,
            size_limit: info.lo_sizelimit,
            number: info.lo_number,
            flags: info.flags(),
            encrypt_type: info.lo_encrypt_type,
            encrypt_key_size: info.lo_encrypt_key_size,
            file_name: info.lo_file_name,
            crypt_name: info.lo_crypt_name,
        }
    }
}

/// What two bindings must agree on to be interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageFingerprint {
    pub inode: u64,
    pub device: u64,
    pub offset: u64,
    pub size_limit: u64,
    pub read_only: bool,
}

impl ImageFingerprint {
    pub fn new(image: &FileStat, params: &LoopParams) -> Self {
        Self {
            // st_dev is 32 bits wide on some targets
            inode: image.st_ino as u64,
            device: image.st_dev as u64,
            offset: params.offset,
            size_limit: params.size_limit,
            read_only: params.is_read_only(),
        }
    }

    pub fn matches(&self, status: &LoopStatus) -> bool {
        status.inode == self.inode
            && status.device == self.device
            && status.offset == self.offset
            && status.size_limit == self.size_limit
            && status.is_read_only() == self.read_only
    }
}
