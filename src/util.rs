//! Utility helpers shared across the store.

use std::alloc;
use std::alloc::Layout;
use std::ops::Deref;
use std::ops::DerefMut;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Size of a disk sector.
pub const SECTOR_SIZE: usize = 512;

/// Returns the current timestamp since the Unix epoch.
pub fn get_timestamp() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock panic!")
}

/// Formats an epoch for use in a file name.
pub fn epoch_name(epoch: u32) -> String {
    format!("{epoch:08}")
}

/// Formats an OID for use in a file name.
pub fn oid_name(oid: u64) -> String {
    format!("{oid:016x}")
}

/// Parses a file name produced by [`oid_name`]. Returns `None` for `.`,
/// `..`, temporary files and anything else that is not exactly 16 hex
/// digits.
pub fn parse_oid_name(name: &str) -> Option<u64> {
    if name.len() != 16 {
        return None;
    }
    u64::from_str_radix(name, 16).ok().filter(|oid| *oid != 0)
}

/// A sector-aligned, heap-allocated byte buffer.
///
/// Object bodies go through files that may be opened with `O_DIRECT`, which
/// requires the user buffer to be sector aligned.
pub struct AlignedBuf {
    ptr: *mut u8,
    len: usize,
}

impl AlignedBuf {
    /// Allocates a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        assert!(len > 0);
        let layout = Layout::from_size_align(len, SECTOR_SIZE).unwrap();
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Self { ptr, len }
    }

    /// Allocates a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::zeroed(data.len());
        buf.copy_from_slice(data);
        buf
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, SECTOR_SIZE).unwrap();
        unsafe { alloc::dealloc(self.ptr, layout) };
    }
}

unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(epoch_name(7), "00000007");
        assert_eq!(oid_name(0xabcd), "000000000000abcd");
        assert_eq!(parse_oid_name("000000000000abcd"), Some(0xabcd));
        assert_eq!(parse_oid_name("000000000000abcd.tmp"), None);
        assert_eq!(parse_oid_name("."), None);
        assert_eq!(parse_oid_name(".."), None);
        assert_eq!(parse_oid_name("0000000000000000"), None);
    }

    #[test]
    fn aligned_buf() {
        let mut buf = AlignedBuf::zeroed(SECTOR_SIZE * 3);
        assert_eq!(buf.as_ptr() as usize % SECTOR_SIZE, 0);
        assert!(buf.iter().all(|b| *b == 0));
        buf[17] = 0xff;
        assert_eq!(buf[17], 0xff);
        let copy = AlignedBuf::from_slice(&buf);
        assert_eq!(&copy[..], &buf[..]);
    }
}
