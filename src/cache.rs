//! Contract of the per-VDI object cache.
//!
//! The gateway consults the cache before forwarding: cached VDIs serve
//! reads and absorb writes locally, everything else goes straight to the
//! replicas. Only the contract lives here; a cache implementation plugs in
//! behind the trait, and [`NoCache`] is the null implementation used when
//! caching is disabled.

use crate::gateway::Request;
use crate::obj;
use crate::proto::SdError;
use crate::proto::SdResult;

/// Bit folded into the cache index of VDI inode objects, so an inode and
/// the data object with block index 0 never collide.
pub const CACHE_VDI_SHIFT: u32 = 31;

/// Returns the (vid, cache index) pair of an OID.
pub fn cache_index(oid: u64) -> (u32, u32) {
    let vid = obj::oid_to_vid(oid);
    let mut idx = obj::data_oid_to_idx(oid);
    if obj::is_vdi_obj(oid) {
        idx |= 1 << CACHE_VDI_SHIFT;
    }
    (vid, idx)
}

pub trait ObjectCache: Send + Sync {
    /// Tells whether a cache exists for the VDI, creating one when `create`
    /// is set and the implementation supports it.
    fn find(&self, vid: u32, create: bool) -> bool;

    /// Tells whether the object is present in the VDI's cache.
    fn lookup(&self, vid: u32, idx: u32, create: bool) -> bool;

    /// Populates the cache entry from the cluster.
    fn pull(&self, vid: u32, idx: u32) -> SdResult<()>;

    /// Serves the request from the cache.
    fn rw(&self, vid: u32, idx: u32, req: &mut Request) -> SdResult<()>;

    /// Writes every dirty entry back and drops the VDI's cache.
    fn flush_and_delete(&self, vid: u32);
}

/// Null cache: nothing is ever cached, every request bypasses.
pub struct NoCache;

impl ObjectCache for NoCache {
    fn find(&self, _vid: u32, _create: bool) -> bool {
        false
    }

    fn lookup(&self, _vid: u32, _idx: u32, _create: bool) -> bool {
        false
    }

    fn pull(&self, _vid: u32, _idx: u32) -> SdResult<()> {
        Err(SdError::NoObj)
    }

    fn rw(&self, _vid: u32, _idx: u32, _req: &mut Request) -> SdResult<()> {
        Err(SdError::Eio)
    }

    fn flush_and_delete(&self, _vid: u32) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn index_separates_inode_from_block_zero() {
        let vid = 0x99;
        let (v1, inode_idx) = cache_index(obj::vid_to_vdi_oid(vid));
        let (v2, data_idx) = cache_index(obj::vid_to_data_oid(vid, 0));
        assert_eq!(v1, vid);
        assert_eq!(v2, vid);
        assert_ne!(inode_idx, data_idx);
    }
}
