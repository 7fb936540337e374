//! Pluggable object store backends.
//!
//! A backend maps (epoch, OID) to object bodies on disk. Every call takes
//! an [`Iocb`] carrying the epoch the call operates at, the request flags
//! and the open file handle between `open` and `close`. Backends are
//! selected by name at init; the chosen name is persisted in the config
//! record by `format`.

pub mod simple;

use crate::proto::SdError;
use crate::proto::SdResult;
use log::debug;
use log::error;
use std::fs;
use std::fs::File;
use std::io;
use std::path::Path;
use std::path::PathBuf;

/// Per-call I/O control block.
#[derive(Default)]
pub struct Iocb {
    pub epoch: u32,
    /// Request flags (`SD_FLAG_CMD_*`) steering open behavior.
    pub flags: u16,
    /// Handle opened by `open`, consumed by `close`.
    pub file: Option<File>,
}

impl Iocb {
    pub fn at_epoch(epoch: u32) -> Self {
        Self {
            epoch,
            ..Default::default()
        }
    }

    pub fn new(epoch: u32, flags: u16) -> Self {
        Self {
            epoch,
            flags,
            file: None,
        }
    }
}

/// Disk usage reported by [`StoreDriver::stat`].
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreStat {
    pub store_size: u64,
    pub store_free: u64,
}

/// Capability set every backend implements.
pub trait StoreDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Scans the store at startup and returns the VDI ids found, for the
    /// cluster-wide in-use bitmap.
    fn init(&self) -> SdResult<Vec<u32>>;

    /// Opens the object file at the iocb's epoch. `create` truncates into
    /// existence and preallocates the body.
    fn open(&self, oid: u64, iocb: &mut Iocb, create: bool) -> SdResult<()>;

    fn read(&self, oid: u64, iocb: &mut Iocb, buf: &mut [u8], offset: u64) -> SdResult<()>;

    fn write(&self, oid: u64, iocb: &mut Iocb, buf: &[u8], offset: u64) -> SdResult<()>;

    fn close(&self, oid: u64, iocb: &mut Iocb) -> SdResult<()>;

    /// Enumerates the OIDs stored under `epoch`, or under every epoch when
    /// `epoch` is 0.
    fn get_objlist(&self, epoch: u32) -> SdResult<Vec<u64>>;

    /// Hard-links the object from `tgt_epoch` into the iocb's epoch: the
    /// recovery fast path.
    fn link(&self, oid: u64, iocb: &Iocb, tgt_epoch: u32) -> SdResult<()>;

    /// Writes a full object body through a temporary sibling, renamed into
    /// place: the recovery slow path.
    fn atomic_put(&self, oid: u64, iocb: &Iocb, buf: &[u8]) -> SdResult<()>;

    /// Wipes every epoch directory up to the iocb's epoch.
    fn format(&self, iocb: &Iocb) -> SdResult<()>;

    fn begin_recover(&self, _iocb: &Iocb) -> SdResult<()> {
        Ok(())
    }

    fn end_recover(&self, _iocb: &Iocb) -> SdResult<()> {
        Ok(())
    }

    /// Reports total and free bytes of the store filesystem.
    fn stat(&self, epoch: u32) -> SdResult<StoreStat>;

    /// Path of the object file at `epoch`, for callers that must address
    /// the file directly (journaling, removal).
    fn obj_file(&self, epoch: u32, oid: u64) -> PathBuf;
}

/// Looks a backend up by its persisted name.
pub fn find_store_driver(
    name: &str,
    obj_path: PathBuf,
    use_directio: bool,
) -> Option<Box<dyn StoreDriver>> {
    match name {
        simple::DRIVER_NAME => Some(Box::new(simple::SimpleStore::new(obj_path, use_directio))),
        _ => None,
    }
}

/// Maps a file system error on an object file to its domain code.
///
/// A missing file under a healthy object root is the ordinary "no object"
/// case; a missing file with the root itself unreachable means the store
/// is corrupted.
pub fn err_to_sderr(obj_root: &Path, oid: u64, err: &io::Error) -> SdError {
    if err.kind() == io::ErrorKind::NotFound {
        if fs::metadata(obj_root).is_err() {
            error!("object directory corrupted: {err}");
            SdError::Eio
        } else {
            debug!("object {oid:016x} not found locally");
            SdError::NoObj
        }
    } else {
        error!("{err}");
        SdError::Unknown
    }
}
