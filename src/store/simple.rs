//! File-per-object backend under per-epoch directories.
//!
//! The object for OID `o` at epoch `e` lives at `<obj>/<e:08>/<o:016x>`.
//! Data objects are preallocated at creation so the dominant object size
//! gets a contiguous on-disk layout.

use super::Iocb;
use super::StoreDriver;
use super::StoreStat;
use super::err_to_sderr;
use crate::obj;
use crate::proto::SD_FLAG_CMD_COW;
use crate::proto::SdError;
use crate::proto::SdResult;
use crate::util;
use crate::util::AlignedBuf;
use crate::util::SECTOR_SIZE;
use log::debug;
use log::error;
use std::ffi::CString;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

pub const DRIVER_NAME: &str = "simple";

pub struct SimpleStore {
    obj_path: PathBuf,
    use_directio: bool,
}

impl SimpleStore {
    pub fn new(obj_path: PathBuf, use_directio: bool) -> Self {
        Self {
            obj_path,
            use_directio,
        }
    }

    fn epoch_dir(&self, epoch: u32) -> PathBuf {
        self.obj_path.join(util::epoch_name(epoch))
    }

    /// Epoch directories named under the object root, sorted.
    fn epoch_dirs(&self) -> SdResult<Vec<u32>> {
        let entries = fs::read_dir(&self.obj_path).map_err(|_| SdError::Eio)?;
        let mut epochs: Vec<u32> = entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        epochs.sort_unstable();
        Ok(epochs)
    }

    fn scan_dir(&self, epoch: u32, oids: &mut Vec<u64>) -> SdResult<()> {
        let entries = fs::read_dir(self.epoch_dir(epoch)).map_err(|_| SdError::Eio)?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(oid) = util::parse_oid_name(name) {
                oids.push(oid);
            }
        }
        Ok(())
    }
}

/// Preallocates the whole object to get a better filesystem layout.
///
/// Falls back to forcing the last sector into existence on filesystems
/// without allocation support.
fn prealloc(file: &File) -> SdResult<()> {
    let ret = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, obj::SD_DATA_OBJ_SIZE as i64) };
    if ret < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno != libc::ENOSYS && errno != libc::EOPNOTSUPP {
            return Err(SdError::SystemError);
        }
        write_last_sector(file)
    } else {
        Ok(())
    }
}

fn write_last_sector(file: &File) -> SdResult<()> {
    let buf = AlignedBuf::zeroed(SECTOR_SIZE);
    let off = obj::SD_DATA_OBJ_SIZE - SECTOR_SIZE as u64;
    file.write_all_at(&buf, off).map_err(|_| SdError::Eio)
}

impl StoreDriver for SimpleStore {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn init(&self) -> SdResult<Vec<u32>> {
        let mut vids = Vec::new();
        for epoch in self.epoch_dirs()? {
            let mut oids = Vec::new();
            self.scan_dir(epoch, &mut oids)?;
            for oid in oids {
                if obj::is_vdi_obj(oid) {
                    debug!("found the VDI object {oid:016x}");
                    vids.push(obj::oid_to_vid(oid));
                }
            }
        }
        Ok(vids)
    }

    fn open(&self, oid: u64, iocb: &mut Iocb, create: bool) -> SdResult<()> {
        let mut flags = libc::O_DSYNC;
        if self.use_directio && obj::is_data_obj(oid) {
            flags |= libc::O_DIRECT;
        }

        let path = self.obj_file(iocb.epoch, oid);
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).custom_flags(flags);
        if create {
            opts.create(true).truncate(true);
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).map_err(|_| SdError::Eio)?;
            }
        }
        let file = opts
            .open(&path)
            .map_err(|e| err_to_sderr(&self.obj_path, oid, &e))?;

        if create && iocb.flags & SD_FLAG_CMD_COW == 0 {
            prealloc(&file)?;
        }
        iocb.file = Some(file);
        Ok(())
    }

    fn read(&self, _oid: u64, iocb: &mut Iocb, buf: &mut [u8], offset: u64) -> SdResult<()> {
        let file = iocb.file.as_ref().ok_or(SdError::Eio)?;
        file.read_exact_at(buf, offset).map_err(|_| SdError::Eio)
    }

    fn write(&self, _oid: u64, iocb: &mut Iocb, buf: &[u8], offset: u64) -> SdResult<()> {
        let file = iocb.file.as_ref().ok_or(SdError::Eio)?;
        file.write_all_at(buf, offset).map_err(|_| SdError::Eio)
    }

    fn close(&self, _oid: u64, iocb: &mut Iocb) -> SdResult<()> {
        iocb.file.take().ok_or(SdError::Eio)?;
        Ok(())
    }

    fn get_objlist(&self, epoch: u32) -> SdResult<Vec<u64>> {
        let mut oids = Vec::new();
        if epoch == 0 {
            for epoch in self.epoch_dirs()? {
                self.scan_dir(epoch, &mut oids)?;
            }
            oids.sort_unstable();
            oids.dedup();
        } else {
            self.scan_dir(epoch, &mut oids)?;
        }
        Ok(oids)
    }

    fn link(&self, oid: u64, iocb: &Iocb, tgt_epoch: u32) -> SdResult<()> {
        let old = self.obj_file(tgt_epoch, oid);
        let new = self.obj_file(iocb.epoch, oid);
        debug!("link from {} to {}", old.display(), new.display());
        if let Some(dir) = new.parent() {
            fs::create_dir_all(dir).map_err(|_| SdError::Eio)?;
        }
        match fs::hard_link(&old, &new) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SdError::NoObj),
            Err(_) => Err(SdError::Eio),
        }
    }

    fn atomic_put(&self, oid: u64, iocb: &Iocb, buf: &[u8]) -> SdResult<()> {
        let path = self.obj_file(iocb.epoch, oid);
        let tmp_path = path.with_extension("tmp");
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|_| SdError::Eio)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .custom_flags(libc::O_DSYNC)
            .open(&tmp_path)
            .map_err(|e| {
                error!("failed to open {}: {e}", tmp_path.display());
                SdError::Eio
            })?;
        file.write_all_at(buf, 0).map_err(|e| {
            error!("failed to write object: {e}");
            SdError::Eio
        })?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            error!(
                "failed to rename {} to {}: {e}",
                tmp_path.display(),
                path.display()
            );
            SdError::Eio
        })?;
        debug!("{oid:016x}");
        Ok(())
    }

    fn format(&self, iocb: &Iocb) -> SdResult<()> {
        debug!("epoch {}", iocb.epoch);
        for epoch in self.epoch_dirs()? {
            if epoch > iocb.epoch {
                continue;
            }
            let dir = self.epoch_dir(epoch);
            if let Err(e) = fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!("failed to remove {}: {e}", dir.display());
                    return Err(SdError::Eio);
                }
            }
        }
        Ok(())
    }

    fn stat(&self, epoch: u32) -> SdResult<StoreStat> {
        let c_path =
            CString::new(self.obj_path.as_os_str().as_bytes()).map_err(|_| SdError::Eio)?;
        let mut vs: libc::statvfs = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut vs) };
        if ret < 0 {
            return Err(SdError::Eio);
        }
        let free = vs.f_frsize as u64 * vs.f_bfree as u64;

        let mut used = 0;
        let entries = fs::read_dir(self.epoch_dir(epoch)).map_err(|_| SdError::Eio)?;
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                used += meta.len();
            }
        }
        Ok(StoreStat {
            store_size: free + used,
            store_free: free,
        })
    }

    fn obj_file(&self, epoch: u32, oid: u64) -> PathBuf {
        self.epoch_dir(epoch).join(util::oid_name(oid))
    }
}
