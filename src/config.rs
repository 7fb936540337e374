//! Durable cluster-wide configuration scalars.
//!
//! The config file is a fixed-layout record: creation time, flags, the
//! replica count and the store driver name, each at a fixed byte offset.
//! Every write goes through the journal, so a crash mid-update leaves the
//! previous or the new value, never a torn one.

use crate::journal;
use crate::proto::SdError;
use crate::proto::SdResult;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

/// Length of the persisted store driver name.
pub const STORE_LEN: usize = 16;

/// Cluster flag: keep serving even when too many zones are lost.
pub const SD_FLAG_NOHALT: u16 = 0x01;
/// Cluster flag: direct I/O on data objects.
pub const SD_FLAG_DIRECTIO: u16 = 0x02;

const CTIME_OFFSET: u64 = 0;
const FLAGS_OFFSET: u64 = 8;
const COPIES_OFFSET: u64 = 10;
const STORE_OFFSET: u64 = 11;

/// Accessors over the on-disk config record.
pub struct ConfigStore {
    path: PathBuf,
    jrnl_dir: PathBuf,
}

impl ConfigStore {
    /// Opens the config store, creating an empty file if none exists.
    pub fn new(path: PathBuf, jrnl_dir: PathBuf) -> SdResult<Self> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|_| SdError::Eio)?;
        Ok(Self { path, jrnl_dir })
    }

    fn open_write(&self) -> SdResult<File> {
        OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_DSYNC)
            .open(&self.path)
            .map_err(|_| SdError::Eio)
    }

    /// Journaled write of one field.
    fn set(&self, buf: &[u8], offset: u64) -> SdResult<()> {
        let file = self.open_write()?;
        let jd = journal::begin(buf, offset, &self.path, &self.jrnl_dir)
            .map_err(|_| SdError::Eio)?;
        let ret = file.write_all_at(buf, offset).map_err(|_| SdError::Eio);
        jd.end().map_err(|_| SdError::Eio)?;
        ret
    }

    fn get(&self, buf: &mut [u8], offset: u64) -> SdResult<()> {
        let file = File::open(&self.path).map_err(|_| SdError::Eio)?;
        file.read_exact_at(buf, offset).map_err(|_| SdError::Eio)
    }

    pub fn set_ctime(&self, ctime: u64) -> SdResult<()> {
        self.set(&ctime.to_le_bytes(), CTIME_OFFSET)
    }

    /// Returns the cluster creation time, or 0 when the record was never
    /// written.
    pub fn get_ctime(&self) -> u64 {
        let mut buf = [0; 8];
        match self.get(&mut buf, CTIME_OFFSET) {
            Ok(()) => u64::from_le_bytes(buf),
            Err(_) => 0,
        }
    }

    pub fn set_flags(&self, flags: u16) -> SdResult<()> {
        self.set(&flags.to_le_bytes(), FLAGS_OFFSET)
    }

    pub fn get_flags(&self) -> SdResult<u16> {
        let mut buf = [0; 2];
        self.get(&mut buf, FLAGS_OFFSET)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn set_copies(&self, copies: u8) -> SdResult<()> {
        self.set(&[copies], COPIES_OFFSET)
    }

    pub fn get_copies(&self) -> SdResult<u8> {
        let mut buf = [0; 1];
        self.get(&mut buf, COPIES_OFFSET)?;
        Ok(buf[0])
    }

    /// Records the store driver name, NUL padded to its fixed length.
    pub fn set_store(&self, name: &str) -> SdResult<()> {
        let mut buf = [0; STORE_LEN];
        let bytes = name.as_bytes();
        if bytes.len() >= STORE_LEN {
            return Err(SdError::SystemError);
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        self.set(&buf, STORE_OFFSET)
    }

    /// Returns the recorded store driver name. An empty string means the
    /// cluster was never formatted.
    pub fn get_store(&self) -> SdResult<String> {
        let mut buf = [0; STORE_LEN];
        if self.get(&mut buf, STORE_OFFSET).is_err() {
            // short or missing record: not formatted yet
            return Ok(String::new());
        }
        let len = buf.iter().position(|b| *b == 0).unwrap_or(STORE_LEN);
        String::from_utf8(buf[..len].to_vec()).map_err(|_| SdError::Eio)
    }
}
