//! Write-ahead journal for in-place file mutations.
//!
//! A caller about to overwrite a range of a file first persists the new
//! bytes in a journal record, mutates the target, then retires the record.
//! After a crash, [`recover`] replays every complete surviving record, so
//! the target file is observed either in its pre-mutation or post-mutation
//! state, never a mix. Records that were still being written when the crash
//! hit are incomplete and are discarded.

use log::error;
use log::info;
use log::warn;
use std::fs;
use std::fs::File;
use std::io;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Magic opening and closing every record.
const JRNL_MAGIC: u32 = 0x4a52_4e4c;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// An open journal record. The guarded mutation happens between
/// [`begin`] and [`JrnlHandle::end`].
pub struct JrnlHandle {
    record_path: PathBuf,
}

impl JrnlHandle {
    /// Retires the record after the guarded mutation completed.
    pub fn end(self) -> io::Result<()> {
        fs::remove_file(&self.record_path)
    }
}

/// Persists a record describing the mutation of `len(buf)` bytes at
/// `offset` of `target_path`, fsynced before returning.
pub fn begin(
    buf: &[u8],
    offset: u64,
    target_path: &Path,
    jrnl_dir: &Path,
) -> io::Result<JrnlHandle> {
    let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
    let record_path = jrnl_dir.join(format!("{seq:08}"));

    let target = target_path.as_os_str().as_bytes();
    let mut record = Vec::with_capacity(buf.len() + target.len() + 24);
    record.extend_from_slice(&JRNL_MAGIC.to_le_bytes());
    record.extend_from_slice(&offset.to_le_bytes());
    record.extend_from_slice(&(buf.len() as u32).to_le_bytes());
    record.extend_from_slice(&(target.len() as u16).to_le_bytes());
    record.extend_from_slice(target);
    record.extend_from_slice(buf);
    record.extend_from_slice(&JRNL_MAGIC.to_le_bytes());

    let mut file = File::create(&record_path)?;
    file.write_all(&record)?;
    file.sync_all()?;
    Ok(JrnlHandle { record_path })
}

/// Replays every complete record left in `jrnl_dir`, then removes it.
///
/// Called once at startup, before anything else touches the guarded files.
pub fn recover(jrnl_dir: &Path) -> io::Result<()> {
    let mut max_seq = 0;
    for entry in fs::read_dir(jrnl_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Ok(seq) = name.parse::<u64>() {
            max_seq = max_seq.max(seq + 1);
        }
        match replay(&path) {
            Ok(()) => info!("journal record {name} replayed"),
            Err(e) => warn!("discarding incomplete journal record {name}: {e}"),
        }
        fs::remove_file(&path)?;
    }
    // avoid reusing the names of records that were just removed
    NEXT_SEQ.fetch_max(max_seq, Ordering::Relaxed);
    Ok(())
}

/// Applies one record to its target file.
fn replay(record_path: &Path) -> io::Result<()> {
    let mut record = Vec::new();
    File::open(record_path)?.read_to_end(&mut record)?;

    let invalid = |msg| io::Error::new(ErrorKind::InvalidData, msg);
    if record.len() < 18 || record[..4] != JRNL_MAGIC.to_le_bytes() {
        return Err(invalid("bad header"));
    }
    let offset = u64::from_le_bytes(record[4..12].try_into().unwrap());
    let len = u32::from_le_bytes(record[12..16].try_into().unwrap()) as usize;
    let path_len = u16::from_le_bytes(record[16..18].try_into().unwrap()) as usize;
    let end = 18 + path_len + len + 4;
    if record.len() != end || record[end - 4..] != JRNL_MAGIC.to_le_bytes() {
        return Err(invalid("truncated record"));
    }
    let target = PathBuf::from(std::ffi::OsStr::from_bytes(&record[18..18 + path_len]));
    let payload = &record[18 + path_len..end - 4];

    let file = fs::OpenOptions::new().write(true).open(&target)?;
    file.write_all_at(payload, offset)?;
    file.sync_all()?;
    info!("recovered {} bytes at {offset} of {}", len, target.display());
    Ok(())
}

/// Runs `recover` unless the journal directory was just created.
pub fn init(jrnl_dir: &Path, newly_created: bool) -> io::Result<()> {
    if newly_created {
        return Ok(());
    }
    recover(jrnl_dir).inspect_err(|e| error!("journal recovery failed: {e}"))
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn end_retires_record() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, b"old old old").unwrap();
        let jrnl = dir.path().join("journal");
        fs::create_dir(&jrnl).unwrap();

        let handle = begin(b"new", 4, &target, &jrnl).unwrap();
        assert_eq!(fs::read_dir(&jrnl).unwrap().count(), 1);
        handle.end().unwrap();
        assert_eq!(fs::read_dir(&jrnl).unwrap().count(), 0);
        // the journal itself never touches the target
        assert_eq!(fs::read(&target).unwrap(), b"old old old");
    }

    #[test]
    fn recover_replays_surviving_record() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, b"old old old").unwrap();
        let jrnl = dir.path().join("journal");
        fs::create_dir(&jrnl).unwrap();

        // crash before the mutation: the record survives, end() never runs
        let handle = begin(b"new", 4, &target, &jrnl).unwrap();
        std::mem::forget(handle);

        recover(&jrnl).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"old new old");
        assert_eq!(fs::read_dir(&jrnl).unwrap().count(), 0);
    }

    #[test]
    fn recover_discards_truncated_record() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, b"old old old").unwrap();
        let jrnl = dir.path().join("journal");
        fs::create_dir(&jrnl).unwrap();

        let handle = begin(b"new", 4, &target, &jrnl).unwrap();
        let record = handle.record_path.clone();
        std::mem::forget(handle);
        // chop the closing magic off, as if the crash hit mid-write
        let bytes = fs::read(&record).unwrap();
        fs::write(&record, &bytes[..bytes.len() - 2]).unwrap();

        recover(&jrnl).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"old old old");
        assert_eq!(fs::read_dir(&jrnl).unwrap().count(), 0);
    }
}
