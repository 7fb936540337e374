//! The epoch log: one append-only file per epoch recording the membership.
//!
//! Each file holds the ordered node records of the epoch followed by the
//! POSIX timestamp of the transition. A node that misses an epoch file can
//! fetch it from any peer that still has it.

use crate::proto;
use crate::proto::SdError;
use crate::proto::SdReq;
use crate::proto::SdResult;
use crate::ring::NODE_RECORD_SIZE;
use crate::ring::Node;
use crate::ring::SD_MAX_NODES;
use crate::util;
use log::debug;
use log::error;
use log::warn;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process;

/// Accessors over the epoch log directory.
pub struct EpochLog {
    dir: PathBuf,
}

impl EpochLog {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn epoch_file(&self, epoch: u32) -> PathBuf {
        self.dir.join(util::epoch_name(epoch))
    }

    /// Atomically records the node list of `epoch` followed by a timestamp.
    pub fn update(&self, epoch: u32, nodes: &[Node]) -> SdResult<()> {
        debug!("update epoch: {epoch}, {} nodes", nodes.len());
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .custom_flags(libc::O_DSYNC)
            .open(self.epoch_file(epoch))
            .map_err(|_| SdError::Eio)?;
        let mut buf = Vec::with_capacity(nodes.len() * NODE_RECORD_SIZE + 8);
        for node in nodes {
            buf.extend_from_slice(&node.encode());
        }
        buf.extend_from_slice(&util::get_timestamp().as_secs().to_le_bytes());
        file.write_all(&buf).map_err(|_| SdError::Eio)
    }

    /// Returns the raw bytes of an epoch file, `NoObj` when absent.
    pub fn read_raw(&self, epoch: u32) -> SdResult<Vec<u8>> {
        fs::read(self.epoch_file(epoch)).map_err(|_| SdError::NoObj)
    }

    /// Decodes the node records out of raw epoch file bytes. The trailing
    /// timestamp (and any partial record) is dropped by the division.
    pub fn decode_nodes(bytes: &[u8]) -> Vec<Node> {
        bytes
            .chunks_exact(NODE_RECORD_SIZE)
            .map(|c| Node::decode(c.try_into().unwrap()))
            .collect()
    }

    /// Reads the node list recorded for `epoch` from the local log.
    pub fn read(&self, epoch: u32) -> SdResult<Vec<Node>> {
        Ok(Self::decode_nodes(&self.read_raw(epoch)?))
    }

    /// Reads the node list and the transition timestamp.
    pub fn read_with_time(&self, epoch: u32) -> SdResult<(Vec<Node>, u64)> {
        let bytes = self.read_raw(epoch)?;
        let nodes = Self::decode_nodes(&bytes);
        let rest = &bytes[nodes.len() * NODE_RECORD_SIZE..];
        let time = match rest.try_into() {
            Ok(ts) => u64::from_le_bytes(ts),
            Err(_) => 0,
        };
        Ok((nodes, time))
    }

    /// Fetches the node list of `epoch` from peers when the local file is
    /// missing.
    ///
    /// Every node of the latest local epoch is asked in turn. An empty list
    /// means no peer has the epoch, which callers treat as "no such epoch",
    /// not as an error.
    pub fn read_remote(&self, epoch: u32, me: &Node) -> Vec<Node> {
        let latest = self.latest();
        let peers = self.read(latest).unwrap_or_default();
        for peer in &peers {
            if peer == me {
                continue;
            }
            let mut stream = match proto::connect_to(peer.sockaddr()) {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to connect to {}: {e}", peer.sockaddr());
                    continue;
                }
            };
            let mut hdr = SdReq::new(proto::SD_OP_GET_EPOCH);
            hdr.tgt_epoch = epoch;
            hdr.data_length = (SD_MAX_NODES * NODE_RECORD_SIZE + 8) as u32;
            let mut buf = vec![0; hdr.data_length as usize];
            let Ok((rsp, len)) = proto::exec_req(&mut stream, &hdr, &[], &mut buf) else {
                continue;
            };
            if SdError::from_wire(rsp.result).is_ok() {
                return Self::decode_nodes(&buf[..len]);
            }
        }
        Vec::new()
    }

    /// Scans the log directory for the highest recorded epoch.
    ///
    /// The directory being unreadable means the storage root is gone from
    /// under us; there is nothing sane left to do, so the process aborts.
    pub fn latest(&self) -> u32 {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("failed to get the latest epoch: {e}");
                process::abort();
            }
        };
        let mut latest = 0;
        for entry in entries.flatten() {
            if let Some(epoch) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            {
                latest = latest.max(epoch);
            }
        }
        latest
    }

    /// Garbage-collects the log file of an epoch.
    pub fn remove(&self, epoch: u32) -> SdResult<()> {
        debug!("remove epoch {epoch}");
        match fs::remove_file(self.epoch_file(epoch)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("failed to remove epoch {epoch}: {e}");
                Err(SdError::Eio)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::IpAddr;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tempfile::tempdir;

    fn node(i: u8) -> Node {
        Node {
            addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)),
            port: 7000,
            node_idx: i as u16,
            zone: i as u32,
        }
    }

    #[test]
    fn log_roundtrip() {
        let dir = tempdir().unwrap();
        let log = EpochLog::new(dir.path().to_path_buf());
        let nodes = vec![node(1), node(2), node(3)];

        log.update(4, &nodes).unwrap();
        assert_eq!(log.read(4).unwrap(), nodes);

        let (read, time) = log.read_with_time(4).unwrap();
        assert_eq!(read, nodes);
        let now = util::get_timestamp().as_secs();
        assert!(Duration::from_secs(now - time) < Duration::from_secs(2));
    }

    #[test]
    fn latest_scans_names() {
        let dir = tempdir().unwrap();
        let log = EpochLog::new(dir.path().to_path_buf());
        assert_eq!(log.latest(), 0);

        log.update(1, &[node(1)]).unwrap();
        log.update(7, &[node(1)]).unwrap();
        log.update(3, &[node(1)]).unwrap();
        fs::write(dir.path().join("not-an-epoch"), b"x").unwrap();
        assert_eq!(log.latest(), 7);
    }

    #[test]
    fn read_remote_empty_when_no_peer_has_it() {
        let dir = tempdir().unwrap();
        let log = EpochLog::new(dir.path().to_path_buf());
        let me = node(1);
        log.update(1, &[me]).unwrap();
        // the only known member is ourselves: nobody to ask
        assert!(log.read_remote(5, &me).is_empty());
    }

    #[test]
    fn remove_missing_is_ok() {
        let dir = tempdir().unwrap();
        let log = EpochLog::new(dir.path().to_path_buf());
        assert_eq!(log.remove(9), Ok(()));
        log.update(9, &[node(1)]).unwrap();
        assert_eq!(log.remove(9), Ok(()));
        assert_eq!(log.read(9), Err(SdError::NoObj));
    }
}
