//! Bounded ring of operation trace records.
//!
//! Tracing is toggled by the `TRACE` operation and drained by `TRACE_CAT`.
//! Each record captures one traced call: its type, nesting depth, name, and
//! entry/return timestamps. The ring drops its oldest records under
//! pressure rather than ever blocking the hot path.

use crate::util;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// Number of records kept before the oldest are dropped.
const TRACE_RING_LEN: usize = 4096;
/// Size of one encoded trace record.
pub const TRACE_RECORD_SIZE: usize = 64;
/// Length of the name field of an encoded record.
const TRACE_FNAME_LEN: usize = 40;

/// A traced function entry/return pair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TraceRecord {
    /// Kind of the traced call (opcode for request dispatch).
    pub ttype: u8,
    /// Nesting depth at the time of the call.
    pub depth: u16,
    /// Name of the traced function.
    pub fname: String,
    /// Entry timestamp, nanoseconds since the Unix epoch.
    pub entry_time: u64,
    /// Return timestamp, nanoseconds since the Unix epoch.
    pub return_time: u64,
}

impl TraceRecord {
    pub fn encode(&self) -> [u8; TRACE_RECORD_SIZE] {
        let mut buf = [0; TRACE_RECORD_SIZE];
        buf[0] = self.ttype;
        buf[2..4].copy_from_slice(&self.depth.to_le_bytes());
        buf[8..16].copy_from_slice(&self.entry_time.to_le_bytes());
        buf[16..24].copy_from_slice(&self.return_time.to_le_bytes());
        let name = self.fname.as_bytes();
        let len = name.len().min(TRACE_FNAME_LEN);
        buf[24..24 + len].copy_from_slice(&name[..len]);
        buf
    }

    pub fn decode(buf: &[u8; TRACE_RECORD_SIZE]) -> Self {
        let name = &buf[24..24 + TRACE_FNAME_LEN];
        let len = name.iter().position(|b| *b == 0).unwrap_or(TRACE_FNAME_LEN);
        Self {
            ttype: buf[0],
            depth: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
            fname: String::from_utf8_lossy(&name[..len]).into_owned(),
            entry_time: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            return_time: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        }
    }
}

#[derive(Default)]
pub struct Tracer {
    enabled: AtomicBool,
    ring: Mutex<VecDeque<TraceRecord>>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Starts a traced span. Returns the entry timestamp to be passed back
    /// to [`Tracer::record`], or `None` when tracing is off.
    pub fn enter(&self) -> Option<u64> {
        self.enabled()
            .then(|| util::get_timestamp().as_nanos() as u64)
    }

    /// Completes a span started by [`Tracer::enter`].
    pub fn record(&self, ttype: u8, depth: u16, fname: &str, entry_time: u64) {
        let record = TraceRecord {
            ttype,
            depth,
            fname: fname.to_string(),
            entry_time,
            return_time: util::get_timestamp().as_nanos() as u64,
        };
        let mut ring = self.ring.lock().unwrap();
        if ring.len() == TRACE_RING_LEN {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Drains the ring into its wire encoding.
    pub fn cat(&self) -> Vec<u8> {
        let mut ring = self.ring.lock().unwrap();
        let mut buf = Vec::with_capacity(ring.len() * TRACE_RECORD_SIZE);
        for record in ring.drain(..) {
            buf.extend_from_slice(&record.encode());
        }
        buf
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let record = TraceRecord {
            ttype: 0x02,
            depth: 1,
            fname: "forward_read_obj_req".to_string(),
            entry_time: 100,
            return_time: 250,
        };
        assert_eq!(TraceRecord::decode(&record.encode()), record);
    }

    #[test]
    fn disabled_by_default() {
        let tracer = Tracer::new();
        assert!(tracer.enter().is_none());
        tracer.set_enabled(true);
        assert!(tracer.enter().is_some());
    }

    #[test]
    fn cat_drains() {
        let tracer = Tracer::new();
        tracer.set_enabled(true);
        let entry = tracer.enter().unwrap();
        tracer.record(0x03, 0, "do_local_io", entry);

        let buf = tracer.cat();
        assert_eq!(buf.len(), TRACE_RECORD_SIZE);
        let record = TraceRecord::decode(&buf[..TRACE_RECORD_SIZE].try_into().unwrap());
        assert_eq!(record.fname, "do_local_io");
        assert!(record.return_time >= record.entry_time);
        assert!(tracer.cat().is_empty());
    }

    #[test]
    fn ring_drops_oldest() {
        let tracer = Tracer::new();
        tracer.set_enabled(true);
        for i in 0..(TRACE_RING_LEN + 10) {
            tracer.record(0, 0, &format!("f{i}"), i as u64);
        }
        let buf = tracer.cat();
        assert_eq!(buf.len(), TRACE_RING_LEN * TRACE_RECORD_SIZE);
        let first = TraceRecord::decode(&buf[..TRACE_RECORD_SIZE].try_into().unwrap());
        assert_eq!(first.fname, "f10");
    }
}
