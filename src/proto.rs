//! Semantics of the peer request/response protocol.
//!
//! Both headers are fixed 48-byte little-endian records. Only the semantics
//! of the fields are contractual; the framing is internal to this daemon.

use std::io;
use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::time::Duration;
use thiserror::Error;

/// Protocol version carried in every header.
pub const SD_PROTO_VER: u8 = 0x01;
/// Size of an encoded request or response header.
pub const SD_REQ_SIZE: usize = 48;

/// Timeout applied to peer sockets, and to the poll loop collecting
/// multi-replica write responses.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Create an object and write its first body.
pub const SD_OP_CREATE_AND_WRITE_OBJ: u8 = 0x01;
/// Read an object body.
pub const SD_OP_READ_OBJ: u8 = 0x02;
/// Write into an existing object.
pub const SD_OP_WRITE_OBJ: u8 = 0x03;
/// Remove an object.
pub const SD_OP_REMOVE_OBJ: u8 = 0x04;
/// Fetch the OIDs this node stores.
pub const SD_OP_GET_OBJ_LIST: u8 = 0x16;
/// Fetch an epoch log file.
pub const SD_OP_GET_EPOCH: u8 = 0x17;
/// Toggle trace collection.
pub const SD_OP_TRACE: u8 = 0x25;
/// Drain the trace ring.
pub const SD_OP_TRACE_CAT: u8 = 0x26;

/// The request writes data.
pub const SD_FLAG_CMD_WRITE: u16 = 0x01;
/// Copy-on-write creation: initialize from the parent OID.
pub const SD_FLAG_CMD_COW: u16 = 0x02;
/// Use the object cache even where the bypass predicate would apply.
pub const SD_FLAG_CMD_CACHE: u16 = 0x04;
/// Execute locally; no further forwarding.
pub const SD_FLAG_CMD_IO_LOCAL: u16 = 0x08;
/// Read on behalf of recovery; the effective epoch comes from `tgt_epoch`.
pub const SD_FLAG_CMD_RECOVERY: u16 = 0x10;

/// Result codes of the storage domain.
///
/// `SdError` carries every code but success; success is the `Ok` side of
/// [`SdResult`]. The `u32` values are the wire representation.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum SdError {
    #[error("unknown error")]
    Unknown,
    #[error("no object found")]
    NoObj,
    #[error("local I/O error")]
    Eio,
    #[error("out of memory")]
    NoMem,
    #[error("system error")]
    SystemError,
    #[error("remote node has an older node list")]
    OldNodeVer,
    #[error("remote node has a newer node list")]
    NewNodeVer,
    #[error("network error")]
    NetworkError,
}

pub type SdResult<T> = Result<T, SdError>;

impl SdError {
    /// Returns the wire value of the code.
    pub fn to_wire(self) -> u32 {
        match self {
            Self::Unknown => 0x01,
            Self::NoObj => 0x02,
            Self::Eio => 0x03,
            Self::NoMem => 0x12,
            Self::OldNodeVer => 0x41,
            Self::NewNodeVer => 0x42,
            Self::SystemError => 0x43,
            Self::NetworkError => 0x81,
        }
    }

    /// Decodes a wire result value. `0` is success.
    pub fn from_wire(val: u32) -> SdResult<()> {
        match val {
            0x00 => Ok(()),
            0x02 => Err(Self::NoObj),
            0x03 => Err(Self::Eio),
            0x12 => Err(Self::NoMem),
            0x41 => Err(Self::OldNodeVer),
            0x42 => Err(Self::NewNodeVer),
            0x43 => Err(Self::SystemError),
            0x81 => Err(Self::NetworkError),
            _ => Err(Self::Unknown),
        }
    }

    /// Encodes a result. The `Ok` side is the success wire value.
    pub fn wire_result(res: SdResult<()>) -> u32 {
        match res {
            Ok(()) => 0,
            Err(e) => e.to_wire(),
        }
    }
}

/// A request header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SdReq {
    pub proto_ver: u8,
    pub opcode: u8,
    pub flags: u16,
    pub epoch: u32,
    pub id: u32,
    pub data_length: u32,
    pub oid: u64,
    /// Parent OID of a copy-on-write creation.
    pub cow_oid: u64,
    pub offset: u64,
    pub copies: u32,
    /// Epoch a recovery read targets; also the epoch requested by
    /// `GET_EPOCH` and `GET_OBJ_LIST`.
    pub tgt_epoch: u32,
}

impl SdReq {
    pub fn new(opcode: u8) -> Self {
        Self {
            proto_ver: SD_PROTO_VER,
            opcode,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> [u8; SD_REQ_SIZE] {
        let mut buf = [0; SD_REQ_SIZE];
        buf[0] = self.proto_ver;
        buf[1] = self.opcode;
        buf[2..4].copy_from_slice(&self.flags.to_le_bytes());
        buf[4..8].copy_from_slice(&self.epoch.to_le_bytes());
        buf[8..12].copy_from_slice(&self.id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.data_length.to_le_bytes());
        buf[16..24].copy_from_slice(&self.oid.to_le_bytes());
        buf[24..32].copy_from_slice(&self.cow_oid.to_le_bytes());
        buf[32..40].copy_from_slice(&self.offset.to_le_bytes());
        buf[40..44].copy_from_slice(&self.copies.to_le_bytes());
        buf[44..48].copy_from_slice(&self.tgt_epoch.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; SD_REQ_SIZE]) -> Self {
        Self {
            proto_ver: buf[0],
            opcode: buf[1],
            flags: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
            epoch: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            id: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            data_length: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            oid: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            cow_oid: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            copies: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
            tgt_epoch: u32::from_le_bytes(buf[44..48].try_into().unwrap()),
        }
    }
}

/// A response header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SdRsp {
    pub proto_ver: u8,
    pub opcode: u8,
    pub flags: u16,
    pub epoch: u32,
    pub id: u32,
    pub data_length: u32,
    pub result: u32,
    pub copies: u32,
}

impl SdRsp {
    pub fn encode(&self) -> [u8; SD_REQ_SIZE] {
        let mut buf = [0; SD_REQ_SIZE];
        buf[0] = self.proto_ver;
        buf[1] = self.opcode;
        buf[2..4].copy_from_slice(&self.flags.to_le_bytes());
        buf[4..8].copy_from_slice(&self.epoch.to_le_bytes());
        buf[8..12].copy_from_slice(&self.id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.data_length.to_le_bytes());
        buf[16..20].copy_from_slice(&self.result.to_le_bytes());
        buf[20..24].copy_from_slice(&self.copies.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; SD_REQ_SIZE]) -> Self {
        Self {
            proto_ver: buf[0],
            opcode: buf[1],
            flags: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
            epoch: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            id: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            data_length: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            result: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            copies: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        }
    }
}

/// Connects to a peer with both socket timeouts armed.
pub fn connect_to(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, DEFAULT_SOCKET_TIMEOUT)?;
    stream.set_read_timeout(Some(DEFAULT_SOCKET_TIMEOUT))?;
    stream.set_write_timeout(Some(DEFAULT_SOCKET_TIMEOUT))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Sends a request header followed by its body, without reading a response.
pub fn send_req(stream: &mut TcpStream, hdr: &SdReq, wbuf: &[u8]) -> io::Result<()> {
    stream.write_all(&hdr.encode())?;
    if !wbuf.is_empty() {
        stream.write_all(wbuf)?;
    }
    stream.flush()
}

/// Reads exactly one response header followed by its body.
///
/// The body is truncated to `rbuf`; the number of bytes stored is returned
/// along with the header. Any excess advertised by the peer is drained so
/// the stream stays aligned on header boundaries.
pub fn recv_rsp(stream: &mut TcpStream, rbuf: &mut [u8]) -> io::Result<(SdRsp, usize)> {
    let mut hdr_buf = [0; SD_REQ_SIZE];
    stream.read_exact(&mut hdr_buf)?;
    let rsp = SdRsp::decode(&hdr_buf);

    let body = rsp.data_length as usize;
    let stored = body.min(rbuf.len());
    stream.read_exact(&mut rbuf[..stored])?;
    let mut excess = body - stored;
    let mut sink = [0u8; 4096];
    while excess > 0 {
        let n = excess.min(sink.len());
        stream.read_exact(&mut sink[..n])?;
        excess -= n;
    }
    Ok((rsp, stored))
}

/// Executes a request: send, then collect the single response.
pub fn exec_req(
    stream: &mut TcpStream,
    hdr: &SdReq,
    wbuf: &[u8],
    rbuf: &mut [u8],
) -> io::Result<(SdRsp, usize)> {
    send_req(stream, hdr, wbuf)?;
    recv_rsp(stream, rbuf)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn req_roundtrip() {
        let req = SdReq {
            proto_ver: SD_PROTO_VER,
            opcode: SD_OP_CREATE_AND_WRITE_OBJ,
            flags: SD_FLAG_CMD_WRITE | SD_FLAG_CMD_COW,
            epoch: 7,
            id: 99,
            data_length: 4096,
            oid: 0xabcd_0000_0001,
            cow_oid: 0xabcd_0000_0002,
            offset: 512,
            copies: 3,
            tgt_epoch: 6,
        };
        assert_eq!(SdReq::decode(&req.encode()), req);
    }

    #[test]
    fn rsp_roundtrip() {
        let rsp = SdRsp {
            proto_ver: SD_PROTO_VER,
            opcode: SD_OP_READ_OBJ,
            flags: 0,
            epoch: 3,
            id: 1,
            data_length: 8,
            result: SdError::NoObj.to_wire(),
            copies: 2,
        };
        assert_eq!(SdRsp::decode(&rsp.encode()), rsp);
    }

    #[test]
    fn wire_results() {
        assert_eq!(SdError::from_wire(0), Ok(()));
        assert_eq!(SdError::from_wire(0x02), Err(SdError::NoObj));
        assert_eq!(SdError::from_wire(0xdead), Err(SdError::Unknown));
        for err in [
            SdError::Unknown,
            SdError::NoObj,
            SdError::Eio,
            SdError::NoMem,
            SdError::SystemError,
            SdError::OldNodeVer,
            SdError::NewNodeVer,
            SdError::NetworkError,
        ] {
            assert_eq!(SdError::from_wire(err.to_wire()), Err(err));
        }
    }
}
