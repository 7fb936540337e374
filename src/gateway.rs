//! Gateway I/O: dispatching a client request to the replicas of its object.
//!
//! A request either executes locally (`IO_LOCAL`), is served by the object
//! cache, or is forwarded: reads go to one healthy replica (preferring this
//! node), writes go to every replica with the responses collected through a
//! single poll loop so the timeout applies to the slowest laggard.

use crate::cache;
use crate::conn::PeerKey;
use crate::ctx::StorageCtx;
use crate::journal;
use crate::obj;
use crate::proto;
use crate::proto::DEFAULT_SOCKET_TIMEOUT;
use crate::proto::SD_FLAG_CMD_CACHE;
use crate::proto::SD_FLAG_CMD_COW;
use crate::proto::SD_FLAG_CMD_IO_LOCAL;
use crate::proto::SD_FLAG_CMD_RECOVERY;
use crate::proto::SD_FLAG_CMD_WRITE;
use crate::proto::SD_OP_CREATE_AND_WRITE_OBJ;
use crate::proto::SD_OP_READ_OBJ;
use crate::proto::SD_OP_REMOVE_OBJ;
use crate::proto::SD_OP_WRITE_OBJ;
use crate::proto::SD_PROTO_VER;
use crate::proto::SdError;
use crate::proto::SdReq;
use crate::proto::SdResult;
use crate::proto::SdRsp;
use crate::ring;
use crate::store::Iocb;
use crate::util::AlignedBuf;
use log::debug;
use log::error;
use std::fs;
use std::io;
use std::net::TcpStream;
use std::os::fd::AsRawFd;

/// A request travelling through the gateway.
pub struct Request {
    pub hdr: SdReq,
    pub rsp: SdRsp,
    /// Body buffer: the payload of a write, the destination of a read.
    pub data: AlignedBuf,
    /// Set on the first read of an object whose replicas may diverge.
    pub check_consistency: bool,
}

impl Request {
    pub fn new(hdr: SdReq) -> Self {
        let len = (hdr.data_length as usize).max(1);
        Self {
            hdr,
            rsp: SdRsp {
                proto_ver: SD_PROTO_VER,
                opcode: hdr.opcode,
                epoch: hdr.epoch,
                id: hdr.id,
                ..Default::default()
            },
            data: AlignedBuf::zeroed(len),
            check_consistency: false,
        }
    }

    pub fn with_payload(hdr: SdReq, payload: &[u8]) -> Self {
        let mut req = Self::new(hdr);
        req.data[..payload.len()].copy_from_slice(payload);
        req
    }

    /// Wraps an already-filled body buffer.
    pub fn with_buffer(hdr: SdReq, data: AlignedBuf) -> Self {
        let mut req = Self::new(hdr);
        req.data = data;
        req
    }
}

/// Executes a request on the gateway worker and stores the outcome in its
/// response header.
pub fn do_io_request(ctx: &StorageCtx, req: &mut Request) {
    let hdr = req.hdr;
    let mut epoch = hdr.epoch;
    if hdr.flags & SD_FLAG_CMD_RECOVERY != 0 {
        epoch = hdr.tgt_epoch;
    }
    debug!("{:x}, {:x} , {epoch}", hdr.opcode, hdr.oid);

    let ret = if hdr.flags & SD_FLAG_CMD_IO_LOCAL != 0 {
        do_local_io(ctx, req, epoch)
    } else if bypass_object_cache(ctx, &hdr) {
        // repair replica divergence on the first read of the object
        let repair = if req.check_consistency {
            fix_object_consistency(ctx, req)
        } else {
            Ok(())
        };
        repair.and_then(|()| {
            if hdr.flags & SD_FLAG_CMD_WRITE != 0 {
                forward_write_obj_req(ctx, req)
            } else {
                forward_read_obj_req(ctx, req)
            }
        })
    } else {
        handle_gateway_request(ctx, req)
    };

    if let Err(e) = ret {
        debug!("failed: {:x}, {:x} , {epoch}, {e}", hdr.opcode, hdr.oid);
    }
    req.rsp.result = SdError::wire_result(ret);
}

/// Dispatches a local operation against the store driver.
pub fn do_local_io(ctx: &StorageCtx, req: &mut Request, epoch: u32) -> SdResult<()> {
    req.hdr.epoch = epoch;
    debug!("{:x}, {:x} , {epoch}", req.hdr.opcode, req.hdr.oid);
    match req.hdr.opcode {
        SD_OP_READ_OBJ => store_read_obj(ctx, req),
        SD_OP_WRITE_OBJ => store_write_obj(ctx, req),
        SD_OP_CREATE_AND_WRITE_OBJ => store_create_and_write_obj(ctx, req),
        SD_OP_REMOVE_OBJ => store_remove_obj(ctx, req),
        _ => Err(SdError::SystemError),
    }
}

fn store_read_obj(ctx: &StorageCtx, req: &mut Request) -> SdResult<()> {
    let hdr = req.hdr;
    let mut iocb = Iocb::new(hdr.epoch, hdr.flags);
    ctx.store.open(hdr.oid, &mut iocb, false)?;

    let len = hdr.data_length as usize;
    let ret = ctx
        .store
        .read(hdr.oid, &mut iocb, &mut req.data[..len], hdr.offset);
    if ret.is_ok() {
        req.rsp.data_length = hdr.data_length;
        req.rsp.copies = ctx.cluster.read().unwrap().copies as u32;
    }
    let _ = ctx.store.close(hdr.oid, &mut iocb);
    ret
}

/// Writes a body range, journaled for VDI inode objects so a crash cannot
/// tear the metadata.
fn do_write_obj(ctx: &StorageCtx, iocb: &mut Iocb, hdr: &SdReq, data: &[u8]) -> SdResult<()> {
    let oid = hdr.oid;
    if obj::is_vdi_obj(oid) {
        let target = ctx.store.obj_file(iocb.epoch, oid);
        let jd = journal::begin(data, hdr.offset, &target, &ctx.jrnl_path)
            .map_err(|_| SdError::Eio)?;
        let ret = ctx.store.write(oid, iocb, data, hdr.offset);
        let _ = jd.end();
        ret
    } else {
        ctx.store.write(oid, iocb, data, hdr.offset)
    }
}

fn store_write_obj(ctx: &StorageCtx, req: &mut Request) -> SdResult<()> {
    let hdr = req.hdr;
    let mut iocb = Iocb::new(hdr.epoch, hdr.flags);
    ctx.store.open(hdr.oid, &mut iocb, false)?;
    let ret = do_write_obj(ctx, &mut iocb, &hdr, &req.data[..hdr.data_length as usize]);
    let _ = ctx.store.close(hdr.oid, &mut iocb);
    ret
}

fn store_create_and_write_obj(ctx: &StorageCtx, req: &mut Request) -> SdResult<()> {
    let hdr = req.hdr;
    let mut iocb = Iocb::new(hdr.epoch, hdr.flags);
    ctx.store.open(hdr.oid, &mut iocb, true)?;

    let ret = if hdr.flags & SD_FLAG_CMD_COW != 0 {
        debug!("{:x}, {:x}", hdr.oid, hdr.cow_oid);
        cow_write(ctx, req, &mut iocb)
    } else {
        do_write_obj(
            ctx,
            &mut iocb,
            &hdr,
            &req.data[..hdr.data_length as usize],
        )
    };
    if ret.is_ok() {
        ctx.objlist.insert(hdr.oid);
    }
    let _ = ctx.store.close(hdr.oid, &mut iocb);
    ret
}

/// Copy-on-write creation: the new object starts as a copy of its parent,
/// with the request payload spliced in.
fn cow_write(ctx: &StorageCtx, req: &mut Request, iocb: &mut Iocb) -> SdResult<()> {
    let hdr = req.hdr;
    let mut buf = AlignedBuf::zeroed(obj::SD_DATA_OBJ_SIZE as usize);
    if hdr.data_length as u64 != obj::SD_DATA_OBJ_SIZE {
        read_copy_from_cluster(ctx, hdr.epoch, hdr.cow_oid, &mut buf).inspect_err(|_| {
            error!("failed to read cow object {:x}", hdr.cow_oid);
        })?;
    }
    let off = hdr.offset as usize;
    let len = hdr.data_length as usize;
    buf[off..off + len].copy_from_slice(&req.data[..len]);

    let mut cow_hdr = hdr;
    cow_hdr.offset = 0;
    cow_hdr.data_length = obj::SD_DATA_OBJ_SIZE as u32;
    do_write_obj(ctx, iocb, &cow_hdr, &buf)
}

fn store_remove_obj(ctx: &StorageCtx, req: &mut Request) -> SdResult<()> {
    let path = ctx.store.obj_file(req.hdr.epoch, req.hdr.oid);
    match fs::remove_file(&path) {
        Ok(()) => {
            ctx.objlist.remove(req.hdr.oid);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SdError::NoObj),
        Err(e) => {
            error!("{e}");
            Err(SdError::Eio)
        }
    }
}

/// Tells whether the request skips the object cache.
fn bypass_object_cache(ctx: &StorageCtx, hdr: &SdReq) -> bool {
    let oid = hdr.oid;
    if hdr.flags & SD_FLAG_CMD_CACHE == 0 {
        let (vid, idx) = cache::cache_index(oid);
        if !ctx.cache.find(vid, false) {
            return true;
        }
        if hdr.flags & SD_FLAG_CMD_WRITE != 0 {
            // a write to an uncached VID invalidates what the cache holds
            ctx.cache.flush_and_delete(vid);
            return true;
        }
        return !ctx.cache.lookup(vid, idx, false);
    }
    // vmstate and attribute objects are never cached
    obj::is_vmstate_obj(oid) || obj::is_vdi_attr_obj(oid)
}

fn handle_gateway_request(ctx: &StorageCtx, req: &mut Request) -> SdResult<()> {
    let (vid, idx) = cache::cache_index(req.hdr.oid);
    if !ctx.cache.find(vid, true) {
        // no cache backing this VID: behave as a bypass
        return if req.hdr.flags & SD_FLAG_CMD_WRITE != 0 {
            forward_write_obj_req(ctx, req)
        } else {
            forward_read_obj_req(ctx, req)
        };
    }
    let create = req.hdr.opcode == SD_OP_CREATE_AND_WRITE_OBJ;
    if !ctx.cache.lookup(vid, idx, create) {
        ctx.cache.pull(vid, idx)?;
    }
    ctx.cache.rw(vid, idx, req)
}

fn peer_key(vnode: &ring::VNode, epoch: u32) -> PeerKey {
    PeerKey {
        addr: vnode.addr,
        port: vnode.port,
        node_idx: vnode.node_idx,
        epoch,
    }
}

/// Forwards a read to a replica, serving it locally when this node holds
/// one of the copies.
pub fn forward_read_obj_req(ctx: &StorageCtx, req: &mut Request) -> SdResult<()> {
    let view = ctx.view();
    let mut hdr = req.hdr;
    hdr.flags |= SD_FLAG_CMD_IO_LOCAL;
    let copies = view.effective_copies(hdr.copies);
    let oid = hdr.oid;

    for i in 0..copies {
        let n = ring::obj_to_sheep(&view.vnodes, oid, i);
        let vnode = &view.vnodes[n];
        if view.is_myself(vnode.addr, vnode.port) {
            return do_local_io(ctx, req, hdr.epoch);
        }
    }

    let n = ring::obj_to_sheep(&view.vnodes, oid, 0);
    let key = peer_key(&view.vnodes[n], hdr.epoch);
    let mut stream = ctx.conn.get(key).map_err(|_| SdError::NetworkError)?;
    match proto::exec_req(&mut stream, &hdr, &[], &mut req.data) {
        Ok((rsp, _)) => {
            ctx.conn.put(key, stream);
            req.rsp = rsp;
            SdError::from_wire(rsp.result)
        }
        // dropping the stream evicts the broken connection
        Err(_) => Err(SdError::NetworkError),
    }
}

/// Forwards a write to every replica and collects one response per peer.
///
/// Peers are polled as a set with one response buffer: each poll round
/// handles the first ready peer, compacts the set and continues, so the
/// socket timeout applies to the slowest lagging replica. The final result
/// is success iff every replica succeeded; otherwise the first non-success
/// observed.
pub fn forward_write_obj_req(ctx: &StorageCtx, req: &mut Request) -> SdResult<()> {
    let view = ctx.view();
    let mut hdr = req.hdr;
    hdr.flags |= SD_FLAG_CMD_IO_LOCAL;
    let copies = view.effective_copies(hdr.copies);
    let oid = hdr.oid;
    debug!("{oid:x}");

    let mut local = false;
    let mut peers: Vec<(PeerKey, TcpStream)> = Vec::new();
    for i in 0..copies {
        let n = ring::obj_to_sheep(&view.vnodes, oid, i);
        let vnode = &view.vnodes[n];
        if view.is_myself(vnode.addr, vnode.port) {
            local = true;
            continue;
        }
        let key = peer_key(vnode, hdr.epoch);
        let mut stream = ctx.conn.get(key).map_err(|e| {
            error!("failed to connect to {}:{}: {e}", vnode.addr, vnode.port);
            SdError::NetworkError
        })?;
        let wlen = hdr.data_length as usize;
        if proto::send_req(&mut stream, &hdr, &req.data[..wlen]).is_err() {
            // the stream and every already-sent peer are dropped: evicted
            return Err(SdError::NetworkError);
        }
        peers.push((key, stream));
    }

    if local {
        let ret = do_local_io(ctx, req, hdr.epoch);
        req.rsp.result = SdError::wire_result(ret);
        if peers.is_empty() || ret.is_err() {
            return ret;
        }
    }

    let mut first_err = None;
    while !peers.is_empty() {
        let mut pfds: Vec<libc::pollfd> = peers
            .iter()
            .map(|(_, stream)| libc::pollfd {
                fd: stream.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        let ret = unsafe {
            libc::poll(
                pfds.as_mut_ptr(),
                pfds.len() as libc::nfds_t,
                DEFAULT_SOCKET_TIMEOUT.as_millis() as i32,
            )
        };
        if ret < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(SdError::Eio);
        }
        if ret == 0 {
            error!("timeout waiting for write responses, {} peers left", peers.len());
            // every remaining peer is dropped: evicted
            return Err(SdError::NetworkError);
        }

        let handled = libc::POLLIN | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
        let Some(i) = pfds.iter().position(|p| p.revents & handled != 0) else {
            continue;
        };
        let revents = pfds[i].revents;
        let (key, mut stream) = peers.remove(i);
        if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            first_err.get_or_insert(SdError::NetworkError);
            continue;
        }
        let mut no_body = [0u8; 0];
        match proto::recv_rsp(&mut stream, &mut no_body) {
            Ok((rsp, _)) => {
                if let Err(e) = SdError::from_wire(rsp.result) {
                    error!("fail {:x}", rsp.result);
                    first_err.get_or_insert(e);
                }
                ctx.conn.put(key, stream);
            }
            Err(e) => {
                error!("failed to read a response: {e}");
                first_err.get_or_insert(SdError::NetworkError);
            }
        }
        debug!("{oid:x} {} peers left", peers.len());
    }

    match first_err {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// Repairs replica divergence: fetches the authoritative body through the
/// read path, writes it back to every replica, then restores the request.
///
/// Idempotent with respect to the request: header, response and data buffer
/// are backed up and restored around the repair.
fn fix_object_consistency(ctx: &StorageCtx, req: &mut Request) -> SdResult<()> {
    let hdr_bak = req.hdr;
    let rsp_bak = req.rsp;
    let oid = hdr_bak.oid;
    let data_length = obj::obj_size(oid) as u32;

    let mut data_bak = AlignedBuf::zeroed(data_length as usize);
    std::mem::swap(&mut req.data, &mut data_bak);

    req.hdr.offset = 0;
    req.hdr.data_length = data_length;
    req.hdr.opcode = SD_OP_READ_OBJ;
    req.hdr.flags = 0;
    let ret = forward_read_obj_req(ctx, req)
        .inspect_err(|e| error!("failed to read object {oid:x}: {e}"))
        .and_then(|()| {
            req.hdr.opcode = SD_OP_WRITE_OBJ;
            req.hdr.flags = SD_FLAG_CMD_WRITE;
            req.hdr.oid = oid;
            forward_write_obj_req(ctx, req)
                .inspect_err(|e| error!("failed to write object {oid:x}: {e}"))
        });

    std::mem::swap(&mut req.data, &mut data_bak);
    req.hdr = hdr_bak;
    req.rsp = rsp_bak;
    ret
}

/// Reads one copy of an object from anywhere in the cluster, trying every
/// node in ring order.
///
/// Peers reporting a stale membership view are skipped; the node list is
/// being updated and another replica will serve the read.
pub fn read_copy_from_cluster(
    ctx: &StorageCtx,
    epoch: u32,
    oid: u64,
    buf: &mut [u8],
) -> SdResult<()> {
    let view = ctx.view();
    for i in 0..view.nodes.len() {
        let n = ring::obj_to_sheep(&view.vnodes, oid, i);
        let vnode = &view.vnodes[n];

        if view.is_myself(vnode.addr, vnode.port) {
            let mut iocb = Iocb::at_epoch(epoch);
            if ctx.store.open(oid, &mut iocb, false).is_err() {
                continue;
            }
            let ret = ctx.store.read(oid, &mut iocb, buf, 0);
            let _ = ctx.store.close(oid, &mut iocb);
            if ret.is_ok() {
                return Ok(());
            }
            continue;
        }

        let Ok(mut stream) = proto::connect_to(vnode.sockaddr()) else {
            continue;
        };
        let mut hdr = SdReq::new(SD_OP_READ_OBJ);
        hdr.oid = oid;
        hdr.epoch = epoch;
        hdr.flags = SD_FLAG_CMD_IO_LOCAL;
        hdr.data_length = buf.len() as u32;
        let Ok((rsp, _)) = proto::exec_req(&mut stream, &hdr, &[], buf) else {
            continue;
        };
        if SdError::from_wire(rsp.result).is_ok() {
            return Ok(());
        }
        // OldNodeVer/NewNodeVer: wait for the node list update; any other
        // failure likewise moves to the next candidate
    }
    Err(SdError::Eio)
}

/// Writes an object through the local I/O path, synthesizing the request.
pub fn write_object_local(
    ctx: &StorageCtx,
    oid: u64,
    data: &[u8],
    offset: u64,
    flags: u16,
    copies: u32,
    epoch: u32,
    create: bool,
) -> SdResult<()> {
    let opcode = if create {
        SD_OP_CREATE_AND_WRITE_OBJ
    } else {
        SD_OP_WRITE_OBJ
    };
    let mut hdr = SdReq::new(opcode);
    hdr.oid = oid;
    hdr.copies = copies;
    hdr.flags = flags | SD_FLAG_CMD_WRITE;
    hdr.offset = offset;
    hdr.data_length = data.len() as u32;
    let mut req = Request::with_payload(hdr, data);
    do_local_io(ctx, &mut req, epoch)
}

/// Reads an object through the local I/O path. No body length is reported
/// back to the caller past the copy into `data`.
pub fn read_object_local(
    ctx: &StorageCtx,
    oid: u64,
    data: &mut [u8],
    offset: u64,
    copies: u32,
    epoch: u32,
) -> SdResult<()> {
    let mut hdr = SdReq::new(SD_OP_READ_OBJ);
    hdr.oid = oid;
    hdr.copies = copies;
    hdr.offset = offset;
    hdr.data_length = data.len() as u32;
    let mut req = Request::new(hdr);
    do_local_io(ctx, &mut req, epoch)?;
    data.copy_from_slice(&req.data[..data.len()]);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ctx::StorageCtx;
    use crate::ring::Node;
    use std::net::IpAddr;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn me() -> Node {
        Node {
            addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 7000,
            node_idx: 0,
            zone: 0,
        }
    }

    fn single_node_ctx(dir: &std::path::Path) -> Arc<StorageCtx> {
        let ctx = StorageCtx::init(dir, me(), 1).unwrap();
        ctx.update_epoch(1, vec![me()]).unwrap();
        ctx
    }

    fn io_local_req(opcode: u8, oid: u64, flags: u16, payload: &[u8]) -> Request {
        let mut hdr = SdReq::new(opcode);
        hdr.oid = oid;
        hdr.epoch = 1;
        hdr.flags = flags | SD_FLAG_CMD_IO_LOCAL;
        hdr.data_length = payload.len() as u32;
        Request::with_payload(hdr, payload)
    }

    #[test]
    fn create_read_remove_locally() {
        let dir = tempdir().unwrap();
        let ctx = single_node_ctx(dir.path());
        let oid = obj::vid_to_data_oid(0xab, 1);

        let mut req = io_local_req(
            SD_OP_CREATE_AND_WRITE_OBJ,
            oid,
            SD_FLAG_CMD_WRITE,
            b"payload",
        );
        do_io_request(&ctx, &mut req);
        assert_eq!(req.rsp.result, 0);
        assert_eq!(ctx.objlist.list(), vec![oid]);

        let mut hdr = SdReq::new(SD_OP_READ_OBJ);
        hdr.oid = oid;
        hdr.epoch = 1;
        hdr.flags = SD_FLAG_CMD_IO_LOCAL;
        hdr.data_length = 7;
        let mut req = Request::new(hdr);
        do_io_request(&ctx, &mut req);
        assert_eq!(req.rsp.result, 0);
        assert_eq!(&req.data[..7], b"payload");
        assert_eq!(req.rsp.data_length, 7);

        let mut req = io_local_req(SD_OP_REMOVE_OBJ, oid, 0, &[]);
        do_io_request(&ctx, &mut req);
        assert_eq!(req.rsp.result, 0);

        let mut req = io_local_req(SD_OP_READ_OBJ, oid, 0, &[]);
        do_io_request(&ctx, &mut req);
        assert_eq!(req.rsp.result, SdError::NoObj.to_wire());
    }

    #[test]
    fn forward_serves_single_node_cluster_locally() {
        let dir = tempdir().unwrap();
        let ctx = single_node_ctx(dir.path());
        let oid = obj::vid_to_data_oid(0xcd, 2);

        // gateway path: no IO_LOCAL flag, replica 0 is this node
        let mut hdr = SdReq::new(SD_OP_CREATE_AND_WRITE_OBJ);
        hdr.oid = oid;
        hdr.epoch = 1;
        hdr.flags = SD_FLAG_CMD_WRITE;
        hdr.data_length = 4;
        let mut req = Request::with_payload(hdr, b"abcd");
        do_io_request(&ctx, &mut req);
        assert_eq!(req.rsp.result, 0);

        let mut hdr = SdReq::new(SD_OP_READ_OBJ);
        hdr.oid = oid;
        hdr.epoch = 1;
        hdr.data_length = 4;
        let mut req = Request::new(hdr);
        do_io_request(&ctx, &mut req);
        assert_eq!(req.rsp.result, 0);
        assert_eq!(&req.data[..4], b"abcd");
    }

    #[test]
    fn local_roundtrip_helpers() {
        let dir = tempdir().unwrap();
        let ctx = single_node_ctx(dir.path());
        let oid = obj::vid_to_data_oid(0xef, 0);

        write_object_local(&ctx, oid, b"hello", 0, 0, 1, 1, true).unwrap();
        let mut buf = [0; 5];
        read_object_local(&ctx, oid, &mut buf, 0, 1, 1).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn vdi_write_journaled() {
        let dir = tempdir().unwrap();
        let ctx = single_node_ctx(dir.path());
        let oid = obj::vid_to_vdi_oid(0x42);

        write_object_local(&ctx, oid, b"inode body", 0, 0, 1, 1, true).unwrap();
        // journal records retired after the guarded write
        assert_eq!(fs::read_dir(&ctx.jrnl_path).unwrap().count(), 0);
        let mut buf = [0; 10];
        read_object_local(&ctx, oid, &mut buf, 0, 1, 1).unwrap();
        assert_eq!(&buf, b"inode body");
    }

    #[test]
    fn bypass_rules() {
        let dir = tempdir().unwrap();
        let ctx = single_node_ctx(dir.path());

        // uncached VID: reads and writes bypass
        let mut hdr = SdReq::new(SD_OP_READ_OBJ);
        hdr.oid = obj::vid_to_data_oid(1, 0);
        assert!(bypass_object_cache(&ctx, &hdr));
        hdr.flags = SD_FLAG_CMD_WRITE;
        assert!(bypass_object_cache(&ctx, &hdr));

        // vmstate and attr objects always bypass, even with CMD_CACHE
        hdr.flags = SD_FLAG_CMD_CACHE;
        hdr.oid = obj::VMSTATE_BIT | 7;
        assert!(bypass_object_cache(&ctx, &hdr));
        hdr.oid = obj::VDI_ATTR_BIT | 7;
        assert!(bypass_object_cache(&ctx, &hdr));

        // CMD_CACHE on a data object reaches the cache path
        hdr.oid = obj::vid_to_data_oid(1, 0);
        assert!(!bypass_object_cache(&ctx, &hdr));
    }
}
