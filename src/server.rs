//! Request acceptance and dispatch.
//!
//! Every client connection gets a reader thread that decodes requests and
//! hands them to the gateway worker pool. Before a gateway I/O request is
//! queued, the recovery coupling runs: a request against an OID that is
//! still waiting for recovery parks until the blocking prefix drains, and
//! in-flight OIDs are tracked so recovery pauses instead of racing a
//! foreground access.

use crate::ctx::StorageCtx;
use crate::gateway;
use crate::gateway::Request;
use crate::proto;
use crate::proto::SD_FLAG_CMD_IO_LOCAL;
use crate::proto::SD_FLAG_CMD_WRITE;
use crate::proto::SD_OP_CREATE_AND_WRITE_OBJ;
use crate::proto::SD_OP_GET_EPOCH;
use crate::proto::SD_OP_GET_OBJ_LIST;
use crate::proto::SD_OP_READ_OBJ;
use crate::proto::SD_OP_REMOVE_OBJ;
use crate::proto::SD_OP_TRACE;
use crate::proto::SD_OP_TRACE_CAT;
use crate::proto::SD_OP_WRITE_OBJ;
use crate::proto::SD_REQ_SIZE;
use crate::proto::SdError;
use crate::proto::SdReq;
use crate::proto::SdRsp;
use crate::recovery;
use crate::util::AlignedBuf;
use log::debug;
use log::error;
use log::info;
use std::io;
use std::io::Read;
use std::io::Write;
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

/// A finished request: response header plus body bytes.
pub struct Reply {
    pub rsp: SdRsp,
    pub body: Vec<u8>,
}

/// A request parked until recovery releases its OID.
pub struct PendingReq {
    pub hdr: SdReq,
    pub data: AlignedBuf,
    pub reply: mpsc::Sender<Reply>,
}

/// Accept loop: one reader thread per connection.
pub fn listen(ctx: Arc<StorageCtx>, listener: TcpListener) -> io::Result<()> {
    info!("listening on {}", listener.local_addr()?);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let ctx = Arc::clone(&ctx);
                thread::Builder::new()
                    .name("client".to_string())
                    .spawn(move || client_handler(ctx, stream))?;
            }
            Err(e) => error!("accept failed: {e}"),
        }
    }
    Ok(())
}

/// Reads requests off one connection and writes the replies back, in
/// order.
fn client_handler(ctx: Arc<StorageCtx>, mut stream: TcpStream) {
    loop {
        let mut hdr_buf = [0; SD_REQ_SIZE];
        if stream.read_exact(&mut hdr_buf).is_err() {
            break;
        }
        let hdr = SdReq::decode(&hdr_buf);
        let mut data = AlignedBuf::zeroed((hdr.data_length as usize).max(1));
        if hdr.flags & SD_FLAG_CMD_WRITE != 0
            && hdr.data_length > 0
            && stream
                .read_exact(&mut data[..hdr.data_length as usize])
                .is_err()
        {
            break;
        }

        let (tx, rx) = mpsc::channel();
        dispatch(&ctx, hdr, data, tx);
        let Ok(reply) = rx.recv() else { break };
        if write_reply(&mut stream, &reply).is_err() {
            break;
        }
    }
    debug!("connection closed");
}

fn write_reply(stream: &mut TcpStream, reply: &Reply) -> io::Result<()> {
    stream.write_all(&reply.rsp.encode())?;
    if !reply.body.is_empty() {
        stream.write_all(&reply.body)?;
    }
    stream.flush()
}

fn is_obj_op(opcode: u8) -> bool {
    matches!(
        opcode,
        SD_OP_READ_OBJ | SD_OP_WRITE_OBJ | SD_OP_CREATE_AND_WRITE_OBJ | SD_OP_REMOVE_OBJ
    )
}

fn op_name(opcode: u8) -> &'static str {
    match opcode {
        SD_OP_READ_OBJ => "read_obj",
        SD_OP_WRITE_OBJ => "write_obj",
        SD_OP_CREATE_AND_WRITE_OBJ => "create_and_write_obj",
        SD_OP_REMOVE_OBJ => "remove_obj",
        SD_OP_GET_OBJ_LIST => "get_obj_list",
        SD_OP_GET_EPOCH => "get_epoch",
        SD_OP_TRACE => "trace",
        SD_OP_TRACE_CAT => "trace_cat",
        _ => "unknown",
    }
}

/// Queues a request onto the gateway pool, or parks it when its OID is
/// still waiting for recovery.
pub fn dispatch(ctx: &Arc<StorageCtx>, hdr: SdReq, data: AlignedBuf, reply: mpsc::Sender<Reply>) {
    let gateway_io = is_obj_op(hdr.opcode) && hdr.flags & SD_FLAG_CMD_IO_LOCAL == 0;
    if gateway_io && recovery::is_recoverying_oid(ctx, hdr.oid) {
        debug!("request for {:x} waits for recovery", hdr.oid);
        ctx.pending.lock().unwrap().push(PendingReq { hdr, data, reply });
        // recovery may have completed since the check; make sure the
        // request is not parked forever
        if !recovery::node_in_recovery(ctx) {
            resume_pending_requests(ctx);
        }
        return;
    }
    let ctx2 = Arc::clone(ctx);
    ctx.io_wqueue
        .queue(move || exec_request(&ctx2, hdr, data, reply));
}

/// Requeues every parked request; each re-runs the recovery coupling on a
/// fresh worker.
pub fn resume_pending_requests(ctx: &Arc<StorageCtx>) {
    let drained: Vec<PendingReq> = {
        let mut pending = ctx.pending.lock().unwrap();
        pending.drain(..).collect()
    };
    for preq in drained {
        let ctx2 = Arc::clone(ctx);
        ctx.io_wqueue
            .queue(move || dispatch(&ctx2, preq.hdr, preq.data, preq.reply));
    }
}

/// Executes one request on a gateway worker.
fn exec_request(ctx: &Arc<StorageCtx>, hdr: SdReq, data: AlignedBuf, reply: mpsc::Sender<Reply>) {
    let oid = hdr.oid;
    let track = is_obj_op(hdr.opcode) && oid != 0;
    if track {
        *ctx.inflight.lock().unwrap().entry(oid).or_insert(0) += 1;
    }
    let trace_entry = ctx.tracer.enter();

    let mut req = Request::with_buffer(hdr, data);
    let body = match hdr.opcode {
        SD_OP_GET_OBJ_LIST => handle_get_obj_list(ctx, &mut req),
        SD_OP_GET_EPOCH => handle_get_epoch(ctx, &mut req),
        SD_OP_TRACE => {
            ctx.tracer.set_enabled(hdr.data_length != 0);
            Vec::new()
        }
        SD_OP_TRACE_CAT => handle_trace_cat(ctx, &mut req),
        _ => {
            // divergent replicas are repaired on the first read after an
            // epoch change, while recovery is still running
            if hdr.opcode == SD_OP_READ_OBJ && hdr.flags & SD_FLAG_CMD_IO_LOCAL == 0 {
                let view = ctx.view();
                req.check_consistency = view.recovered_epoch < view.epoch;
            }
            gateway::do_io_request(ctx, &mut req);
            let len = (req.rsp.data_length as usize).min(req.data.len());
            req.data[..len].to_vec()
        }
    };

    if let Some(entry) = trace_entry {
        ctx.tracer.record(hdr.opcode, 0, op_name(hdr.opcode), entry);
    }
    if track {
        let mut inflight = ctx.inflight.lock().unwrap();
        if let Some(count) = inflight.get_mut(&oid) {
            *count -= 1;
            if *count == 0 {
                inflight.remove(&oid);
            }
        }
        drop(inflight);
        // a suspended recovery task may be waiting on this OID
        recovery::resume_recovery_work(ctx);
    }

    let _ = reply.send(Reply { rsp: req.rsp, body });
}

fn handle_get_obj_list(ctx: &StorageCtx, req: &mut Request) -> Vec<u8> {
    let list = ctx.objlist.list();
    let max = req.hdr.data_length as usize / 8;
    let mut body = Vec::with_capacity(list.len().min(max) * 8);
    for oid in list.iter().take(max) {
        body.extend_from_slice(&oid.to_le_bytes());
    }
    req.rsp.data_length = body.len() as u32;
    body
}

fn handle_get_epoch(ctx: &StorageCtx, req: &mut Request) -> Vec<u8> {
    match ctx.epoch_log.read_raw(req.hdr.tgt_epoch) {
        Ok(bytes) => {
            let len = bytes.len().min(req.hdr.data_length as usize);
            req.rsp.data_length = len as u32;
            bytes[..len].to_vec()
        }
        Err(e) => {
            req.rsp.result = e.to_wire();
            Vec::new()
        }
    }
}

fn handle_trace_cat(ctx: &StorageCtx, req: &mut Request) -> Vec<u8> {
    let mut body = ctx.tracer.cat();
    body.truncate(req.hdr.data_length as usize);
    req.rsp.data_length = body.len() as u32;
    body
}
