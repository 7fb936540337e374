//! Epoch-driven object recovery.
//!
//! When a new epoch is opened, every object whose replica set changed must
//! be pulled onto its new homes. The engine gathers the object lists of the
//! previous epoch's nodes, screens them down to the OIDs this node must now
//! hold, and recovers them one by one in FNV-hash order: hard-linking from
//! the previous epoch's directory when this node already holds a copy,
//! fetching from the best peer otherwise. Foreground requests hitting an
//! OID that is still queued promote it to the head of the line and wait.

use crate::ctx::StorageCtx;
use crate::proto;
use crate::proto::SD_FLAG_CMD_IO_LOCAL;
use crate::proto::SD_FLAG_CMD_RECOVERY;
use crate::proto::SD_OP_GET_OBJ_LIST;
use crate::proto::SD_OP_READ_OBJ;
use crate::proto::SdError;
use crate::proto::SdReq;
use crate::proto::SdResult;
use crate::ring;
use crate::ring::Node;
use crate::ring::VNode;
use crate::server;
use crate::store::Iocb;
use crate::util::AlignedBuf;
use log::debug;
use log::error;
use log::info;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Attempts per node when fetching its object list.
const MAX_RETRY_CNT: u32 = 6;
/// Pause between object-list fetch attempts.
const OBJ_LIST_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Pause before reattempting an object whose sources reported a stale view.
const RECOVER_RETRY_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RwState {
    Init,
    Run,
}

/// Membership of the epoch being recovered to and the one before it.
pub struct EpochView {
    pub old_nodes: Vec<Node>,
    pub cur_nodes: Vec<Node>,
    pub old_vnodes: Vec<VNode>,
    pub cur_vnodes: Vec<VNode>,
}

/// The live recovery task.
pub struct RecoveryWork {
    pub state: RwState,
    pub epoch: u32,
    /// Index of the next OID to process.
    pub done: usize,
    /// Length of the prioritized prefix foreground requests wait on.
    pub nr_blocking: usize,
    /// Planned OIDs, sorted by [`ring::obj_cmp`].
    pub oids: Vec<u64>,
    /// Set when the current OID must be reattempted after a pause.
    pub retry: bool,
    pub view: Arc<EpochView>,
}

/// Recovery bookkeeping: the live task, at most one queued successor, and
/// whether the live task paused for a busy object.
///
/// A new epoch arriving while recovery is in flight *replaces* any queued
/// successor; only the newest epoch's view is correct.
#[derive(Default)]
pub struct RecoveryState {
    pub current: Option<RecoveryWork>,
    pub next: Option<RecoveryWork>,
    pub suspended: bool,
}

/// Serial-number comparison of epochs.
fn before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn next_queued(ctx: &StorageCtx) -> bool {
    ctx.recovery.lock().unwrap().next.is_some()
}

/// Tells whether a recovery task is live.
pub fn node_in_recovery(ctx: &StorageCtx) -> bool {
    ctx.recovery.lock().unwrap().current.is_some()
}

/// Tells whether a foreground request is in flight against the OID.
pub fn is_access_to_busy_objects(ctx: &StorageCtx, oid: u64) -> bool {
    ctx.inflight.lock().unwrap().contains_key(&oid)
}

/// Kicks off recovery towards `epoch`.
pub fn start_recovery(ctx: &Arc<StorageCtx>, epoch: u32) -> SdResult<()> {
    let view = init_epoch_view(ctx, epoch)?;
    let rw = RecoveryWork {
        state: RwState::Init,
        epoch,
        done: 0,
        nr_blocking: 0,
        oids: Vec::new(),
        retry: false,
        view: Arc::new(view),
    };

    let _ = ctx.store.begin_recover(&Iocb::at_epoch(epoch));

    let mut state = ctx.recovery.lock().unwrap();
    if state.current.is_some() {
        if state.next.is_some() {
            debug!("skip the previous epoch recovery");
        }
        state.next = Some(rw);
    } else {
        state.current = Some(rw);
        drop(state);
        queue_recovery_work(ctx);
    }
    Ok(())
}

/// Reads the node lists of `epoch` and its predecessor from the epoch log.
fn init_epoch_view(ctx: &StorageCtx, epoch: u32) -> SdResult<EpochView> {
    let cur_nodes = ctx.epoch_log.read(epoch).inspect_err(|_| {
        error!("failed to read epoch log for epoch {epoch}");
    })?;
    let old_nodes = ctx.epoch_log.read(epoch.wrapping_sub(1)).inspect_err(|_| {
        error!("failed to read epoch log for epoch {}", epoch.wrapping_sub(1));
    })?;
    let old_vnodes = ring::nodes_to_vnodes(&old_nodes);
    let cur_vnodes = ring::nodes_to_vnodes(&cur_nodes);
    Ok(EpochView {
        old_nodes,
        cur_nodes,
        old_vnodes,
        cur_vnodes,
    })
}

fn queue_recovery_work(ctx: &Arc<StorageCtx>) {
    let ctx2 = Arc::clone(ctx);
    ctx.recovery_wqueue.queue(move || run_recovery_work(ctx2));
}

/// One scheduling round of the recovery worker: fill the object list when
/// the task is fresh, otherwise recover the OID at the head.
fn run_recovery_work(ctx: Arc<StorageCtx>) {
    enum Step {
        Fill { epoch: u32, view: Arc<EpochView> },
        Recover { epoch: u32, view: Arc<EpochView>, oid: u64 },
    }

    let step = {
        let state = ctx.recovery.lock().unwrap();
        match state.current.as_ref() {
            None => return,
            Some(rw) => match rw.state {
                RwState::Init => Step::Fill {
                    epoch: rw.epoch,
                    view: Arc::clone(&rw.view),
                },
                RwState::Run => {
                    let Some(&oid) = rw.oids.get(rw.done) else {
                        return;
                    };
                    Step::Recover {
                        epoch: rw.epoch,
                        view: Arc::clone(&rw.view),
                        oid,
                    }
                }
            },
        }
    };

    match step {
        Step::Fill { epoch, view } => {
            let oids = fill_obj_list(&ctx, epoch, &view);
            let mut state = ctx.recovery.lock().unwrap();
            if let Some(rw) = state.current.as_mut() {
                rw.oids = oids;
            }
            do_recover_main(&ctx, &mut state);
        }
        Step::Recover { epoch, view, oid } => {
            let retry = recover_object(&ctx, epoch, &view, oid);
            let mut state = ctx.recovery.lock().unwrap();
            if retry {
                if let Some(rw) = state.current.as_mut() {
                    rw.retry = true;
                }
            }
            do_recover_main(&ctx, &mut state);
        }
    }
}

/// Advances the live task after a worker round: schedule the next OID,
/// arm the retry timer, or finish and dequeue the successor.
fn do_recover_main(ctx: &Arc<StorageCtx>, state: &mut RecoveryState) {
    let next_queued = state.next.is_some();
    let (retry, done, count) = {
        let Some(rw) = state.current.as_mut() else {
            return;
        };
        match rw.state {
            RwState::Init => rw.state = RwState::Run,
            RwState::Run if !rw.retry => {
                rw.done += 1;
                rw.nr_blocking = rw.nr_blocking.saturating_sub(1);
            }
            RwState::Run => {}
        }
        (rw.retry, rw.done, rw.oids.len())
    };

    if retry && !next_queued {
        if let Some(rw) = state.current.as_mut() {
            rw.retry = false;
        }
        let ctx2 = Arc::clone(ctx);
        ctx.timers
            .add_timer(RECOVER_RETRY_INTERVAL, move || recover_timer(&ctx2));
        return;
    }

    if done < count && !next_queued {
        let oid = state.current.as_ref().unwrap().oids[done];
        if is_access_to_busy_objects(ctx, oid) {
            state.suspended = true;
            return;
        }
        server::resume_pending_requests(ctx);
        queue_recovery_work(ctx);
        return;
    }

    let epoch = state.current.as_ref().unwrap().epoch;
    info!("recovery complete: new epoch {epoch}");
    state.current = None;
    ctx.cluster.write().unwrap().recovered_epoch = epoch;

    if let Some(next) = state.next.take() {
        state.current = Some(next);
        queue_recovery_work(ctx);
    } else {
        let sys_epoch = ctx.cluster.read().unwrap().epoch;
        let _ = ctx.store.end_recover(&Iocb::at_epoch(sys_epoch));
    }
    server::resume_pending_requests(ctx);
}

/// Fired when the retry pause elapsed: resume unless the head OID is being
/// accessed, in which case the task suspends until the access completes.
fn recover_timer(ctx: &Arc<StorageCtx>) {
    let mut state = ctx.recovery.lock().unwrap();
    let Some(rw) = state.current.as_ref() else {
        return;
    };
    if let Some(&oid) = rw.oids.get(rw.done)
        && is_access_to_busy_objects(ctx, oid)
    {
        state.suspended = true;
        return;
    }
    drop(state);
    queue_recovery_work(ctx);
}

/// Resumes a recovery task that paused for a busy OID, once that OID is no
/// longer accessed.
pub fn resume_recovery_work(ctx: &Arc<StorageCtx>) {
    let mut state = ctx.recovery.lock().unwrap();
    if !state.suspended {
        return;
    }
    if let Some(rw) = state.current.as_ref()
        && let Some(&oid) = rw.oids.get(rw.done)
        && is_access_to_busy_objects(ctx, oid)
    {
        return;
    }
    state.suspended = false;
    drop(state);
    queue_recovery_work(ctx);
}

/// Tells whether a node joined between the two epochs of the view.
fn newly_joined(node: &Node, view: &EpochView) -> bool {
    !view.old_nodes.contains(node)
}

/// Gathers, screens and merges the object lists of every node that already
/// existed at the previous epoch.
fn fill_obj_list(ctx: &StorageCtx, epoch: u32, view: &EpochView) -> Vec<u64> {
    let (me, copies_conf) = {
        let cluster = ctx.cluster.read().unwrap();
        (cluster.me, cluster.copies)
    };
    let nr_objs = ring::get_max_copies(&view.cur_nodes, copies_conf);
    let mut oids = Vec::new();

    'nodes: for node in &view.cur_nodes {
        if newly_joined(node, view) {
            // new node doesn't have a list file
            continue;
        }
        let mut retry_cnt = 0;
        let list = loop {
            match request_obj_list(node, epoch) {
                Some(list) => break list,
                None => {
                    retry_cnt += 1;
                    if retry_cnt > MAX_RETRY_CNT {
                        error!("failed to get object list from {}:{}", node.addr, node.port);
                        error!("some objects may be lost");
                        continue 'nodes;
                    }
                    if next_queued(ctx) {
                        debug!("go to the next recovery");
                        break 'nodes;
                    }
                    debug!("trying to get object list again");
                    thread::sleep(OBJ_LIST_RETRY_INTERVAL);
                }
            }
        };
        let screened = screen_obj_list(view, nr_objs, &me, &list);
        if !screened.is_empty() {
            merge_objlist(&mut oids, &screened);
        }
    }
    debug!("{} objects to recover", oids.len());
    oids
}

/// Fetches the object list a node stored at the previous epoch.
fn request_obj_list(node: &Node, epoch: u32) -> Option<Vec<u64>> {
    debug!("{} {}", node.addr, node.port);
    let mut stream = proto::connect_to(node.sockaddr())
        .inspect_err(|e| error!("{} {}: {e}", node.addr, node.port))
        .ok()?;

    let mut hdr = SdReq::new(SD_OP_GET_OBJ_LIST);
    hdr.tgt_epoch = epoch - 1;
    hdr.data_length = crate::obj::SD_DATA_OBJ_SIZE as u32;
    let mut buf = vec![0; hdr.data_length as usize];
    let (rsp, len) = proto::exec_req(&mut stream, &hdr, &[], &mut buf).ok()?;
    if let Err(e) = SdError::from_wire(rsp.result) {
        error!("retrying: {e}");
        return None;
    }
    let oids = buf[..len]
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect::<Vec<_>>();
    debug!("{} objects listed", oids.len());
    Some(oids)
}

/// Keeps only the OIDs this node holds a replica slot for at the current
/// epoch.
fn screen_obj_list(view: &EpochView, nr_objs: usize, me: &Node, list: &[u64]) -> Vec<u64> {
    let mut kept = Vec::new();
    for &oid in list {
        for cp in 0..nr_objs {
            let idx = ring::obj_to_sheep(&view.cur_vnodes, oid, cp);
            let vnode = &view.cur_vnodes[idx];
            if vnode.addr == me.addr && vnode.port == me.port {
                kept.push(oid);
                break;
            }
        }
    }
    debug!("{} objects kept", kept.len());
    kept
}

/// Binary search over a list sorted by [`ring::obj_cmp`], resolving hash
/// ties by scanning the equal-hash run.
fn oid_bsearch(list: &[u64], oid: u64) -> Option<usize> {
    let hval = ring::obj_hash(oid);
    let mut idx = list.partition_point(|o| ring::obj_hash(*o) < hval);
    while idx < list.len() && ring::obj_hash(list[idx]) == hval {
        if list[idx] == oid {
            return Some(idx);
        }
        idx += 1;
    }
    None
}

/// Merges `list2` into `list1`, dropping OIDs already present and keeping
/// the result sorted by [`ring::obj_cmp`].
pub fn merge_objlist(list1: &mut Vec<u64>, list2: &[u64]) {
    let old_len = list1.len();
    for &oid in list2 {
        if oid_bsearch(&list1[..old_len], oid).is_none() {
            list1.push(oid);
        }
    }
    list1.sort_by(ring::obj_cmp);
}

/// Recovers one OID. Returns true when the task must pause and retry.
fn recover_object(ctx: &StorageCtx, epoch: u32, view: &EpochView, oid: u64) -> bool {
    debug!("recovering oid {oid:x} for epoch {epoch}");

    let mut iocb = Iocb::at_epoch(epoch);
    if ctx.store.open(oid, &mut iocb, false).is_ok() {
        let _ = ctx.store.close(oid, &mut iocb);
        debug!("the object is already recovered");
        return false;
    }

    let (me, copies_conf) = {
        let cluster = ctx.cluster.read().unwrap();
        (cluster.me, cluster.copies)
    };
    let copy_nr = ring::get_max_copies(&view.cur_nodes, copies_conf);
    let copy_idx = (0..copy_nr).find(|&i| {
        let idx = ring::obj_to_sheep(&view.cur_vnodes, oid, i);
        let vnode = &view.cur_vnodes[idx];
        vnode.addr == me.addr && vnode.port == me.port
    });
    let Some(copy_idx) = copy_idx else {
        error!("failed to recover object {oid:x}: not a replica holder");
        return false;
    };

    match do_recover_object(ctx, epoch, view, oid, copy_idx) {
        Outcome::Done => return false,
        Outcome::Retry => return true,
        Outcome::Failed => {}
    }
    // the chosen source chain failed: try every other replica slot
    for i in 0..copy_nr {
        if i == copy_idx {
            continue;
        }
        match do_recover_object(ctx, epoch, view, oid, i) {
            Outcome::Done => return false,
            Outcome::Retry => return true,
            Outcome::Failed => {}
        }
    }
    error!("failed to recover object {oid:x}");
    false
}

enum Outcome {
    Done,
    Retry,
    Failed,
}

/// Walks the epoch history looking for a source holding the object, from
/// the previous epoch backwards.
fn do_recover_object(
    ctx: &StorageCtx,
    epoch: u32,
    view: &EpochView,
    oid: u64,
    copy_idx: usize,
) -> Outcome {
    let copies_conf = ctx.cluster.read().unwrap().copies;
    let mut old = view.old_vnodes.clone();
    let mut cur = view.cur_vnodes.clone();
    let mut old_copies = ring::get_max_copies(&view.old_nodes, copies_conf);
    let mut cur_copies = ring::get_max_copies(&view.cur_nodes, copies_conf);
    let mut tgt_epoch = epoch - 1;

    loop {
        debug!("try recover object {oid:x} from epoch {tgt_epoch}");
        if cur_copies <= copy_idx {
            error!(
                "epoch ({tgt_epoch}) has less copies ({cur_copies}) than requested copy_idx: {copy_idx}"
            );
            return Outcome::Failed;
        }

        let old_idx = ring::obj_to_sheep(&old, oid, 0);
        let cur_idx = ring::obj_to_sheep(&cur, oid, 0);
        let tgt_idx = find_tgt_node(&old, old_idx, old_copies, &cur, cur_idx, cur_copies, copy_idx);
        let tgt = old[tgt_idx];

        match recover_object_from_replica(ctx, oid, &tgt, epoch, tgt_epoch) {
            Outcome::Done => return Outcome::Done,
            Outcome::Retry => return Outcome::Retry,
            Outcome::Failed => {
                // walk one epoch further back
                if tgt_epoch <= 1 {
                    error!("can not recover oid {oid:x}");
                    return Outcome::Failed;
                }
                tgt_epoch -= 1;
                let Some((new_old, new_old_copies)) = get_vnodes_from_epoch(ctx, tgt_epoch)
                else {
                    return Outcome::Failed;
                };
                cur = old;
                cur_copies = old_copies;
                old = new_old;
                old_copies = new_old_copies;
            }
        }
    }
}

/// Vnode set and effective copies of an arbitrary epoch, consulting local
/// logs first and peers second.
fn get_vnodes_from_epoch(ctx: &StorageCtx, epoch: u32) -> Option<(Vec<VNode>, usize)> {
    let (me, copies_conf) = {
        let cluster = ctx.cluster.read().unwrap();
        (cluster.me, cluster.copies)
    };
    let nodes = match ctx.epoch_log.read(epoch) {
        Ok(nodes) => nodes,
        Err(_) => {
            let nodes = ctx.epoch_log.read_remote(epoch, &me);
            if nodes.is_empty() {
                return None;
            }
            nodes
        }
    };
    let copies = ring::get_max_copies(&nodes, copies_conf);
    Some((ring::nodes_to_vnodes(&nodes), copies))
}

/// Pulls one replica: the hard-link fast path when the source is this node,
/// a recovery read plus atomic put otherwise.
fn recover_object_from_replica(
    ctx: &StorageCtx,
    oid: u64,
    entry: &VNode,
    epoch: u32,
    tgt_epoch: u32,
) -> Outcome {
    let rlen = crate::obj::obj_size(oid) as usize;
    let local = {
        let cluster = ctx.cluster.read().unwrap();
        cluster.is_myself(entry.addr, entry.port)
    };

    if local {
        let iocb = Iocb::at_epoch(epoch);
        return match ctx.store.link(oid, &iocb, tgt_epoch) {
            Ok(()) => {
                debug!("recovered oid {oid:x} from {tgt_epoch} to epoch {epoch}");
                Outcome::Done
            }
            Err(_) => Outcome::Failed,
        };
    }

    debug!("{}, {}", entry.addr, entry.port);
    let mut stream = match proto::connect_to(entry.sockaddr()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("failed to connect to {}:{}: {e}", entry.addr, entry.port);
            return Outcome::Failed;
        }
    };

    let mut hdr = SdReq::new(SD_OP_READ_OBJ);
    hdr.oid = oid;
    hdr.epoch = epoch;
    hdr.flags = SD_FLAG_CMD_RECOVERY | SD_FLAG_CMD_IO_LOCAL;
    hdr.tgt_epoch = tgt_epoch;
    hdr.data_length = rlen as u32;

    let mut buf = AlignedBuf::zeroed(rlen);
    let (rsp, _) = match proto::exec_req(&mut stream, &hdr, &[], &mut buf) {
        Ok(result) => result,
        Err(e) => {
            error!("recovery read from {}:{} failed: {e}", entry.addr, entry.port);
            return Outcome::Failed;
        }
    };

    match SdError::from_wire(rsp.result) {
        Ok(()) => {
            let iocb = Iocb::at_epoch(epoch);
            match ctx.store.atomic_put(oid, &iocb, &buf) {
                Ok(()) => {
                    debug!("recovered oid {oid:x} from {tgt_epoch} to epoch {epoch}");
                    Outcome::Done
                }
                Err(_) => Outcome::Failed,
            }
        }
        Err(SdError::NewNodeVer | SdError::OldNodeVer | SdError::NetworkError) => {
            debug!("retrying: {:x}, {oid:x}", rsp.result);
            Outcome::Retry
        }
        Err(e) => {
            error!("failed, res: {e}");
            Outcome::Failed
        }
    }
}

/// Returns the old-list position of a vnode's node among the first `copies`
/// targets from `base_idx`, if present.
fn contains_node(key: &VNode, entry: &[VNode], base_idx: usize, copies: usize) -> Option<usize> {
    for i in 0..copies {
        let idx = ring::get_nth_node(entry, base_idx, i);
        if entry[idx].same_node(key) {
            return Some(idx);
        }
    }
    None
}

/// Picks the source replica for the `copy_idx`-th current target.
///
/// The mapping from current replica indices to old replica indices is
/// injective and maximizes the indices where the same node appears in both
/// lists, so those nodes recover locally via hard link and no source is
/// asked twice for the same object when an even assignment exists.
fn find_tgt_node(
    old: &[VNode],
    old_idx: usize,
    old_copies: usize,
    cur: &[VNode],
    cur_idx: usize,
    cur_copies: usize,
    copy_idx: usize,
) -> usize {
    debug!("{old_idx}, {old_copies}, {cur_idx}, {cur_copies}, {copy_idx}");

    // the common case: the same node holds this slot in both epochs
    let key = &cur[ring::get_nth_node(cur, cur_idx, copy_idx)];
    if let Some(idx) = contains_node(key, old, old_idx, old_copies) {
        debug!("{idx}, {copy_idx}, {cur_idx}");
        return idx;
    }

    let mut j = 0;
    for i in 0..=copy_idx {
        if i < copy_idx {
            // replicas staying on the same node recover locally and
            // consume no remote source
            let key = &cur[ring::get_nth_node(cur, cur_idx, i)];
            if contains_node(key, old, old_idx, old_copies).is_some() {
                continue;
            }
        }
        // pass over sources whose node is already in place among the
        // current targets
        while j < old_copies {
            let old_key = &old[ring::get_nth_node(old, old_idx, j)];
            if contains_node(old_key, cur, cur_idx, cur_copies).is_none() {
                break;
            }
            j += 1;
        }
        if j == old_copies {
            // the old epoch had fewer zones than copy_idx + 1 distinct
            // targets; any node suffices
            return old_idx;
        }
        if i == copy_idx {
            return ring::get_nth_node(old, old_idx, j);
        }
        j += 1;
    }
    old_idx
}

/// Recovery coupling for foreground I/O: tells whether the OID is still
/// waiting to be recovered, promoting it into the blocking prefix so it is
/// processed next.
///
/// The `min_hval` gate mirrors the hash ordering of the pending tail: an
/// OID hashing before the current head cannot be pending. This is tight
/// but conservative, and kept as a deliberate trade-off.
pub fn is_recoverying_oid(ctx: &StorageCtx, oid: u64) -> bool {
    if oid == 0 {
        return false;
    }
    let sys_epoch = ctx.cluster.read().unwrap().epoch;
    let mut state = ctx.recovery.lock().unwrap();
    let Some(rw) = state.current.as_mut() else {
        // no thread working on object recovery
        return false;
    };

    if before(rw.epoch, sys_epoch) {
        return true;
    }
    if rw.state == RwState::Init {
        return true;
    }

    let mut iocb = Iocb::at_epoch(sys_epoch);
    if ctx.store.open(oid, &mut iocb, false).is_ok() {
        let _ = ctx.store.close(oid, &mut iocb);
        debug!("the object {oid:x} is already recovered");
        return false;
    }

    // the blocking prefix was already scheduled to be done earlier
    for i in 0..rw.nr_blocking {
        if rw.oids.get(rw.done + i) == Some(&oid) {
            return true;
        }
    }

    let tail_start = rw.done + rw.nr_blocking;
    if tail_start >= rw.oids.len() {
        debug!("the object {oid:x} is not found");
        return false;
    }
    let min_hval = ring::obj_hash(rw.oids[tail_start]);
    if min_hval <= ring::obj_hash(oid)
        && let Some(pos) = oid_bsearch(&rw.oids[tail_start..], oid)
    {
        let pos = tail_start + pos;
        debug!("recover the object {oid:x} first");
        if rw.nr_blocking == 0 {
            // the head may be being processed right now
            rw.nr_blocking = 1;
        }
        let start = rw.done + rw.nr_blocking;
        if pos > start {
            rw.oids[start..=pos].rotate_right(1);
            rw.nr_blocking += 1;
        }
        return true;
    }

    debug!("the object {oid:x} is not found");
    false
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ctx::StorageCtx;
    use std::net::IpAddr;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    fn node(i: u8, port: u16) -> Node {
        Node {
            addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)),
            port,
            node_idx: i as u16,
            zone: i as u32,
        }
    }

    fn view_of(old: Vec<Node>, cur: Vec<Node>) -> EpochView {
        let old_vnodes = ring::nodes_to_vnodes(&old);
        let cur_vnodes = ring::nodes_to_vnodes(&cur);
        EpochView {
            old_nodes: old,
            cur_nodes: cur,
            old_vnodes,
            cur_vnodes,
        }
    }

    /// Node owning the `n`-th target slot of `oid`.
    fn nth_target(vnodes: &[VNode], oid: u64, n: usize) -> VNode {
        vnodes[ring::obj_to_sheep(vnodes, oid, n)]
    }

    #[test]
    fn merge_dedups_and_sorts() {
        let mut list = Vec::new();
        merge_objlist(&mut list, &[3, 1, 7]);
        merge_objlist(&mut list, &[1, 9, 3, 11]);
        assert_eq!(list.len(), 5);
        assert!(list.windows(2).all(|w| ring::obj_hash(w[0]) <= ring::obj_hash(w[1])));
        for oid in [1, 3, 7, 9, 11] {
            assert!(oid_bsearch(&list, oid).is_some());
        }
        assert!(oid_bsearch(&list, 42).is_none());
    }

    #[test]
    fn screen_keeps_only_my_slots() {
        let me = node(1, 7000);
        let other = node(2, 7000);
        let view = view_of(vec![me, other], vec![me, other]);
        let list: Vec<u64> = (1..100).collect();

        // one copy: roughly half the ring maps to me
        let mine = screen_obj_list(&view, 1, &me, &list);
        assert!(!mine.is_empty());
        assert!(mine.len() < list.len());
        for &oid in &mine {
            let v = nth_target(&view.cur_vnodes, oid, 0);
            assert_eq!((v.addr, v.port), (me.addr, me.port));
        }

        // two copies on a two-node ring: every object has a slot here
        let all = screen_obj_list(&view, 2, &me, &list);
        assert_eq!(all.len(), list.len());
    }

    #[test]
    fn newly_joined_detection() {
        let a = node(1, 7000);
        let b = node(2, 7000);
        let d = node(3, 7000);
        let view = view_of(vec![a, b], vec![a, b, d]);
        assert!(!newly_joined(&a, &view));
        assert!(newly_joined(&d, &view));
    }

    #[test]
    fn find_tgt_prefers_local() {
        // replica sets overlap: every shared slot maps to its own node
        let nodes: Vec<Node> = (1..=6).map(|i| node(i, 7000)).collect();
        let mut grown = nodes.clone();
        grown.push(node(7, 7000));
        let view = view_of(nodes, grown);
        let oid = 0xabcd;

        let old_idx = ring::obj_to_sheep(&view.old_vnodes, oid, 0);
        let cur_idx = ring::obj_to_sheep(&view.cur_vnodes, oid, 0);
        let copies = 5;
        for copy_idx in 0..copies {
            let tgt = find_tgt_node(
                &view.old_vnodes,
                old_idx,
                copies,
                &view.cur_vnodes,
                cur_idx,
                copies,
                copy_idx,
            );
            let cur_holder = nth_target(&view.cur_vnodes, oid, copy_idx);
            if contains_node(&cur_holder, &view.old_vnodes, old_idx, copies).is_some() {
                // the slot stays on the same node: recover from itself
                assert!(view.old_vnodes[tgt].same_node(&cur_holder));
            }
        }
    }

    #[test]
    fn find_tgt_is_injective() {
        let nodes: Vec<Node> = (1..=6).map(|i| node(i, 7000)).collect();
        let mut grown = nodes.clone();
        grown.push(node(7, 7000));
        grown.push(node(8, 7000));
        let view = view_of(nodes, grown);

        for oid in [0xabcdu64, 0x1234, 0xffff_0001, 7] {
            let old_idx = ring::obj_to_sheep(&view.old_vnodes, oid, 0);
            let cur_idx = ring::obj_to_sheep(&view.cur_vnodes, oid, 0);
            let copies = 5;
            let targets: Vec<usize> = (0..copies)
                .map(|copy_idx| {
                    find_tgt_node(
                        &view.old_vnodes,
                        old_idx,
                        copies,
                        &view.cur_vnodes,
                        cur_idx,
                        copies,
                        copy_idx,
                    )
                })
                .collect();
            for i in 0..targets.len() {
                for j in 0..i {
                    assert!(
                        !view.old_vnodes[targets[i]].same_node(&view.old_vnodes[targets[j]]),
                        "copy {i} and {j} share a source for oid {oid:x}"
                    );
                }
            }
        }
    }

    #[test]
    fn epoch_before_wraps() {
        assert!(before(1, 2));
        assert!(!before(2, 1));
        assert!(!before(2, 2));
        assert!(before(u32::MAX, 0));
    }

    fn test_ctx(dir: &std::path::Path, me: Node) -> Arc<StorageCtx> {
        StorageCtx::init(dir, me, 2).unwrap()
    }

    #[test]
    fn local_link_recovery_without_network() {
        let dir = tempdir().unwrap();
        let me = Node {
            addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 7010,
            node_idx: 0,
            zone: 0,
        };
        let other = Node {
            addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 7011,
            node_idx: 1,
            zone: 1,
        };
        let ctx = test_ctx(dir.path(), me);
        ctx.update_epoch(1, vec![me, other]).unwrap();
        ctx.update_epoch(2, vec![me, other, node(3, 7012)]).unwrap();

        // pick an object this node keeps a replica slot for at epoch 2
        let cur_vnodes = ring::nodes_to_vnodes(&[me, other, node(3, 7012)]);
        let oid = (0..1000u32)
            .map(|i| crate::obj::vid_to_data_oid(5, i))
            .find(|&oid| {
                (0..2).any(|cp| {
                    let v = &cur_vnodes[ring::obj_to_sheep(&cur_vnodes, oid, cp)];
                    v.addr == me.addr && v.port == me.port
                })
            })
            .unwrap();
        ctx.store
            .atomic_put(oid, &Iocb::at_epoch(1), b"replica body")
            .unwrap();

        let view = init_epoch_view(&ctx, 2).unwrap();
        let retry = recover_object(&ctx, 2, &view, oid);
        assert!(!retry);
        assert_eq!(
            std::fs::read(ctx.store.obj_file(2, oid)).unwrap(),
            b"replica body"
        );
    }

    #[test]
    fn remote_recovery_via_atomic_put() {
        // node A holds the object at epoch 1; node D joins at epoch 2 and
        // pulls its replica over the wire
        let dir_a = tempdir().unwrap();
        let dir_d = tempdir().unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let a = Node {
            addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: listener.local_addr().unwrap().port(),
            node_idx: 0,
            zone: 0,
        };
        let d = Node {
            addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: a.port.wrapping_add(1),
            node_idx: 1,
            zone: 1,
        };

        let ctx_a = test_ctx(dir_a.path(), a);
        ctx_a.update_epoch(1, vec![a]).unwrap();
        ctx_a.update_epoch(2, vec![a, d]).unwrap();
        let ctx_a2 = Arc::clone(&ctx_a);
        thread::spawn(move || crate::server::listen(ctx_a2, listener));

        let oid = crate::obj::vid_to_data_oid(9, 0);
        crate::gateway::write_object_local(&ctx_a, oid, b"epoch one body", 0, 0, 1, 1, true)
            .unwrap();

        let ctx_d = test_ctx(dir_d.path(), d);
        ctx_d.update_epoch(1, vec![a]).unwrap();
        ctx_d.update_epoch(2, vec![a, d]).unwrap();

        let view = init_epoch_view(&ctx_d, 2).unwrap();
        let retry = recover_object(&ctx_d, 2, &view, oid);
        assert!(!retry);

        let body = std::fs::read(ctx_d.store.obj_file(2, oid)).unwrap();
        assert_eq!(body.len() as u64, crate::obj::SD_DATA_OBJ_SIZE);
        assert_eq!(&body[..14], b"epoch one body");
        // staging file gone
        assert!(!ctx_d.store.obj_file(2, oid).with_extension("tmp").exists());
    }

    fn install_task(ctx: &StorageCtx, me: Node, oids: Vec<u64>, done: usize) {
        let mut state = ctx.recovery.lock().unwrap();
        state.current = Some(RecoveryWork {
            state: RwState::Run,
            epoch: 1,
            done,
            nr_blocking: 0,
            oids,
            retry: false,
            view: Arc::new(view_of(vec![me], vec![me])),
        });
    }

    #[test]
    fn promotion_of_the_next_pending_oid() {
        // o3 sits right behind the possibly in-flight head: it is covered
        // without reordering
        let dir = tempdir().unwrap();
        let me = node(1, 7020);
        let ctx = test_ctx(dir.path(), me);
        ctx.update_epoch(1, vec![me]).unwrap();

        let mut oids: Vec<u64> = vec![101, 102, 103, 104];
        oids.sort_by(ring::obj_cmp);
        let o3 = oids[2];
        install_task(&ctx, me, oids.clone(), 1);

        assert!(is_recoverying_oid(&ctx, o3));
        let state = ctx.recovery.lock().unwrap();
        let rw = state.current.as_ref().unwrap();
        assert_eq!(rw.nr_blocking, 1);
        assert_eq!(rw.oids, oids);
    }

    #[test]
    fn promotion_into_blocking_prefix() {
        let dir = tempdir().unwrap();
        let me = node(1, 7021);
        let ctx = test_ctx(dir.path(), me);
        ctx.update_epoch(1, vec![me]).unwrap();

        let mut oids: Vec<u64> = vec![101, 102, 103, 104];
        oids.sort_by(ring::obj_cmp);
        let target = oids[3];
        install_task(&ctx, me, oids.clone(), 1);

        // an OID already attempted is not recovering
        assert!(!is_recoverying_oid(&ctx, oids[0]));
        // a distant pending OID moves right behind the in-flight head
        assert!(is_recoverying_oid(&ctx, target));
        {
            let state = ctx.recovery.lock().unwrap();
            let rw = state.current.as_ref().unwrap();
            assert_eq!(rw.nr_blocking, 2);
            assert_eq!(rw.oids[rw.done + 1], target);
            // the tail stays sorted
            let tail = &rw.oids[rw.done + rw.nr_blocking..];
            assert!(tail.windows(2).all(|w| ring::obj_hash(w[0]) <= ring::obj_hash(w[1])));
        }
        // promoted OIDs keep reporting as recovering
        assert!(is_recoverying_oid(&ctx, target));
        // unknown OIDs are not recovering
        assert!(!is_recoverying_oid(&ctx, 0xdead));
        assert!(!is_recoverying_oid(&ctx, 0));
    }
}
