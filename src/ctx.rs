//! Process-wide storage context.
//!
//! Everything the original daemon kept in global singletons lives here
//! explicitly: the store paths, the active backend, the caches, the cluster
//! view of the current epoch and the recovery state. Workers share the
//! context behind an `Arc`; read-only fields are plain fields, mutable ones
//! carry their own lock.

use crate::cache::NoCache;
use crate::cache::ObjectCache;
use crate::config::ConfigStore;
use crate::config::SD_FLAG_DIRECTIO;
use crate::conn::ConnPool;
use crate::epoch::EpochLog;
use crate::journal;
use crate::objlist::ObjListCache;
use crate::proto::SdError;
use crate::proto::SdResult;
use crate::recovery::RecoveryState;
use crate::ring;
use crate::ring::Node;
use crate::ring::VNode;
use crate::server::PendingReq;
use crate::store;
use crate::store::Iocb;
use crate::store::StoreDriver;
use crate::trace::Tracer;
use crate::work::TimerQueue;
use crate::work::Wqueue;
use log::debug;
use log::info;
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

/// Number of worker threads serving gateway I/O.
const NR_IO_WORKERS: usize = 4;
/// Number of worker threads serving recovery.
const NR_RECOVERY_WORKERS: usize = 1;

/// Snapshot of the cluster as of the current epoch.
///
/// The node and vnode lists are shared, so cloning a view is cheap and a
/// request keeps operating on the membership it was dispatched under even
/// while a new epoch is being installed.
#[derive(Clone)]
pub struct ClusterView {
    pub epoch: u32,
    /// Configured default replica count.
    pub copies: usize,
    pub nodes: Arc<Vec<Node>>,
    pub vnodes: Arc<Vec<VNode>>,
    /// This node's identity.
    pub me: Node,
    /// Highest epoch recovery has fully processed.
    pub recovered_epoch: u32,
}

impl ClusterView {
    pub fn is_myself(&self, addr: IpAddr, port: u16) -> bool {
        self.me.addr == addr && self.me.port == port
    }

    /// Effective replica count for a request: the header's count (or the
    /// cluster default) capped by the number of distinct zones.
    pub fn effective_copies(&self, hdr_copies: u32) -> usize {
        let configured = if hdr_copies != 0 {
            hdr_copies as usize
        } else {
            self.copies
        };
        ring::get_max_copies(&self.nodes, configured)
    }
}

pub struct StorageCtx {
    pub base_path: PathBuf,
    pub obj_path: PathBuf,
    pub jrnl_path: PathBuf,
    pub config: ConfigStore,
    pub epoch_log: EpochLog,
    pub store: Box<dyn StoreDriver>,
    pub objlist: ObjListCache,
    pub conn: ConnPool,
    pub cache: Box<dyn ObjectCache>,
    pub cluster: RwLock<ClusterView>,
    pub recovery: Mutex<RecoveryState>,
    /// Requests parked until recovery drains the OIDs they target.
    pub pending: Mutex<Vec<PendingReq>>,
    /// OIDs with a foreground request currently in flight, with a count of
    /// how many.
    pub inflight: Mutex<HashMap<u64, u32>>,
    /// Bitmap of VDI ids in use, fed by the store scan at startup.
    pub vdi_inuse: Mutex<Vec<u64>>,
    pub tracer: Tracer,
    pub io_wqueue: Wqueue,
    pub recovery_wqueue: Wqueue,
    pub timers: TimerQueue,
    pub use_directio: bool,
}

impl StorageCtx {
    /// Brings the store up under `base`: creates the directory layout,
    /// replays the journal, loads the config, scans the store and warms the
    /// object-list cache.
    pub fn init(base: &Path, me: Node, default_copies: usize) -> SdResult<Arc<Self>> {
        init_path(base)?;
        let obj_path = base.join("obj");
        let epoch_path = base.join("epoch");
        let jrnl_path = base.join("journal");
        init_path(&obj_path)?;
        init_path(&epoch_path)?;
        let jrnl_new = !jrnl_path.exists();
        init_path(&jrnl_path)?;
        journal::init(&jrnl_path, jrnl_new).map_err(|_| SdError::Eio)?;

        let config = ConfigStore::new(base.join("config"), jrnl_path.clone())?;
        let flags = config.get_flags().unwrap_or(0);
        let use_directio = flags & SD_FLAG_DIRECTIO != 0;

        let mut name = config.get_store()?;
        if name.is_empty() {
            // never formatted: fall back to the default backend
            name = store::simple::DRIVER_NAME.to_string();
        }
        let store = store::find_store_driver(&name, obj_path.clone(), use_directio)
            .ok_or(SdError::SystemError)?;
        info!("use {} store driver", store.name());

        let mut vdi_inuse = vec![0u64; crate::obj::SD_NR_VDIS as usize / 64];
        for vid in store.init()? {
            vdi_inuse[vid as usize / 64] |= 1 << (vid % 64);
        }

        let objlist = ObjListCache::new();
        for oid in store.get_objlist(0).unwrap_or_default() {
            objlist.insert(oid);
        }
        debug!("object list cache warmed with {} entries", objlist.len());

        let epoch_log = EpochLog::new(epoch_path);
        let epoch = epoch_log.latest();
        let nodes = if epoch > 0 {
            epoch_log.read(epoch)?
        } else {
            vec![me]
        };
        let copies = match config.get_copies() {
            Ok(copies) if copies > 0 => copies as usize,
            _ => default_copies,
        };
        let vnodes = ring::nodes_to_vnodes(&nodes);
        let cluster = ClusterView {
            epoch,
            copies,
            nodes: Arc::new(nodes),
            vnodes: Arc::new(vnodes),
            me,
            recovered_epoch: epoch,
        };

        Ok(Arc::new(Self {
            base_path: base.to_path_buf(),
            obj_path,
            jrnl_path,
            config,
            epoch_log,
            store,
            objlist,
            conn: ConnPool::new(),
            cache: Box::new(NoCache),
            cluster: RwLock::new(cluster),
            recovery: Mutex::new(RecoveryState::default()),
            pending: Mutex::new(Vec::new()),
            inflight: Mutex::new(HashMap::new()),
            vdi_inuse: Mutex::new(vdi_inuse),
            tracer: Tracer::new(),
            io_wqueue: Wqueue::new("io", NR_IO_WORKERS),
            recovery_wqueue: Wqueue::new("recovery", NR_RECOVERY_WORKERS),
            timers: TimerQueue::new(),
            use_directio,
        }))
    }

    /// Returns a snapshot of the cluster view.
    pub fn view(&self) -> ClusterView {
        self.cluster.read().unwrap().clone()
    }

    /// Installs the membership of a new epoch: records the epoch log,
    /// creates the epoch's object directory, swaps the view in and drops
    /// peer connections of older epochs.
    pub fn update_epoch(&self, epoch: u32, nodes: Vec<Node>) -> SdResult<()> {
        self.epoch_log.update(epoch, &nodes)?;
        let _ = fs::create_dir_all(self.obj_path.join(crate::util::epoch_name(epoch)));

        let vnodes = ring::nodes_to_vnodes(&nodes);
        let mut view = self.cluster.write().unwrap();
        view.epoch = epoch;
        view.nodes = Arc::new(nodes);
        view.vnodes = Arc::new(vnodes);
        if epoch == 1 {
            // the first epoch has no predecessor to recover from
            view.recovered_epoch = 1;
        }
        drop(view);

        self.conn.drop_stale(epoch);
        Ok(())
    }

    /// Wipes every epoch's objects and re-records the backend name.
    pub fn format(&self) -> SdResult<()> {
        let epoch = self.cluster.read().unwrap().epoch;
        self.store.format(&Iocb::at_epoch(epoch))?;
        self.config.set_store(self.store.name())
    }

    /// Reports the latest epoch, its node list and the cluster creation
    /// time, as served to peers joining the cluster.
    pub fn read_epoch(&self) -> SdResult<(u32, Vec<Node>, u64)> {
        let epoch = self.epoch_log.latest();
        let nodes = self.epoch_log.read(epoch).map_err(|_| SdError::Eio)?;
        Ok((epoch, nodes, self.config.get_ctime()))
    }

    pub fn set_vdi_inuse(&self, vid: u32) {
        let mut bitmap = self.vdi_inuse.lock().unwrap();
        bitmap[vid as usize / 64] |= 1 << (vid % 64);
    }

    pub fn vdi_inuse(&self, vid: u32) -> bool {
        let bitmap = self.vdi_inuse.lock().unwrap();
        bitmap[vid as usize / 64] & (1 << (vid % 64)) != 0
    }
}

/// Ensures `path` exists and is a directory.
fn init_path(path: &Path) -> SdResult<()> {
    fs::create_dir_all(path).map_err(|_| SdError::Eio)?;
    if !path.is_dir() {
        return Err(SdError::Eio);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::obj;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    fn me(port: u16) -> Node {
        Node {
            addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port,
            node_idx: 0,
            zone: 0,
        }
    }

    #[test]
    fn init_creates_layout() {
        let dir = tempdir().unwrap();
        let ctx = StorageCtx::init(dir.path(), me(7100), 3).unwrap();
        assert!(ctx.obj_path.is_dir());
        assert!(ctx.jrnl_path.is_dir());
        assert!(dir.path().join("epoch").is_dir());
        assert!(dir.path().join("config").is_file());
        assert!(ctx.objlist.is_empty());
        assert_eq!(ctx.view().copies, 3);
    }

    #[test]
    fn reinit_warms_caches_from_disk() {
        let dir = tempdir().unwrap();
        let data_oid = obj::vid_to_data_oid(0x33, 4);
        let vdi_oid = obj::vid_to_vdi_oid(0x33);
        {
            let ctx = StorageCtx::init(dir.path(), me(7101), 3).unwrap();
            ctx.format().unwrap();
            ctx.config.set_copies(2).unwrap();
            ctx.update_epoch(1, vec![me(7101)]).unwrap();
            ctx.store
                .atomic_put(data_oid, &Iocb::at_epoch(1), b"d")
                .unwrap();
            ctx.store
                .atomic_put(vdi_oid, &Iocb::at_epoch(1), b"i")
                .unwrap();
        }

        let ctx = StorageCtx::init(dir.path(), me(7101), 3).unwrap();
        let mut oids = ctx.objlist.list();
        oids.sort_unstable();
        let mut expected = vec![data_oid, vdi_oid];
        expected.sort_unstable();
        assert_eq!(oids, expected);
        assert!(ctx.vdi_inuse(0x33));
        assert!(!ctx.vdi_inuse(0x34));
        let view = ctx.view();
        assert_eq!(view.epoch, 1);
        assert_eq!(view.copies, 2);
        assert_eq!(view.nodes.len(), 1);
    }

    #[test]
    fn format_records_driver_name() {
        let dir = tempdir().unwrap();
        let ctx = StorageCtx::init(dir.path(), me(7102), 3).unwrap();
        assert_eq!(ctx.config.get_store().unwrap(), "");
        ctx.format().unwrap();
        assert_eq!(ctx.config.get_store().unwrap(), "simple");
    }

    #[test]
    fn read_epoch_reports_membership() {
        let dir = tempdir().unwrap();
        let ctx = StorageCtx::init(dir.path(), me(7103), 3).unwrap();
        ctx.config.set_ctime(12345).unwrap();
        ctx.update_epoch(1, vec![me(7103)]).unwrap();

        let (epoch, nodes, ctime) = ctx.read_epoch().unwrap();
        assert_eq!(epoch, 1);
        assert_eq!(nodes, vec![me(7103)]);
        assert_eq!(ctime, 12345);
    }
}
