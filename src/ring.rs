//! Consistent-hashing placement.
//!
//! Every node of an epoch's membership expands to a fixed number of virtual
//! nodes on a 64-bit hash ring. An object lives on the first `copies`
//! distinct nodes found walking the ring clockwise from the hash point of its
//! OID. All hashing is FNV-1a-64, which also defines the order recovery
//! processes OIDs in.

use std::cmp::Ordering;
use std::net::IpAddr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;

/// Maximum number of nodes in a membership snapshot.
pub const SD_MAX_NODES: usize = 1024;
/// Number of virtual nodes each node puts on the ring.
pub const SD_DEFAULT_VNODES: usize = 64;
/// Hard cap on the replica count of an object.
pub const SD_MAX_REDUNDANCY: usize = 8;

/// Size of a node record in the epoch log.
pub const NODE_RECORD_SIZE: usize = 24;

const FNV1A_64_INIT: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_64_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a-64 over a byte buffer, continuing from `hval`.
pub fn fnv_64a_buf(buf: &[u8], mut hval: u64) -> u64 {
    for b in buf {
        hval ^= *b as u64;
        hval = hval.wrapping_mul(FNV_64_PRIME);
    }
    hval
}

/// Hash point of an OID on the ring.
pub fn obj_hash(oid: u64) -> u64 {
    fnv_64a_buf(&oid.to_le_bytes(), FNV1A_64_INIT)
}

/// Orders OIDs by their hash point.
pub fn obj_cmp(a: &u64, b: &u64) -> Ordering {
    obj_hash(*a).cmp(&obj_hash(*b))
}

/// A member of the cluster at some epoch.
///
/// Two nodes are the same node iff their address and port match; `node_idx`
/// and `zone` do not take part in identity.
#[derive(Clone, Copy, Debug)]
pub struct Node {
    pub addr: IpAddr,
    pub port: u16,
    /// Index of the node in the membership list.
    pub node_idx: u16,
    /// Fault domain of the node. Replicas never share a zone.
    pub zone: u32,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.port == other.port
    }
}

impl Eq for Node {}

impl Node {
    pub fn sockaddr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// Encodes the node to its fixed-size epoch log record.
    pub fn encode(&self) -> [u8; NODE_RECORD_SIZE] {
        let mut buf = [0; NODE_RECORD_SIZE];
        buf[..16].copy_from_slice(&addr_to_bytes(self.addr));
        buf[16..18].copy_from_slice(&self.port.to_le_bytes());
        buf[18..20].copy_from_slice(&self.node_idx.to_le_bytes());
        buf[20..24].copy_from_slice(&self.zone.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; NODE_RECORD_SIZE]) -> Self {
        Self {
            addr: bytes_to_addr(buf[..16].try_into().unwrap()),
            port: u16::from_le_bytes(buf[16..18].try_into().unwrap()),
            node_idx: u16::from_le_bytes(buf[18..20].try_into().unwrap()),
            zone: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        }
    }
}

/// A point on the ring attributed to a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VNode {
    pub addr: IpAddr,
    pub port: u16,
    pub node_idx: u16,
    pub hash_point: u64,
}

impl VNode {
    /// Tells whether this vnode belongs to the same node as `other`.
    pub fn same_node(&self, other: &VNode) -> bool {
        self.addr == other.addr && self.port == other.port
    }

    pub fn sockaddr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

/// Addresses are stored as 16 bytes, IPv4 mapped into IPv6.
pub fn addr_to_bytes(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(a) => a.to_ipv6_mapped().octets(),
        IpAddr::V6(a) => a.octets(),
    }
}

pub fn bytes_to_addr(bytes: [u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(bytes);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

/// Expands a membership list to its virtual nodes, sorted by hash point.
///
/// The expansion is deterministic: every node seeds a hash chain with its
/// port, then folds its address in once per virtual node.
pub fn nodes_to_vnodes(nodes: &[Node]) -> Vec<VNode> {
    let mut vnodes = Vec::with_capacity(nodes.len() * SD_DEFAULT_VNODES);
    for node in nodes {
        let addr = addr_to_bytes(node.addr);
        let mut hval = fnv_64a_buf(&node.port.to_le_bytes(), FNV1A_64_INIT);
        for _ in 0..SD_DEFAULT_VNODES {
            hval = fnv_64a_buf(&addr, hval);
            vnodes.push(VNode {
                addr: node.addr,
                port: node.port,
                node_idx: node.node_idx,
                hash_point: hval,
            });
        }
    }
    vnodes.sort_by(|a, b| a.hash_point.cmp(&b.hash_point));
    vnodes
}

/// Returns the ring position owning the hash value: the first vnode whose
/// hash point is not below it, wrapping at the end of the ring.
fn hval_to_vnode(vnodes: &[VNode], hval: u64) -> usize {
    let idx = vnodes.partition_point(|v| v.hash_point < hval);
    if idx == vnodes.len() { 0 } else { idx }
}

/// Walks the ring clockwise from `base` and returns the index of the `n`-th
/// distinct node encountered. Later vnodes of an already-seen node are
/// skipped.
pub fn get_nth_node(vnodes: &[VNode], base: usize, n: usize) -> usize {
    let mut seen: Vec<usize> = Vec::with_capacity(SD_MAX_REDUNDANCY);
    let mut idx = base;
    loop {
        let dup = seen.iter().any(|s| vnodes[*s].same_node(&vnodes[idx]));
        if !dup {
            if seen.len() == n {
                return idx;
            }
            seen.push(idx);
        }
        idx = (idx + 1) % vnodes.len();
    }
}

/// Returns the index of the vnode holding the `copy_idx`-th replica of the
/// object.
pub fn obj_to_sheep(vnodes: &[VNode], oid: u64, copy_idx: usize) -> usize {
    let base = hval_to_vnode(vnodes, obj_hash(oid));
    get_nth_node(vnodes, base, copy_idx)
}

/// Effective replica count: the configured copies capped by the number of
/// distinct zones in the membership.
pub fn get_max_copies(nodes: &[Node], configured_copies: usize) -> usize {
    let mut zones: Vec<u32> = Vec::with_capacity(SD_MAX_REDUNDANCY);
    for node in nodes {
        if zones.len() >= SD_MAX_REDUNDANCY {
            break;
        }
        if !zones.contains(&node.zone) {
            zones.push(node.zone);
        }
    }
    configured_copies.min(zones.len())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    pub fn test_node(last_octet: u8, port: u16, zone: u32) -> Node {
        Node {
            addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)),
            port,
            node_idx: last_octet as u16,
            zone,
        }
    }

    #[test]
    fn node_record_roundtrip() {
        let node = test_node(3, 7000, 3);
        let decoded = Node::decode(&node.encode());
        assert_eq!(decoded, node);
        assert_eq!(decoded.node_idx, node.node_idx);
        assert_eq!(decoded.zone, node.zone);
    }

    #[test]
    fn vnodes_sorted_and_deterministic() {
        let nodes: Vec<_> = (1..=4).map(|i| test_node(i, 7000, i as u32)).collect();
        let a = nodes_to_vnodes(&nodes);
        let b = nodes_to_vnodes(&nodes);
        assert_eq!(a, b);
        assert_eq!(a.len(), nodes.len() * SD_DEFAULT_VNODES);
        assert!(a.windows(2).all(|w| w[0].hash_point <= w[1].hash_point));
    }

    #[test]
    fn placement_distinct_nodes() {
        let nodes: Vec<_> = (1..=5).map(|i| test_node(i, 7000, i as u32)).collect();
        let vnodes = nodes_to_vnodes(&nodes);
        for oid in [1u64, 0xabcd_0000_0001, u64::MAX / 3] {
            let replicas: Vec<_> = (0..3).map(|k| obj_to_sheep(&vnodes, oid, k)).collect();
            for i in 0..replicas.len() {
                for j in 0..i {
                    assert!(!vnodes[replicas[i]].same_node(&vnodes[replicas[j]]));
                }
            }
            // deterministic
            assert_eq!(replicas[0], obj_to_sheep(&vnodes, oid, 0));
        }
    }

    #[test]
    fn copies_clamped_by_zones() {
        // four nodes but only two distinct zones
        let nodes = vec![
            test_node(1, 7000, 0),
            test_node(2, 7000, 0),
            test_node(3, 7000, 1),
            test_node(4, 7000, 1),
        ];
        assert_eq!(get_max_copies(&nodes, 3), 2);
        assert_eq!(get_max_copies(&nodes, 1), 1);
    }

    #[test]
    fn obj_cmp_is_hash_order() {
        let mut oids = vec![5u64, 1, 9, 2, 8];
        oids.sort_by(obj_cmp);
        assert!(oids.windows(2).all(|w| obj_hash(w[0]) <= obj_hash(w[1])));
    }
}
