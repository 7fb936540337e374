//! Cached TCP connections to peer nodes.
//!
//! Connections are keyed by the peer identity *and* the epoch the caller is
//! operating at, so a membership change implicitly invalidates every cached
//! connection of the previous epoch. A connection is checked out for
//! exclusive use and returned once the exchange on it completed cleanly;
//! dropping a checked-out connection is the eviction path.

use crate::proto;
use log::debug;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::sync::Mutex;

/// Identity of a cached peer connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PeerKey {
    pub addr: IpAddr,
    pub port: u16,
    pub node_idx: u16,
    pub epoch: u32,
}

#[derive(Default)]
pub struct ConnPool {
    pool: Mutex<HashMap<PeerKey, TcpStream>>,
}

impl ConnPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks out the connection for `key`, dialing the peer if none is
    /// cached.
    pub fn get(&self, key: PeerKey) -> io::Result<TcpStream> {
        if let Some(stream) = self.pool.lock().unwrap().remove(&key) {
            return Ok(stream);
        }
        debug!("connecting to {}:{}", key.addr, key.port);
        proto::connect_to(SocketAddr::new(key.addr, key.port))
    }

    /// Returns a connection after a clean exchange.
    ///
    /// A connection that saw a transport error must be dropped instead, so
    /// no stale response bytes can be paired with a later request.
    pub fn put(&self, key: PeerKey, stream: TcpStream) {
        self.pool.lock().unwrap().insert(key, stream);
    }

    /// Drops every cached connection of epochs older than `epoch`.
    pub fn drop_stale(&self, epoch: u32) {
        self.pool.lock().unwrap().retain(|k, _| k.epoch >= epoch);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;
    use std::net::TcpListener;

    fn key(port: u16, epoch: u32) -> PeerKey {
        PeerKey {
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            node_idx: 0,
            epoch,
        }
    }

    #[test]
    fn checkout_and_reuse() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = ConnPool::new();

        let stream = pool.get(key(port, 1)).unwrap();
        let local = stream.local_addr().unwrap();
        pool.put(key(port, 1), stream);

        // same key: the cached stream comes back
        let stream = pool.get(key(port, 1)).unwrap();
        assert_eq!(stream.local_addr().unwrap(), local);

        // different epoch: a fresh connection is dialed
        let other = pool.get(key(port, 2)).unwrap();
        assert_ne!(other.local_addr().unwrap(), local);
    }

    #[test]
    fn stale_epochs_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = ConnPool::new();

        let stream = pool.get(key(port, 1)).unwrap();
        let local = stream.local_addr().unwrap();
        pool.put(key(port, 1), stream);
        pool.drop_stale(2);

        let stream = pool.get(key(port, 1)).unwrap();
        assert_ne!(stream.local_addr().unwrap(), local);
    }
}
