//! Per-worker shared upstream connection pool (spec §4.5).
//!
//! Connections are addressed by `ShardId` alone. The "vector of `worker_count + 1` slots"
//! the original design uses to let every thread index into one shared array is unnecessary
//! here: each worker owns its own `SharedPool`, so there is nothing to index by worker id in
//! the first place, and no per-node connect mutex is needed (see `upstream` module docs).

use crate::error::ProxyError;
use crate::slotmap::ShardId;
use crate::upstream::UpstreamConnection;
use hashbrown::HashMap;
use std::time::Duration;

pub struct SharedPool {
    connections: HashMap<ShardId, UpstreamConnection>,
    keepalive: Duration,
    auth: Option<String>,
}

impl SharedPool {
    pub fn new(keepalive: Duration, auth: Option<String>) -> SharedPool {
        SharedPool {
            connections: HashMap::new(),
            keepalive,
            auth,
        }
    }

    pub fn get(&mut self, shard: ShardId) -> Option<&mut UpstreamConnection> {
        self.connections.get_mut(&shard)
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        self.connections.contains_key(&shard)
    }

    /// Ensure a live connection exists for `shard`, connecting lazily (and running AUTH) if
    /// needed. Returns the connection on success.
    pub fn ensure_connected(&mut self, shard: ShardId, addr: &str) -> Result<&mut UpstreamConnection, ProxyError> {
        if !self.connections.contains_key(&shard) {
            let conn = UpstreamConnection::connect(addr, self.auth.as_deref(), self.keepalive)?;
            self.connections.insert(shard, conn);
        }
        Ok(self.connections.get_mut(&shard).expect("just inserted"))
    }

    /// Drop a dead connection so the next dispatch attempt reconnects from scratch.
    pub fn drop_connection(&mut self, shard: ShardId) {
        self.connections.remove(&shard);
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ShardId, &mut UpstreamConnection)> {
        self.connections.iter_mut().map(|(&id, conn)| (id, conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_connected_fails_cleanly_on_unreachable_address() {
        let mut pool = SharedPool::new(Duration::from_secs(15), None);
        let result = pool.ensure_connected(ShardId(0), "127.0.0.1:1");
        assert!(result.is_err());
        assert!(!pool.contains(ShardId(0)));
    }
}
