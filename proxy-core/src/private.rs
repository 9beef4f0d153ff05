//! Private-connection mode (spec §4.4): a client's escape hatch from the shared, multiplexed
//! upstream connections onto dedicated sockets it alone owns.
//!
//! Entering private mode clones the shard table (`ShardId`s line up 1:1 with the shared map,
//! since the clone is built by walking the shared map in the same order — no name lookup is
//! needed to retarget a request onto its clone). Migrating in-flight work is split into two
//! cases with different risk profiles:
//!
//! - **Send queue.** Nothing has been written to a socket yet, so retargeting a request's
//!   shard to the private clone and moving it to the private send queue is a pure bookkeeping
//!   change. Requests with a write handler installed are mid-transmission over the shared
//!   socket and must not move (moving them would corrupt the byte stream); any request linked
//!   via `prev` to a skipped request is skipped too, to keep the pipeline chain intact.
//! - **Pending queue.** Every request here has *already* been written to the shared socket;
//!   its reply bytes will arrive on that physical connection no matter what bookkeeping says
//!   about client-level mode. Relocating its entry to a private pending list would desync the
//!   shared connection's own FIFO reply matching for no benefit, since reply delivery already
//!   resolves the owning client via the request's `client_id`. So pending requests are left on
//!   the shared per-shard queue; only `owned_by_client` is set, as a marker that no further
//!   requests from this client will join that queue.

use crate::error::ProxyError;
use crate::request::{ClientId, QueueLocation, RequestArena, RequestId};
use crate::slotmap::{ShardId, SlotMap};
use crate::upstream::UpstreamConnection;
use hashbrown::{HashMap, HashSet};
use std::collections::VecDeque;
use std::time::Duration;

pub struct PrivateState {
    pub slot_map: SlotMap,
    pub connections: HashMap<ShardId, UpstreamConnection>,
    pub send: VecDeque<RequestId>,
    pub pending: HashMap<ShardId, VecDeque<RequestId>>,
}

impl PrivateState {
    pub fn new(shared: &SlotMap) -> PrivateState {
        PrivateState {
            slot_map: shared.clone(),
            connections: HashMap::new(),
            send: VecDeque::new(),
            pending: HashMap::new(),
        }
    }

    pub fn connection_mut(&mut self, shard: ShardId) -> Option<&mut UpstreamConnection> {
        self.connections.get_mut(&shard)
    }

    /// Lazily connect this client's own dedicated socket to `shard`. Mirrors
    /// `SharedPool::ensure_connected`, minus the need for a "socket busy with another
    /// client" check — a private connection never serves more than one client.
    pub fn ensure_connected(
        &mut self,
        shard: ShardId,
        addr: &str,
        auth: Option<&str>,
        keepalive: Duration,
    ) -> Result<&mut UpstreamConnection, ProxyError> {
        if !self.connections.contains_key(&shard) {
            let conn = UpstreamConnection::connect(addr, auth, keepalive)?;
            self.connections.insert(shard, conn);
        }
        Ok(self.connections.get_mut(&shard).expect("just inserted"))
    }

    pub fn drop_connection(&mut self, shard: ShardId) {
        self.connections.remove(&shard);
    }
}

/// Move a client's not-yet-written requests from the worker's shared send queue onto its
/// private one, skipping any that are mid-transmission (or chained after one that is).
/// Requests already in flight on the shared pending queue are left alone; see module docs.
pub fn migrate_client(
    client_id: ClientId,
    private: &mut PrivateState,
    shared_send: &mut VecDeque<RequestId>,
    shared_pending: &mut HashMap<ShardId, VecDeque<RequestId>>,
    arena: &mut RequestArena,
) {
    let mut skipped: HashSet<RequestId> = HashSet::new();
    let mut to_move: Vec<RequestId> = Vec::new();

    for &id in shared_send.iter() {
        let req = match arena.get(id) {
            Some(req) => req,
            None => continue,
        };
        if req.client_id != client_id {
            continue;
        }
        let chained_after_skipped = req.prev.map_or(false, |p| skipped.contains(&p));
        if req.has_write_handler || chained_after_skipped {
            skipped.insert(id);
            continue;
        }
        to_move.push(id);
    }

    if !to_move.is_empty() {
        let moving: HashSet<RequestId> = to_move.iter().copied().collect();
        shared_send.retain(|id| !moving.contains(id));
        for id in to_move {
            if let Some(req) = arena.get_mut(id) {
                req.owned_by_client = true;
                req.location = QueueLocation::PrivateSend;
            }
            private.send.push_back(id);
        }
    }

    for queue in shared_pending.values_mut() {
        for &id in queue.iter() {
            if let Some(req) = arena.get_mut(id) {
                if req.client_id == client_id && !req.has_read_handler {
                    req.owned_by_client = true;
                }
            }
        }
    }
}

/// Enter private mode for a client that is not already in it. Cloning the shard table is
/// cheap relative to the sockets it will eventually open (those connect lazily, same as the
/// shared pool).
pub fn enter(shared: &SlotMap) -> PrivateState {
    PrivateState::new(shared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::drain_pipeline;
    use crate::slotmap::ShardNode;

    fn one_shard_map() -> SlotMap {
        let mut builder = SlotMap::builder();
        builder.add_shard(ShardNode {
            name: "s0".into(),
            ip: "127.0.0.1".into(),
            port: 7000,
            slots: vec![(0, 16383)],
            migrating: vec![],
            importing: vec![],
            is_replica: false,
        });
        builder.build().unwrap()
    }

    #[test]
    fn unblocked_send_queue_entries_migrate() {
        let shared_map = one_shard_map();
        let mut arena = RequestArena::new();
        let mut shared_send = VecDeque::new();
        let mut shared_pending = HashMap::new();

        let mut accum = b"*1\r\n$4\r\nPING\r\n".to_vec();
        let ids = drain_pipeline(42, &mut accum, &mut arena).unwrap();
        shared_send.push_back(ids[0]);

        let mut private = enter(&shared_map);
        migrate_client(42, &mut private, &mut shared_send, &mut shared_pending, &mut arena);

        assert!(shared_send.is_empty());
        assert_eq!(private.send.len(), 1);
        assert_eq!(arena.get(ids[0]).unwrap().location, QueueLocation::PrivateSend);
    }

    #[test]
    fn write_in_progress_request_is_not_migrated() {
        let shared_map = one_shard_map();
        let mut arena = RequestArena::new();
        let mut shared_send = VecDeque::new();
        let mut shared_pending = HashMap::new();

        let mut accum = b"*1\r\n$4\r\nPING\r\n".to_vec();
        let ids = drain_pipeline(42, &mut accum, &mut arena).unwrap();
        arena.get_mut(ids[0]).unwrap().has_write_handler = true;
        shared_send.push_back(ids[0]);

        let mut private = enter(&shared_map);
        migrate_client(42, &mut private, &mut shared_send, &mut shared_pending, &mut arena);

        assert_eq!(shared_send.len(), 1);
        assert!(private.send.is_empty());
    }

    #[test]
    fn chained_successor_of_skipped_request_is_also_skipped() {
        let shared_map = one_shard_map();
        let mut arena = RequestArena::new();
        let mut shared_send = VecDeque::new();
        let mut shared_pending = HashMap::new();

        let mut accum = b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n".to_vec();
        let ids = drain_pipeline(42, &mut accum, &mut arena).unwrap();
        arena.get_mut(ids[0]).unwrap().has_write_handler = true;
        shared_send.push_back(ids[0]);
        shared_send.push_back(ids[1]);

        let mut private = enter(&shared_map);
        migrate_client(42, &mut private, &mut shared_send, &mut shared_pending, &mut arena);

        assert_eq!(shared_send.len(), 2);
        assert!(private.send.is_empty());
    }
}
