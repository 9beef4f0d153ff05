//! Parsed request state and the per-thread request arena.
//!
//! Pipeline links (`prev`/`next`) are relations, not ownership (spec design note: "use an
//! arena-with-indices ... links are ids, not owning pointers"). Requests live in a `Slab`
//! keyed by `RequestId`; freeing a request removes its slot and invalidates the id, rather
//! than leaving a dangling pointer for a stale link to chase.

use crate::commands::CommandSpec;
use crate::slotmap::ShardId;
use slab::Slab;

pub type RequestId = usize;
pub type ClientId = u64;

/// Where a request currently lives. Spec invariant: a request is present in exactly one of
/// these at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLocation {
    ClientParseQueue,
    SharedSend,
    SharedPending,
    PrivateSend,
    PrivatePending,
}

pub struct Request {
    pub id: RequestId,
    pub client_id: ClientId,
    /// Raw bytes of exactly this request (post pipeline-split), owned.
    pub buf: Vec<u8>,
    /// Argument offset/length pairs into `buf`.
    pub args: Vec<(usize, usize)>,
    pub command: Option<CommandSpec>,
    pub command_name: String,
    pub shard: Option<ShardId>,
    pub slot: Option<u16>,
    /// Bytes of `buf` already written to the upstream socket.
    pub write_cursor: usize,
    pub has_write_handler: bool,
    pub has_read_handler: bool,
    /// Set once the request has been migrated onto a client's private connection.
    pub owned_by_client: bool,
    /// Set the first time this request is replayed after an upstream reconnect, so a second
    /// failure on the same connection is answered with an error instead of retried forever.
    pub reconnect_attempted: bool,
    pub location: QueueLocation,
    pub prev: Option<RequestId>,
    pub next: Option<RequestId>,
}

impl Request {
    pub fn arg(&self, index: usize) -> &[u8] {
        let (off, len) = self.args[index];
        &self.buf[off..off + len]
    }

    pub fn argc(&self) -> usize {
        self.args.len()
    }

    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.write_cursor..]
    }
}

/// Per-worker-thread arena owning every in-flight request on that thread.
#[derive(Default)]
pub struct RequestArena {
    slots: Slab<Request>,
}

impl RequestArena {
    pub fn new() -> RequestArena {
        RequestArena { slots: Slab::new() }
    }

    pub fn insert(
        &mut self,
        client_id: ClientId,
        buf: Vec<u8>,
        args: Vec<(usize, usize)>,
        command_name: String,
    ) -> RequestId {
        let entry = self.slots.vacant_entry();
        let id = entry.key();
        entry.insert(Request {
            id,
            client_id,
            buf,
            args,
            command: None,
            command_name,
            shard: None,
            slot: None,
            write_cursor: 0,
            has_write_handler: false,
            has_read_handler: false,
            owned_by_client: false,
            reconnect_attempted: false,
            location: QueueLocation::ClientParseQueue,
            prev: None,
            next: None,
        });
        id
    }

    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.slots.get(id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.slots.get_mut(id)
    }

    pub fn remove(&mut self, id: RequestId) -> Request {
        self.slots.remove(id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.slots.contains(id)
    }

    /// Fix up the pipeline chain around a request that's being freed so neither neighbour
    /// keeps a dangling link.
    pub fn unlink(&mut self, id: RequestId) {
        let (prev, next) = match self.slots.get(id) {
            Some(req) => (req.prev, req.next),
            None => return,
        };
        if let Some(prev_id) = prev {
            if let Some(prev_req) = self.slots.get_mut(prev_id) {
                prev_req.next = next;
            }
        }
        if let Some(next_id) = next {
            if let Some(next_req) = self.slots.get_mut(next_id) {
                next_req.prev = prev;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_fetch_roundtrip() {
        let mut arena = RequestArena::new();
        let id = arena.insert(1, b"*1\r\n$4\r\nPING\r\n".to_vec(), vec![(4, 4)], "ping".into());
        let req = arena.get(id).unwrap();
        assert_eq!(req.arg(0), b"PING");
    }

    #[test]
    fn unlink_fixes_up_neighbours() {
        let mut arena = RequestArena::new();
        let a = arena.insert(1, vec![], vec![], "get".into());
        let b = arena.insert(1, vec![], vec![], "get".into());
        let c = arena.insert(1, vec![], vec![], "get".into());

        arena.get_mut(a).unwrap().next = Some(b);
        arena.get_mut(b).unwrap().prev = Some(a);
        arena.get_mut(b).unwrap().next = Some(c);
        arena.get_mut(c).unwrap().prev = Some(b);

        arena.unlink(b);
        arena.remove(b);

        assert_eq!(arena.get(a).unwrap().next, Some(c));
        assert_eq!(arena.get(c).unwrap().prev, Some(a));
    }
}
