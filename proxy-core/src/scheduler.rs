//! The per-thread event loop (spec §4.3): one cooperative, single-threaded scheduler per
//! worker, driven by mio readiness. This is the component the rest of the crate exists to
//! support — parsing, routing, connection pooling and private-mode migration are all called
//! from here.
//!
//! Token space: `Token(0)` is reserved for the worker's wake signal (the idiomatic mio 0.8
//! replacement for the original design's wake pipe — `mio::Waker` posts a byte through the
//! same underlying mechanism without the proxy having to own a pipe fd itself). Every other
//! token is handed out from a monotonic per-worker counter and resolved back to what it
//! refers to through `tokens`, since a worker juggles four different kinds of registered
//! I/O source (client sockets, shared upstream sockets, and private upstream sockets) rather
//! than the single connection kind a plain echo server multiplexes.

use crate::client::{Client, ClientTable};
use crate::commands::CommandTable;
use crate::config::{Config, MultiplexMode};
use crate::error::ProxyError;
use crate::pool::SharedPool;
use crate::private::{self, PrivateState};
use crate::protocol::drain_pipeline;
use crate::buffer::ChunkPool;
use crate::reply;
use crate::request::{ClientId, QueueLocation, RequestArena, RequestId};
use crate::routing::{self, RouteOutcome};
use crate::slotmap::{ShardId, SlotMap};
use hashbrown::HashMap;
use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Auto-mode multiplexing switches off for every client on a worker once either shared
/// queue reaches this length during one pre-sleep tick (spec §4.3, §8 property 6).
pub const MULTIPLEXING_MAX_REQUEST_QUEUE_LEN: usize = 5;

const WAKE_TOKEN: Token = Token(0);
const FIRST_DYNAMIC_TOKEN: usize = 1;
const READ_CHUNK: usize = 16 * 1024;

/// Resolution of spec.md §9's open question on `handleNextRequestToCluster`'s ambiguous
/// 0/1 return convention.
pub enum DispatchOutcome {
    Progress,
    Idle,
    Error(ProxyError),
}

#[derive(Clone, Copy)]
enum TokenKind {
    Client(ClientId),
    SharedUpstream(ShardId),
    PrivateUpstream(ClientId, ShardId),
}

pub struct NewClientMsg {
    pub client_id: ClientId,
    pub addr: SocketAddr,
    pub stream: MioTcpStream,
}

/// Handle the listener thread uses to hand accepted connections to a worker (spec §4.6).
pub struct WorkerHandle {
    pub mailbox: Arc<Mutex<VecDeque<NewClientMsg>>>,
    pub waker: Arc<Waker>,
}

pub struct Worker {
    id: usize,
    poll: Poll,
    events: Events,
    mailbox: Arc<Mutex<VecDeque<NewClientMsg>>>,
    clients: ClientTable,
    arena: RequestArena,
    chunk_pool: ChunkPool,
    pool: SharedPool,
    shared_send: VecDeque<RequestId>,
    shared_pending: HashMap<ShardId, VecDeque<RequestId>>,
    tokens: HashMap<Token, TokenKind>,
    next_token: usize,
    shared_map: Arc<SlotMap>,
    commands: Arc<CommandTable>,
    config: Arc<Config>,
}

/// Spawn a worker thread with its own event loop, returning a handle the listener uses to
/// feed it accepted connections.
pub fn spawn_worker(
    id: usize,
    shared_map: Arc<SlotMap>,
    commands: Arc<CommandTable>,
    config: Arc<Config>,
) -> io::Result<(JoinHandle<()>, WorkerHandle)> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
    let mailbox = Arc::new(Mutex::new(VecDeque::new()));
    let handle = WorkerHandle {
        mailbox: mailbox.clone(),
        waker: waker.clone(),
    };

    let join = thread::Builder::new()
        .name(format!("proxy-worker-{id}"))
        .spawn(move || {
            let mut worker = Worker::new(id, poll, mailbox, shared_map, commands, config);
            worker.run();
        })?;

    Ok((join, handle))
}

impl Worker {
    fn new(
        id: usize,
        poll: Poll,
        mailbox: Arc<Mutex<VecDeque<NewClientMsg>>>,
        shared_map: Arc<SlotMap>,
        commands: Arc<CommandTable>,
        config: Arc<Config>,
    ) -> Worker {
        let keepalive = config.tcpkeepalive;
        let auth = config.auth.clone();
        Worker {
            id,
            poll,
            events: Events::with_capacity(1024),
            mailbox,
            clients: ClientTable::new(),
            arena: RequestArena::new(),
            chunk_pool: ChunkPool::new(),
            pool: SharedPool::new(keepalive, auth),
            shared_send: VecDeque::new(),
            shared_pending: HashMap::new(),
            tokens: HashMap::new(),
            next_token: FIRST_DYNAMIC_TOKEN,
            shared_map,
            commands,
            config,
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn run(&mut self) -> ! {
        loop {
            if let Err(err) = self.tick() {
                tracing::warn!(worker = self.id, error = %err, "event loop iteration failed");
            }
        }
    }

    fn tick(&mut self) -> io::Result<()> {
        self.flush_all_client_output();
        self.maybe_toggle_multiplex_mode();
        self.drain_send_queues();

        self.poll.poll(&mut self.events, Some(Duration::from_millis(100)))?;
        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            self.dispatch_event(token, readable, writable);
        }
        Ok(())
    }

    fn dispatch_event(&mut self, token: Token, readable: bool, writable: bool) {
        if token == WAKE_TOKEN {
            self.drain_mailbox();
            return;
        }

        let kind = match self.tokens.get(&token) {
            Some(kind) => *kind,
            None => return,
        };

        match kind {
            TokenKind::Client(id) => {
                if readable {
                    self.handle_client_readable(id);
                }
                if writable && self.clients.get(id).is_some() {
                    self.handle_client_writable(id);
                }
            }
            TokenKind::SharedUpstream(shard) => {
                if readable {
                    self.handle_shared_upstream_readable(shard);
                }
                if writable {
                    self.drain_shared_send_queue();
                }
            }
            TokenKind::PrivateUpstream(client_id, shard) => {
                if readable {
                    self.handle_private_upstream_readable(client_id, shard);
                }
                if writable {
                    self.drain_private_send_queue(client_id);
                }
            }
        }
    }

    // ---- accept / mailbox -------------------------------------------------

    fn drain_mailbox(&mut self) {
        let messages: Vec<NewClientMsg> = {
            let mut guard = self.mailbox.lock().expect("mailbox mutex poisoned");
            guard.drain(..).collect()
        };

        for msg in messages {
            self.link_client(msg);
        }
    }

    fn link_client(&mut self, mut msg: NewClientMsg) {
        let token = self.alloc_token();
        let registry = self.poll.registry();
        if registry.register(&mut msg.stream, token, Interest::READABLE).is_err() {
            // NONE -> UNLINKED: registration failed, drop the connection outright.
            return;
        }

        let mut client = Client::new(msg.client_id, msg.addr, self.id, msg.stream, token);
        client.registered_interest = Some(Interest::READABLE);
        if self.config.multiplex_mode == MultiplexMode::Always {
            // A brand new client has nothing in flight yet, so there's no send/pending
            // queue to migrate — just start it in private mode outright.
            client.private = Some(private::enter(&self.shared_map));
        }
        self.tokens.insert(token, TokenKind::Client(msg.client_id));
        self.clients.insert(client);
    }

    // ---- client I/O ---------------------------------------------------------

    fn handle_client_readable(&mut self, client_id: ClientId) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let client = match self.clients.get_mut(client_id) {
                Some(c) => c,
                None => return,
            };
            match client.stream.read(&mut buf) {
                Ok(0) => {
                    self.free_client(client_id);
                    return;
                }
                Ok(n) => {
                    client.accum.extend_from_slice(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.free_client(client_id);
                    return;
                }
            }
        }
        self.process_client_input(client_id);
    }

    fn process_client_input(&mut self, client_id: ClientId) {
        let produced = {
            let client = match self.clients.get_mut(client_id) {
                Some(c) => c,
                None => return,
            };
            drain_pipeline(client_id, &mut client.accum, &mut self.arena)
        };

        match produced {
            Ok(ids) => {
                if let Some(client) = self.clients.get_mut(client_id) {
                    for id in ids {
                        client.queue_parsed(id);
                    }
                }
                self.route_parsed_requests(client_id);
            }
            Err(e) => {
                self.reply_directly(client_id, &e);
            }
        }

        self.reconcile_client_interest(client_id);
    }

    /// Drain a client's parse queue (spec §3: "a queue of fully-parsed-but-not-yet-processed
    /// requests"), routing and enqueuing each request onto its shared or private send queue in
    /// parse order.
    fn route_parsed_requests(&mut self, client_id: ClientId) {
        loop {
            let id = {
                let client = match self.clients.get_mut(client_id) {
                    Some(c) => c,
                    None => return,
                };
                match client.pop_parsed() {
                    Some(id) => id,
                    None => break,
                }
            };
            self.route_and_enqueue(client_id, id);
        }
    }

    fn route_and_enqueue(&mut self, client_id: ClientId, id: RequestId) {
        let outcome = {
            let client = match self.clients.get(client_id) {
                Some(c) => c,
                None => return,
            };
            let req = match self.arena.get(id) {
                Some(req) => req,
                None => return,
            };
            let active_map: &SlotMap = client
                .private
                .as_ref()
                .map(|p| &p.slot_map)
                .unwrap_or(&self.shared_map);
            routing::route(req, &self.commands, active_map)
        };

        match outcome {
            RouteOutcome::Shard(shard) => {
                if let Some(req) = self.arena.get_mut(id) {
                    req.shard = Some(shard);
                    req.slot = routing::first_key_slot(req, &self.commands);
                }
                let is_private = self.clients.get(client_id).map_or(false, Client::is_private);
                if is_private {
                    if let Some(client) = self.clients.get_mut(client_id) {
                        if let Some(private) = client.private.as_mut() {
                            if let Some(req) = self.arena.get_mut(id) {
                                req.location = QueueLocation::PrivateSend;
                            }
                            private.send.push_back(id);
                        }
                    }
                } else {
                    if let Some(req) = self.arena.get_mut(id) {
                        req.location = QueueLocation::SharedSend;
                    }
                    self.shared_send.push_back(id);
                }
            }
            RouteOutcome::Error(e) => {
                self.fail_request(id, e);
            }
        }
    }

    fn handle_client_writable(&mut self, client_id: ClientId) {
        self.flush_client(client_id);
        self.reconcile_client_interest(client_id);
    }

    fn flush_client(&mut self, client_id: ClientId) {
        if let Some(client) = self.clients.get_mut(client_id) {
            let _ = client.output.egress(&mut client.stream, &mut self.chunk_pool);
        }
    }

    fn flush_all_client_output(&mut self) {
        let ids = self.clients.ids();
        for id in ids {
            self.flush_client(id);
            self.reconcile_client_interest(id);
        }
    }

    /// Recompute and apply a client's desired mio interest from its current state: readable
    /// unless it is backpressured, writable whenever its output buffer is non-empty.
    fn reconcile_client_interest(&mut self, client_id: ClientId) {
        let registry_ptr: *const mio::Registry = self.poll.registry();
        let client = match self.clients.get_mut(client_id) {
            Some(c) => c,
            None => return,
        };

        let want_read = !client.is_backpressured();
        let want_write = !client.output.is_empty();
        let desired = match (want_read, want_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        if desired == client.registered_interest {
            return;
        }

        // Safety: `registry_ptr` outlives this call (it is a field of `self.poll`, not
        // touched again before use) and `Registry`'s register/reregister/deregister take
        // `&self`, so this only works around the borrow checker not splitting `self.poll`
        // and `self.clients` through the `Poll` accessor method.
        let registry = unsafe { &*registry_ptr };
        match (client.registered_interest, desired) {
            (None, Some(want)) => {
                let _ = registry.register(&mut client.stream, client.token, want);
            }
            (Some(_), Some(want)) => {
                let _ = registry.reregister(&mut client.stream, client.token, want);
            }
            (Some(_), None) => {
                let _ = registry.deregister(&mut client.stream);
            }
            (None, None) => {}
        }
        client.registered_interest = desired;
    }

    fn free_client(&mut self, client_id: ClientId) {
        let Some(mut client) = self.clients.remove(client_id) else { return };
        let _ = self.poll.registry().deregister(&mut client.stream);
        self.tokens.remove(&client.token);

        for id in client.parse_queue.drain(..) {
            self.arena.unlink(id);
            self.arena.remove(id);
        }

        self.shared_send.retain(|&id| {
            let belongs = self.arena.get(id).map_or(false, |r| r.client_id == client_id);
            if belongs {
                self.arena.unlink(id);
                self.arena.remove(id);
            }
            !belongs
        });

        for queue in self.shared_pending.values_mut() {
            for &id in queue.iter() {
                if let Some(req) = self.arena.get_mut(id) {
                    if req.client_id == client_id {
                        // Leave the slot in the queue (its bytes are still coming on the
                        // shared socket) but drop its owner so the reply is discarded per
                        // the empty-pending-head tolerance in the concurrency model.
                        req.client_id = u64::MAX;
                    }
                }
            }
        }

        // If this client's request was mid-write on a shared upstream when the client was
        // freed, `current_writer` is left pointing at a client that no longer exists and the
        // socket holds an abandoned partial write. The connection can't be trusted for
        // framing any more, so drop it outright (matching the reconnect-once-then-drain
        // policy) rather than leave the shard's shared send queue permanently stuck on the
        // busy check in `try_dispatch_shared_head`.
        let stuck_shards: Vec<ShardId> = self
            .pool
            .iter_mut()
            .filter(|(_, conn)| conn.current_writer == Some(client_id))
            .map(|(shard, _)| shard)
            .collect();
        for shard in stuck_shards {
            self.drop_shared_connection(shard);
            for id in self.shared_pending.remove(&shard).unwrap_or_default() {
                self.fail_request(id, ProxyError::ClusterNodeDisconnected);
            }
        }

        if let Some(mut private) = client.private.take() {
            for id in private.send.drain(..) {
                self.arena.unlink(id);
                self.arena.remove(id);
            }
            for (_, mut queue) in private.pending.drain() {
                for id in queue.drain(..) {
                    self.arena.unlink(id);
                    self.arena.remove(id);
                }
            }
        }
    }

    fn reply_directly(&mut self, client_id: ClientId, err: &ProxyError) {
        if let Some(client) = self.clients.get_mut(client_id) {
            let line = format!("-ERR {}\r\n", err.wire_text());
            client.output.append(line.as_bytes());
        }
    }

    fn fail_request(&mut self, id: RequestId, err: ProxyError) {
        let client_id = self.arena.get(id).map(|r| r.client_id);
        self.arena.unlink(id);
        self.arena.remove(id);
        if let Some(client_id) = client_id {
            self.reply_directly(client_id, &err);
            if let Some(client) = self.clients.get_mut(client_id) {
                client.note_replied();
            }
            self.reconcile_client_interest(client_id);
        }
    }

    // ---- multiplex mode toggling -------------------------------------------

    fn maybe_toggle_multiplex_mode(&mut self) {
        if self.config.multiplex_mode != MultiplexMode::Auto {
            return;
        }

        let pending_len: usize = self.shared_pending.values().map(VecDeque::len).sum();
        if self.shared_send.len() < MULTIPLEXING_MAX_REQUEST_QUEUE_LEN
            && pending_len < MULTIPLEXING_MAX_REQUEST_QUEUE_LEN
        {
            return;
        }

        let ids = self.clients.ids();
        for id in ids {
            self.enter_private_mode(id);
        }
    }

    fn enter_private_mode(&mut self, client_id: ClientId) {
        let already_private = self.clients.get(client_id).map_or(true, Client::is_private);
        if already_private {
            return;
        }

        let mut state = private::enter(&self.shared_map);
        private::migrate_client(client_id, &mut state, &mut self.shared_send, &mut self.shared_pending, &mut self.arena);

        if let Some(client) = self.clients.get_mut(client_id) {
            client.private = Some(state);
        }
    }

    // ---- send-queue dispatch ------------------------------------------------

    fn drain_send_queues(&mut self) {
        self.drain_shared_send_queue();
        let private_client_ids: Vec<ClientId> = self
            .clients
            .ids()
            .into_iter()
            .filter(|&id| self.clients.get(id).map_or(false, Client::is_private))
            .collect();
        for id in private_client_ids {
            self.drain_private_send_queue(id);
        }
    }

    fn drain_shared_send_queue(&mut self) {
        loop {
            match self.try_dispatch_shared_head() {
                DispatchOutcome::Progress => continue,
                DispatchOutcome::Idle => break,
                DispatchOutcome::Error(e) => {
                    tracing::debug!(worker = self.id, error = %e, "shared dispatch error");
                    continue;
                }
            }
        }
    }

    fn try_dispatch_shared_head(&mut self) -> DispatchOutcome {
        let id = match self.shared_send.front().copied() {
            Some(id) => id,
            None => return DispatchOutcome::Idle,
        };

        let (client_id, shard, slot, prev) = match self.arena.get(id) {
            Some(req) => (req.client_id, req.shard, req.slot, req.prev),
            None => {
                self.shared_send.pop_front();
                return DispatchOutcome::Progress;
            }
        };

        let shard = match shard {
            Some(shard) => shard,
            None => {
                self.shared_send.pop_front();
                self.fail_request(id, ProxyError::ProtocolError);
                return DispatchOutcome::Error(ProxyError::ProtocolError);
            }
        };

        if let Some(prev_id) = prev {
            if let Some(prev_req) = self.arena.get(prev_id) {
                if prev_req.slot != slot {
                    return DispatchOutcome::Idle;
                }
            }
        }

        let addr = self.shared_map.shard(shard).addr();
        let conn = match self.pool.ensure_connected(shard, &addr) {
            Ok(conn) => conn,
            Err(_) => {
                self.shared_send.pop_front();
                self.fail_request(id, ProxyError::ConnectFailed);
                return DispatchOutcome::Progress;
            }
        };

        if let Some(busy_client) = conn.current_writer {
            if busy_client != client_id {
                return DispatchOutcome::Idle;
            }
        }

        let remaining = match self.arena.get(id) {
            Some(req) => req.remaining().to_vec(),
            None => {
                self.shared_send.pop_front();
                return DispatchOutcome::Progress;
            }
        };

        match conn.write_bytes(&remaining) {
            Ok(n) if n == remaining.len() => {
                conn.current_writer = None;
                self.shared_send.pop_front();
                if let Some(req) = self.arena.get_mut(id) {
                    req.write_cursor += n;
                    req.has_write_handler = false;
                    req.location = QueueLocation::SharedPending;
                }
                self.shared_pending.entry(shard).or_default().push_back(id);
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.note_dispatched();
                }
                self.register_shared_upstream_interest(shard, Interest::READABLE);
                DispatchOutcome::Progress
            }
            Ok(n) => {
                if let Some(req) = self.arena.get_mut(id) {
                    req.write_cursor += n;
                    req.has_write_handler = true;
                }
                conn.current_writer = Some(client_id);
                self.register_shared_upstream_interest(shard, Interest::READABLE | Interest::WRITABLE);
                DispatchOutcome::Idle
            }
            Err(_) => {
                self.drop_shared_connection(shard);
                self.shared_send.pop_front();
                self.fail_request(id, ProxyError::ClusterNodeDisconnected);
                DispatchOutcome::Progress
            }
        }
    }

    fn drain_private_send_queue(&mut self, client_id: ClientId) {
        loop {
            match self.try_dispatch_private_head(client_id) {
                DispatchOutcome::Progress => continue,
                DispatchOutcome::Idle => break,
                DispatchOutcome::Error(e) => {
                    tracing::debug!(worker = self.id, error = %e, "private dispatch error");
                    continue;
                }
            }
        }
    }

    fn try_dispatch_private_head(&mut self, client_id: ClientId) -> DispatchOutcome {
        let id = {
            let client = match self.clients.get(client_id) {
                Some(c) => c,
                None => return DispatchOutcome::Idle,
            };
            let private = match client.private.as_ref() {
                Some(p) => p,
                None => return DispatchOutcome::Idle,
            };
            match private.send.front().copied() {
                Some(id) => id,
                None => return DispatchOutcome::Idle,
            }
        };

        let (shard, slot, prev) = match self.arena.get(id) {
            Some(req) => (req.shard, req.slot, req.prev),
            None => {
                self.pop_private_send(client_id);
                return DispatchOutcome::Progress;
            }
        };

        let shard = match shard {
            Some(shard) => shard,
            None => {
                self.pop_private_send(client_id);
                self.fail_request(id, ProxyError::ProtocolError);
                return DispatchOutcome::Error(ProxyError::ProtocolError);
            }
        };

        if let Some(prev_id) = prev {
            if let Some(prev_req) = self.arena.get(prev_id) {
                if prev_req.slot != slot {
                    return DispatchOutcome::Idle;
                }
            }
        }

        let auth = self.config.auth.clone();
        let keepalive = self.config.tcpkeepalive;

        let client = match self.clients.get_mut(client_id) {
            Some(c) => c,
            None => return DispatchOutcome::Idle,
        };
        let private = match client.private.as_mut() {
            Some(p) => p,
            None => return DispatchOutcome::Idle,
        };
        let addr = private.slot_map.shard(shard).addr();
        let conn = match private.ensure_connected(shard, &addr, auth.as_deref(), keepalive) {
            Ok(conn) => conn,
            Err(_) => {
                private.send.pop_front();
                self.fail_request(id, ProxyError::ConnectFailed);
                return DispatchOutcome::Progress;
            }
        };

        let remaining = match self.arena.get(id) {
            Some(req) => req.remaining().to_vec(),
            None => {
                private.send.pop_front();
                return DispatchOutcome::Progress;
            }
        };

        match conn.write_bytes(&remaining) {
            Ok(n) if n == remaining.len() => {
                private.send.pop_front();
                private.pending.entry(shard).or_default().push_back(id);
                drop(private);
                self.register_private_upstream_interest(client_id, shard, Interest::READABLE);
                if let Some(req) = self.arena.get_mut(id) {
                    req.write_cursor += n;
                    req.has_write_handler = false;
                    req.location = QueueLocation::PrivatePending;
                }
                DispatchOutcome::Progress
            }
            Ok(n) => {
                drop(private);
                self.register_private_upstream_interest(client_id, shard, Interest::READABLE | Interest::WRITABLE);
                if let Some(req) = self.arena.get_mut(id) {
                    req.write_cursor += n;
                    req.has_write_handler = true;
                }
                DispatchOutcome::Idle
            }
            Err(_) => {
                drop(private);
                self.drop_private_connection(client_id, shard);
                if let Some(client) = self.clients.get_mut(client_id) {
                    if let Some(private) = client.private.as_mut() {
                        private.send.pop_front();
                    }
                }
                self.fail_request(id, ProxyError::ClusterNodeDisconnected);
                DispatchOutcome::Progress
            }
        }
    }

    fn pop_private_send(&mut self, client_id: ClientId) {
        if let Some(client) = self.clients.get_mut(client_id) {
            if let Some(private) = client.private.as_mut() {
                private.send.pop_front();
            }
        }
    }

    // ---- reply dispatch ------------------------------------------------------

    fn handle_shared_upstream_readable(&mut self, shard: ShardId) {
        let outcome = match self.pool.get(shard) {
            Some(conn) => conn.read_available(&mut self.chunk_pool),
            None => return,
        };
        match outcome {
            Ok(_) => self.drain_shared_replies(shard),
            Err(_) => self.handle_shard_disconnect(shard),
        }
    }

    fn drain_shared_replies(&mut self, shard: ShardId) {
        loop {
            let reply_bytes = {
                let conn = match self.pool.get(shard) {
                    Some(c) => c,
                    None => return,
                };
                let available = conn.reader.peek(conn.reader.len());
                let len = match reply::reply_len(&available) {
                    Some(len) => len,
                    None => break,
                };
                let bytes = conn.reader.peek(len);
                conn.reader.consume(len, &mut self.chunk_pool);
                bytes
            };

            let next = self.shared_pending.get_mut(&shard).and_then(VecDeque::pop_front);
            if let Some(id) = next {
                let client_id = self.arena.get(id).map(|r| r.client_id);
                self.arena.unlink(id);
                self.arena.remove(id);
                if let Some(client_id) = client_id {
                    if client_id != u64::MAX {
                        if let Some(client) = self.clients.get_mut(client_id) {
                            client.output.append(&reply_bytes);
                            client.note_replied();
                        }
                        self.reconcile_client_interest(client_id);
                    }
                }
            }
        }

        if self.shared_pending.get(&shard).map_or(true, VecDeque::is_empty) {
            self.register_shared_upstream_interest(shard, Interest::READABLE);
        }
    }

    /// Single-reconnect-then-drain policy (spec §9 open question, resolved): the pending
    /// head — the one request whose bytes were actually in flight — is replayed once by
    /// requeuing it at the front of the send queue. Everything behind it in the pending
    /// queue already had its reply lost with no way to recover it, so those are failed
    /// immediately instead of leaving a silent, unbounded data-loss window.
    fn handle_shard_disconnect(&mut self, shard: ShardId) {
        self.drop_shared_connection(shard);
        let mut queue = self.shared_pending.remove(&shard).unwrap_or_default();

        if let Some(head_id) = queue.pop_front() {
            let already_tried = self
                .arena
                .get(head_id)
                .map_or(true, |r| r.reconnect_attempted);
            if already_tried {
                self.fail_request(head_id, ProxyError::ClusterNodeDisconnected);
            } else if let Some(req) = self.arena.get_mut(head_id) {
                req.reconnect_attempted = true;
                req.write_cursor = 0;
                req.has_write_handler = false;
                req.has_read_handler = false;
                req.location = QueueLocation::SharedSend;
                self.shared_send.push_front(head_id);
            }
        }

        for id in queue {
            self.fail_request(id, ProxyError::ClusterNodeDisconnected);
        }
    }

    fn handle_private_upstream_readable(&mut self, client_id: ClientId, shard: ShardId) {
        let outcome = {
            let client = match self.clients.get_mut(client_id) {
                Some(c) => c,
                None => return,
            };
            let private = match client.private.as_mut() {
                Some(p) => p,
                None => return,
            };
            match private.connection_mut(shard) {
                Some(conn) => conn.read_available(&mut self.chunk_pool),
                None => return,
            }
        };
        match outcome {
            Ok(_) => self.drain_private_replies(client_id, shard),
            Err(_) => self.handle_private_disconnect(client_id, shard),
        }
    }

    fn drain_private_replies(&mut self, client_id: ClientId, shard: ShardId) {
        loop {
            let reply_bytes = {
                let client = match self.clients.get_mut(client_id) {
                    Some(c) => c,
                    None => return,
                };
                let private = match client.private.as_mut() {
                    Some(p) => p,
                    None => return,
                };
                let conn = match private.connection_mut(shard) {
                    Some(c) => c,
                    None => return,
                };
                let available = conn.reader.peek(conn.reader.len());
                let len = match reply::reply_len(&available) {
                    Some(len) => len,
                    None => break,
                };
                let bytes = conn.reader.peek(len);
                conn.reader.consume(len, &mut self.chunk_pool);
                bytes
            };

            let next_id = self.clients.get_mut(client_id).and_then(|client| {
                client.private.as_mut().and_then(|p| p.pending.get_mut(&shard)).and_then(VecDeque::pop_front)
            });

            if let Some(id) = next_id {
                self.arena.unlink(id);
                self.arena.remove(id);
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.output.append(&reply_bytes);
                    client.note_replied();
                }
                self.reconcile_client_interest(client_id);
            }
        }

        let empty = self
            .clients
            .get(client_id)
            .and_then(|c| c.private.as_ref())
            .and_then(|p| p.pending.get(&shard))
            .map_or(true, VecDeque::is_empty);
        if empty {
            self.register_private_upstream_interest(client_id, shard, Interest::READABLE);
        }
    }

    fn handle_private_disconnect(&mut self, client_id: ClientId, shard: ShardId) {
        self.drop_private_connection(client_id, shard);
        let queue = self.clients.get_mut(client_id).and_then(|client| {
            client.private.as_mut().map(|p| p.pending.remove(&shard).unwrap_or_default())
        });

        let mut queue = match queue {
            Some(q) => q,
            None => return,
        };

        if let Some(head_id) = queue.pop_front() {
            let already_tried = self.arena.get(head_id).map_or(true, |r| r.reconnect_attempted);
            if already_tried {
                self.fail_request(head_id, ProxyError::ClusterNodeDisconnected);
            } else {
                if let Some(req) = self.arena.get_mut(head_id) {
                    req.reconnect_attempted = true;
                    req.write_cursor = 0;
                    req.has_write_handler = false;
                    req.has_read_handler = false;
                    req.location = QueueLocation::PrivateSend;
                }
                if let Some(client) = self.clients.get_mut(client_id) {
                    if let Some(private) = client.private.as_mut() {
                        private.send.push_front(head_id);
                    }
                }
            }
        }

        for id in queue {
            self.fail_request(id, ProxyError::ClusterNodeDisconnected);
        }
    }

    // ---- interest registration helpers ---------------------------------------

    /// Drop a shared upstream connection and forget its token mapping, so a later reconnect
    /// doesn't leave a stale `self.tokens` entry pointing at a socket that no longer exists.
    fn drop_shared_connection(&mut self, shard: ShardId) {
        if let Some(conn) = self.pool.get(shard) {
            if let Some(token) = conn.token {
                self.tokens.remove(&token);
            }
        }
        self.pool.drop_connection(shard);
    }

    /// Same as `drop_shared_connection`, for a client's private upstream.
    fn drop_private_connection(&mut self, client_id: ClientId, shard: ShardId) {
        if let Some(private) = self.clients.get_mut(client_id).and_then(|c| c.private.as_mut()) {
            if let Some(token) = private.connection_mut(shard).and_then(|c| c.token) {
                self.tokens.remove(&token);
            }
            private.drop_connection(shard);
        }
    }

    fn register_shared_upstream_interest(&mut self, shard: ShardId, desired: Interest) {
        let registry_ptr: *const mio::Registry = self.poll.registry();
        let token_for_shard = self
            .tokens
            .iter()
            .find_map(|(&t, k)| matches!(k, TokenKind::SharedUpstream(s) if *s == shard).then_some(t));

        let conn = match self.pool.get(shard) {
            Some(c) => c,
            None => return,
        };

        let token = match (conn.token, token_for_shard) {
            (Some(t), _) => t,
            (None, _) => {
                let t = self.alloc_token();
                conn.token = Some(t);
                self.tokens.insert(t, TokenKind::SharedUpstream(shard));
                t
            }
        };

        if conn.registered_interest == Some(desired) {
            return;
        }

        let registry = unsafe { &*registry_ptr };
        match conn.registered_interest {
            None => {
                let _ = registry.register(&mut conn.stream, token, desired);
            }
            Some(_) => {
                let _ = registry.reregister(&mut conn.stream, token, desired);
            }
        }
        conn.registered_interest = Some(desired);
    }

    fn register_private_upstream_interest(&mut self, client_id: ClientId, shard: ShardId, desired: Interest) {
        let registry_ptr: *const mio::Registry = self.poll.registry();
        let existing_token = self.clients.get(client_id).and_then(|c| {
            c.private.as_ref().and_then(|p| p.connections.get(&shard)).and_then(|c| c.token)
        });
        // Each private connection needs its own token (one per client per shard); reusing a
        // single fixed token across every private connection on the worker would make the
        // registry's token -> source mapping ambiguous the moment two private connections
        // are live at once.
        let token = existing_token.unwrap_or_else(|| self.alloc_token());

        let client = match self.clients.get_mut(client_id) {
            Some(c) => c,
            None => return,
        };
        let private = match client.private.as_mut() {
            Some(p) => p,
            None => return,
        };
        let conn = match private.connection_mut(shard) {
            Some(c) => c,
            None => return,
        };

        if conn.registered_interest == Some(desired) {
            return;
        }

        let registry = unsafe { &*registry_ptr };
        conn.token = Some(token);

        match conn.registered_interest {
            None => {
                let _ = registry.register(&mut conn.stream, token, desired);
            }
            Some(_) => {
                let _ = registry.reregister(&mut conn.stream, token, desired);
            }
        }
        conn.registered_interest = Some(desired);
        self.tokens.insert(token, TokenKind::PrivateUpstream(client_id, shard));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slotmap::ShardNode;
    use mio::net::TcpListener as MioTcpListener;
    use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};

    fn one_shard_map() -> Arc<SlotMap> {
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
        Arc::new(builder.build().unwrap())
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            seed_addr: "127.0.0.1:0".into(),
            port: 0,
            maxclients: 1_000,
            threads: 1,
            tcpkeepalive: Duration::from_secs(15),
            daemonize: false,
            multiplex_mode: MultiplexMode::Auto,
            auth: None,
            disable_colors: true,
            log_level: crate::config::LogLevel::Error,
            dump_queries: false,
            dump_buffer: false,
        })
    }

    fn loopback_pair() -> MioTcpStream {
        let mut listener =
            MioTcpListener::bind("127.0.0.1:0".to_socket_addrs().unwrap().next().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let (stream, _) = loop {
            if let Ok(pair) = listener.accept() {
                break pair;
            }
        };
        let _ = MioTcpStream::from_std(client);
        stream
    }

    fn new_worker() -> Worker {
        Worker::new(
            0,
            Poll::new().unwrap(),
            Arc::new(Mutex::new(VecDeque::new())),
            one_shard_map(),
            Arc::new(CommandTable::default_table()),
            test_config(),
        )
    }

    /// Spec §8 property 6: once either shared queue reaches
    /// `MULTIPLEXING_MAX_REQUEST_QUEUE_LEN` during one pre-sleep tick under `auto` mode,
    /// every client on the worker must be in private mode by the next tick.
    #[test]
    fn auto_mode_toggles_every_client_private_once_shared_queue_saturates() {
        let mut worker = new_worker();

        let stream = loopback_pair();
        let token = worker.alloc_token();
        let addr = "127.0.0.1:1".parse().unwrap();
        let mut client = Client::new(1, addr, worker.id, stream, token);
        client.registered_interest = Some(Interest::READABLE);
        worker.tokens.insert(token, TokenKind::Client(1));
        worker.clients.insert(client);

        assert!(!worker.clients.get(1).unwrap().is_private());

        for id in 0..MULTIPLEXING_MAX_REQUEST_QUEUE_LEN {
            worker.shared_send.push_back(id);
        }

        worker.maybe_toggle_multiplex_mode();

        assert!(worker.clients.get(1).unwrap().is_private());
    }

    #[test]
    fn below_threshold_does_not_toggle_private_mode() {
        let mut worker = new_worker();

        let stream = loopback_pair();
        let token = worker.alloc_token();
        let addr = "127.0.0.1:1".parse().unwrap();
        let mut client = Client::new(1, addr, worker.id, stream, token);
        client.registered_interest = Some(Interest::READABLE);
        worker.tokens.insert(token, TokenKind::Client(1));
        worker.clients.insert(client);

        for id in 0..MULTIPLEXING_MAX_REQUEST_QUEUE_LEN - 1 {
            worker.shared_send.push_back(id);
        }

        worker.maybe_toggle_multiplex_mode();

        assert!(!worker.clients.get(1).unwrap().is_private());
    }
}
