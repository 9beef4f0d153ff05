//! Listener & cross-thread dispatch (spec §4.6).
//!
//! The main thread owns the listening sockets and does nothing but accept connections and
//! hand them to a worker. Dispatch target is `client_id mod worker_count`, communicated
//! through the worker's mailbox (mutex-guarded queue) and its `mio::Waker` — the idiomatic
//! mio 0.8 replacement for the original design's wake-up pipe.

use crate::scheduler::{NewClientMsg, WorkerHandle};
use mio::net::TcpListener as MioTcpListener;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Spec §5 "Resource limits": hard cap on accepted connections per accept-tick, so a
/// connection storm on one address family can't starve the other or the dispatch loop.
pub const MAX_ACCEPTS_PER_TICK: usize = 1000;

const TOKEN_V4: Token = Token(0);
const TOKEN_V6: Token = Token(1);

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

/// Bind an IPv4 and/or IPv6 listener on `port` and drive the accept loop forever, dispatching
/// each accepted connection to `workers[client_id % workers.len()]`. Returns an error only if
/// neither address family could be bound (spec §7: fatal, exit 1).
pub fn run(port: u16, backlog: i32, workers: Vec<WorkerHandle>) -> io::Result<()> {
    if workers.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "no worker threads configured"));
    }

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(16);

    let mut v4 = bind(Domain::IPV4, format!("0.0.0.0:{port}").parse().unwrap(), backlog);
    let mut v6 = bind(Domain::IPV6, format!("[::]:{port}").parse().unwrap(), backlog);

    if v4.is_none() && v6.is_none() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("failed to bind port {port} on either address family"),
        ));
    }

    if let Some(listener) = v4.as_mut() {
        poll.registry().register(listener, TOKEN_V4, Interest::READABLE)?;
        tracing::info!(port, family = "ipv4", "listening");
    }
    if let Some(listener) = v6.as_mut() {
        poll.registry().register(listener, TOKEN_V6, Interest::READABLE)?;
        tracing::info!(port, family = "ipv6", "listening");
    }

    loop {
        poll.poll(&mut events, None)?;
        let tokens: Vec<Token> = events.iter().map(|e| e.token()).collect();
        for token in tokens {
            let listener = match token {
                TOKEN_V4 => v4.as_mut(),
                TOKEN_V6 => v6.as_mut(),
                _ => None,
            };
            if let Some(listener) = listener {
                accept_batch(listener, &workers);
            }
        }
    }
}

/// Bind one address family, gracefully returning `None` (rather than propagating the error)
/// if the family isn't supported on this host (spec §6: "dual-stack with graceful fallback if
/// one family is unsupported").
fn bind(domain: Domain, addr: SocketAddr, backlog: i32) -> Option<MioTcpListener> {
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).ok()?;
    let _ = socket.set_reuse_address(true);
    if domain == Domain::IPV6 {
        let _ = socket.set_only_v6(true);
    }
    socket.bind(&addr.into()).ok()?;
    socket.listen(backlog).ok()?;
    socket.set_nonblocking(true).ok()?;
    Some(MioTcpListener::from_std(socket.into()))
}

fn accept_batch(listener: &mut MioTcpListener, workers: &[WorkerHandle]) {
    for _ in 0..MAX_ACCEPTS_PER_TICK {
        match listener.accept() {
            Ok((stream, addr)) => dispatch(stream, addr, workers),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

fn dispatch(stream: mio::net::TcpStream, addr: SocketAddr, workers: &[WorkerHandle]) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let worker_idx = (client_id as usize) % workers.len();
    let worker = &workers[worker_idx];

    let msg = NewClientMsg { client_id, addr, stream };
    {
        let mut mailbox = worker.mailbox.lock().expect("mailbox mutex poisoned");
        mailbox.push_back(msg);
    }
    if worker.waker.wake().is_err() {
        tracing::warn!(worker = worker_idx, "failed to wake worker for new client");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_distributed_round_robin() {
        NEXT_CLIENT_ID.store(0, Ordering::Relaxed);
        let worker_count = 4usize;
        let assigned: Vec<usize> = (0..8)
            .map(|_| {
                let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
                (id as usize) % worker_count
            })
            .collect();
        assert_eq!(assigned, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }
}
