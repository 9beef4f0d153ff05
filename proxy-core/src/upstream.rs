//! Per-(worker, shard) upstream connection: lazy connect, AUTH handshake, keepalive, and the
//! non-blocking reply reader.
//!
//! Each worker thread owns its own map of these (see `scheduler::Worker`) rather than a
//! shared array mutated by every thread, so there is no need for the per-node connect mutex
//! the original design calls for — ownership alone prevents the race.

use crate::buffer::{ByteBuf, ChunkPool};
use crate::error::ProxyError;
use crate::request::ClientId;
use mio::net::TcpStream as MioTcpStream;
use mio::{Interest, Token};
use std::io::{Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::time::Duration;

const AUTH_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct UpstreamConnection {
    pub stream: MioTcpStream,
    pub reader: ByteBuf,
    /// `Some` once registered with the worker's `Poll`; tracks which interest set is
    /// currently in effect so the scheduler only calls `reregister` when it actually changes.
    pub registered_interest: Option<Interest>,
    /// Token this connection was registered under, assigned by the scheduler on first use.
    pub token: Option<Token>,
    /// Client whose request is currently mid-write on this socket, if any — lets the
    /// scheduler tell "my own request is blocked on WouldBlock" apart from "a different
    /// client's request has this socket busy".
    pub current_writer: Option<ClientId>,
}

impl UpstreamConnection {
    /// Connect to `addr`, run the synchronous AUTH handshake if `auth` is set, apply TCP
    /// keepalive, then hand the socket over as non-blocking for the event loop to drive.
    pub fn connect(addr: &str, auth: Option<&str>, keepalive: Duration) -> Result<UpstreamConnection, ProxyError> {
        let std_stream = StdTcpStream::connect(addr).map_err(|_| ProxyError::ConnectFailed)?;
        std_stream
            .set_read_timeout(Some(AUTH_HANDSHAKE_TIMEOUT))
            .map_err(|_| ProxyError::ConnectFailed)?;
        std_stream
            .set_write_timeout(Some(AUTH_HANDSHAKE_TIMEOUT))
            .map_err(|_| ProxyError::ConnectFailed)?;

        apply_keepalive(&std_stream, keepalive);

        if let Some(password) = auth {
            run_auth_handshake(&std_stream, password)?;
        }

        std_stream.set_nonblocking(true).map_err(|_| ProxyError::ConnectFailed)?;
        let stream = MioTcpStream::from_std(std_stream);

        Ok(UpstreamConnection {
            stream,
            reader: ByteBuf::new(),
            registered_interest: None,
            token: None,
            current_writer: None,
        })
    }

    pub fn read_available(&mut self, pool: &mut ChunkPool) -> Result<usize, ProxyError> {
        match self.reader.ingress(&mut self.stream, pool) {
            Ok(n) => Ok(n),
            Err(e) if ProxyError::is_would_block(&e) => Ok(0),
            Err(_) => Err(ProxyError::ClusterNodeDisconnected),
        }
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<usize, ProxyError> {
        match self.stream.write(data) {
            Ok(n) => Ok(n),
            Err(e) if ProxyError::is_would_block(&e) => Ok(0),
            Err(_) => Err(ProxyError::ClusterNodeDisconnected),
        }
    }
}

fn apply_keepalive(stream: &StdTcpStream, keepalive: Duration) {
    let socket = socket2::SockRef::from(stream);
    let params = socket2::TcpKeepalive::new().with_time(keepalive);
    let _ = socket.set_tcp_keepalive(&params);
}

fn run_auth_handshake(mut stream: &StdTcpStream, password: &str) -> Result<(), ProxyError> {
    let request = format!("*2\r\n$4\r\nAUTH\r\n${}\r\n{}\r\n", password.len(), password);
    stream
        .write_all(request.as_bytes())
        .map_err(|_| ProxyError::ConnectFailed)?;

    let mut reply = [0u8; 64];
    let n = stream.read(&mut reply).map_err(|_| ProxyError::ConnectFailed)?;
    if n == 0 || !reply[..n].starts_with(b"+OK") {
        return Err(ProxyError::ConnectFailed);
    }
    Ok(())
}

