//! One-time cluster bootstrap (spec §4.7, §6 "Bootstrap"): fetch `CLUSTER NODES` from a seed
//! endpoint over a short-lived blocking connection and parse its text reply into a
//! [`SlotMap`]. This runs once, on the main thread, before any worker thread starts — nothing
//! here touches the non-blocking event loop the workers drive.

use crate::error::ProxyError;
use crate::reply;
use crate::slotmap::{ShardNode, SlotMap};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect to `seed_addr`, issue `CLUSTER NODES`, and build a [`SlotMap`] from the reply.
/// Any failure here is fatal at startup (spec §7 "Bootstrap / bind failure").
pub fn bootstrap(seed_addr: &str) -> Result<SlotMap, ProxyError> {
    let text = fetch_cluster_nodes(seed_addr)?;
    parse_cluster_nodes(&text)
}

fn fetch_cluster_nodes(seed_addr: &str) -> Result<String, ProxyError> {
    let mut stream = TcpStream::connect(seed_addr)
        .map_err(|e| ProxyError::Bootstrap(format!("connect to seed {seed_addr} failed: {e}")))?;
    stream
        .set_read_timeout(Some(BOOTSTRAP_TIMEOUT))
        .map_err(|e| ProxyError::Bootstrap(e.to_string()))?;
    stream
        .set_write_timeout(Some(BOOTSTRAP_TIMEOUT))
        .map_err(|e| ProxyError::Bootstrap(e.to_string()))?;

    stream
        .write_all(b"*2\r\n$7\r\nCLUSTER\r\n$5\r\nNODES\r\n")
        .map_err(|e| ProxyError::Bootstrap(format!("write CLUSTER NODES failed: {e}")))?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(len) = reply::reply_len(&buf) {
            buf.truncate(len);
            break;
        }
        let n = stream
            .read(&mut chunk)
            .map_err(|e| ProxyError::Bootstrap(format!("read CLUSTER NODES reply failed: {e}")))?;
        if n == 0 {
            return Err(ProxyError::Bootstrap("seed closed connection before replying".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    parse_bulk_string(&buf)
}

/// `CLUSTER NODES` always replies with a bulk string; strip the `$<len>\r\n` header and
/// trailing `\r\n` to get at the raw text table.
fn parse_bulk_string(data: &[u8]) -> Result<String, ProxyError> {
    if data.first() != Some(&b'$') {
        return Err(ProxyError::Bootstrap("expected a bulk string reply".into()));
    }
    let header_end = data
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| ProxyError::Bootstrap("malformed bulk header".into()))?;
    let body_start = header_end + 2;
    let len: i64 = std::str::from_utf8(&data[1..header_end])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProxyError::Bootstrap("malformed bulk length".into()))?;
    if len < 0 {
        return Err(ProxyError::Bootstrap("seed returned a nil reply".into()));
    }
    let body = &data[body_start..body_start + len as usize];
    Ok(String::from_utf8_lossy(body).into_owned())
}

/// Parse the `CLUSTER NODES` text table: one line per node, fields
/// `name addr flags master_id ping pong epoch link-state [slots...]`.
fn parse_cluster_nodes(text: &str) -> Result<SlotMap, ProxyError> {
    let mut builder = SlotMap::builder();
    let mut any_line = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        any_line = true;
        builder.add_shard(parse_node_line(line)?);
    }

    if !any_line {
        return Err(ProxyError::Bootstrap("CLUSTER NODES returned no nodes".into()));
    }

    builder
        .build()
        .map_err(|e| ProxyError::Bootstrap(format!("incomplete slot coverage: {e}")))
}

fn parse_node_line(line: &str) -> Result<ShardNode, ProxyError> {
    let mut fields = line.split_whitespace();

    let name = fields.next().ok_or_else(|| ProxyError::Bootstrap("missing node id".into()))?;
    let addr = fields.next().ok_or_else(|| ProxyError::Bootstrap("missing node addr".into()))?;
    let flags = fields.next().ok_or_else(|| ProxyError::Bootstrap("missing flags".into()))?;
    let master_id = fields.next().ok_or_else(|| ProxyError::Bootstrap("missing master id".into()))?;
    // ping-sent, pong-recv, config-epoch, link-state: not consulted by the proxy.
    let _ping = fields.next();
    let _pong = fields.next();
    let _epoch = fields.next();
    let _link_state = fields.next();

    let (ip, port) = parse_addr(addr)?;
    let is_replica = flags.split(',').any(|f| f == "slave") || master_id != "-";

    let mut slots = Vec::new();
    let mut migrating = Vec::new();
    let mut importing = Vec::new();

    for token in fields {
        if let Some(inner) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            if let Some((slot_str, dest)) = inner.split_once("->-") {
                let slot: u16 = slot_str
                    .parse()
                    .map_err(|_| ProxyError::Bootstrap(format!("bad migrate marker '{token}'")))?;
                migrating.push((slot, dest.to_string()));
            } else if let Some((slot_str, src)) = inner.split_once("-<-") {
                let slot: u16 = slot_str
                    .parse()
                    .map_err(|_| ProxyError::Bootstrap(format!("bad import marker '{token}'")))?;
                importing.push((slot, src.to_string()));
            }
            // Migrating/importing slots are informational only (spec §3): not added to
            // `slots`, so they never resolve to this node via `shard_for_slot`.
            continue;
        }

        if let Some((start, end)) = token.split_once('-') {
            let start: u16 = start
                .parse()
                .map_err(|_| ProxyError::Bootstrap(format!("bad slot range '{token}'")))?;
            let end: u16 = end
                .parse()
                .map_err(|_| ProxyError::Bootstrap(format!("bad slot range '{token}'")))?;
            slots.push((start, end));
        } else {
            let slot: u16 = token
                .parse()
                .map_err(|_| ProxyError::Bootstrap(format!("bad slot '{token}'")))?;
            slots.push((slot, slot));
        }
    }

    Ok(ShardNode {
        name: name.to_string(),
        ip,
        port,
        slots,
        migrating,
        importing,
        is_replica,
    })
}

/// `ip:port[@bus-port]` -> `(ip, port)`, discarding the cluster bus port.
fn parse_addr(addr: &str) -> Result<(String, u16), ProxyError> {
    let without_bus = addr.split('@').next().unwrap_or(addr);
    let (ip, port) = without_bus
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::Bootstrap(format!("malformed node address '{addr}'")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyError::Bootstrap(format!("malformed node port in '{addr}'")))?;
    Ok((ip.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383
6ec23923021cf3ffec47632106199cb7f496ce01 127.0.0.1:30005@31005 slave 67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 0 1426238316232 5 connected
824fe116063bc5fcf9f4ffd895bc17aee7731ac3 127.0.0.1:30006@31006 slave 292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 0 1426238317741 6 connected
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460
";

    #[test]
    fn parses_sample_topology() {
        let map = parse_cluster_nodes(SAMPLE).unwrap();
        assert_eq!(map.shard_for_slot(0).map(|id| map.shard(id).name.clone()), Some(
            "e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca".into()
        ));
        assert_eq!(map.shard_for_slot(5460).map(|id| map.shard(id).name.clone()), Some(
            "e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca".into()
        ));
        assert_eq!(map.shard_for_slot(5461).map(|id| map.shard(id).name.clone()), Some(
            "67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1".into()
        ));
        assert_eq!(map.shard_for_slot(16383).map(|id| map.shard(id).name.clone()), Some(
            "292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f".into()
        ));
    }

    #[test]
    fn strips_cluster_bus_port() {
        let node = parse_node_line(
            "abc 10.0.0.1:7000@17000 master - 0 0 1 connected 0-16383",
        )
        .unwrap();
        assert_eq!(node.ip, "10.0.0.1");
        assert_eq!(node.port, 7000);
        assert!(!node.is_replica);
    }

    #[test]
    fn replica_flagged_by_master_id() {
        let node = parse_node_line(
            "abc 10.0.0.1:7000@17000 slave deadbeef 0 0 1 connected",
        )
        .unwrap();
        assert!(node.is_replica);
    }

    #[test]
    fn migrate_and_import_markers_are_recorded_but_not_routable() {
        let node = parse_node_line(
            "abc 10.0.0.1:7000@17000 master - 0 0 1 connected 0-100 [101->-dest] [102-<-src]",
        )
        .unwrap();
        assert_eq!(node.migrating, vec![(101, "dest".to_string())]);
        assert_eq!(node.importing, vec![(102, "src".to_string())]);
        assert_eq!(node.slots, vec![(0, 100)]);
    }

    #[test]
    fn empty_reply_is_a_bootstrap_error() {
        assert!(parse_cluster_nodes("").is_err());
        assert!(parse_cluster_nodes("   \n\n  ").is_err());
    }

    #[test]
    fn incomplete_slot_coverage_is_a_bootstrap_error() {
        let text = "abc 10.0.0.1:7000@17000 master - 0 0 1 connected 0-100\n";
        assert!(parse_cluster_nodes(text).is_err());
    }
}
