//! Routing: resolve a parsed request's command metadata, slot and target shard.

use crate::commands::CommandTable;
use crate::error::ProxyError;
use crate::request::Request;
use crate::slotmap::{key_slot, ShardId, SlotMap};

pub enum RouteOutcome {
    Shard(ShardId),
    Error(ProxyError),
}

/// Resolve the shard a request should be sent to, per spec §4.2. `active_map` is the
/// client's private slot map when in private mode, otherwise the shared one.
pub fn route(request: &Request, commands: &CommandTable, active_map: &SlotMap) -> RouteOutcome {
    if request.argc() == 0 {
        return RouteOutcome::Error(ProxyError::ProtocolError);
    }

    let name = request.command_name.as_str();
    let spec = match commands.lookup(name) {
        Some(spec) if !spec.unsupported => spec,
        _ => return RouteOutcome::Error(ProxyError::UnsupportedCommand(name.to_string())),
    };

    if spec.arity != 1 && spec.first_key == 0 {
        return RouteOutcome::Error(ProxyError::UnsupportedCommand(name.to_string()));
    }

    if spec.arity == 1 {
        return match active_map.ascending_shards().next() {
            Some(shard) => RouteOutcome::Shard(shard),
            None => RouteOutcome::Error(ProxyError::ConnectFailed),
        };
    }

    let last_key = spec.last_key.min(request.argc().saturating_sub(1));
    let mut resolved: Option<ShardId> = None;

    let mut i = spec.first_key;
    while i <= last_key {
        let key = request.arg(i);
        let slot = key_slot(key);
        let shard = match active_map.shard_for_slot(slot) {
            Some(shard) => shard,
            None => return RouteOutcome::Error(ProxyError::ConnectFailed),
        };

        match resolved {
            None => resolved = Some(shard),
            Some(existing) if existing != shard => return RouteOutcome::Error(ProxyError::CrossSlot),
            _ => {}
        }

        i = i.saturating_add(spec.key_step);
        if spec.key_step == 0 {
            break;
        }
    }

    match resolved {
        Some(shard) => RouteOutcome::Shard(shard),
        None => RouteOutcome::Error(ProxyError::UnsupportedCommand(name.to_string())),
    }
}

/// Compute the slot for the first resolved key of a request, if any — used to tag a
/// request with its routing slot for the pipeline-chain "same slot" check in the scheduler.
pub fn first_key_slot(request: &Request, commands: &CommandTable) -> Option<u16> {
    let spec = commands.lookup(&request.command_name)?;
    if spec.arity == 1 || spec.first_key == 0 {
        return None;
    }
    if spec.first_key >= request.argc() {
        return None;
    }
    Some(key_slot(request.arg(spec.first_key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestArena;
    use crate::slotmap::{SlotMap, ShardNode};

    fn two_shard_map() -> SlotMap {
        let mut builder = SlotMap::builder();
        builder.add_shard(ShardNode {
            name: "s0".into(),
            ip: "127.0.0.1".into(),
            port: 7000,
            slots: vec![(0, 8191)],
            migrating: vec![],
            importing: vec![],
            is_replica: false,
        });
        builder.add_shard(ShardNode {
            name: "s1".into(),
            ip: "127.0.0.1".into(),
            port: 7001,
            slots: vec![(8192, 16383)],
            migrating: vec![],
            importing: vec![],
            is_replica: false,
        });
        builder.build().unwrap()
    }

    fn make_request(arena: &mut RequestArena, raw: &[u8]) -> crate::request::RequestId {
        let mut accum = raw.to_vec();
        let ids = crate::protocol::drain_pipeline(1, &mut accum, arena).unwrap();
        ids[0]
    }

    #[test]
    fn single_key_routes_to_owning_shard() {
        let commands = CommandTable::default_table();
        let map = two_shard_map();
        let mut arena = RequestArena::new();
        let id = make_request(&mut arena, b"*3\r\n$3\r\nSET\r\n$2\r\nk0\r\n$1\r\nv\r\n");
        let req = arena.get(id).unwrap();

        match route(req, &commands, &map) {
            RouteOutcome::Shard(shard) => assert_eq!(map.shard(shard).name, "s0"),
            RouteOutcome::Error(_) => panic!("expected a shard"),
        }
    }

    #[test]
    fn cross_slot_mset_is_rejected() {
        let commands = CommandTable::default_table();
        let map = two_shard_map();
        let mut arena = RequestArena::new();
        let id = make_request(
            &mut arena,
            b"*5\r\n$4\r\nMSET\r\n$2\r\nk0\r\n$1\r\n1\r\n$2\r\nk1\r\n$1\r\n2\r\n",
        );
        let req = arena.get(id).unwrap();

        match route(req, &commands, &map) {
            RouteOutcome::Error(ProxyError::CrossSlot) => {}
            _ => panic!("expected cross-slot rejection"),
        }
    }

    #[test]
    fn keyless_command_routes_to_first_ascending_shard() {
        let commands = CommandTable::default_table();
        let map = two_shard_map();
        let mut arena = RequestArena::new();
        let id = make_request(&mut arena, b"*1\r\n$4\r\nPING\r\n");
        let req = arena.get(id).unwrap();

        match route(req, &commands, &map) {
            RouteOutcome::Shard(shard) => assert_eq!(map.shard(shard).name, "s0"),
            RouteOutcome::Error(_) => panic!("expected a shard"),
        }
    }

    #[test]
    fn unknown_command_is_unsupported() {
        let commands = CommandTable::default_table();
        let map = two_shard_map();
        let mut arena = RequestArena::new();
        let id = make_request(&mut arena, b"*1\r\n$10\r\nFROBNICATE\r\n");
        let req = arena.get(id).unwrap();

        match route(req, &commands, &map) {
            RouteOutcome::Error(ProxyError::UnsupportedCommand(name)) => assert_eq!(name, "frobnicate"),
            _ => panic!("expected unsupported command error"),
        }
    }
}
