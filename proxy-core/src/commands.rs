//! Static command metadata registry: command name -> key-position/arity rules.
//!
//! Slot-map discovery aside, this table is the other "typed external input" the spec treats
//! as given; it's populated once at startup from a fixed list rather than discovered, since
//! the wire format has no command-introspection query in scope.

use hashbrown::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    /// Index of the first key argument (1-based; 0 means "no key").
    pub first_key: usize,
    /// Index of the last key argument. May be negative-from-end in real cluster metadata;
    /// this table only needs the finite commands the proxy forwards, so it is always >= 0.
    pub last_key: usize,
    pub key_step: usize,
    pub arity: i32,
    pub unsupported: bool,
}

pub struct CommandTable {
    specs: HashMap<String, CommandSpec>,
}

impl CommandTable {
    pub fn lookup(&self, name: &str) -> Option<&CommandSpec> {
        self.specs.get(&name.to_ascii_lowercase())
    }

    /// The default table covering the commands needed to exercise routing: single-key
    /// commands, a multi-key command (MSET, for cross-slot rejection), keyless commands, and
    /// a couple of explicitly unsupported ones (transactions are a non-goal).
    pub fn default_table() -> CommandTable {
        let mut specs = HashMap::new();

        let entry = |first_key, last_key, key_step, arity, unsupported| CommandSpec {
            first_key,
            last_key,
            key_step,
            arity,
            unsupported,
        };

        specs.insert("get".into(), entry(1, 1, 1, 2, false));
        specs.insert("set".into(), entry(1, 1, 1, -3, false));
        specs.insert("del".into(), entry(1, usize::MAX, 1, -2, false));
        specs.insert("exists".into(), entry(1, usize::MAX, 1, -2, false));
        specs.insert("incr".into(), entry(1, 1, 1, 2, false));
        specs.insert("decr".into(), entry(1, 1, 1, 2, false));
        specs.insert("expire".into(), entry(1, 1, 1, 3, false));
        specs.insert("ttl".into(), entry(1, 1, 1, 2, false));
        specs.insert("append".into(), entry(1, 1, 1, 3, false));
        specs.insert("hget".into(), entry(1, 1, 1, 3, false));
        specs.insert("hset".into(), entry(1, 1, 1, -4, false));
        specs.insert("lpush".into(), entry(1, 1, 1, -3, false));
        specs.insert("rpush".into(), entry(1, 1, 1, -3, false));
        specs.insert("mget".into(), entry(1, usize::MAX, 1, -2, false));
        specs.insert("mset".into(), entry(1, usize::MAX, 2, -3, false));
        // Keyless commands are tagged `arity == 1` as a routing sentinel ("no key, send to
        // any shard"), independent of the command's real wire arity — mirrors the fixed-up
        // metadata table the upstream proxy ships, not a literal argument-count check.
        specs.insert("ping".into(), entry(0, 0, 0, 1, false));
        specs.insert("echo".into(), entry(0, 0, 0, 1, false));
        specs.insert("auth".into(), entry(0, 0, 0, 1, false));
        specs.insert("cluster".into(), entry(0, 0, 0, 1, false));
        specs.insert("multi".into(), entry(0, 0, 0, 1, true));
        specs.insert("exec".into(), entry(0, 0, 0, 1, true));
        specs.insert("watch".into(), entry(1, usize::MAX, 1, -2, true));

        CommandTable { specs }
    }
}
