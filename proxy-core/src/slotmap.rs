//! Slot derivation (CRC-16 with `{tag}` extraction) and the slot -> shard routing table.

pub const SLOT_COUNT: usize = 16384;
const SLOT_MASK: u16 = 0x3FFF;

/// Identity of a cluster backend. Immutable after bootstrap; shared (via `Arc`) across every
/// worker thread and every private-mode clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardNode {
    pub name: String,
    pub ip: String,
    pub port: u16,
    /// Inclusive slot ranges owned by this shard, as reported by `CLUSTER NODES`.
    pub slots: Vec<(u16, u16)>,
    /// Migrating/importing ranges, recorded for diagnostics only (spec: "informational
    /// only") — nothing downstream consults these, since MOVED/ASK handling is out of scope.
    pub migrating: Vec<(u16, String)>,
    pub importing: Vec<(u16, String)>,
    pub is_replica: bool,
}

impl ShardNode {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Opaque handle into the bootstrap-built shard table. Cheap to copy, stable for the life of
/// the process (slot-map refresh is out of scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(pub usize);

/// Slot (14-bit) -> shard routing table, built once during bootstrap and never mutated
/// afterwards. A dense array gives O(1) lookup and trivially enforces the invariant that
/// every slot in `[0, 16383]` resolves to some shard (an unassigned entry is a fatal
/// bootstrap error, not a runtime possibility).
#[derive(Clone)]
pub struct SlotMap {
    nodes: Vec<ShardNode>,
    routing: Vec<Option<ShardId>>,
}

impl SlotMap {
    pub fn builder() -> SlotMapBuilder {
        SlotMapBuilder::default()
    }

    pub fn shard(&self, id: ShardId) -> &ShardNode {
        &self.nodes[id.0]
    }

    pub fn shard_for_slot(&self, slot: u16) -> Option<ShardId> {
        self.routing[slot as usize]
    }

    pub fn len_shards(&self) -> usize {
        self.nodes.len()
    }

    /// Iterate shards in ascending order of their lowest owned slot. Used by routing to pick
    /// a deterministic target for keyless commands ("the first node returned by iterating
    /// the client's active slot map in ascending slot order").
    pub fn ascending_shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        let mut ids: Vec<ShardId> = (0..self.nodes.len()).map(ShardId).collect();
        ids.sort_by_key(|id| {
            self.nodes[id.0]
                .slots
                .iter()
                .map(|&(start, _)| start)
                .min()
                .unwrap_or(u16::MAX)
        });
        ids.into_iter()
    }
}

#[derive(Default)]
pub struct SlotMapBuilder {
    nodes: Vec<ShardNode>,
}

impl SlotMapBuilder {
    pub fn add_shard(&mut self, node: ShardNode) -> ShardId {
        let id = ShardId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    /// Finalize the map. Fails if any of the 16384 slots is left unassigned, matching the
    /// spec's "misconfiguration is a fatal startup error" invariant.
    pub fn build(self) -> Result<SlotMap, String> {
        let mut routing: Vec<Option<ShardId>> = vec![None; SLOT_COUNT];

        for (idx, node) in self.nodes.iter().enumerate() {
            for &(start, end) in &node.slots {
                for slot in start..=end {
                    routing[slot as usize] = Some(ShardId(idx));
                }
            }
        }

        if let Some(slot) = routing.iter().position(Option::is_none) {
            return Err(format!("slot {slot} has no owning shard"));
        }

        Ok(SlotMap {
            nodes: self.nodes,
            routing,
        })
    }
}

/// `slot(k) = crc16(k) & 0x3FFF`, hashing only the `{tag}` interior when present.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) & SLOT_MASK
}

/// Extract the `{tag}` portion of a key per the cluster hash-tag rule: if the key contains
/// `{` followed eventually by `}` with at least one byte in between, hash only that interior;
/// otherwise hash the whole key.
fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(close_rel) = key[open + 1..].iter().position(|&b| b == b'}') {
            if close_rel > 0 {
                return &key[open + 1..open + 1 + close_rel];
            }
        }
    }
    key
}

/// CRC-16/XMODEM: poly 0x1021, initial value 0, no reflection, no final XOR. This is the
/// exact variant the cluster's key-slot algorithm is defined over.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}
