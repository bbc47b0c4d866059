//! Consistent hash ring with virtual replicas.
//!
//! Every member is hashed onto the CRC-32 space `replicas` times. A key belongs
//! to the member owning the first position at or after the key's hash,
//! wrapping around to the first position.

use std::collections::{BTreeMap, BTreeSet};

/// Virtual replicas per shard.
pub const DEFAULT_REPLICAS: usize = 100;

/// Immutable-once-shared hash ring.
///
/// Two rings built from the same member set are identical regardless of the
/// order members were supplied in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashRing {
    replicas: usize,
    positions: BTreeMap<u32, String>,
    members: BTreeSet<String>,
}

impl HashRing {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas,
            positions: BTreeMap::new(),
            members: BTreeSet::new(),
        }
    }

    /// Builds a ring from `names`.
    pub fn build<I, S>(replicas: usize, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut sorted = names
            .into_iter()
            .map(|name| name.as_ref().to_string())
            .collect::<Vec<_>>();
        sorted.sort();
        sorted.dedup();

        let mut ring = Self::new(replicas);
        for name in &sorted {
            ring.add(name);
        }
        ring
    }

    /// Inserts the replica positions for `name`.
    ///
    /// On a position collision the first inserted owner keeps it.
    pub fn add(&mut self, name: &str) {
        if !self.members.insert(name.to_string()) {
            return;
        }
        for i in 0..self.replicas {
            let position = hash(format!("{}{}", i, name).as_bytes());
            self.positions
                .entry(position)
                .or_insert_with(|| name.to_string());
        }
    }

    /// Owner of `key`, or `None` for an empty ring.
    pub fn get(&self, key: &str) -> Option<&str> {
        let position = hash(key.as_bytes());
        self.positions
            .range(position..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, name)| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Number of positions on the ring.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Member names, sorted.
    pub fn members(&self) -> Vec<String> {
        self.members.iter().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains(name)
    }
}

fn hash(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}
