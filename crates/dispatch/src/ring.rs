//! Consistent-hash ring for sticky token lookup
//!
//! Built fresh per decision from the pool's current endpoint list. The
//! list is sorted before ring construction, so the mapping depends only on
//! the endpoint set, never on the order the balancer reports it in.

use std::collections::BTreeMap;

use xxhash_rust::xxh3::xxh3_64;

const VIRTUAL_NODES: usize = 64;

/// Hash ring mapping arbitrary string tokens onto endpoints
pub struct HashRing {
    /// Virtual node hash -> endpoint index, sorted by hash
    ring: BTreeMap<u64, usize>,
    endpoints: Vec<String>,
}

impl HashRing {
    pub fn new(mut endpoints: Vec<String>) -> Self {
        endpoints.sort();

        let mut ring = BTreeMap::new();
        for (index, endpoint) in endpoints.iter().enumerate() {
            for vnode in 0..VIRTUAL_NODES {
                let hash = xxh3_64(format!("{}-vnode-{}", endpoint, vnode).as_bytes());
                ring.insert(hash, index);
            }
        }

        Self { ring, endpoints }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Endpoint owning the given token: the first virtual node at or after
    /// the token's hash, wrapping around to the ring start.
    pub fn lookup(&self, token: &str) -> Option<&str> {
        let hash = xxh3_64(token.as_bytes());
        let index = self
            .ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, &index)| index)?;
        self.endpoints.get(index).map(String::as_str)
    }
}
