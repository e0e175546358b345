//! The consistent-hash ring over virtual agent ids.

use crate::hash::hash;
use crate::replication::ReplicationMap;
use elga_api::pack::VAGENT_SERIAL_MASK;
use rand::Rng;
use std::collections::HashMap;

/// A sorted ring of hashed agent ids with an inverse map back to the ids.
///
/// `find(key)` walks the ring from the left-most point at or after
/// `hash(key)` and returns the next `r` agents, where `r` is the
/// replication count for the key.
#[derive(Debug, Default, Clone)]
pub struct ConsistentHasher {
    ring: Vec<u64>,
    agent_map: HashMap<u64, u64>,
}

impl ConsistentHasher {
    /// Build a ring over the given packed agent ids.
    pub fn new(agents: &[u64]) -> Self {
        let mut out = Self::default();
        out.update_agents(agents);
        out
    }

    /// Replace the agent set and rebuild the ring.
    pub fn update_agents(&mut self, agents: &[u64]) {
        self.ring.clear();
        self.ring.reserve(agents.len());
        self.agent_map.clear();
        for &agent in agents {
            let h = hash(agent);
            self.ring.push(h);
            self.agent_map.insert(h, agent);
        }
        self.ring.sort_unstable();
    }

    /// Number of points on the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Retrieve all of the containers for a given key: its `rm.query(key)`
    /// ring successors with wrap-around, or every agent if the ring is
    /// smaller than that.
    pub fn find(&self, key: u64, rm: &ReplicationMap) -> Vec<u64> {
        let ring_size = self.ring.len();
        if ring_size == 0 {
            return Vec::new();
        }

        let replication = rm.query(key).max(1) as usize;
        let hkey = hash(key);

        // Left-most insertion point; wraps to 0 past the end.
        let start = self.ring.partition_point(|&r| r < hkey) % ring_size;

        let take = replication.min(ring_size);
        let mut response = Vec::with_capacity(take);
        for i in 0..take {
            let h = self.ring[(start + i) % ring_size];
            response.push(self.agent_map[&h]);
        }
        response
    }

    /// Retrieve a uniformly-random container for the key.
    ///
    /// If `owner_check` is nonzero, the returned flag is true iff that
    /// endpoint serial (virtual agent suffix stripped) appears among the
    /// key's containers. The empty ring returns `(0, false)`.
    pub fn find_one(&self, key: u64, owner_check: u64, rm: &ReplicationMap) -> (u64, bool) {
        let containers = self.find(key, rm);
        if containers.is_empty() {
            return (0, false);
        }

        let mut have_ownership = false;
        if owner_check != 0 {
            have_ownership = containers
                .iter()
                .any(|&c| c & VAGENT_SERIAL_MASK == owner_check);
        }

        let pick = rand::thread_rng().gen_range(0..containers.len());
        (containers[pick], have_ownership)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use elga_api::pack::pack_vagent;

    fn rm() -> ReplicationMap {
        ReplicationMap::None
    }

    #[test]
    fn empty_ring() {
        let ch = ConsistentHasher::new(&[]);
        assert!(ch.find(7, &rm()).is_empty());
        assert_eq!((0, false), ch.find_one(7, 123, &rm()));
    }

    #[test]
    fn find_count_is_min_of_replication_and_ring() {
        let agents: Vec<u64> = (1..=5).map(|i| pack_vagent(i, 0)).collect();
        let ch = ConsistentHasher::new(&agents);

        let mut sketch = crate::sketch::CountMinSketch::new();
        for _ in 0..25 {
            sketch.count(99);
        }
        let rm3 = ReplicationMap::CountMin { sketch, threshold: 10 };

        for key in 0..200u64 {
            let expect = rm3.query(key).max(1).min(5) as usize;
            assert_eq!(expect, ch.find(key, &rm3).len(), "key {key}");
        }
        // Key 99 was counted 25 times with threshold 10: three owners.
        assert_eq!(3, ch.find(99, &rm3).len());
    }

    #[test]
    fn all_agents_returned_when_replication_exceeds_ring() {
        let agents: Vec<u64> = (1..=2).map(|i| pack_vagent(i, 0)).collect();
        let ch = ConsistentHasher::new(&agents);
        let mut sketch = crate::sketch::CountMinSketch::new();
        for _ in 0..100 {
            sketch.count(4);
        }
        let rm = ReplicationMap::CountMin { sketch, threshold: 10 };
        let found = ch.find(4, &rm);
        assert_eq!(2, found.len());
        assert_ne!(found[0], found[1]);
    }

    #[test]
    fn successor_is_stable_under_unrelated_removal() {
        // Removing agents that are not a key's successor must not change
        // its owner.
        let agents: Vec<u64> = (1..=20).map(|i| pack_vagent(i * 1000, 0)).collect();
        let ch = ConsistentHasher::new(&agents);

        for key in 0..50u64 {
            let owner = ch.find(key, &rm())[0];
            let trimmed: Vec<u64> = agents.iter().copied().filter(|&a| {
                a == owner || hash(a) % 3 != 0
            }).collect();
            let ch2 = ConsistentHasher::new(&trimmed);
            let owner2 = ch2.find(key, &rm())[0];
            // The previous owner is still present; the key may only have
            // moved if an agent between hash(key) and the owner vanished,
            // which cannot push it past the surviving owner.
            let hk = hash(key);
            let ho = hash(owner);
            let h2 = hash(owner2);
            let dist = |to: u64| to.wrapping_sub(hk);
            assert!(dist(h2) <= dist(ho), "key {key} moved past its successor");
        }
    }

    #[test]
    fn find_one_ownership_check_strips_vagent() {
        let serial = 0x1234u64;
        let agents: Vec<u64> = (0..4).map(|va| pack_vagent(serial, va)).collect();
        let ch = ConsistentHasher::new(&agents);

        let (picked, owned) = ch.find_one(77, serial, &rm());
        assert!(owned);
        assert_eq!(serial, picked & VAGENT_SERIAL_MASK);

        let (_, owned) = ch.find_one(77, 0x9999, &rm());
        assert!(!owned);
    }

    #[test]
    fn update_agents_replaces_the_ring() {
        let mut ch = ConsistentHasher::new(&[9, 4, 100, 62]);
        assert_eq!(4, ch.len());
        ch.update_agents(&[5, 77, 3]);
        assert_eq!(3, ch.len());
        let found = ch.find(1, &rm());
        assert!([5u64, 77, 3].contains(&found[0]));
    }
}
