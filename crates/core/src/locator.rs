//! Edge-to-owner resolution.
//!
//! The locator owns the consistent hasher and replication map that every
//! participant keeps in sync with directory updates, and implements the
//! shared agreement rule for which (virtual) agent owns each side of an
//! edge. All shards resolve ownership through the same two-level rule, so
//! they agree without coordination.

use crate::replication::ReplicationMap;
use crate::ring::ConsistentHasher;
use crate::sketch::SKETCH_BYTES;
use elga_api::pack::{pack_vagent, unpack_vagent};
use elga_api::{Dir, Edge, ElgaError, ElgaResult, Tunables, Vertex};
use std::collections::HashMap;

/// Resolves edges to owning agents through the consistent-hash ring.
#[derive(Debug)]
pub struct EdgeLocator {
    rm: ReplicationMap,
    ch: ConsistentHasher,
    agents: Vec<u64>,
    real_agents: Vec<u64>,
    ready: bool,
    sketch_enabled: bool,
    cache: HashMap<(Edge, Dir, bool), (u64, bool)>,
}

impl EdgeLocator {
    /// An empty locator for the configured replication mode.
    pub fn new(t: &Tunables) -> Self {
        Self {
            rm: ReplicationMap::new(t.replication, t.rep_threshold),
            ch: ConsistentHasher::default(),
            agents: Vec::new(),
            real_agents: Vec::new(),
            ready: false,
            sketch_enabled: t.sketch_enabled(),
            cache: HashMap::new(),
        }
    }

    /// Whether a directory snapshot has been installed.
    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Packed virtual agent ids currently on the ring.
    pub fn agents(&self) -> &[u64] {
        &self.agents
    }

    /// Physical agent endpoint serials.
    pub fn real_agents(&self) -> &[u64] {
        &self.real_agents
    }

    /// Number of physical agents.
    pub fn num_agents(&self) -> usize {
        self.real_agents.len()
    }

    /// Number of virtual agents.
    pub fn num_vagents(&self) -> usize {
        self.agents.len()
    }

    /// Extra replicas for a vertex beyond its first owner.
    pub fn count_agent_reps(&self, v: Vertex) -> i32 {
        self.rm.query(v) - 1
    }

    /// All ring containers for a vertex key.
    pub fn find(&self, key: u64) -> Vec<u64> {
        self.ch.find(key, &self.rm)
    }

    /// Install the body of a `DIRECTORY_UPDATE` (after the changed flag):
    /// packed `(endpoint | vagent_count << 49)` entries, optionally
    /// followed by the fixed-size sketch blob.
    pub fn install_directory(&mut self, body: &[u8]) -> ElgaResult<()> {
        let agents_len = if self.sketch_enabled {
            body.len()
                .checked_sub(SKETCH_BYTES)
                .ok_or_else(|| ElgaError::protocol("directory update missing sketch"))?
        } else {
            body.len()
        };
        if agents_len % 8 != 0 {
            return Err(ElgaError::protocol("directory update agent list misaligned"));
        }

        self.real_agents.clear();
        self.agents.clear();
        for chunk in body[..agents_len].chunks_exact(8) {
            let packed = u64::from_le_bytes(chunk.try_into().expect("len 8"));
            let (serial, vagent_count) = unpack_vagent(packed);
            self.real_agents.push(serial);
            for va in 0..vagent_count {
                self.agents.push(pack_vagent(serial, va));
            }
        }

        self.ch.update_agents(&self.agents);

        if self.sketch_enabled {
            self.rm.update(&body[agents_len..])?;
        }

        self.cache.clear();
        self.ready = true;
        Ok(())
    }

    /// Find the destination agent for a given edge.
    ///
    /// With `find_owner` set this returns the exact owner of the edge:
    /// the key's single container, or, among a replicated key's containers,
    /// a deterministic pick keyed by the secondary vertex so that all
    /// shards agree. Without it, any container of the primary vertex is
    /// returned uniformly at random for load balancing, and the returned
    /// flag reports whether `owner_check` (an endpoint serial, nonzero to
    /// enable the check) is among the containers.
    ///
    /// With `return_va` the packed virtual agent id is returned; otherwise
    /// the virtual agent suffix is stripped to the endpoint serial.
    pub fn find_agent(
        &mut self,
        e: Edge,
        et: Dir,
        find_owner: bool,
        owner_check: u64,
        return_va: bool,
    ) -> (u64, bool) {
        if !return_va {
            if let Some(&hit) = self.cache.get(&(e, et, find_owner)) {
                return hit;
            }
        }

        let (u, v) = match et {
            Dir::Out => (e.src, e.dst),
            Dir::In => (e.dst, e.src),
        };

        let (dest, have_ownership) = if !find_owner {
            self.ch.find_one(u, owner_check, &self.rm)
        } else {
            let dests = self.ch.find(u, &self.rm);
            let dest = match dests.len() {
                0 => 0,
                1 => dests[0],
                // Deterministic pick among the primary's replicas, keyed
                // by the secondary vertex: a second ring with replication
                // one has exactly one container per key.
                _ => {
                    let second = ConsistentHasher::new(&dests);
                    second.find_one(v, 0, &ReplicationMap::None).0
                }
            };
            (dest, false)
        };

        if return_va {
            return (dest, have_ownership);
        }

        let (serial, _) = unpack_vagent(dest);
        self.cache.insert((e, et, find_owner), (serial, have_ownership));
        (serial, have_ownership)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use elga_api::Packer;

    fn body_for(serials: &[u64], vagents: u16) -> bytes::Bytes {
        let mut p = Packer::new();
        for &s in serials {
            p.u64(pack_vagent(s, vagents));
        }
        p.freeze()
    }

    fn locator_with(serials: &[u64], vagents: u16) -> EdgeLocator {
        let mut l = EdgeLocator::new(&Tunables::testing());
        l.install_directory(&body_for(serials, vagents)).unwrap();
        l
    }

    #[test]
    fn install_expands_virtual_agents() {
        let l = locator_with(&[0x0a_0000_0001, 0x0b_0000_0001], 4);
        assert_eq!(2, l.num_agents());
        assert_eq!(8, l.num_vagents());
        assert!(l.ready());
    }

    #[test]
    fn owner_resolution_is_deterministic_and_symmetric() {
        let serials = [101u64, 202, 303];
        let mut a = locator_with(&serials, 4);
        let mut b = locator_with(&serials, 4);

        for i in 0..200u64 {
            let e = Edge::new(i, i.wrapping_mul(7) + 1);
            // Two independent locators with the same directory agree on
            // both sides of every edge.
            let (in_a, _) = a.find_agent(e, Dir::In, true, 0, false);
            let (in_b, _) = b.find_agent(e, Dir::In, true, 0, false);
            assert_eq!(in_a, in_b);
            let (out_a, _) = a.find_agent(e, Dir::Out, true, 0, false);
            let (out_b, _) = b.find_agent(e, Dir::Out, true, 0, false);
            assert_eq!(out_a, out_b);
            assert!(serials.contains(&in_a));
            assert!(serials.contains(&out_a));
        }
    }

    #[test]
    fn non_owner_lookup_reports_ownership() {
        let serials = [11u64, 22];
        let mut l = locator_with(&serials, 2);
        for v in 0..50u64 {
            let e = Edge::new(v, u64::MAX);
            let (dest, owned) = l.find_agent(e, Dir::Out, false, serials[0], true);
            let (serial, _) = unpack_vagent(dest);
            assert!(serials.contains(&serial));
            // With replication one there is a single container, so the
            // ownership flag is true exactly when it picked the checked
            // serial.
            assert_eq!(owned, serial == serials[0]);
        }
    }

    #[test]
    fn cache_survives_until_directory_change() {
        let mut l = locator_with(&[5u64, 6, 7], 4);
        let e = Edge::new(40, 41);
        let first = l.find_agent(e, Dir::In, true, 0, false);
        assert_eq!(first, l.find_agent(e, Dir::In, true, 0, false));

        // Shrinking the directory may re-home the edge; the memo must not
        // outlive the change.
        l.install_directory(&body_for(&[5u64], 4)).unwrap();
        let (owner, _) = l.find_agent(e, Dir::In, true, 0, false);
        assert_eq!(5, owner);
    }

    #[test]
    fn convergence_is_history_independent() {
        // Two participants that watched different join/leave sequences
        // but hold the same final membership resolve identically.
        let mut a = EdgeLocator::new(&Tunables::testing());
        a.install_directory(&body_for(&[1], 4)).unwrap();
        a.install_directory(&body_for(&[1, 2, 3], 4)).unwrap();
        a.install_directory(&body_for(&[2, 3], 4)).unwrap();
        a.install_directory(&body_for(&[2, 3, 9], 4)).unwrap();

        let mut b = EdgeLocator::new(&Tunables::testing());
        b.install_directory(&body_for(&[9, 2, 3], 4)).unwrap();

        for i in 0..100u64 {
            let e = Edge::new(i, 1000 - i);
            assert_eq!(
                a.find_agent(e, Dir::In, true, 0, true),
                b.find_agent(e, Dir::In, true, 0, true),
            );
        }
    }

    #[test]
    fn empty_ring_resolves_to_zero() {
        let mut l = EdgeLocator::new(&Tunables::testing());
        let (dest, owned) = l.find_agent(Edge::new(1, 2), Dir::In, true, 0, false);
        assert_eq!(0, dest);
        assert!(!owned);
    }
}
