//! The vertex-algorithm seam.
//!
//! An [Algorithm] owns three data shapes: per-vertex scalar state
//! (`Local`), the replica contribution exchanged between agents sharing a
//! vertex (`Replica`), and the notification sent between neighbors
//! (`Notification`). The latter two have a fixed wire size via
//! [WireFixed](crate::pack::WireFixed), so notification frames are plain
//! concatenations.
//!
//! Algorithms never send messages themselves: `run` mutates vertex state
//! and raises notify flags; the agent routes the resulting payloads.

use crate::pack::{Packer, WireFixed};
use crate::{ElgaResult, It, Tunables, Vertex, VertexState};
use std::collections::{HashMap, HashSet};

/// How an algorithm's notification inbox is keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxKind {
    /// One map per iteration, keyed by sending vertex. Lockstep (BSP)
    /// algorithms read their in-neighbors' slot for the current iteration.
    PerIteration,
    /// A single map keyed by sending vertex holding its latest value.
    PerVertex,
}

/// Storage for one owned vertex.
#[derive(Debug, Clone)]
pub struct VertexStorage<A: Algorithm> {
    /// The vertex id.
    pub vertex: Vertex,
    /// The owning endpoint serial.
    pub self_agent: u64,
    /// Computation state.
    pub state: VertexState,
    /// The vertex's own iteration counter.
    pub iteration: It,
    /// Outstanding per-vertex waits (fully-asynchronous discipline only).
    pub vertex_recv_needed: u64,
    /// Outstanding neighbor waits (fully-asynchronous discipline only).
    pub neighbor_recv_needed: u64,
    /// Outstanding replica waits (fully-asynchronous discipline only).
    pub replica_recv_needed: u64,
    /// IN neighbors, unordered, deduplicated when out edges are generated.
    pub in_neighbors: Vec<Vertex>,
    /// OUT neighbors, unordered.
    pub out_neighbors: Vec<Vertex>,
    /// Other agent endpoints that also hold this vertex.
    pub replicas: HashSet<u64>,
    /// Replica contributions, indexed by iteration then contributor.
    pub replica_storage: HashMap<It, HashMap<u64, A::Replica>>,
    /// Algorithm-specific scalar state.
    pub local: A::Local,
}

impl<A: Algorithm> VertexStorage<A> {
    /// Fresh storage for a vertex owned by `self_agent`.
    pub fn new(vertex: Vertex, self_agent: u64) -> Self {
        Self {
            vertex,
            self_agent,
            state: VertexState::Active,
            iteration: 0,
            vertex_recv_needed: 0,
            neighbor_recv_needed: 0,
            replica_recv_needed: 0,
            in_neighbors: Vec::new(),
            out_neighbors: Vec::new(),
            replicas: HashSet::new(),
            replica_storage: HashMap::new(),
            local: A::Local::default(),
        }
    }

    /// Whether every wait counter is zero.
    pub fn recv_satisfied(&self) -> bool {
        self.vertex_recv_needed == 0
            && self.neighbor_recv_needed == 0
            && self.replica_recv_needed == 0
    }
}

/// The vertex-notification inbox, shaped per [Algorithm::INBOX].
#[derive(Debug)]
pub enum VnStore<A: Algorithm> {
    /// Per-iteration maps, grown lazily.
    PerIteration(Vec<HashMap<Vertex, A::Notification>>),
    /// Latest value per sending vertex.
    PerVertex(HashMap<Vertex, A::Notification>),
}

impl<A: Algorithm> VnStore<A> {
    /// An empty store of the algorithm's shape.
    pub fn new() -> Self {
        match A::INBOX {
            InboxKind::PerIteration => Self::PerIteration(Vec::new()),
            InboxKind::PerVertex => Self::PerVertex(HashMap::new()),
        }
    }

    /// Grow the per-iteration store so slot `it` exists.
    pub fn ensure_slot(&mut self, it: It) {
        if let Self::PerIteration(v) = self {
            while v.len() <= it.max(0) as usize {
                v.push(HashMap::new());
            }
        }
    }

    /// Record a notification from `v` for iteration `it`.
    pub fn insert(&mut self, it: It, v: Vertex, n: A::Notification) {
        match self {
            Self::PerIteration(s) => {
                while s.len() <= it.max(0) as usize {
                    s.push(HashMap::new());
                }
                s[it.max(0) as usize].insert(v, n);
            }
            Self::PerVertex(s) => {
                s.insert(v, n);
            }
        }
    }

    /// Look up the notification from `v` at iteration `it`.
    pub fn get(&self, it: It, v: Vertex) -> Option<&A::Notification> {
        match self {
            Self::PerIteration(s) => s.get(it.max(0) as usize).and_then(|m| m.get(&v)),
            Self::PerVertex(s) => s.get(&v),
        }
    }

    /// Look up the notification from `v`, inserting a computed default if
    /// it has not reported yet (label algorithms seed absent neighbors).
    pub fn get_or_insert_with(
        &mut self,
        it: It,
        v: Vertex,
        mk: impl FnOnce() -> A::Notification,
    ) -> &A::Notification {
        match self {
            Self::PerIteration(s) => {
                while s.len() <= it.max(0) as usize {
                    s.push(HashMap::new());
                }
                s[it.max(0) as usize].entry(v).or_insert_with(mk)
            }
            Self::PerVertex(s) => s.entry(v).or_insert_with(mk),
        }
    }

    /// View the stored notifications, one map per iteration slot. The
    /// per-vertex shape reports its single map as slot zero.
    pub fn slot_maps(&self) -> Vec<(It, &HashMap<Vertex, A::Notification>)> {
        match self {
            Self::PerIteration(s) => s
                .iter()
                .enumerate()
                .map(|(i, m)| (i as It, m))
                .collect(),
            Self::PerVertex(s) => vec![(0, s)],
        }
    }

    /// Drop the contents of iteration slot `it` (garbage collection).
    pub fn clear_slot(&mut self, it: It) {
        if let Self::PerIteration(s) = self {
            if let Some(m) = s.get_mut(it.max(0) as usize) {
                m.clear();
            }
        }
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        match self {
            Self::PerIteration(s) => s.clear(),
            Self::PerVertex(s) => s.clear(),
        }
    }
}

impl<A: Algorithm> Default for VnStore<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a single `run` produced: a notification payload plus flags telling
/// the agent where to route it.
#[derive(Debug, Default)]
pub struct RunOutput<A: Algorithm> {
    /// The notification body; the agent stamps the sending vertex.
    pub notification: A::Notification,
    /// Deliver to the owners of this vertex's OUT neighbors.
    pub notify_out: bool,
    /// Deliver to the owners of this vertex's IN neighbors.
    pub notify_in: bool,
    /// Deliver this iteration's replica contribution to all replicas.
    pub notify_replica: bool,
}

impl<A: Algorithm> RunOutput<A> {
    /// A cleared output.
    pub fn new() -> Self {
        Self {
            notification: A::Notification::default(),
            notify_out: false,
            notify_in: false,
            notify_replica: false,
        }
    }
}

/// A vertex-centric algorithm.
pub trait Algorithm: Default + Send + Sized + 'static {
    /// Per-vertex scalar state.
    type Local: Default + Clone + std::fmt::Debug + Send;
    /// Replica contribution payload.
    type Replica: WireFixed + Default + Clone + std::fmt::Debug + Send;
    /// Inter-vertex notification payload.
    type Notification: WireFixed + Default + Clone + std::fmt::Debug + Send;

    /// Human-readable name, used in logs and save headers.
    const NAME: &'static str;
    /// How this algorithm's inbox is keyed.
    const INBOX: InboxKind;

    /// Pick up process tunables at agent startup.
    fn configure(&mut self, _t: &Tunables) {}

    /// Set the start vertex (algorithms that have one).
    fn set_start(&mut self, _v: Vertex) {}

    /// Process one vertex for one superstep.
    fn run(
        &mut self,
        v: &mut VertexStorage<Self>,
        global_nv: u64,
        vn: &mut VnStore<Self>,
        out: &mut RunOutput<Self>,
    ) -> ElgaResult<()>;

    /// Reset per-batch state, keeping algorithm output.
    fn reset_state(&self, v: &mut VertexStorage<Self>);

    /// Reset everything, including output.
    fn reset_output(&self, v: &mut VertexStorage<Self>);

    /// Write this vertex's result line.
    fn save(&self, w: &mut dyn std::io::Write, v: &VertexStorage<Self>) -> std::io::Result<()>;

    /// Write one notification for the state dump.
    fn dump_ovn_state(
        &self,
        w: &mut dyn std::io::Write,
        v: Vertex,
        n: &Self::Notification,
    ) -> std::io::Result<()>;

    /// Apply a locally-delivered notification, possibly reactivating.
    fn set_active(&self, v: &mut VertexStorage<Self>, n: &Self::Notification);

    /// Apply a replica contribution, possibly reactivating.
    fn set_rep_active(
        &self,
        v: &mut VertexStorage<Self>,
        r: &Self::Replica,
    ) -> ElgaResult<()>;

    /// Whether the replica pre-pass may be skipped (the algorithm folds
    /// replica values in as they arrive instead of waiting each iteration).
    fn skip_rep_wait(&self) -> bool {
        false
    }

    /// The byte size of a query response.
    fn query_resp_size(&self) -> usize;

    /// Answer a vertex query; `None` means the vertex is not held here.
    fn query(&self, p: &mut Packer, v: Option<&VertexStorage<Self>>);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pack::Unpacker;

    #[derive(Debug, Default)]
    struct Noop;

    #[derive(Debug, Default, Clone)]
    struct Empty;

    impl WireFixed for Empty {
        const WIRE_SIZE: usize = 0;
        fn pack(&self, _p: &mut Packer) {}
        fn unpack(_u: &mut Unpacker<'_>) -> ElgaResult<Self> {
            Ok(Empty)
        }
    }

    impl Algorithm for Noop {
        type Local = ();
        type Replica = Empty;
        type Notification = Empty;
        const NAME: &'static str = "noop";
        const INBOX: InboxKind = InboxKind::PerIteration;

        fn run(
            &mut self,
            v: &mut VertexStorage<Self>,
            _global_nv: u64,
            _vn: &mut VnStore<Self>,
            _out: &mut RunOutput<Self>,
        ) -> ElgaResult<()> {
            v.state = VertexState::Inactive;
            v.iteration += 1;
            Ok(())
        }
        fn reset_state(&self, _v: &mut VertexStorage<Self>) {}
        fn reset_output(&self, _v: &mut VertexStorage<Self>) {}
        fn save(
            &self,
            _w: &mut dyn std::io::Write,
            _v: &VertexStorage<Self>,
        ) -> std::io::Result<()> {
            Ok(())
        }
        fn dump_ovn_state(
            &self,
            _w: &mut dyn std::io::Write,
            _v: Vertex,
            _n: &Self::Notification,
        ) -> std::io::Result<()> {
            Ok(())
        }
        fn set_active(&self, _v: &mut VertexStorage<Self>, _n: &Self::Notification) {}
        fn set_rep_active(
            &self,
            _v: &mut VertexStorage<Self>,
            _r: &Self::Replica,
        ) -> ElgaResult<()> {
            Ok(())
        }
        fn query_resp_size(&self) -> usize {
            0
        }
        fn query(&self, _p: &mut Packer, _v: Option<&VertexStorage<Self>>) {}
    }

    #[test]
    fn vn_store_slots_grow_lazily() {
        let mut vn: VnStore<Noop> = VnStore::new();
        vn.insert(3, 7, Empty);
        assert!(vn.get(3, 7).is_some());
        assert!(vn.get(2, 7).is_none());
        vn.clear_slot(3);
        assert!(vn.get(3, 7).is_none());
    }

    #[test]
    fn fresh_vertex_is_active_with_no_waits() {
        let v: VertexStorage<Noop> = VertexStorage::new(4, 99);
        assert_eq!(VertexState::Active, v.state);
        assert!(v.recv_satisfied());
        assert_eq!(99, v.self_agent);
    }
}
