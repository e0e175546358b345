//! Breadth-first distances from a start vertex.

use elga_api::pack::WireFixed;
use elga_api::{
    Algorithm, ElgaResult, InboxKind, Packer, RunOutput, Unpacker, Vertex, VertexState,
    VertexStorage, VnStore,
};

/// Per-vertex distance state.
#[derive(Debug, Clone)]
pub struct BfsLocal {
    /// Best known distance from the start vertex.
    pub dist: u64,
    /// Best distance received from replicas.
    pub rep_dist: u64,
}

impl Default for BfsLocal {
    fn default() -> Self {
        Self {
            dist: u64::MAX,
            rep_dist: u64::MAX,
        }
    }
}

/// The distance a replica contributes.
#[derive(Debug, Clone)]
pub struct BfsReplica {
    /// The replica's best distance.
    pub dist: u64,
}

impl Default for BfsReplica {
    fn default() -> Self {
        Self { dist: u64::MAX }
    }
}

impl WireFixed for BfsReplica {
    const WIRE_SIZE: usize = 8;
    fn pack(&self, p: &mut Packer) {
        p.u64(self.dist);
    }
    fn unpack(u: &mut Unpacker<'_>) -> ElgaResult<Self> {
        Ok(Self { dist: u.u64()? })
    }
}

/// The candidate distance a vertex offers its successors.
#[derive(Debug, Clone)]
pub struct BfsNotification {
    /// Distance through the sending vertex.
    pub dist: u64,
}

impl Default for BfsNotification {
    fn default() -> Self {
        Self { dist: u64::MAX }
    }
}

impl WireFixed for BfsNotification {
    const WIRE_SIZE: usize = 8;
    fn pack(&self, p: &mut Packer) {
        p.u64(self.dist);
    }
    fn unpack(u: &mut Unpacker<'_>) -> ElgaResult<Self> {
        Ok(Self { dist: u.u64()? })
    }
}

/// The breadth-first-search algorithm.
#[derive(Debug, Default)]
pub struct Bfs {
    start: Vertex,
}

impl Algorithm for Bfs {
    type Local = BfsLocal;
    type Replica = BfsReplica;
    type Notification = BfsNotification;

    const NAME: &'static str = "bfs";
    const INBOX: InboxKind = InboxKind::PerVertex;

    fn set_start(&mut self, v: Vertex) {
        self.start = v;
    }

    fn run(
        &mut self,
        v: &mut VertexStorage<Self>,
        _global_nv: u64,
        vn: &mut VnStore<Self>,
        out: &mut RunOutput<Self>,
    ) -> ElgaResult<()> {
        let mut new_dist = u64::MAX;

        if v.iteration == 0 {
            new_dist = if v.vertex == self.start { 0 } else { u64::MAX };
        } else {
            for &n in &v.in_neighbors {
                let c = vn.get_or_insert_with(0, n, BfsNotification::default);
                if c.dist < new_dist {
                    new_dist = c.dist;
                }
            }
            if v.local.rep_dist < new_dist {
                new_dist = v.local.rep_dist;
            }
        }

        if new_dist < v.local.dist {
            v.local.dist = new_dist;
            v.local.rep_dist = new_dist;

            if !v.replicas.is_empty() {
                v.replica_storage
                    .entry(v.iteration + 1)
                    .or_default()
                    .insert(v.self_agent, BfsReplica { dist: new_dist });
                out.notify_replica = true;
            }

            out.notify_out = true;
            // Watch for overflow on unreached vertices.
            out.notification.dist = if new_dist == u64::MAX {
                u64::MAX
            } else {
                new_dist + 1
            };
        }

        v.state = VertexState::Inactive;
        v.iteration += 1;
        Ok(())
    }

    fn reset_state(&self, v: &mut VertexStorage<Self>) {
        v.iteration = 0;
        v.local.rep_dist = u64::MAX;
        v.state = VertexState::Active;
    }

    fn reset_output(&self, v: &mut VertexStorage<Self>) {
        self.reset_state(v);
        v.local.dist = u64::MAX;
    }

    fn save(&self, w: &mut dyn std::io::Write, v: &VertexStorage<Self>) -> std::io::Result<()> {
        writeln!(w, "{} {}", v.vertex, v.local.dist)
    }

    fn dump_ovn_state(
        &self,
        w: &mut dyn std::io::Write,
        v: Vertex,
        n: &Self::Notification,
    ) -> std::io::Result<()> {
        write!(w, " {v}:{}", n.dist)
    }

    fn set_active(&self, v: &mut VertexStorage<Self>, n: &Self::Notification) {
        if v.local.dist > n.dist {
            v.state = VertexState::Active;
        }
    }

    fn set_rep_active(
        &self,
        v: &mut VertexStorage<Self>,
        r: &Self::Replica,
    ) -> ElgaResult<()> {
        if v.local.dist > r.dist {
            v.local.rep_dist = r.dist;
            v.state = VertexState::Active;
        }
        Ok(())
    }

    fn query_resp_size(&self) -> usize {
        8
    }

    fn query(&self, p: &mut Packer, v: Option<&VertexStorage<Self>>) {
        p.u64(v.map_or(u64::MAX, |v| v.local.dist));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn start_vertex_seeds_distance_zero() {
        let mut a = Bfs::default();
        a.set_start(5);
        let mut v: VertexStorage<Bfs> = VertexStorage::new(5, 1);
        v.out_neighbors = vec![6];
        let mut vn = VnStore::new();
        let mut out = RunOutput::new();
        a.run(&mut v, 0, &mut vn, &mut out).unwrap();

        assert_eq!(0, v.local.dist);
        assert!(out.notify_out);
        assert_eq!(1, out.notification.dist);
    }

    #[test]
    fn non_start_vertices_stay_unreached_at_first() {
        let mut a = Bfs::default();
        a.set_start(5);
        let mut v: VertexStorage<Bfs> = VertexStorage::new(9, 1);
        let mut vn = VnStore::new();
        let mut out = RunOutput::new();
        a.run(&mut v, 0, &mut vn, &mut out).unwrap();
        assert_eq!(u64::MAX, v.local.dist);
        assert!(!out.notify_out);
    }

    #[test]
    fn relaxes_through_in_neighbors() {
        let mut a = Bfs::default();
        a.set_start(5);
        let mut v: VertexStorage<Bfs> = VertexStorage::new(9, 1);
        v.iteration = 1;
        v.in_neighbors = vec![5];

        let mut vn: VnStore<Bfs> = VnStore::new();
        vn.insert(0, 5, BfsNotification { dist: 1 });

        let mut out = RunOutput::new();
        a.run(&mut v, 0, &mut vn, &mut out).unwrap();
        assert_eq!(1, v.local.dist);
        assert_eq!(2, out.notification.dist);
    }
}
