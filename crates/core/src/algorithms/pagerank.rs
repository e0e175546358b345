//! PageRank with a fixed superstep count.
//!
//! Runs in lockstep: every vertex reads its in-neighbors' scaled ranks for
//! the current iteration, produces the next rank, and goes dormant until
//! the barrier. Replicated vertices contribute partial sums and wait for
//! their peers each iteration.

use elga_api::pack::WireFixed;
use elga_api::{
    Algorithm, ElgaError, ElgaResult, InboxKind, Packer, RunOutput, Tunables, Unpacker, Vertex,
    VertexState, VertexStorage, VnStore,
};

const DAMPING_FACTOR: f64 = 0.85;

/// Per-vertex PageRank state.
#[derive(Debug, Clone, Default)]
pub struct PrLocal {
    /// The current rank.
    pub pr: f64,
    /// Out-degree observed at the last superstep.
    pub out_degree: u64,
}

/// The partial sum a replica contributes each iteration.
#[derive(Debug, Clone, Default)]
pub struct PrReplica {
    /// Partial rank sum over this replica's in-edges.
    pub pr: f64,
    /// This replica's share of the out-degree.
    pub out_degree: u64,
}

impl WireFixed for PrReplica {
    const WIRE_SIZE: usize = 8 + 8;
    fn pack(&self, p: &mut Packer) {
        p.f64(self.pr).u64(self.out_degree);
    }
    fn unpack(u: &mut Unpacker<'_>) -> ElgaResult<Self> {
        Ok(Self {
            pr: u.f64()?,
            out_degree: u.u64()?,
        })
    }
}

/// The rank share a vertex sends to each out-neighbor.
#[derive(Debug, Clone)]
pub struct PrNotification {
    /// Rank divided by out-degree.
    pub scaled_pr: f64,
}

impl Default for PrNotification {
    fn default() -> Self {
        Self {
            scaled_pr: f64::INFINITY,
        }
    }
}

impl WireFixed for PrNotification {
    const WIRE_SIZE: usize = 8;
    fn pack(&self, p: &mut Packer) {
        p.f64(self.scaled_pr);
    }
    fn unpack(u: &mut Unpacker<'_>) -> ElgaResult<Self> {
        Ok(Self { scaled_pr: u.f64()? })
    }
}

/// The PageRank algorithm.
#[derive(Debug, Default)]
pub struct PageRank {
    supersteps: i32,
}

impl Algorithm for PageRank {
    type Local = PrLocal;
    type Replica = PrReplica;
    type Notification = PrNotification;

    const NAME: &'static str = "pagerank";
    const INBOX: InboxKind = InboxKind::PerIteration;

    fn configure(&mut self, t: &Tunables) {
        self.supersteps = t.pagerank_supersteps;
    }

    fn run(
        &mut self,
        v: &mut VertexStorage<Self>,
        global_nv: u64,
        vn: &mut VnStore<Self>,
        out: &mut RunOutput<Self>,
    ) -> ElgaResult<()> {
        if v.iteration == 0 {
            v.local.pr = 1.0 / global_nv as f64;
        }

        if v.iteration > self.supersteps {
            // Computation is completely over.
            v.iteration += 1;
            v.state = VertexState::Inactive;
            return Ok(());
        }

        let mut new_pr = 0.0;
        let cur_it = v.iteration;
        let reps = v.replicas.len();
        let got = v.replica_storage.get(&cur_it).map_or(0, |m| m.len());

        if reps == 0 || got != reps {
            // Read all neighbors.
            if cur_it > 0 {
                for &e in &v.in_neighbors {
                    let n = vn.get(cur_it, e).ok_or_else(|| {
                        ElgaError::invariant(format!(
                            "no neighbor value: me={} ngh={e} it={cur_it}",
                            v.vertex
                        ))
                    })?;
                    new_pr += n.scaled_pr;
                }
            }
            v.local.out_degree = v.out_neighbors.len() as u64;

            if got != reps {
                // Park our share and wait for the other replicas.
                v.replica_storage.entry(cur_it).or_default().insert(
                    v.self_agent,
                    PrReplica {
                        pr: new_pr,
                        out_degree: v.local.out_degree,
                    },
                );
                v.state = VertexState::RepWait;
                out.notify_replica = true;
                return Ok(());
            }
        } else {
            // Load state from replicas.
            v.local.out_degree = 0;
            for rep in v.replica_storage[&cur_it].values() {
                if cur_it > 0 {
                    new_pr += rep.pr;
                }
                v.local.out_degree += rep.out_degree;
            }
        }

        new_pr = (1.0 - DAMPING_FACTOR) / global_nv as f64 + DAMPING_FACTOR * new_pr;

        v.iteration += 1;
        let next_it = v.iteration;

        if next_it > 1 {
            v.local.pr = new_pr;
        }

        // Propagate the scaled rank to every out neighbor.
        let scaled_pr = v.local.pr / v.local.out_degree as f64;
        out.notification.scaled_pr = scaled_pr;
        out.notify_out = true;

        if next_it == 1 {
            v.local.pr = new_pr;
        }

        v.state = VertexState::Dormant;
        Ok(())
    }

    fn reset_state(&self, v: &mut VertexStorage<Self>) {
        // Not a batch algorithm: everyone restarts from scratch.
        v.state = VertexState::Active;
        v.iteration = 0;
        v.vertex_recv_needed = 0;
        v.neighbor_recv_needed = 0;
        v.replica_recv_needed = 0;
        v.local.out_degree = 0;
    }

    fn reset_output(&self, v: &mut VertexStorage<Self>) {
        v.local.pr = 0.0;
    }

    fn save(&self, w: &mut dyn std::io::Write, v: &VertexStorage<Self>) -> std::io::Result<()> {
        writeln!(w, "{} {}", v.vertex, v.local.pr)
    }

    fn dump_ovn_state(
        &self,
        w: &mut dyn std::io::Write,
        v: Vertex,
        n: &Self::Notification,
    ) -> std::io::Result<()> {
        write!(w, " {v}:{}", n.scaled_pr)
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
        8
    }

    fn query(&self, p: &mut Packer, v: Option<&VertexStorage<Self>>) {
        p.f64(v.map_or(f64::INFINITY, |v| v.local.pr));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn alg() -> PageRank {
        let mut a = PageRank::default();
        a.configure(&Tunables::testing());
        a
    }

    #[test]
    fn first_superstep_spreads_uniform_rank() {
        let mut a = alg();
        let mut v: VertexStorage<PageRank> = VertexStorage::new(0, 1);
        v.out_neighbors = vec![1, 2, 3, 4];
        let mut vn = VnStore::new();
        let mut out = RunOutput::new();

        a.run(&mut v, 5, &mut vn, &mut out).unwrap();

        assert!(out.notify_out);
        assert_eq!(VertexState::Dormant, v.state);
        assert_eq!(1, v.iteration);
        // Rank 1/5 spread over four out edges.
        assert!((out.notification.scaled_pr - 0.2 / 4.0).abs() < 1e-12);
    }

    #[test]
    fn later_supersteps_sum_neighbor_shares() {
        let mut a = alg();
        let mut v: VertexStorage<PageRank> = VertexStorage::new(7, 1);
        v.in_neighbors = vec![1, 2];
        v.out_neighbors = vec![1];
        v.iteration = 1;
        v.local.pr = 0.2;

        let mut vn: VnStore<PageRank> = VnStore::new();
        vn.insert(1, 1, PrNotification { scaled_pr: 0.05 });
        vn.insert(1, 2, PrNotification { scaled_pr: 0.10 });

        let mut out = RunOutput::new();
        a.run(&mut v, 5, &mut vn, &mut out).unwrap();

        let expect = (1.0 - DAMPING_FACTOR) / 5.0 + DAMPING_FACTOR * 0.15;
        assert!((v.local.pr - expect).abs() < 1e-12);
        assert!(out.notify_out);
    }

    #[test]
    fn missing_neighbor_value_is_fatal() {
        let mut a = alg();
        let mut v: VertexStorage<PageRank> = VertexStorage::new(7, 1);
        v.in_neighbors = vec![9];
        v.iteration = 1;
        let mut vn = VnStore::new();
        let mut out = RunOutput::new();
        assert!(a.run(&mut v, 5, &mut vn, &mut out).is_err());
    }

    #[test]
    fn replica_share_parks_the_vertex() {
        let mut a = alg();
        let mut v: VertexStorage<PageRank> = VertexStorage::new(3, 10);
        v.replicas.insert(10);
        v.replicas.insert(20);
        v.out_neighbors = vec![4];

        let mut vn = VnStore::new();
        let mut out = RunOutput::new();
        a.run(&mut v, 5, &mut vn, &mut out).unwrap();

        assert_eq!(VertexState::RepWait, v.state);
        assert!(out.notify_replica);
        assert!(v.replica_storage[&0].contains_key(&10));

        // Once the other replica reports, the vertex loads the combined
        // state instead of recomputing.
        v.replica_storage.get_mut(&0).unwrap().insert(
            20,
            PrReplica {
                pr: 0.0,
                out_degree: 3,
            },
        );
        v.state = VertexState::Active;
        let mut out = RunOutput::new();
        a.run(&mut v, 5, &mut vn, &mut out).unwrap();
        assert_eq!(4, v.local.out_degree);
        assert_eq!(VertexState::Dormant, v.state);
    }

    #[test]
    fn stops_after_configured_supersteps() {
        let mut a = alg();
        a.supersteps = 2;
        let mut v: VertexStorage<PageRank> = VertexStorage::new(0, 1);
        v.iteration = 3;
        let mut vn = VnStore::new();
        let mut out = RunOutput::new();
        a.run(&mut v, 5, &mut vn, &mut out).unwrap();
        assert_eq!(VertexState::Inactive, v.state);
        assert!(!out.notify_out);
    }
}
