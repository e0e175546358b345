//! k-Core decomposition by H-index iteration.
//!
//! Each vertex repeatedly sets its coreness estimate to the H-index of its
//! neighbors' estimates; the estimates only ever decrease and converge to
//! the core numbers.

use elga_api::pack::WireFixed;
use elga_api::{
    Algorithm, ElgaError, ElgaResult, InboxKind, Packer, RunOutput, Unpacker, Vertex,
    VertexState, VertexStorage, VnStore,
};

/// Per-vertex coreness state.
#[derive(Debug, Clone)]
pub struct KCoreLocal {
    /// The current coreness estimate.
    pub tau: u64,
}

impl Default for KCoreLocal {
    fn default() -> Self {
        Self { tau: u64::MAX }
    }
}

/// k-Core does not use replica contributions.
#[derive(Debug, Clone, Default)]
pub struct KCoreReplica;

impl WireFixed for KCoreReplica {
    const WIRE_SIZE: usize = 0;
    fn pack(&self, _p: &mut Packer) {}
    fn unpack(_u: &mut Unpacker<'_>) -> ElgaResult<Self> {
        Ok(Self)
    }
}

/// The estimate a vertex announces.
#[derive(Debug, Clone, Default)]
pub struct KCoreNotification {
    /// The announced coreness estimate.
    pub tau: u64,
}

impl WireFixed for KCoreNotification {
    const WIRE_SIZE: usize = 8;
    fn pack(&self, p: &mut Packer) {
        p.u64(self.tau);
    }
    fn unpack(u: &mut Unpacker<'_>) -> ElgaResult<Self> {
        Ok(Self { tau: u.u64()? })
    }
}

/// The k-core algorithm.
#[derive(Debug, Default)]
pub struct KCore;

impl Algorithm for KCore {
    type Local = KCoreLocal;
    type Replica = KCoreReplica;
    type Notification = KCoreNotification;

    const NAME: &'static str = "kcore";
    const INBOX: InboxKind = InboxKind::PerVertex;

    fn run(
        &mut self,
        v: &mut VertexStorage<Self>,
        _global_nv: u64,
        vn: &mut VnStore<Self>,
        out: &mut RunOutput<Self>,
    ) -> ElgaResult<()> {
        if !v.replicas.is_empty() {
            return Err(ElgaError::other("k-core does not support replicated vertices"));
        }

        if v.iteration == 0 {
            v.local.tau = (v.in_neighbors.len() + v.out_neighbors.len()) as u64;
        } else {
            let mut taus =
                Vec::with_capacity(v.in_neighbors.len() + v.out_neighbors.len());
            for &n in v.in_neighbors.iter().chain(v.out_neighbors.iter()) {
                let c = vn.get(0, n).ok_or_else(|| {
                    ElgaError::invariant(format!("no neighbor value for {n}"))
                })?;
                taus.push(c.tau);
            }

            // H-index: the largest h such that h neighbors have tau > h-1.
            taus.sort_unstable_by(|a, b| b.cmp(a));
            let mut new_tau = 0u64;
            while (new_tau as usize) < taus.len() {
                if taus[new_tau as usize] > new_tau {
                    new_tau += 1;
                } else {
                    break;
                }
            }

            if v.local.tau > new_tau {
                v.local.tau = new_tau;
            } else if v.local.tau < new_tau {
                return Err(ElgaError::invariant("coreness estimate increased"));
            } else {
                v.state = VertexState::Inactive;
            }
        }

        if v.state != VertexState::Inactive {
            out.notify_out = true;
            out.notify_in = true;
            out.notification.tau = v.local.tau;
        }

        v.iteration += 1;
        Ok(())
    }

    fn reset_state(&self, v: &mut VertexStorage<Self>) {
        v.iteration = 0;
    }

    fn reset_output(&self, v: &mut VertexStorage<Self>) {
        v.local.tau = u64::MAX;
        v.state = VertexState::Active;
    }

    fn save(&self, w: &mut dyn std::io::Write, v: &VertexStorage<Self>) -> std::io::Result<()> {
        writeln!(w, "{} {}", v.vertex, v.local.tau)
    }

    fn dump_ovn_state(
        &self,
        w: &mut dyn std::io::Write,
        v: Vertex,
        n: &Self::Notification,
    ) -> std::io::Result<()> {
        write!(w, " {v}:{}", n.tau)
    }

    fn set_active(&self, v: &mut VertexStorage<Self>, n: &Self::Notification) {
        if v.local.tau > n.tau {
            v.state = VertexState::Active;
        }
    }

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
        p.u64(v.map_or(u64::MAX, |v| v.local.tau));
    }
}
