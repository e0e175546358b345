//! Label propagation communities.
//!
//! Each vertex adopts the most frequent label among its neighbors, ties
//! going to the smaller label. Unlabeled neighbors count as their own id.

use elga_api::pack::WireFixed;
use elga_api::{
    Algorithm, ElgaError, ElgaResult, InboxKind, Packer, RunOutput, Unpacker, Vertex,
    VertexState, VertexStorage, VnStore,
};
use std::collections::HashMap;

/// Per-vertex label state.
#[derive(Debug, Clone)]
pub struct LpaLocal {
    /// The current community label.
    pub lp: Vertex,
}

impl Default for LpaLocal {
    fn default() -> Self {
        Self { lp: Vertex::MAX }
    }
}

/// LPA does not use replica contributions.
#[derive(Debug, Clone, Default)]
pub struct LpaReplica;

impl WireFixed for LpaReplica {
    const WIRE_SIZE: usize = 0;
    fn pack(&self, _p: &mut Packer) {}
    fn unpack(_u: &mut Unpacker<'_>) -> ElgaResult<Self> {
        Ok(Self)
    }
}

/// The label a vertex announces.
#[derive(Debug, Clone, Default)]
pub struct LpaNotification {
    /// The announced label.
    pub lp: Vertex,
}

impl WireFixed for LpaNotification {
    const WIRE_SIZE: usize = 8;
    fn pack(&self, p: &mut Packer) {
        p.u64(self.lp);
    }
    fn unpack(u: &mut Unpacker<'_>) -> ElgaResult<Self> {
        Ok(Self { lp: u.u64()? })
    }
}

/// The label-propagation algorithm.
#[derive(Debug, Default)]
pub struct Lpa;

impl Algorithm for Lpa {
    type Local = LpaLocal;
    type Replica = LpaReplica;
    type Notification = LpaNotification;

    const NAME: &'static str = "lpa";
    const INBOX: InboxKind = InboxKind::PerVertex;

    fn run(
        &mut self,
        v: &mut VertexStorage<Self>,
        _global_nv: u64,
        vn: &mut VnStore<Self>,
        out: &mut RunOutput<Self>,
    ) -> ElgaResult<()> {
        if !v.replicas.is_empty() {
            return Err(ElgaError::other("lpa does not support replicated vertices"));
        }

        if v.iteration == 0 {
            v.local.lp = v.vertex;
        }

        let mut freq: HashMap<Vertex, usize> = HashMap::new();
        for &e in v.in_neighbors.iter().chain(v.out_neighbors.iter()) {
            let n = vn.get_or_insert_with(0, e, || LpaNotification { lp: e });
            *freq.entry(n.lp).or_default() += 1;
        }

        let mut max_freq = 0usize;
        let mut new_lp = v.local.lp;
        for (lab, cnt) in freq {
            if cnt > max_freq {
                max_freq = cnt;
                new_lp = lab;
            } else if cnt == max_freq && lab < new_lp {
                new_lp = lab;
            }
        }

        v.iteration += 1;

        if new_lp != v.local.lp || v.iteration == 1 {
            tracing::trace!(v = v.vertex, from = v.local.lp, to = new_lp, "label update");
            v.local.lp = new_lp;
            out.notify_out = true;
            out.notify_in = true;
            out.notification.lp = new_lp;
        }
        v.state = VertexState::Inactive;
        Ok(())
    }

    fn reset_state(&self, v: &mut VertexStorage<Self>) {
        v.iteration = 1;
    }

    fn reset_output(&self, v: &mut VertexStorage<Self>) {
        v.local.lp = Vertex::MAX;
        v.iteration = 0;
        v.state = VertexState::Active;
    }

    fn save(&self, w: &mut dyn std::io::Write, v: &VertexStorage<Self>) -> std::io::Result<()> {
        writeln!(w, "{} {}", v.vertex, v.local.lp)
    }

    fn dump_ovn_state(
        &self,
        w: &mut dyn std::io::Write,
        v: Vertex,
        n: &Self::Notification,
    ) -> std::io::Result<()> {
        write!(w, " {v}:{}", n.lp)
    }

    fn set_active(&self, v: &mut VertexStorage<Self>, _n: &Self::Notification) {
        v.state = VertexState::Active;
    }

    fn set_rep_active(
        &self,
        _v: &mut VertexStorage<Self>,
        _r: &Self::Replica,
    ) -> ElgaResult<()> {
        Err(ElgaError::other("lpa does not support replicated vertices"))
    }

    fn query_resp_size(&self) -> usize {
        8
    }

    fn query(&self, p: &mut Packer, v: Option<&VertexStorage<Self>>) {
        p.u64(v.map_or(Vertex::MAX, |v| v.local.lp));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn adopts_majority_label() {
        let mut a = Lpa;
        let mut v: VertexStorage<Lpa> = VertexStorage::new(10, 1);
        v.in_neighbors = vec![1, 2];
        v.out_neighbors = vec![3];

        let mut vn: VnStore<Lpa> = VnStore::new();
        vn.insert(0, 1, LpaNotification { lp: 7 });
        vn.insert(0, 2, LpaNotification { lp: 7 });
        vn.insert(0, 3, LpaNotification { lp: 3 });

        let mut out = RunOutput::new();
        a.run(&mut v, 0, &mut vn, &mut out).unwrap();
        assert_eq!(7, v.local.lp);
        assert!(out.notify_out && out.notify_in);
    }

    #[test]
    fn ties_go_to_the_smaller_label() {
        let mut a = Lpa;
        let mut v: VertexStorage<Lpa> = VertexStorage::new(10, 1);
        v.in_neighbors = vec![1, 2];

        let mut vn: VnStore<Lpa> = VnStore::new();
        vn.insert(0, 1, LpaNotification { lp: 9 });
        vn.insert(0, 2, LpaNotification { lp: 4 });

        let mut out = RunOutput::new();
        a.run(&mut v, 0, &mut vn, &mut out).unwrap();
        assert_eq!(4, v.local.lp);
    }

    #[test]
    fn stable_label_goes_quiet() {
        let mut a = Lpa;
        let mut v: VertexStorage<Lpa> = VertexStorage::new(10, 1);
        v.iteration = 2;
        v.local.lp = 4;
        v.in_neighbors = vec![1];

        let mut vn: VnStore<Lpa> = VnStore::new();
        vn.insert(0, 1, LpaNotification { lp: 4 });

        let mut out = RunOutput::new();
        a.run(&mut v, 0, &mut vn, &mut out).unwrap();
        assert_eq!(4, v.local.lp);
        assert!(!out.notify_out);
        assert_eq!(VertexState::Inactive, v.state);
    }
}
