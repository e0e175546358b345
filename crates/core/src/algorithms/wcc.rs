//! Weakly connected components by minimum-label propagation.
//!
//! Every vertex adopts the smallest component id it can see among its
//! neighbors (both directions) and its replicas, and notifies only when
//! its label improved. Unlabeled neighbors count as their own id.

use elga_api::pack::WireFixed;
use elga_api::{
    Algorithm, ElgaResult, InboxKind, Packer, RunOutput, Unpacker, Vertex, VertexState,
    VertexStorage, VnStore,
};

/// Per-vertex component state.
#[derive(Debug, Clone)]
pub struct WccLocal {
    /// Current component label.
    pub cc: Vertex,
    /// Best label received from replicas.
    pub rep_cc: Vertex,
}

impl Default for WccLocal {
    fn default() -> Self {
        Self {
            cc: Vertex::MAX,
            rep_cc: Vertex::MAX,
        }
    }
}

/// The component label a replica contributes.
#[derive(Debug, Clone)]
pub struct WccReplica {
    /// The replica's best label.
    pub cc: Vertex,
}

impl Default for WccReplica {
    fn default() -> Self {
        Self { cc: Vertex::MAX }
    }
}

impl WireFixed for WccReplica {
    const WIRE_SIZE: usize = 8;
    fn pack(&self, p: &mut Packer) {
        p.u64(self.cc);
    }
    fn unpack(u: &mut Unpacker<'_>) -> ElgaResult<Self> {
        Ok(Self { cc: u.u64()? })
    }
}

/// The label a vertex announces to its neighbors.
#[derive(Debug, Clone, Default)]
pub struct WccNotification {
    /// The announced component label.
    pub cc: Vertex,
}

impl WireFixed for WccNotification {
    const WIRE_SIZE: usize = 8;
    fn pack(&self, p: &mut Packer) {
        p.u64(self.cc);
    }
    fn unpack(u: &mut Unpacker<'_>) -> ElgaResult<Self> {
        Ok(Self { cc: u.u64()? })
    }
}

/// The weakly-connected-components algorithm.
#[derive(Debug, Default)]
pub struct Wcc;

impl Algorithm for Wcc {
    type Local = WccLocal;
    type Replica = WccReplica;
    type Notification = WccNotification;

    const NAME: &'static str = "wcc";
    const INBOX: InboxKind = InboxKind::PerVertex;

    fn run(
        &mut self,
        v: &mut VertexStorage<Self>,
        _global_nv: u64,
        vn: &mut VnStore<Self>,
        out: &mut RunOutput<Self>,
    ) -> ElgaResult<()> {
        if v.iteration == 0 {
            v.local.cc = v.vertex;
        }

        let mut new_cc = v.local.cc;
        for &e in &v.in_neighbors {
            let n = vn.get_or_insert_with(0, e, || WccNotification { cc: e });
            if n.cc < new_cc {
                new_cc = n.cc;
            }
        }
        for &e in &v.out_neighbors {
            let n = vn.get_or_insert_with(0, e, || WccNotification { cc: e });
            if n.cc < new_cc {
                new_cc = n.cc;
            }
        }
        if v.local.rep_cc < new_cc {
            new_cc = v.local.rep_cc;
        }

        v.iteration += 1;
        let next_it = v.iteration;

        if new_cc < v.local.cc || v.iteration == 1 {
            v.local.cc = new_cc;
            v.local.rep_cc = new_cc;
            out.notify_out = true;
            out.notify_in = true;
            if !v.replicas.is_empty() {
                v.replica_storage
                    .entry(next_it)
                    .or_default()
                    .insert(v.self_agent, WccReplica { cc: new_cc });
                out.notify_replica = true;
            }
            out.notification.cc = new_cc;
        }
        v.state = VertexState::Inactive;
        Ok(())
    }

    fn reset_state(&self, v: &mut VertexStorage<Self>) {
        v.iteration = 1;
        v.local.rep_cc = Vertex::MAX;
    }

    fn reset_output(&self, v: &mut VertexStorage<Self>) {
        v.local.cc = Vertex::MAX;
        v.local.rep_cc = Vertex::MAX;
        v.iteration = 0;
        v.state = VertexState::Active;
    }

    fn save(&self, w: &mut dyn std::io::Write, v: &VertexStorage<Self>) -> std::io::Result<()> {
        writeln!(w, "{} {}", v.vertex, v.local.cc)
    }

    fn dump_ovn_state(
        &self,
        w: &mut dyn std::io::Write,
        v: Vertex,
        n: &Self::Notification,
    ) -> std::io::Result<()> {
        write!(w, " {v}:{}", n.cc)
    }

    fn set_active(&self, v: &mut VertexStorage<Self>, n: &Self::Notification) {
        if v.local.cc > n.cc {
            v.state = VertexState::Active;
        }
    }

    fn set_rep_active(
        &self,
        v: &mut VertexStorage<Self>,
        r: &Self::Replica,
    ) -> ElgaResult<()> {
        if v.local.cc > r.cc {
            v.local.rep_cc = r.cc;
            v.state = VertexState::Active;
        }
        Ok(())
    }

    fn skip_rep_wait(&self) -> bool {
        true
    }

    fn query_resp_size(&self) -> usize {
        8
    }

    fn query(&self, p: &mut Packer, v: Option<&VertexStorage<Self>>) {
        p.u64(v.map_or(Vertex::MAX, |v| v.local.cc));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn adopts_smallest_visible_label() {
        let mut a = Wcc;
        let mut v: VertexStorage<Wcc> = VertexStorage::new(9, 1);
        v.in_neighbors = vec![4];
        v.out_neighbors = vec![12];

        let mut vn: VnStore<Wcc> = VnStore::new();
        vn.insert(0, 4, WccNotification { cc: 2 });

        let mut out = RunOutput::new();
        a.run(&mut v, 0, &mut vn, &mut out).unwrap();

        assert_eq!(2, v.local.cc);
        assert!(out.notify_out && out.notify_in);
        assert_eq!(2, out.notification.cc);
        assert_eq!(VertexState::Inactive, v.state);
        // The unlabeled out-neighbor was seeded with its own id.
        assert_eq!(12, vn.get(0, 12).unwrap().cc);
    }

    #[test]
    fn quiet_when_no_improvement() {
        let mut a = Wcc;
        let mut v: VertexStorage<Wcc> = VertexStorage::new(3, 1);
        v.iteration = 2;
        v.local.cc = 1;
        v.in_neighbors = vec![5];

        let mut vn: VnStore<Wcc> = VnStore::new();
        vn.insert(0, 5, WccNotification { cc: 4 });

        let mut out = RunOutput::new();
        a.run(&mut v, 0, &mut vn, &mut out).unwrap();
        assert_eq!(1, v.local.cc);
        assert!(!out.notify_out);
    }

    #[test]
    fn replica_label_reactivates() {
        let a = Wcc;
        let mut v: VertexStorage<Wcc> = VertexStorage::new(8, 1);
        v.local.cc = 8;
        v.state = VertexState::Inactive;
        a.set_rep_active(&mut v, &WccReplica { cc: 2 }).unwrap();
        assert_eq!(VertexState::Active, v.state);
        assert_eq!(2, v.local.rep_cc);
    }
}
