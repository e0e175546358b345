//! The graph agent.
//!
//! An agent owns a shard of the graph, runs the batch/superstep state
//! machine, executes the configured vertex algorithm, moves edges when the
//! directory changes, and reports statistics. One agent runs per local
//! number; each is a single-threaded poll loop.

use crate::chatterbox::Replier;
use crate::ctx::ProcessCtx;
use crate::participant::{self, Participant, Role};
use crate::sketch::CountMinSketch;
use elga_api::pack::{pack_vagent, unpack_vagent, WireFixed, UPDATE_WIRE_SIZE};
use elga_api::{
    Address, Algorithm, Batch, Dir, Discipline, Edge, ElgaError, ElgaResult, InboxKind, It,
    MsgKind, Packer, Unpacker, Update, VagentId, Vertex, VertexState, VertexStorage, VnStore,
};
use std::collections::{HashMap, HashSet};
use std::io::Write;

mod bsp;
mod full;
mod lbsp;

/// Edge-move flag on `SEND_UPDATES`.
pub(crate) const FLAG_MOVE_EDGES: u8 = 0x0;
/// OUT-symmetric flag on `SEND_UPDATES`.
pub(crate) const FLAG_OUT_EDGES: u8 = 0x1;
/// Transpose-check flag on `SEND_UPDATES`.
pub(crate) const FLAG_CHECK: u8 = 0x2;

/// The agent lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Initial state: edges are accepted but reciprocal edges are not
    /// created and graph statistics are never reported.
    NoProcess,
    /// Leaving NoProcess: out edges are being generated before the first
    /// computation.
    LeavingNoProcess,
    /// Between batches; waiting for an edge to enter the system somewhere.
    Idle,
    /// Folding queued updates into the graph and generating their out
    /// edges.
    FinalizeGraphBatch,
    /// Full processing of the current superstep.
    Process,
    /// No vertex expects further input; ready to join the barrier.
    JoinBarrier,
    /// At the barrier, waiting for the directory's sync.
    WaitForSync,
    /// Waiting out a forced load-balance round.
    WaitForLb,
    /// A directory update landed mid load-balance; waiting for the simple
    /// sync to finish before applying it.
    WaitForLbSync,
    /// Waiting for edge movements to be acknowledged.
    WaitEdgeMove,
}

/// What one vertex run produced, for the vote-to-stop accounting.
pub(crate) struct RunOne {
    pub(crate) state: VertexState,
    pub(crate) notified: bool,
}

/// The main graph agent, generic over the configured algorithm.
pub struct Agent<A: Algorithm> {
    p: Participant,
    serial: u64,
    discipline: Discipline,

    graph: HashMap<Vertex, VertexStorage<A>>,

    vn: VnStore<A>,
    vn_wait: Vec<HashMap<Vertex, Vec<(Vertex, bool)>>>,
    vn_count: usize,
    vn_remaining: Vec<u64>,

    nv: u64,
    ne: u64,
    global_nv: u64,
    global_ne: u64,

    update_nv: f64,
    update_nv_set: HashSet<Vertex>,
    update_ne: i64,

    alg: A,
    state: AgentState,

    active: HashSet<Vertex>,
    dormant: HashSet<Vertex>,
    num_dormant: u64,
    num_inactive: u64,

    agent_msgs_needed: HashMap<It, i64>,
    out_vn_msgs: HashMap<u64, Vec<(Vertex, A::Notification)>>,
    out_rep_msgs: HashMap<u64, Vec<(It, Vertex, A::Replica)>>,
    it: It,

    vagent_count: VagentId,

    update_set: HashSet<Update>,
    requested_leave_idle: bool,
    batch: Batch,
    update_acks_needed: i64,

    cms: Option<CountMinSketch>,
    push_sketch: bool,

    moves: HashMap<u64, Vec<Update>>,

    // Remote vertex -> local vertices adjacent to it, for locally-applied
    // notification delivery.
    tmap: HashMap<Vertex, Vec<Vertex>>,
}

impl<A: Algorithm> Agent<A> {
    /// Create an agent at `addr` and resolve its directory.
    pub fn new(ctx: &ProcessCtx, addr: Address, dm: Address) -> ElgaResult<Self> {
        let t = &ctx.tunables;
        let discipline = t.discipline;
        match (A::INBOX, discipline) {
            (InboxKind::PerIteration, Discipline::Lbsp) => {
                return Err(ElgaError::arg(format!(
                    "{} uses an iteration-keyed inbox and cannot run lbsp",
                    A::NAME
                )))
            }
            (InboxKind::PerVertex, Discipline::Bsp) => {
                return Err(ElgaError::arg(format!(
                    "{} uses a vertex-keyed inbox and cannot run bsp",
                    A::NAME
                )))
            }
            _ => {}
        }

        let mut alg = A::default();
        alg.configure(t);

        let cms = t.sketch_enabled().then(CountMinSketch::new);
        let vagent_count = t.starting_vagents;

        let p = Participant::new(ctx, addr, dm, true)?;
        let serial = p.serial();

        Ok(Self {
            p,
            serial,
            discipline,
            graph: HashMap::new(),
            vn: VnStore::new(),
            vn_wait: Vec::new(),
            vn_count: 0,
            vn_remaining: Vec::new(),
            nv: 0,
            ne: 0,
            global_nv: 0,
            global_ne: 0,
            update_nv: 0.0,
            update_nv_set: HashSet::new(),
            update_ne: 0,
            alg,
            state: AgentState::NoProcess,
            active: HashSet::new(),
            dormant: HashSet::new(),
            num_dormant: 0,
            num_inactive: 0,
            agent_msgs_needed: HashMap::new(),
            out_vn_msgs: HashMap::new(),
            out_rep_msgs: HashMap::new(),
            it: -1,
            vagent_count,
            update_set: HashSet::new(),
            requested_leave_idle: false,
            batch: 0,
            update_acks_needed: 0,
            cms,
            push_sketch: false,
            moves: HashMap::new(),
            tmap: HashMap::new(),
        })
    }

    /// Subscribe to the control feeds and register with the directory.
    pub fn register_dir(&mut self) -> ElgaResult<()> {
        let sketch = self.cms.is_some();
        let chat = self.p.chat();
        for kind in [
            MsgKind::DoStart,
            MsgKind::DoUpdate,
            MsgKind::DoSave,
            MsgKind::DoDump,
            MsgKind::DoReset,
            MsgKind::DoChkT,
            MsgKind::DoVa,
            MsgKind::Nv,
            MsgKind::Rv,
            MsgKind::HaveUpdate,
            MsgKind::Sync,
            MsgKind::SimpleSyncDone,
        ] {
            chat.sub(kind)?;
        }
        if sketch {
            chat.sub(MsgKind::DoCsLb)?;
        }

        let mut p = Packer::msg(MsgKind::AgentJoin);
        p.u64(pack_vagent(self.serial, self.vagent_count));
        self.d_send_ctrl(p.freeze())?;
        tracing::debug!(serial = self.serial, "registered with directory");
        Ok(())
    }

    /// Run the agent loop until shutdown.
    pub fn run(&mut self) -> ElgaResult<()> {
        participant::run(self)
    }

    fn get_owner(&mut self, u: &Update) -> u64 {
        self.p.find_agent(u.edge, u.dir, true, 0, false).0
    }

    /// Send a control frame to our directory. During a cooperative
    /// shutdown the directory may already be gone; dropping the frame is
    /// fine, nothing is waiting on it any more.
    fn d_send_ctrl(&mut self, frame: bytes::Bytes) -> ElgaResult<()> {
        match self.p.d_send(frame) {
            Ok(()) => Ok(()),
            Err(e) if self.p.ctx().shutdown_requested() => {
                tracing::warn!(%e, "dropping directory frame during shutdown");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Send a frame to a peer agent. During a cooperative shutdown the
    /// peer may already be gone; the design is at-least-once with
    /// idempotent change-sets, so the frame is dropped rather than
    /// treated as fatal. Returns whether the send happened.
    fn send_to_agent(&mut self, agent: u64, frame: bytes::Bytes) -> ElgaResult<bool> {
        let res = self
            .p
            .get_requester(agent)
            .and_then(|r| r.send(frame));
        match res {
            Ok(()) => Ok(true),
            Err(e) if self.p.ctx().shutdown_requested() => {
                tracing::warn!(agent, %e, "dropping frame to departed peer during shutdown");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply one edge change to the local shard, or queue it for movement
    /// if this agent does not own it.
    fn change_edge(&mut self, u: Update, count_deg: bool) -> ElgaResult<()> {
        let owner = self.get_owner(&u);
        if owner != self.serial {
            tracing::trace!(src = u.edge.src, dst = u.edge.dst, owner, "queueing misowned edge");
            self.moves.entry(owner).or_default().push(u);
            return Ok(());
        }

        let v_mine = u.owned_vertex();
        let v_theirs = u.other_vertex();

        if A::INBOX == InboxKind::PerVertex {
            self.tmap.entry(v_theirs).or_default().push(v_mine);
        }

        let gv = self
            .graph
            .entry(v_mine)
            .or_insert_with(|| VertexStorage::new(v_mine, self.serial));

        if gv.state != VertexState::Dormant {
            gv.state = VertexState::Active;
            if self.discipline == Discipline::Full {
                self.active.insert(v_mine);
            }
        }

        if u.insert {
            if gv.in_neighbors.is_empty() && gv.out_neighbors.is_empty() {
                self.nv += 1;
                self.update_nv_set.insert(v_mine);
            }
            match u.dir {
                Dir::In => {
                    gv.in_neighbors.push(v_theirs);
                    self.update_ne += 1;
                    self.ne += 1;
                }
                Dir::Out => gv.out_neighbors.push(v_theirs),
            }
            if count_deg {
                if let Some(cms) = self.cms.as_mut() {
                    let deg_est = cms.query_count(v_mine);
                    if deg_est >= self.p.ctx().tunables.rep_threshold {
                        // Our share of this key is hot; the directory
                        // should learn about it at the next balance round.
                        self.push_sketch = true;
                    }
                }
            }
        } else {
            let neighbors = match u.dir {
                Dir::In => &mut gv.in_neighbors,
                Dir::Out => &mut gv.out_neighbors,
            };
            if let Some(pos) = neighbors.iter().position(|&n| n == v_theirs) {
                neighbors.swap_remove(pos);
            }
            if u.dir == Dir::In {
                self.update_ne -= 1;
                self.ne = self.ne.saturating_sub(1);
            }
            if gv.in_neighbors.is_empty() && gv.out_neighbors.is_empty() {
                self.nv = self.nv.saturating_sub(1);
                let reps = gv.replicas.len();
                self.update_nv -= if reps > 0 { 1.0 / reps as f64 } else { 1.0 };
                self.graph.remove(&v_mine);
            }
        }
        Ok(())
    }

    /// Dispatch queued edge movements, one batch per destination.
    fn send_move_edges(&mut self) -> ElgaResult<()> {
        if self.moves.is_empty() {
            return Ok(());
        }

        let moves = std::mem::take(&mut self.moves);
        let mut dests = 0i64;
        let mut moved_edges = 0usize;
        for (agent, list) in moves {
            let mut p =
                Packer::with_capacity(1 + 1 + 8 + list.len() * UPDATE_WIRE_SIZE);
            p.kind(MsgKind::SendUpdates);
            p.u8(FLAG_MOVE_EDGES);
            p.u64(self.serial);
            for u in &list {
                p.update(u);
                moved_edges += 1;
            }
            if self.send_to_agent(agent, p.freeze())? {
                dests += 1;
            }
        }
        self.update_acks_needed += dests;

        tracing::info!(moved_edges, destinations = dests, "moved edges");
        Ok(())
    }

    /// Generate the symmetric OUT edge for every IN edge and send each to
    /// its owner. With `check`, send the transpose-check form instead,
    /// which verifies rather than inserts.
    fn send_out_edges(&mut self, check: bool) -> ElgaResult<()> {
        if !check {
            // Remove multi-edges.
            for gv in self.graph.values_mut() {
                let before = gv.in_neighbors.len();
                gv.in_neighbors.sort_unstable();
                gv.in_neighbors.dedup();
                self.ne = self.ne.saturating_sub((before - gv.in_neighbors.len()) as u64);
            }
        }

        let mut updates_to_send: HashMap<u64, Vec<Update>> = HashMap::new();
        let mut my_insertions = Vec::new();

        let verts: Vec<Vertex> = self.graph.keys().copied().collect();
        for v in verts {
            let in_neighbors = self.graph[&v].in_neighbors.clone();
            for n in in_neighbors {
                let e = Edge::new(n, v);
                let u = Update::new(e, Dir::Out, true);
                let (dst, _) = self.p.find_agent(e, Dir::Out, true, 0, false);
                if dst == self.serial {
                    my_insertions.push(u);
                } else {
                    updates_to_send.entry(dst).or_default().push(u);
                }
            }
        }
        tracing::debug!(destinations = updates_to_send.len(), "sending out edges");

        let flag = if check { FLAG_CHECK } else { FLAG_OUT_EDGES };
        let mut dests = 0i64;
        for (agent, list) in updates_to_send {
            let mut p =
                Packer::with_capacity(1 + 1 + 8 + list.len() * UPDATE_WIRE_SIZE);
            p.kind(MsgKind::SendUpdates);
            p.u8(flag);
            p.u64(self.serial);
            for u in &list {
                p.update(u);
            }
            if self.send_to_agent(agent, p.freeze())? {
                dests += 1;
            }
        }

        for u in my_insertions {
            if !check {
                self.change_edge(u, true)?;
            } else {
                self.check_out_edge(&u)?;
            }
        }

        if !check {
            self.update_acks_needed += dests;
            if self.update_acks_needed == 0 {
                self.done_waiting_ready_nv_ne()?;
            }
        } else {
            tracing::info!("transpose check passed locally");
        }
        Ok(())
    }

    fn check_out_edge(&self, u: &Update) -> ElgaResult<()> {
        let gv = self.graph.get(&u.edge.src).ok_or_else(|| {
            ElgaError::invariant(format!("check failed; vertex {} not found", u.edge.src))
        })?;
        if !gv.out_neighbors.contains(&u.edge.dst) {
            return Err(ElgaError::invariant(format!(
                "check failed; edge {}->{} not found",
                u.edge.src, u.edge.dst
            )));
        }
        Ok(())
    }

    /// Fold the queued update set into the graph and create the
    /// corresponding out edges.
    fn finalize_graph_batch(&mut self) -> ElgaResult<()> {
        let mut updates_to_send: HashMap<u64, Vec<Update>> = HashMap::new();

        let update_set = std::mem::take(&mut self.update_set);
        for u in update_set {
            self.change_edge(u, true)?;

            let sym = Update::new(u.edge, Dir::Out, u.insert);
            let (dst, _) = self.p.find_agent(u.edge, Dir::Out, true, 0, false);
            if dst == self.serial {
                self.change_edge(sym, true)?;
            } else {
                updates_to_send.entry(dst).or_default().push(sym);
            }
        }

        let mut dests = 0i64;
        for (agent, list) in updates_to_send {
            let mut p =
                Packer::with_capacity(1 + 1 + 8 + list.len() * UPDATE_WIRE_SIZE);
            p.kind(MsgKind::SendUpdates);
            p.u8(FLAG_OUT_EDGES);
            p.u64(self.serial);
            for u in &list {
                p.update(u);
            }
            if self.send_to_agent(agent, p.freeze())? {
                dests += 1;
            }
        }

        self.update_acks_needed += dests;
        if self.update_acks_needed == 0 {
            self.done_waiting_ready_nv_ne()?;
        }
        tracing::debug!(want_acks = self.update_acks_needed, "finalized graph batch");
        Ok(())
    }

    /// Report our vertex/edge deltas: they only depend on IN edges, and no
    /// more of those will arrive this batch.
    fn done_waiting_ready_nv_ne(&mut self) -> ElgaResult<()> {
        if self.cms.is_some() {
            let verts: Vec<Vertex> = self.graph.keys().copied().collect();
            for v in verts {
                let reps = if self.p.count_agent_reps(v) > 0 {
                    self.p
                        .locator()
                        .find(v)
                        .into_iter()
                        .map(|r| unpack_vagent(r).0)
                        .collect()
                } else {
                    HashSet::new()
                };
                if let Some(gv) = self.graph.get_mut(&v) {
                    gv.replicas = reps;
                }
            }
        }

        let update_nv_set = std::mem::take(&mut self.update_nv_set);
        for v in update_nv_set {
            if let Some(gv) = self.graph.get(&v) {
                self.update_nv += if gv.replicas.is_empty() {
                    1.0
                } else {
                    1.0 / gv.replicas.len() as f64
                };
            }
        }

        let mut p = Packer::msg(MsgKind::ReadyNvNe);
        p.f64(self.update_nv).i64(self.update_ne);
        self.d_send_ctrl(p.freeze())?;

        self.update_nv = 0.0;
        self.update_ne = 0;
        Ok(())
    }

    /// Tell the directory this shard has pending updates for the current
    /// batch, at most once per idle period.
    fn start_leaving_idle(&mut self) -> ElgaResult<()> {
        if self.requested_leave_idle {
            return Ok(());
        }
        let mut p = Packer::msg(MsgKind::HaveUpdate);
        p.u32(self.batch);
        self.d_send_ctrl(p.freeze())?;
        self.requested_leave_idle = true;
        Ok(())
    }

    /// Move dormant vertices back to active after a sync.
    fn move_dormant_active(&mut self) {
        match self.discipline {
            Discipline::Bsp | Discipline::Lbsp => {
                self.num_dormant = 0;
                for gv in self.graph.values_mut() {
                    if self.discipline == Discipline::Lbsp
                        && gv.state != VertexState::Dormant
                    {
                        continue;
                    }
                    gv.state = VertexState::Active;
                }
            }
            Discipline::Full => {
                let dormant = std::mem::take(&mut self.dormant);
                for v in dormant {
                    if let Some(gv) = self.graph.get_mut(&v) {
                        gv.state = VertexState::Active;
                        if gv.recv_satisfied() {
                            self.active.insert(v);
                        }
                    }
                }
                self.num_dormant = 0;
            }
        }
    }

    /// Clear all per-batch memory and reset algorithm state.
    fn clear_batch_mem(&mut self) -> ElgaResult<()> {
        self.vn.clear();
        self.vn_wait.clear();
        self.vn_count = 0;
        self.vn_remaining.clear();

        self.dormant.clear();
        self.num_dormant = 0;
        self.it = -1;
        self.agent_msgs_needed.clear();
        self.out_vn_msgs.clear();
        self.out_rep_msgs.clear();

        self.num_inactive = 0;
        tracing::info!("resetting batch state");
        for gv in self.graph.values_mut() {
            self.alg.reset_state(gv);
            gv.replica_storage.clear();
            if gv.state == VertexState::Inactive {
                self.num_inactive += 1;
            }
            if self.discipline == Discipline::Full {
                match gv.state {
                    VertexState::Active => {
                        self.active.insert(gv.vertex);
                    }
                    VertexState::Dormant => {
                        return Err(ElgaError::invariant(
                            "state cannot be dormant outside of a batch",
                        ))
                    }
                    _ => {}
                }
            }
        }

        self.requested_leave_idle = false;
        Ok(())
    }

    /// Drop notification buffers for iterations that no longer have
    /// waiters.
    fn gc(&mut self) {
        for i in 0..self.vn_count.min(self.it.max(0) as usize) {
            if self.vn_remaining[i] == 0 {
                self.vn.clear_slot(i as It);
                self.vn_wait[i].clear();
            }
        }
    }

    fn grow_iteration_slots(&mut self, upto: It) {
        while (upto.max(0) as usize) >= self.vn_count {
            self.vn_wait.push(HashMap::new());
            self.vn_remaining.push(0);
            self.vn.ensure_slot(self.vn_count as It);
            self.vn_count += 1;
        }
    }

    /// Write the algorithm results to `<save_dir>/<serial>.out`.
    fn save(&mut self) -> ElgaResult<()> {
        let dir = self.p.ctx().tunables.save_dir.clone();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.out", self.serial));
        let mut f = std::io::BufWriter::new(std::fs::File::create(path)?);
        for gv in self.graph.values() {
            self.alg.save(&mut f, gv)?;
        }
        f.flush()?;
        Ok(())
    }

    /// Dump this shard of the graph as an edge list and a neighbor list.
    fn dump(&mut self) -> ElgaResult<()> {
        let dir = self.p.ctx().tunables.save_dir.clone();
        std::fs::create_dir_all(&dir)?;

        let el = dir.join(format!("{}.el.dump", self.serial));
        let mut f = std::io::BufWriter::new(std::fs::File::create(el)?);
        for (v, gv) in &self.graph {
            for n in &gv.out_neighbors {
                writeln!(f, "{v} {n}")?;
            }
        }
        f.flush()?;

        let bl = dir.join(format!("{}.bl.dump", self.serial));
        let mut f = std::io::BufWriter::new(std::fs::File::create(bl)?);
        for (v, gv) in &self.graph {
            write!(f, "{v}\t{}", gv.out_neighbors.len())?;
            for n in &gv.out_neighbors {
                write!(f, " {n}")?;
            }
            writeln!(f)?;
        }
        f.flush()?;

        let ovn = dir.join(format!("{}.ovn", self.serial));
        let mut f = std::io::BufWriter::new(std::fs::File::create(ovn)?);
        for (it, slot) in self.vn.slot_maps() {
            write!(f, "{it}")?;
            for (v, n) in slot {
                self.alg.dump_ovn_state(&mut f, *v, n)?;
            }
            writeln!(f)?;
        }
        f.flush()?;
        Ok(())
    }

    /// Push the local sketch to the directory for a balance round.
    fn push_sketch_up(&mut self) -> ElgaResult<()> {
        tracing::info!("sending sketch to directory");
        let mut p = Packer::msg(MsgKind::CsUpdate);
        if self.push_sketch {
            if let Some(cms) = self.cms.as_ref() {
                p.bytes(&cms.serialize());
            }
        }
        self.d_send_ctrl(p.freeze())?;

        if self.push_sketch {
            if let Some(cms) = self.cms.as_mut() {
                cms.clear();
            }
        }
        self.push_sketch = false;
        self.state = AgentState::WaitForLb;
        Ok(())
    }

    /// Rebalance our virtual agent count if this shard is oversized.
    fn balance_va(&mut self) -> ElgaResult<()> {
        let num_agents = self.p.num_agents().max(1) as u64;
        if self.ne > 5 * self.global_ne / num_agents / 4 {
            let mut p = Packer::msg(MsgKind::AgentLeave);
            p.u64(pack_vagent(self.serial, self.vagent_count));
            self.d_send_ctrl(p.freeze())?;

            // Keep enough virtual agents to still own the busiest vertex.
            let mut max_deg = 0usize;
            let mut arg_max = Vertex::MAX;
            for (v, gv) in &self.graph {
                let deg = gv.in_neighbors.len() + gv.out_neighbors.len();
                if deg > max_deg {
                    max_deg = deg;
                    arg_max = *v;
                }
            }
            tracing::info!(max_deg, vertex = arg_max, "rebalancing virtual agents");

            let mut highest_vagent: VagentId = 0;
            if let Some(gv) = self.graph.get(&arg_max) {
                let in_n = gv.in_neighbors.clone();
                let out_n = gv.out_neighbors.clone();
                for n in in_n {
                    let (dest, _) =
                        self.p
                            .find_agent(Edge::new(n, arg_max), Dir::In, true, 0, true);
                    let (_, aid) = unpack_vagent(dest);
                    highest_vagent = highest_vagent.max(aid);
                }
                for n in out_n {
                    let (dest, _) =
                        self.p
                            .find_agent(Edge::new(arg_max, n), Dir::Out, true, 0, true);
                    let (_, aid) = unpack_vagent(dest);
                    highest_vagent = highest_vagent.max(aid);
                }
            }

            self.vagent_count = self.vagent_count.min(highest_vagent + 1);

            let mut p = Packer::msg(MsgKind::AgentJoin);
            p.u64(pack_vagent(self.serial, self.vagent_count));
            self.d_send_ctrl(p.freeze())?;
            tracing::info!(vagents = self.vagent_count, "updated virtual agent count");
        } else {
            tracing::info!("virtual agent count unchanged");
        }
        self.state = AgentState::WaitForLb;
        Ok(())
    }

    /// Send accumulated replica contributions, one frame per destination.
    fn send_replica_msgs(&mut self) -> ElgaResult<()> {
        let out = std::mem::take(&mut self.out_rep_msgs);
        for (agent, reps) in out {
            let mut p = Packer::with_capacity(
                1 + 8 + reps.len() * (4 + 8 + A::Replica::WIRE_SIZE),
            );
            p.kind(MsgKind::Rv);
            p.u64(self.serial);
            for (it, v, rep) in &reps {
                p.i32(*it);
                p.u64(*v);
                rep.pack(&mut p);
            }
            self.send_to_agent(agent, p.freeze())?;
        }
        Ok(())
    }

    /// Flush vertex-notification batches to their destination agents.
    /// Sends the iteration header followed by `(vertex, payload)` pairs.
    fn send_vn_batches(&mut self, header_it: It, broadcast: bool) -> ElgaResult<()> {
        if broadcast {
            // Every other real agent hears from us, empty-bodied or not,
            // so receivers can count expected messages.
            let dests: Vec<u64> = self
                .p
                .locator()
                .real_agents()
                .iter()
                .copied()
                .filter(|&a| a != self.serial)
                .collect();
            for agent in dests {
                let msgs = self.out_vn_msgs.remove(&agent).unwrap_or_default();
                let mut p = Packer::with_capacity(
                    1 + 4 + msgs.len() * (8 + A::Notification::WIRE_SIZE),
                );
                p.kind(MsgKind::OutVn);
                p.i32(header_it);
                for (v, n) in &msgs {
                    p.u64(*v);
                    n.pack(&mut p);
                }
                self.send_to_agent(agent, p.freeze())?;
            }
            self.out_vn_msgs.clear();
        } else {
            // Destinations are sticky for the rest of the batch: a peer
            // that once heard from us keeps receiving a frame (empty if
            // need be) every superstep, so its expected-message counter
            // always drains.
            let dests: Vec<u64> = self.out_vn_msgs.keys().copied().collect();
            for agent in dests {
                let msgs = self
                    .out_vn_msgs
                    .get_mut(&agent)
                    .map(std::mem::take)
                    .unwrap_or_default();
                let mut p = Packer::with_capacity(
                    1 + 4 + msgs.len() * (8 + A::Notification::WIRE_SIZE),
                );
                p.kind(MsgKind::OutVn);
                p.i32(header_it);
                for (v, n) in &msgs {
                    p.u64(*v);
                    n.pack(&mut p);
                }
                self.send_to_agent(agent, p.freeze())?;
            }
        }
        Ok(())
    }

    /// Run one vertex for the current superstep and route its outputs.
    /// Locally-applied notifications are deferred into `applies` so the
    /// shard is not mutated mid-scan.
    fn run_one(
        &mut self,
        v: Vertex,
        applies: &mut Vec<(Vertex, A::Notification)>,
    ) -> ElgaResult<RunOne> {
        let Some(gv) = self.graph.get_mut(&v) else {
            return Ok(RunOne {
                state: VertexState::Inactive,
                notified: false,
            });
        };
        tracing::trace!(v, "processing vertex");

        gv.state = VertexState::Active;
        let mut out = elga_api::RunOutput::new();
        self.alg.run(gv, self.global_nv, &mut self.vn, &mut out)?;

        let slot = gv.iteration;
        let mut notified = false;

        if out.notify_out || out.notify_in {
            notified = true;
            let mut notify_agents: HashSet<u64> = HashSet::new();

            if out.notify_out {
                for &n in &gv.out_neighbors {
                    let (dst, _) = self.p.find_agent(Edge::new(v, n), Dir::In, true, 0, false);
                    if dst == self.serial {
                        match self.discipline {
                            Discipline::Bsp => {
                                self.vn.insert(slot, v, out.notification.clone())
                            }
                            _ => applies.push((n, out.notification.clone())),
                        }
                        continue;
                    }
                    notify_agents.insert(dst);
                }
            }
            if self.discipline != Discipline::Bsp {
                self.vn.insert(slot, v, out.notification.clone());
            }
            if out.notify_in {
                for &n in &gv.in_neighbors {
                    let (dst, _) = self.p.find_agent(Edge::new(n, v), Dir::Out, true, 0, false);
                    if dst == self.serial {
                        match self.discipline {
                            Discipline::Bsp => {
                                self.vn.insert(slot, v, out.notification.clone())
                            }
                            _ => applies.push((n, out.notification.clone())),
                        }
                        continue;
                    }
                    notify_agents.insert(dst);
                }
            }
            for dst in notify_agents {
                self.out_vn_msgs
                    .entry(dst)
                    .or_default()
                    .push((v, out.notification.clone()));
            }
        }

        if out.notify_replica && self.cms.is_some() {
            let rep_it = gv.iteration;
            if let Some(rs) = gv
                .replica_storage
                .get(&rep_it)
                .and_then(|m| m.get(&gv.self_agent))
                .cloned()
            {
                for &rep_agent in &gv.replicas {
                    if rep_agent == self.serial {
                        continue;
                    }
                    self.out_rep_msgs
                        .entry(rep_agent)
                        .or_default()
                        .push((rep_it, v, rs.clone()));
                }
            }
        }

        Ok(RunOne {
            state: gv.state,
            notified,
        })
    }

    /// Replica pre-pass: vertices with replicas cannot advance until every
    /// contribution for their iteration has arrived. Returns false when
    /// the superstep must wait.
    fn replica_prepass(
        &mut self,
        vote_stop: &mut bool,
        applies: &mut Vec<(Vertex, A::Notification)>,
    ) -> ElgaResult<bool> {
        let mut cont = true;
        let verts: Vec<Vertex> = self.graph.keys().copied().collect();
        for v in verts {
            let Some(gv) = self.graph.get(&v) else {
                continue;
            };
            let v_it = gv.iteration;
            let reps = gv.replicas.len();
            if reps == 0 {
                continue;
            }
            let got = gv.replica_storage.get(&v_it).map_or(0, |m| m.len());
            let has_self = gv
                .replica_storage
                .get(&v_it)
                .is_some_and(|m| m.contains_key(&gv.self_agent));
            let state = gv.state;

            if got == reps {
                if state == VertexState::RepWait {
                    // This was waiting, but now has enough to continue.
                    self.graph.get_mut(&v).expect("present").state = VertexState::Active;
                }
                continue;
            }
            if has_self {
                // We contributed but not everyone has; keep waiting.
                cont = false;
                continue;
            }
            if state == VertexState::RepWait {
                cont = false;
                continue;
            }

            let r = self.run_one(v, applies)?;
            if r.state != VertexState::Inactive {
                *vote_stop = false;
            }

            let Some(gv) = self.graph.get_mut(&v) else {
                continue;
            };
            if gv.state != VertexState::RepWait {
                continue;
            }
            if gv.replica_storage.get(&v_it).map_or(0, |m| m.len()) == reps {
                gv.state = VertexState::Active;
                continue;
            }
            cont = false;
        }
        self.send_replica_msgs()?;
        Ok(cont)
    }

    /// Dispatch to the configured superstep discipline.
    fn process_vertices(&mut self) -> ElgaResult<()> {
        match self.discipline {
            Discipline::Bsp => self.process_vertices_bsp(),
            Discipline::Lbsp => self.process_vertices_lbsp(),
            Discipline::Full => self.process_vertices_full(),
        }
    }

    /// Handle an inbound vertex-notification frame.
    fn process_vn(&mut self, body: &[u8]) -> ElgaResult<()> {
        // Ignore any trailing end-of-batch messages.
        if self.state == AgentState::Idle {
            return Ok(());
        }

        match self.discipline {
            Discipline::Bsp | Discipline::Lbsp => {
                let mut u = Unpacker::new(body);
                let it = u.i32()?;
                self.grow_iteration_slots(it);

                while !u.is_empty() {
                    let v = u.u64()?;
                    let n = A::Notification::unpack(&mut u)?;
                    if self.discipline == Discipline::Lbsp {
                        if let Some(locals) = self.tmap.get(&v) {
                            for &l in locals {
                                if let Some(gv) = self.graph.get_mut(&l) {
                                    self.alg.set_active(gv, &n);
                                }
                            }
                        }
                        self.vn.insert(0, v, n);
                    } else {
                        self.vn.insert(it, v, n);
                    }
                }

                *self.agent_msgs_needed.entry(it).or_default() -= 1;
                if self.state == AgentState::Process
                    && self.it >= 0
                    && *self.agent_msgs_needed.entry(self.it + 1).or_default() == 0
                {
                    self.state = AgentState::JoinBarrier;
                }
            }
            Discipline::Full => {
                let mut u = Unpacker::new(body);
                while !u.is_empty() {
                    let it = u.i32()?;
                    let v = u.u64()?;
                    let n = A::Notification::unpack(&mut u)?;
                    self.grow_iteration_slots(it);
                    match A::INBOX {
                        InboxKind::PerIteration => {
                            self.vn.insert(it, v, n);
                            self.release_waiters(it, v);
                        }
                        InboxKind::PerVertex => {
                            if let Some(locals) = self.tmap.get(&v) {
                                for &l in locals.clone().iter() {
                                    if let Some(gv) = self.graph.get_mut(&l) {
                                        let was = gv.state;
                                        self.alg.set_active(gv, &n);
                                        if was != VertexState::Active
                                            && gv.state == VertexState::Active
                                            && gv.recv_satisfied()
                                        {
                                            self.active.insert(l);
                                        }
                                    }
                                }
                            }
                            self.vn.insert(it, v, n);
                        }
                    }
                }
            }
        }

        // Drive any processing this unblocked.
        self.pre_poll()
    }

    /// Release fully-asynchronous waiters blocked on `(it, v)`.
    fn release_waiters(&mut self, it: It, v: Vertex) {
        let slot = it.max(0) as usize;
        if slot >= self.vn_wait.len() {
            return;
        }
        let Some(waiters) = self.vn_wait[slot].get_mut(&v) else {
            return;
        };
        let mut exists_valid = false;
        for (waiter, valid) in waiters.iter_mut() {
            if !*valid {
                continue;
            }
            exists_valid = true;
            *valid = false;
            if self.vn_remaining[slot] > 0 {
                self.vn_remaining[slot] -= 1;
            }
            if let Some(gv) = self.graph.get_mut(waiter) {
                if gv.vertex_recv_needed > 0 {
                    gv.vertex_recv_needed -= 1;
                }
                if gv.recv_satisfied() && gv.state == VertexState::Active {
                    self.active.insert(*waiter);
                }
            }
        }
        if !exists_valid {
            self.vn_wait[slot].remove(&v);
        }
    }

    /// Handle one `SEND_UPDATES` frame.
    fn handle_send_updates(&mut self, body: &[u8]) -> ElgaResult<()> {
        let mut u = Unpacker::new(body);
        let flag = u.u8()?;
        let from = u.u64()?;
        let updates = u.update_rest()?;

        if flag == FLAG_CHECK {
            // Transpose check: verify, change nothing, no ack.
            for upd in &updates {
                self.check_out_edge(upd)?;
            }
            return Ok(());
        }

        for upd in updates {
            self.change_edge(upd, flag == FLAG_OUT_EDGES)?;
        }

        // Offload anything that no longer belongs here.
        self.send_move_edges()?;

        let frame = Packer::msg(MsgKind::AckUpdates).freeze();
        self.send_to_agent(from, frame)?;
        Ok(())
    }

    /// Handle one `RV` (replica values) frame.
    fn handle_rv(&mut self, body: &[u8]) -> ElgaResult<()> {
        let mut u = Unpacker::new(body);
        let src_agent = u.u64()?;
        while !u.is_empty() {
            let it = u.i32()?;
            let v = u.u64()?;
            let rep = A::Replica::unpack(&mut u)?;

            if !self.graph.contains_key(&v) {
                tracing::trace!(v, "creating replica-only vertex");
                let mut gv = VertexStorage::new(v, self.serial);
                let reps: HashSet<u64> = self
                    .p
                    .locator()
                    .find(v)
                    .into_iter()
                    .map(|r| unpack_vagent(r).0)
                    .collect();
                gv.replicas = reps;
                self.graph.insert(v, gv);
            }
            let gv = self.graph.get_mut(&v).expect("just inserted");
            gv.replica_storage
                .entry(it)
                .or_default()
                .insert(src_agent, rep.clone());
            if self.discipline == Discipline::Lbsp {
                self.alg.set_rep_active(gv, &rep)?;
            }
        }
        Ok(())
    }

    fn handle_nv(&mut self, body: &[u8]) -> ElgaResult<()> {
        let mut u = Unpacker::new(body);
        self.global_nv = u.u64()?;
        self.global_ne = u.u64()?;
        tracing::debug!(nv = self.global_nv, ne = self.global_ne, "got NV");

        // Set up the iteration state for the batch.
        self.vn_wait.push(HashMap::new());
        self.vn_wait.push(HashMap::new());
        self.vn.ensure_slot(1);
        self.vn_count = 2;
        self.vn_remaining.push(0);
        self.vn_remaining.push(0);

        if self.state == AgentState::NoProcess {
            self.state = AgentState::JoinBarrier;
            return self.pre_poll();
        }
        self.state = AgentState::Process;
        Ok(())
    }

    fn handle_sync(&mut self, body: &[u8]) -> ElgaResult<()> {
        if self.state != AgentState::WaitForSync {
            return Err(ElgaError::protocol(format!(
                "sync in state {:?}",
                self.state
            )));
        }
        let global_dormant = Unpacker::new(body).u64()?;
        tracing::debug!(global_dormant, "sync");

        if global_dormant == 0 {
            // The batch is over.
            self.clear_batch_mem()?;
            self.state = AgentState::Idle;
            self.batch += 1;
            tracing::info!(batch = self.batch, "batch complete");

            if !self.update_set.is_empty() {
                self.start_leaving_idle()?;
            }
        } else {
            self.gc();
            self.state = AgentState::Process;
            self.move_dormant_active();
            self.pre_poll()?;
        }
        Ok(())
    }

    fn handle_query(&mut self, body: &[u8], replier: Option<&Replier>) -> ElgaResult<()> {
        let v = Unpacker::new(body).u64()?;
        let replier =
            replier.ok_or_else(|| ElgaError::protocol("query outside the reply socket"))?;
        let mut p = Packer::with_capacity(self.alg.query_resp_size());
        self.alg.query(&mut p, self.graph.get(&v));
        replier.reply(p.freeze())
    }
}

impl<A: Algorithm> Role for Agent<A> {
    fn participant(&mut self) -> &mut Participant {
        &mut self.p
    }

    fn pre_poll(&mut self) -> ElgaResult<()> {
        match self.state {
            AgentState::Process => self.process_vertices(),
            AgentState::JoinBarrier => {
                // Signal the barrier and wait for everyone else.
                let mut p = Packer::msg(MsgKind::ReadySync);
                p.u64(self.num_dormant);
                self.d_send_ctrl(p.freeze())?;
                self.state = AgentState::WaitForSync;
                tracing::debug!("waiting for sync");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn heartbeat(&mut self) -> ElgaResult<()> {
        if !self.p.chat().heartbeat(true) {
            return Ok(());
        }
        tracing::info!(
            working = self.p.working(),
            state = ?self.state,
            batch = self.batch,
            nv = self.nv,
            ne = self.ne,
            global_nv = self.global_nv,
            global_ne = self.global_ne,
            pending = self.update_set.len(),
            inactive = self.num_inactive,
            dormant = self.num_dormant,
            it = self.it,
            want_acks = self.update_acks_needed,
            "heartbeat"
        );
        Ok(())
    }

    fn on_shutdown(&mut self) -> ElgaResult<bool> {
        if self.state == AgentState::NoProcess {
            self.state = AgentState::Idle;
        }
        tracing::info!("leaving");

        if self.ne == 0 && self.update_acks_needed == 0 {
            tracing::info!("shutdown");
            return Ok(false);
        }

        // Keep draining until our edges have moved and all acks returned.
        let mut p = Packer::msg(MsgKind::AgentLeave);
        p.u64(pack_vagent(self.serial, self.vagent_count));
        if let Err(e) = self.p.d_send(p.freeze()) {
            // The directory beat us out the door; nobody is left to move
            // edges to anyway.
            tracing::warn!(%e, "could not announce leave");
            return Ok(false);
        }
        Ok(true)
    }

    fn handle_directory_update(&mut self) -> ElgaResult<()> {
        match self.state {
            AgentState::WaitForLbSync => {
                tracing::info!("directory update deferred during sync");
                return Ok(());
            }
            AgentState::WaitForLb => {
                // Hold off on applying; signal that we received it.
                tracing::info!("directory update received while balancing");
                self.state = AgentState::WaitForLbSync;
                self.d_send_ctrl(Packer::msg(MsgKind::SimpleSync).freeze())?;
                return Ok(());
            }
            _ => {}
        }

        // The membership changed: scan for edges we no longer own and
        // move them.
        let mut lost_edges = 0u64;
        let mut lost_out_edges = 0u64;
        let mut to_remove = Vec::new();

        let verts: Vec<Vertex> = self.graph.keys().copied().collect();
        for v in verts {
            let Some(mut gv) = self.graph.remove(&v) else {
                continue;
            };

            let mut i = 0;
            while i < gv.out_neighbors.len() {
                let n = gv.out_neighbors[i];
                let e = Edge::new(v, n);
                let (owner, _) = self.p.find_agent(e, Dir::Out, true, 0, false);
                if owner != self.serial {
                    self.moves
                        .entry(owner)
                        .or_default()
                        .push(Update::new(e, Dir::Out, true));
                    gv.out_neighbors.swap_remove(i);
                    lost_out_edges += 1;
                } else {
                    i += 1;
                }
            }

            let mut i = 0;
            while i < gv.in_neighbors.len() {
                let n = gv.in_neighbors[i];
                let e = Edge::new(n, v);
                let (owner, _) = self.p.find_agent(e, Dir::In, true, 0, false);
                if owner != self.serial {
                    self.moves
                        .entry(owner)
                        .or_default()
                        .push(Update::new(e, Dir::In, true));
                    gv.in_neighbors.swap_remove(i);
                    lost_edges += 1;
                } else {
                    i += 1;
                }
            }

            if gv.out_neighbors.is_empty() && gv.in_neighbors.is_empty() {
                let reps = gv.replicas.len();
                self.update_nv -= if reps > 0 { 1.0 / reps as f64 } else { 1.0 };
                to_remove.push(v);
            } else {
                self.graph.insert(v, gv);
            }
        }

        self.ne = self.ne.saturating_sub(lost_edges);
        self.nv = self.nv.saturating_sub(to_remove.len() as u64);
        // The new owners will count the moved edges back in; our negative
        // deltas keep the directory totals from drifting.
        self.update_ne -= lost_edges as i64;
        tracing::info!(lost_out_edges, lost_edges, "edges re-homed by directory change");

        self.send_move_edges()?;

        if self.update_acks_needed != 0 {
            self.state = AgentState::WaitEdgeMove;
        }
        Ok(())
    }

    fn handle_msg(
        &mut self,
        kind: MsgKind,
        body: &[u8],
        replier: Option<&Replier>,
    ) -> ElgaResult<bool> {
        match kind {
            MsgKind::Query => self.handle_query(body, replier)?,
            MsgKind::OutVn => self.process_vn(body)?,
            MsgKind::SendUpdates => self.handle_send_updates(body)?,
            MsgKind::DoChkT => {
                tracing::debug!("starting transpose check");
                self.send_out_edges(true)?;
            }
            MsgKind::DoVa => self.balance_va()?,
            MsgKind::AckUpdates => {
                self.update_acks_needed -= 1;
                tracing::debug!(want_acks = self.update_acks_needed, "got ack");
                if self.update_acks_needed == 0 {
                    if self.state == AgentState::WaitEdgeMove {
                        tracing::info!("edge movement complete");
                        self.state = AgentState::Idle;
                    } else {
                        self.done_waiting_ready_nv_ne()?;
                    }
                }
            }
            MsgKind::UpdateEdges => {
                for u in Unpacker::new(body).update_rest()? {
                    if self.state == AgentState::NoProcess {
                        self.change_edge(u, true)?;
                    } else {
                        self.update_set.insert(u);
                    }
                }
            }
            MsgKind::UpdateEdge => {
                let u = Unpacker::new(body).update()?;
                if self.state == AgentState::NoProcess {
                    // Before processing starts, changes apply immediately.
                    self.change_edge(u, true)?;
                } else {
                    // Otherwise they queue for the next batch; if idle we
                    // also have to announce there is work to do.
                    self.update_set.insert(u);
                    if self.state == AgentState::Idle {
                        self.start_leaving_idle()?;
                    }
                }
            }
            MsgKind::HaveUpdate => {
                let have_batch = Unpacker::new(body).u32()?;
                if have_batch < self.batch {
                    // Stale; a batch already completed since this was sent.
                } else if have_batch > self.batch {
                    return Err(ElgaError::protocol("have-update for a future batch"));
                } else if self.state == AgentState::Idle {
                    self.state = AgentState::FinalizeGraphBatch;
                    self.finalize_graph_batch()?;
                }
            }
            MsgKind::DoUpdate => {
                if self.state != AgentState::NoProcess {
                    return Err(ElgaError::protocol("update only valid before processing"));
                }
                self.send_out_edges(false)?;
            }
            MsgKind::DoCsLb => self.push_sketch_up()?,
            MsgKind::DoStart => {
                if body.len() >= 8 {
                    let start = Unpacker::new(body).u64()?;
                    self.alg.set_start(start);
                    tracing::info!(start, "start vertex set");
                }
                match self.state {
                    AgentState::NoProcess => {
                        tracing::debug!("received start");
                        self.state = AgentState::LeavingNoProcess;
                        // All IN edges need their corresponding OUT edges
                        // before computation can begin.
                        self.send_out_edges(false)?;
                    }
                    AgentState::Idle => {
                        // Run again without changes.
                        self.start_leaving_idle()?;
                    }
                    s => {
                        return Err(ElgaError::protocol(format!("start in state {s:?}")));
                    }
                }
            }
            MsgKind::DoSave => {
                tracing::debug!("saving algorithm results");
                self.save()?;
            }
            MsgKind::DoDump => {
                tracing::debug!("dumping graph to disk");
                self.dump()?;
            }
            MsgKind::DoReset => {
                self.clear_batch_mem()?;
                for gv in self.graph.values_mut() {
                    self.alg.reset_output(gv);
                }
            }
            MsgKind::Rv => self.handle_rv(body)?,
            MsgKind::Nv => self.handle_nv(body)?,
            MsgKind::SimpleSyncDone => {
                if self.state != AgentState::WaitForLbSync {
                    return Err(ElgaError::protocol("simple sync from unknown state"));
                }
                // Now apply the directory update we deferred.
                self.state = AgentState::Idle;
                self.handle_directory_update()?;
            }
            MsgKind::Sync => self.handle_sync(body)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Run an agent with the algorithm the process is configured for.
pub fn run_configured(ctx: &ProcessCtx, addr: Address, dm: Address) -> ElgaResult<()> {
    use crate::algorithms::{Bfs, KCore, Lpa, PageRank, Wcc};
    use elga_api::AlgorithmKind;

    fn go<A: Algorithm>(ctx: &ProcessCtx, addr: Address, dm: Address) -> ElgaResult<()> {
        let mut agent = Agent::<A>::new(ctx, addr, dm)?;
        agent.register_dir()?;
        agent.run()
    }

    match ctx.tunables.algorithm {
        AlgorithmKind::Pagerank => go::<PageRank>(ctx, addr, dm),
        AlgorithmKind::Wcc => go::<Wcc>(ctx, addr, dm),
        AlgorithmKind::Bfs => go::<Bfs>(ctx, addr, dm),
        AlgorithmKind::Kcore => go::<KCore>(ctx, addr, dm),
        AlgorithmKind::Lpa => go::<Lpa>(ctx, addr, dm),
    }
}

#[cfg(test)]
mod test;
