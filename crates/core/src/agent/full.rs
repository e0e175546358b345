//! Fully-asynchronous superstep processing.
//!
//! No iteration counter discipline: the active set evolves as messages
//! arrive. A vertex whose inputs for its iteration are incomplete parks in
//! the wait buffers and is released as the values land; everything else
//! runs in waves until the active set is empty.

use super::{Agent, AgentState};
use crate::participant::Role;
use elga_api::{Algorithm, ElgaResult, InboxKind, It, Vertex, VertexState};

impl<A: Algorithm> Agent<A> {
    pub(super) fn process_vertices_full(&mut self) -> ElgaResult<()> {
        let mut full_active: Vec<(Vertex, It)> = Vec::new();

        while !self.active.is_empty() {
            let wave: Vec<Vertex> = self.active.drain().collect();
            let mut applies = Vec::new();
            let mut max_it: It = 0;

            for v in wave {
                let Some(gv) = self.graph.get_mut(&v) else {
                    continue;
                };
                match gv.state {
                    VertexState::Dormant => {
                        self.dormant.remove(&v);
                        self.num_dormant = self.num_dormant.saturating_sub(1);
                        gv.state = VertexState::Active;
                    }
                    VertexState::Inactive => {
                        self.num_inactive = self.num_inactive.saturating_sub(1);
                        gv.state = VertexState::Active;
                    }
                    _ => {}
                }

                // Iteration-keyed algorithms cannot run until every
                // in-neighbor's value for this iteration is present; park
                // the vertex in the wait buffers instead.
                if A::INBOX == InboxKind::PerIteration && !self.gather_ready(v)? {
                    continue;
                }

                let r = self.run_one(v, &mut applies)?;
                let gv = self.graph.get_mut(&v).expect("still present");
                let it = gv.iteration;
                max_it = max_it.max(it);
                tracing::trace!(v, it, state = ?gv.state, "ran vertex");

                // This vertex/iteration pair is complete.
                full_active.push((v, it));

                match r.state {
                    VertexState::Inactive => {
                        self.num_inactive += 1;
                    }
                    VertexState::Dormant => {
                        self.dormant.insert(v);
                        self.num_dormant += 1;
                    }
                    _ => {
                        if gv.recv_satisfied() {
                            self.active.insert(v);
                        }
                    }
                }
            }

            self.grow_iteration_slots(max_it + 1);

            // Locally-applied notifications may reactivate neighbors.
            for (n, vn) in applies {
                if let Some(gv) = self.graph.get_mut(&n) {
                    let was = gv.state;
                    self.alg.set_active(gv, &vn);
                    if was != VertexState::Active
                        && gv.state == VertexState::Active
                        && gv.recv_satisfied()
                    {
                        if was == VertexState::Dormant {
                            self.dormant.remove(&n);
                            self.num_dormant = self.num_dormant.saturating_sub(1);
                        } else {
                            self.num_inactive = self.num_inactive.saturating_sub(1);
                        }
                        self.active.insert(n);
                    }
                }
            }

            // Anything waiting on a value we just produced gets released.
            for (v, it) in full_active.drain(..) {
                self.release_waiters(it, v);
            }

            // Ship this wave's notifications.
            self.send_full_vn_batches()?;
        }

        // Everyone is inactive or dormant: time to join the barrier.
        if self.num_inactive + self.num_dormant == self.nv {
            self.state = AgentState::JoinBarrier;
            self.pre_poll()?;
        }
        Ok(())
    }

    /// Check whether an iteration-keyed vertex has all of its inputs;
    /// register waits for the missing ones.
    fn gather_ready(&mut self, v: Vertex) -> ElgaResult<bool> {
        let Some(gv) = self.graph.get(&v) else {
            return Ok(false);
        };
        let cur_it = gv.iteration;
        if cur_it == 0 {
            return Ok(true);
        }

        let missing: Vec<Vertex> = gv
            .in_neighbors
            .iter()
            .copied()
            .filter(|&n| self.vn.get(cur_it, n).is_none())
            .collect();
        if missing.is_empty() {
            return Ok(true);
        }

        self.grow_iteration_slots(cur_it);
        let slot = cur_it.max(0) as usize;
        let count = missing.len() as u64;
        for n in missing {
            self.vn_wait[slot].entry(n).or_default().push((v, true));
            self.vn_remaining[slot] += 1;
        }
        self.graph.get_mut(&v).expect("present").vertex_recv_needed += count;
        Ok(false)
    }

    /// Send accumulated notifications with per-entry iteration tags, the
    /// fully-asynchronous wire form.
    fn send_full_vn_batches(&mut self) -> ElgaResult<()> {
        use elga_api::pack::WireFixed;
        use elga_api::{MsgKind, Packer};

        let out = std::mem::take(&mut self.out_vn_msgs);
        for (agent, msgs) in out {
            let mut p = Packer::with_capacity(
                1 + msgs.len() * (4 + 8 + A::Notification::WIRE_SIZE),
            );
            p.kind(MsgKind::OutVn);
            for (v, n) in &msgs {
                let it = self.graph.get(v).map_or(0, |gv| gv.iteration);
                p.i32(it);
                p.u64(*v);
                n.pack(&mut p);
            }
            self.send_to_agent(agent, p.freeze())?;
        }
        Ok(())
    }
}
