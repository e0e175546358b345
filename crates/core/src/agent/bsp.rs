//! Bulk-synchronous superstep processing.
//!
//! Every vertex runs every iteration. Outgoing notifications are batched
//! per destination agent and sent once per superstep; each agent counts
//! how many peers will send to it next iteration and joins the barrier
//! once all of them have.

use super::{Agent, AgentState, RunOne};
use crate::participant::Role;
use elga_api::{Algorithm, Dir, Edge, ElgaResult, Vertex, VertexState};
use std::collections::HashSet;

impl<A: Algorithm> Agent<A> {
    pub(super) fn process_vertices_bsp(&mut self) -> ElgaResult<()> {
        // Only process once every expected message has arrived.
        let waiting = *self.agent_msgs_needed.entry(self.it + 1).or_default();
        if waiting > 0 {
            tracing::debug!(it = self.it + 1, waiting, "superstep waiting on peers");
            return Ok(());
        }

        let mut vote_stop = true;
        let mut applies = Vec::new();

        if self.cms.is_some() && !self.alg.skip_rep_wait() {
            if !self.replica_prepass(&mut vote_stop, &mut applies)? {
                tracing::debug!("replica contributions outstanding");
                return Ok(());
            }
        }

        self.it += 1;
        let it = self.it;
        tracing::debug!(it, "process");

        let verts: Vec<Vertex> = self.graph.keys().copied().collect();
        for v in verts {
            let RunOne { state, .. } = self.run_one(v, &mut applies)?;
            if state != VertexState::Inactive {
                vote_stop = false;
            }
        }

        self.send_vn_batches(it + 1, false)?;
        self.send_replica_msgs()?;

        // Count the agents we expect messages from next iteration: the
        // owners of the OUT side of our in-edges.
        let mut agents_used: HashSet<u64> = HashSet::new();
        let verts: Vec<(Vertex, Vec<Vertex>)> = self
            .graph
            .iter()
            .map(|(v, gv)| (*v, gv.in_neighbors.clone()))
            .collect();
        for (dst, in_neighbors) in verts {
            for src in in_neighbors {
                let (agent, _) = self.p.find_agent(Edge::new(src, dst), Dir::Out, true, 0, false);
                if agent != self.serial {
                    agents_used.insert(agent);
                }
            }
        }
        *self.agent_msgs_needed.entry(it + 1).or_default() += agents_used.len() as i64;
        tracing::debug!(need = agents_used.len(), "expecting peer messages");

        self.grow_iteration_slots(it + 1);

        if vote_stop {
            self.num_dormant = 0;
            self.num_inactive = self.graph.len() as u64;
        } else {
            self.num_dormant = self.graph.len() as u64;
            self.num_inactive = 0;
        }

        if *self.agent_msgs_needed.entry(self.it + 1).or_default() == 0 {
            tracing::debug!("join barrier");
            self.state = AgentState::JoinBarrier;
        }

        self.pre_poll()
    }
}
