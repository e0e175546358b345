//! Locally-applied bulk-synchronous superstep processing.
//!
//! Like BSP, but notifications to neighbors hosted on this agent are
//! applied directly instead of sent. Every other real agent receives one
//! message per superstep, empty-bodied if there is nothing to say, so
//! receivers always know how many messages to expect.

use super::{Agent, AgentState, RunOne};
use crate::participant::Role;
use elga_api::{Algorithm, ElgaResult, Vertex};

impl<A: Algorithm> Agent<A> {
    pub(super) fn process_vertices_lbsp(&mut self) -> ElgaResult<()> {
        let waiting = *self.agent_msgs_needed.entry(self.it + 1).or_default();
        if waiting > 0 {
            tracing::debug!(it = self.it + 1, waiting, "superstep waiting on peers");
            return Ok(());
        }

        let mut vote_stop = true;
        let mut applies = Vec::new();

        if self.cms.is_some() && !self.alg.skip_rep_wait() {
            if !self.replica_prepass(&mut vote_stop, &mut applies)? {
                self.apply_local(applies);
                tracing::debug!("replica contributions outstanding");
                return Ok(());
            }
        }

        self.it += 1;
        let it = self.it;
        tracing::debug!(it, "process");

        let verts: Vec<Vertex> = self.graph.keys().copied().collect();
        for v in verts {
            let RunOne { notified, .. } = self.run_one(v, &mut applies)?;
            if notified {
                vote_stop = false;
            }
        }
        self.apply_local(applies);

        self.send_replica_msgs()?;
        self.send_vn_batches(it + 1, true)?;

        let num_agents = self.p.num_agents();
        *self.agent_msgs_needed.entry(it + 1).or_default() +=
            num_agents.saturating_sub(1) as i64;

        self.grow_iteration_slots(it + 1);

        if vote_stop {
            self.num_dormant = 0;
            self.num_inactive = self.graph.len() as u64;
            tracing::info!("vote stop");
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

    /// Apply deferred same-agent notifications.
    pub(super) fn apply_local(&mut self, applies: Vec<(Vertex, A::Notification)>) {
        for (n, vn) in applies {
            if let Some(gv) = self.graph.get_mut(&n) {
                self.alg.set_active(gv, &vn);
            }
        }
    }
}
