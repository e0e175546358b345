//! The client: a one-shot issuer of cluster directives and queries.

use crate::chatterbox::{Replier, Requester};
use crate::ctx::ProcessCtx;
use crate::participant::{self, Participant, Role};
use bytes::Bytes;
use elga_api::{
    Address, Dir, Edge, ElgaResult, MsgKind, Packer, SocketKind, Unpacker, Vertex,
};
use rand::Rng;
use std::time::{Duration, Instant};

/// The ElGA client. Not intended to be long-living.
pub struct Client {
    p: Participant,
    dm_req: Requester,
}

impl Client {
    /// Create a client pointed at the given directory master.
    pub fn new(ctx: &ProcessCtx, dm: Address) -> ElgaResult<Self> {
        let addr = Address::default();
        let p = Participant::new(ctx, addr, dm, true)?;
        let dm_req = Requester::connect(ctx, &addr, dm, SocketKind::Request)?;
        Ok(Self { p, dm_req })
    }

    /// Query and return all directory servers.
    pub fn query_directories(&mut self) -> ElgaResult<Vec<Address>> {
        self.dm_req.send_kind(MsgKind::GetDirectories)?;
        let data = self.dm_req.read()?;
        Ok(Unpacker::new(&data)
            .u64_rest()?
            .into_iter()
            .map(Address::from_serial)
            .collect())
    }

    /// Send a single directive to the directory master and await its ack.
    pub fn query(&mut self, kind: MsgKind) -> ElgaResult<()> {
        self.dm_req.send_kind(kind)?;
        self.dm_req.wait_ack()
    }

    /// Start the computation from a specific vertex.
    pub fn start_vtx(&mut self, start: Vertex) -> ElgaResult<()> {
        let mut p = Packer::msg(MsgKind::Start);
        p.u64(start);
        self.dm_req.send(p.freeze())?;
        self.dm_req.wait_ack()
    }

    fn wait_until_ready(&mut self) -> ElgaResult<bool> {
        while !self.p.ready() {
            if self.p.ctx().shutdown_requested() {
                tracing::info!("shutting down");
                return Ok(false);
            }
            if !participant::poll_step(self, false)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Query a vertex and return the algorithm-defined response bytes.
    pub fn query_vertex(&mut self, v: Vertex) -> ElgaResult<Bytes> {
        if !self.wait_until_ready()? {
            return Ok(Bytes::new());
        }

        // Any holder of the vertex can answer.
        let e = Edge::new(v, Vertex::MAX);
        let (agent, _) = self.p.find_agent(e, Dir::Out, false, 0, false);

        let ctx = self.p.ctx();
        let me = self.p.addr();
        let mut req =
            Requester::connect(&ctx, &me, Address::from_serial(agent), SocketKind::Request)?;
        let mut p = Packer::msg(MsgKind::Query);
        p.u64(v);
        req.send(p.freeze())?;
        req.read()
    }

    /// Repeat random-vertex queries following the paced rate schedule.
    pub fn workload(&mut self) -> ElgaResult<()> {
        if !self.wait_until_ready()? {
            return Ok(());
        }

        let max_v: Vertex = 500_000;
        let mut rng = rand::thread_rng();
        let mut count = 0usize;

        for block in 0..=10u32 {
            tracing::info!(block, "workload block");
            let block_start = Instant::now();
            while block_start.elapsed() < Duration::from_secs(300) {
                let window = Instant::now();
                let mut inner = 0usize;
                while !self.p.ctx().shutdown_requested()
                    && window.elapsed() < Duration::from_secs(2)
                {
                    let v = rng.gen_range(0..=max_v);
                    self.query_vertex(v)?;
                    count += 1;
                    inner += 1;
                    let pace_us = if block == 5 {
                        6000
                    } else {
                        (5i64 - block as i64).unsigned_abs() * 10_000
                    };
                    std::thread::sleep(Duration::from_micros(pace_us));
                }
                tracing::info!(
                    block,
                    count,
                    rate = inner as f64 / window.elapsed().as_secs_f64(),
                    "workload window"
                );
                while participant::poll_step(self, true)? {}
                if self.p.ctx().shutdown_requested() {
                    return Ok(());
                }
            }
            if self.p.ctx().shutdown_requested() {
                return Ok(());
            }
        }
        Ok(())
    }
}

impl Role for Client {
    fn participant(&mut self) -> &mut Participant {
        &mut self.p
    }

    fn handle_msg(
        &mut self,
        _kind: MsgKind,
        _body: &[u8],
        _replier: Option<&Replier>,
    ) -> ElgaResult<bool> {
        Ok(false)
    }

    fn handle_directory_update(&mut self) -> ElgaResult<()> {
        tracing::info!("directory update");
        Ok(())
    }
}
