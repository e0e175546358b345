//! The directory: replicated membership authority.
//!
//! Directories aggregate agent joins and leaves, frequency-sketch
//! contributions, the per-batch/per-iteration barrier counters, and the
//! global vertex/edge totals, and broadcast directory-update snapshots on
//! the heartbeat. Peer directories subscribe to each other's internal
//! rebroadcasts so each one independently reaches the same counts.

use crate::chatterbox::{Chatterbox, Incoming, Requester};
use crate::ctx::ProcessCtx;
use crate::sketch::CountMinSketch;
use bytes::Bytes;
use elga_api::{
    Address, Batch, ElgaError, ElgaResult, It, MsgKind, Packer, SocketKind, Unpacker,
};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// One directory server.
pub struct Directory {
    chat: Chatterbox,
    dm: Address,

    agents: HashSet<u64>,
    directories: HashSet<u64>,

    notify: bool,
    notify_changed: bool,

    global_nv: f64,
    global_ne: i64,

    cms: Option<CountMinSketch>,
    cms_recv: usize,

    simple_sync: usize,

    sync_ctr: HashMap<Batch, HashMap<It, usize>>,
    num_dormant: HashMap<Batch, HashMap<It, u64>>,
    ready_ctr: usize,

    it: It,
    batch: Batch,
    agents_idle: bool,
}

impl Directory {
    /// Bind a directory at `addr`, pointed at the directory master.
    pub fn new(ctx: &ProcessCtx, addr: Address, dm: Address) -> ElgaResult<Self> {
        let cms = ctx.tunables.sketch_enabled().then(CountMinSketch::new);
        Ok(Self {
            chat: Chatterbox::bind(ctx, addr)?,
            dm,
            agents: HashSet::new(),
            directories: HashSet::new(),
            notify: false,
            notify_changed: false,
            global_nv: 0.0,
            global_ne: 0,
            cms,
            cms_recv: 0,
            simple_sync: 0,
            sync_ctr: HashMap::new(),
            num_dormant: HashMap::new(),
            ready_ctr: 0,
            it: 0,
            batch: 0,
            agents_idle: false,
        })
    }

    /// Register with the directory master and subscribe to its feed.
    pub fn join_directory(&mut self) -> ElgaResult<()> {
        tracing::debug!("joining directory master pub");
        for kind in [
            MsgKind::DirectoryJoin,
            MsgKind::DirectoryLeave,
            MsgKind::AgentJoin,
            MsgKind::AgentLeave,
            MsgKind::Shutdown,
            MsgKind::Start,
            MsgKind::Save,
            MsgKind::Dump,
            MsgKind::Heartbeat,
            MsgKind::ReadySyncInt,
            MsgKind::HaveUpdate,
            MsgKind::ReadyNvNeInt,
            MsgKind::CsUpdate,
            MsgKind::CsLb,
            MsgKind::Update,
            MsgKind::Reset,
            MsgKind::ChkT,
            MsgKind::Va,
        ] {
            self.chat.sub(kind)?;
        }
        self.chat.sub_connect(self.dm)?;

        tracing::debug!("registering");
        let ctx = self.chat.ctx().clone();
        let me = self.chat.addr();
        let mut dm_req = Requester::connect(&ctx, &me, self.dm, SocketKind::Request)?;
        let mut p = Packer::msg(MsgKind::DirectoryJoin);
        p.u64(me.serial());
        dm_req.send(p.freeze())?;
        dm_req.wait_ack()
    }

    /// Subscribe to every already-registered peer directory.
    pub fn join_peers(&mut self) -> ElgaResult<()> {
        tracing::debug!("finding peer directories");
        let ctx = self.chat.ctx().clone();
        let me = self.chat.addr();
        let mut dm_req = Requester::connect(&ctx, &me, self.dm, SocketKind::Request)?;
        dm_req.send_kind(MsgKind::GetDirectories)?;
        let data = dm_req.read()?;

        for serial in Unpacker::new(&data).u64_rest()? {
            self.join_peer(serial)?;
        }
        Ok(())
    }

    fn join_peer(&mut self, serial: u64) -> ElgaResult<()> {
        if serial == self.chat.addr().serial() {
            return Ok(());
        }
        self.chat.sub_connect(Address::from_serial(serial))?;
        self.directories.insert(serial);
        Ok(())
    }

    fn leave_peer(&mut self, serial: u64) {
        self.chat.sub_disconnect(Address::from_serial(serial));
        self.directories.remove(&serial);
    }

    fn agent_join(&mut self, list: &[u64]) -> bool {
        let Some(&first) = list.first() else {
            return false;
        };
        // Idempotent guard on the batch's first entry. Note a slight
        // problem here if agents are flapping.
        if self.agents.contains(&first) {
            return false;
        }
        for &a in list {
            self.agents.insert(a);
        }
        self.on_membership_change();
        tracing::debug!(agents = self.agents.len(), "agents joined");
        true
    }

    fn agent_leave(&mut self, list: &[u64]) -> bool {
        let Some(&first) = list.first() else {
            return false;
        };
        if !self.agents.contains(&first) {
            return false;
        }
        for &a in list {
            self.agents.remove(&a);
        }
        self.on_membership_change();
        true
    }

    fn on_membership_change(&mut self) {
        self.notify = true;
        self.notify_changed = true;
        // A sketch round in flight would otherwise count against the old
        // agent total.
        self.cms_recv = 0;
    }

    fn cs_update(&mut self, body: &[u8]) -> ElgaResult<()> {
        if let Some(cms) = self.cms.as_mut() {
            if !body.is_empty() {
                let incoming = CountMinSketch::from_bytes(body)?;
                cms.merge(&incoming);
            }
            self.cms_recv += 1;
            if self.cms_recv >= self.agents.len() {
                self.notify = true;
                self.notify_changed = true;
                tracing::info!("sending new sketch");
                self.cms_recv = 0;
            }
        }
        Ok(())
    }

    fn ready_nv_ne(&mut self, external: bool, body: &[u8]) -> ElgaResult<()> {
        let mut u = Unpacker::new(body);
        let unv = u.f64()?;
        let une = u.i64()?;

        self.ready_ctr += 1;
        self.global_nv += unv;
        self.global_ne += une;

        // Peer directories learn the deltas through the internal form.
        if external {
            let mut p = Packer::msg(MsgKind::ReadyNvNeInt);
            p.f64(unv).i64(une);
            self.chat.publish(p.freeze());
        }

        if self.ready_ctr == self.agents.len() {
            let mut p = Packer::msg(MsgKind::Nv);
            p.u64(self.global_nv.round().max(0.0) as u64);
            p.u64(self.global_ne.max(0) as u64);
            self.chat.publish(p.freeze());

            self.ready_ctr -= self.agents.len();
            self.it = 0;
            tracing::info!(nv = self.global_nv, ne = self.global_ne, "ready NV NE");
        }
        Ok(())
    }

    fn ready_sync(&mut self, external: bool, body: &[u8]) -> ElgaResult<()> {
        let mut u = Unpacker::new(body);
        let dormant = u.u64()?;

        let (msg_it, msg_batch) = if external {
            (self.it, self.batch)
        } else {
            (u.i32()?, u.u32()?)
        };

        *self
            .sync_ctr
            .entry(msg_batch)
            .or_default()
            .entry(msg_it)
            .or_default() += 1;
        *self
            .num_dormant
            .entry(msg_batch)
            .or_default()
            .entry(msg_it)
            .or_default() += dormant;

        if external {
            let mut p = Packer::msg(MsgKind::ReadySyncInt);
            p.u64(dormant).i32(self.it).u32(self.batch);
            self.chat.publish(p.freeze());
        }

        let ctr = *self
            .sync_ctr
            .entry(self.batch)
            .or_default()
            .entry(self.it)
            .or_default();
        let dormant_sum = *self
            .num_dormant
            .entry(self.batch)
            .or_default()
            .entry(self.it)
            .or_default();

        if ctr == self.agents.len() {
            let mut p = Packer::msg(MsgKind::Sync);
            p.u64(dormant_sum);
            self.chat.publish(p.freeze());
            tracing::info!(batch = self.batch, it = self.it, dormant_sum, "sending sync");

            // If no active vertices remain, the batch is over; bumping the
            // batch id keeps stragglers from restarting it.
            if dormant_sum == 0 {
                self.batch += 1;
            }
            self.it += 1;
            self.agents_idle = true;
        } else if ctr > self.agents.len() {
            return Err(ElgaError::protocol("received too many syncs"));
        }
        Ok(())
    }

    fn simple_sync(&mut self, frame: Bytes) -> ElgaResult<()> {
        self.chat.publish(frame);
        self.simple_sync += 1;
        if self.simple_sync >= self.agents.len() {
            tracing::info!(count = self.simple_sync, "simple sync complete");
            self.simple_sync = 0;
            self.chat
                .publish(Bytes::copy_from_slice(&[MsgKind::SimpleSyncDone as u8]));
            self.notify = true;
            self.notify_changed = true;
        }
        Ok(())
    }

    fn have_update(&mut self, frame: Bytes, body: &[u8]) -> ElgaResult<()> {
        let batch_of_req = Unpacker::new(body).u32()?;
        if batch_of_req < self.batch {
            return Ok(());
        }
        if batch_of_req > self.batch {
            return Err(ElgaError::protocol("future batch received"));
        }
        if !self.agents_idle {
            // Keep from re-sending this.
            return Ok(());
        }
        self.chat.publish(frame);
        self.agents_idle = false;
        Ok(())
    }

    /// Publish the directory snapshot if one is pending. Returns false
    /// when the heartbeat interval has not elapsed.
    fn heartbeat(&mut self) -> bool {
        if !self.chat.heartbeat(true) {
            return false;
        }
        if !self.notify {
            return true;
        }

        let cms_len = self.cms.as_ref().map(|_| crate::sketch::SKETCH_BYTES).unwrap_or(0);
        let mut p = Packer::with_capacity(2 + self.agents.len() * 8 + cms_len);
        p.kind(MsgKind::DirectoryUpdate);
        p.u8(self.notify_changed as u8);
        for &a in &self.agents {
            p.u64(a);
        }
        if let Some(cms) = self.cms.as_ref() {
            p.bytes(&cms.serialize());
        }

        if self.notify_changed {
            tracing::info!(agents = self.agents.len(), "sent new directory");
        }
        self.chat.publish(p.freeze());
        self.notify = false;
        self.notify_changed = false;
        true
    }

    fn graceful_shutdown(&mut self) -> ElgaResult<()> {
        tracing::debug!("initiating graceful local shutdown");
        let ctx = self.chat.ctx().clone();
        let me = self.chat.addr();

        // De-register with the directory master. It may already be gone if
        // the whole process is coming down; that is fine.
        let dereg = || -> ElgaResult<()> {
            let mut dm_req = Requester::connect(&ctx, &me, self.dm, SocketKind::Request)?;
            let mut p = Packer::msg(MsgKind::DirectoryLeave);
            p.u64(me.serial());
            dm_req.send(p.freeze())?;
            dm_req.wait_ack()
        };
        if let Err(e) = dereg() {
            tracing::warn!(%e, "could not de-register with the directory master");
        }

        // Tell our subscribers to move to other servers.
        self.chat
            .publish(Bytes::copy_from_slice(&[MsgKind::Disconnect as u8]));
        std::thread::sleep(Duration::from_millis(100));
        Ok(())
    }

    /// Serve until shutdown.
    pub fn run(&mut self) -> ElgaResult<()> {
        tracing::debug!("directory running");
        let ctx = self.chat.ctx().clone();
        let timeout = Duration::from_millis(ctx.tunables.poll_timeout_ms);

        let mut keep_running = true;
        while keep_running {
            if ctx.shutdown_requested() {
                self.graceful_shutdown()?;
                break;
            }

            self.heartbeat();

            for m in self.chat.poll(timeout) {
                let (frame, replier) = match m {
                    Incoming::Request(d, r) => (d, Some(r)),
                    Incoming::Publication(d) | Incoming::Push(d) => (d, None),
                };
                if frame.is_empty() {
                    return Err(ElgaError::protocol("message too small"));
                }
                let kind = MsgKind::from_u8(frame[0]).ok_or_else(|| {
                    ElgaError::protocol(format!("unknown message byte {:#x}", frame[0]))
                })?;
                let body = &frame[1..];
                tracing::trace!(?kind, "got message");

                match kind {
                    MsgKind::DirectoryJoin => {
                        let serial = Unpacker::new(body).u64()?;
                        self.join_peer(serial)?;
                    }
                    MsgKind::DirectoryLeave => {
                        let serial = Unpacker::new(body).u64()?;
                        self.leave_peer(serial);
                    }
                    MsgKind::AgentJoin => {
                        let list = Unpacker::new(body).u64_rest()?;
                        if self.agent_join(&list) {
                            self.chat.publish(frame.clone());
                        }
                    }
                    MsgKind::AgentLeave => {
                        let list = Unpacker::new(body).u64_rest()?;
                        if self.agent_leave(&list) {
                            self.chat.publish(frame.clone());
                        }
                    }
                    MsgKind::CsUpdate => {
                        self.cs_update(body)?;
                    }
                    MsgKind::NeedDirectory => {
                        self.notify = true;
                    }
                    MsgKind::ReadyNvNe => self.ready_nv_ne(true, body)?,
                    MsgKind::ReadyNvNeInt => self.ready_nv_ne(false, body)?,
                    MsgKind::ReadySync => self.ready_sync(true, body)?,
                    MsgKind::ReadySyncInt => self.ready_sync(false, body)?,
                    MsgKind::SimpleSync => self.simple_sync(frame.clone())?,
                    MsgKind::HaveUpdate => self.have_update(frame.clone(), body)?,
                    MsgKind::Shutdown => {
                        if let Some(r) = replier.as_ref() {
                            r.ack()?;
                        }
                        // Bring the whole system down with us.
                        self.chat
                            .publish(Bytes::copy_from_slice(&[MsgKind::Shutdown as u8]));
                        keep_running = false;
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    MsgKind::Heartbeat => {}
                    k if k.is_directive() => {
                        // Rewrite to the DO_* variant and pass through to
                        // the agents.
                        if let Some(r) = replier.as_ref() {
                            r.ack()?;
                        }
                        let mut p = Packer::with_capacity(frame.len());
                        p.kind(k.to_do().expect("directive"));
                        p.bytes(body);
                        self.chat.publish(p.freeze());
                    }
                    _ => {
                        tracing::error!(?kind, "received unknown type");
                        return Err(ElgaError::protocol(format!(
                            "unexpected message: {kind:?}"
                        )));
                    }
                }
            }
        }

        tracing::debug!("directory stopping");
        Ok(())
    }
}
