//! The common base for agents, streamers, and clients.
//!
//! A participant resolves a directory through the directory master,
//! subscribes to its updates, keeps the consistent hasher current, and
//! pools outbound requesters in a bounded LRU. Roles plug into the shared
//! poll loop through the [Role] trait.

use crate::chatterbox::{Chatterbox, Incoming, Replier, Requester};
use crate::ctx::ProcessCtx;
use crate::locator::EdgeLocator;
use bytes::Bytes;
use elga_api::{Address, Dir, Edge, ElgaError, ElgaResult, MsgKind, SocketKind, Unpacker, Vertex};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::Duration;

/// Common participant state.
pub struct Participant {
    chat: Chatterbox,
    directory: Address,
    dm: Address,
    locator: EdgeLocator,
    pool: LruCache<u64, Requester>,
    d_req: Option<Requester>,
    ready: bool,
    working: bool,
}

impl Participant {
    /// Connect to the cluster: ask the directory master for a directory,
    /// subscribe to it, and request a directory snapshot. With `persist`,
    /// keep an open push connection to the directory for later sends.
    pub fn new(ctx: &ProcessCtx, addr: Address, dm: Address, persist: bool) -> ElgaResult<Self> {
        let mut chat = Chatterbox::bind(ctx, addr)?;
        let pool = LruCache::new(NonZeroUsize::new(ctx.tunables.lru_limit.max(1)).expect("nonzero"));

        tracing::debug!(%addr, "querying for a directory");
        let mut dm_req = Requester::connect(ctx, &addr, dm, SocketKind::Request)?;
        dm_req.send_kind(MsgKind::GetDirectory)?;
        let res = dm_req.read()?;

        if res.is_empty() {
            tracing::warn!("trying to participate, but no directories");
            return Ok(Self {
                chat,
                directory: Address::default(),
                dm,
                locator: EdgeLocator::new(&ctx.tunables),
                pool,
                d_req: None,
                ready: false,
                working: false,
            });
        }

        let directory = Address::from_serial(Unpacker::new(&res).u64()?);
        tracing::debug!(%directory, "joining directory");

        // Establish this as our directory server: subscribe to its updates
        // and ask it to send one.
        chat.sub(MsgKind::Heartbeat)?;
        chat.sub(MsgKind::Shutdown)?;
        chat.sub_filter(&[MsgKind::DirectoryUpdate as u8, 0x00])?;
        chat.sub_filter(&[MsgKind::DirectoryUpdate as u8, 0x01])?;
        chat.sub(MsgKind::Disconnect)?;
        chat.sub_connect(directory)?;

        let mut d_req = Requester::connect(ctx, &addr, directory, SocketKind::Pull)?;
        d_req.send_kind(MsgKind::NeedDirectory)?;

        Ok(Self {
            chat,
            directory,
            dm,
            locator: EdgeLocator::new(&ctx.tunables),
            pool,
            d_req: if persist { Some(d_req) } else { None },
            ready: false,
            working: false,
        })
    }

    /// The owning context.
    pub fn ctx(&self) -> ProcessCtx {
        self.chat.ctx().clone()
    }

    /// Our endpoint address.
    pub fn addr(&self) -> Address {
        self.chat.addr()
    }

    /// Our endpoint serial.
    pub fn serial(&self) -> u64 {
        self.chat.addr().serial()
    }

    /// The directory master's address.
    pub fn dm(&self) -> Address {
        self.dm
    }

    /// The directory we resolved to.
    pub fn directory(&self) -> Address {
        self.directory
    }

    /// The socket set, for role-specific subscriptions and replies.
    pub fn chat(&mut self) -> &mut Chatterbox {
        &mut self.chat
    }

    /// Whether a directory snapshot has been installed.
    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Whether the last poll carried role work.
    pub fn working(&self) -> bool {
        self.working
    }

    /// The edge locator.
    pub fn locator(&mut self) -> &mut EdgeLocator {
        &mut self.locator
    }

    /// Number of physical agents in the installed directory.
    pub fn num_agents(&self) -> usize {
        self.locator.num_agents()
    }

    /// Number of virtual agents in the installed directory.
    pub fn num_vagents(&self) -> usize {
        self.locator.num_vagents()
    }

    /// Extra replicas for a vertex beyond its first owner.
    pub fn count_agent_reps(&self, v: Vertex) -> i32 {
        self.locator.count_agent_reps(v)
    }

    /// Resolve the destination agent for an edge; see
    /// [EdgeLocator::find_agent].
    pub fn find_agent(
        &mut self,
        e: Edge,
        et: Dir,
        find_owner: bool,
        owner_check: u64,
        return_va: bool,
    ) -> (u64, bool) {
        self.locator.find_agent(e, et, find_owner, owner_check, return_va)
    }

    /// Send on the persistent directory push connection.
    pub fn d_send(&mut self, data: Bytes) -> ElgaResult<()> {
        self.d_req
            .as_mut()
            .ok_or_else(|| ElgaError::other("no directory connection"))?
            .send(data)
    }

    /// Fetch the pooled push requester for an agent, opening it if needed.
    /// The pool is bounded; the least-recently-used connection is closed
    /// on overflow.
    pub fn get_requester(&mut self, agent_serial: u64) -> ElgaResult<&mut Requester> {
        if !self.pool.contains(&agent_serial) {
            let ctx = self.chat.ctx().clone();
            let me = self.chat.addr();
            let req = Requester::connect(
                &ctx,
                &me,
                Address::from_serial(agent_serial),
                SocketKind::Pull,
            )?;
            self.pool.put(agent_serial, req);
        }
        Ok(self.pool.get_mut(&agent_serial).expect("just inserted"))
    }

    /// Install a directory snapshot body (after the changed flag).
    pub fn directory_update(&mut self, body: &[u8]) -> ElgaResult<()> {
        if !self.ready {
            // From now on only changed snapshots are interesting.
            self.chat
                .unsub_filter(&[MsgKind::DirectoryUpdate as u8, 0x00])?;
        }
        self.locator.install_directory(body)?;
        self.ready = true;
        tracing::debug!(
            agents = self.locator.num_agents(),
            vagents = self.locator.num_vagents(),
            "installed directory"
        );
        Ok(())
    }
}

/// A role driving the shared participant loop.
pub trait Role {
    /// The common participant state.
    fn participant(&mut self) -> &mut Participant;

    /// Handle a role-specific message. Return false for unrecognized
    /// kinds, which the loop treats as a protocol error.
    fn handle_msg(
        &mut self,
        kind: MsgKind,
        body: &[u8],
        replier: Option<&Replier>,
    ) -> ElgaResult<bool>;

    /// Called after a changed directory snapshot has been installed.
    fn handle_directory_update(&mut self) -> ElgaResult<()> {
        Ok(())
    }

    /// Role work before each blocking poll.
    fn pre_poll(&mut self) -> ElgaResult<()> {
        Ok(())
    }

    /// Per-loop heartbeat work.
    fn heartbeat(&mut self) -> ElgaResult<()> {
        Ok(())
    }

    /// Called when a process shutdown has been requested. Return true to
    /// keep draining (an agent with edges still to move), false to stop.
    fn on_shutdown(&mut self) -> ElgaResult<bool> {
        Ok(false)
    }
}

/// Run a role's loop until shutdown.
pub fn run<R: Role>(role: &mut R) -> ElgaResult<()> {
    tracing::debug!("participant running");
    loop {
        if role.participant().ctx().shutdown_requested() && !role.on_shutdown()? {
            break;
        }
        role.heartbeat()?;
        role.pre_poll()?;
        if !poll_step(role, false)? {
            break;
        }
    }
    tracing::debug!("participant stopping");
    Ok(())
}

/// One poll pass. With `drain`, do not block and return false once no
/// messages remain; otherwise return false only when the loop should end.
pub fn poll_step<R: Role>(role: &mut R, drain: bool) -> ElgaResult<bool> {
    let timeout = if drain {
        Duration::ZERO
    } else {
        Duration::from_millis(role.participant().ctx().tunables.poll_timeout_ms)
    };

    let msgs = role.participant().chat.poll(timeout);
    if drain && msgs.is_empty() {
        return Ok(false);
    }
    role.participant().working = false;

    let mut keep_running = true;
    for m in msgs {
        let (data, replier) = match m {
            Incoming::Request(d, r) => (d, Some(r)),
            Incoming::Publication(d) => (d, None),
            Incoming::Push(d) => (d, None),
        };
        if data.is_empty() {
            return Err(ElgaError::protocol("message too small"));
        }
        let kind = MsgKind::from_u8(data[0])
            .ok_or_else(|| ElgaError::protocol(format!("unknown message byte {:#x}", data[0])))?;

        match kind {
            MsgKind::Shutdown => {
                keep_running = false;
            }
            MsgKind::Heartbeat => {}
            MsgKind::DirectoryUpdate => {
                let mut u = Unpacker::new(&data[1..]);
                let changed = u.u8()?;
                role.participant().directory_update(&data[2..])?;
                if changed != 0 {
                    role.handle_directory_update()?;
                }
            }
            MsgKind::Disconnect => {
                // Directory failover is not implemented; a disconnect
                // during a process shutdown is just the end of the line.
                if !role.participant().ctx().shutdown_requested() {
                    return Err(ElgaError::other("directory disconnected"));
                }
                keep_running = false;
            }
            _ => {
                role.participant().working = true;
                if !role.handle_msg(kind, &data[1..], replier.as_ref())? {
                    return Err(ElgaError::protocol(format!("unexpected message: {kind:?}")));
                }
            }
        }
    }
    Ok(keep_running)
}
