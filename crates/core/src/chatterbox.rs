//! The messaging layer.
//!
//! Every participant owns a [Chatterbox]: a reply socket answering
//! requests, a publish socket broadcasting to subscribers (filtered on
//! leading bytes), and a pull socket receiving fire-and-forget pushes.
//! Outbound sides are [Requester]s in request or push mode.
//!
//! Each socket binds both an in-process name (used between same-host peers
//! inside the local range, routed through the context's
//! [Exchange](exchange::Exchange)) and a TCP address carrying
//! length-prefixed frames. Delivery semantics:
//! exactly one reply per request, per-publisher and per-sender ordering,
//! best-effort fan-out for publications.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Select, Sender};
use elga_api::{Address, ElgaError, ElgaResult, MsgKind, SocketKind};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::ctx::ProcessCtx;

pub mod exchange;
mod frame;

use exchange::{PubState, Subscriber};
pub(crate) use frame::read_frame;
use frame::write_frame;

/// Subscribe control byte on a publisher connection.
const CTRL_SUB: u8 = 0x01;
/// Unsubscribe control byte on a publisher connection.
const CTRL_UNSUB: u8 = 0x02;

/// How long accept/read loops sleep between shutdown checks.
const IO_TICK: Duration = Duration::from_millis(50);

/// How long to wait between connection retries.
const CONNECT_RETRY: Duration = Duration::from_millis(20);

static NEXT_SUB_ID: AtomicU64 = AtomicU64::new(1);

/// The reply handle paired with an inbound request.
#[derive(Debug, Clone)]
pub enum Replier {
    /// Reply goes back over an in-process channel.
    Inproc(Sender<Bytes>),
    /// Reply goes back over the request's TCP stream.
    Tcp(Arc<Mutex<TcpStream>>),
}

impl Replier {
    /// Send the reply. Exactly one reply must be sent per request.
    pub fn reply(&self, data: Bytes) -> ElgaResult<()> {
        match self {
            Replier::Inproc(tx) => tx
                .send(data)
                .map_err(|_| ElgaError::other("requester hung up")),
            Replier::Tcp(stream) => {
                let mut s = stream.lock().expect("poisoned reply stream");
                write_frame(&mut s, &data).map_err(ElgaError::from)
            }
        }
    }

    /// Send an empty acknowledgement.
    pub fn ack(&self) -> ElgaResult<()> {
        self.reply(Bytes::new())
    }
}

/// One inbound message from a poll.
#[derive(Debug)]
pub enum Incoming {
    /// A request on the reply socket; answer through the [Replier].
    Request(Bytes, Replier),
    /// A publication from a subscribed publisher.
    Publication(Bytes),
    /// A fire-and-forget push.
    Push(Bytes),
}

enum ReqConn {
    InprocReq(Sender<(Bytes, Replier)>),
    InprocPull(Sender<Bytes>),
    Tcp(TcpStream),
}

/// An outbound connection to one peer socket, in request mode (lockstep
/// send/read) or push mode (fire and forget).
pub struct Requester {
    target: Address,
    conn: ReqConn,
    pending: Option<Receiver<Bytes>>,
    ctx: ProcessCtx,
}

impl std::fmt::Debug for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requester").field("target", &self.target).finish()
    }
}

impl Requester {
    /// Open a connection from `myself` to one of `target`'s sockets.
    /// `kind` must be [SocketKind::Request] or [SocketKind::Pull].
    pub fn connect(
        ctx: &ProcessCtx,
        myself: &Address,
        target: Address,
        kind: SocketKind,
    ) -> ElgaResult<Self> {
        let t = &ctx.tunables;
        let conn = if target.is_in_process(myself, ctx.local_base, ctx.local_max) {
            let key = target.local_str(kind, &t.ports);
            match kind {
                SocketKind::Request => {
                    ReqConn::InprocReq(wait_for(ctx, || ctx.exchange.lookup_req(&key))?)
                }
                SocketKind::Pull => {
                    ReqConn::InprocPull(wait_for(ctx, || ctx.exchange.lookup_pull(&key))?)
                }
                SocketKind::Publish => {
                    return Err(ElgaError::arg("requesters do not speak to publish sockets"))
                }
            }
        } else {
            ReqConn::Tcp(tcp_connect(ctx, &target.remote_str(kind, &t.ports))?)
        };
        Ok(Self {
            target,
            conn,
            pending: None,
            ctx: ctx.clone(),
        })
    }

    /// The target endpoint serial.
    pub fn addr(&self) -> u64 {
        self.target.serial()
    }

    /// Send a message. In request mode a reply becomes readable.
    pub fn send(&mut self, data: Bytes) -> ElgaResult<()> {
        match &mut self.conn {
            ReqConn::InprocReq(tx) => {
                let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
                tx.send((data, Replier::Inproc(reply_tx)))
                    .map_err(|_| ElgaError::other("peer reply socket closed"))?;
                self.pending = Some(reply_rx);
                Ok(())
            }
            ReqConn::InprocPull(tx) => tx
                .send(data)
                .map_err(|_| ElgaError::other("peer pull socket closed")),
            ReqConn::Tcp(stream) => write_frame(stream, &data).map_err(ElgaError::from),
        }
    }

    /// Send a bare message kind.
    pub fn send_kind(&mut self, kind: MsgKind) -> ElgaResult<()> {
        self.send(Bytes::copy_from_slice(&[kind as u8]))
    }

    /// Read the reply to the last request. Request mode only.
    pub fn read(&mut self) -> ElgaResult<Bytes> {
        match &mut self.conn {
            ReqConn::InprocReq(_) => {
                let rx = self
                    .pending
                    .take()
                    .ok_or_else(|| ElgaError::other("read with no outstanding request"))?;
                loop {
                    match rx.recv_timeout(IO_TICK) {
                        Ok(b) => return Ok(b),
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                            if self.ctx.shutdown_requested() {
                                return Err(ElgaError::other("shutdown while awaiting reply"));
                            }
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                            return Err(ElgaError::other("peer dropped the request"))
                        }
                    }
                }
            }
            ReqConn::InprocPull(_) => Err(ElgaError::other("push sockets have no replies")),
            ReqConn::Tcp(stream) => {
                match read_frame(stream, &self.ctx)? {
                    Some(b) => Ok(b),
                    None => Err(ElgaError::other("peer closed before replying")),
                }
            }
        }
    }

    /// Wait for an (empty) acknowledgement reply.
    pub fn wait_ack(&mut self) -> ElgaResult<()> {
        self.read().map(|_| ())
    }
}

struct SubConn {
    // Kept for control-frame writes; reader thread owns a clone.
    stream: Option<TcpStream>,
    sub_id: u64,
    pub_state: Option<Arc<PubState>>,
}

/// The per-participant socket set.
pub struct Chatterbox {
    ctx: ProcessCtx,
    addr: Address,

    rep_rx: Receiver<(Bytes, Replier)>,
    pull_rx: Receiver<Bytes>,
    sub_rx: Receiver<Bytes>,
    sub_tx: Sender<Bytes>,

    filters: Arc<Mutex<Vec<Vec<u8>>>>,
    pub_state: Arc<PubState>,

    sub_conns: std::collections::HashMap<u64, SubConn>,

    closed: Arc<AtomicBool>,
    io_threads: Vec<std::thread::JoinHandle<()>>,

    last_heartbeat: Option<Instant>,
}

impl std::fmt::Debug for Chatterbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chatterbox").field("addr", &self.addr).finish()
    }
}

impl Chatterbox {
    /// Set up the socket set for `addr`. A zero address binds nothing and
    /// can only subscribe and open requesters.
    pub fn bind(ctx: &ProcessCtx, addr: Address) -> ElgaResult<Self> {
        let t = &ctx.tunables;
        let (rep_tx, rep_rx) = crossbeam_channel::unbounded();
        let (pull_tx, pull_rx) = crossbeam_channel::unbounded();
        let (sub_tx, sub_rx) = crossbeam_channel::unbounded();

        let filters: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let pub_state = Arc::new(PubState::default());
        let closed = Arc::new(AtomicBool::new(false));
        let mut io_threads = Vec::new();

        if !addr.is_zero() {
            let ex = &ctx.exchange;
            ex.register_req(addr.local_str(SocketKind::Request, &t.ports), rep_tx.clone());
            ex.register_pull(addr.local_str(SocketKind::Pull, &t.ports), pull_tx.clone());
            ex.register_pub(addr.local_str(SocketKind::Publish, &t.ports), pub_state.clone());

            io_threads.push(spawn_rep_listener(
                ctx,
                &addr.remote_str(SocketKind::Request, &t.ports),
                rep_tx,
                closed.clone(),
            )?);
            io_threads.push(spawn_pull_listener(
                ctx,
                &addr.remote_str(SocketKind::Pull, &t.ports),
                pull_tx,
                closed.clone(),
            )?);
            io_threads.push(spawn_pub_listener(
                ctx,
                &addr.remote_str(SocketKind::Publish, &t.ports),
                pub_state.clone(),
                closed.clone(),
            )?);
        }

        Ok(Self {
            ctx: ctx.clone(),
            addr,
            rep_rx,
            pull_rx,
            sub_rx,
            sub_tx,
            filters,
            pub_state,
            sub_conns: std::collections::HashMap::new(),
            closed,
            io_threads,
            last_heartbeat: None,
        })
    }

    /// This endpoint's address.
    pub fn addr(&self) -> Address {
        self.addr
    }

    /// The owning context.
    pub fn ctx(&self) -> &ProcessCtx {
        &self.ctx
    }

    /// Poll the three inbound sockets, blocking up to `timeout`. Returns
    /// at most one message per socket per pass.
    pub fn poll(&self, timeout: Duration) -> Vec<Incoming> {
        let mut out = Vec::new();
        self.drain_one_each(&mut out);
        if !out.is_empty() || timeout.is_zero() {
            return out;
        }

        let mut sel = Select::new();
        sel.recv(&self.rep_rx);
        sel.recv(&self.sub_rx);
        sel.recv(&self.pull_rx);
        match sel.select_timeout(timeout) {
            Err(_) => {}
            Ok(op) => match op.index() {
                0 => {
                    if let Ok((d, r)) = op.recv(&self.rep_rx) {
                        out.push(Incoming::Request(d, r));
                    }
                }
                1 => {
                    if let Ok(d) = op.recv(&self.sub_rx) {
                        out.push(Incoming::Publication(d));
                    }
                }
                _ => {
                    if let Ok(d) = op.recv(&self.pull_rx) {
                        out.push(Incoming::Push(d));
                    }
                }
            },
        }
        out
    }

    fn drain_one_each(&self, out: &mut Vec<Incoming>) {
        if let Ok((d, r)) = self.rep_rx.try_recv() {
            out.push(Incoming::Request(d, r));
        }
        if let Ok(d) = self.sub_rx.try_recv() {
            out.push(Incoming::Publication(d));
        }
        if let Ok(d) = self.pull_rx.try_recv() {
            out.push(Incoming::Push(d));
        }
    }

    /// Publish a message to all current subscribers whose filters match.
    pub fn publish(&self, data: Bytes) {
        self.pub_state.publish(&data);
    }

    /// Subscribe to a single leading kind byte.
    pub fn sub(&mut self, kind: MsgKind) -> ElgaResult<()> {
        self.sub_filter(&[kind as u8])
    }

    /// Subscribe to a leading byte sequence.
    pub fn sub_filter(&mut self, filter: &[u8]) -> ElgaResult<()> {
        {
            let mut f = self.filters.lock().expect("poisoned filters");
            if !f.iter().any(|x| x == filter) {
                f.push(filter.to_vec());
            }
        }
        self.send_ctrl(CTRL_SUB, filter)
    }

    /// Remove a leading byte sequence subscription.
    pub fn unsub_filter(&mut self, filter: &[u8]) -> ElgaResult<()> {
        self.filters
            .lock()
            .expect("poisoned filters")
            .retain(|x| x != filter);
        self.send_ctrl(CTRL_UNSUB, filter)
    }

    fn send_ctrl(&mut self, ctrl: u8, filter: &[u8]) -> ElgaResult<()> {
        let mut frame = Vec::with_capacity(1 + filter.len());
        frame.push(ctrl);
        frame.extend_from_slice(filter);
        for conn in self.sub_conns.values_mut() {
            if let Some(stream) = conn.stream.as_mut() {
                write_frame(stream, &frame)?;
            }
        }
        Ok(())
    }

    /// Connect as a subscriber to `target`'s publish socket.
    pub fn sub_connect(&mut self, target: Address) -> ElgaResult<()> {
        let serial = target.serial();
        if self.sub_conns.contains_key(&serial) {
            return Ok(());
        }
        let t = &self.ctx.tunables;
        let sub_id = NEXT_SUB_ID.fetch_add(1, Ordering::Relaxed);

        if target.is_in_process(&self.addr, self.ctx.local_base, self.ctx.local_max) {
            let key = target.local_str(SocketKind::Publish, &t.ports);
            let ctx = self.ctx.clone();
            let state = wait_for(&ctx, || ctx.exchange.lookup_pub(&key))?;
            state.add_subscriber(Subscriber {
                id: sub_id,
                filters: self.filters.clone(),
                tx: self.sub_tx.clone(),
            });
            self.sub_conns.insert(
                serial,
                SubConn {
                    stream: None,
                    sub_id,
                    pub_state: Some(state),
                },
            );
        } else {
            let mut stream =
                tcp_connect(&self.ctx, &target.remote_str(SocketKind::Publish, &t.ports))?;
            for f in self.filters.lock().expect("poisoned filters").iter() {
                let mut frame = Vec::with_capacity(1 + f.len());
                frame.push(CTRL_SUB);
                frame.extend_from_slice(f);
                write_frame(&mut stream, &frame)?;
            }
            let reader = stream.try_clone()?;
            let tx = self.sub_tx.clone();
            let ctx = self.ctx.clone();
            let closed = self.closed.clone();
            self.io_threads.push(std::thread::spawn(move || {
                let mut reader = reader;
                while !closed.load(Ordering::SeqCst) && !ctx.shutdown_requested() {
                    match read_frame(&mut reader, &ctx) {
                        Ok(Some(b)) => {
                            if tx.send(b).is_err() {
                                break;
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            }));
            self.sub_conns.insert(
                serial,
                SubConn {
                    stream: Some(stream),
                    sub_id,
                    pub_state: None,
                },
            );
        }
        Ok(())
    }

    /// Disconnect from a publisher.
    pub fn sub_disconnect(&mut self, target: Address) {
        if let Some(conn) = self.sub_conns.remove(&target.serial()) {
            if let Some(state) = conn.pub_state {
                state.remove_subscriber(conn.sub_id);
            }
            if let Some(stream) = conn.stream {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
        }
    }

    /// Returns true at most once per heartbeat interval; when `send` is
    /// set, also publishes a HEARTBEAT frame.
    pub fn heartbeat(&mut self, send: bool) -> bool {
        let interval = Duration::from_micros(self.ctx.tunables.heartbeat_us);
        let due = match self.last_heartbeat {
            None => true,
            Some(at) => at.elapsed() >= interval,
        };
        if !due {
            return false;
        }
        self.last_heartbeat = Some(Instant::now());
        if send {
            self.publish(Bytes::copy_from_slice(&[MsgKind::Heartbeat as u8]));
        }
        true
    }
}

impl Drop for Chatterbox {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if !self.addr.is_zero() {
            let t = &self.ctx.tunables;
            let ex = &self.ctx.exchange;
            ex.unregister_req(&self.addr.local_str(SocketKind::Request, &t.ports));
            ex.unregister_pull(&self.addr.local_str(SocketKind::Pull, &t.ports));
            ex.unregister_pub(&self.addr.local_str(SocketKind::Publish, &t.ports));
        }
        for (_, conn) in self.sub_conns.drain() {
            if let Some(state) = conn.pub_state {
                state.remove_subscriber(conn.sub_id);
            }
            if let Some(stream) = conn.stream {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
        }
        for th in self.io_threads.drain(..) {
            let _ = th.join();
        }
    }
}

/// Wait for an in-process peer to bind, retrying until shutdown. Peers in
/// one process start in arbitrary thread order, so connects buffer.
fn wait_for<T>(ctx: &ProcessCtx, mut lookup: impl FnMut() -> Option<T>) -> ElgaResult<T> {
    loop {
        if let Some(v) = lookup() {
            return Ok(v);
        }
        if ctx.shutdown_requested() {
            return Err(ElgaError::other("shutdown while connecting"));
        }
        std::thread::sleep(CONNECT_RETRY);
    }
}

/// Connect over TCP, retrying refused connections until shutdown.
fn tcp_connect(ctx: &ProcessCtx, addr: &str) -> ElgaResult<TcpStream> {
    let hostport = addr
        .strip_prefix("tcp://")
        .ok_or_else(|| ElgaError::arg(format!("not a tcp address: {addr}")))?;
    loop {
        match TcpStream::connect(hostport) {
            Ok(s) => {
                s.set_nodelay(true)?;
                return Ok(s);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable
                ) =>
            {
                if ctx.shutdown_requested() {
                    return Err(ElgaError::other("shutdown while connecting"));
                }
                std::thread::sleep(CONNECT_RETRY);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn tcp_listener(addr: &str) -> ElgaResult<TcpListener> {
    let hostport = addr
        .strip_prefix("tcp://")
        .ok_or_else(|| ElgaError::arg(format!("not a tcp address: {addr}")))?;
    // Bind on the wildcard address at this endpoint's port so peers can
    // reach us by the address we advertise.
    let port = hostport
        .rsplit(':')
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| ElgaError::arg(format!("no port in address: {addr}")))?;
    let l = TcpListener::bind(("0.0.0.0", port))?;
    l.set_nonblocking(true)?;
    Ok(l)
}

fn accept_loop(
    listener: TcpListener,
    ctx: ProcessCtx,
    closed: Arc<AtomicBool>,
    mut on_conn: impl FnMut(TcpStream) + Send + 'static,
) {
    while !closed.load(Ordering::SeqCst) && !ctx.shutdown_requested() {
        match listener.accept() {
            Ok((stream, _)) => {
                let _ = stream.set_nodelay(true);
                on_conn(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(IO_TICK);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
}

fn spawn_rep_listener(
    ctx: &ProcessCtx,
    addr: &str,
    rep_tx: Sender<(Bytes, Replier)>,
    closed: Arc<AtomicBool>,
) -> ElgaResult<std::thread::JoinHandle<()>> {
    let listener = tcp_listener(addr)?;
    let ctx = ctx.clone();
    Ok(std::thread::spawn(move || {
        let conn_ctx = ctx.clone();
        let conn_closed = closed.clone();
        accept_loop(listener, ctx, closed, move |stream| {
            let reply = Arc::new(Mutex::new(match stream.try_clone() {
                Ok(s) => s,
                Err(_) => return,
            }));
            let tx = rep_tx.clone();
            let ctx = conn_ctx.clone();
            let closed = conn_closed.clone();
            std::thread::spawn(move || {
                let mut stream = stream;
                while !closed.load(Ordering::SeqCst) && !ctx.shutdown_requested() {
                    match read_frame(&mut stream, &ctx) {
                        Ok(Some(b)) => {
                            if tx.send((b, Replier::Tcp(reply.clone()))).is_err() {
                                break;
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            });
        });
    }))
}

fn spawn_pull_listener(
    ctx: &ProcessCtx,
    addr: &str,
    pull_tx: Sender<Bytes>,
    closed: Arc<AtomicBool>,
) -> ElgaResult<std::thread::JoinHandle<()>> {
    let listener = tcp_listener(addr)?;
    let ctx = ctx.clone();
    Ok(std::thread::spawn(move || {
        let conn_ctx = ctx.clone();
        let conn_closed = closed.clone();
        accept_loop(listener, ctx, closed, move |stream| {
            let tx = pull_tx.clone();
            let ctx = conn_ctx.clone();
            let closed = conn_closed.clone();
            std::thread::spawn(move || {
                let mut stream = stream;
                while !closed.load(Ordering::SeqCst) && !ctx.shutdown_requested() {
                    match read_frame(&mut stream, &ctx) {
                        Ok(Some(b)) => {
                            if tx.send(b).is_err() {
                                break;
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            });
        });
    }))
}

fn spawn_pub_listener(
    ctx: &ProcessCtx,
    addr: &str,
    pub_state: Arc<PubState>,
    closed: Arc<AtomicBool>,
) -> ElgaResult<std::thread::JoinHandle<()>> {
    let listener = tcp_listener(addr)?;
    let ctx = ctx.clone();
    Ok(std::thread::spawn(move || {
        let conn_ctx = ctx.clone();
        let conn_closed = closed.clone();
        accept_loop(listener, ctx, closed, move |stream| {
            // Each remote subscriber gets its own filter set, updated by
            // control frames, and a writer thread draining its queue.
            let filters: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
            let (tx, rx) = crossbeam_channel::unbounded::<Bytes>();
            let sub_id = NEXT_SUB_ID.fetch_add(1, Ordering::Relaxed);
            pub_state.add_subscriber(Subscriber {
                id: sub_id,
                filters: filters.clone(),
                tx,
            });

            let writer = match stream.try_clone() {
                Ok(s) => s,
                Err(_) => {
                    pub_state.remove_subscriber(sub_id);
                    return;
                }
            };
            let w_closed = conn_closed.clone();
            let w_ctx = conn_ctx.clone();
            std::thread::spawn(move || {
                let mut writer = writer;
                while !w_closed.load(Ordering::SeqCst) && !w_ctx.shutdown_requested() {
                    match rx.recv_timeout(IO_TICK) {
                        Ok(b) => {
                            if write_frame(&mut writer, &b).is_err() {
                                break;
                            }
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
            });

            let r_closed = conn_closed.clone();
            let r_ctx = conn_ctx.clone();
            let r_state = pub_state.clone();
            std::thread::spawn(move || {
                let mut stream = stream;
                while !r_closed.load(Ordering::SeqCst) && !r_ctx.shutdown_requested() {
                    match read_frame(&mut stream, &r_ctx) {
                        Ok(Some(frame)) if !frame.is_empty() => {
                            let (ctrl, filter) = (frame[0], frame[1..].to_vec());
                            let mut f = filters.lock().expect("poisoned filters");
                            match ctrl {
                                CTRL_SUB => {
                                    if !f.iter().any(|x| *x == filter) {
                                        f.push(filter);
                                    }
                                }
                                CTRL_UNSUB => f.retain(|x| *x != filter),
                                _ => {}
                            }
                        }
                        Ok(Some(_)) => {}
                        Ok(None) | Err(_) => break,
                    }
                }
                r_state.remove_subscriber(sub_id);
            });
        });
    }))
}

#[cfg(test)]
mod test;
