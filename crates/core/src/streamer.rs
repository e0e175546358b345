//! The streamer: a proxy feeding edge changes into the graph.
//!
//! Sources: an on-disk edge list (plain `src dst` lines or signed
//! `±1 src dst weight ts` lines), a uniform random generator partitioned
//! across ranks, or a network listener draining `(u64, u64)` pairs. Each
//! edge is dispatched to the agent owning its IN side, singly or in
//! per-owner batches.

use crate::chatterbox::{read_frame, Replier};
use crate::ctx::ProcessCtx;
use crate::participant::{self, Participant, Role};
use elga_api::pack::UPDATE_WIRE_SIZE;
use elga_api::{
    Address, Dir, Edge, ElgaError, ElgaResult, MsgKind, Packer, Unpacker, Update, Vertex,
};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::time::Duration;

/// The edge streamer.
pub struct Streamer {
    p: Participant,
    changes: HashMap<u64, Vec<Edge>>,
    batch_size: usize,
    batch: bool,
    wait: bool,
    mb: usize,
    /// Completed-batch count observed through SYNC messages.
    pub batch_count: usize,
}

impl Streamer {
    /// Create a streamer pointed at the given directory master.
    pub fn new(ctx: &ProcessCtx, dm: Address) -> ElgaResult<Self> {
        Ok(Self {
            p: Participant::new(ctx, Address::default(), dm, false)?,
            changes: HashMap::new(),
            batch_size: 0,
            batch: true,
            wait: false,
            mb: 0,
            batch_count: 0,
        })
    }

    /// Toggle per-owner batching.
    pub fn set_batch(&mut self, val: bool) {
        self.batch = val;
    }

    /// Set the mini-batch size (0 disables mid-file waits).
    pub fn set_mb(&mut self, val: usize) {
        self.mb = val;
    }

    /// Subscribe to batch-completion syncs and wait on them.
    pub fn wait_batch(&mut self) -> ElgaResult<()> {
        self.p.chat().sub(MsgKind::Sync)?;
        self.wait = true;
        Ok(())
    }

    /// Block until the directory is received and ready to use.
    pub fn wait_until_ready(&mut self) -> ElgaResult<()> {
        while !self.p.ready() {
            if self.p.ctx().shutdown_requested() {
                tracing::info!("shutting down");
                return Ok(());
            }
            if !participant::poll_step(self, false)? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Send one edge change to the agent owning its IN side.
    pub fn change_edge(&mut self, e: Edge, insert: bool) -> ElgaResult<()> {
        let (agent_in, _) = self.p.find_agent(e, Dir::In, true, 0, false);
        let u = Update::new(e, Dir::In, insert);
        let mut p = Packer::msg(MsgKind::UpdateEdge);
        p.update(&u);
        self.p.get_requester(agent_in)?.send(p.freeze())
    }

    fn queue_edge(&mut self, e: Edge) {
        let (agent, _) = self.p.find_agent(e, Dir::In, true, 0, false);
        self.changes.entry(agent).or_default().push(e);
        self.batch_size += 1;
    }

    /// Flush the accumulated per-owner batches.
    pub fn send_batch(&mut self) -> ElgaResult<()> {
        let changes = std::mem::take(&mut self.changes);
        for (agent, edges) in changes {
            let mut p = Packer::with_capacity(1 + edges.len() * UPDATE_WIRE_SIZE);
            p.kind(MsgKind::UpdateEdges);
            for e in &edges {
                p.update(&Update::new(*e, Dir::In, true));
            }
            self.p.get_requester(agent)?.send(p.freeze())?;
        }
        self.batch_size = 0;
        Ok(())
    }

    fn wait_for_sync(&mut self, seen: usize) -> ElgaResult<()> {
        tracing::info!("waiting for batch completion");
        while self.batch_count <= seen {
            if self.p.ctx().shutdown_requested() {
                tracing::info!("shutting down");
                return Ok(());
            }
            if !participant::poll_step(self, false)? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Parse and stream an edge-list file. With `el`, lines are plain
    /// `src dst` insertions; otherwise `±1 src dst weight ts`.
    pub fn parse_file(&mut self, fname: &str, el: bool) -> ElgaResult<()> {
        let f = std::fs::File::open(fname)
            .map_err(|e| ElgaError::arg(format!("cannot open {fname}: {e}")))?;
        let reader = std::io::BufReader::new(f);

        let mut ne = 0usize;
        let mut cur_batch_count = self.batch_count;
        for line in reader.lines() {
            if self.p.ctx().shutdown_requested() {
                tracing::info!("shutting down");
                return Ok(());
            }
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('%') || line.starts_with('#') {
                continue;
            }

            let (e, insert) = parse_edge(line, el)?;
            if self.batch {
                if insert {
                    self.queue_edge(e);
                } else {
                    self.change_edge(e, false)?;
                }
            } else {
                self.change_edge(e, insert)?;
            }

            ne += 1;
            if ne % 10_000_000 == 0 {
                tracing::info!(ne, "streamed");
            }

            if self.wait && self.mb > 0 && ne % self.mb == 0 {
                if self.batch {
                    self.send_batch()?;
                }
                self.wait_for_sync(cur_batch_count)?;
                cur_batch_count = self.batch_count;
            }
        }

        if self.batch {
            self.send_batch()?;
            tracing::info!(ne, "sent batch");
        }
        if self.wait && (self.mb == 0 || ne % self.mb != 0) {
            self.wait_for_sync(cur_batch_count)?;
        }
        Ok(())
    }

    /// Stream `m / p` uniform random edges over the rank-`r` slice of a
    /// `n`-vertex id space.
    pub fn rg(&mut self, n: u64, m: u64, r: u32, parts: u32) -> ElgaResult<()> {
        let parts = parts.max(1) as u64;
        let r = r as u64;
        let mut my_e = m / parts;
        if r == parts - 1 {
            my_e += m % parts;
        }

        let my_n_start = r * (n / parts);
        let my_n_end = if r == parts - 1 { n } else { (r + 1) * (n / parts) } - 1;

        tracing::info!(
            edges = my_e,
            from = my_n_start,
            to = my_n_end,
            "generating random edges"
        );

        let mut chosen: HashSet<Edge> = HashSet::new();
        let mut rng = rand::thread_rng();
        for cur in 0..my_e {
            let mut e;
            let mut tries = 0;
            loop {
                if tries > 100 {
                    return Err(ElgaError::arg("use a better random graph model"));
                }
                tries += 1;
                e = Edge::new(
                    rng.gen_range(my_n_start..=my_n_end),
                    rng.gen_range(0..n),
                );
                if e.src != e.dst && !chosen.contains(&e) {
                    break;
                }
            }
            chosen.insert(e);
            self.change_edge(e, true)?;

            if cur % 1_000_000 == 0 {
                tracing::info!(cur, "generated");
            }
        }
        Ok(())
    }

    /// Read batches of `(src, dst)` words off the network address and
    /// dispatch them. Each frame is a sequence of u64 pairs, terminated by
    /// a single `0` word.
    pub fn listen(&mut self, listen_addr: &str) -> ElgaResult<()> {
        let hostport = listen_addr.strip_prefix("tcp://").unwrap_or(listen_addr);
        let listener = std::net::TcpListener::bind(hostport)?;
        listener.set_nonblocking(true)?;
        tracing::info!(%hostport, "listening for edges");

        let ctx = self.p.ctx();
        let (tx, rx) = crossbeam_channel::unbounded::<bytes::Bytes>();

        let accept_ctx = ctx.clone();
        let accept = std::thread::spawn(move || {
            while !accept_ctx.shutdown_requested() {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let tx = tx.clone();
                        let ctx = accept_ctx.clone();
                        std::thread::spawn(move || {
                            let mut stream = stream;
                            while !ctx.shutdown_requested() {
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
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(_) => break,
                }
            }
        });

        let mut ne = 0usize;
        let mut ctr = 0usize;
        while !ctx.shutdown_requested() {
            match rx.recv_timeout(Duration::from_millis(
                ctx.tunables.poll_timeout_ms,
            )) {
                Ok(frame) => {
                    let words = Unpacker::new(&frame).u64_rest()?;
                    let added = self.parse_incoming_batch(&words)?;
                    ne += added;
                    ctr += added;
                    if self.batch && self.batch_size >= ctx.tunables.mid_batch_size {
                        self.send_batch()?;
                        tracing::info!(ne, "sent mid-batch");
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if ctr > 0 {
                        // The queue drained: this is the end of a batch.
                        tracing::info!(batch = ctr, total = ne, "batch finished");
                        if self.batch {
                            self.send_batch()?;
                        }
                        ctr = 0;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::info!(total = ne, "listener done");
        let _ = accept.join();
        Ok(())
    }

    /// Parse one network batch; returns the number of edges streamed.
    pub fn parse_incoming_batch(&mut self, words: &[u64]) -> ElgaResult<usize> {
        let mut ne = 0usize;
        let mut idx = 0usize;
        while idx < words.len() {
            if self.p.ctx().shutdown_requested() {
                return Ok(ne);
            }
            if idx + 1 == words.len() {
                if words[idx] == 0 {
                    return Ok(ne);
                }
                return Err(ElgaError::protocol("dangling word in edge batch"));
            }
            let e = Edge::new(words[idx], words[idx + 1]);
            idx += 2;

            if self.batch {
                self.queue_edge(e);
            } else {
                self.change_edge(e, true)?;
            }
            ne += 1;
        }
        Ok(ne)
    }
}

impl Role for Streamer {
    fn participant(&mut self) -> &mut Participant {
        &mut self.p
    }

    fn handle_msg(
        &mut self,
        kind: MsgKind,
        body: &[u8],
        _replier: Option<&Replier>,
    ) -> ElgaResult<bool> {
        if let MsgKind::Sync = kind {
            if self.wait {
                let dormant = Unpacker::new(body).u64()?;
                if dormant == 0 {
                    self.batch_count += 1;
                }
            }
        }
        Ok(true)
    }
}

/// Parse one input line: either a plain `src dst` edge-list line, or the
/// signed `±1 src dst weight ts` change format (weight and timestamp are
/// accepted and ignored).
pub fn parse_edge(line: &str, el: bool) -> ElgaResult<(Edge, bool)> {
    let mut it = line.split_whitespace();
    let mut next = |what: &str| {
        it.next()
            .ok_or_else(|| ElgaError::arg(format!("missing {what} in edge line: {line}")))
    };

    if el {
        let src: Vertex = next("src")?
            .parse()
            .map_err(|_| ElgaError::arg(format!("bad src in edge line: {line}")))?;
        let dst: Vertex = next("dst")?
            .parse()
            .map_err(|_| ElgaError::arg(format!("bad dst in edge line: {line}")))?;
        Ok((Edge::new(src, dst), true))
    } else {
        let flag: i64 = next("change flag")?
            .parse()
            .map_err(|_| ElgaError::arg(format!("bad change flag in edge line: {line}")))?;
        if flag != 1 && flag != -1 {
            return Err(ElgaError::arg(
                "insert/delete flag must be first entry in line",
            ));
        }
        let src: Vertex = next("src")?
            .parse()
            .map_err(|_| ElgaError::arg(format!("bad src in edge line: {line}")))?;
        let dst: Vertex = next("dst")?
            .parse()
            .map_err(|_| ElgaError::arg(format!("bad dst in edge line: {line}")))?;
        let _weight: f64 = next("weight")?
            .parse()
            .map_err(|_| ElgaError::arg(format!("bad weight in edge line: {line}")))?;
        let _ts: u64 = next("timestamp")?
            .parse()
            .map_err(|_| ElgaError::arg(format!("bad timestamp in edge line: {line}")))?;
        Ok((Edge::new(src, dst), flag > 0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_plain_edge_lines() {
        let (e, ins) = parse_edge("3 9", true).unwrap();
        assert_eq!(Edge::new(3, 9), e);
        assert!(ins);
        assert!(parse_edge("3", true).is_err());
        assert!(parse_edge("a b", true).is_err());
    }

    #[test]
    fn parses_signed_change_lines() {
        let (e, ins) = parse_edge("1 10 20 0.5 1234", false).unwrap();
        assert_eq!(Edge::new(10, 20), e);
        assert!(ins);

        let (e, ins) = parse_edge("-1 10 20 0.5 1234", false).unwrap();
        assert_eq!(Edge::new(10, 20), e);
        assert!(!ins);

        assert!(parse_edge("2 10 20 0.5 1234", false).is_err());
        assert!(parse_edge("1 10 20", false).is_err());
    }
}
