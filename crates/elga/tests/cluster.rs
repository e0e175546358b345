//! End-to-end cluster tests: a directory master, directories, agents,
//! a streamer, and a client, all inside one process.

use elga_api::{Address, AlgorithmKind, Discipline, Edge, MsgKind, Tunables};
use elga_core::chatterbox::{Chatterbox, Incoming};
use elga_core::participant::{self, Role};
use elga_core::{agent, Client, Directory, DirectoryMaster, ProcessCtx, Streamer};
use std::time::{Duration, Instant};

const LOCAL_MAX: u16 = 16;

fn addr(local: u16) -> Address {
    Address::parse("127.0.0.1", local).unwrap()
}

struct Cluster {
    ctx: ProcessCtx,
    threads: Vec<(String, std::thread::JoinHandle<elga_api::ElgaResult<()>>)>,
}

impl Cluster {
    /// Start a directory master (local 0) and one directory (local 1).
    fn new(mut t: Tunables) -> Self {
        t.poll_timeout_ms = 50;
        t.heartbeat_us = 30_000;
        let ctx = ProcessCtx::new(t, 0, LOCAL_MAX);

        let mut c = Self {
            ctx: ctx.clone(),
            threads: Vec::new(),
        };

        let dm_ctx = ctx.clone();
        c.spawn("directory-master", move || {
            let mut m = DirectoryMaster::new(&dm_ctx, addr(0))?;
            m.run()
        });

        let dir_ctx = ctx.clone();
        c.spawn("directory", move || {
            let mut d = Directory::new(&dir_ctx, addr(1), addr(0))?;
            d.join_directory()?;
            d.join_peers()?;
            d.run()
        });

        c
    }

    fn spawn(
        &mut self,
        name: &str,
        f: impl FnOnce() -> elga_api::ElgaResult<()> + Send + 'static,
    ) {
        self.threads.push((name.to_string(), std::thread::spawn(f)));
    }

    fn spawn_agent(&mut self, local: u16) {
        let ctx = self.ctx.clone();
        self.spawn(&format!("agent-{local}"), move || {
            agent::run_configured(&ctx, addr(local), addr(0))
        });
    }

    /// An observer subscribed to the directory's broadcasts.
    fn observer(&self, local: u16, kinds: &[MsgKind]) -> Chatterbox {
        let mut cb = Chatterbox::bind(&self.ctx, addr(local)).unwrap();
        for &k in kinds {
            cb.sub(k).unwrap();
        }
        cb.sub_connect(addr(1)).unwrap();
        cb
    }

    /// Wait until the streamer's directory snapshot names `n` agents.
    fn streamer_with_agents(&self, n: usize) -> Streamer {
        let mut s = Streamer::new(&self.ctx, addr(0)).unwrap();
        s.wait_until_ready().unwrap();
        let deadline = Instant::now() + Duration::from_secs(20);
        while s.participant().num_agents() < n {
            assert!(Instant::now() < deadline, "agents never joined");
            participant::poll_step(&mut s, false).unwrap();
        }
        s
    }

    /// Shut everything down and verify no component died with an error.
    fn finish(mut self) {
        let mut client = Client::new(&self.ctx, addr(0)).unwrap();
        client.query(MsgKind::Shutdown).unwrap();

        // The shutdown broadcast fans out; give stragglers a flag too.
        std::thread::sleep(Duration::from_millis(200));
        self.ctx.request_shutdown();

        for (name, th) in self.threads.drain(..) {
            match th.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => panic!("{name} failed: {e}"),
                Err(_) => panic!("{name} panicked"),
            }
        }
    }
}

fn query_u64(client: &mut Client, v: u64) -> u64 {
    let resp = client.query_vertex(v).unwrap();
    assert_eq!(8, resp.len());
    u64::from_le_bytes(resp[..].try_into().unwrap())
}

fn query_f64(client: &mut Client, v: u64) -> f64 {
    let resp = client.query_vertex(v).unwrap();
    assert_eq!(8, resp.len());
    f64::from_le_bytes(resp[..].try_into().unwrap())
}

#[test]
fn star_graph_converges_under_wcc() {
    let mut t = Tunables::testing();
    t.ports.start_port = 48000;
    t.algorithm = AlgorithmKind::Wcc;
    t.discipline = Discipline::Lbsp;
    let mut cluster = Cluster::new(t);
    cluster.spawn_agent(2);

    let observer = cluster.observer(6, &[MsgKind::Nv, MsgKind::Sync]);

    // Stream the star and let the ingest settle before starting.
    let mut s = cluster.streamer_with_agents(1);
    s.set_batch(false);
    for dst in 1..=4u64 {
        s.change_edge(Edge::new(0, dst), true).unwrap();
    }
    std::thread::sleep(Duration::from_millis(300));

    let mut client = Client::new(&cluster.ctx, addr(0)).unwrap();
    client.query(MsgKind::Start).unwrap();

    // The directory's size broadcast reports five vertices, four edges.
    let mut nv = None;
    let mut zero_syncs = 0;
    let deadline = Instant::now() + Duration::from_secs(30);
    while (nv.is_none() || zero_syncs == 0) && Instant::now() < deadline {
        for m in observer.poll(Duration::from_millis(50)) {
            if let Incoming::Publication(b) = m {
                let mut u = elga_api::Unpacker::new(&b[1..]);
                match MsgKind::from_u8(b[0]).unwrap() {
                    MsgKind::Nv => nv = Some((u.u64().unwrap(), u.u64().unwrap())),
                    MsgKind::Sync => {
                        if u.u64().unwrap() == 0 {
                            zero_syncs += 1;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    assert_eq!(Some((5, 4)), nv, "global graph size");
    assert_eq!(1, zero_syncs, "the batch ends with exactly one zero sync");

    // Every vertex ends in component 0.
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let done = (0..=4u64).all(|v| query_u64(&mut client, v) == 0);
        if done {
            break;
        }
        assert!(Instant::now() < deadline, "wcc never converged");
        std::thread::sleep(Duration::from_millis(100));
    }

    cluster.finish();
}

#[test]
fn two_agent_pagerank_runs_to_fixpoint() {
    let mut t = Tunables::testing();
    t.ports.start_port = 52000;
    t.algorithm = AlgorithmKind::Pagerank;
    t.discipline = Discipline::Bsp;
    t.pagerank_supersteps = 15;
    let mut cluster = Cluster::new(t);
    cluster.spawn_agent(2);
    cluster.spawn_agent(3);

    // A star plus a back edge from the first leaf, so every vertex is
    // reachable from an IN edge and the global size is exact up front.
    let mut s = cluster.streamer_with_agents(2);
    s.set_batch(false);
    for dst in 1..=4u64 {
        s.change_edge(Edge::new(0, dst), true).unwrap();
    }
    s.change_edge(Edge::new(1, 0), true).unwrap();
    std::thread::sleep(Duration::from_millis(300));

    let mut client = Client::new(&cluster.ctx, addr(0)).unwrap();
    client.query(MsgKind::Start).unwrap();

    // Fixpoint of pr0 = t + 0.85*pr1, pr1 = t + 0.85*pr0/4, t = 0.15/5.
    let t = 0.15 / 5.0;
    let hub = (t + 0.85 * t) / (1.0 - 0.85 * 0.85 / 4.0);
    let leaf = t + 0.85 * hub / 4.0;

    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let hub_ok = (query_f64(&mut client, 0) - hub).abs() < 1e-9;
        let leaves_ok =
            (1..=4u64).all(|v| (query_f64(&mut client, v) - leaf).abs() < 1e-9);
        if hub_ok && leaves_ok {
            break;
        }
        assert!(Instant::now() < deadline, "pagerank never converged");
        std::thread::sleep(Duration::from_millis(100));
    }

    cluster.finish();
}

#[test]
fn resize_rehomes_edges_and_passes_the_transpose_check() {
    let save_dir = tempfile::tempdir().unwrap();
    let mut t = Tunables::testing();
    t.ports.start_port = 56000;
    t.algorithm = AlgorithmKind::Wcc;
    t.discipline = Discipline::Lbsp;
    t.save_dir = save_dir.path().to_path_buf();
    let mut cluster = Cluster::new(t);
    cluster.spawn_agent(2);
    cluster.spawn_agent(3);

    let mut s = cluster.streamer_with_agents(2);
    s.set_batch(true);
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    {
        use std::io::Write;
        for i in 0..100u64 {
            writeln!(tmp, "{} {}", i, i + 1).unwrap();
        }
        tmp.flush().unwrap();
    }
    s.parse_file(tmp.path().to_str().unwrap(), true).unwrap();
    std::thread::sleep(Duration::from_millis(300));

    let mut client = Client::new(&cluster.ctx, addr(0)).unwrap();
    client.query(MsgKind::Start).unwrap();

    // The chain collapses to component 0 once the batch completes.
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let done = [0u64, 13, 50, 100]
            .iter()
            .all(|&v| query_u64(&mut client, v) == 0);
        if done {
            break;
        }
        assert!(Instant::now() < deadline, "wcc never converged");
        std::thread::sleep(Duration::from_millis(100));
    }

    // A third agent joins; the next changed directory snapshot makes the
    // originals re-home whatever they no longer own. The probe streamer
    // just waits for the membership change to propagate.
    cluster.spawn_agent(4);
    let _probe = cluster.streamer_with_agents(3);
    std::thread::sleep(Duration::from_secs(3));

    // The transpose must still hold; a failure is fatal in the agents and
    // would surface when the cluster shuts down.
    client.query(MsgKind::ChkT).unwrap();
    std::thread::sleep(Duration::from_secs(1));

    // Dump the shards and confirm no edge was lost in the move.
    client.query(MsgKind::Dump).unwrap();
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let mut total = 0usize;
        let mut files = 0usize;
        if let Ok(entries) = std::fs::read_dir(save_dir.path()) {
            for e in entries.flatten() {
                let name = e.file_name().to_string_lossy().into_owned();
                if name.ends_with(".el.dump") {
                    files += 1;
                    total += std::fs::read_to_string(e.path())
                        .map(|s| s.lines().count())
                        .unwrap_or(0);
                }
            }
        }
        if files == 3 && total == 100 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "expected 100 edges over 3 dumps, saw {total} over {files}"
        );
        std::thread::sleep(Duration::from_millis(100));
    }

    cluster.finish();
}
