use super::*;
use crate::algorithms::Wcc;
use crate::chatterbox::{Chatterbox, Incoming, Requester};
use crate::directory::Directory;
use crate::directory_master::DirectoryMaster;
use crate::participant::Role;
use elga_api::{SocketKind, Tunables};
use std::time::Duration;

/// A live directory master and one directory, enough for agents to come
/// up and send their control traffic somewhere real.
struct Harness {
    ctx: ProcessCtx,
    dm: std::thread::JoinHandle<ElgaResult<()>>,
    dir: std::thread::JoinHandle<ElgaResult<()>>,
}

impl Harness {
    fn new(start_port: u16) -> Self {
        let mut t = Tunables::testing();
        t.ports.start_port = start_port;
        t.discipline = elga_api::Discipline::Lbsp;
        t.algorithm = elga_api::AlgorithmKind::Wcc;
        let ctx = ProcessCtx::new(t, 0, 8);

        let dm_addr = Address::parse("127.0.0.1", 0).unwrap();
        let dir_addr = Address::parse("127.0.0.1", 3).unwrap();

        let dm_ctx = ctx.clone();
        let dm = std::thread::spawn(move || {
            let mut m = DirectoryMaster::new(&dm_ctx, dm_addr)?;
            m.run()
        });

        let dir_ctx = ctx.clone();
        let dir = std::thread::spawn(move || {
            let mut d = Directory::new(&dir_ctx, dir_addr, dm_addr)?;
            d.join_directory()?;
            d.join_peers()?;
            d.run()
        });

        // Wait until the directory has registered.
        let probe = Address::parse("127.0.0.1", 4).unwrap();
        let mut req = Requester::connect(&ctx, &probe, dm_addr, SocketKind::Request).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            req.send_kind(MsgKind::GetDirectories).unwrap();
            if !req.read().unwrap().is_empty() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "directory never joined");
            std::thread::sleep(Duration::from_millis(20));
        }

        Self { ctx, dm, dir }
    }

    fn agent(&self, local: u16) -> Agent<Wcc> {
        let addr = Address::parse("127.0.0.1", local).unwrap();
        let dm = Address::parse("127.0.0.1", 0).unwrap();
        Agent::new(&self.ctx, addr, dm).unwrap()
    }

    fn finish(self) {
        self.ctx.request_shutdown();
        self.dm.join().unwrap().unwrap();
        self.dir.join().unwrap().unwrap();
    }
}

/// Install a directory naming the given serials as single-vagent agents.
fn install(agent: &mut Agent<Wcc>, serials: &[u64]) {
    let mut p = Packer::new();
    for &s in serials {
        p.u64(pack_vagent(s, 1));
    }
    let body = p.freeze();
    agent.participant().directory_update(&body).unwrap();
}

#[test]
fn change_edge_counts_vertices_and_in_edges() {
    let h = Harness::new(45000);
    let mut a = h.agent(1);
    let me = a.serial;
    install(&mut a, &[me]);

    a.change_edge(Update::new(Edge::new(1, 2), Dir::In, true), true).unwrap();
    a.change_edge(Update::new(Edge::new(3, 2), Dir::In, true), true).unwrap();
    assert_eq!(1, a.nv);
    assert_eq!(2, a.ne);
    assert_eq!(2, a.update_ne);
    assert!(a.update_nv_set.contains(&2));

    // An OUT edge creates its own vertex but counts no edge.
    a.change_edge(Update::new(Edge::new(2, 9), Dir::Out, true), true).unwrap();
    assert_eq!(1, a.nv);
    assert_eq!(2, a.ne);
    assert_eq!(vec![9], a.graph[&2].out_neighbors);

    // Deleting the last neighbors removes the vertex.
    a.change_edge(Update::new(Edge::new(1, 2), Dir::In, false), true).unwrap();
    a.change_edge(Update::new(Edge::new(3, 2), Dir::In, false), true).unwrap();
    a.change_edge(Update::new(Edge::new(2, 9), Dir::Out, false), true).unwrap();
    assert_eq!(0, a.nv);
    assert_eq!(0, a.ne);
    assert!(!a.graph.contains_key(&2));

    h.finish();
}

#[test]
fn misowned_edges_queue_for_movement() {
    let h = Harness::new(45100);
    let mut a = h.agent(1);
    let other = Address::parse("127.0.0.1", 7).unwrap().serial();
    install(&mut a, &[other]);

    a.change_edge(Update::new(Edge::new(1, 2), Dir::In, true), true).unwrap();
    assert!(a.graph.is_empty());
    assert_eq!(1, a.moves[&other].len());

    h.finish();
}

#[test]
fn replayed_updates_are_idempotent_in_the_update_set() {
    let h = Harness::new(45200);
    let mut a = h.agent(1);
    let me = a.serial;
    install(&mut a, &[me]);

    let u = Update::new(Edge::new(4, 5), Dir::In, true);
    a.update_set.insert(u);
    a.update_set.insert(u);
    assert_eq!(1, a.update_set.len());

    h.finish();
}

#[test]
fn transpose_check_catches_missing_edges() {
    let h = Harness::new(45300);
    let mut a = h.agent(1);
    let me = a.serial;
    install(&mut a, &[me]);

    a.change_edge(Update::new(Edge::new(1, 2), Dir::Out, true), true).unwrap();
    assert!(a.check_out_edge(&Update::new(Edge::new(1, 2), Dir::Out, true)).is_ok());
    assert!(a.check_out_edge(&Update::new(Edge::new(1, 3), Dir::Out, true)).is_err());
    assert!(a.check_out_edge(&Update::new(Edge::new(8, 3), Dir::Out, true)).is_err());

    h.finish();
}

#[test]
fn out_edge_generation_dedups_multi_edges() {
    let h = Harness::new(45400);
    let mut a = h.agent(1);
    let me = a.serial;
    install(&mut a, &[me]);

    // The same IN edge streamed twice leaves a multiset entry.
    a.change_edge(Update::new(Edge::new(1, 2), Dir::In, true), true).unwrap();
    a.change_edge(Update::new(Edge::new(1, 2), Dir::In, true), true).unwrap();
    assert_eq!(2, a.ne);

    a.send_out_edges(false).unwrap();

    // Deduplicated, with the symmetric OUT edge applied locally.
    assert_eq!(1, a.ne);
    assert_eq!(vec![1], a.graph[&2].in_neighbors);
    assert_eq!(vec![2], a.graph[&1].out_neighbors);

    h.finish();
}

#[test]
fn sync_outside_the_barrier_is_fatal() {
    let h = Harness::new(45500);
    let mut a = h.agent(1);
    let me = a.serial;
    install(&mut a, &[me]);

    let mut p = Packer::new();
    p.u64(0);
    let body = p.freeze();
    assert!(a.handle_sync(&body).is_err());

    h.finish();
}

#[test]
fn directory_change_rehomes_edges() {
    let h = Harness::new(45600);
    let mut a = h.agent(1);
    let me = a.serial;
    install(&mut a, &[me]);

    for i in 0..50u64 {
        a.change_edge(Update::new(Edge::new(i, i + 1), Dir::In, true), true).unwrap();
        a.change_edge(Update::new(Edge::new(i, i + 1), Dir::Out, true), true).unwrap();
    }
    assert_eq!(50, a.ne);

    // A second agent appears; some edges must leave. Bind a sink at its
    // address so the movement batches have somewhere to go.
    let other_addr = Address::parse("127.0.0.1", 2).unwrap();
    let other = other_addr.serial();
    let sink = Chatterbox::bind(&h.ctx, other_addr).unwrap();
    install(&mut a, &[me, other]);

    a.handle_directory_update().unwrap();

    let kept_in: usize = a.graph.values().map(|g| g.in_neighbors.len()).sum();
    let kept_out: usize = a.graph.values().map(|g| g.out_neighbors.len()).sum();
    assert!(kept_in + kept_out < 100, "a ring change must re-home something");
    assert_eq!(kept_in as u64, a.ne);
    assert_eq!(AgentState::WaitEdgeMove, a.state);
    assert_eq!(1, a.update_acks_needed);

    // The moved edges arrive at the sink as one move-flagged batch.
    let mut got = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while got.is_empty() && std::time::Instant::now() < deadline {
        for m in sink.poll(Duration::from_millis(50)) {
            if let Incoming::Push(b) = m {
                got.push(b);
            }
        }
    }
    let frame = got.first().expect("movement batch");
    assert_eq!(MsgKind::SendUpdates as u8, frame[0]);
    assert_eq!(FLAG_MOVE_EDGES, frame[1]);
    let mut u = Unpacker::new(&frame[2..]);
    assert_eq!(me, u.u64().unwrap());
    let moved = u.update_rest().unwrap();
    assert_eq!(100, moved.len() + kept_in + kept_out, "no edges lost");

    h.finish();
}
