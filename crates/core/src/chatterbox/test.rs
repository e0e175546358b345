use super::*;
use elga_api::Tunables;

fn ctx_with_ports(start_port: u16) -> ProcessCtx {
    let mut t = Tunables::testing();
    t.ports.start_port = start_port;
    ProcessCtx::new(t, 0, 16)
}

fn addr(local: u16) -> Address {
    Address::parse("127.0.0.1", local).unwrap()
}

fn poll_until(
    cb: &Chatterbox,
    deadline: Duration,
    mut want: impl FnMut(&Incoming) -> bool,
) -> Option<Incoming> {
    let start = Instant::now();
    while start.elapsed() < deadline {
        for m in cb.poll(Duration::from_millis(50)) {
            if want(&m) {
                return Some(m);
            }
        }
    }
    None
}

#[test]
fn request_reply_in_process() {
    let ctx = ctx_with_ports(21000);
    let server = Chatterbox::bind(&ctx, addr(0)).unwrap();

    let server_ctx = ctx.clone();
    let th = std::thread::spawn(move || {
        // Echo the first request back, doubled.
        let m = poll_until(&server, Duration::from_secs(5), |m| {
            matches!(m, Incoming::Request(..))
        });
        if let Some(Incoming::Request(data, replier)) = m {
            let mut out = data.to_vec();
            out.extend_from_slice(&data);
            replier.reply(Bytes::from(out)).unwrap();
        }
        drop(server);
        server_ctx.request_shutdown();
    });

    let me = addr(1);
    let mut req = Requester::connect(&ctx, &me, addr(0), SocketKind::Request).unwrap();
    req.send(Bytes::from_static(b"hi")).unwrap();
    assert_eq!(&b"hihi"[..], &req.read().unwrap()[..]);

    th.join().unwrap();
}

#[test]
fn request_reply_over_tcp() {
    let ctx = ctx_with_ports(24000);
    let server = Chatterbox::bind(&ctx, addr(0)).unwrap();

    let th = std::thread::spawn(move || {
        let m = poll_until(&server, Duration::from_secs(5), |m| {
            matches!(m, Incoming::Request(..))
        });
        if let Some(Incoming::Request(data, replier)) = m {
            replier.reply(data).unwrap();
        }
        drop(server);
    });

    // A zero address is outside every local range, so this goes over TCP.
    let me = Address::default();
    let mut req = Requester::connect(&ctx, &me, addr(0), SocketKind::Request).unwrap();
    req.send(Bytes::from_static(b"over tcp")).unwrap();
    assert_eq!(&b"over tcp"[..], &req.read().unwrap()[..]);

    th.join().unwrap();
    ctx.request_shutdown();
}

#[test]
fn push_pull_in_process() {
    let ctx = ctx_with_ports(27000);
    let sink = Chatterbox::bind(&ctx, addr(2)).unwrap();

    let mut req = Requester::connect(&ctx, &addr(3), addr(2), SocketKind::Pull).unwrap();
    req.send(Bytes::from_static(b"one")).unwrap();
    req.send(Bytes::from_static(b"two")).unwrap();

    // Per-sender ordering is preserved.
    let m = poll_until(&sink, Duration::from_secs(5), |m| matches!(m, Incoming::Push(_)));
    match m {
        Some(Incoming::Push(b)) => assert_eq!(&b"one"[..], &b[..]),
        other => panic!("expected push, got {other:?}"),
    }
    let m = poll_until(&sink, Duration::from_secs(5), |m| matches!(m, Incoming::Push(_)));
    match m {
        Some(Incoming::Push(b)) => assert_eq!(&b"two"[..], &b[..]),
        other => panic!("expected push, got {other:?}"),
    }
    ctx.request_shutdown();
}

#[test]
fn pub_sub_filters_on_leading_bytes() {
    let ctx = ctx_with_ports(30000);
    let publisher = Chatterbox::bind(&ctx, addr(4)).unwrap();
    let mut subscriber = Chatterbox::bind(&ctx, addr(5)).unwrap();

    subscriber.sub_filter(&[0x10]).unwrap();
    // Two-byte filter: only "changed" directory updates.
    subscriber.sub_filter(&[0x09, 0x01]).unwrap();
    subscriber.sub_connect(addr(4)).unwrap();

    publisher.publish(Bytes::from_static(&[0x11, 9])); // not subscribed
    publisher.publish(Bytes::from_static(&[0x09, 0x00, 7])); // filtered out
    publisher.publish(Bytes::from_static(&[0x10, 1]));
    publisher.publish(Bytes::from_static(&[0x09, 0x01, 8]));

    let m = poll_until(&subscriber, Duration::from_secs(5), |m| {
        matches!(m, Incoming::Publication(_))
    });
    match m {
        Some(Incoming::Publication(b)) => assert_eq!(&[0x10, 1][..], &b[..]),
        other => panic!("expected publication, got {other:?}"),
    }
    let m = poll_until(&subscriber, Duration::from_secs(5), |m| {
        matches!(m, Incoming::Publication(_))
    });
    match m {
        Some(Incoming::Publication(b)) => assert_eq!(&[0x09, 0x01, 8][..], &b[..]),
        other => panic!("expected publication, got {other:?}"),
    }

    // After unsubscribing nothing more arrives.
    subscriber.unsub_filter(&[0x10]).unwrap();
    publisher.publish(Bytes::from_static(&[0x10, 2]));
    assert!(poll_until(&subscriber, Duration::from_millis(300), |m| {
        matches!(m, Incoming::Publication(_))
    })
    .is_none());

    ctx.request_shutdown();
}

#[test]
fn pub_sub_over_tcp() {
    let ctx = ctx_with_ports(33000);
    let publisher = Chatterbox::bind(&ctx, addr(6)).unwrap();

    // A second context makes the subscriber a "remote" peer even though it
    // shares the process: lookups miss the publisher's exchange and fall
    // back to TCP.
    let mut remote_t = Tunables::testing();
    remote_t.ports.start_port = 33000;
    let remote_ctx = ProcessCtx::new(remote_t, 7, 8);
    let mut subscriber = Chatterbox::bind(&remote_ctx, addr(7)).unwrap();

    subscriber.sub(MsgKind::Sync).unwrap();
    subscriber.sub_connect(addr(6)).unwrap();

    // The control frame races the first publications, so publish until
    // one lands.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut got = None;
    while Instant::now() < deadline && got.is_none() {
        publisher.publish(Bytes::from_static(&[MsgKind::Sync as u8, 0]));
        got = poll_until(&subscriber, Duration::from_millis(100), |m| {
            matches!(m, Incoming::Publication(_))
        });
    }
    match got {
        Some(Incoming::Publication(b)) => assert_eq!(MsgKind::Sync as u8, b[0]),
        other => panic!("expected publication, got {other:?}"),
    }

    ctx.request_shutdown();
    remote_ctx.request_shutdown();
}

#[test]
fn heartbeat_is_rate_limited() {
    let mut t = Tunables::testing();
    t.ports.start_port = 36000;
    t.heartbeat_us = 200_000;
    let ctx = ProcessCtx::new(t, 0, 16);
    let mut cb = Chatterbox::bind(&ctx, addr(8)).unwrap();

    assert!(cb.heartbeat(false));
    assert!(!cb.heartbeat(false));
    std::thread::sleep(Duration::from_millis(250));
    assert!(cb.heartbeat(false));
    ctx.request_shutdown();
}

#[test]
fn zero_address_binds_nothing_but_can_request() {
    let ctx = ctx_with_ports(39000);
    let server = Chatterbox::bind(&ctx, addr(9)).unwrap();
    let client = Chatterbox::bind(&ctx, Address::default()).unwrap();
    assert!(client.addr().is_zero());

    let th = std::thread::spawn(move || {
        let m = poll_until(&server, Duration::from_secs(5), |m| {
            matches!(m, Incoming::Request(..))
        });
        if let Some(Incoming::Request(_, replier)) = m {
            replier.ack().unwrap();
        }
        drop(server);
    });

    let me = client.addr();
    let mut req = Requester::connect(&ctx, &me, addr(9), SocketKind::Request).unwrap();
    req.send_kind(MsgKind::Heartbeat).unwrap();
    req.wait_ack().unwrap();

    th.join().unwrap();
    ctx.request_shutdown();
}
