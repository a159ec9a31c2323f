//! TCP sockets driven through a live engine over loopback.

mod common;

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use common::{count, errors, pump_for, pump_until, received, record};
use sockbridge::{
    CallbackEvent, Engine, EngineConfig, EngineError, ErrorKind, EventKind, IoMode, Protocol,
    SocketOption,
};

const FRAME: &[u8] = b"\x00abc\x00def\x01\x02\x03\x04";

/// A listening engine socket on an ephemeral loopback port.
fn listener(engine: &Engine) -> (sockbridge::SocketId, u16) {
    let id = engine.create(Protocol::Tcp);
    engine.bind(id, "127.0.0.1", 0, IoMode::Blocking).unwrap();
    engine.listen(id).unwrap();
    let port = engine.local_addr(id).unwrap().port();
    (id, port)
}

#[test]
fn test_round_trip_keeps_embedded_nul_bytes() {
    common::init();
    let engine = Engine::new().unwrap();
    let (server, port) = listener(&engine);
    engine
        .register_handler(server, EventKind::Accepted, |engine, _, event| {
            if let CallbackEvent::Accepted { child, .. } = event {
                engine.send(*child, FRAME, IoMode::Async).unwrap();
            }
        })
        .unwrap();

    let client = engine.create(Protocol::Tcp);
    let log = record(&engine, client, &[EventKind::Connected, EventKind::DataReceived]);
    engine.connect(client, "127.0.0.1", port, IoMode::Async).unwrap();

    assert!(pump_until(&engine, || received(&log).len() >= FRAME.len()));
    assert_eq!(received(&log), FRAME);
    assert_eq!(count(&log, EventKind::Connected), 1);
    assert!(engine.is_connected(client));
    assert_eq!(engine.peer_addr(client).map(|a| a.port()), Some(port));
}

#[test]
fn test_one_accepted_event_per_connection() {
    let engine = Engine::new().unwrap();
    let (server, port) = listener(&engine);
    let log = record(&engine, server, &[EventKind::Accepted]);

    let peers: Vec<TcpStream> = (0..3)
        .map(|_| TcpStream::connect(("127.0.0.1", port)).unwrap())
        .collect();
    assert!(pump_until(&engine, || count(&log, EventKind::Accepted) == 3));

    // Children are registered sockets of their own
    assert_eq!(engine.socket_count(), 4);
    let children: Vec<_> = log
        .lock()
        .iter()
        .filter_map(|e| match e {
            CallbackEvent::Accepted { child, remote } => Some((*child, *remote)),
            _ => None,
        })
        .collect();
    for (child, remote) in children {
        assert_eq!(engine.protocol(child), Some(Protocol::Tcp));
        assert_eq!(engine.peer_addr(child), Some(remote));
        assert!(engine.is_connected(child));
    }

    // The listener is gone: no further accepts
    engine.destroy(server).unwrap();
    let _late = TcpStream::connect(("127.0.0.1", port));
    pump_for(&engine, Duration::from_millis(200));
    assert_eq!(count(&log, EventKind::Accepted), 3);
    drop(peers);
}

#[test]
fn test_accepted_child_reads_peer_data() {
    let engine = Engine::new().unwrap();
    let (server, port) = listener(&engine);
    let child_log: common::Log = Arc::default();
    let sink = Arc::clone(&child_log);
    engine
        .register_handler(server, EventKind::Accepted, move |engine, _, event| {
            let CallbackEvent::Accepted { child, .. } = event else {
                return;
            };
            for kind in [EventKind::DataReceived, EventKind::Disconnected] {
                let sink = Arc::clone(&sink);
                engine
                    .register_handler(*child, kind, move |_, _, event| {
                        sink.lock().push(event.clone());
                    })
                    .unwrap();
            }
        })
        .unwrap();

    let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    peer.write_all(FRAME).unwrap();
    assert!(pump_until(&engine, || received(&child_log).len() >= FRAME.len()));
    assert_eq!(received(&child_log), FRAME);

    drop(peer);
    assert!(pump_until(&engine, || count(&child_log, EventKind::Disconnected) == 1));
}

#[test]
fn test_no_events_after_destroy() {
    let engine = Engine::new().unwrap();
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let chatter = thread::spawn(move || {
        let (mut stream, _) = server.accept().unwrap();
        // Keep data flowing until the test is done
        while stop_rx.try_recv().is_err() {
            if stream.write_all(b"tick").is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
    });

    let client = engine.create(Protocol::Tcp);
    let delivered = Arc::new(AtomicUsize::new(0));
    for kind in EventKind::ALL {
        if kind == EventKind::Accepted {
            continue;
        }
        let delivered = Arc::clone(&delivered);
        engine
            .register_handler(client, kind, move |_, _, _| {
                delivered.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    engine.connect(client, "127.0.0.1", port, IoMode::Async).unwrap();
    assert!(pump_until(&engine, || delivered.load(Ordering::SeqCst) >= 3));

    engine.destroy(client).unwrap();
    let at_destroy = delivered.load(Ordering::SeqCst);
    pump_for(&engine, Duration::from_millis(200));
    assert_eq!(delivered.load(Ordering::SeqCst), at_destroy);
    assert!(matches!(
        engine.send(client, b"x", IoMode::Async),
        Err(EngineError::UnknownSocket(_))
    ));

    let _ = stop_tx.send(());
    chatter.join().unwrap();
}

#[test]
fn test_send_queue_drained_once_after_burst() {
    const STALL: usize = 32 * 1024 * 1024;
    const BURST: usize = 10;

    let engine = Engine::new().unwrap();
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let reader = thread::spawn(move || {
        let (mut stream, _) = server.accept().unwrap();
        // Hold off reading so the first send stalls the writer
        go_rx.recv().unwrap();
        let mut total = 0;
        let mut buf = vec![0u8; 64 * 1024];
        while total < STALL + BURST - 1 {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n,
            }
        }
        total
    });

    let client = engine.create(Protocol::Tcp);
    let log = record(&engine, client, &[EventKind::SendQueueDrained, EventKind::Error]);
    engine.connect(client, "127.0.0.1", port, IoMode::Blocking).unwrap();

    engine.send(client, &vec![7u8; STALL], IoMode::Async).unwrap();
    for _ in 1..BURST {
        engine.send(client, b"x", IoMode::Async).unwrap();
    }
    go_tx.send(()).unwrap();

    assert!(pump_until(&engine, || count(&log, EventKind::SendQueueDrained) >= 1));
    pump_for(&engine, Duration::from_millis(200));
    assert_eq!(count(&log, EventKind::SendQueueDrained), 1);
    assert!(errors(&log).is_empty());
    assert_eq!(reader.join().unwrap(), STALL + BURST - 1);
}

#[test]
fn test_no_drained_event_without_sends() {
    let engine = Engine::new().unwrap();
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();

    let client = engine.create(Protocol::Tcp);
    let log = record(&engine, client, &[EventKind::SendQueueDrained, EventKind::Connected]);
    engine.connect(client, "127.0.0.1", port, IoMode::Blocking).unwrap();
    let (_peer, _) = server.accept().unwrap();

    assert!(pump_until(&engine, || count(&log, EventKind::Connected) == 1));
    pump_for(&engine, Duration::from_millis(200));
    assert_eq!(count(&log, EventKind::SendQueueDrained), 0);
}

#[test]
fn test_blocking_send_reaches_peer() {
    let engine = Engine::new().unwrap();
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();

    let client = engine.create(Protocol::Tcp);
    engine.connect(client, "127.0.0.1", port, IoMode::Blocking).unwrap();
    let (mut peer, _) = server.accept().unwrap();

    engine.send(client, FRAME, IoMode::Blocking).unwrap();
    let mut got = [0u8; FRAME.len()];
    peer.read_exact(&mut got).unwrap();
    assert_eq!(&got, FRAME);
}

#[test]
fn test_peer_close_reports_disconnected() {
    let engine = Engine::new().unwrap();
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();

    let client = engine.create(Protocol::Tcp);
    let log = record(&engine, client, &[EventKind::Disconnected]);
    engine.connect(client, "127.0.0.1", port, IoMode::Blocking).unwrap();
    let (peer, _) = server.accept().unwrap();
    drop(peer);

    assert!(pump_until(&engine, || count(&log, EventKind::Disconnected) == 1));
    assert!(!engine.is_connected(client));
}

#[test]
fn test_connect_refused_reports_connect_error() {
    let engine = Engine::new().unwrap();
    let port = portpicker::pick_unused_port().unwrap();
    let client = engine.create(Protocol::Tcp);
    let log = record(&engine, client, &[EventKind::Error, EventKind::Connected]);

    engine.connect(client, "127.0.0.1", port, IoMode::Async).unwrap();
    assert!(pump_until(&engine, || !errors(&log).is_empty()));
    assert_eq!(errors(&log), vec![ErrorKind::ConnectError]);
    assert!(log
        .lock()
        .iter()
        .any(|e| matches!(e, CallbackEvent::Error { code, .. } if *code == libc::ECONNREFUSED)));
    assert_eq!(count(&log, EventKind::Connected), 0);

    let err = engine.connect(client, "127.0.0.1", port, IoMode::Blocking).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ConnectError));
}

#[test]
fn test_option_set_before_bind_is_applied() {
    let engine = Engine::new().unwrap();
    let id = engine.create(Protocol::Tcp);
    engine.set_option(id, SocketOption::ReuseAddr, 1).unwrap();
    // Still queued: answered from the queue
    assert_eq!(engine.get_option(id, SocketOption::ReuseAddr).unwrap(), 1);

    engine.bind(id, "127.0.0.1", 0, IoMode::Blocking).unwrap();
    // Now answered by the descriptor itself
    assert_eq!(engine.get_option(id, SocketOption::ReuseAddr).unwrap(), 1);
}

#[test]
fn test_prefer_flags_are_exclusive() {
    let engine = Engine::new().unwrap();
    let id = engine.create(Protocol::Tcp);
    engine.set_option(id, SocketOption::PreferIpv6, 1).unwrap();
    engine.set_option(id, SocketOption::PreferIpv4, 1).unwrap();
    assert_eq!(engine.get_option(id, SocketOption::PreferIpv4).unwrap(), 1);
    assert_eq!(engine.get_option(id, SocketOption::PreferIpv6).unwrap(), 0);
    assert_eq!(engine.get_option(id, SocketOption::Ipv6Only).unwrap(), 0);
}

#[test]
fn test_ipv6_only_rejects_ipv4_literal() {
    let engine = Engine::new().unwrap();
    let id = engine.create(Protocol::Tcp);
    let log = record(&engine, id, &[EventKind::Error]);
    engine.set_option(id, SocketOption::Ipv6Only, 1).unwrap();

    let err = engine.connect(id, "127.0.0.1", 80, IoMode::Blocking).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NoHost));
    assert!(pump_until(&engine, || errors(&log) == vec![ErrorKind::NoHost]));
}

#[test]
fn test_empty_host_is_reported() {
    let engine = Engine::new().unwrap();
    let id = engine.create(Protocol::Tcp);
    let log = record(&engine, id, &[EventKind::Error]);

    assert!(matches!(
        engine.bind(id, "", 0, IoMode::Blocking),
        Err(EngineError::EmptyHost)
    ));
    assert!(matches!(
        engine.connect(id, "", 80, IoMode::Async),
        Err(EngineError::EmptyHost)
    ));
    assert!(pump_until(&engine, || errors(&log).len() == 2));
    assert!(log
        .lock()
        .iter()
        .all(|e| *e == CallbackEvent::error(ErrorKind::EmptyHost, 0)));
}

#[test]
fn test_listen_requires_bind() {
    let engine = Engine::new().unwrap();
    let id = engine.create(Protocol::Tcp);
    let log = record(&engine, id, &[EventKind::Error]);

    assert!(matches!(engine.listen(id), Err(EngineError::NotBound)));
    assert!(pump_until(&engine, || errors(&log) == vec![ErrorKind::ListenError]));
}

#[test]
fn test_disconnect_is_idempotent() {
    let engine = Engine::new().unwrap();
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();

    let client = engine.create(Protocol::Tcp);
    let log = record(&engine, client, &[EventKind::Disconnected]);
    engine.connect(client, "127.0.0.1", port, IoMode::Blocking).unwrap();
    let (_peer, _) = server.accept().unwrap();

    engine.disconnect(client).unwrap();
    engine.disconnect(client).unwrap();
    assert!(!engine.is_connected(client));
    pump_for(&engine, Duration::from_millis(200));
    assert_eq!(count(&log, EventKind::Disconnected), 1);
    assert!(matches!(
        engine.send(client, b"x", IoMode::Blocking),
        Err(EngineError::NotConnected)
    ));
}

#[test]
fn test_drain_limit_caps_handler_runs() {
    let engine = Engine::with_config(EngineConfig::new().with_drain_limit(2)).unwrap();
    let id = engine.create(Protocol::Tcp);
    let log = record(&engine, id, &[EventKind::Error]);
    for _ in 0..5 {
        let _ = engine.connect(id, "", 80, IoMode::Blocking);
    }

    assert_eq!(engine.pending_events(), 5);
    assert_eq!(engine.drain(), 2);
    assert_eq!(engine.pending_events(), 3);
    assert_eq!(engine.drain(), 2);
    assert_eq!(engine.drain(), 1);
    assert_eq!(errors(&log).len(), 5);
}

#[test]
fn test_handlers_may_reenter_engine() {
    let engine = Engine::new().unwrap();
    let id = engine.create(Protocol::Tcp);
    let other = engine.create(Protocol::Udp);
    let runs = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&runs);
    engine
        .register_handler(id, EventKind::Error, move |engine, id, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            // Destroying sockets, our own included, from inside a handler
            engine.destroy(other).unwrap();
            engine.destroy(id).unwrap();
        })
        .unwrap();

    let _ = engine.connect(id, "", 80, IoMode::Blocking);
    let _ = engine.connect(id, "", 80, IoMode::Blocking);
    assert_eq!(engine.drain(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(engine.socket_count(), 0);
    assert_eq!(engine.pending_events(), 0);
}

#[test]
fn test_destroy_during_connect_leaves_no_connection() {
    let peer = TcpListener::bind("127.0.0.1:0").unwrap();
    peer.set_nonblocking(true).unwrap();
    let port = peer.local_addr().unwrap().port();

    let engine = Engine::new().unwrap();
    let id = engine.create(Protocol::Tcp);
    let log = record(&engine, id, &[EventKind::Connected, EventKind::Error]);
    engine.connect(id, "127.0.0.1", port, IoMode::Async).unwrap();
    engine.destroy(id).unwrap();
    assert_eq!(engine.socket_count(), 0);

    // Whatever the connect left behind must be closed
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        match peer.accept() {
            Ok((mut stream, _)) => {
                stream.set_nonblocking(false).unwrap();
                stream.set_read_timeout(Some(common::DEADLINE)).unwrap();
                let mut buf = [0u8; 8];
                assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));
            }
            Err(_) => thread::sleep(Duration::from_millis(10)),
        }
    }
    pump_for(&engine, Duration::from_millis(100));
    assert!(log.lock().is_empty());
}

#[test]
fn test_unresolvable_bind_reports_bind_error() {
    let engine = Engine::new().unwrap();
    let id = engine.create(Protocol::Tcp);
    let log = record(&engine, id, &[EventKind::Error]);

    let err = engine
        .bind(id, "no-such-host.invalid", 0, IoMode::Blocking)
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::BindError));
    assert!(pump_until(&engine, || errors(&log) == vec![ErrorKind::BindError]));
    assert!(engine.local_addr(id).is_none());
}

#[test]
fn test_bind_to_port_in_use_reports_os_code() {
    let holder = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();

    let engine = Engine::new().unwrap();
    let id = engine.create(Protocol::Tcp);
    let log = record(&engine, id, &[EventKind::Error]);

    match engine.bind(id, "127.0.0.1", port, IoMode::Blocking) {
        Err(EngineError::Operation { kind, source }) => {
            assert_eq!(kind, ErrorKind::BindError);
            assert_eq!(source.raw_os_error(), Some(libc::EADDRINUSE));
        }
        other => panic!("expected a bind error, got {other:?}"),
    }
    assert!(pump_until(&engine, || !errors(&log).is_empty()));
    assert_eq!(
        log.lock().as_slice(),
        [CallbackEvent::error(ErrorKind::BindError, libc::EADDRINUSE)]
    );

    // Async binds report the same way
    let other = engine.create(Protocol::Tcp);
    let other_log = record(&engine, other, &[EventKind::Error]);
    engine.bind(other, "127.0.0.1", port, IoMode::Async).unwrap();
    assert!(pump_until(&engine, || errors(&other_log) == vec![ErrorKind::BindError]));
}

#[test]
fn test_async_bind_then_listen() {
    let engine = Engine::new().unwrap();
    let server = engine.create(Protocol::Tcp);
    let log = record(&engine, server, &[EventKind::Accepted, EventKind::Error]);
    engine.bind(server, "127.0.0.1", 0, IoMode::Async).unwrap();
    assert!(pump_until(&engine, || engine.local_addr(server).is_some()));
    engine.listen(server).unwrap();

    let port = engine.local_addr(server).unwrap().port();
    let _peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(pump_until(&engine, || count(&log, EventKind::Accepted) == 1));
    assert!(errors(&log).is_empty());
}
