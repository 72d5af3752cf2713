//! Error handling and edge case tests.

use crossbeam_channel::unbounded;
use light_link::{
    Client, ClientConfig, ConnectionState, Error, KvEntry, MemoryBroker, MemoryKv, MemoryObjects,
    Message, ReconnectPolicy, Revision, Service, StorageResponder, SubscriptionOptions,
    WatchTarget,
};
use serde_json::{json, Value};
use std::io::{self, Cursor, Read};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(2);
const FILES: &str = "light_link_files";

fn test_config() -> ClientConfig {
    ClientConfig {
        address: "mem://errors".into(),
        reconnect: ReconnectPolicy {
            max_reconnects: 3,
            reconnect_wait: Duration::from_millis(10),
            max_wait: Duration::from_millis(40),
        },
        request_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn storage(broker: &MemoryBroker) -> (Client, StorageResponder, MemoryKv, MemoryObjects) {
    init_tracing();
    let host = Client::connect(test_config(), broker.connector()).unwrap();
    let kv = MemoryKv::new();
    let objects = MemoryObjects::new();
    let responder = StorageResponder::start(&host, kv.clone(), objects.clone()).unwrap();
    (host, responder, kv, objects)
}

fn connect(broker: &MemoryBroker) -> Client {
    init_tracing();
    Client::connect(test_config(), broker.connector()).unwrap()
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

// --- Connection ---

#[test]
fn test_connect_refused() {
    let broker = MemoryBroker::new();
    broker.set_accepting(false);
    let result = Client::connect(test_config(), broker.connector());
    assert!(matches!(result, Err(Error::Connect(_))));
}

#[test]
fn test_invalid_config_rejected() {
    let broker = MemoryBroker::new();
    let config = ClientConfig {
        chunk_size: 0,
        ..test_config()
    };
    assert!(matches!(
        Client::connect(config, broker.connector()),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_operations_after_close() {
    let broker = MemoryBroker::new();
    let client = connect(&broker);
    client.close();
    client.close();

    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(client.publish("a", Vec::new()), Err(Error::Closed)));
    assert!(matches!(
        client.call("svc", "m", json!({}), Duration::from_millis(50)),
        Err(Error::Closed)
    ));
    assert!(matches!(
        client.subscribe("a", |_| Ok(())),
        Err(Error::Closed)
    ));
}

#[test]
fn test_invalid_subjects() {
    let broker = MemoryBroker::new();
    let client = connect(&broker);

    for subject in ["", "a..b", "a.*", "a.>", "has space"] {
        assert!(
            matches!(client.publish(subject, Vec::new()), Err(Error::InvalidSubject(_))),
            "publish to {subject:?} should fail"
        );
    }
    for pattern in ["a.>.b", "a*", "a.b>", ""] {
        assert!(
            matches!(client.subscribe(pattern, |_| Ok(())), Err(Error::InvalidSubject(_))),
            "subscribe to {pattern:?} should fail"
        );
    }
}

#[test]
fn test_reconnect_exhaustion_closes_client() {
    let broker = MemoryBroker::new();
    let client = connect(&broker);
    let (tx, rx) = unbounded();
    client
        .subscribe("a", move |m| {
            tx.send(m)?;
            Ok(())
        })
        .unwrap();

    broker.set_accepting(false);
    broker.drop_connections();

    assert!(wait_until(|| client.state() == ConnectionState::Closed));
    assert_eq!(client.reconnect_attempts(), 3);
    assert!(matches!(client.publish("a", Vec::new()), Err(Error::Closed)));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_publish_while_reconnecting_fails_fast() {
    let broker = MemoryBroker::new();
    let mut config = test_config();
    config.reconnect.reconnect_wait = Duration::from_millis(500);
    config.reconnect.max_wait = Duration::from_millis(500);
    let client = Client::connect(config, broker.connector()).unwrap();

    broker.drop_connections();
    assert!(wait_until(|| client.state() == ConnectionState::Reconnecting));
    assert_eq!(client.reconnect_attempts(), 0);

    let started = Instant::now();
    assert!(matches!(
        client.publish("a", Vec::new()),
        Err(Error::Reconnecting)
    ));
    assert!(started.elapsed() < Duration::from_millis(100));

    assert!(wait_until(|| client.is_connected()));
    assert_eq!(client.reconnect_attempts(), 0);
}

// --- Subscriptions ---

#[test]
fn test_panicking_handler_is_isolated() {
    let broker = MemoryBroker::new();
    let client = connect(&broker);

    let (tx, rx) = unbounded();
    client
        .subscribe("jobs", |msg| {
            if msg.payload == b"boom" {
                panic!("handler exploded");
            }
            Ok(())
        })
        .unwrap();
    let sibling = tx.clone();
    client
        .subscribe("jobs", move |msg| {
            sibling.send(msg.payload)?;
            Ok(())
        })
        .unwrap();
    drop(tx);

    client.publish("jobs", b"boom".to_vec()).unwrap();
    client.publish("jobs", b"fine".to_vec()).unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), b"boom");
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), b"fine");
}

#[test]
fn test_handler_error_keeps_subscription() {
    let broker = MemoryBroker::new();
    let client = connect(&broker);
    let (tx, rx) = unbounded();
    client
        .subscribe("numbers", move |msg| {
            let n: u32 = std::str::from_utf8(&msg.payload)?.parse()?;
            tx.send(n)?;
            Ok(())
        })
        .unwrap();

    client.publish("numbers", b"not a number".to_vec()).unwrap();
    client.publish("numbers", b"7".to_vec()).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 7);
}

#[test]
fn test_slow_consumer_drops_and_counts() {
    let broker = MemoryBroker::new();
    let client = connect(&broker);
    let (gate_tx, gate_rx) = unbounded::<()>();
    let options = SubscriptionOptions {
        capacity: 2,
        ..Default::default()
    };

    struct Blocked(crossbeam_channel::Receiver<()>);
    impl light_link::MessageHandler for Blocked {
        fn on_message(&mut self, _m: Message) -> light_link::HandlerResult {
            let _ = self.0.recv();
            Ok(())
        }
    }

    let id = client
        .subscribe_with("flood", options, Blocked(gate_rx))
        .unwrap();
    for _ in 0..20 {
        client.publish("flood", Vec::new()).unwrap();
    }

    assert!(wait_until(|| client.dropped_count(id).unwrap_or(0) > 0));
    drop(gate_tx);
}

// --- RPC ---

#[test]
fn test_call_timeout_within_bounds() {
    let broker = MemoryBroker::new();
    let client = connect(&broker);
    let timeout = Duration::from_millis(100);

    let started = Instant::now();
    let result = client.call("nobody", "home", json!({}), timeout);
    let elapsed = started.elapsed();

    match result {
        Err(Error::Timeout(t)) => assert_eq!(t, timeout),
        other => panic!("Expected timeout, got {:?}", other),
    }
    assert!(elapsed >= timeout);
    assert!(elapsed < Duration::from_secs(1));
}

#[test]
fn test_async_call_timeout() {
    let broker = MemoryBroker::new();
    let client = connect(&broker);
    let (tx, rx) = unbounded();

    client
        .call_async("nobody", "home", json!({}), Duration::from_millis(50), move |r| {
            let _ = tx.send(r);
        })
        .unwrap();

    let result = rx.recv_timeout(WAIT).unwrap();
    assert!(result.unwrap_err().is_timeout());
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_async_call_with_unbounded_timeout() {
    let broker = MemoryBroker::new();
    let server = connect(&broker);
    let mut echo = Service::new(&server, "echo").unwrap();
    echo.register("say", |args| Ok(args.clone()));
    echo.start().unwrap();

    let client = connect(&broker);
    let (tx, rx) = unbounded();
    let reply = tx.clone();
    client
        .call_async("echo", "say", json!("hi"), Duration::MAX, move |r| {
            let _ = reply.send(r);
        })
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), json!("hi"));

    // No deadline is armed, so the call stays pending until cancelled.
    let handle = client
        .call_async("nobody", "home", json!({}), Duration::MAX, move |r| {
            let _ = tx.send(r);
        })
        .unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(client.pending_requests(), 1);
    assert!(handle.cancel());
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Err(Error::Cancelled)));
    assert_eq!(client.pending_requests(), 0);
}

#[test]
fn test_cancel_wins_over_late_reply() {
    let broker = MemoryBroker::new();
    let server = connect(&broker);
    let mut service = Service::new(&server, "slow").unwrap();
    service.register("work", |_| {
        thread::sleep(Duration::from_millis(100));
        Ok(json!("done"))
    });
    service.start().unwrap();

    let client = connect(&broker);
    let (tx, rx) = unbounded();
    let handle = client
        .call_async("slow", "work", json!({}), Duration::from_secs(5), move |r| {
            let _ = tx.send(r);
        })
        .unwrap();

    assert!(handle.cancel());
    assert!(!handle.cancel());
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Err(Error::Cancelled)));

    // The reply still arrives at the broker but is discarded.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn test_server_errors() {
    let broker = MemoryBroker::new();
    let server = connect(&broker);
    let mut service = Service::new(&server, "calc").unwrap();
    service.register("div", |args| {
        let a = args["a"].as_f64().ok_or("a must be a number")?;
        let b = args["b"].as_f64().ok_or("b must be a number")?;
        if b == 0.0 {
            return Err("division by zero".to_string());
        }
        Ok(json!(a / b))
    });
    service.register("panic", |_| panic!("unexpected"));
    service.start().unwrap();

    let client = connect(&broker);
    let call = |method: &str, args: Value| client.call("calc", method, args, WAIT);

    assert_eq!(call("div", json!({"a": 9, "b": 3})).unwrap(), json!(3.0));
    match call("div", json!({"a": 1, "b": 0})) {
        Err(Error::Server(m)) => assert_eq!(m, "division by zero"),
        other => panic!("Expected server error, got {:?}", other),
    }
    match call("sqrt", json!({})) {
        Err(Error::Server(m)) => assert_eq!(m, "method not found: sqrt"),
        other => panic!("Expected server error, got {:?}", other),
    }
    assert!(matches!(call("panic", json!({})), Err(Error::Server(_))));
}

#[test]
fn test_invalid_request_body() {
    let broker = MemoryBroker::new();
    let server = connect(&broker);
    let mut service = Service::new(&server, "strict").unwrap();
    service.start().unwrap();

    let client = connect(&broker);
    let reply = client
        .request("$SRV.strict.any", b"not json".to_vec(), WAIT)
        .unwrap();
    let body: Value = reply.decode_json().unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("invalid request:"));
}

#[test]
fn test_stopped_service_times_out() {
    let broker = MemoryBroker::new();
    let server = connect(&broker);
    let mut service = Service::new(&server, "echo").unwrap();
    service.register("say", |args| Ok(args.clone()));
    service.start().unwrap();

    let client = connect(&broker);
    assert_eq!(
        client.call("echo", "say", json!("hi"), WAIT).unwrap(),
        json!("hi")
    );

    service.stop();
    assert!(client
        .call("echo", "say", json!("hi"), Duration::from_millis(50))
        .unwrap_err()
        .is_timeout());
}

#[test]
fn test_pending_call_fails_on_connection_loss() {
    let broker = MemoryBroker::new();
    let client = connect(&broker);
    let (tx, rx) = unbounded();

    client
        .call_async("nobody", "home", json!({}), Duration::from_secs(10), move |r| {
            let _ = tx.send(r);
        })
        .unwrap();
    broker.drop_connections();

    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(Error::ConnectionLost)
    ));
}

// --- KV ---

#[test]
fn test_missing_key_is_not_found() {
    let broker = MemoryBroker::new();
    let (_host, _responder, _, _) = storage(&broker);
    let client = connect(&broker);

    let err = client.get_state::<Value>("missing.key").unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_revision_mismatch() {
    let broker = MemoryBroker::new();
    let (_host, _responder, _, _) = storage(&broker);
    let client = connect(&broker);

    client.set_state("k", &1).unwrap();
    client.set_state("k", &2).unwrap();

    match client.kv().get("k", Some(Revision(1))) {
        Err(Error::RevisionMismatch { key, revision }) => {
            assert_eq!(key, "k");
            assert_eq!(revision, Revision(1));
        }
        other => panic!("Expected revision mismatch, got {:?}", other),
    }
    assert!(matches!(
        client.kv().get("k", Some(Revision(3))),
        Err(Error::RevisionMismatch { .. })
    ));
}

#[test]
fn test_invalid_keys() {
    let broker = MemoryBroker::new();
    let (_host, _responder, _, _) = storage(&broker);
    let client = connect(&broker);

    for key in ["", "a.*", "a..b", "with space"] {
        assert!(
            matches!(client.set_state(key, &1), Err(Error::InvalidKey(_))),
            "key {key:?} should be rejected"
        );
    }
}

#[test]
fn test_state_decode_failure_is_malformed() {
    let broker = MemoryBroker::new();
    let (_host, _responder, _, _) = storage(&broker);
    let client = connect(&broker);

    client.kv().put("raw", b"\xff\xfe".to_vec()).unwrap();
    assert!(matches!(
        client.get_state::<Value>("raw"),
        Err(Error::Malformed(_))
    ));
}

#[test]
fn test_storage_unavailable_times_out() {
    let broker = MemoryBroker::new();
    let client = Client::connect(
        ClientConfig {
            request_timeout: Duration::from_millis(50),
            ..test_config()
        },
        broker.connector(),
    )
    .unwrap();

    assert!(client.set_state("k", &1).unwrap_err().is_timeout());
}

#[test]
fn test_concurrent_bucket_binding() {
    let broker = MemoryBroker::new();
    let (_host, _responder, kv, _) = storage(&broker);
    let barrier = Arc::new(Barrier::new(4));

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let client = connect(&broker);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let bucket = client.kv_bucket("shared");
                barrier.wait();
                bucket.put(&format!("worker.{i}"), vec![i as u8])
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().unwrap().unwrap(), Revision(1));
    }
    assert_eq!(kv.bucket_count(), 1);
    assert_eq!(kv.keys("shared", None).unwrap().len(), 4);
}

fn forward_changes(
    client: &Client,
    key: &str,
) -> crossbeam_channel::Receiver<light_link::Result<KvEntry>> {
    let (tx, rx) = unbounded();
    client
        .kv()
        .watch(WatchTarget::key(key), move |change| {
            let _ = tx.send(change);
        })
        .unwrap();
    rx
}

fn fake_event(key: &str, revision: u64) -> Message {
    Message::new(format!("$KV.light_link_state.{key}"), b"forged".to_vec())
        .with_header("LL-Key", key)
        .with_header("LL-Revision", revision.to_string())
        .with_header("LL-Created", "0")
}

#[test]
fn test_watch_gap_terminates_with_overrun() {
    let broker = MemoryBroker::new();
    let (_host, _responder, _, _) = storage(&broker);
    let client = connect(&broker);
    client.kv().put("gap.key", b"v1".to_vec()).unwrap();

    let rx = forward_changes(&client, "gap.key");
    assert_eq!(rx.try_recv().unwrap().unwrap().revision, Revision(1));

    client.publish_message(fake_event("gap.key", 3)).unwrap();
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Err(Error::Overrun)));

    client.kv().put("gap.key", b"v2".to_vec()).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_watch_skips_duplicate_revisions() {
    let broker = MemoryBroker::new();
    let (_host, _responder, _, _) = storage(&broker);
    let client = connect(&broker);
    client.kv().put("dup.key", b"v1".to_vec()).unwrap();

    let rx = forward_changes(&client, "dup.key");
    assert_eq!(rx.try_recv().unwrap().unwrap().revision, Revision(1));

    client.publish_message(fake_event("dup.key", 1)).unwrap();
    client.kv().put("dup.key", b"v2".to_vec()).unwrap();

    let next = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(next.revision, Revision(2));
    assert_eq!(next.value, b"v2");
}

#[test]
fn test_slow_watcher_overruns() {
    let broker = MemoryBroker::new();
    let (host, _responder, _, _) = storage(&broker);
    let watcher = Client::connect(
        ClientConfig {
            subscription_capacity: 1,
            ..test_config()
        },
        broker.connector(),
    )
    .unwrap();

    let (tx, rx) = unbounded();
    watcher
        .kv()
        .watch(WatchTarget::key("hot.key"), move |change| {
            let failed = change.is_err();
            let _ = tx.send(change);
            if !failed {
                thread::sleep(Duration::from_millis(50));
            }
        })
        .unwrap();

    for i in 0..100u32 {
        host.kv().put("hot.key", i.to_be_bytes().to_vec()).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        assert!(Instant::now() < deadline, "watcher never overran");
        match rx.recv_timeout(WAIT) {
            Ok(Err(Error::Overrun)) => break,
            Ok(Ok(_)) => continue,
            other => panic!("Unexpected watch result {:?}", other),
        }
    }
}

#[test]
fn test_watcher_fails_on_connection_loss() {
    let broker = MemoryBroker::new();
    let (_host, _responder, _, _) = storage(&broker);
    let client = connect(&broker);
    let rx = forward_changes(&client, "lost.key");

    broker.drop_connections();
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(Error::ConnectionLost)
    ));
}

// --- Objects ---

#[test]
fn test_download_unknown_object() {
    let broker = MemoryBroker::new();
    let (_host, _responder, _, _) = storage(&broker);
    let client = connect(&broker);

    let err = client
        .objects()
        .download(&"0123456789abcdef0123456789abcdef".into())
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_corrupt_chunk_detected() {
    let broker = MemoryBroker::new();
    let (_host, _responder, _, objects) = storage(&broker);
    let client = Client::connect(
        ClientConfig {
            chunk_size: 16,
            ..test_config()
        },
        broker.connector(),
    )
    .unwrap();

    let data: Vec<u8> = (0..64u8).collect();
    let id = client.objects().upload(Cursor::new(data), "data.bin").unwrap();
    assert!(objects.corrupt_chunk(FILES, &id, 1));

    let mut reader = client.objects().download(&id).unwrap();
    assert_eq!(reader.next().unwrap().unwrap().len(), 16);
    match reader.next() {
        Some(Err(Error::CorruptChunk { file_id, index, .. })) => {
            assert_eq!(file_id, id);
            assert_eq!(index, 1);
        }
        other => panic!("Expected corrupt chunk, got {:?}", other),
    }
    assert!(reader.next().is_none());
    assert!(!reader.is_complete());
}

#[test]
fn test_short_chunk_with_valid_checksum_detected() {
    let broker = MemoryBroker::new();
    let (_host, _responder, _, objects) = storage(&broker);
    let client = Client::connect(
        ClientConfig {
            chunk_size: 16,
            ..test_config()
        },
        broker.connector(),
    )
    .unwrap();

    let id = client
        .objects()
        .upload(Cursor::new(vec![3u8; 48]), "threes")
        .unwrap();
    assert!(objects.rewrite_chunk(FILES, &id, 1, vec![3u8; 10]));

    let mut reader = client.objects().download(&id).unwrap();
    assert!(reader.next().unwrap().is_ok());
    assert!(matches!(reader.next(), Some(Err(Error::Corruption(_)))));
    assert!(reader.next().is_none());
    assert!(!reader.is_complete());
}

#[test]
fn test_failed_download_leaves_no_file() {
    let broker = MemoryBroker::new();
    let (_host, _responder, _, objects) = storage(&broker);
    let client = Client::connect(
        ClientConfig {
            chunk_size: 8,
            ..test_config()
        },
        broker.connector(),
    )
    .unwrap();

    let id = client
        .objects()
        .upload(Cursor::new(vec![7u8; 40]), "sevens")
        .unwrap();
    objects.corrupt_chunk(FILES, &id, 4);

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("sevens.bin");
    assert!(matches!(
        client.download_file(&id, &dest),
        Err(Error::CorruptChunk { index: 4, .. })
    ));
    assert!(!dest.exists());
    assert!(!dir.path().join("sevens.bin.part").exists());
}

/// Yields `remaining` bytes, then fails.
struct FailingReader {
    remaining: usize,
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "source went away"));
        }
        let n = buf.len().min(self.remaining);
        buf[..n].fill(1);
        self.remaining -= n;
        Ok(n)
    }
}

#[test]
fn test_partial_upload_leaves_no_object() {
    let broker = MemoryBroker::new();
    let (_host, _responder, _, objects) = storage(&broker);
    let client = Client::connect(
        ClientConfig {
            chunk_size: 10,
            ..test_config()
        },
        broker.connector(),
    )
    .unwrap();

    let result = client
        .objects()
        .upload(FailingReader { remaining: 35 }, "partial");
    assert!(matches!(result, Err(Error::Io(_))));
    assert_eq!(objects.object_count(FILES), 0);
}

#[test]
fn test_upload_missing_file() {
    let broker = MemoryBroker::new();
    let (_host, _responder, _, _) = storage(&broker);
    let client = connect(&broker);

    let dir = TempDir::new().unwrap();
    assert!(matches!(
        client.upload_file(dir.path().join("nope.txt"), None),
        Err(Error::Io(_))
    ));
}
