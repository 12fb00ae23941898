//! Integration tests — full source/server/sink lifecycle, delta
//! convergence, and error scenarios over real TCP on localhost.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use dataserv_core::{
    Connection, DataServer, DataSink, DataSource, DataValue, Error, Frame, StreamingList,
    dataset_list,
};

// ── Helpers ──────────────────────────────────────────────────────

/// Spin up a server on an OS-assigned port in its own thread and
/// return a handle plus the bound address.
fn start_server() -> (DataServer, SocketAddr, thread::JoinHandle<()>) {
    let server = DataServer::new();
    let runner = server.clone();
    let handle = thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(runner.serve_forever("127.0.0.1:0".parse().unwrap()))
            .unwrap();
    });
    let port = loop {
        if let Some(port) = server.local_port() {
            break port;
        }
        thread::sleep(Duration::from_millis(5));
    };
    (server, SocketAddr::from(([127, 0, 0, 1], port)), handle)
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}

fn scan_value(points: &[i64]) -> DataValue {
    let mut stream = StreamingList::new();
    for p in points {
        stream.push(*p);
    }
    let mut map = BTreeMap::new();
    map.insert("title".to_string(), DataValue::Text("scan".into()));
    map.insert("points".to_string(), DataValue::Stream(stream));
    DataValue::Map(map)
}

fn stream_ints(value: &DataValue, key: &str) -> Vec<i64> {
    match value.get(key) {
        Some(DataValue::Stream(sl)) => sl
            .items()
            .iter()
            .map(|v| match v {
                DataValue::Int(i) => *i,
                other => panic!("unexpected value {other:?}"),
            })
            .collect(),
        other => panic!("unexpected value {other:?}"),
    }
}

// ── End-to-end lifecycle ─────────────────────────────────────────

#[test]
fn test_push_pop_round_trip() {
    let (server, addr, _handle) = start_server();

    let source = DataSource::connect(addr, "scan").unwrap();
    let mut sink = DataSink::connect(addr, "scan", false).unwrap();

    let mut value = scan_value(&[1, 2, 3]);
    source.push(&mut value).unwrap();

    let received = sink.pop(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(received, &value);
    assert_eq!(stream_ints(received, "points"), vec![1, 2, 3]);

    source.disconnect();
    sink.disconnect();
    server.stop();
}

#[test]
fn test_late_sink_gets_full_state() {
    let (server, addr, _handle) = start_server();

    let source = DataSource::connect(addr, "scan").unwrap();
    let mut value = scan_value(&[]);
    source.push(&mut value).unwrap();
    for p in [10, 20, 30] {
        value
            .get_mut("points")
            .and_then(DataValue::as_stream_mut)
            .unwrap()
            .push(p);
        source.push(&mut value).unwrap();
    }

    // Let the server ingest everything before the sink attaches.
    thread::sleep(Duration::from_millis(300));

    let mut sink = DataSink::connect(addr, "scan", false).unwrap();
    let received = sink.pop(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(stream_ints(received, "points"), vec![10, 20, 30]);

    source.disconnect();
    sink.disconnect();
    server.stop();
}

#[test]
fn test_second_source_is_rejected() {
    let (server, addr, _handle) = start_server();

    let source = DataSource::connect(addr, "scan").unwrap();
    let mut sink = DataSink::connect(addr, "scan", false).unwrap();

    let err = DataSource::connect(addr, "scan").unwrap_err();
    assert!(matches!(err, Error::SourceConflict));

    // The surviving source is undisturbed by the rejected one.
    let mut value = scan_value(&[4]);
    source.push(&mut value).unwrap();
    let received = sink.pop(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(stream_ints(received, "points"), vec![4]);

    // A different dataset name is still free.
    let other = DataSource::connect(addr, "other").unwrap();

    source.disconnect();
    sink.disconnect();
    other.disconnect();
    server.stop();
}

#[test]
fn test_source_restart_resets_state() {
    let (server, addr, _handle) = start_server();

    let source = DataSource::connect(addr, "scan").unwrap();
    let mut sink = DataSink::connect(addr, "scan", false).unwrap();

    let mut value = scan_value(&[1, 2, 3]);
    source.push(&mut value).unwrap();
    let received = sink.pop(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(stream_ints(received, "points"), vec![1, 2, 3]);
    source.disconnect();

    // Give the server time to notice the disconnect and free the slot.
    thread::sleep(Duration::from_millis(300));

    // The sink stays attached; its next pop must carry only the new
    // source's state, nothing stale.
    let source = DataSource::connect(addr, "scan").unwrap();
    let mut value = scan_value(&[99]);
    source.push(&mut value).unwrap();

    let received = sink.pop(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(stream_ints(received, "points"), vec![99]);

    source.disconnect();
    sink.disconnect();
    server.stop();
}

// ── Delta convergence ────────────────────────────────────────────

#[test]
fn test_incremental_updates_converge_in_order() {
    let (server, addr, _handle) = start_server();

    let source = DataSource::connect(addr, "scan").unwrap();
    let mut sink = DataSink::connect(addr, "scan", false).unwrap();

    let mut value = scan_value(&[]);
    let total = 50i64;
    for p in 0..total {
        value
            .get_mut("points")
            .and_then(DataValue::as_stream_mut)
            .unwrap()
            .push(p);
        source.push(&mut value).unwrap();
    }

    // Coalescing may collapse intermediate states, but every observed
    // state must be a prefix of the final sequence.
    let mut seen = 0usize;
    while seen < total as usize {
        let received = sink.pop(Some(Duration::from_secs(5))).unwrap();
        let points = stream_ints(received, "points");
        assert!(points.len() >= seen);
        let expected: Vec<i64> = (0..points.len() as i64).collect();
        assert_eq!(points, expected);
        seen = points.len();
    }

    source.disconnect();
    sink.disconnect();
    server.stop();
}

#[test]
fn test_containers_update_in_place() {
    let (server, addr, _handle) = start_server();

    let source = DataSource::connect(addr, "scan").unwrap();
    let mut sink = DataSink::connect(addr, "scan", false).unwrap();

    let mut value = scan_value(&[7]);
    source.push(&mut value).unwrap();
    sink.pop(Some(Duration::from_secs(5))).unwrap();

    value
        .get_mut("points")
        .and_then(DataValue::as_stream_mut)
        .unwrap()
        .set(0, 8)
        .unwrap();
    source.push(&mut value).unwrap();

    let received = sink.pop(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(stream_ints(received, "points"), vec![8]);

    source.disconnect();
    sink.disconnect();
    server.stop();
}

// ── Info listing ─────────────────────────────────────────────────

#[test]
fn test_dataset_listing() {
    let (server, addr, _handle) = start_server();

    assert!(block_on(dataset_list(addr)).unwrap().is_empty());

    let a = DataSource::connect(addr, "alpha").unwrap();
    let b = DataSource::connect(addr, "beta").unwrap();
    thread::sleep(Duration::from_millis(100));

    let mut names = block_on(dataset_list(addr)).unwrap();
    names.sort();
    assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);

    a.disconnect();
    b.disconnect();
    server.stop();
}

// ── Error scenarios ──────────────────────────────────────────────

#[test]
fn test_pop_timeout_when_idle() {
    let (server, addr, _handle) = start_server();

    let source = DataSource::connect(addr, "scan").unwrap();
    let mut sink = DataSink::connect(addr, "scan", false).unwrap();

    // The source is idle, only keepalives flow.
    let err = sink.pop(Some(Duration::from_millis(200))).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(sink.data().is_none());

    source.disconnect();
    sink.disconnect();
    server.stop();
}

#[test]
fn test_sink_to_unknown_dataset_fails() {
    let (server, addr, _handle) = start_server();

    let mut sink = DataSink::connect(addr, "nope", false).unwrap();
    let err = sink.pop(Some(Duration::from_secs(5))).unwrap_err();
    assert!(matches!(
        err,
        Error::ConnectionClosed | Error::ChannelClosed
    ));

    sink.disconnect();
    server.stop();
}

#[test]
fn test_server_survives_aborted_connections() {
    let (server, addr, _handle) = start_server();

    // Clients that reset before or right after accept must be a
    // per-connection event, never fatal to the accept loop.
    block_on(async {
        for _ in 0..5 {
            let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.set_linger(Some(Duration::ZERO)).unwrap();
            drop(stream);
        }
    });
    thread::sleep(Duration::from_millis(200));

    let source = DataSource::connect(addr, "scan").unwrap();
    let mut sink = DataSink::connect(addr, "scan", false).unwrap();
    let mut value = scan_value(&[1]);
    source.push(&mut value).unwrap();
    let received = sink.pop(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(stream_ints(received, "points"), vec![1]);

    source.disconnect();
    sink.disconnect();
    server.stop();
}

#[test]
fn test_source_connect_reports_chatty_peer_as_protocol_error() {
    // A peer that answers the source handshake with data is a protocol
    // violation, not a conflict.
    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    let _peer = thread::spawn(move || {
        block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream).unwrap();
            let _ = conn.recv().await;
            let _ = conn.recv().await;
            conn.send(Frame::Payload(Bytes::from_static(b"?"))).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });
    });

    let addr = addr_rx.recv().unwrap();
    let err = DataSource::connect(addr, "scan").unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(_)));
}

#[test]
fn test_sink_auto_reconnect_waits_for_source() {
    let (server, addr, _handle) = start_server();

    // No source yet: the server closes the sink, which keeps retrying.
    let mut sink = DataSink::connect(addr, "scan", true).unwrap();
    thread::sleep(Duration::from_millis(200));

    let source = DataSource::connect(addr, "scan").unwrap();
    let mut value = scan_value(&[5]);

    // Keep republishing until the sink's retry loop catches the data.
    let received = loop {
        source.push(&mut value).unwrap();
        match sink.pop(Some(Duration::from_secs(1))) {
            Ok(received) => break received.clone(),
            Err(Error::Timeout(_)) => continue,
            Err(e) => panic!("unexpected error {e}"),
        }
    };
    assert_eq!(stream_ints(&received, "points"), vec![5]);

    source.disconnect();
    sink.disconnect();
    server.stop();
}
