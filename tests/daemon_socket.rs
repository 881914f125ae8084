//! End-to-end protocol scenarios over a real Unix socket.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gpusched::checkpoint::{Criu, CudaCheckpoint};
use gpusched::daemon::server::Server;
use gpusched::daemon::{Config, Daemon};

struct TestDaemon {
    socket: PathBuf,
    _dir: tempfile::TempDir,
}

fn start_daemon() -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config {
        ram_budget_mb: 8192,
        disk_budget_mb: 8192,
        disk_dir: dir.path().join("snapshots"),
        log_dir: dir.path().join("logs"),
    };
    let daemon =
        Arc::new(Daemon::with_tools(cfg, CudaCheckpoint::unavailable(), Criu::unavailable()).unwrap());

    let socket = dir.path().join("gpusched.sock");
    let server = Server::new(daemon, &socket);
    thread::spawn(move || {
        let _ = server.listen_and_serve();
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while !socket.exists() {
        assert!(Instant::now() < deadline, "socket never appeared");
        thread::sleep(Duration::from_millis(10));
    }
    TestDaemon { socket, _dir: dir }
}

fn connect(socket: &Path) -> BufReader<UnixStream> {
    let stream = UnixStream::connect(socket).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    BufReader::new(stream)
}

fn call(conn: &mut BufReader<UnixStream>, request: &str) -> serde_json::Value {
    send(conn, request);
    read_json(conn)
}

fn send(conn: &mut BufReader<UnixStream>, line: &str) {
    let stream = conn.get_mut();
    stream.write_all(line.as_bytes()).unwrap();
    stream.write_all(b"\n").unwrap();
}

fn read_json(conn: &mut BufReader<UnixStream>) -> serde_json::Value {
    let mut line = String::new();
    conn.read_line(&mut line).unwrap();
    serde_json::from_str(line.trim()).unwrap()
}

#[test]
fn run_status_kill_scenarios() {
    let daemon = start_daemon();
    let mut conn = connect(&daemon.socket);

    // Scenario: run on an empty registry succeeds with a live pid.
    let resp = call(
        &mut conn,
        r#"{"method":"run","params":{"name":"a","cmd":["sleep","3600"],"gpu":0}}"#,
    );
    assert_eq!(resp["ok"], true, "run failed: {resp}");
    assert_eq!(resp["result"]["name"], "a");
    assert!(resp["result"]["pid"].as_i64().unwrap() > 0);

    // Scenario: duplicate run is rejected by name.
    let resp = call(
        &mut conn,
        r#"{"method":"run","params":{"name":"a","cmd":["sleep","3600"],"gpu":0}}"#,
    );
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"], "process \"a\" already exists");

    // Scenario: status shows the single active process.
    let resp = call(&mut conn, r#"{"method":"status"}"#);
    assert_eq!(resp["ok"], true);
    let procs = resp["result"]["processes"].as_array().unwrap();
    assert_eq!(procs.len(), 1);
    assert_eq!(procs[0]["name"], "a");
    assert_eq!(procs[0]["state"], "active");
    assert_eq!(procs[0]["tier"], "gpu");

    // Scenario: freeze without the checkpoint tool fails cleanly and the
    // entry stays active.
    let resp = call(&mut conn, r#"{"method":"freeze","params":{"name":"a"}}"#);
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"], "cuda-checkpoint not available");
    let resp = call(&mut conn, r#"{"method":"status"}"#);
    assert_eq!(resp["result"]["processes"][0]["state"], "active");
    assert_eq!(
        resp["result"]["capabilities"]["cuda_checkpoint"],
        false
    );

    // Scenario: kill of an unknown name is NotFound.
    let resp = call(&mut conn, r#"{"method":"kill","params":{"name":"ghost"}}"#);
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"], "process \"ghost\" not found");

    // Cleanup; a second kill is NotFound.
    let resp = call(&mut conn, r#"{"method":"kill","params":{"name":"a"}}"#);
    assert_eq!(resp["ok"], true);
    assert_eq!(resp["result"], "ok");
    let resp = call(&mut conn, r#"{"method":"kill","params":{"name":"a"}}"#);
    assert_eq!(resp["error"], "process \"a\" not found");
}

#[test]
fn malformed_input_is_rejected() {
    let daemon = start_daemon();
    let mut conn = connect(&daemon.socket);

    let resp = call(&mut conn, "this is not json");
    assert_eq!(resp["ok"], false);
    assert!(resp["error"].as_str().unwrap().starts_with("invalid json:"));

    let resp = call(&mut conn, r#"{"method":"teleport"}"#);
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"], "unknown method: teleport");

    let resp = call(&mut conn, r#"{"method":"run","params":{"name":"x"}}"#);
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"], "bad params: empty command");

    let resp = call(&mut conn, r#"{"method":"freeze"}"#);
    assert_eq!(resp["ok"], false);
    assert!(resp["error"].as_str().unwrap().starts_with("bad params:"));
}

#[test]
fn subscriber_receives_lifecycle_events() {
    let daemon = start_daemon();

    let mut subscriber = connect(&daemon.socket);
    send(&mut subscriber, r#"{"method":"subscribe"}"#);
    let initial = read_json(&mut subscriber);
    assert_eq!(initial["ok"], true);
    assert!(initial["result"]["processes"].as_array().unwrap().is_empty());

    let mut control = connect(&daemon.socket);
    let resp = call(
        &mut control,
        r#"{"method":"run","params":{"name":"b","cmd":["sleep","3600"],"gpu":0}}"#,
    );
    assert_eq!(resp["ok"], true);

    let event = read_json(&mut subscriber);
    assert_eq!(event["type"], "run");
    assert_eq!(event["process"], "b");
    assert!(event["time"].as_str().is_some());

    let resp = call(&mut control, r#"{"method":"kill","params":{"name":"b"}}"#);
    assert_eq!(resp["ok"], true);
    let event = read_json(&mut subscriber);
    assert_eq!(event["type"], "kill");
    assert_eq!(event["process"], "b");
}

#[test]
fn logs_round_trip_over_socket() {
    let daemon = start_daemon();
    let mut conn = connect(&daemon.socket);

    let resp = call(
        &mut conn,
        r#"{"method":"run","params":{"name":"echo","cmd":["sh","-c","echo hello; sleep 3600"],"gpu":0}}"#,
    );
    assert_eq!(resp["ok"], true, "run failed: {resp}");

    let deadline = Instant::now() + Duration::from_secs(5);
    let lines = loop {
        let resp = call(&mut conn, r#"{"method":"logs","params":{"name":"echo"}}"#);
        assert_eq!(resp["ok"], true);
        let lines = resp["result"]["lines"].as_array().unwrap().clone();
        if !lines.is_empty() {
            break lines;
        }
        assert!(Instant::now() < deadline, "log output never appeared");
        thread::sleep(Duration::from_millis(20));
    };
    assert!(lines.iter().any(|l| l == "hello"));

    call(&mut conn, r#"{"method":"kill","params":{"name":"echo"}}"#);
}

#[test]
fn requests_metric_counts_every_call() {
    let daemon = start_daemon();
    let mut conn = connect(&daemon.socket);

    call(&mut conn, r#"{"method":"status"}"#);
    call(&mut conn, r#"{"method":"nope"}"#);
    let resp = call(&mut conn, r#"{"method":"status"}"#);

    // Two statuses plus the unknown method, this status included.
    assert_eq!(resp["result"]["metrics"]["requests"], 3);
}
