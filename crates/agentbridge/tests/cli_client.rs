#![cfg(feature = "cli")]

use std::io::Write;
use std::net::TcpListener;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Duration;

use agentbridge::envelope::{self as envelope, Action};
use agentbridge::frame::{FrameConfig, SocketType, ZmtpStream};
use agentbridge::peer::{ActionServer, ActionServerConfig};
use agentbridge::transport::{Endpoint, TcpEndpoint};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("ephemeral bind should succeed")
        .local_addr()
        .expect("bound socket has an address")
        .port()
}

fn run_client(port: u16, extra: &[&str], stdin: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_agentbridge"))
        .args(["--log-level", "error", "--format", "json", "client"])
        .args(["--host", "127.0.0.1", "--port", &port.to_string()])
        .args(extra)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("client should start");
    child
        .stdin
        .take()
        .expect("stdin is piped")
        .write_all(stdin.as_bytes())
        .expect("stdin should accept input");
    child.wait_with_output().expect("client should finish")
}

#[test]
fn version_prints_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_agentbridge"))
        .arg("version")
        .output()
        .expect("version should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("agentbridge {}", env!("CARGO_PKG_VERSION"))
    );
}

#[test]
fn client_dispatches_symbols_until_eof() {
    let server = ActionServer::bind(&Endpoint::new("127.0.0.1", 0), ActionServerConfig::default())
        .expect("server should bind");
    let port = server.endpoint().port;

    let handled = thread::spawn(move || {
        let mut session = server.accept().expect("client should connect");
        let mut actions = Vec::new();
        while actions.len() < 2 {
            if let Some(handled) = session
                .handle_next(|_| Ok(()))
                .expect("session should stay up")
            {
                actions.push(handled.request.expect("request decodes"));
            }
        }
        actions
    });

    let output = run_client(port, &["--agent", "7", "--verbose"], "W\nZ\nq\n");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let replies: Vec<serde_json::Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("json reply line"))
        .collect();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0]["seqno"], 1);
    assert_eq!(replies[0]["agent_id"], 7);
    assert_eq!(replies[0]["action"], "up");
    assert_eq!(replies[0]["status"], "SUCCESS");
    assert_eq!(replies[1]["seqno"], 2);
    assert_eq!(replies[1]["action"], "rotate_counterclockwise");

    let requests = handled.join().expect("server thread should finish");
    assert_eq!(requests[0].seqno, Some(1));
    assert_eq!(requests[0].agent_id, Some(7));
    assert_eq!(requests[0].action, Action::Up);
    assert_eq!(requests[1].action, Action::RotateCounterclockwise);

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("action (A, W, S, D, Q, E)? "));
}

#[test]
fn client_reports_timeout_and_keeps_going() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    // Accepts but never answers.
    let silent = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        thread::sleep(Duration::from_millis(800));
        drop(stream);
    });

    let output = run_client(port, &["--timeout", "100ms"], "W\nS\n");
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(stderr.matches("no reply within").count(), 2, "{stderr}");

    silent.join().expect("silent server should finish");
}

#[test]
fn client_connect_refused_exits_nonzero() {
    let output = run_client(free_port(), &[], "");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("connect failed"));
}

#[test]
fn client_rejects_agent_zero() {
    let output = run_client(free_port(), &["--agent", "0"], "");
    assert_eq!(output.status.code(), Some(64));
}

fn zmq_rep_listener() -> (TcpEndpoint, u16) {
    let listener = TcpEndpoint::bind(&Endpoint::new("127.0.0.1", 0)).expect("bind");
    let port = listener.endpoint().port;
    (listener, port)
}

#[test]
fn client_speaks_zmq_wire_to_rep_socket() {
    let (listener, port) = zmq_rep_listener();
    let environment = thread::spawn(move || {
        let stream = listener.accept().expect("client should connect");
        let mut rep = ZmtpStream::handshake(
            stream,
            SocketType::Rep,
            true,
            FrameConfig::default(),
            Duration::from_secs(5),
        )
        .expect("zmtp handshake");
        let parts = rep
            .recv_message_until(std::time::Instant::now() + Duration::from_secs(5))
            .expect("receive")
            .expect("request");
        let request = envelope::decode(&parts[1]).expect("request envelope");
        let reply = envelope::encode(
            &serde_json::json!({"seqno": 1}),
            &serde_json::json!({"status": "SUCCESS", "echo": request.get_str("action")}),
        )
        .expect("reply envelope");
        rep.send_message(&[b"", &reply]).expect("send reply");
    });

    let output = run_client(port, &["--wire", "zmq", "--verbose"], "d\n");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let reply: serde_json::Value = serde_json::from_str(
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .expect("one reply line"),
    )
    .expect("json reply");
    assert_eq!(reply["status"], "SUCCESS");
    assert_eq!(reply["action"], "right");
    environment.join().expect("environment thread should finish");
}

#[test]
fn framed_client_against_zmq_socket_suggests_wire_flag() {
    let (listener, port) = zmq_rep_listener();
    let environment = thread::spawn(move || {
        let stream = listener.accept().expect("client should connect");
        let _ = ZmtpStream::handshake(
            stream,
            SocketType::Rep,
            true,
            FrameConfig::default(),
            Duration::from_secs(2),
        );
    });

    let output = run_client(port, &[], "W\n");
    assert_eq!(output.status.code(), Some(60));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--wire zmq"));
    environment.join().expect("environment thread should finish");
}
