//! Integration tests: real TCP clients against a running daemon.
//!
//! Each test starts a daemon on an ephemeral port, speaks raw HTTP/1.x over
//! a std `TcpStream`, and verifies status line, headers, body, and the
//! keep-alive/close disposition of the socket.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hearth::{
    Config, ConfigBuilder, ConnId, Daemon, FieldKind, PollBackend, RequestAction, RequestCtx,
    Response, ThreadingModel, Upload,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn base_config() -> ConfigBuilder {
    ConfigBuilder::new().bind("127.0.0.1:0".parse().unwrap())
}

fn echo_url(req: &mut RequestCtx<'_>, upload: &mut Upload<'_>) -> RequestAction {
    let n = upload.data().len();
    upload.consume(n);
    if upload.is_last() {
        let body = req.url().to_owned();
        req.queue_response(200, Response::from_buffer(body.into_bytes()));
    }
    RequestAction::Continue
}

fn connect(daemon: &Daemon) -> TcpStream {
    let stream = TcpStream::connect(daemon.local_addr()).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

struct Reply {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

/// Read one response off the stream: status line, headers, then the body
/// per Content-Length or chunked framing (read-to-EOF otherwise).
fn read_reply(stream: &mut TcpStream) -> Reply {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => buf.push(byte[0]),
            Ok(_) => panic!("eof before headers complete: {:?}", String::from_utf8_lossy(&buf)),
            Err(e) => panic!("read error in headers: {e}"),
        }
    }
    let head = String::from_utf8(buf).expect("ascii headers");
    let mut lines = head.split("\r\n");
    let status_line = lines.next().expect("status line");
    let status: u16 = status_line
        .split(' ')
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status");
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let body = if status < 200 || status == 204 || status == 304 {
        Vec::new()
    } else if let Some(length) = headers.get("content-length") {
        let length: usize = length.parse().expect("content-length value");
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).expect("body");
        body
    } else if headers.get("transfer-encoding").map(|v| v.as_str()) == Some("chunked") {
        read_chunked_body(stream)
    } else {
        let mut body = Vec::new();
        let _ = stream.read_to_end(&mut body);
        body
    };
    Reply {
        status,
        headers,
        body,
    }
}

fn read_chunked_body(stream: &mut TcpStream) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let line = read_line(stream);
        let size_text = line.split(';').next().unwrap().trim();
        let size = usize::from_str_radix(size_text, 16).expect("chunk size");
        if size == 0 {
            // Trailers until the blank line.
            loop {
                if read_line(stream).is_empty() {
                    return body;
                }
            }
        }
        let mut chunk = vec![0u8; size];
        stream.read_exact(&mut chunk).expect("chunk data");
        body.extend_from_slice(&chunk);
        let crlf = read_line(stream);
        assert!(crlf.is_empty(), "chunk data must end with CRLF");
    }
}

fn read_line(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).expect("line byte");
        if byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            line.push(byte[0]);
        }
    }
    String::from_utf8(line).expect("ascii line")
}

fn expect_eof(stream: &mut TcpStream) {
    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
        Ok(0) => {}
        Ok(_) => panic!("expected eof, got data"),
        Err(e) => panic!("expected eof, got error: {e}"),
    }
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

// ── Keep-alive disposition ──────────────────────────────────────────

#[test]
fn http11_get_stays_open() {
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, echo_url).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(b"GET /hello_world?a=%26&b=c HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"/hello_world");
    assert!(reply.header("connection").is_none(), "no close header");
    assert!(reply.header("date").is_some());

    wait_until("one active connection", || daemon.active_connections() == 1);

    // The same socket carries a second request.
    stream
        .write_all(b"GET /second HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.body, b"/second");

    daemon.stop();
}

#[test]
fn http10_get_closes_by_default() {
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, echo_url).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(b"GET /hello_world HTTP/1.0\r\nHost: x\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("connection"), Some("close"));
    expect_eof(&mut stream);

    wait_until("no active connections", || daemon.active_connections() == 0);
    daemon.stop();
}

#[test]
fn http10_keep_alive_honored_when_requested() {
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, echo_url).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(b"GET /a HTTP/1.0\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("connection"), Some("Keep-Alive"));

    stream
        .write_all(b"GET /b HTTP/1.0\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.body, b"/b");

    daemon.stop();
}

#[test]
fn close_token_wins_over_keep_alive() {
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, echo_url).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(
            b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\nConnection: keep-alive\r\n\r\n",
        )
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("connection"), Some("close"));
    expect_eof(&mut stream);
    daemon.stop();
}

#[test]
fn handler_close_header_forces_close() {
    let handler = |req: &mut RequestCtx<'_>, upload: &mut Upload<'_>| {
        let n = upload.data().len();
        upload.consume(n);
        if upload.is_last() {
            let resp = Response::from_buffer(&b"bye"[..]);
            resp.add_header("Connection", "close");
            req.queue_response(200, resp);
        }
        RequestAction::Continue
    };
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, handler).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("connection"), Some("close"));
    assert_eq!(reply.body, b"bye");
    expect_eof(&mut stream);
    daemon.stop();
}

// ── Uploads ─────────────────────────────────────────────────────────

#[test]
fn chunked_upload_with_trailer() {
    let received = Arc::new(Mutex::new(Vec::<u8>::new()));
    let trailer = Arc::new(Mutex::new(None::<String>));
    let handler = {
        let received = Arc::clone(&received);
        let trailer = Arc::clone(&trailer);
        move |req: &mut RequestCtx<'_>, upload: &mut Upload<'_>| {
            received.lock().unwrap().extend_from_slice(upload.data());
            let n = upload.data().len();
            upload.consume(n);
            if upload.is_last() {
                *trailer.lock().unwrap() = req
                    .value(FieldKind::Footer, "X-Checksum")
                    .map(|v| v.to_owned());
                req.queue_response(200, Response::from_buffer(&b"ok"[..]));
            }
            RequestAction::Continue
        }
    };
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, handler).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(
            b"POST /upload HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n0\r\nX-Checksum: abc\r\n\r\n",
        )
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);
    assert_eq!(*received.lock().unwrap(), b"hello");
    assert_eq!(trailer.lock().unwrap().as_deref(), Some("abc"));
    daemon.stop();
}

#[test]
fn content_length_upload_delivered() {
    let received = Arc::new(Mutex::new(Vec::<u8>::new()));
    let handler = {
        let received = Arc::clone(&received);
        move |req: &mut RequestCtx<'_>, upload: &mut Upload<'_>| {
            received.lock().unwrap().extend_from_slice(upload.data());
            let n = upload.data().len();
            upload.consume(n);
            if upload.is_last() {
                req.queue_response(200, Response::from_buffer(&b"got it"[..]));
            }
            RequestAction::Continue
        }
    };
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, handler).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello world")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);
    assert_eq!(*received.lock().unwrap(), b"hello world");
    daemon.stop();
}

#[test]
fn expect_100_continue_handshake() {
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, echo_url).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(
            b"PUT /up HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n",
        )
        .unwrap();
    // The interim response arrives before we send the body.
    let interim = read_reply(&mut stream);
    assert_eq!(interim.status, 100);

    stream.write_all(b"hello").unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"/up");
    daemon.stop();
}

#[test]
fn unsupported_expectation_is_417() {
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, echo_url).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(b"PUT / HTTP/1.1\r\nHost: x\r\nExpect: 999-something\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 417);
    assert_eq!(reply.header("connection"), Some("close"));
    expect_eof(&mut stream);
    daemon.stop();
}

// ── Pipelining ──────────────────────────────────────────────────────

#[test]
fn pipelined_requests_answered_in_order() {
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, echo_url).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(
            b"GET /first HTTP/1.1\r\nHost: x\r\n\r\nGET /second HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .unwrap();
    let first = read_reply(&mut stream);
    let second = read_reply(&mut stream);
    assert_eq!(first.body, b"/first");
    assert_eq!(second.body, b"/second");
    daemon.stop();
}

// ── Response bodies ─────────────────────────────────────────────────

#[test]
fn unknown_size_body_goes_out_chunked() {
    let handler = |req: &mut RequestCtx<'_>, upload: &mut Upload<'_>| {
        let n = upload.data().len();
        upload.consume(n);
        if upload.is_last() {
            let payload: &[u8] = b"streamed payload of moderate length";
            let resp = Response::from_callback(None, move |pos, buf| {
                if pos as usize >= payload.len() {
                    return hearth::ContentRead::EndOfStream;
                }
                let n = buf.len().min(payload.len() - pos as usize);
                buf[..n].copy_from_slice(&payload[pos as usize..pos as usize + n]);
                hearth::ContentRead::Data(n)
            });
            resp.add_trailer("X-Stream-End", "yes");
            req.queue_response(200, resp);
        }
        RequestAction::Continue
    };
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, handler).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(b"GET /stream HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("transfer-encoding"), Some("chunked"));
    assert_eq!(reply.body, b"streamed payload of moderate length");
    daemon.stop();
}

#[test]
fn large_chunked_response_round_trips() {
    let handler = |req: &mut RequestCtx<'_>, upload: &mut Upload<'_>| {
        let n = upload.data().len();
        upload.consume(n);
        if upload.is_last() {
            let resp = Response::from_callback(None, |pos, buf| {
                const TOTAL: u64 = 100_000;
                if pos >= TOTAL {
                    return hearth::ContentRead::EndOfStream;
                }
                let n = buf.len().min((TOTAL - pos) as usize);
                for (i, b) in buf[..n].iter_mut().enumerate() {
                    *b = (pos as usize + i) as u8;
                }
                hearth::ContentRead::Data(n)
            });
            req.queue_response(200, resp);
        }
        RequestAction::Continue
    };
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, handler).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(b"GET /big HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body.len(), 100_000);
    for (i, b) in reply.body.iter().enumerate() {
        assert_eq!(*b, i as u8, "byte {i} corrupted");
    }
    daemon.stop();
}

#[test]
fn zero_length_streamed_body() {
    let handler = |req: &mut RequestCtx<'_>, upload: &mut Upload<'_>| {
        let n = upload.data().len();
        upload.consume(n);
        if upload.is_last() {
            let resp =
                Response::from_callback(None, |_, _| hearth::ContentRead::EndOfStream);
            req.queue_response(200, resp);
        }
        RequestAction::Continue
    };
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, handler).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(b"GET /empty HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);
    assert!(reply.body.is_empty());
    daemon.stop();
}

#[test]
fn file_backed_body_served() {
    let path = std::env::temp_dir().join(format!("hearth-test-{}", std::process::id()));
    std::fs::write(&path, b"file contents over the wire").unwrap();
    let file_path = path.clone();

    let handler = move |req: &mut RequestCtx<'_>, upload: &mut Upload<'_>| {
        let n = upload.data().len();
        upload.consume(n);
        if upload.is_last() {
            let file = std::fs::File::open(&file_path).unwrap();
            let size = file.metadata().unwrap().len();
            req.queue_response(200, Response::from_fd(file, 0, size));
        }
        RequestAction::Continue
    };
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, handler).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(b"GET /file HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"file contents over the wire");
    daemon.stop();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn head_request_omits_body() {
    let handler = |req: &mut RequestCtx<'_>, upload: &mut Upload<'_>| {
        let n = upload.data().len();
        upload.consume(n);
        if upload.is_last() {
            req.queue_response(200, Response::from_buffer(&b"invisible"[..]));
        }
        RequestAction::Continue
    };
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, handler).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(b"HEAD / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    // Headers advertise the length, but no body follows.
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Content-Length: 9\r\n"));
    assert!(text.ends_with("\r\n\r\n"), "no body after headers: {text:?}");
    daemon.stop();
}

// ── Protocol errors ─────────────────────────────────────────────────

#[test]
fn malformed_request_line_is_400() {
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, echo_url).unwrap();

    let mut stream = connect(&daemon);
    stream.write_all(b"NOT A VALID LINE EXTRA\r\n\r\n").unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 400);
    assert_eq!(reply.header("connection"), Some("close"));
    expect_eof(&mut stream);
    daemon.stop();
}

#[test]
fn oversized_headers_are_431() {
    let config = base_config()
        .memory_limit(1024)
        .memory_increment(128)
        .build()
        .unwrap();
    let daemon = Daemon::start(config, echo_url).unwrap();

    let mut stream = connect(&daemon);
    let huge = "x".repeat(4096);
    stream
        .write_all(format!("GET / HTTP/1.1\r\nHost: x\r\nX-Big: {huge}\r\n\r\n").as_bytes())
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 431);
    daemon.stop();
}

#[test]
fn conflicting_framing_is_400() {
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, echo_url).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\
              Transfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 400);
    daemon.stop();
}

// ── Suspend/resume ──────────────────────────────────────────────────

#[test]
fn suspended_connection_resumes_with_late_response() {
    let (tx, rx) = std::sync::mpsc::channel::<ConnId>();
    let tx = Mutex::new(tx);
    let handler = move |req: &mut RequestCtx<'_>, _upload: &mut Upload<'_>| {
        req.suspend();
        tx.lock().unwrap().send(req.connection_id()).unwrap();
        RequestAction::Continue
    };
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, handler).unwrap();

    let mut stream = connect(&daemon);
    stream
        .write_all(b"GET /wait HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let id = rx.recv_timeout(Duration::from_secs(5)).expect("conn id");
    std::thread::sleep(Duration::from_millis(50));
    daemon
        .queue_response(id, 200, Response::from_buffer(&b"late"[..]))
        .unwrap();

    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"late");
    daemon.stop();
}

// ── Limits and timeouts ─────────────────────────────────────────────

#[test]
fn idle_connection_evicted_by_timeout() {
    let config = base_config()
        .connection_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let daemon = Daemon::start(config, echo_url).unwrap();

    let mut stream = connect(&daemon);
    // Send nothing; the daemon should drop us.
    expect_eof(&mut stream);
    wait_until("eviction", || daemon.active_connections() == 0);
    daemon.stop();
}

#[test]
fn global_connection_limit_refuses_excess() {
    let config = base_config().global_connection_limit(1).build().unwrap();
    let daemon = Daemon::start(config, echo_url).unwrap();

    let mut first = connect(&daemon);
    first
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut first);
    assert_eq!(reply.status, 200);

    // Still holding the first connection: the second is turned away.
    let mut second = connect(&daemon);
    expect_eof(&mut second);
    daemon.stop();
}

#[test]
fn accept_policy_rejects() {
    struct RejectAll;
    impl hearth::Handler for RejectAll {
        fn on_request(
            &self,
            _req: &mut RequestCtx<'_>,
            _upload: &mut Upload<'_>,
        ) -> RequestAction {
            RequestAction::Abort
        }
        fn accept_policy(&self, _addr: &std::net::SocketAddr) -> bool {
            false
        }
    }
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, RejectAll).unwrap();

    let mut stream = connect(&daemon);
    expect_eof(&mut stream);
    assert_eq!(daemon.active_connections(), 0);
    daemon.stop();
}

// ── Threading models and poll backends ──────────────────────────────

fn exchange_roundtrip(config: Config) {
    let daemon = Daemon::start(config, echo_url).unwrap();
    let mut stream = connect(&daemon);
    stream
        .write_all(b"GET /model HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"/model");
    daemon.stop();
}

#[test]
fn thread_pool_model_serves() {
    let config = base_config()
        .threading(ThreadingModel::ThreadPool(2))
        .build()
        .unwrap();
    exchange_roundtrip(config);
}

#[test]
fn thread_per_connection_model_serves() {
    let config = base_config()
        .threading(ThreadingModel::ThreadPerConnection)
        .build()
        .unwrap();
    exchange_roundtrip(config);
}

#[test]
fn select_backend_serves() {
    let config = base_config()
        .poll_backend(PollBackend::Select)
        .build()
        .unwrap();
    exchange_roundtrip(config);
}

#[test]
fn poll_backend_serves() {
    let config = base_config()
        .poll_backend(PollBackend::Poll)
        .build()
        .unwrap();
    exchange_roundtrip(config);
}

#[test]
fn external_event_loop_host_driven() {
    let config = base_config()
        .threading(ThreadingModel::ExternalEventLoop)
        .build()
        .unwrap();
    let daemon = Arc::new(Daemon::start(config, echo_url).unwrap());

    // Host loop: report every watched fd as ready; spurious readiness is
    // harmless (level-triggered semantics, would-block reads are ignored).
    let driver_daemon = Arc::clone(&daemon);
    let running = Arc::new(AtomicUsize::new(1));
    let driver_flag = Arc::clone(&running);
    let driver = std::thread::spawn(move || {
        while driver_flag.load(Ordering::SeqCst) == 1 {
            let (read, write) = driver_daemon.get_fdset().unwrap();
            driver_daemon.run_from_select(&read, &write).unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
    });

    let mut stream = connect(&daemon);
    stream
        .write_all(b"GET /external HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"/external");

    running.store(0, Ordering::SeqCst);
    driver.join().unwrap();
    drop(stream);
    Arc::try_unwrap(daemon).ok().expect("sole owner").stop();
}

// ── Shutdown ────────────────────────────────────────────────────────

#[test]
fn stop_closes_open_connections() {
    let config = base_config().build().unwrap();
    let daemon = Daemon::start(config, echo_url).unwrap();
    let addr = daemon.local_addr();

    let mut stream = connect(&daemon);
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);

    daemon.stop();
    expect_eof(&mut stream);
    // Listener is gone.
    assert!(TcpStream::connect(addr).is_err());
}
