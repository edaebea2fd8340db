//! End-to-end tests driving the engine over real sockets.  The test plays
//! the readiness loop: accept, read until the scanner reports a complete
//! request, dispatch, pump the response out, log, close or keep alive.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::IntoRawFd;
use std::sync::Arc;
use std::thread;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use mazurka_core::conn::ReadOutcome;
use mazurka_core::stream::PlainStream;
use mazurka_core::timer::RecordingTimers;
use mazurka_core::{
    dispatch, response, syscalls, Connection, HttpdServer, ScanOutcome, SendState, ServerConfig,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One worker iteration: everything the readiness loop would do for a
/// connection, on a blocking socket.
fn serve_one(hs: &HttpdServer, stream: TcpStream) {
    let peer = stream.peer_addr().unwrap();
    let fd = stream.into_raw_fd();
    let mut hc = Connection::new(Box::new(PlainStream::new(fd)), peer);
    let mut timers = RecordingTimers::default();

    loop {
        match hc.read_more() {
            Ok(ReadOutcome::Added(_)) => {}
            _ => break,
        }

        match hc.scan_request() {
            ScanOutcome::NeedMore => continue,
            ScanOutcome::Bad => {
                response::send_err(hs, &mut hc, 400, "", response::ERR400_FORM, "");
                let _ = hc.flush_response();
                hs.log_request(&mut hc);
                break;
            }
            ScanOutcome::Complete => {
                let _ = dispatch::serve_request(hs, &mut hc, &mut timers);
                loop {
                    match hc.send_some() {
                        Ok(SendState::Done) => break,
                        Ok(SendState::Again) => continue,
                        Err(_) => break,
                    }
                }
                hs.log_request(&mut hc);

                while let Some((pid, _)) = syscalls::waitpid_nohang() {
                    hs.untrack_cgi(pid);
                }

                if hc.do_keep_alive {
                    hc.clear_request();
                    continue;
                }
                break;
            }
        }
    }

    hc.close(hs.cache.as_ref());
}

fn spawn_server(config: ServerConfig) -> (SocketAddr, Arc<HttpdServer>) {
    init_logging();
    // Scratch roots come out of mkdtemp as 0700; the engine insists on
    // world-readable trees.
    std::fs::set_permissions(&config.root, std::fs::Permissions::from_mode(0o755)).unwrap();
    let hs = Arc::new(HttpdServer::with_defaults(config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = hs.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let hs = server.clone();
            thread::spawn(move || serve_one(&hs, stream));
        }
    });

    (addr, hs)
}

fn roundtrip(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(request).unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    out
}

fn header_block(raw: &[u8]) -> String {
    let end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator");
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn body_of(raw: &[u8]) -> &[u8] {
    let end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator");
    &raw[end + 4..]
}

#[test]
fn serves_index_file_for_root() {
    let docroot = tempfile::tempdir().unwrap();
    std::fs::write(docroot.path().join("index.html"), b"<h1>home</h1>\n").unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let raw = roundtrip(addr, b"GET / HTTP/1.0\r\nHost: h\r\n\r\n");
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.0 200 OK\r\n"), "{head}");
    assert!(head.contains("Content-Type: text/html; charset=UTF-8"));
    assert!(head.contains("Content-Length: 14"));
    assert_eq!(body_of(&raw), b"<h1>home</h1>\n");
}

#[test]
fn directory_without_slash_redirects() {
    let docroot = tempfile::tempdir().unwrap();
    std::fs::create_dir(docroot.path().join("pics")).unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let raw = roundtrip(addr, b"GET /pics HTTP/1.1\r\nHost: h\r\n\r\n");
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.1 302 Found\r\n"), "{head}");
    assert!(head.contains("Location: /pics/\r\n"));
}

#[test]
fn traversal_attempt_gets_400_subcode_6() {
    let docroot = tempfile::tempdir().unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let raw = roundtrip(addr, b"GET /../etc/passwd HTTP/1.0\r\n\r\n");
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.0 400 Bad Request\r\n"), "{head}");
    assert!(head.contains("Cache-Control: no-cache,no-store"));
    let body = String::from_utf8_lossy(body_of(&raw)).into_owned();
    assert!(body.contains("(6)"), "{body}");
}

#[test]
fn byte_range_beats_gzip() {
    let docroot = tempfile::tempdir().unwrap();
    std::fs::write(docroot.path().join("a.html"), b"01234567890123456789").unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let raw = roundtrip(
        addr,
        b"GET /a.html HTTP/1.1\r\nHost: h\r\nRange: bytes=5-9\r\nAccept-Encoding: gzip\r\n\r\n",
    );
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.1 206 Partial Content\r\n"), "{head}");
    assert!(head.contains("Content-Range: bytes 5-9/20"));
    assert!(head.contains("Content-Length: 5"));
    assert!(!head.contains("Content-Encoding"));
    assert_eq!(body_of(&raw), b"56789");
}

#[test]
fn protected_directory_wants_credentials() {
    let docroot = tempfile::tempdir().unwrap();
    std::fs::create_dir(docroot.path().join("protected")).unwrap();
    let crypted = mazurka_core::access::md5_crypt(b"hunter2", b"ab012345");
    std::fs::write(
        docroot.path().join("protected/.htpasswd"),
        format!("joe:{crypted}\n"),
    )
    .unwrap();
    std::fs::write(docroot.path().join("protected/index.html"), b"secret\n").unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let raw = roundtrip(addr, b"GET /protected/ HTTP/1.0\r\n\r\n");
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.0 401 Unauthorized\r\n"), "{head}");
    assert!(head.contains("WWW-Authenticate: Basic realm=\"protected\""));

    let auth = STANDARD.encode("joe:hunter2");
    let req = format!("GET /protected/ HTTP/1.0\r\nAuthorization: Basic {auth}\r\n\r\n");
    let raw = roundtrip(addr, req.as_bytes());
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.0 200 OK\r\n"), "{head}");
    assert_eq!(body_of(&raw), b"secret\n");
}

#[test]
fn cgi_child_is_spawned_and_interposed() {
    let docroot = tempfile::tempdir().unwrap();
    let cgi_dir = docroot.path().join("cgi-bin");
    std::fs::create_dir(&cgi_dir).unwrap();
    let script = cgi_dir.join("echo");
    std::fs::write(
        &script,
        b"#!/bin/sh\necho \"Status: 201\"\necho \"Content-Type: text/plain\"\necho\ncat\n",
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let (addr, hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        cgi_pattern: Some("cgi-bin/*".to_string()),
        cgi_limit: 4,
        ..Default::default()
    });

    let raw = roundtrip(
        addr,
        b"POST /cgi-bin/echo HTTP/1.1\r\nHost: h\r\nContent-Length: 11\r\n\r\nhello world",
    );
    let text = String::from_utf8_lossy(&raw).into_owned();
    assert!(text.starts_with("HTTP/1.0 201 Created\r\n"), "{text}");
    assert!(text.contains("Content-Type: text/plain"));
    assert!(text.ends_with("hello world\n") || text.contains("hello world"), "{text}");

    // The reaper has run by now for most schedules; at the very least the
    // tracker never exceeds its limit.
    assert!(hs.cgi_count() <= 4);
}

#[test]
fn cgi_admission_control_returns_503() {
    let docroot = tempfile::tempdir().unwrap();
    let cgi_dir = docroot.path().join("cgi-bin");
    std::fs::create_dir(&cgi_dir).unwrap();
    let script = cgi_dir.join("t");
    std::fs::write(&script, b"#!/bin/sh\necho\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let (addr, hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        cgi_pattern: Some("cgi-bin/*".to_string()),
        cgi_limit: 1,
        ..Default::default()
    });

    // Fill the only slot with a fake child.
    hs.track_cgi(999_999).unwrap();

    let raw = roundtrip(addr, b"GET /cgi-bin/t HTTP/1.1\r\nHost: h\r\n\r\n");
    let head = header_block(&raw);
    assert!(
        head.starts_with("HTTP/1.1 503 Service Temporarily Overloaded\r\n"),
        "{head}"
    );
    hs.untrack_cgi(999_999);
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let docroot = tempfile::tempdir().unwrap();
    std::fs::write(docroot.path().join("a.txt"), b"AAAA").unwrap();
    std::fs::write(docroot.path().join("b.txt"), b"BB").unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"GET /a.txt HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let first = read_one_response(&mut stream);
    assert!(first.0.contains("Connection: keep-alive"), "{}", first.0);
    assert_eq!(first.1, b"AAAA");

    stream
        .write_all(b"GET /b.txt HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    let head = header_block(&rest);
    assert!(head.contains("Connection: close"), "{head}");
    assert_eq!(body_of(&rest), b"BB");
}

/// Read exactly one framed response (headers + Content-Length body).
fn read_one_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        buf.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&buf[..buf.len() - 4]).into_owned();
    let len = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

#[test]
fn conditional_get_yields_304() {
    let docroot = tempfile::tempdir().unwrap();
    std::fs::write(docroot.path().join("page.html"), b"cached forever").unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let req = format!(
        "GET /page.html HTTP/1.1\r\nHost: h\r\nIf-Modified-Since: {}\r\n\r\n",
        httpdate::fmt_http_date(std::time::SystemTime::now() + std::time::Duration::from_secs(60))
    );
    let raw = roundtrip(addr, req.as_bytes());
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.1 304 Not Modified\r\n"), "{head}");
    assert!(body_of(&raw).is_empty());
}

#[test]
fn on_the_fly_gzip_for_eligible_bodies() {
    let docroot = tempfile::tempdir().unwrap();
    let content = "the quick brown fox jumps over the lazy dog\n".repeat(20);
    std::fs::write(docroot.path().join("big.html"), &content).unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let raw = roundtrip(
        addr,
        b"GET /big.html HTTP/1.1\r\nHost: h\r\nAccept-Encoding: gzip\r\n\r\n",
    );
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Content-Encoding: gzip"));
    assert!(head.contains("Vary: Accept-Encoding"));
    // Deflated bodies go out without a length.
    assert!(!head.contains("Content-Length:"));

    let mut decoder = flate2::read::GzDecoder::new(body_of(&raw));
    let mut plain = String::new();
    decoder.read_to_string(&mut plain).unwrap();
    assert_eq!(plain, content);
}

#[test]
fn fresher_precompressed_sibling_is_preferred() {
    let docroot = tempfile::tempdir().unwrap();
    let content = "static asset body that compresses fine\n".repeat(10);
    std::fs::write(docroot.path().join("site.css"), &content).unwrap();

    let mut gz = Vec::new();
    {
        use std::io::Write as _;
        let mut enc =
            flate2::write::GzEncoder::new(&mut gz, flate2::Compression::default());
        enc.write_all(content.as_bytes()).unwrap();
        enc.finish().unwrap();
    }
    std::fs::write(docroot.path().join("site.css.gz"), &gz).unwrap();

    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let raw = roundtrip(
        addr,
        b"GET /site.css HTTP/1.1\r\nHost: h\r\nAccept-Encoding: gzip\r\n\r\n",
    );
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Content-Encoding: gzip"));
    assert_eq!(body_of(&raw), &gz[..]);
}

#[test]
fn directory_listing_lists_sorted_entries() {
    let docroot = tempfile::tempdir().unwrap();
    let dir = docroot.path().join("files");
    std::fs::create_dir(&dir).unwrap();
    std::fs::create_dir(dir.join("sub")).unwrap();
    std::fs::write(dir.join("zeta.txt"), b"z").unwrap();
    std::fs::write(dir.join("alpha.txt"), b"a").unwrap();
    std::fs::write(dir.join(".hidden-file"), b"x").unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let raw = roundtrip(addr, b"GET /files/ HTTP/1.1\r\nHost: h\r\n\r\n");
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Content-Type: text/html; charset=UTF-8"));

    let body = String::from_utf8_lossy(body_of(&raw)).into_owned();
    assert!(body.contains("Parent Directory"));
    assert!(body.contains("href=\"/files/sub/\""));
    let alpha = body.find("alpha.txt").unwrap();
    let zeta = body.find("zeta.txt").unwrap();
    let sub = body.find("href=\"/files/sub/\"").unwrap();
    // Directories first, then files in sorted order.
    assert!(sub < alpha && alpha < zeta);
    assert!(!body.contains(".hidden-file"));
}

#[test]
fn http09_gets_body_only() {
    let docroot = tempfile::tempdir().unwrap();
    std::fs::write(docroot.path().join("plain.txt"), b"raw bytes here").unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let raw = roundtrip(addr, b"GET /plain.txt\r\n");
    assert_eq!(&raw[..], b"raw bytes here");
}

#[test]
fn head_has_headers_but_no_body() {
    let docroot = tempfile::tempdir().unwrap();
    std::fs::write(docroot.path().join("x.txt"), b"0123456789").unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let raw = roundtrip(addr, b"HEAD /x.txt HTTP/1.0\r\n\r\n");
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.0 200 OK\r\n"), "{head}");
    assert!(head.contains("Content-Length: 10"));
    assert!(body_of(&raw).is_empty());
}

#[test]
fn options_lists_allowed_methods() {
    let docroot = tempfile::tempdir().unwrap();
    std::fs::write(docroot.path().join("x.txt"), b"x").unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let raw = roundtrip(addr, b"OPTIONS /x.txt HTTP/1.1\r\nHost: h\r\n\r\n");
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Allow: OPTIONS,GET,HEAD"));
    assert!(head.contains("Content-Length: 0"));
}

#[test]
fn missing_file_is_404_not_found() {
    let docroot = tempfile::tempdir().unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let raw = roundtrip(addr, b"GET /nope.txt HTTP/1.0\r\n\r\n");
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.0 404 Not Found\r\n"), "{head}");
}

#[test]
fn custom_error_page_overrides_builtin() {
    let docroot = tempfile::tempdir().unwrap();
    std::fs::create_dir(docroot.path().join("errs")).unwrap();
    std::fs::write(docroot.path().join("errs/err404.html"), b"<p>custom miss</p>").unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let raw = roundtrip(addr, b"GET /gone HTTP/1.0\r\n\r\n");
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.0 404 Not Found\r\n"), "{head}");
    let body = String::from_utf8_lossy(body_of(&raw)).into_owned();
    assert_eq!(body, "<p>custom miss</p>");
}

#[test]
fn unknown_method_is_501() {
    let docroot = tempfile::tempdir().unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let raw = roundtrip(addr, b"BREW /pot HTTP/1.1\r\nHost: h\r\n\r\n");
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.1 501 Not Implemented\r\n"), "{head}");
}

#[test]
fn symlink_escaping_the_tree_is_forbidden() {
    let docroot = tempfile::tempdir().unwrap();
    std::os::unix::fs::symlink("/etc", docroot.path().join("leak")).unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        ..Default::default()
    });

    let raw = roundtrip(addr, b"GET /leak/hostname HTTP/1.0\r\n\r\n");
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.0 403 Forbidden\r\n"), "{head}");
}

#[derive(Default)]
struct CaptureSink(std::sync::Mutex<Vec<mazurka_core::accesslog::LogRecord>>);

impl mazurka_core::accesslog::AccessSink for CaptureSink {
    fn log(&self, record: &mazurka_core::accesslog::LogRecord) {
        self.0.lock().unwrap().push(record.clone());
    }
}

#[test]
fn forwarded_for_replaces_the_logged_client() {
    init_logging();
    let docroot = tempfile::tempdir().unwrap();
    std::fs::set_permissions(docroot.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
    std::fs::write(docroot.path().join("x.txt"), b"x").unwrap();

    let records = Arc::new(CaptureSink::default());
    let hs = Arc::new(
        HttpdServer::init(
            ServerConfig {
                root: docroot.path().to_path_buf(),
                ..Default::default()
            },
            Box::new(mazurka_core::ReadCache),
            Box::new(SharedSink(records.clone())),
        )
        .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = hs.clone();
    thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            serve_one(&server, stream);
        }
    });

    let raw = roundtrip(
        addr,
        b"GET /x.txt HTTP/1.0\r\nX-Forwarded-For: 203.0.113.9, 10.0.0.1\r\n\r\n",
    );
    assert!(header_block(&raw).starts_with("HTTP/1.0 200 OK\r\n"));

    let records = records.0.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].client_ip, "203.0.113.9");
    assert_eq!(records[0].method, "GET");
    assert_eq!(records[0].status, 200);
    assert_eq!(records[0].bytes, Some(1));
}

/// Adapter so the test can keep a handle on the records the server sinks.
struct SharedSink(Arc<CaptureSink>);

impl mazurka_core::accesslog::AccessSink for SharedSink {
    fn log(&self, record: &mazurka_core::accesslog::LogRecord) {
        self.0.0.lock().unwrap().push(record.clone());
    }
}

#[test]
fn vhost_maps_host_header_to_subtree() {
    let docroot = tempfile::tempdir().unwrap();
    std::fs::create_dir(docroot.path().join("alpha.example")).unwrap();
    std::fs::write(
        docroot.path().join("alpha.example/index.html"),
        b"alpha home\n",
    )
    .unwrap();
    let (addr, _hs) = spawn_server(ServerConfig {
        root: docroot.path().to_path_buf(),
        vhost: true,
        ..Default::default()
    });

    let raw = roundtrip(addr, b"GET / HTTP/1.1\r\nHost: alpha.example\r\n\r\n");
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert_eq!(body_of(&raw), b"alpha home\n");

    let raw = roundtrip(addr, b"GET / HTTP/1.1\r\nHost: other.example\r\n\r\n");
    let head = header_block(&raw);
    assert!(head.starts_with("HTTP/1.1 404"), "{head}");
}
