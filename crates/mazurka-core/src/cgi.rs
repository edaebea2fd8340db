//! CGI dispatch: admission control, the forked child with its environment
//! and argument vectors, and the optional interposer processes that mediate
//! between the client socket and the script.
//!
//! The parent never writes to the socket again once a child is dispatched;
//! the child (or its output interposer) owns the response bytes until it
//! exits.

use std::ffi::CString;
use std::time::Duration;

use crate::conn::{Connection, Method};
use crate::config::SERVER_SOFTWARE;
use crate::error::{Error, Result};
use crate::parser::{abort, strdecode};
use crate::pattern;
use crate::response::{self, ERR500_FORM, ERR501_FORM, ERR503_FORM};
use crate::server::HttpdServer;
use crate::stream::PlainStream;
use crate::syscalls::{self, Fork};
use crate::timer::{TimerEvent, TimerSet};

/// Logged byte count for CGI responses, whose true size we never see.
pub const CGI_BYTECOUNT: i64 = 25000;
/// PATH handed to scripts.
pub const CGI_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Does the expanded filename select a CGI program?  A vhost directory
/// prefix is stripped before the pattern is applied.
pub fn is_cgi(hs: &HttpdServer, hc: &Connection) -> bool {
    let Some(cgi_pattern) = &hs.config.cgi_pattern else {
        return false;
    };

    let mut filename = hc.expnfilename.as_str();
    if hs.config.vhost && !hc.hostdir.is_empty() {
        let vhost_pattern = format!("{}/**", hc.hostdir);
        if pattern::matches(&vhost_pattern, filename) {
            filename = &filename[hc.hostdir.len() + 1..];
        }
    }

    pattern::matches(cgi_pattern, filename)
}

/// Dispatch the request to a CGI child.  On success the parent's part is
/// done: status and accounting are set, and the child owns the socket until
/// it exits.
pub fn cgi(hs: &HttpdServer, hc: &mut Connection, timers: &mut dyn TimerSet) -> Result<()> {
    // Too hard to synchronise a child's output with further requests.
    hc.do_keep_alive = false;

    match hc.method {
        Method::Get | Method::Post | Method::Put | Method::Delete => {}
        _ => {
            let m = hc.method.as_str();
            return Err(abort(hs, hc, 501, "", ERR501_FORM, m));
        }
    }

    if hs.config.cgi_limit != 0 && hs.cgi_count() >= hs.config.cgi_limit {
        let url = hc.encodedurl.clone();
        return Err(abort(hs, hc, 503, "", ERR503_FORM, &url));
    }

    syscalls::clear_ndelay(hc.stream.fd()).map_err(Error::Io)?;

    match syscalls::fork() {
        Err(e) => {
            log::error!("fork: {e}");
            let url = hc.encodedurl.clone();
            Err(abort(hs, hc, 500, "", ERR500_FORM, &url))
        }
        Ok(Fork::Child) => {
            hs.unlisten();
            cgi_child(hs, hc)
        }
        Ok(Fork::Parent(pid)) => {
            log::info!(
                "{}: CGI[{pid}] /{}{} \"{}\" \"{}\"",
                hc.real_ip,
                hc.expnfilename,
                hc.encodedurl,
                hc.referer,
                hc.useragent
            );

            if hs.config.cgi_limit != 0 && hs.track_cgi(pid).is_err() {
                log::error!("no free CGI slot for pid {pid}");
            }
            if hs.config.cgi_timelimit > 0 {
                timers.schedule(
                    Duration::from_secs(hs.config.cgi_timelimit),
                    TimerEvent::CgiSoftKill(pid),
                );
            }

            hc.status = 200;
            hc.bytes_sent = CGI_BYTECOUNT;
            hc.should_linger = false;
            Ok(())
        }
    }
}

/// Timer callback for the kill escalation: SIGINT first, SIGKILL five
/// seconds later if the child is still around.
pub fn on_timer(event: TimerEvent, timers: &mut dyn TimerSet) {
    match event {
        TimerEvent::CgiSoftKill(pid) => {
            if syscalls::kill(pid, libc::SIGINT).is_ok() {
                log::error!("killed CGI process {pid}");
                timers.schedule(Duration::from_secs(5), TimerEvent::CgiHardKill(pid));
            }
        }
        TimerEvent::CgiHardKill(pid) => {
            if syscalls::kill(pid, libc::SIGKILL).is_ok() {
                log::error!("hard-killed CGI process {pid}");
            }
        }
    }
}

fn child_error_500(hs: &HttpdServer, hc: &mut Connection) -> ! {
    let url = hc.encodedurl.clone();
    response::send_err(hs, hc, 500, "", ERR500_FORM, &url);
    let _ = hc.flush_response();
    syscalls::exit(1);
}

/// The forked child: plumb stdin/stdout, build the vectors, exec.
fn cgi_child(hs: &HttpdServer, hc: &mut Connection) -> ! {
    // Linux copies close-on-exec across dup, so clear it explicitly.
    let _ = syscalls::clear_cloexec(hc.stream.fd());

    // Move the socket off the stdio descriptors before the dup2 shuffle.
    if (0..=2).contains(&hc.stream.fd()) {
        if let Ok(moved) = syscalls::dup(hc.stream.fd()) {
            hc.stream = Box::new(PlainStream::new(moved));
        }
    }
    let conn_fd = hc.stream.fd();

    let envp = make_env(hs, hc);
    let (binary, directory, argv) = make_argv(hc);

    // stdin: replay any buffered body through an interposer, else wire the
    // socket straight in.
    if (hc.method == Method::Post || hc.method == Method::Put)
        && hc.read_idx >= hc.checked_idx
    {
        let Ok((rp, wp)) = syscalls::pipe() else {
            log::error!("pipe failed for CGI stdin");
            child_error_500(hs, hc);
        };
        match syscalls::fork() {
            Err(e) => {
                log::error!("fork: {e}");
                child_error_500(hs, hc);
            }
            Ok(Fork::Child) => {
                syscalls::close_fd(rp);
                cgi_interpose_input(hc, wp);
                syscalls::exit(0);
            }
            Ok(Fork::Parent(_)) => {
                syscalls::close_fd(wp);
                if rp != 0 {
                    let _ = syscalls::dup2(rp, 0);
                    syscalls::close_fd(rp);
                }
            }
        }
    } else if conn_fd != 0 {
        let _ = syscalls::dup2(conn_fd, 0);
    }

    // stdout/stderr: parse-and-rewrite headers unless the script says it
    // speaks raw HTTP (nph-) or the client is HTTP/0.9.
    if !binary.starts_with("nph-") && hc.mime_flag {
        let Ok((rp, wp)) = syscalls::pipe() else {
            log::error!("pipe failed for CGI stdout");
            child_error_500(hs, hc);
        };
        match syscalls::fork() {
            Err(e) => {
                log::error!("fork: {e}");
                child_error_500(hs, hc);
            }
            Ok(Fork::Child) => {
                syscalls::close_fd(wp);
                cgi_interpose_output(hc, rp);
                syscalls::exit(0);
            }
            Ok(Fork::Parent(_)) => {
                syscalls::close_fd(rp);
                if wp != 1 {
                    let _ = syscalls::dup2(wp, 1);
                }
                if wp != 2 {
                    let _ = syscalls::dup2(wp, 2);
                }
                if wp != 1 && wp != 2 {
                    syscalls::close_fd(wp);
                }
            }
        }
    } else {
        if conn_fd != 1 {
            let _ = syscalls::dup2(conn_fd, 1);
        }
        if conn_fd != 2 {
            let _ = syscalls::dup2(conn_fd, 2);
        }
    }

    // Run from the script's own directory, like everyone else does.
    let dir = if directory.is_empty() {
        hs.root().to_path_buf()
    } else {
        hs.fs_path(&directory)
    };
    if let Ok(cdir) = CString::new(dir.as_os_str().as_encoded_bytes()) {
        let _ = syscalls::chdir(&cdir);
    }

    syscalls::default_sigpipe();

    let Ok(cbinary) = CString::new(binary.clone()) else {
        child_error_500(hs, hc);
    };
    let e = syscalls::execve(&cbinary, &argv, &envp);
    log::error!("execve {binary} ({}): {e}", hc.expnfilename);
    child_error_500(hs, hc);
}

/// CGI/1.1 environment plus the HTTP_* mirrors of recognised headers.
fn make_env(hs: &HttpdServer, hc: &Connection) -> Vec<CString> {
    let mut env: Vec<String> = Vec::with_capacity(24);
    let mut put = |s: String| env.push(s);

    put(format!("PATH={CGI_PATH}"));
    put(format!("SERVER_SOFTWARE={SERVER_SOFTWARE}"));
    let host = hs.get_hostname(hc);
    if !host.is_empty() {
        put(format!("SERVER_NAME={host}"));
    }
    put("GATEWAY_INTERFACE=CGI/1.1".to_string());
    put(format!("SERVER_PROTOCOL={}", hc.protocol));
    put(format!("SERVER_PORT={}", hs.config.port));
    put(format!("REQUEST_METHOD={}", hc.method.as_str()));
    if !hc.pathinfo.is_empty() {
        put(format!("PATH_INFO=/{}", hc.pathinfo));
        put(format!(
            "PATH_TRANSLATED={}",
            hs.fs_path(&hc.pathinfo).display()
        ));
    }
    put(format!(
        "SCRIPT_NAME=/{}",
        if hc.origfilename == "." {
            ""
        } else {
            hc.origfilename.as_str()
        }
    ));
    put(format!(
        "SCRIPT_FILENAME={}",
        hs.fs_path(&hc.expnfilename).display()
    ));
    if !hc.query.is_empty() {
        put(format!("QUERY_STRING={}", hc.query));
    }
    put(format!("REMOTE_ADDR={}", hc.real_ip));
    if !hc.referer.is_empty() {
        put(format!("HTTP_REFERER={}", hc.referer));
    }
    if !hc.useragent.is_empty() {
        put(format!("HTTP_USER_AGENT={}", hc.useragent));
    }
    if !hc.accept.is_empty() {
        put(format!("HTTP_ACCEPT={}", hc.accept));
    }
    if !hc.accept_encoding.is_empty() {
        put(format!("HTTP_ACCEPT_ENCODING={}", hc.accept_encoding));
    }
    if !hc.accept_language.is_empty() {
        put(format!("HTTP_ACCEPT_LANGUAGE={}", hc.accept_language));
    }
    if !hc.cookie.is_empty() {
        put(format!("HTTP_COOKIE={}", hc.cookie));
    }
    if !hc.content_type.is_empty() {
        put(format!("CONTENT_TYPE={}", hc.content_type));
    }
    if !hc.hdrhost.is_empty() {
        put(format!("HTTP_HOST={}", hc.hdrhost));
    }
    if let Some(len) = hc.content_length {
        if len > 0 {
            put(format!("CONTENT_LENGTH={len}"));
        }
    }
    if !hc.remote_user.is_empty() {
        put(format!("REMOTE_USER={}", hc.remote_user));
    }
    if !hc.authorization.is_empty() {
        put("AUTH_TYPE=Basic".to_string());
    }
    if let Ok(tz) = std::env::var("TZ") {
        put(format!("TZ={tz}"));
    }
    if let Some(cgi_pattern) = &hs.config.cgi_pattern {
        put(format!("CGI_PATTERN={cgi_pattern}"));
    }

    env.into_iter()
        .filter_map(|s| CString::new(s).ok())
        .collect()
}

/// Argument vector: argv[0] is the script basename; a query without `=`
/// contributes `+`-separated, URL-decoded arguments.  Also splits off the
/// directory to chdir into.
fn make_argv(hc: &Connection) -> (String, String, Vec<CString>) {
    let (directory, binary) = match hc.expnfilename.rfind('/') {
        Some(i) => (
            hc.expnfilename[..i].to_string(),
            hc.expnfilename[i + 1..].to_string(),
        ),
        None => (String::new(), hc.expnfilename.clone()),
    };

    let mut argv: Vec<CString> = Vec::new();
    if let Ok(arg0) = CString::new(binary.clone()) {
        argv.push(arg0);
    }

    if !hc.query.is_empty() && !hc.query.contains('=') {
        let tokens: Vec<&str> = hc.query.split('+').collect();
        let last = tokens.len() - 1;
        for (i, tok) in tokens.into_iter().enumerate() {
            if i == last && tok.is_empty() {
                continue;
            }
            if let Ok(arg) = CString::new(strdecode(tok)) {
                argv.push(arg);
            }
        }
    }

    (binary, directory, argv)
}

/// Feed the script's stdin: replay the already-buffered body prefix, then
/// stream the rest of `Content-Length` from the socket, then swallow up to
/// two bytes of trailing CRLF some clients append.
fn cgi_interpose_input(hc: &mut Connection, wfd: i32) {
    let prefix_len = hc.read_idx - hc.checked_idx;
    if prefix_len > 0 {
        let prefix = hc.read_buf[hc.checked_idx..hc.read_idx].to_vec();
        match syscalls::write_fully(wfd, &prefix) {
            Ok(n) if n == prefix_len => {}
            _ => return,
        }
    }

    let content_length = hc.content_length.unwrap_or(0);
    let mut consumed = prefix_len as u64;
    let mut buf = [0u8; 1024];

    while consumed < content_length {
        let want = std::cmp::min(buf.len() as u64, content_length - consumed) as usize;
        match hc.stream.read(&mut buf[..want]) {
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
            Ok(0) | Err(_) => return,
            Ok(n) => {
                match syscalls::write_fully(wfd, &buf[..n]) {
                    Ok(written) if written == n => {}
                    _ => return,
                }
                consumed += n as u64;
            }
        }
    }

    post_post_garbage_hack(hc);
}

/// Broken browsers send a stray LF or CRLF after the POST body; absorb up
/// to two bytes so the script's close does not trigger a reset.
fn post_post_garbage_hack(hc: &mut Connection) {
    let _ = syscalls::set_ndelay(hc.stream.fd());
    let mut buf = [0u8; 2];
    let _ = hc.stream.read(&mut buf);
}

/// Parse the script's headers, derive the real status from `Status:`,
/// `Location:` or an `HTTP/` line, emit our status line, then echo
/// everything else verbatim.
fn cgi_interpose_output(hc: &mut Connection, rfd: i32) {
    let _ = syscalls::clear_ndelay(hc.stream.fd());

    // Slurp headers (and whatever body bytes ride along).
    let mut headers: Vec<u8> = Vec::with_capacity(512);
    let mut buf = [0u8; 1024];
    let header_end;
    loop {
        match syscalls::read_fd(rfd, &mut buf) {
            Ok(0) | Err(_) => {
                header_end = headers.len();
                break;
            }
            Ok(n) => {
                headers.extend_from_slice(&buf[..n]);
                if let Some(i) = find_subslice(&headers, b"\r\n\r\n") {
                    header_end = i;
                    break;
                }
                if let Some(i) = find_subslice(&headers, b"\n\n") {
                    header_end = i;
                    break;
                }
            }
        }
    }

    if headers.is_empty() {
        return;
    }

    let head_text = String::from_utf8_lossy(&headers[..header_end]).into_owned();
    let mut status: u16 = 200;

    if head_text.starts_with("HTTP/") {
        let after = head_text
            .split_ascii_whitespace()
            .nth(1)
            .unwrap_or("");
        status = after.parse().unwrap_or(200);
    }
    if let Some(v) = header_line_value(&head_text, "Status:") {
        status = v
            .split_ascii_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(200);
    } else if header_line_value(&head_text, "Location:").is_some() {
        status = 302;
    }

    let status_line = format!("HTTP/1.0 {} {}\r\n", status, response::status_title(status));
    if syscalls::write_fully(hc.stream.fd(), status_line.as_bytes()).is_err() {
        return;
    }
    if syscalls::write_fully(hc.stream.fd(), &headers).is_err() {
        return;
    }

    loop {
        match syscalls::read_fd(rfd, &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if syscalls::write_fully(hc.stream.fd(), &buf[..n]).is_err() {
                    break;
                }
            }
        }
    }

    syscalls::shutdown_write(hc.stream.fd());
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    memchr::memmem::find(haystack, needle)
}

/// Value of a `Name:` line anywhere in the header block (start of a line).
fn header_line_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    for line in head.lines() {
        if line.len() >= name.len() && line[..name.len()].eq_ignore_ascii_case(name) {
            return Some(line[name.len()..].trim_start_matches([' ', '\t']));
        }
    }
    None
}
