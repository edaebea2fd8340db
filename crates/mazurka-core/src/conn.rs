//! Per-client connection state.
//!
//! One `Connection` lives from accept to close and is reset field-by-field
//! between keep-alive requests; the backing buffers keep their capacity so
//! steady-state service does not touch the allocator.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::time::SystemTime;

use crate::buf::GrowBuf;
use crate::cache::{FileCache, FileMap};
use crate::scan::ScanState;
use crate::stream::Stream;
use crate::syscalls;

pub const READ_BUF_INIT: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Unknown,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"CONNECT" => Method::Connect,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            _ => Method::Unknown,
        }
    }

    /// Case-insensitive variant used on the request line.
    pub fn from_token(tok: &str) -> Self {
        Self::from_bytes(tok.to_ascii_uppercase().as_bytes())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Added(usize),
    WouldBlock,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Everything buffered for this response has gone out.
    Done,
    /// The socket would block; call again on writability.
    Again,
}

pub struct Connection {
    pub stream: Box<dyn Stream>,
    pub client_addr: SocketAddr,
    /// Printable client address; replaced by the first `X-Forwarded-For`
    /// token when a proxy fronts us.
    pub real_ip: String,

    pub read_buf: Vec<u8>,
    pub read_idx: usize,
    pub checked_idx: usize,
    pub scan_state: ScanState,

    pub method: Method,
    pub protocol: String,
    pub one_one: bool,
    /// False for HTTP/0.9: body only, no status line or headers.
    pub mime_flag: bool,

    pub encodedurl: String,
    pub decodedurl: String,
    pub origfilename: String,
    pub expnfilename: String,
    pub pathinfo: String,
    pub query: String,

    pub referer: String,
    pub useragent: String,
    pub accept: String,
    pub accept_encoding: String,
    pub accept_language: String,
    pub cookie: String,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub reqhost: String,
    pub hdrhost: String,
    pub hostname: Option<String>,
    pub hostdir: String,
    pub authorization: String,
    pub remote_user: String,
    pub altdir: String,
    pub tildemapped: bool,

    pub if_modified_since: Option<SystemTime>,
    pub range_if: Option<SystemTime>,
    pub got_range: bool,
    pub first_byte_index: i64,
    pub last_byte_index: i64,

    pub keep_alive: bool,
    pub do_keep_alive: bool,
    pub should_linger: bool,

    pub status: u16,
    pub bytes_to_send: i64,
    pub bytes_sent: i64,

    pub mime_type: String,
    pub encodings: String,
    pub compression: Compression,

    pub response: GrowBuf,
    response_sent: usize,
    pub file_map: Option<FileMap>,
    pub file_meta: Option<fs::Metadata>,
    body_start: u64,
    body_end: u64,
    body_cursor: u64,
    pub(crate) logged: bool,

    // Memo of the last successful Basic-auth check.
    pub(crate) prev_auth_path: String,
    pub(crate) prev_auth_mtime: Option<SystemTime>,
    pub(crate) prev_user: String,
    pub(crate) prev_crypted: String,
}

impl Connection {
    pub fn new(stream: Box<dyn Stream>, client_addr: SocketAddr) -> Self {
        let real_ip = syscalls::ntoa(&client_addr);
        let mut conn = Self {
            stream,
            client_addr,
            real_ip,
            read_buf: vec![0; READ_BUF_INIT],
            read_idx: 0,
            checked_idx: 0,
            scan_state: ScanState::default(),
            method: Method::Unknown,
            protocol: String::new(),
            one_one: false,
            mime_flag: true,
            encodedurl: String::new(),
            decodedurl: String::new(),
            origfilename: String::new(),
            expnfilename: String::new(),
            pathinfo: String::new(),
            query: String::new(),
            referer: String::new(),
            useragent: String::new(),
            accept: String::new(),
            accept_encoding: String::new(),
            accept_language: String::new(),
            cookie: String::new(),
            content_type: String::new(),
            content_length: None,
            reqhost: String::new(),
            hdrhost: String::new(),
            hostname: None,
            hostdir: String::new(),
            authorization: String::new(),
            remote_user: String::new(),
            altdir: String::new(),
            tildemapped: false,
            if_modified_since: None,
            range_if: None,
            got_range: false,
            first_byte_index: 0,
            last_byte_index: -1,
            keep_alive: false,
            do_keep_alive: false,
            should_linger: false,
            status: 0,
            bytes_to_send: 0,
            bytes_sent: 0,
            mime_type: String::new(),
            encodings: String::new(),
            compression: Compression::None,
            response: GrowBuf::new(),
            response_sent: 0,
            file_map: None,
            file_meta: None,
            body_start: 0,
            body_end: 0,
            body_cursor: 0,
            logged: false,
            prev_auth_path: String::new(),
            prev_auth_mtime: None,
            prev_user: String::new(),
            prev_crypted: String::new(),
        };
        conn.clear_request();
        conn
    }

    /// Reset everything request-scoped; buffer capacity and the auth memo
    /// survive for the next keep-alive iteration.
    pub fn clear_request(&mut self) {
        self.read_idx = 0;
        self.checked_idx = 0;
        self.scan_state = ScanState::default();
        self.method = Method::Unknown;
        self.protocol.clear();
        self.protocol.push_str("UNKNOWN");
        self.one_one = false;
        self.mime_flag = true;
        self.encodedurl.clear();
        self.decodedurl.clear();
        self.origfilename.clear();
        self.expnfilename.clear();
        self.pathinfo.clear();
        self.query.clear();
        self.referer.clear();
        self.useragent.clear();
        self.accept.clear();
        self.accept_encoding.clear();
        self.accept_language.clear();
        self.cookie.clear();
        self.content_type.clear();
        self.content_length = None;
        self.reqhost.clear();
        self.hdrhost.clear();
        self.hostname = None;
        self.hostdir.clear();
        self.authorization.clear();
        self.remote_user.clear();
        self.altdir.clear();
        self.tildemapped = false;
        self.if_modified_since = None;
        self.range_if = None;
        self.got_range = false;
        self.first_byte_index = 0;
        self.last_byte_index = -1;
        self.keep_alive = false;
        self.do_keep_alive = false;
        self.should_linger = false;
        self.status = 0;
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
        self.mime_type.clear();
        self.encodings.clear();
        self.compression = Compression::None;
        self.response.clear();
        self.response_sent = 0;
        self.file_map = None;
        self.file_meta = None;
        self.body_start = 0;
        self.body_end = 0;
        self.body_cursor = 0;
        self.logged = false;
    }

    /// Pull whatever the socket has into the read buffer.
    pub fn read_more(&mut self) -> io::Result<ReadOutcome> {
        if self.read_idx == self.read_buf.len() {
            let grown = std::cmp::max(self.read_buf.len() * 2, READ_BUF_INIT);
            self.read_buf.resize(grown, 0);
        }

        match self.stream.read(&mut self.read_buf[self.read_idx..]) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => {
                self.read_idx += n;
                Ok(ReadOutcome::Added(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Advance the completeness scanner over the newly read bytes.
    pub fn scan_request(&mut self) -> crate::scan::ScanOutcome {
        crate::scan::got_request(
            &self.read_buf,
            &mut self.checked_idx,
            self.read_idx,
            &mut self.scan_state,
        )
    }

    /// Next header line starting at `checked_idx`, with the terminator (LF,
    /// CR or CRLF) consumed.  None when no full line is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        let start = self.checked_idx;
        let i = memchr::memchr2(b'\n', b'\r', &self.read_buf[start..self.read_idx])? + start;
        let line = String::from_utf8_lossy(&self.read_buf[start..i]).into_owned();
        let mut next = i + 1;
        if self.read_buf[i] == b'\r' && next < self.read_idx && self.read_buf[next] == b'\n' {
            next += 1;
        }
        self.checked_idx = next;
        Some(line)
    }

    /// Request-body bytes that arrived together with the headers.
    pub fn body_prefix(&self) -> &[u8] {
        &self.read_buf[self.checked_idx..self.read_idx]
    }

    pub fn add_response(&mut self, bytes: &[u8]) {
        self.response.push(bytes);
    }

    pub fn add_response_str(&mut self, s: &str) {
        self.response.push_str(s);
    }

    /// Arrange for `map[start..end]` to be written after the buffered
    /// headers.
    pub fn set_body_window(&mut self, start: u64, end: u64) {
        self.body_start = start;
        self.body_end = end;
        self.body_cursor = start;
    }

    /// Drive the buffered response (headers, then any mapped body window)
    /// toward the peer.  Bounded progress: returns `Again` on WouldBlock.
    pub fn send_some(&mut self) -> io::Result<SendState> {
        while self.response_sent < self.response.len() {
            let chunk = &self.response.as_slice()[self.response_sent..];
            match self.stream.write(chunk) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => self.response_sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SendState::Again);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if let Some(map) = &self.file_map {
            while self.body_cursor < self.body_end {
                let lo = self.body_cursor as usize;
                let hi = self.body_end as usize;
                let chunk = &map.as_slice()[lo..hi];
                match self.stream.write(chunk) {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                    Ok(n) => {
                        self.body_cursor += n as u64;
                        self.bytes_sent += n as i64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(SendState::Again);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(SendState::Done)
    }

    /// Flush the buffered response completely; used from forked children
    /// and error paths where the socket is in blocking mode.
    pub fn flush_response(&mut self) -> io::Result<()> {
        while self.response_sent < self.response.len() {
            let chunk = &self.response.as_slice()[self.response_sent..];
            match self.stream.write(chunk) {
                Ok(0) => break,
                Ok(n) => self.response_sent += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Half-close for the linger dance; the caller drains afterwards.
    pub fn shutdown_write(&self) {
        syscalls::shutdown_write(self.stream.fd());
    }

    /// Release the file mapping and the socket.  Idempotent.
    pub fn close(&mut self, cache: &dyn FileCache) {
        if let Some(map) = self.file_map.take() {
            cache.unmap(map);
        }
        self.stream.close();
    }
}
