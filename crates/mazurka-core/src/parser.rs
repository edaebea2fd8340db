//! Request parsing: request line, URL decoding, the recognised header set,
//! and the resolution steps that need the whole request (tilde mapping,
//! vhost mapping, symlink expansion, containment).
//!
//! Client errors buffer an error response on the connection and surface as
//! [`Error::Aborted`]; the 400 bodies carry a numeric sub-code for triage.

use std::time::SystemTime;

use crate::conn::{Compression, Connection, Method};
use crate::config::TildeMap;
use crate::error::{Error, Result};
use crate::path;
use crate::response::{self, ERR400_FORM, ERR404_FORM, ERR500_FORM, ERR501_FORM};
use crate::server::HttpdServer;
use crate::syscalls;

/// Buffer an error response and produce the abort error for `?`.
pub(crate) fn abort(
    hs: &HttpdServer,
    hc: &mut Connection,
    status: u16,
    extra: &str,
    form: &str,
    arg: &str,
) -> Error {
    response::send_err(hs, hc, status, extra, form, arg);
    Error::Aborted(status)
}

/// Strict percent-decoding: `%XX` with two hex digits decodes, anything
/// else passes through.
pub fn strdecode(s: &str) -> Vec<u8> {
    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        if b[i] == b'%' && i + 2 < b.len() {
            if let (Some(hi), Some(lo)) = (hexit(b[i + 1]), hexit(b[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
            out.push(b[i]);
            i += 1;
        } else {
            out.push(b[i]);
            i += 1;
        }
    }
    out
}

fn hexit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Case-insensitive header match; returns the value with leading blanks
/// stripped.
fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    if line.len() >= name.len() && line[..name.len()].eq_ignore_ascii_case(name) {
        Some(line[name.len()..].trim_start_matches([' ', '\t']))
    } else {
        None
    }
}

fn parse_date(value: &str) -> Option<SystemTime> {
    match httpdate::parse_http_date(value.trim()) {
        Ok(t) => Some(t),
        Err(_) => {
            log::debug!("unparsable time: {value}");
            None
        }
    }
}

/// `Range: bytes=N-` and `bytes=N-M` only; multi-range is ignored whole.
fn parse_range(hc: &mut Connection, line: &str) {
    if line.contains(',') {
        return;
    }
    let Some(eq) = line.find('=') else { return };
    let spec = &line[eq + 1..];
    let Some(dash) = spec.find('-') else { return };
    if dash == 0 {
        // Suffix ranges are not supported.
        return;
    }
    let Ok(first) = spec[..dash].trim().parse::<i64>() else {
        return;
    };
    hc.got_range = true;
    hc.first_byte_index = first.max(0);
    let tail = &spec[dash + 1..];
    if tail.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        if let Ok(last) = tail.trim().parse::<i64>() {
            hc.last_byte_index = if last < 0 { -1 } else { last };
        }
    }
}

/// Accept/Accept-Encoding values from repeated header lines are merged with
/// a flood guard.
fn append_merge(field: &mut String, value: &str) {
    if !field.is_empty() {
        if field.len() > 5000 {
            log::error!("way too much Accept data, dropping");
            return;
        }
        field.push_str(", ");
    }
    field.push_str(value);
}

/// Gzip negotiation: the `gzip` token enables compression unless it carries
/// an explicit `q=0`.
fn negotiate_gzip(hc: &mut Connection) {
    let ae = hc.accept_encoding.to_ascii_lowercase();
    let Some(pos) = ae.find("gzip") else { return };
    let params = &ae[pos + 4..];
    let params = match params.find(',') {
        Some(i) => &params[..i],
        None => params,
    };
    let q = params.find("q=").and_then(|i| {
        let v = params[i + 2..].trim_start();
        let end = v
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(v.len());
        v[..end].parse::<f32>().ok()
    });
    if q.is_none_or(|q| q > 0.0) {
        hc.compression = Compression::Gzip;
    }
}

const BAD_KEEPALIVE_AGENTS: &[&str] = &["Mozilla/2", "MSIE 4.0b2;"];

/// Parse the buffered request and resolve the filename.  On return the
/// connection carries the decoded fields, the expanded filename and any
/// path-info tail, ready for dispatch.
pub fn parse_request(hs: &HttpdServer, hc: &mut Connection) -> Result<()> {
    hc.checked_idx = 0;
    let line = hc
        .next_line()
        .ok_or_else(|| abort(hs, hc, 400, "", ERR400_FORM, "1"))?;

    let mut words = line.split_ascii_whitespace();
    let method_str = words
        .next()
        .map(str::to_string)
        .ok_or_else(|| abort(hs, hc, 400, "", ERR400_FORM, "1"))?;
    let mut url = match words.next() {
        Some(u) => u.to_string(),
        None => return Err(abort(hs, hc, 400, "", ERR400_FORM, "1")),
    };
    match words.next() {
        None => {
            hc.protocol = "HTTP/0.9".to_string();
            hc.mime_flag = false;
        }
        Some(protocol) => {
            let mut protocol = protocol.to_string();
            protocol.truncate(20);
            if !protocol.eq_ignore_ascii_case("HTTP/1.0") {
                hc.one_one = true;
            }
            hc.protocol = protocol;
        }
    }

    // HTTP/1.1 absolute-form URL: record the host, keep the origin form.
    if url.len() >= 7 && url[..7].eq_ignore_ascii_case("http://") {
        if !hc.one_one {
            return Err(abort(hs, hc, 400, "", ERR400_FORM, "2"));
        }
        let rest = url[7..].to_string();
        let Some(slash) = rest.find('/') else {
            return Err(abort(hs, hc, 400, "", ERR400_FORM, "3"));
        };
        let host = &rest[..slash];
        if host.is_empty() || host.starts_with('.') {
            return Err(abort(hs, hc, 400, "", ERR400_FORM, "4"));
        }
        hc.reqhost = host.to_string();
        url = rest[slash..].to_string();
    }

    if !url.starts_with('/') {
        return Err(abort(hs, hc, 400, "", ERR400_FORM, "5"));
    }

    hc.method = Method::from_token(&method_str);
    if hc.method == Method::Unknown {
        return Err(abort(hs, hc, 501, "", ERR501_FORM, &method_str));
    }

    hc.encodedurl = url;
    let decoded = strdecode(&hc.encodedurl);
    hc.decodedurl = match String::from_utf8(decoded) {
        Ok(s) => s,
        Err(_) => return Err(abort(hs, hc, 400, "", ERR400_FORM, "5")),
    };

    hc.origfilename = hc.decodedurl[1..].to_string();
    if hc.origfilename.is_empty() {
        hc.origfilename.push('.');
    }

    // Query comes from the encoded URL; the decoded filename loses it.
    if let Some(q) = hc.encodedurl.find('?') {
        hc.query = hc.encodedurl[q + 1..].to_string();
        if let Some(dq) = hc.origfilename.find('?') {
            hc.origfilename.truncate(dq);
        }
    }

    hc.origfilename = path::dedotdot(&hc.origfilename);
    if hc.origfilename.starts_with('/')
        || hc.origfilename == ".."
        || hc.origfilename.starts_with("../")
    {
        return Err(abort(hs, hc, 400, "", ERR400_FORM, "6"));
    }

    if hc.mime_flag {
        parse_headers(hs, hc)?;
    }

    if hc.one_one {
        // HTTP/1.1 requests must name a host, one way or another.
        if hc.reqhost.is_empty() && hc.hdrhost.is_empty() {
            return Err(abort(hs, hc, 400, "", ERR400_FORM, "8"));
        }
        // A keep-alive client may be pipelining; linger on close so its
        // queued bytes do not trigger a reset.
        if hc.keep_alive {
            hc.should_linger = true;
        }
    }

    negotiate_gzip(hc);

    if hc.do_keep_alive
        && BAD_KEEPALIVE_AGENTS
            .iter()
            .any(|bad| hc.useragent.contains(bad))
    {
        hc.do_keep_alive = false;
    }

    resolve_filename(hs, hc)
}

fn parse_headers(hs: &HttpdServer, hc: &mut Connection) -> Result<()> {
    while let Some(line) = hc.next_line() {
        if line.is_empty() {
            break;
        }

        if let Some(v) = header_value(&line, "referer:") {
            hc.referer = v.to_string();
        } else if let Some(v) = header_value(&line, "user-agent:") {
            hc.useragent = v.to_string();
        } else if let Some(v) = header_value(&line, "host:") {
            hc.hdrhost = v.to_string();
            if hc.hdrhost.contains('/') || hc.hdrhost.starts_with('.') {
                return Err(abort(hs, hc, 400, "", ERR400_FORM, "7"));
            }
        } else if let Some(v) = header_value(&line, "accept:") {
            let v = v.to_string();
            append_merge(&mut hc.accept, &v);
        } else if let Some(v) = header_value(&line, "accept-encoding:") {
            let v = v.to_string();
            append_merge(&mut hc.accept_encoding, &v);
        } else if let Some(v) = header_value(&line, "accept-language:") {
            hc.accept_language = v.to_string();
        } else if let Some(v) = header_value(&line, "if-modified-since:") {
            hc.if_modified_since = parse_date(v);
        } else if let Some(v) = header_value(&line, "cookie:") {
            hc.cookie = v.to_string();
        } else if header_value(&line, "range:").is_some() {
            parse_range(hc, &line);
        } else if let Some(v) = header_value(&line, "range-if:") {
            hc.range_if = parse_date(v);
        } else if let Some(v) = header_value(&line, "if-range:") {
            hc.range_if = parse_date(v);
        } else if let Some(v) = header_value(&line, "content-type:") {
            hc.content_type = v.to_string();
        } else if let Some(v) = header_value(&line, "content-length:") {
            hc.content_length = v.trim().parse::<u64>().ok();
        } else if let Some(v) = header_value(&line, "authorization:") {
            hc.authorization = v.to_string();
        } else if let Some(v) = header_value(&line, "connection:") {
            if v.eq_ignore_ascii_case("keep-alive") {
                hc.keep_alive = true;
                hc.do_keep_alive = true;
            }
        } else if let Some(v) = header_value(&line, "x-forwarded-for:") {
            // First token is the real client when a proxy fronts us.
            let first = v
                .split(|c: char| c == ',' || c.is_ascii_whitespace())
                .next()
                .unwrap_or("");
            if !first.is_empty() {
                hc.real_ip = first.to_string();
            }
        }
    }
    Ok(())
}

/// Tilde map, vhost map, symlink expansion and the containment check.
fn resolve_filename(hs: &HttpdServer, hc: &mut Connection) -> Result<()> {
    hc.expnfilename = hc.origfilename.clone();

    if hc.expnfilename.starts_with('~') {
        match &hs.config.tilde_map {
            TildeMap::Off => {}
            TildeMap::Prefix(prefix) => {
                hc.expnfilename = path::tilde_prefix_map(&hc.expnfilename, prefix);
            }
            TildeMap::HomeDir(postfix) => {
                match path::tilde_home_map(&hc.expnfilename, postfix, hs.root()) {
                    Some((expn, altdir)) => {
                        hc.expnfilename = expn;
                        hc.altdir = altdir;
                        hc.tildemapped = true;
                    }
                    None => {
                        let url = hc.encodedurl.clone();
                        return Err(abort(hs, hc, 404, "", ERR404_FORM, &url));
                    }
                }
            }
        }
    }

    if hs.config.vhost {
        vhost_map(hs, hc)?;
    }

    let expanded = match path::expand_symlinks(
        &hc.expnfilename,
        hs.root(),
        hs.config.no_symlink_check,
        hc.tildemapped,
    ) {
        Ok(e) => e,
        Err(e) => {
            log::error!("expanding {}: {e}", hc.expnfilename);
            let url = hc.encodedurl.clone();
            return Err(abort(hs, hc, 500, "", ERR500_FORM, &url));
        }
    };

    // Vhosts fall back to the shared top-level subtrees for missing files.
    if hs.config.vhost && path::is_vhost_shared(&expanded.trailer) {
        hc.expnfilename = expanded.trailer;
        hc.pathinfo.clear();
    } else {
        hc.expnfilename = expanded.checked;
        hc.pathinfo = expanded.trailer;
    }

    // The original filename loses the path-info tail too.
    if !hc.pathinfo.is_empty() && hc.origfilename.len() >= hc.pathinfo.len() {
        let i = hc.origfilename.len() - hc.pathinfo.len();
        if hc.origfilename[i..] == hc.pathinfo {
            if i == 0 {
                hc.origfilename.clear();
            } else {
                hc.origfilename.truncate(i - 1);
            }
        }
    }

    // Containment: an absolute expansion must still live under the root or
    // the approved alternate root.
    if hc.expnfilename.starts_with('/') {
        let root_prefix = format!("{}/", hs.root().display());
        if let Some(rel) = hc.expnfilename.strip_prefix(&root_prefix) {
            hc.expnfilename = rel.to_string();
        } else if !hc.altdir.is_empty()
            && hc.expnfilename.strip_prefix(&hc.altdir).is_some_and(|tail| {
                tail.is_empty() || tail.starts_with('/')
            })
        {
            // Inside the alternate root; leave it absolute.
        } else if hs.config.no_symlink_check {
            let url = hc.encodedurl.clone();
            return Err(abort(hs, hc, 404, "", ERR404_FORM, &url));
        } else {
            log::warn!(
                "{} URL \"{}\" goes outside the web tree",
                hc.real_ip,
                hc.encodedurl
            );
            let url = hc.encodedurl.clone();
            return Err(abort(
                hs,
                hc,
                403,
                "",
                "The requested URL '%s' resolves to a file outside the permitted web server directory tree.\n",
                &url,
            ));
        }
    }

    Ok(())
}

/// Pick the virtual hostname and prefix the filename with its directory.
fn vhost_map(hs: &HttpdServer, hc: &mut Connection) -> Result<()> {
    let mut hostname = if !hc.reqhost.is_empty() {
        hc.reqhost.clone()
    } else if !hc.hdrhost.is_empty() {
        hc.hdrhost.clone()
    } else {
        match syscalls::local_addr(hc.stream.fd()) {
            Ok(addr) => syscalls::ntoa(&addr),
            Err(e) => {
                log::error!("getsockname: {e}");
                let url = hc.encodedurl.clone();
                return Err(abort(hs, hc, 500, "", ERR500_FORM, &url));
            }
        }
    };
    hostname.make_ascii_lowercase();
    hc.hostname = Some(hostname.clone());

    if hc.tildemapped {
        return Ok(());
    }

    // Any :port suffix stays out of the directory name.
    let bare = match hostname.rfind(':') {
        Some(i) if !hostname[i + 1..].contains(']') => &hostname[..i],
        _ => &hostname[..],
    };
    hc.hostdir = path::vhost_hostdir(bare, hs.config.vhost_dirlevels);
    hc.expnfilename = format!("{}/{}", hc.hostdir, hc.expnfilename);

    Ok(())
}
