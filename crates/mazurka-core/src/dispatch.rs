//! Request dispatch: stat the resolved target and route it to a static
//! file send, a directory redirect or index, a CGI child, or an error.

use std::io;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;

use flate2::write::GzEncoder;

use crate::access;
use crate::cgi;
use crate::config::SERVER_SOFTWARE;
use crate::conn::{Compression, Connection, Method};
use crate::error::{Error, Result};
use crate::listing;
use crate::mime;
use crate::parser::{self, abort};
use crate::path;
use crate::referer;
use crate::response::{self, ERR404_FORM, ERR500_FORM, ERR501_FORM};
use crate::server::HttpdServer;
use crate::timer::TimerSet;

/// Parse the buffered request and dispatch it.  One call per complete
/// request; the scanner must have reported completion first.
pub fn serve_request(
    hs: &HttpdServer,
    hc: &mut Connection,
    timers: &mut dyn TimerSet,
) -> Result<()> {
    parser::parse_request(hs, hc)?;
    start_request(hs, hc, timers)
}

fn world_readable_or_exec(meta: &std::fs::Metadata) -> bool {
    meta.permissions().mode() & 0o005 != 0
}

/// Route one parsed request.  All failures buffer their error response
/// before surfacing as [`Error::Aborted`].
pub fn start_request(
    hs: &HttpdServer,
    hc: &mut Connection,
    timers: &mut dyn TimerSet,
) -> Result<()> {
    match hc.method {
        Method::Get
        | Method::Head
        | Method::Post
        | Method::Options
        | Method::Put
        | Method::Delete => {}
        _ => {
            let m = hc.method.as_str();
            return Err(abort(hs, hc, 501, "", ERR501_FORM, m));
        }
    }

    let meta = match std::fs::metadata(hs.fs_path(&hc.expnfilename)) {
        Ok(m) => m,
        Err(e) => {
            log::error!("stat {}: {e}", hc.expnfilename);
            let url = hc.encodedurl.clone();
            return Err(abort(hs, hc, 500, "", ERR500_FORM, &url));
        }
    };

    // Check explicitly instead of just trying to open, so nothing readable
    // only through the server's own privileges ever leaks.
    if !world_readable_or_exec(&meta) {
        log::info!(
            "{} URL \"{}\" resolves to a non world-readable file",
            hc.real_ip,
            hc.encodedurl
        );
        let url = hc.encodedurl.clone();
        return Err(abort(
            hs,
            hc,
            403,
            "",
            "The requested URL '%s' resolves to a file that is not world-readable.\n",
            &url,
        ));
    }

    hc.file_meta = Some(meta);

    if hc.file_meta.as_ref().is_some_and(|m| m.is_dir()) {
        dispatch_directory(hs, hc, timers)
    } else {
        dispatch_file(hs, hc, timers)
    }
}

fn dispatch_directory(
    hs: &HttpdServer,
    hc: &mut Connection,
    timers: &mut dyn TimerSet,
) -> Result<()> {
    // Path-info under a directory is just a non-existent file.
    if !hc.pathinfo.is_empty() {
        let url = hc.encodedurl.clone();
        return Err(abort(hs, hc, 404, "", ERR404_FORM, &url));
    }

    // Directory URLs need the trailing slash or clients cannot build
    // relative links.
    if !hc.origfilename.is_empty()
        && hc.origfilename != "."
        && !hc.origfilename.ends_with('/')
    {
        response::send_dirredirect(hs, hc);
        return Err(Error::Aborted(302));
    }

    // Look for an index file.
    for index_name in &hs.config.index_names {
        let indexname = if hc.expnfilename.is_empty() || hc.expnfilename == "." {
            index_name.clone()
        } else {
            format!("{}/{}", hc.expnfilename.trim_end_matches('/'), index_name)
        };
        if let Ok(meta) = std::fs::metadata(hs.fs_path(&indexname)) {
            return dispatch_index_file(hs, hc, timers, &indexname, meta);
        }
    }

    // A real directory request.  Directories must be world-readable for
    // indexing.
    let readable = hc
        .file_meta
        .as_ref()
        .is_some_and(|m| m.permissions().mode() & 0o004 != 0);
    if !readable {
        log::info!(
            "{} URL \"{}\" tried to index a non world-readable directory",
            hc.real_ip,
            hc.encodedurl
        );
        let url = hc.encodedurl.clone();
        return Err(abort(
            hs,
            hc,
            403,
            "",
            "The requested URL '%s' resolves to a directory that has indexing disabled.\n",
            &url,
        ));
    }

    let dir = hc.expnfilename.clone();
    access::access_check(hs, hc, Some(&dir))?;
    access::auth_check(hs, hc, Some(&dir))?;
    referer::check_referer(hs, hc)?;

    listing::generate_index(hs, hc)
}

fn dispatch_index_file(
    hs: &HttpdServer,
    hc: &mut Connection,
    timers: &mut dyn TimerSet,
    indexname: &str,
    meta: std::fs::Metadata,
) -> Result<()> {
    // Expand again; more path-info here means something is deeply wrong.
    let expanded = match path::expand_symlinks(
        indexname,
        hs.root(),
        hs.config.no_symlink_check,
        hc.tildemapped,
    ) {
        Ok(e) if e.trailer.is_empty() => e,
        _ => {
            let url = hc.encodedurl.clone();
            return Err(abort(hs, hc, 500, "", ERR500_FORM, &url));
        }
    };
    hc.expnfilename = expanded.checked;

    if !world_readable_or_exec(&meta) {
        log::info!(
            "{} URL \"{}\" resolves to a non world-readable index file",
            hc.real_ip,
            hc.encodedurl
        );
        let url = hc.encodedurl.clone();
        return Err(abort(
            hs,
            hc,
            403,
            "",
            "The requested URL '%s' resolves to an index file that is not world-readable.\n",
            &url,
        ));
    }

    hc.file_meta = Some(meta);
    dispatch_file(hs, hc, timers)
}

fn dispatch_file(hs: &HttpdServer, hc: &mut Connection, timers: &mut dyn TimerSet) -> Result<()> {
    let is_regular = hc.file_meta.as_ref().is_some_and(|m| m.is_file());
    if !is_regular {
        // Not a regular file and not a directory?
        let url = hc.encodedurl.clone();
        return Err(abort(hs, hc, 404, "", ERR404_FORM, &url));
    }

    access::access_check(hs, hc, None)?;
    access::auth_check(hs, hc, None)?;
    referer::check_referer(hs, hc)?;

    if hc.method == Method::Options {
        if !hc.mime_flag {
            // Without headers there is nothing OPTIONS could say.
            let m = hc.method.as_str();
            return Err(abort(hs, hc, 501, "", ERR501_FORM, m));
        }
        send_options(hs, hc);
        return Ok(());
    }

    // World-executable and in the CGI area?
    if cgi::is_cgi(hs, hc) {
        let executable = hc
            .file_meta
            .as_ref()
            .is_some_and(|m| m.permissions().mode() & 0o001 != 0);
        if executable {
            return cgi::cgi(hs, hc, timers);
        }
        log::debug!(
            "{} URL \"{}\" is a CGI but not executable, rejecting",
            hc.real_ip,
            hc.encodedurl
        );
        let url = hc.encodedurl.clone();
        return Err(abort(
            hs,
            hc,
            403,
            "",
            "The requested URL '%s' matches a CGI pattern but is not executable; retrieving it is forbidden.\n",
            &url,
        ));
    }

    if !hc.pathinfo.is_empty() {
        log::info!(
            "{} URL \"{}\" has pathinfo but isn't CGI",
            hc.real_ip,
            hc.encodedurl
        );
        let url = hc.encodedurl.clone();
        return Err(abort(
            hs,
            hc,
            403,
            "",
            "The requested URL '%s' resolves to a file plus CGI-style path-info, but the file is not a CGI program.\n",
            &url,
        ));
    }

    let size = hc.file_meta.as_ref().map(|m| m.len() as i64).unwrap_or(0);
    let mtime = hc
        .file_meta
        .as_ref()
        .and_then(|m| m.modified().ok())
        .map(response::mtime_secs);

    // Open-ended and overlong ranges clamp to the end of the file.
    if hc.got_range && (hc.last_byte_index == -1 || hc.last_byte_index >= size) {
        hc.last_byte_index = size - 1;
    }

    let info = mime::figure_mime(&hc.expnfilename);
    hc.mime_type = info.content_type.to_string();
    hc.encodings = info.encodings;

    if hc.method == Method::Head {
        let extra = mod_headers(hs, hc);
        let (size, mtime) = current_size_mtime(hc, size, mtime);
        let (ctype, encodings) = (hc.mime_type.clone(), hc.encodings.clone());
        response::send_mime(hs, hc, 200, &encodings, &extra, &ctype, size, mtime);
        return Ok(());
    }

    // Conditional GET.
    if let (Some(ims), Some(mt)) = (hc.if_modified_since, mtime) {
        if ims >= mt {
            let (ctype, encodings) = (hc.mime_type.clone(), hc.encodings.clone());
            response::send_mime(hs, hc, 304, &encodings, "", &ctype, -1, mtime);
            return Ok(());
        }
    }

    let extra = mod_headers(hs, hc);
    let (size, mtime) = current_size_mtime(hc, size, mtime);

    let map = match hc
        .file_meta
        .clone()
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        .and_then(|meta| hs.cache.map(&hs.fs_path(&hc.expnfilename), &meta))
    {
        Ok(m) => m,
        Err(e) => {
            log::error!("mapping {}: {e}", hc.expnfilename);
            let url = hc.encodedurl.clone();
            return Err(abort(hs, hc, 500, "", ERR500_FORM, &url));
        }
    };
    let body = map.bytes.clone();
    hc.file_map = Some(map);

    let (ctype, encodings) = (hc.mime_type.clone(), hc.encodings.clone());
    response::send_mime(hs, hc, 200, &encodings, &extra, &ctype, size, mtime);

    if hc.compression == Compression::Gzip {
        // Compress the whole body behind the headers; the length was
        // deliberately left out of them.
        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        let gz = enc
            .write_all(&body)
            .and_then(|_| enc.finish())
            .map_err(Error::Io)?;
        hc.bytes_sent = gz.len() as i64;
        hc.add_response(&gz);
        if let Some(m) = hc.file_map.take() {
            hs.cache.unmap(m);
        }
    } else if hc.status == 206 {
        hc.set_body_window(hc.first_byte_index as u64, hc.last_byte_index as u64 + 1);
    } else {
        hc.set_body_window(0, size as u64);
    }

    Ok(())
}

/// The file metadata may have been swapped for a `.gz` sibling; re-read
/// size and mtime from whatever we are actually sending.
fn current_size_mtime(
    hc: &Connection,
    size: i64,
    mtime: Option<std::time::SystemTime>,
) -> (i64, Option<std::time::SystemTime>) {
    match hc.file_meta.as_ref() {
        Some(m) => (
            m.len() as i64,
            m.modified().ok().map(response::mtime_secs).or(mtime),
        ),
        None => (size, mtime),
    }
}

/// Substitute a fresher pre-compressed `.gz` sibling, decide whether to
/// deflate on the fly, and add `Vary: Accept-Encoding` where the answer
/// depends on the request.
fn mod_headers(hs: &HttpdServer, hc: &mut Connection) -> String {
    if hc.compression == Compression::Gzip {
        let gz_name = format!("{}.gz", hc.expnfilename);
        let orig_mtime = hc.file_meta.as_ref().and_then(|m| m.modified().ok());
        if let Ok(gz_meta) = std::fs::metadata(hs.fs_path(&gz_name)) {
            let fresh = match (gz_meta.modified().ok(), orig_mtime) {
                (Some(gz), Some(orig)) => gz >= orig,
                _ => false,
            };
            if fresh
                && gz_meta.permissions().mode() & 0o005 != 0
                && hc.encodings.is_empty()
            {
                hc.expnfilename = gz_name;
                hc.file_meta = Some(gz_meta);
                hc.compression = Compression::None;
                hc.encodings = "gzip".to_string();
            }
        }
    }

    if !hs.config.compress {
        hc.compression = Compression::None;
    } else if !(hc.mime_type.starts_with("text/")
        || hc.mime_type == "application/javascript")
    {
        // Compressing already-compressed media wastes everyone's time.
        hc.compression = Compression::None;
    } else if hc.file_meta.as_ref().is_some_and(|m| m.len() < 256) {
        hc.compression = Compression::None;
    }

    const VARY_EXTS: &[&str] = &[".js", ".css", ".xml", ".gz", ".html"];
    let ext_varies = VARY_EXTS.iter().any(|e| hc.expnfilename.ends_with(e));
    if ext_varies || hc.encodings.contains("gzip") {
        "Vary: Accept-Encoding\r\n".to_string()
    } else {
        String::new()
    }
}

fn send_options(hs: &HttpdServer, hc: &mut Connection) {
    let now = httpdate::fmt_http_date(std::time::SystemTime::now());
    let allow_post = if cgi::is_cgi(hs, hc) { "POST," } else { "" };
    let mut head = format!(
        "{} 200 OK\r\nDate: {}\r\nServer: {}\r\nAllow: {}OPTIONS,GET,HEAD\r\n",
        hc.protocol, now, SERVER_SOFTWARE, allow_post,
    );
    if hs.config.max_age >= 0 {
        head.push_str(&format!("Cache-Control: max-age={}\r\n", hs.config.max_age));
    }
    head.push_str("Content-Length: 0\r\nContent-Type: text/html\r\n\r\n");
    hc.add_response_str(&head);
    hc.status = 200;
    hc.bytes_to_send = 0;
}
