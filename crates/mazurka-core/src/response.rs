//! Response assembly: status line, standard headers, built-in error pages
//! with the on-disk override chain, and the trailing-slash redirect.
//!
//! Everything goes through the connection's response buffer; nothing is
//! written to the socket here.

use std::time::SystemTime;

use crate::config::SERVER_SOFTWARE;
use crate::conn::{Compression, Connection};
use crate::mime;
use crate::server::HttpdServer;

pub fn status_title(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        500 => "Internal Error",
        501 => "Not Implemented",
        503 => "Service Temporarily Overloaded",
        _ => "Something",
    }
}

pub const ERR400_FORM: &str =
    "Your request has bad syntax (%s) or is inherently impossible to satisfy.\n";
pub const ERR401_FORM: &str = "Authorization required for the URL '%s'.\n";
pub const ERR403_FORM: &str =
    "You do not have permission to get URL '%s' from this server.\n";
pub const ERR404_FORM: &str = "The requested URL '%s' was not found on this server.\n";
pub const ERR408_FORM: &str = "No request appeared within a reasonable time period.\n";
pub const ERR500_FORM: &str =
    "There was an unusual problem serving the requested URL '%s'.\n";
pub const ERR501_FORM: &str =
    "The requested method '%s' is not implemented by this server.\n";
pub const ERR503_FORM: &str =
    "The requested URL '%s' is temporarily overloaded.  Please try again later.\n";

/// HTML-escape untrusted text destined for a generated page.
pub fn defang(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '?' => out.push_str("&#63;"),
            _ => out.push(c),
        }
    }
    out
}

/// Stylesheet shared by generated pages.
pub fn css_default() -> &'static str {
    "  <style type=\"text/css\">\n\
     \x20   body { background-color:#f2f1f0; font-family: sans-serif;}\n\
     \x20   h2 { border-bottom: 1px solid #f2f1f0; font-weight: normal;}\n\
     \x20   address { border-top: 1px solid #f2f1f0; margin-top: 1em; padding-top: 5px; color:#c8c5c2; }\n\
     \x20   table { table-layout: fixed; border-collapse: collapse;}\n\
     \x20   table tr td { text-align: left; padding: 0 5px 0 0px; }\n\
     \x20   table tr td.right { text-align: right; padding-right: 20px; }\n\
     \x20 </style>\n"
}

fn rfc1123(t: SystemTime) -> String {
    httpdate::fmt_http_date(t)
}

/// File mtimes are compared at whole-second precision, the best the
/// protocol can express.
pub fn mtime_secs(t: SystemTime) -> SystemTime {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(d.as_secs()),
        Err(_) => SystemTime::UNIX_EPOCH,
    }
}

fn content_encoding_header(hc: &Connection, encodings: &str) -> Option<String> {
    let gz = hc.compression == Compression::Gzip;
    if !encodings.is_empty() {
        let addgz = gz && !encodings.contains("gzip");
        Some(format!(
            "Content-Encoding: {}{}\r\n",
            encodings,
            if addgz { ", gzip" } else { "" }
        ))
    } else if gz {
        Some("Content-Encoding: gzip\r\n".to_string())
    } else {
        None
    }
}

/// Buffer the status line and standard headers.  `length < 0` means the
/// body size is unknown and `Content-Length` is suppressed; compression
/// also suppresses it because the final size is not known at header time.
#[allow(clippy::too_many_arguments)]
pub fn send_mime(
    hs: &HttpdServer,
    hc: &mut Connection,
    status: u16,
    encodings: &str,
    extra: &str,
    ctype: &str,
    length: i64,
    mod_time: Option<SystemTime>,
) {
    let mut status = status;

    if status != 200 {
        hc.compression = Compression::None;
    }
    hc.status = status;
    hc.bytes_to_send = length;

    if !hc.mime_flag {
        // HTTP/0.9: body only.
        return;
    }

    let file_mtime = hc
        .file_meta
        .as_ref()
        .and_then(|m| m.modified().ok())
        .map(mtime_secs);

    let partial = status == 200
        && hc.got_range
        && hc.last_byte_index >= hc.first_byte_index
        && (hc.last_byte_index != length - 1 || hc.first_byte_index != 0)
        && (hc.range_if.is_none() || hc.range_if == file_mtime);
    if partial {
        status = 206;
        hc.status = 206;
        hc.compression = Compression::None;
    } else {
        hc.got_range = false;
    }

    let now = SystemTime::now();
    let mod_time = mod_time.unwrap_or(now);
    let fixed_type = mime::fixup_type(ctype, &hs.config.charset);

    let head = format!(
        "{} {} {}\r\nDate: {}\r\nServer: {}\r\nLast-Modified: {}\r\nAccept-Ranges: bytes\r\n",
        hc.protocol,
        status,
        status_title(status),
        rfc1123(now),
        SERVER_SOFTWARE,
        rfc1123(mod_time),
    );
    hc.add_response_str(&head);

    if partial {
        hc.add_response_str(&format!(
            "Content-Range: bytes {}-{}/{}\r\nContent-Length: {}\r\n",
            hc.first_byte_index,
            hc.last_byte_index,
            length,
            hc.last_byte_index - hc.first_byte_index + 1,
        ));
    } else if length >= 0 && hc.compression == Compression::None {
        hc.add_response_str(&format!("Content-Length: {length}\r\n"));
    }

    hc.add_response_str(&format!("Content-Type: {fixed_type}\r\n"));

    if let Some(enc) = content_encoding_header(hc, encodings) {
        hc.add_response_str(&enc);
    }

    if !matches!(status / 100, 2 | 3) {
        hc.add_response_str("Cache-Control: no-cache,no-store\r\n");
    }

    if hs.config.max_age >= 0 {
        hc.add_response_str(&format!("Cache-Control: max-age={}\r\n", hs.config.max_age));
        if let Some(map) = &hc.file_map {
            let digest = md5::compute(map.as_slice());
            hc.add_response_str(&format!("ETag: \"{digest:x}\"\r\n"));
        }
    }

    if hc.do_keep_alive {
        hc.add_response_str("Connection: keep-alive\r\n");
    } else {
        hc.add_response_str("Connection: close\r\n");
    }

    if !extra.is_empty() {
        hc.add_response_str(extra);
    }
    hc.add_response_str("\r\n");
}

fn send_response_tail(hs: &HttpdServer, hc: &mut Connection) {
    let host = hs.get_hostname(hc).to_string();
    hc.add_response_str(&format!(
        " <address>{} httpd at {} port {}</address>\n</div>\n</body>\n</html>\n",
        SERVER_SOFTWARE, host, hs.config.port,
    ));
}

/// Built-in generated page: used for errors and the directory redirect.
pub fn send_response(
    hs: &HttpdServer,
    hc: &mut Connection,
    status: u16,
    extra: &str,
    form: &str,
    arg: &str,
) {
    send_mime(hs, hc, status, "", extra, "text/html; charset=%s", -1, None);
    let title = status_title(status);
    hc.add_response_str(&format!(
        "<!DOCTYPE html>\n<html>\n <head>\n  <title>{status} {title}</title>\n{}\
         \x20</head>\n <body>\n<div id=\"wrapper\">\n<h2>{status} {title}</h2>\n<p>\n",
        css_default(),
    ));
    let body = form.replace("%s", &defang(arg));
    hc.add_response_str(&body);
    hc.add_response_str("</p>");
    send_response_tail(hs, hc);
}

/// Custom error page from disk; false when no override exists.
fn send_err_file(
    hs: &HttpdServer,
    hc: &mut Connection,
    status: u16,
    extra: &str,
    filename: &str,
) -> bool {
    let Ok(body) = std::fs::read(hs.fs_path(filename)) else {
        return false;
    };
    send_mime(hs, hc, status, "", extra, "text/html; charset=%s", -1, None);
    hc.add_response(&body);
    true
}

/// Error response with the fallback chain: per-vhost page, server-wide
/// page, then the built-in template.
pub fn send_err(
    hs: &HttpdServer,
    hc: &mut Connection,
    status: u16,
    extra: &str,
    form: &str,
    arg: &str,
) {
    if let Some(errdir) = &hs.config.err_dir {
        if hs.config.vhost && !hc.hostdir.is_empty() {
            let filename = format!("{}/{}/err{}.html", hc.hostdir, errdir, status);
            if send_err_file(hs, hc, status, extra, &filename) {
                return;
            }
        }
        let filename = format!("{errdir}/err{status}.html");
        if send_err_file(hs, hc, status, extra, &filename) {
            return;
        }
    }
    send_response(hs, hc, status, extra, form, arg);
}

/// 302 with the trailing slash appended; the query survives the hop.
pub fn send_dirredirect(hs: &HttpdServer, hc: &mut Connection) {
    let base = match hc.encodedurl.find('?') {
        Some(i) => &hc.encodedurl[..i],
        None => &hc.encodedurl[..],
    };
    let location = if hc.query.is_empty() {
        format!("{base}/")
    } else {
        format!("{}/?{}", base, hc.query)
    };
    let header = format!("Location: {location}\r\n");
    send_response(
        hs,
        hc,
        302,
        &header,
        "The actual URL is '%s'.\n",
        &location,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defang_escapes_the_full_set() {
        assert_eq!(
            defang("<a href=\"x?y\">&'</a>"),
            "&lt;a href=&quot;x&#63;y&quot;&gt;&amp;&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn titles() {
        assert_eq!(status_title(404), "Not Found");
        assert_eq!(status_title(206), "Partial Content");
        assert_eq!(status_title(599), "Something");
    }

    #[test]
    fn mtime_truncates_to_seconds() {
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::new(100, 999_999_999);
        assert_eq!(
            mtime_secs(t),
            SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(100)
        );
    }
}
