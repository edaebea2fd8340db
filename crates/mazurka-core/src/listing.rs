//! Generated directory indexes.
//!
//! Two sorted passes, sub-directories first, then files.  Hidden and
//! reserved control files are skipped, hrefs are URL-encoded, sizes use
//! base-1000 units and mtimes are shown in local time.  Compression is
//! never applied to a generated index.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::time::SystemTime;

use crate::config::{ACCESS_FILE, AUTH_FILE, SERVER_SOFTWARE};
use crate::conn::{Compression, Connection, Method};
use crate::error::Result;
use crate::parser::abort;
use crate::response::{self, ERR404_FORM, ERR501_FORM};
use crate::server::HttpdServer;

/// Escape an href, preserving `/_.-~` and alphanumerics.
pub fn strencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'/' | b'_' | b'.' | b'-' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02x}"));
        }
    }
    out
}

/// Base-1000 size column; directories show a dash.
fn humane_size(meta: &fs::Metadata) -> String {
    if meta.is_dir() {
        return "  - ".to_string();
    }
    const MULT: &[&str] = &["", "k", "M", "G", "T", "P"];
    let mut bytes = meta.len();
    let mut i = 0;
    while bytes > 1000 && i < MULT.len() - 1 {
        bytes /= 1000;
        i += 1;
    }
    format!("  {}{}", bytes, MULT[i])
}

fn local_mtime_str(t: SystemTime) -> String {
    let secs = t
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as libc::time_t)
        .unwrap_or(0);
    unsafe {
        let mut tm: libc::tm = std::mem::zeroed();
        libc::localtime_r(&secs, &mut tm);
        format!(
            "{:04}-{:02}-{:02}&nbsp;&nbsp;{:02}:{:02}",
            tm.tm_year + 1900,
            tm.tm_mon + 1,
            tm.tm_mday,
            tm.tm_hour,
            tm.tm_min
        )
    }
}

fn is_reserved_htfile(name: &str) -> bool {
    name == AUTH_FILE || name == ACCESS_FILE
}

fn world_accessible(meta: &fs::Metadata) -> bool {
    meta.permissions().mode() & 0o005 != 0
}

/// Generate and buffer the index for `expnfilename`, which must be a
/// readable directory.
pub fn generate_index(hs: &HttpdServer, hc: &mut Connection) -> Result<()> {
    hc.compression = Compression::None;

    let dir_mtime = hc
        .file_meta
        .as_ref()
        .and_then(|m| m.modified().ok())
        .map(response::mtime_secs);

    let entries = match fs::read_dir(hs.fs_path(&hc.expnfilename)) {
        Ok(rd) => rd,
        Err(e) => {
            log::error!("opendir {}: {e}", hc.expnfilename);
            let url = hc.encodedurl.clone();
            return Err(abort(hs, hc, 404, "", ERR404_FORM, &url));
        }
    };

    match hc.method {
        Method::Head => {
            response::send_mime(hs, hc, 200, "", "", "text/html; charset=%s", -1, dir_mtime);
            return Ok(());
        }
        Method::Get => {}
        _ => {
            let m = hc.method.as_str();
            return Err(abort(hs, hc, 501, "", ERR501_FORM, m));
        }
    }

    let mut names: Vec<String> = Vec::new();
    for entry in entries.flatten() {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();

    let host = hs.get_hostname(hc).to_string();
    let mut page = String::with_capacity(4096);
    page.push_str(&format!(
        "<!DOCTYPE html>\n<html>\n <head>\n  <title>Index of http://{host}{url}</title>\n{css}\
         \x20</head>\n <body>\n<div id=\"wrapper\">\n<h2>Index of http://{host}{url}</h2>\n\
         <table width=\"100%\">\n <tr>\n  <th></th>\n  <th>Name</th>\n  \
         <th class=\"right\">Size</th>\n  <th>Last modified</th>\n </tr>\n",
        host = host,
        url = hc.encodedurl,
        css = response::css_default(),
    ));

    if hc.encodedurl != "/" {
        page.push_str(
            " <tr>\n  <td>&#8617;</td>\n  <td><a href=\"..\">Parent Directory</a></td>\n  \
             <td class=\"right\">&nbsp;</td>\n  <td>&nbsp;</td>\n </tr>\n",
        );
    }

    for only_dirs in [true, false] {
        for name in &names {
            if !hs.config.list_dotfiles && name.starts_with('.') && name.len() > 2 {
                continue;
            }
            if is_reserved_htfile(name) {
                continue;
            }

            let rel = if hc.expnfilename.is_empty() || hc.expnfilename == "." {
                name.clone()
            } else {
                format!("{}/{}", hc.expnfilename, name)
            };
            let Ok(meta) = fs::metadata(hs.fs_path(&rel)) else {
                continue;
            };
            let Ok(lmeta) = fs::symlink_metadata(hs.fs_path(&rel)) else {
                continue;
            };
            if !world_accessible(&meta) {
                continue;
            }
            if meta.is_dir() != only_dirs {
                continue;
            }

            let rname = if hc.origfilename == "." || hc.origfilename.is_empty() {
                name.clone()
            } else {
                format!("{}{}", hc.origfilename, name)
            };

            let glyph = if meta.is_dir() { "&#128193;" } else { "&#128196;" };
            let mtime = lmeta
                .modified()
                .map(local_mtime_str)
                .unwrap_or_else(|_| String::from("-"));

            page.push_str(&format!(
                " <tr>\n  <td>{glyph}</td>\n  <td><a href=\"/{href}{slash}\">{label}</a></td>\n  \
                 <td class=\"right\">{size}</td>\n  <td>{mtime}</td>\n </tr>\n",
                href = strencode(&rname),
                slash = if meta.is_dir() { "/" } else { "" },
                label = response::defang(name),
                size = humane_size(&lmeta),
            ));
        }
    }

    page.push_str(&format!(
        " </table>\n <address>{} httpd at {} port {}</address>\n</div></body>\n</html>\n",
        SERVER_SOFTWARE, host, hs.config.port,
    ));

    response::send_mime(
        hs,
        hc,
        200,
        "",
        "",
        "text/html; charset=%s",
        page.len() as i64,
        dir_mtime,
    );
    hc.add_response_str(&page);

    log::info!(
        "{}: LST /{} \"{}\" \"{}\"",
        hc.real_ip,
        hc.expnfilename,
        hc.referer,
        hc.useragent
    );

    hc.status = 200;
    hc.bytes_sent = page.len() as i64;
    hc.should_linger = false;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strencode_preserves_safe_set() {
        assert_eq!(strencode("a/b_c.d-e~f"), "a/b_c.d-e~f");
        assert_eq!(strencode("a b"), "a%20b");
        assert_eq!(strencode("100%"), "100%25");
    }

    #[test]
    fn humane_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        std::fs::write(&p, vec![0u8; 2500]).unwrap();
        let meta = fs::metadata(&p).unwrap();
        assert_eq!(humane_size(&meta), "  2k");

        std::fs::write(&p, b"tiny").unwrap();
        let meta = fs::metadata(&p).unwrap();
        assert_eq!(humane_size(&meta), "  4");

        let dmeta = fs::metadata(dir.path()).unwrap();
        assert_eq!(humane_size(&dmeta), "  - ");
    }

    #[test]
    fn reserved_names() {
        assert!(is_reserved_htfile(".htpasswd"));
        assert!(is_reserved_htfile(".htaccess"));
        assert!(!is_reserved_htfile(".htgroups"));
    }
}
