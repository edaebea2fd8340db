//! Referer guard: URLs matching `url_pattern` must be reached from a local
//! page.

use crate::conn::Connection;
use crate::error::Result;
use crate::parser::abort;
use crate::pattern;
use crate::server::HttpdServer;

/// Enforce the referer policy; buffers a 403 and aborts on violation.
pub fn check_referer(hs: &HttpdServer, hc: &mut Connection) -> Result<()> {
    if hs.config.url_pattern.is_none() {
        return Ok(());
    }

    if really_check_referer(hs, hc) {
        return Ok(());
    }

    log::info!(
        "{} non-local referer \"{}{}\" \"{}\"",
        hc.real_ip,
        hs.get_hostname(hc),
        hc.encodedurl,
        hc.referer
    );
    let url = hc.encodedurl.clone();
    Err(abort(
        hs,
        hc,
        403,
        "",
        "You must supply a local referer to get URL '%s' from this server.\n",
        &url,
    ))
}

fn really_check_referer(hs: &HttpdServer, hc: &Connection) -> bool {
    let url_pattern = hs.config.url_pattern.as_deref().unwrap_or("");

    // Missing or schemeless referer.
    let Some(host_start) = hc.referer.find("//").map(|i| i + 2) else {
        if hs.config.no_empty_referers && pattern::matches(url_pattern, &hc.origfilename) {
            return false;
        }
        return true;
    };

    let tail = &hc.referer[host_start..];
    let host_end = tail
        .find(|c| c == '/' || c == ':')
        .unwrap_or(tail.len());
    let refhost = tail[..host_end].to_ascii_lowercase();

    let local: &str = match &hs.config.local_pattern {
        Some(lp) => lp,
        None => {
            if !hs.config.vhost {
                match &hs.config.hostname {
                    Some(name) => name,
                    // No idea what we are called; give up.
                    None => return true,
                }
            } else {
                match &hc.hostname {
                    Some(name) => name,
                    // Old browser without a Host header.
                    None => return true,
                }
            }
        }
    };

    !(!pattern::matches(local, &refhost) && pattern::matches(url_pattern, &hc.origfilename))
}
