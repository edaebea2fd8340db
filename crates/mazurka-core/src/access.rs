//! Per-directory access control: IP allow/deny files and HTTP Basic auth.
//!
//! Both gates search from the target's directory up to the top of the tree
//! (the vhost directory when vhosting, else the document root).  Auth
//! verifications are memoised per connection keyed on the file path, its
//! mtime, the user and the encrypted password, so keep-alive bursts do not
//! re-crypt on every request.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};

use crate::config::{ACCESS_FILE, AUTH_FILE};
use crate::conn::{Connection, Method};
use crate::error::Result;
use crate::parser::abort;
use crate::response::{self, ERR401_FORM, ERR403_FORM};
use crate::server::HttpdServer;

/// Outcome of a gate that found no applicable control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    NoFile,
    Allowed,
}

/// Directory component of a resolver-relative filename.
fn dirname(filename: &str) -> String {
    match filename.rfind('/') {
        Some(i) => filename[..i].to_string(),
        None => ".".to_string(),
    }
}

fn topdir(hs: &HttpdServer, hc: &Connection) -> String {
    if hs.config.vhost && !hc.hostdir.is_empty() {
        hc.hostdir.clone()
    } else {
        ".".to_string()
    }
}

/// Walk from `start_dir` up to `top` looking for `name`; returns the
/// directory it was found in.
fn find_htfile(root: &Path, top: &str, start_dir: &str, name: &str) -> Option<String> {
    let mut dir = if start_dir.is_empty() {
        ".".to_string()
    } else {
        start_dir.to_string()
    };

    loop {
        if crate::path::fs_path(root, &dir).join(name).exists() {
            return Some(dir);
        }
        if dir == top {
            return None;
        }
        match dir.rfind('/') {
            Some(i) => dir.truncate(i),
            None => {
                if top == "." && dir != "." {
                    dir = ".".to_string();
                } else {
                    return None;
                }
            }
        }
    }
}

// ---- IP access file ----

/// Check the address restriction for the target.  `dir` of None means the
/// directory containing `expnfilename`.
pub fn access_check(hs: &HttpdServer, hc: &mut Connection, dir: Option<&str>) -> Result<Gate> {
    let dir = match dir {
        Some(d) => d.to_string(),
        None => {
            if hc.expnfilename.contains(ACCESS_FILE) {
                log::warn!(
                    "{} URL \"{}\" tried to retrieve access file",
                    hc.real_ip,
                    hc.encodedurl
                );
                let url = hc.encodedurl.clone();
                return Err(abort(hs, hc, 403, "", ERR403_FORM, &url));
            }
            dirname(&hc.expnfilename)
        }
    };

    let top = topdir(hs, hc);

    if hs.config.global_passwd {
        match access_check2(hs, hc, &top)? {
            Gate::Allowed => return Ok(Gate::Allowed),
            Gate::NoFile => {}
        }
    }

    match find_htfile(hs.root(), &top, &dir, ACCESS_FILE) {
        Some(found) => access_check2(hs, hc, &found),
        None => Ok(Gate::NoFile),
    }
}

/// Evaluate `<dir>/.htaccess`.  First matching rule wins; a file with no
/// matching rule denies.
fn access_check2(hs: &HttpdServer, hc: &mut Connection, dir: &str) -> Result<Gate> {
    let access_path = hs.fs_path(dir).join(ACCESS_FILE);
    if !access_path.exists() {
        return Ok(Gate::NoFile);
    }

    let text = match std::fs::read_to_string(&access_path) {
        Ok(t) => t,
        Err(e) => {
            log::error!(
                "{} access file {} could not be opened: {e}",
                hc.real_ip,
                access_path.display()
            );
            let url = hc.encodedurl.clone();
            return Err(abort(
                hs,
                hc,
                403,
                "",
                "The requested URL '%s' is protected by an access file.\n",
                &url,
            ));
        }
    };

    let client = client_v4(hc);

    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        let parsed = split_rule(line).and_then(|(verb, addr_spec)| {
            let allow = match verb.chars().next() {
                Some('a') | Some('A') => true,
                Some('d') | Some('D') => false,
                _ => return None,
            };
            parse_cidr(addr_spec).map(|(addr, mask)| (allow, addr, mask))
        });

        let Some((allow, rule_addr, rule_mask)) = parsed else {
            log::error!(
                "{} access file {}: invalid line: {line}",
                hc.real_ip,
                access_path.display()
            );
            let url = hc.encodedurl.clone();
            return Err(abort(
                hs,
                hc,
                403,
                "",
                "The requested URL '%s' is protected by an access file.\n",
                &url,
            ));
        };

        let Some(client) = client else {
            // Rules are IPv4-only; other families never match.
            continue;
        };

        if (u32::from(client) & rule_mask) == (u32::from(rule_addr) & rule_mask) {
            if allow {
                return Ok(Gate::Allowed);
            }
            let url = hc.encodedurl.clone();
            return Err(abort(
                hs,
                hc,
                403,
                "",
                "The requested URL '%s' is protected by an address restriction.\n",
                &url,
            ));
        }
    }

    let url = hc.encodedurl.clone();
    Err(abort(
        hs,
        hc,
        403,
        "",
        "The requested URL '%s' is protected by an address restriction.\n",
        &url,
    ))
}

fn client_v4(hc: &Connection) -> Option<Ipv4Addr> {
    match hc.client_addr.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

fn split_rule(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.split([' ', '\t']).filter(|p| !p.is_empty());
    let verb = parts.next()?;
    let addr = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((verb, addr))
}

/// `A.B.C.D`, `A.B.C.D/bits` or `A.B.C.D/M.M.M.M`.
fn parse_cidr(spec: &str) -> Option<(Ipv4Addr, u32)> {
    match spec.split_once('/') {
        None => Some((spec.parse().ok()?, u32::MAX)),
        Some((addr, mask)) => {
            let addr: Ipv4Addr = addr.parse().ok()?;
            if mask.is_empty() {
                return None;
            }
            let mask = if mask.contains('.') {
                u32::from(mask.parse::<Ipv4Addr>().ok()?)
            } else {
                let bits: u32 = mask.parse().ok()?;
                if bits > 32 {
                    return None;
                }
                if bits == 0 { 0 } else { u32::MAX << (32 - bits) }
            };
            Some((addr, mask))
        }
    }
}

// ---- HTTP Basic auth ----

fn send_authenticate(hs: &HttpdServer, hc: &mut Connection, realm: &str) -> crate::error::Error {
    let extra = format!("WWW-Authenticate: Basic realm=\"{realm}\"\r\n");
    let url = hc.encodedurl.clone();
    let err = abort(hs, hc, 401, &extra, ERR401_FORM, &url);
    // A POST or PUT may still be sending its body; linger so the client
    // sees the 401 instead of a reset.
    if hc.method == Method::Post || hc.method == Method::Put {
        hc.should_linger = true;
    }
    err
}

/// Check Basic auth for the target.  `dir` of None means the directory
/// containing `expnfilename`.
pub fn auth_check(hs: &HttpdServer, hc: &mut Connection, dir: Option<&str>) -> Result<Gate> {
    let dir = match dir {
        Some(d) => d.to_string(),
        None => {
            if hc.expnfilename.contains(AUTH_FILE) {
                log::warn!(
                    "{} URL \"{}\" tried to retrieve auth file",
                    hc.real_ip,
                    hc.encodedurl
                );
                let url = hc.encodedurl.clone();
                return Err(abort(hs, hc, 403, "", ERR403_FORM, &url));
            }
            dirname(&hc.expnfilename)
        }
    };

    let top = topdir(hs, hc);

    if hs.config.global_passwd {
        match auth_check2(hs, hc, &top)? {
            Gate::Allowed => return Ok(Gate::Allowed),
            Gate::NoFile => {}
        }
    }

    match find_htfile(hs.root(), &top, &dir, AUTH_FILE) {
        Some(found) => auth_check2(hs, hc, &found),
        None => Ok(Gate::NoFile),
    }
}

fn auth_check2(hs: &HttpdServer, hc: &mut Connection, dir: &str) -> Result<Gate> {
    let auth_path = hs.fs_path(dir).join(AUTH_FILE);
    let meta = match std::fs::symlink_metadata(&auth_path) {
        Ok(m) => m,
        Err(_) => return Ok(Gate::NoFile),
    };
    let mtime = meta.modified().ok().map(response::mtime_secs);

    if !hc.authorization.starts_with("Basic ") {
        return Err(send_authenticate(hs, hc, dir));
    }
    let b64 = hc.authorization["Basic ".len()..].trim().to_string();

    let decoded = STANDARD
        .decode(b64.as_bytes())
        .or_else(|_| STANDARD_NO_PAD.decode(b64.as_bytes()))
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok());
    let Some(authinfo) = decoded else {
        return Err(send_authenticate(hs, hc, dir));
    };

    let Some((user, pass)) = authinfo.split_once(':') else {
        return Err(send_authenticate(hs, hc, dir));
    };
    // Trailing fields are permitted and truncated.
    let pass = pass.split(':').next().unwrap_or("");
    let (user, pass) = (user.to_string(), pass.to_string());

    let auth_path_str = auth_path.display().to_string();

    // Memo hit: verify against the cached crypted password without
    // re-reading the file.
    if !hc.prev_auth_path.is_empty()
        && hc.prev_auth_path == auth_path_str
        && hc.prev_auth_mtime == mtime
        && hc.prev_user == user
    {
        let crypted = hc.prev_crypted.clone();
        if crypt_verify(&pass, &crypted) {
            set_remote_user(hc, &user);
            return Ok(Gate::Allowed);
        }
        return Err(send_authenticate(hs, hc, dir));
    }

    let text = match std::fs::read_to_string(&auth_path) {
        Ok(t) => t,
        Err(e) => {
            log::error!("{} auth file {auth_path_str} could not be opened: {e}", hc.real_ip);
            let url = hc.encodedurl.clone();
            return Err(abort(
                hs,
                hc,
                403,
                "",
                "The requested URL '%s' is protected by an authentication file that cannot be opened.\n",
                &url,
            ));
        }
    };

    for line in text.lines() {
        let Some((file_user, crypted)) = line.split_once(':') else {
            continue;
        };
        if file_user != user {
            continue;
        }

        if crypt_verify(&pass, crypted) {
            set_remote_user(hc, &user);
            hc.prev_auth_path = auth_path_str;
            hc.prev_auth_mtime = mtime;
            hc.prev_user = user;
            hc.prev_crypted = crypted.to_string();
            return Ok(Gate::Allowed);
        }
        return Err(send_authenticate(hs, hc, dir));
    }

    // No such user.
    Err(send_authenticate(hs, hc, dir))
}

fn set_remote_user(hc: &mut Connection, user: &str) {
    hc.remote_user.clear();
    hc.remote_user.push_str(user);
}

// ---- crypt-style password verification ----

/// Verify a password against an `.htpasswd` field: MD5-crypt (`$1$`) or a
/// legacy plain-text entry.  Unknown schemes never verify.
pub fn crypt_verify(password: &str, crypted: &str) -> bool {
    if let Some(rest) = crypted.strip_prefix("$1$") {
        let salt = rest.split('$').next().unwrap_or("");
        return md5_crypt(password.as_bytes(), salt.as_bytes()) == crypted;
    }
    if crypted.starts_with('$') {
        return false;
    }
    // Plain-text field.
    constant_eq(password.as_bytes(), crypted.as_bytes())
}

fn constant_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

const ITOA64: &[u8; 64] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

fn to64(out: &mut String, mut v: u32, n: usize) {
    for _ in 0..n {
        out.push(ITOA64[(v & 0x3f) as usize] as char);
        v >>= 6;
    }
}

/// The classic MD5-crypt construction.
pub fn md5_crypt(password: &[u8], salt: &[u8]) -> String {
    let salt = &salt[..salt.len().min(8)];

    let mut ctx = md5::Context::new();
    ctx.consume(password);
    ctx.consume(b"$1$");
    ctx.consume(salt);

    let mut alt = md5::Context::new();
    alt.consume(password);
    alt.consume(salt);
    alt.consume(password);
    let alt_digest = alt.compute();

    let mut pl = password.len();
    while pl > 0 {
        let take = pl.min(16);
        ctx.consume(&alt_digest[..take]);
        pl -= take;
    }

    let mut i = password.len();
    while i != 0 {
        if i & 1 != 0 {
            ctx.consume(&[0u8]);
        } else {
            ctx.consume(&password[..1]);
        }
        i >>= 1;
    }

    let mut digest = ctx.compute();

    // Stretching round as specified by the original construction.
    for round in 0..1000 {
        let mut c = md5::Context::new();
        if round & 1 != 0 {
            c.consume(password);
        } else {
            c.consume(&digest[..]);
        }
        if round % 3 != 0 {
            c.consume(salt);
        }
        if round % 7 != 0 {
            c.consume(password);
        }
        if round & 1 != 0 {
            c.consume(&digest[..]);
        } else {
            c.consume(password);
        }
        digest = c.compute();
    }

    let mut out = String::with_capacity(3 + salt.len() + 1 + 22);
    out.push_str("$1$");
    out.push_str(&String::from_utf8_lossy(salt));
    out.push('$');

    let d = &digest[..];
    for &(a, b, c) in &[(0usize, 6usize, 12usize), (1, 7, 13), (2, 8, 14), (3, 9, 15), (4, 10, 5)] {
        let v = ((d[a] as u32) << 16) | ((d[b] as u32) << 8) | d[c] as u32;
        to64(&mut out, v, 4);
    }
    to64(&mut out, d[11] as u32, 2);

    out
}
