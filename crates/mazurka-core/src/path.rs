//! URL-to-filesystem path resolution.
//!
//! Order of operations per request: dot-segment canonicalisation on the
//! decoded filename, optional tilde mapping, optional vhost mapping, then
//! symlink expansion with traversal containment.  The expansion walk also
//! yields the trailing non-existent components, which become CGI path-info
//! or a 404.

use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};

use crate::config::MAX_LINKS;
use crate::error::{Error, Result};

/// Canonicalise dot segments in a decoded, root-relative filename:
/// collapse `//` runs, drop the leading `/`, strip `./` and `/./`, fold
/// `xxx/../` into its left neighbour and erase a trailing `xxx/..`.
/// A leading `..` deliberately survives so the parser can reject it.
pub fn dedotdot(file: &str) -> String {
    let mut b: Vec<u8> = Vec::with_capacity(file.len());

    // Collapse slash runs while copying.
    for &c in file.as_bytes() {
        if c == b'/' && b.last() == Some(&b'/') {
            continue;
        }
        b.push(c);
    }

    if b.first() == Some(&b'/') {
        b.remove(0);
    }

    while b.starts_with(b"./") {
        b.drain(..2);
    }
    while let Some(pos) = find(&b, b"/./") {
        b.drain(pos..pos + 2);
    }

    // Fold each xxx/../ into its left neighbour.
    while let Some(pos) = find(&b, b"/../") {
        let seg = segment_start(&b, pos);
        b.drain(seg..pos + 4);
    }

    // And elide a trailing xxx/.. when it has a left neighbour.
    while b.len() > 3 && b.ends_with(b"/..") {
        let pos = b.len() - 3;
        let cut = match b[..pos].iter().rposition(|&c| c == b'/') {
            Some(i) => i,
            None => break,
        };
        b.truncate(cut);
    }

    String::from_utf8(b).expect("dedotdot only removes ASCII bytes")
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    memchr::memmem::find(haystack, needle)
}

/// Index of the first byte of the path segment ending at `pos` (which is the
/// index of a `/`).
fn segment_start(b: &[u8], pos: usize) -> usize {
    b[..pos]
        .iter()
        .rposition(|&c| c == b'/')
        .map(|i| i + 1)
        .unwrap_or(0)
}

/// Result of a symlink expansion: the resolved existing prefix and whatever
/// tail did not exist on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expanded {
    pub checked: String,
    pub trailer: String,
}

/// Join a resolver-relative name onto the document root; absolute names
/// (tilde-home trees, absolute link targets) stand alone.
pub(crate) fn fs_path(root: &Path, rel: &str) -> PathBuf {
    if rel.starts_with('/') {
        PathBuf::from(rel)
    } else {
        root.join(rel)
    }
}

/// Expand all symlinks in `path` component by component, eliding `..`
/// segments along the way.  Missing terminal components land in
/// [`Expanded::trailer`].  Relative paths are interpreted under `root`,
/// absolute ones (from tilde-home mapping or absolute link targets) as-is.
pub fn expand_symlinks(
    path: &str,
    root: &Path,
    no_symlink_check: bool,
    tildemapped: bool,
) -> Result<Expanded> {
    if no_symlink_check {
        // Chrooted servers cannot escape the tree, so one stat of the whole
        // name suffices when it exists; otherwise fall through for the
        // path-info split.
        if std::fs::metadata(fs_path(root, path)).is_ok() {
            let mut checked = path.to_string();
            while checked.ends_with('/') {
                checked.pop();
            }
            return Ok(Expanded {
                checked,
                trailer: String::new(),
            });
        }
    }

    let mut checked = String::new();
    let mut rest: Vec<u8> = path.as_bytes().to_vec();
    if !tildemapped {
        while rest.first() == Some(&b'/') {
            rest.remove(0);
        }
    }

    let mut r = 0usize; // consumption cursor into rest
    let mut nlinks = 0usize;

    while r < rest.len() {
        let prev_checked_len = checked.len();
        let prev_r = r;

        // Transfer one component from rest to checked.
        match rest[r..].iter().position(|&c| c == b'/') {
            Some(0) => {
                // Leading slash: absolute path component.
                checked.push('/');
                r += 1;
            }
            Some(i) => {
                let comp = &rest[r..r + i];
                if comp == b".." {
                    pop_component(&mut checked);
                } else {
                    push_component(&mut checked, comp);
                }
                r += i + 1;
            }
            None => {
                let comp = &rest[r..];
                if comp == b".." {
                    pop_component(&mut checked);
                } else {
                    let comp = comp.to_vec();
                    push_component(&mut checked, &comp);
                }
                r = rest.len();
            }
        }

        if checked.is_empty() {
            continue;
        }

        let link = match std::fs::read_link(fs_path(root, &checked)) {
            Err(e) => match e.raw_os_error() {
                Some(libc::EINVAL) => continue, // exists, not a symlink
                Some(libc::EACCES) | Some(libc::ENOENT) | Some(libc::ENOTDIR) => {
                    // That component was bogus; everything from it onward is
                    // the trailer.
                    let trailer =
                        String::from_utf8_lossy(&rest[prev_r..]).into_owned();
                    checked.truncate(prev_checked_len);
                    if checked.is_empty() {
                        checked.push('.');
                    }
                    return Ok(Expanded { checked, trailer });
                }
                _ => {
                    log::error!("readlink {checked}: {e}");
                    return Err(Error::Io(e));
                }
            },
            Ok(target) => target,
        };

        nlinks += 1;
        if nlinks > MAX_LINKS {
            log::error!("too many symlinks in {path}");
            return Err(Error::TooManyLinks(path.to_string()));
        }

        let mut target = link.into_os_string().into_string().map_err(|_| {
            Error::Other(format!("non-unicode symlink target under {checked}"))
        })?;
        while target.ends_with('/') {
            target.pop();
        }

        // Splice the link target in front of the unconsumed tail.
        let mut new_rest = target.clone().into_bytes();
        if r < rest.len() {
            new_rest.push(b'/');
            new_rest.extend_from_slice(&rest[r..]);
        }
        rest = new_rest;
        r = 0;

        if target.starts_with('/') {
            // Absolute link target restarts the checked prefix.
            checked.clear();
        } else {
            // Re-check the current component.
            checked.truncate(prev_checked_len);
        }
    }

    if checked.is_empty() {
        checked.push('.');
    }
    Ok(Expanded {
        checked,
        trailer: String::new(),
    })
}

fn push_component(checked: &mut String, comp: &[u8]) {
    if !checked.is_empty() && !checked.ends_with('/') {
        checked.push('/');
    }
    checked.push_str(&String::from_utf8_lossy(comp));
}

/// Remove the last component, but never rise above the start of the path.
fn pop_component(checked: &mut String) {
    if checked.is_empty() {
        return;
    }
    match checked.rfind('/') {
        None => checked.clear(),
        Some(0) => checked.truncate(1),
        Some(i) => checked.truncate(i),
    }
}

/// `~user/rest` -> `<prefix>/user/rest`.
pub fn tilde_prefix_map(filename: &str, prefix: &str) -> String {
    let stripped = &filename[1..];
    if prefix.is_empty() {
        stripped.to_string()
    } else {
        format!("{prefix}/{stripped}")
    }
}

/// `~user/rest` -> `<home(user)>/<postfix>/rest` plus the approved alternate
/// root.  None means the user or their tree does not exist (404).
pub fn tilde_home_map(filename: &str, postfix: &str, root: &Path) -> Option<(String, String)> {
    let stripped = &filename[1..];
    let (user, rest) = match stripped.find('/') {
        Some(i) => (&stripped[..i], &stripped[i + 1..]),
        None => (stripped, ""),
    };

    let home = home_of(user)?;
    let mut altdir = home;
    if !postfix.is_empty() {
        altdir.push('/');
        altdir.push_str(postfix);
    }

    let expanded = expand_symlinks(&altdir, root, false, true).ok()?;
    if !expanded.trailer.is_empty() {
        return None;
    }
    let altdir = expanded.checked;

    Some((format!("{altdir}/{rest}"), altdir))
}

fn home_of(user: &str) -> Option<String> {
    let cuser = CString::new(user).ok()?;
    unsafe {
        let pw = libc::getpwnam(cuser.as_ptr());
        if pw.is_null() {
            return None;
        }
        CStr::from_ptr((*pw).pw_dir).to_str().ok().map(String::from)
    }
}

/// Build the per-host directory for vhosting.  With dir levels, the first N
/// characters of the hostname (minus any `www.` prefix, skipping dots) are
/// interleaved as intermediate directories: `www.example.com` with two
/// levels becomes `e/x/example.com`.
pub fn vhost_hostdir(hostname: &str, dirlevels: usize) -> String {
    if dirlevels == 0 {
        return hostname.to_string();
    }

    let stripped = hostname.strip_prefix("www.").unwrap_or(hostname);
    let mut dir = String::with_capacity(hostname.len() + 2 * dirlevels);
    let mut chars = stripped.chars().filter(|&c| c != '.');
    for _ in 0..dirlevels {
        dir.push(chars.next().unwrap_or('_'));
        dir.push('/');
    }
    dir.push_str(hostname);
    dir
}

/// Shared top-level subtrees every vhost may fall back to.
pub fn is_vhost_shared(path: &str) -> bool {
    const SHARED: &[&str] = &["icons/", "cgi-bin/"];
    SHARED.iter().any(|p| path.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedotdot_collapses_slash_runs() {
        assert_eq!(dedotdot("a//b///c"), "a/b/c");
    }

    #[test]
    fn dedotdot_strips_leading_slash_and_dot_segments() {
        assert_eq!(dedotdot("/a/b"), "a/b");
        assert_eq!(dedotdot("./a/./b"), "a/b");
        assert_eq!(dedotdot("././x"), "x");
    }

    #[test]
    fn dedotdot_folds_parent_segments() {
        assert_eq!(dedotdot("a/b/../c"), "a/c");
        assert_eq!(dedotdot("a/b/../../c"), "c");
        assert_eq!(dedotdot("a/b/.."), "a");
        // No left neighbour to fold against; the expansion walk handles it.
        assert_eq!(dedotdot("a/.."), "a/..");
    }

    #[test]
    fn dedotdot_keeps_leading_escape_visible() {
        // The parser rejects these; canonicalisation must not hide them.
        assert_eq!(dedotdot("../etc/passwd"), "../etc/passwd");
        assert_eq!(dedotdot(".."), "..");
    }

    #[test]
    fn dedotdot_is_idempotent() {
        for input in [
            "a//b/./c/../d",
            "../x",
            "a/b/../../../c",
            "x/..",
            "./.",
            "//",
            "a/b/c/..",
        ] {
            let once = dedotdot(input);
            assert_eq!(dedotdot(&once), once, "input {input:?}");
            assert!(!once.contains("//"));
            assert!(!once.contains("/./"));
            assert!(!once.contains("/../"));
        }
    }

    #[test]
    fn expand_walks_into_trailer_for_missing_components() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/file.txt"), b"x").unwrap();

        let hit = expand_symlinks("sub/file.txt", dir.path(), false, false).unwrap();
        assert_eq!(hit.checked, "sub/file.txt");
        assert_eq!(hit.trailer, "");

        let miss = expand_symlinks("sub/gone/extra", dir.path(), false, false).unwrap();
        assert_eq!(miss.checked, "sub");
        assert_eq!(miss.trailer, "gone/extra");

        let top = expand_symlinks("nothing", dir.path(), false, false).unwrap();
        assert_eq!(top.checked, ".");
        assert_eq!(top.trailer, "nothing");
    }

    #[test]
    fn expand_follows_relative_symlink() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::fs::write(dir.path().join("real/f"), b"x").unwrap();
        std::os::unix::fs::symlink("real", dir.path().join("alias")).unwrap();

        let out = expand_symlinks("alias/f", dir.path(), false, false).unwrap();
        assert_eq!(out.checked, "real/f");
        assert_eq!(out.trailer, "");
    }

    #[test]
    fn expand_surfaces_absolute_symlink_targets() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/etc", dir.path().join("out")).unwrap();

        let out = expand_symlinks("out/hostname", dir.path(), false, false).unwrap();
        // The absolute prefix is visible to the containment check.
        assert!(out.checked.starts_with("/etc"), "{out:?}");
    }

    #[test]
    fn expand_dotdot_never_rises_above_start() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let out = expand_symlinks("../../f", dir.path(), false, false).unwrap();
        assert_eq!(out.checked, "f");
    }

    #[test]
    fn expand_detects_symlink_loops() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("loop", dir.path().join("loop")).unwrap();
        let err = expand_symlinks("loop/x", dir.path(), false, false).unwrap_err();
        assert!(matches!(err, Error::TooManyLinks(_)));
    }

    #[test]
    fn no_symlink_check_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let out = expand_symlinks("f", dir.path(), true, false).unwrap();
        assert_eq!(out.checked, "f");
        assert_eq!(out.trailer, "");
    }

    #[test]
    fn tilde_prefix_style() {
        assert_eq!(tilde_prefix_map("~joe/www/x", "people"), "people/joe/www/x");
        assert_eq!(tilde_prefix_map("~joe/www/x", ""), "joe/www/x");
    }

    #[test]
    fn hostdir_levels() {
        assert_eq!(vhost_hostdir("example.com", 0), "example.com");
        assert_eq!(vhost_hostdir("www.example.com", 2), "e/x/www.example.com");
        assert_eq!(vhost_hostdir("ab", 3), "a/b/_/ab");
    }

    #[test]
    fn shared_subtrees() {
        assert!(is_vhost_shared("icons/folder.gif"));
        assert!(is_vhost_shared("cgi-bin/test"));
        assert!(!is_vhost_shared("images/x.png"));
    }
}
