//! Process-wide server context: configuration, listen sockets, the CGI
//! child tracker, and the injected cache/log seams.  Immutable after init
//! except for the tracker, which the readiness loop drives serially.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::accesslog::{AccessSink, CombinedLog, LogRecord};
use crate::cache::{FileCache, ReadCache};
use crate::config::ServerConfig;
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::stream::PlainStream;
use crate::syscalls;

#[derive(Debug, Default)]
struct CgiTracker {
    slots: Vec<libc::pid_t>,
    count: usize,
}

pub struct HttpdServer {
    pub config: ServerConfig,
    root: PathBuf,
    listen_fds: Vec<RawFd>,
    tracker: Mutex<CgiTracker>,
    pub cache: Box<dyn FileCache>,
    pub sink: Box<dyn AccessSink>,
}

impl HttpdServer {
    /// Build the immutable context.  The root must exist; it is
    /// canonicalised once so containment checks compare stable prefixes.
    pub fn init(
        config: ServerConfig,
        cache: Box<dyn FileCache>,
        sink: Box<dyn AccessSink>,
    ) -> Result<Self> {
        let root = config.root.canonicalize().map_err(Error::Io)?;

        let mut listen_fds = Vec::with_capacity(config.bind.len());
        for addr in &config.bind {
            listen_fds.push(syscalls::create_listen_socket(addr, 1024)?);
        }

        let tracker = Mutex::new(CgiTracker {
            slots: vec![0; config.cgi_limit],
            count: 0,
        });

        Ok(Self {
            config,
            root,
            listen_fds,
            tracker,
            cache,
            sink,
        })
    }

    /// Init with the built-in whole-file cache and combined-format log.
    pub fn with_defaults(config: ServerConfig) -> Result<Self> {
        Self::init(config, Box::new(ReadCache), Box::new(CombinedLog))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Document-root-relative name to a real filesystem path.
    pub fn fs_path(&self, rel: &str) -> PathBuf {
        crate::path::fs_path(&self.root, rel)
    }

    pub fn listen_fds(&self) -> &[RawFd] {
        &self.listen_fds
    }

    /// Accept one queued connection; Ok(None) when the queue is drained.
    pub fn get_conn(&self, listen_fd: RawFd) -> Result<Option<Connection>> {
        let Some((fd, addr)) = syscalls::accept_connection(listen_fd)? else {
            return Ok(None);
        };
        syscalls::set_cloexec(fd)?;
        Ok(Some(Connection::new(
            Box::new(PlainStream::new(fd)),
            addr,
        )))
    }

    /// Close listener descriptors; CGI children call this so scripts cannot
    /// hold the service port open.
    pub fn unlisten(&self) {
        for &fd in &self.listen_fds {
            syscalls::close_fd(fd);
        }
    }

    // ---- CGI child tracking ----

    pub fn cgi_count(&self) -> usize {
        self.tracker.lock().unwrap().count
    }

    pub fn track_cgi(&self, pid: libc::pid_t) -> Result<()> {
        let mut t = self.tracker.lock().unwrap();
        for slot in t.slots.iter_mut() {
            if *slot == 0 {
                *slot = pid;
                t.count += 1;
                return Ok(());
            }
        }
        Err(Error::CgiSlots)
    }

    /// Called by the outer reaper when a tracked child exits.
    pub fn untrack_cgi(&self, pid: libc::pid_t) -> bool {
        let mut t = self.tracker.lock().unwrap();
        for slot in t.slots.iter_mut() {
            if *slot == pid {
                *slot = 0;
                t.count -= 1;
                return true;
            }
        }
        false
    }

    /// Hostname for generated pages, CGI `SERVER_NAME` and vhost log
    /// prefixes.
    pub fn get_hostname<'a>(&'a self, hc: &'a Connection) -> &'a str {
        if self.config.vhost {
            if let Some(name) = &hc.hostname {
                if let Some(canonical) = self.config.hostname_aliases.get(name) {
                    return canonical;
                }
                return name;
            }
        }
        self.config.hostname.as_deref().unwrap_or("")
    }

    /// Periodic allocation statistics, the embedding program decides when.
    pub fn log_stats(&self) {
        let (count, bytes) = crate::buf::alloc_stats();
        if count > 0 {
            log::info!("{count} buffers grown, {bytes} bytes total");
        }
    }

    /// Emit the access-log record for a finished request.  Idempotent per
    /// request.
    pub fn log_request(&self, hc: &mut Connection) {
        if self.config.no_log || hc.logged {
            return;
        }
        hc.logged = true;

        // When vhosting (and not tilde-mapped) the URL is prefixed with the
        // hostname so one log serves all subtrees.
        let url = if self.config.vhost && !hc.tildemapped {
            format!("/{}{}", self.get_hostname(hc), hc.encodedurl)
        } else {
            hc.encodedurl.clone()
        };

        let record = LogRecord {
            client_ip: hc.real_ip.clone(),
            remote_user: if hc.remote_user.is_empty() {
                None
            } else {
                Some(hc.remote_user.clone())
            },
            method: hc.method.as_str().to_string(),
            url,
            protocol: hc.protocol.clone(),
            status: hc.status,
            bytes: if hc.bytes_sent >= 0 {
                Some(hc.bytes_sent)
            } else {
                None
            },
            referer: hc.referer.clone(),
            user_agent: hc.useragent.clone(),
        };
        self.sink.log(&record);
    }
}
