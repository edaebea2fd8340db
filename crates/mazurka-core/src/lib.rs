//! mazurka-core: a small embedded HTTP/1.x request-processing engine.
//!
//! The engine sits between an external readiness loop and the filesystem.
//! The loop owns fd readiness and timers; the engine owns everything from
//! "bytes arrived" to "response buffered": request scanning and parsing,
//! URL-to-path resolution with symlink containment, MIME classification,
//! per-directory access and Basic-auth gates, static file and byte-range
//! serving, generated directory indexes, and forked CGI children with
//! interposed I/O.
//!
//! Typical driving sequence per connection:
//!
//! ```no_run
//! use mazurka_core::{dispatch, HttpdServer, ScanOutcome, SendState, ServerConfig};
//! use mazurka_core::conn::ReadOutcome;
//! use mazurka_core::timer::RecordingTimers;
//!
//! let hs = HttpdServer::with_defaults(ServerConfig {
//!     root: "/var/www".into(),
//!     ..Default::default()
//! }).unwrap();
//! let mut timers = RecordingTimers::default();
//!
//! let listen_fd = hs.listen_fds()[0];
//! let mut hc = hs.get_conn(listen_fd).unwrap().unwrap();
//! loop {
//!     match hc.read_more().unwrap() {
//!         ReadOutcome::Added(_) => {}
//!         ReadOutcome::WouldBlock => continue, // wait for readiness
//!         ReadOutcome::Eof => return,
//!     }
//!     match hc.scan_request() {
//!         ScanOutcome::NeedMore => continue,
//!         ScanOutcome::Complete | ScanOutcome::Bad => break,
//!     }
//! }
//! let _ = dispatch::serve_request(&hs, &mut hc, &mut timers);
//! while hc.send_some().unwrap() == SendState::Again {}
//! hs.log_request(&mut hc);
//! ```

pub mod access;
pub mod accesslog;
pub mod buf;
pub mod cache;
pub mod cgi;
pub mod config;
pub mod conn;
pub mod dispatch;
pub mod error;
pub mod listing;
pub mod mime;
pub mod parser;
pub mod path;
pub mod pattern;
pub mod referer;
pub mod response;
pub mod scan;
pub mod server;
pub mod stream;
pub mod syscalls;
pub mod timer;

// Re-exports for embedders.
pub use cache::{FileCache, FileMap, ReadCache};
pub use config::{ServerConfig, TildeMap};
pub use conn::{Connection, Method, SendState};
pub use error::{Error, Result};
pub use scan::{ScanOutcome, ScanState};
pub use server::HttpdServer;
pub use stream::{PlainStream, Stream};
pub use timer::{TimerEvent, TimerSet};
