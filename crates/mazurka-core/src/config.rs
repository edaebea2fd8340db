//! Init-time configuration for the engine.
//!
//! Parsing config files or command lines is the embedding program's job;
//! this struct is the contract it fills in before calling
//! [`crate::server::HttpdServer::init`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How `~user/...` URLs are mapped, if at all.  The two styles are mutually
/// exclusive by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TildeMap {
    #[default]
    Off,
    /// `~user/rest` becomes `<prefix>/user/rest` inside the document root.
    Prefix(String),
    /// `~user/rest` becomes `<home(user)>/<postfix>/rest`; marks the request
    /// as tilde-mapped, which suppresses vhost mapping.
    HomeDir(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Canonical server hostname, if known.
    pub hostname: Option<String>,
    /// Alternate names this server answers to, mapped to the name that
    /// should appear in generated pages and CGI `SERVER_NAME`.
    pub hostname_aliases: HashMap<String, String>,
    /// Address(es) to listen on.  May be empty when the embedding program
    /// hands in already-accepted sockets.
    pub bind: Vec<SocketAddr>,
    /// Advertised port for generated pages and CGI `SERVER_PORT`.
    pub port: u16,
    /// Absolute document root.
    pub root: PathBuf,
    /// Charset advertised on text content types.
    pub charset: String,
    /// `Cache-Control: max-age` seconds; negative disables the header.
    pub max_age: i64,
    /// Shell-style pattern selecting CGI programs, e.g. `cgi-bin/*|**.cgi`.
    pub cgi_pattern: Option<String>,
    /// Maximum simultaneous CGI children; 0 means unlimited.
    pub cgi_limit: usize,
    /// Seconds a CGI child may run before the soft kill.
    pub cgi_timelimit: u64,
    /// URLs matching this pattern require a local referer.
    pub url_pattern: Option<String>,
    /// Referer hosts matching this pattern count as local.
    pub local_pattern: Option<String>,
    /// Deny pattern-matched URLs when the referer is missing entirely.
    pub no_empty_referers: bool,
    /// Serve each hostname from its own subtree of the root.
    pub vhost: bool,
    /// Interleave the first N hostname characters as directory levels.
    pub vhost_dirlevels: usize,
    /// Auth files at the root apply site-wide.
    pub global_passwd: bool,
    /// List dotfiles in generated indexes.
    pub list_dotfiles: bool,
    /// Skip symlink expansion; set when the process is chrooted to the root.
    pub no_symlink_check: bool,
    pub tilde_map: TildeMap,
    /// Index files probed, in order, for directory URLs.
    pub index_names: Vec<String>,
    /// Directory (relative to the root) holding `errNNN.html` pages.
    pub err_dir: Option<String>,
    /// Attempt gzip on eligible bodies when the client accepts it.
    pub compress: bool,
    /// Suppress the access log entirely.
    pub no_log: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            hostname_aliases: HashMap::new(),
            bind: Vec::new(),
            port: 80,
            root: PathBuf::from("."),
            charset: "UTF-8".to_string(),
            max_age: -1,
            cgi_pattern: None,
            cgi_limit: 0,
            cgi_timelimit: 180,
            url_pattern: None,
            local_pattern: None,
            no_empty_referers: false,
            vhost: false,
            vhost_dirlevels: 0,
            global_passwd: false,
            list_dotfiles: false,
            no_symlink_check: false,
            tilde_map: TildeMap::Off,
            index_names: vec![
                "index.html".to_string(),
                "index.htm".to_string(),
                "index.xhtml".to_string(),
                "default.htm".to_string(),
            ],
            err_dir: Some("errs".to_string()),
            compress: true,
            no_log: false,
        }
    }
}

/// Per-directory credentials file.
pub const AUTH_FILE: &str = ".htpasswd";
/// Per-directory address restriction file.
pub const ACCESS_FILE: &str = ".htaccess";
/// Upper bound on symlink substitutions while resolving one path.
pub const MAX_LINKS: usize = 32;
/// Software identity sent in the `Server:` header and page footers.
pub const SERVER_SOFTWARE: &str = concat!("mazurka/", env!("CARGO_PKG_VERSION"));
