//! Access logging.
//!
//! The engine emits one structured [`LogRecord`] per answered request
//! through an injected [`AccessSink`]; the backend (syslog, file, pipe) is
//! the embedding program's business.  [`CombinedLog`] renders the classic
//! combined format through the `log` facade, which is also what the engine
//! uses for its own diagnostics.

use serde::Serialize;

/// One answered request, ready for whatever backend is plugged in.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub client_ip: String,
    pub remote_user: Option<String>,
    pub method: String,
    pub url: String,
    pub protocol: String,
    pub status: u16,
    pub bytes: Option<i64>,
    pub referer: String,
    pub user_agent: String,
}

pub trait AccessSink: Send + Sync {
    fn log(&self, record: &LogRecord);
}

/// `<ip>: <user> "<method> <url> <proto>" <status> <bytes> "<referer>" "<ua>"`
#[derive(Debug, Default)]
pub struct CombinedLog;

impl AccessSink for CombinedLog {
    fn log(&self, r: &LogRecord) {
        let user = r.remote_user.as_deref().unwrap_or("-");
        let bytes = match r.bytes {
            Some(n) => n.to_string(),
            None => "-".to_string(),
        };
        log::info!(
            "{}: {} \"{} {} {}\" {} {} \"{}\" \"{}\"",
            r.client_ip,
            user,
            r.method,
            r.url,
            r.protocol,
            r.status,
            bytes,
            r.referer,
            r.user_agent
        );
    }
}

/// Emits each record as one JSON object per line.
#[derive(Debug, Default)]
pub struct JsonLog;

impl AccessSink for JsonLog {
    fn log(&self, r: &LogRecord) {
        match serde_json::to_string(r) {
            Ok(line) => log::info!("{line}"),
            Err(e) => log::error!("access record serialization failed: {e}"),
        }
    }
}
