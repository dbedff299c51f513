//! Per-connection text logs.
//!
//! Every control connection gets a log keyed by an increasing id; data
//! connections and workers append through the same id. Logs of closed
//! connections are retained up to a bound, oldest dropped first.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use std::sync::Mutex;

/// Id of one connection log.
pub type LogId = u32;

/// How many closed-connection logs are kept around.
pub const CLOSED_LOG_RETENTION: usize = 10;

/// Upper bound on a single log's text, to keep long sessions sane.
const MAX_LOG_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone)]
pub struct ConnectionLog {
    pub id: LogId,
    pub host: String,
    pub port: u16,
    pub created: DateTime<Utc>,
    pub closed: bool,
    text: String,
}

impl ConnectionLog {
    pub fn text(&self) -> &str {
        &self.text
    }
}

struct LogsInner {
    next_id: LogId,
    logs: Vec<ConnectionLog>,
    retention: usize,
}

/// Registry of all connection logs.
pub struct Logs {
    inner: Mutex<LogsInner>,
}

lazy_static! {
    /// Global log registry, shared by every connection in the process.
    pub static ref LOGS: Logs = Logs::new(CLOSED_LOG_RETENTION);
}

impl Logs {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: Mutex::new(LogsInner {
                next_id: 1,
                logs: Vec::new(),
                retention,
            }),
        }
    }

    /// Open a log for a new connection; ids only ever grow.
    pub fn create(&self, host: &str, port: u16) -> LogId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.logs.push(ConnectionLog {
            id,
            host: host.to_string(),
            port,
            created: Utc::now(),
            closed: false,
            text: String::new(),
        });
        id
    }

    /// Append one line (terminator added if missing). Unknown ids are
    /// ignored; the log may already have been evicted.
    pub fn append(&self, id: LogId, line: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(log) = inner.logs.iter_mut().find(|l| l.id == id) {
            if log.text.len() + line.len() > MAX_LOG_BYTES {
                let cut = log.text.len().min(MAX_LOG_BYTES / 4);
                log.text.drain(..cut);
            }
            log.text.push_str(line);
            if !line.ends_with('\n') {
                log.text.push('\n');
            }
        }
    }

    /// Mark a connection's log as closed and enforce the retention
    /// bound on closed logs.
    pub fn mark_closed(&self, id: LogId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(log) = inner.logs.iter_mut().find(|l| l.id == id) {
            log.closed = true;
        }
        let retention = inner.retention;
        let closed: Vec<LogId> = inner
            .logs
            .iter()
            .filter(|l| l.closed)
            .map(|l| l.id)
            .collect();
        if closed.len() > retention {
            let drop_n = closed.len() - retention;
            // ids grow monotonically, so the first n closed ids are the oldest
            let drop_ids: Vec<LogId> = closed.into_iter().take(drop_n).collect();
            inner.logs.retain(|l| !drop_ids.contains(&l.id));
        }
    }

    pub fn get(&self, id: LogId) -> Option<ConnectionLog> {
        self.inner.lock().unwrap().logs.iter().find(|l| l.id == id).cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().logs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase() {
        let logs = Logs::new(4);
        let a = logs.create("h1", 21);
        let b = logs.create("h2", 21);
        assert!(b > a);
    }

    #[test]
    fn append_and_read_back() {
        let logs = Logs::new(4);
        let id = logs.create("h", 21);
        logs.append(id, "220 Ready");
        logs.append(id, "USER test\n");
        let log = logs.get(id).unwrap();
        assert_eq!(log.text(), "220 Ready\nUSER test\n");
    }

    #[test]
    fn closed_logs_bounded() {
        let logs = Logs::new(2);
        let ids: Vec<LogId> = (0..5).map(|i| logs.create("h", 21 + i)).collect();
        for id in &ids {
            logs.mark_closed(*id);
        }
        assert_eq!(logs.count(), 2);
        // oldest evicted, newest kept
        assert!(logs.get(ids[0]).is_none());
        assert!(logs.get(ids[4]).is_some());
    }

    #[test]
    fn open_logs_never_evicted() {
        let logs = Logs::new(1);
        let open = logs.create("h", 21);
        for i in 0..4 {
            let id = logs.create("h", 100 + i);
            logs.mark_closed(id);
        }
        assert!(logs.get(open).is_some());
    }

    #[test]
    fn append_to_unknown_id_ignored() {
        let logs = Logs::new(1);
        logs.append(999, "nothing");
        assert_eq!(logs.count(), 0);
    }
}
