//! Transfer engine.
//!
//! The engine owns everything workers share: the disk I/O worker, the
//! target locks, both listing caches, the operation-wide speed meter
//! and the connection-count limiter. Control connections pass through
//! it by value: the engine hands one to a worker for the duration of
//! an item and takes it back afterwards, so a connection never has two
//! users.
//!
//! Cache bookkeeping lives here, not in the workers: the engine records
//! structured changes for completed mutations and invalidates entries
//! whose real state is no longer known.

use crate::ftp::cache::{ListingCache, ListingKey};
use crate::ftp::control::{CommandFlags, ControlConnection};
use crate::ftp::data::{DataConnectionConfig, DataTlsConfig, DownloadConnection};
use crate::ftp::disk::DiskWorker;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::events::{CancelFlag, ConnEvent};
use crate::ftp::protocol::CommandText;
use crate::ftp::speed::SpeedMeter;
use crate::ftp::types::{
    ConnectionParameters, EntryKind, ItemOperation, ItemStatus, ItemStatusSink, ListingEntry,
    QueueItem, SecurityMode, ServerPathType, TransferDirection, TransferMode,
};
use crate::ftp::upload_cache::{ChangeKind, UploadCacheLookup, UploadListingCache};
use crate::ftp::worker::{negotiate_data_source, OperationShared, TargetLocks, TransferWorker};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::time::Duration;

// ─── Listing parser ──────────────────────────────────────────────────

/// Turns raw listing text into structured entries. The engine ships a
/// Unix-format parser; callers with stranger servers plug in their own.
pub trait ListingParser: Send + Sync {
    fn parse(&self, raw: &str, path_type: ServerPathType) -> FtpResult<Vec<ListingEntry>>;
}

/// Parser for the `ls -l` style most Unix servers emit.
pub struct UnixListingParser;

impl ListingParser for UnixListingParser {
    fn parse(&self, raw: &str, _path_type: ServerPathType) -> FtpResult<Vec<ListingEntry>> {
        lazy_static! {
            static ref LINE_RE: Regex = Regex::new(
                r"^([\-dl])[rwxsStT\-]{9}\s+\d+\s+\S+\s+\S+\s+(\d+)\s+\S+\s+\S+\s+\S+\s+(.+)$"
            )
            .unwrap();
        }
        let mut entries = Vec::new();
        for line in raw.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with("total ") {
                continue;
            }
            let c = match LINE_RE.captures(line) {
                Some(c) => c,
                None => continue, // servers mix in banners and summaries
            };
            let kind = match &c[1] {
                "d" => EntryKind::Directory,
                "l" => EntryKind::Link,
                _ => EntryKind::File,
            };
            let size: u64 = c[2].parse().unwrap_or(0);
            let mut name = c[3].to_string();
            if kind == EntryKind::Link {
                if let Some(pos) = name.find(" -> ") {
                    name.truncate(pos);
                }
            }
            if name == "." || name == ".." {
                continue;
            }
            entries.push(ListingEntry { name, kind, size });
        }
        Ok(entries)
    }
}

// ─── Engine ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently transferring connections.
    pub max_connections: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_connections: 2 }
    }
}

pub struct TransferEngine {
    limiter: Arc<Semaphore>,
    disk: DiskWorker,
    locks: Arc<TargetLocks>,
    shared: Arc<OperationShared>,
    listings: Arc<ListingCache>,
    upload_listings: Arc<UploadListingCache>,
    sink: Arc<dyn ItemStatusSink>,
    parser: Box<dyn ListingParser>,
}

impl TransferEngine {
    pub fn new(config: EngineConfig, sink: Arc<dyn ItemStatusSink>) -> Self {
        Self {
            limiter: Arc::new(Semaphore::new(config.max_connections.max(1))),
            disk: DiskWorker::spawn(),
            locks: TargetLocks::new(),
            shared: OperationShared::new(),
            listings: Arc::new(ListingCache::new()),
            upload_listings: Arc::new(UploadListingCache::new()),
            sink,
            parser: Box::new(UnixListingParser),
        }
    }

    pub fn with_parser(mut self, parser: Box<dyn ListingParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn listing_cache(&self) -> &Arc<ListingCache> {
        &self.listings
    }

    pub fn upload_listing_cache(&self) -> &Arc<UploadListingCache> {
        &self.upload_listings
    }

    /// Aggregate speed across every data connection of the operation.
    pub fn global_speed(&self) -> &Arc<SpeedMeter> {
        &self.shared.global_speed
    }

    // ── Items ────────────────────────────────────────────────────

    /// Run one queue item on the given connection and hand the
    /// connection back. The error, if any, says the connection is no
    /// longer usable; the item itself always reaches a terminal status
    /// through the sink.
    pub async fn run_item(
        &self,
        conn: ControlConnection,
        item: &QueueItem,
        cancel: CancelFlag,
    ) -> (ControlConnection, FtpResult<()>) {
        let permit = match self.limiter.acquire().await {
            Ok(p) => p,
            Err(_) => {
                // semaphore closed only on teardown
                return (conn, Err(FtpError::cancelled()));
            }
        };
        let probe = Arc::new(StatusProbe::new(self.sink.clone()));
        let params = conn.params().clone();
        let path_type = conn.path_type();
        let mut worker = TransferWorker::new(
            conn,
            self.disk.clone(),
            probe.clone(),
            self.locks.clone(),
            self.shared.clone(),
            cancel,
        );
        let result = worker.process(item).await;
        let conn = worker.into_connection();
        drop(permit);

        self.record_item_effects(&params, path_type, item, probe.last());
        (conn, result)
    }

    /// Reflect a finished item in the listing caches. Done mutations are
    /// recorded as structured changes; anything else that may have
    /// touched the server drops the affected entries.
    fn record_item_effects(
        &self,
        params: &ConnectionParameters,
        path_type: ServerPathType,
        item: &QueueItem,
        status: Option<ItemStatus>,
    ) {
        let mutates = match (&item.operation, item.direction) {
            (ItemOperation::Copy, TransferDirection::Download) => false,
            _ => true,
        };
        if !mutates {
            return;
        }
        let key = self.listing_key(params, path_type, &item.remote_path);
        match status {
            Some(ItemStatus::Done) => {
                let now = Instant::now();
                match (&item.operation, item.direction) {
                    (ItemOperation::Delete, _) => {
                        self.upload_listings
                            .record_change(&key, ChangeKind::Delete, &item.name, now);
                    }
                    (ItemOperation::CreateDir, _) => {
                        self.upload_listings
                            .record_change(&key, ChangeKind::CreateDir, &item.name, now);
                    }
                    (ItemOperation::Rename { .. }, _) => {
                        // no structured change for renames; drop the entry
                        self.upload_listings.invalidate(&key);
                    }
                    (ItemOperation::Move, TransferDirection::Download) => {
                        // the remote source was deleted after the copy
                        self.upload_listings
                            .record_change(&key, ChangeKind::Delete, &item.name, now);
                    }
                    (_, TransferDirection::Upload) => {
                        let size = std::fs::metadata(&item.local_path)
                            .map(|m| m.len())
                            .unwrap_or(0)
                            .max(item.expected_size.unwrap_or(0));
                        self.upload_listings.record_change(
                            &key,
                            ChangeKind::FileUploaded { size },
                            &item.name,
                            now,
                        );
                    }
                    _ => {}
                }
            }
            Some(ItemStatus::Skipped) | Some(ItemStatus::Waiting) | None => return,
            // failed or stuck mid-mutation: the remote state is unknown
            _ => self.upload_listings.invalidate(&key),
        }
        self.listings.invalidate_path(
            &params.host,
            params.port,
            &params.username,
            &item.remote_path,
        );
    }

    // ── Listings ─────────────────────────────────────────────────

    /// Structured listing of a remote directory, served from the cache
    /// when possible. Concurrent callers for the same key coalesce onto
    /// one fetch.
    pub async fn fetch_listing(
        &self,
        conn: &mut ControlConnection,
        path: &str,
        cancel: &CancelFlag,
    ) -> FtpResult<(Vec<ListingEntry>, DateTime<Utc>)> {
        let params = conn.params().clone();
        let key = self.listing_key(&params, conn.path_type(), path);
        loop {
            match self.upload_listings.get(&key) {
                UploadCacheLookup::Hit(entries, acquired) => return Ok((entries, acquired)),
                UploadCacheLookup::InProgress(rx) => {
                    // another session is fetching the same path
                    let _ = rx.await;
                    continue;
                }
                UploadCacheLookup::Miss => break,
            }
        }
        let start_time = Instant::now();
        let raw = match self.fetch_listing_text(conn, path, cancel).await {
            Ok(raw) => raw,
            Err(e) => {
                self.upload_listings.abort_refresh(&key);
                return Err(e);
            }
        };
        let acquired = Utc::now();
        self.listings
            .put(key.clone(), raw.clone(), start_time, acquired);
        let entries = match self.parser.parse(&raw, conn.path_type()) {
            Ok(entries) => entries,
            Err(e) => {
                self.upload_listings.abort_refresh(&key);
                return Err(e);
            }
        };
        self.upload_listings
            .finish(&key, entries.clone(), start_time, acquired);
        Ok((entries, acquired))
    }

    /// Raw listing text over a fresh data connection.
    async fn fetch_listing_text(
        &self,
        conn: &mut ControlConnection,
        path: &str,
        cancel: &CancelFlag,
    ) -> FtpResult<String> {
        let params = conn.params().clone();
        if conn.working_path(cancel).await? != path {
            conn.change_working_path(path, cancel).await?;
        }
        let source = negotiate_data_source(conn, cancel).await?;
        conn.set_transfer_type(TransferMode::Ascii, cancel).await?;

        let mut cfg = DataConnectionConfig::new(source, conn.log_id());
        if params.protect_data_channel && params.security != SecurityMode::None {
            cfg.tls = Some(DataTlsConfig {
                host: params.host.clone(),
                accept_invalid_certs: params.accept_invalid_certs,
            });
        }
        cfg.compress = conn.compression_active();
        cfg.no_data_timeout = Duration::from_secs(params.no_data_timeout_sec);
        cfg.accept_timeout = Duration::from_secs(params.connect_timeout_sec);
        cfg.global_speed = Some(self.shared.global_speed.clone());

        let mut download = DownloadConnection::start(cfg);
        let list = params.list_command.clone().unwrap_or_else(|| "LIST".into());
        let flags = CommandFlags {
            allow_abort: true,
            ..Default::default()
        };
        let mut raw = Vec::new();
        let (reply, outcome) = {
            let cmd_fut = conn.send_command(CommandText::plain(list), flags, cancel);
            tokio::pin!(cmd_fut);

            let mut reply = None;
            loop {
                tokio::select! {
                    r = &mut cmd_fut, if reply.is_none() => {
                        let failed =
                            matches!(&r, Err(_)) || matches!(&r, Ok(o) if o.reply.is_error());
                        reply = Some(r);
                        if failed {
                            download.force_close();
                        }
                    }
                    chunk = download.next_chunk() => match chunk {
                        Some(bytes) => raw.extend_from_slice(&bytes),
                        None => break,
                    },
                }
            }
            let outcome = download.finish().await;
            let reply = match reply {
                Some(r) => r?,
                None => cmd_fut.await?,
            };
            (reply, outcome)
        };
        if reply.reply.is_error() {
            return Err(reply.reply.to_error());
        }
        if let Some(e) = outcome.error {
            return Err(e);
        }
        if !outcome.ever_connected {
            return Err(FtpError::data_channel(
                "server reported success but the data connection never arrived",
            ));
        }
        conn.note_event(ConnEvent::ExternalWorkDone);
        String::from_utf8(raw)
            .map_err(|_| FtpError::protocol_error("listing text is not valid UTF-8"))
    }

    fn listing_key(
        &self,
        params: &ConnectionParameters,
        path_type: ServerPathType,
        path: &str,
    ) -> ListingKey {
        ListingKey {
            host: params.host.clone(),
            port: params.port,
            user: params.username.clone(),
            path_type,
            path: path.to_string(),
            list_command: params.list_command.clone().unwrap_or_else(|| "LIST".into()),
            tls: params.security != SecurityMode::None,
        }
    }
}

/// Sink wrapper remembering the last status it forwarded, so the engine
/// can tell how an item ended without threading state back out of the
/// worker.
struct StatusProbe {
    inner: Arc<dyn ItemStatusSink>,
    last: Mutex<Option<ItemStatus>>,
}

impl StatusProbe {
    fn new(inner: Arc<dyn ItemStatusSink>) -> Self {
        Self {
            inner,
            last: Mutex::new(None),
        }
    }

    fn last(&self) -> Option<ItemStatus> {
        self.last.lock().unwrap().clone()
    }
}

impl ItemStatusSink for StatusProbe {
    fn item_status(&self, item_id: &str, status: ItemStatus) {
        *self.last.lock().unwrap() = Some(status.clone());
        self.inner.item_status(item_id, status);
    }
}
