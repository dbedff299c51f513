//! Per-item transfer worker.
//!
//! A worker binds one control connection to at most one data connection
//! and drives a single queue item through negotiation, type setup,
//! resume, transfer, verification and a uniform result classification.
//! It never decides outcomes from raw socket state alone: the data
//! connection captures its own errors and the worker is the single
//! point that turns them, together with the server's reply, into a
//! queue-item status.
//!
//! The cancel flag is checked at every state boundary; mid-flight it
//! force-closes the data connection and discards unclaimed buffers.

use crate::ftp::control::{CommandFlags, CommandOutcome, ControlConnection};
use crate::ftp::data::{
    DataConnectionConfig, DataStreamSource, DataTlsConfig, DownloadConnection, UploadConnection,
    FLUSH_BUFFER_SIZE,
};
use crate::ftp::disk::{looks_binary, DiskRequest, DiskResponse, DiskWorker, WriteValidation};
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::events::{CancelFlag, ConnEvent};
use crate::ftp::protocol::{
    format_extended_port_args, format_port_args, parse_extended_passive_port,
    parse_passive_addr, CommandText,
};
use crate::ftp::proxy;
use crate::ftp::speed::SpeedMeter;
use crate::ftp::types::{
    AsciiMismatchPolicy, ItemOperation, ItemStatus, ItemStatusSink, QueueItem, ResumeMode,
    TransferDirection, TransferMode,
};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

/// Transient failures are retried this many times before surfacing.
pub const MAX_TRANSIENT_RETRIES: u32 = 3;

// ─── Target identity locks ───────────────────────────────────────────

/// Registry of remote files with an operation in progress. A second
/// worker hitting the same identity skips its item instead of racing.
pub struct TargetLocks {
    inner: Mutex<HashSet<String>>,
}

impl TargetLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashSet::new()),
        })
    }

    pub fn try_lock(self: &Arc<Self>, key: String) -> Option<TargetLockGuard> {
        let mut set = self.inner.lock().unwrap();
        if set.contains(&key) {
            return None;
        }
        set.insert(key.clone());
        Some(TargetLockGuard {
            key,
            locks: self.clone(),
        })
    }
}

pub struct TargetLockGuard {
    key: String,
    locks: Arc<TargetLocks>,
}

impl Drop for TargetLockGuard {
    fn drop(&mut self) {
        self.locks.inner.lock().unwrap().remove(&self.key);
    }
}

// ─── Operation-wide shared state ─────────────────────────────────────

/// State shared by every worker of one queue operation.
pub struct OperationShared {
    /// Set once a server rejects the resume-offset command; later items
    /// skip the attempt instead of re-asking.
    pub resume_unsupported: AtomicBool,
    /// Aggregate transfer speed across all the operation's data
    /// connections.
    pub global_speed: Arc<SpeedMeter>,
}

impl OperationShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            resume_unsupported: AtomicBool::new(false),
            global_speed: Arc::new(SpeedMeter::new()),
        })
    }
}

// ─── Worker ──────────────────────────────────────────────────────────

/// How one attempt ended, before retry policy is applied.
enum AttemptOutcome {
    Done,
    Skipped,
    UserInput,
    /// Resume verification failed and policy allows a fresh start.
    RetryOverwrite,
    /// ASCII-mode data turned out binary and policy says retry binary.
    RetryBinary,
}

pub struct TransferWorker {
    conn: ControlConnection,
    disk: DiskWorker,
    sink: Arc<dyn ItemStatusSink>,
    locks: Arc<TargetLocks>,
    shared: Arc<OperationShared>,
    cancel: CancelFlag,
}

impl TransferWorker {
    pub fn new(
        conn: ControlConnection,
        disk: DiskWorker,
        sink: Arc<dyn ItemStatusSink>,
        locks: Arc<TargetLocks>,
        shared: Arc<OperationShared>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            conn,
            disk,
            sink,
            locks,
            shared,
            cancel,
        }
    }

    /// Hand the control connection back (to the engine or an
    /// interactive session).
    pub fn into_connection(self) -> ControlConnection {
        self.conn
    }

    /// Drive one item to a terminal status. `Err` means the control
    /// connection is no longer usable; the item has already been put
    /// back to Waiting.
    pub async fn process(&mut self, item: &QueueItem) -> FtpResult<()> {
        let params = self.conn.params();
        let identity = format!(
            "{}@{}:{} {}/{}",
            params.username, params.host, params.port, item.remote_path, item.name
        );
        let _lock = match self.locks.try_lock(identity) {
            Some(g) => g,
            None => {
                log::debug!("item {} skipped, target already locked", item.id);
                self.sink.item_status(&item.id, ItemStatus::Skipped);
                return Ok(());
            }
        };
        self.sink.item_status(&item.id, ItemStatus::Processing);

        let mut transient_failures = 0u32;
        let mut force_overwrite = false;
        let mut force_binary = false;
        loop {
            if self.cancel.is_cancelled() {
                self.sink.item_status(&item.id, ItemStatus::Waiting);
                return Ok(());
            }
            let result = self.attempt(item, force_overwrite, force_binary).await;
            match result {
                Ok(AttemptOutcome::Done) => {
                    self.sink.item_status(&item.id, ItemStatus::Done);
                    return Ok(());
                }
                Ok(AttemptOutcome::Skipped) => {
                    self.sink.item_status(&item.id, ItemStatus::Skipped);
                    return Ok(());
                }
                Ok(AttemptOutcome::UserInput) => {
                    self.sink.item_status(&item.id, ItemStatus::UserInputNeeded);
                    return Ok(());
                }
                Ok(AttemptOutcome::RetryOverwrite) => {
                    log::info!("item {}: resume verification failed, restarting", item.id);
                    force_overwrite = true;
                }
                Ok(AttemptOutcome::RetryBinary) => {
                    log::info!("item {}: retrying in binary mode", item.id);
                    force_binary = true;
                }
                Err(e) => match e.kind {
                    FtpErrorKind::Cancelled => {
                        self.sink.item_status(&item.id, ItemStatus::Waiting);
                        return Ok(());
                    }
                    FtpErrorKind::ConnectionLost => {
                        // item returns to the queue; the caller decides
                        // whether to reconnect
                        self.sink.item_status(&item.id, ItemStatus::Waiting);
                        return Err(e);
                    }
                    FtpErrorKind::ProtocolTransient
                    | FtpErrorKind::DataChannelFailed
                    | FtpErrorKind::TlsFailed => {
                        transient_failures += 1;
                        if transient_failures > MAX_TRANSIENT_RETRIES {
                            self.sink.item_status(&item.id, failed_status(&e));
                            return Ok(());
                        }
                        log::info!(
                            "item {}: transient failure ({}), retry {}/{}",
                            item.id,
                            e,
                            transient_failures,
                            MAX_TRANSIENT_RETRIES
                        );
                    }
                    _ => {
                        self.sink.item_status(&item.id, failed_status(&e));
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn attempt(
        &mut self,
        item: &QueueItem,
        force_overwrite: bool,
        force_binary: bool,
    ) -> FtpResult<AttemptOutcome> {
        match (&item.operation, item.direction) {
            (ItemOperation::Delete, _) => self.delete_remote(item).await,
            (ItemOperation::Rename { new_name }, _) => {
                let new_name = new_name.clone();
                self.rename_remote(item, &new_name).await
            }
            (ItemOperation::CreateDir, _) => self.create_remote_dir(item).await,
            (_, TransferDirection::Download) => {
                self.download(item, force_overwrite, force_binary).await
            }
            (_, TransferDirection::Upload) => {
                self.upload(item, force_overwrite, force_binary).await
            }
        }
    }

    // ── Non-transfer operations ──────────────────────────────────

    async fn delete_remote(&mut self, item: &QueueItem) -> FtpResult<AttemptOutcome> {
        self.enter_directory(&item.remote_path).await?;
        let out = self.command(format!("DELE {}", item.name)).await?;
        if out.reply.is_success() {
            Ok(AttemptOutcome::Done)
        } else {
            Err(out.reply.to_error())
        }
    }

    async fn rename_remote(
        &mut self,
        item: &QueueItem,
        new_name: &str,
    ) -> FtpResult<AttemptOutcome> {
        self.enter_directory(&item.remote_path).await?;
        let out = self.command(format!("RNFR {}", item.name)).await?;
        if !out.reply.is_partial() {
            return Err(out.reply.to_error());
        }
        let out = self.command(format!("RNTO {}", new_name)).await?;
        if out.reply.is_success() {
            Ok(AttemptOutcome::Done)
        } else {
            Err(out.reply.to_error())
        }
    }

    async fn create_remote_dir(&mut self, item: &QueueItem) -> FtpResult<AttemptOutcome> {
        self.enter_directory(&item.remote_path).await?;
        let out = self.command(format!("MKD {}", item.name)).await?;
        if out.reply.is_success() {
            Ok(AttemptOutcome::Done)
        } else {
            Err(out.reply.to_error())
        }
    }

    // ── Download ─────────────────────────────────────────────────

    async fn download(
        &mut self,
        item: &QueueItem,
        force_overwrite: bool,
        force_binary: bool,
    ) -> FtpResult<AttemptOutcome> {
        let params = self.conn.params().clone();
        let mode = if force_binary {
            TransferMode::Binary
        } else {
            item.transfer_mode
        };
        let resume_mode = if force_overwrite {
            ResumeMode::Overwrite
        } else {
            item.resume_mode
        };

        self.enter_directory(&item.remote_path).await?;
        self.check_cancelled()?;

        // local target and resume plan
        let local = Path::new(&item.local_path);
        let existing_len = std::fs::metadata(local).map(|m| m.len()).ok();
        let mut plan = self.plan_resume(existing_len, resume_mode, &params)?;
        let file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(local)
                .map_err(FtpError::from)?,
        );
        if plan.fresh && existing_len.unwrap_or(0) > 0 {
            self.disk
                .submit(DiskRequest::Truncate {
                    file: file.clone(),
                    len: 0,
                })
                .await?;
        }
        let mut verify = if plan.verify_len > 0 {
            match self
                .disk
                .submit(DiskRequest::ReadChunk {
                    file: file.clone(),
                    offset: plan.verify_from,
                    len: plan.verify_len as usize,
                })
                .await?
            {
                DiskResponse::Read { data } => data,
                _ => Vec::new(),
            }
        } else {
            Vec::new()
        };

        // data channel, transfer type, resume offset
        let source = self.open_data_source().await?;
        self.conn.set_transfer_type(mode, &self.cancel.clone()).await?;
        self.check_cancelled()?;
        if let Some(offset) = plan.rest_offset {
            if !self.send_rest(offset, resume_mode).await? {
                // fall back to a fresh start; the old tail is gone, so
                // the overlap bytes read from it must not be matched
                // against the restarted stream
                self.disk
                    .submit(DiskRequest::Truncate {
                        file: file.clone(),
                        len: 0,
                    })
                    .await?;
                plan = ResumePlan::fresh();
                verify.clear();
            }
        }

        let download = DownloadConnection::start(self.data_config(source, &params));
        let retr = CommandText::plain(format!("RETR {}", item.name));
        let pump = self
            .pump_download(retr, download, file.clone(), &plan, verify, mode)
            .await;

        // classification
        let PumpResult {
            outcome,
            reply,
            verify_failed,
            ascii_violation,
            disk_error,
            written_past_start,
        } = pump;

        if ascii_violation {
            // roll the partial target back before deciding anything else
            if plan.original_len == 0 {
                drop(file);
                let _ = std::fs::remove_file(local);
            } else {
                self.disk
                    .submit(DiskRequest::Truncate {
                        file: file.clone(),
                        len: plan.original_len,
                    })
                    .await?;
            }
            let _ = reply; // server-side state no longer matters
            return Ok(match item.ascii_mismatch {
                AsciiMismatchPolicy::Prompt => AttemptOutcome::UserInput,
                AsciiMismatchPolicy::RetryInBinary => AttemptOutcome::RetryBinary,
                AsciiMismatchPolicy::Skip => AttemptOutcome::Skipped,
            });
        }
        if verify_failed {
            if resume_mode == ResumeMode::Resume {
                return Err(FtpError::integrity(
                    "resumed data does not match the existing target",
                ));
            }
            return Ok(AttemptOutcome::RetryOverwrite);
        }
        if let Some(e) = disk_error {
            return Err(e);
        }
        let reply = reply?;
        if reply.reply.is_error() {
            return Err(reply.reply.to_error());
        }
        if !outcome.ever_connected {
            // the server claimed success but no connection ever arrived
            return Err(FtpError::data_channel(
                "server reported success but the data connection never arrived",
            ));
        }
        if let Some(e) = outcome.error {
            return Err(e);
        }
        if outcome.watchdog_closed {
            return Err(FtpError::data_channel(
                "no data transferred within the configured interval",
            ));
        }
        if !outcome.graceful_eof && written_past_start {
            // data closed right after a success reply: suspected loss
            return Err(FtpError::data_channel(
                "data connection closed prematurely after a success reply",
            ));
        }
        file.sync_all().map_err(FtpError::from)?;
        drop(file);

        if item.operation == ItemOperation::Move {
            let out = self.command(format!("DELE {}", item.name)).await?;
            if !out.reply.is_success() {
                return Err(out.reply.to_error());
            }
        }
        Ok(AttemptOutcome::Done)
    }

    /// RETR is in flight while chunks stream to the disk worker.
    async fn pump_download(
        &mut self,
        retr: CommandText,
        mut download: DownloadConnection,
        file: Arc<File>,
        plan: &ResumePlan,
        verify: Vec<u8>,
        mode: TransferMode,
    ) -> PumpResult {
        let conn = &mut self.conn;
        let disk = &self.disk;
        let cancel = self.cancel.clone();
        let flags = CommandFlags {
            allow_abort: true,
            ..Default::default()
        };
        let cmd_fut = conn.send_command(retr, flags, &cancel);
        tokio::pin!(cmd_fut);

        let mut reply: Option<FtpResult<CommandOutcome>> = None;
        let mut write_offset = plan.verify_from;
        let mut verified = 0usize;
        let mut verify_failed = false;
        let mut ascii_violation = false;
        let mut disk_error: Option<FtpError> = None;
        let validate = (mode == TransferMode::Ascii).then_some(WriteValidation::RejectBinary);

        loop {
            tokio::select! {
                r = &mut cmd_fut, if reply.is_none() => {
                    let failed = matches!(&r, Err(_)) || matches!(&r, Ok(o) if o.reply.is_error());
                    reply = Some(r);
                    if failed {
                        download.force_close();
                    }
                }
                chunk = download.next_chunk() => match chunk {
                    Some(mut bytes) => {
                        if verified < verify.len() {
                            let need = verify.len() - verified;
                            let take = need.min(bytes.len());
                            if bytes[..take] != verify[verified..verified + take] {
                                verify_failed = true;
                                download.force_close();
                                continue;
                            }
                            verified += take;
                            write_offset += take as u64;
                            bytes.drain(..take);
                            if bytes.is_empty() {
                                continue;
                            }
                        }
                        match disk
                            .submit(DiskRequest::WriteChunk {
                                file: file.clone(),
                                offset: write_offset,
                                data: bytes,
                                validate,
                            })
                            .await
                        {
                            Ok(DiskResponse::Written { bytes: n }) => {
                                write_offset += n as u64;
                            }
                            Ok(_) => {}
                            Err(e) if e.kind == FtpErrorKind::Integrity => {
                                ascii_violation = true;
                                download.force_close();
                            }
                            Err(e) => {
                                disk_error = Some(e);
                                download.force_close();
                            }
                        }
                    }
                    None => break,
                },
            }
        }
        // FinishFlushToDisk happened chunk-wise; collect the final state
        let outcome = download.finish().await;
        let reply = match reply {
            Some(r) => r,
            None => cmd_fut.await,
        };
        PumpResult {
            outcome,
            reply,
            verify_failed,
            ascii_violation,
            disk_error,
            written_past_start: write_offset > plan.verify_from,
        }
    }

    // ── Upload ───────────────────────────────────────────────────

    async fn upload(
        &mut self,
        item: &QueueItem,
        force_overwrite: bool,
        force_binary: bool,
    ) -> FtpResult<AttemptOutcome> {
        let params = self.conn.params().clone();
        let mode = if force_binary {
            TransferMode::Binary
        } else {
            item.transfer_mode
        };
        let resume_mode = if force_overwrite {
            ResumeMode::Overwrite
        } else {
            item.resume_mode
        };

        self.enter_directory(&item.remote_path).await?;
        self.check_cancelled()?;

        let src = Arc::new(File::open(&item.local_path).map_err(FtpError::from)?);
        let local_len = src.metadata().map_err(FtpError::from)?.len();

        let source = self.open_data_source().await?;
        self.conn.set_transfer_type(mode, &self.cancel.clone()).await?;

        // SIZE-based resume: append where the server left off
        let mut start_offset = 0u64;
        let mut verb = "STOR";
        if matches!(resume_mode, ResumeMode::Resume | ResumeMode::ResumeOrOverwrite)
            && !self.shared.resume_unsupported.load(Ordering::SeqCst)
        {
            let out = self.command(format!("SIZE {}", item.name)).await?;
            if out.reply.code == 213 {
                let remote: u64 = out.reply.detail().trim().parse().unwrap_or(0);
                if remote == local_len {
                    // nothing left to send
                    if item.operation == ItemOperation::Move {
                        std::fs::remove_file(&item.local_path).map_err(FtpError::from)?;
                    }
                    return Ok(AttemptOutcome::Done);
                }
                if remote > local_len {
                    if resume_mode == ResumeMode::Resume {
                        return Err(FtpError::integrity(
                            "remote file is larger than the local source",
                        ));
                    }
                    // fall through to a fresh STOR
                } else if remote >= params.resume_min_file_size {
                    start_offset = remote;
                    verb = "APPE";
                }
            }
        }
        self.check_cancelled()?;

        let upload = UploadConnection::start(self.data_config(source, &params));
        let cmd = CommandText::plain(format!("{} {}", verb, item.name));
        let pump = self
            .pump_upload(cmd, upload, src, start_offset, mode)
            .await;

        let UploadPumpResult {
            outcome,
            reply,
            ascii_violation,
            disk_error,
        } = pump;

        if ascii_violation {
            let _ = reply;
            if verb == "STOR" {
                // best effort: do not leave a partial remote file behind
                let _ = self.command(format!("DELE {}", item.name)).await;
            }
            return Ok(match item.ascii_mismatch {
                AsciiMismatchPolicy::Prompt => AttemptOutcome::UserInput,
                AsciiMismatchPolicy::RetryInBinary => AttemptOutcome::RetryBinary,
                AsciiMismatchPolicy::Skip => AttemptOutcome::Skipped,
            });
        }
        if let Some(e) = disk_error {
            return Err(e);
        }
        let reply = reply?;
        if reply.reply.is_error() {
            return Err(reply.reply.to_error());
        }
        if !outcome.ever_connected {
            return Err(FtpError::data_channel(
                "server reported success but the data connection never arrived",
            ));
        }
        if let Some(e) = outcome.error {
            return Err(e);
        }
        if outcome.watchdog_closed {
            return Err(FtpError::data_channel(
                "no data transferred within the configured interval",
            ));
        }

        if item.operation == ItemOperation::Move {
            // source removed only once the server confirmed the store
            std::fs::remove_file(&item.local_path).map_err(FtpError::from)?;
        }
        Ok(AttemptOutcome::Done)
    }

    async fn pump_upload(
        &mut self,
        cmd: CommandText,
        upload: UploadConnection,
        src: Arc<File>,
        start_offset: u64,
        mode: TransferMode,
    ) -> UploadPumpResult {
        let conn = &mut self.conn;
        let disk = &self.disk;
        let cancel = self.cancel.clone();
        let flags = CommandFlags {
            allow_abort: true,
            ..Default::default()
        };
        let cmd_fut = conn.send_command(cmd, flags, &cancel);
        tokio::pin!(cmd_fut);

        let mut reply: Option<FtpResult<CommandOutcome>> = None;
        let mut offset = start_offset;
        let mut ascii_violation = false;
        let mut disk_error: Option<FtpError> = None;

        loop {
            tokio::select! {
                r = &mut cmd_fut, if reply.is_none() => {
                    // the final reply cannot precede end of data unless
                    // the command failed or was aborted
                    reply = Some(r);
                    upload.force_close();
                    break;
                }
                r = disk.submit(DiskRequest::ReadChunk {
                    file: src.clone(),
                    offset,
                    len: FLUSH_BUFFER_SIZE,
                }) => match r {
                    Ok(DiskResponse::Read { data }) if data.is_empty() => break,
                    Ok(DiskResponse::Read { data }) => {
                        if mode == TransferMode::Ascii && looks_binary(&data) {
                            ascii_violation = true;
                            upload.force_close();
                            break;
                        }
                        offset += data.len() as u64;
                        if upload.send_chunk(data).await.is_err() {
                            // task ended early; its outcome says why
                            break;
                        }
                    }
                    Ok(_) => break,
                    Err(e) => {
                        disk_error = Some(e);
                        upload.force_close();
                        break;
                    }
                },
            }
        }
        let outcome = upload.finish().await;
        let reply = match reply {
            Some(r) => r,
            None => cmd_fut.await,
        };
        UploadPumpResult {
            outcome,
            reply,
            ascii_violation,
            disk_error,
        }
    }

    // ── Shared plumbing ──────────────────────────────────────────

    async fn command(&mut self, text: String) -> FtpResult<CommandOutcome> {
        let cancel = self.cancel.clone();
        self.conn
            .send_command(CommandText::plain(text), CommandFlags::default(), &cancel)
            .await
    }

    fn check_cancelled(&self) -> FtpResult<()> {
        if self.cancel.is_cancelled() {
            Err(FtpError::cancelled())
        } else {
            Ok(())
        }
    }

    async fn enter_directory(&mut self, path: &str) -> FtpResult<()> {
        let cancel = self.cancel.clone();
        if self.conn.working_path(&cancel).await? == path {
            return Ok(());
        }
        self.conn.change_working_path(path, &cancel).await
    }

    async fn open_data_source(&mut self) -> FtpResult<DataStreamSource> {
        negotiate_data_source(&mut self.conn, &self.cancel).await
    }

    fn data_config(
        &self,
        source: DataStreamSource,
        params: &crate::ftp::types::ConnectionParameters,
    ) -> DataConnectionConfig {
        let mut cfg = DataConnectionConfig::new(source, self.conn.log_id());
        if params.protect_data_channel && params.security != crate::ftp::types::SecurityMode::None
        {
            cfg.tls = Some(DataTlsConfig {
                host: params.host.clone(),
                accept_invalid_certs: params.accept_invalid_certs,
            });
        }
        cfg.compress = self.conn.compression_active();
        cfg.no_data_timeout = Duration::from_secs(params.no_data_timeout_sec);
        cfg.accept_timeout = Duration::from_secs(params.connect_timeout_sec);
        cfg.global_speed = Some(self.shared.global_speed.clone());
        cfg
    }

    /// Decide how to treat an existing partial target.
    fn plan_resume(
        &self,
        existing_len: Option<u64>,
        resume_mode: ResumeMode,
        params: &crate::ftp::types::ConnectionParameters,
    ) -> FtpResult<ResumePlan> {
        let len = match existing_len {
            None | Some(0) => return Ok(ResumePlan::fresh()),
            Some(l) => l,
        };
        match resume_mode {
            ResumeMode::CreateNew => Err(FtpError::io_error("local target already exists")),
            ResumeMode::Overwrite => Ok(ResumePlan::fresh()),
            ResumeMode::Resume | ResumeMode::ResumeOrOverwrite => {
                if self.shared.resume_unsupported.load(Ordering::SeqCst) {
                    if resume_mode == ResumeMode::Resume {
                        return Err(FtpError::new(
                            FtpErrorKind::ProtocolPermanent,
                            "server does not support resume",
                        ));
                    }
                    return Ok(ResumePlan::fresh());
                }
                if len < params.resume_min_file_size {
                    // not worth resuming
                    return Ok(ResumePlan::fresh());
                }
                let overlap = params.resume_overlap;
                if len <= overlap {
                    // too small for an offset command: read from zero and
                    // verify the whole existing prefix
                    Ok(ResumePlan {
                        rest_offset: None,
                        verify_from: 0,
                        verify_len: len,
                        original_len: len,
                        fresh: false,
                    })
                } else {
                    Ok(ResumePlan {
                        rest_offset: Some(len - overlap),
                        verify_from: len - overlap,
                        verify_len: overlap,
                        original_len: len,
                        fresh: false,
                    })
                }
            }
        }
    }

    /// Send the resume-offset command. `Ok(false)` means the plan must
    /// fall back to a fresh start.
    async fn send_rest(&mut self, offset: u64, resume_mode: ResumeMode) -> FtpResult<bool> {
        let out = self.command(format!("REST {}", offset)).await?;
        use crate::ftp::protocol::ReplyClass;
        match out.reply.class() {
            ReplyClass::Partial | ReplyClass::Success => Ok(true),
            ReplyClass::PermanentError => {
                // remember for the operation's remaining items
                self.shared.resume_unsupported.store(true, Ordering::SeqCst);
                if resume_mode == ResumeMode::Resume {
                    return Err(out.reply.to_error());
                }
                Ok(false)
            }
            _ => Err(out.reply.to_error()),
        }
    }
}

/// Negotiate the data-channel address: PASV (passive) or a local or
/// proxy listener announced with PORT/EPRT (active).
pub(crate) async fn negotiate_data_source(
    conn: &mut ControlConnection,
    cancel: &CancelFlag,
) -> FtpResult<DataStreamSource> {
    let params = conn.params().clone();
    if params.passive_mode {
        let addr = passive_target(conn, cancel).await?;
        let tcp = proxy::connect_tcp(
            &params.proxy,
            &addr.ip().to_string(),
            addr.port(),
            Duration::from_secs(params.connect_timeout_sec),
        )
        .await
        .map_err(|e| FtpError::data_channel(e.message))?;
        Ok(DataStreamSource::Connected(tcp))
    } else {
        let (listener, mut addr) = proxy::open_listener(
            &params.proxy,
            params.active_bind_address.as_deref(),
            &params.host,
            params.port,
        )
        .await?;
        if addr.ip().is_unspecified() {
            if let Some(ip) = conn.local_ip() {
                addr.set_ip(ip);
            }
        }
        conn.note_event(ConnEvent::ListenReady(addr));
        let cmd = match format_port_args(addr) {
            Some(args) => format!("PORT {}", args),
            None => format!("EPRT {}", format_extended_port_args(addr)),
        };
        let out = conn
            .send_command(CommandText::plain(cmd), CommandFlags::default(), cancel)
            .await?;
        if !out.reply.is_success() {
            return Err(out.reply.to_error());
        }
        Ok(DataStreamSource::Listening(listener))
    }
}

/// Pick the passive data address. PASV for IPv4 peers; EPSV for IPv6
/// peers and as a fallback when the server refuses PASV or answers it
/// with something unparsable. The 229 reply carries only a port, the
/// host is the control connection's peer.
async fn passive_target(
    conn: &mut ControlConnection,
    cancel: &CancelFlag,
) -> FtpResult<SocketAddr> {
    let peer = conn.peer_ip();
    if !matches!(peer, Some(IpAddr::V6(_))) {
        let out = conn
            .send_command(CommandText::plain("PASV"), CommandFlags::default(), cancel)
            .await?;
        if out.reply.is_success() {
            if let Some(addr) = parse_passive_addr(&out.reply.text()) {
                return Ok(addr);
            }
        }
        log::debug!("PASV unavailable, trying EPSV");
    }
    let out = conn
        .send_command(CommandText::plain("EPSV"), CommandFlags::default(), cancel)
        .await?;
    if !out.reply.is_success() {
        return Err(out.reply.to_error());
    }
    let port = parse_extended_passive_port(&out.reply.text())
        .ok_or_else(|| FtpError::protocol_error("unparsable EPSV reply"))?;
    let ip = peer.ok_or_else(|| FtpError::data_channel("peer address unknown"))?;
    Ok(SocketAddr::new(ip, port))
}

struct ResumePlan {
    rest_offset: Option<u64>,
    verify_from: u64,
    verify_len: u64,
    original_len: u64,
    fresh: bool,
}

impl ResumePlan {
    fn fresh() -> Self {
        Self {
            rest_offset: None,
            verify_from: 0,
            verify_len: 0,
            original_len: 0,
            fresh: true,
        }
    }
}

struct PumpResult {
    outcome: crate::ftp::data::DataOutcome,
    reply: FtpResult<CommandOutcome>,
    verify_failed: bool,
    ascii_violation: bool,
    disk_error: Option<FtpError>,
    written_past_start: bool,
}

struct UploadPumpResult {
    outcome: crate::ftp::data::DataOutcome,
    reply: FtpResult<CommandOutcome>,
    ascii_violation: bool,
    disk_error: Option<FtpError>,
}

fn failed_status(e: &FtpError) -> ItemStatus {
    let reason = match e.kind {
        FtpErrorKind::ConnectionFailed => "could not connect",
        FtpErrorKind::TlsFailed => "TLS failure",
        FtpErrorKind::AuthFailed => "login rejected",
        FtpErrorKind::ProtocolTransient => "server refused the operation",
        FtpErrorKind::ProtocolPermanent => "server rejected the operation",
        FtpErrorKind::ConnectionLost => "connection lost",
        FtpErrorKind::DataChannelFailed => "data connection failed",
        FtpErrorKind::ProtocolError => "unexpected server behaviour",
        FtpErrorKind::Resource => "out of resources",
        FtpErrorKind::Integrity => "transfer integrity failure",
        FtpErrorKind::Io => "local file failure",
        FtpErrorKind::Cancelled => "cancelled",
        FtpErrorKind::InvalidConfig => "invalid configuration",
    };
    ItemStatus::Failed {
        reason: reason.to_string(),
        os_error: e.os_error,
        detail: e.message.clone(),
    }
}
