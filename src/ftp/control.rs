//! The control connection.
//!
//! One owned value per FTP session. Connect and login run with direct
//! reads on the socket; once the session is established the read half
//! moves into a reader task that feeds the connection's event queue,
//! and all further traffic goes through `send_command`.
//!
//! Ownership is the handover mechanism: an interactive session gives
//! the connection to a worker by moving the value, and gets it back the
//! same way. At most one command is ever in flight.

use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::events::{CancelFlag, ConnEvent, EventQueue, WaitOutcome};
use crate::ftp::log::{LogId, LOGS};
use crate::ftp::protocol::{parse_passive_addr, parse_reply, CommandText, Reply};
use crate::ftp::proxy;
use crate::ftp::tls;
use crate::ftp::types::{
    ConnectionParameters, KeepAliveCommand, KeepAlivePolicy, SecurityMode, ServerPathType,
    TransferMode, TransferModeCache,
};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

// ─── Keep-alive sub-machine ──────────────────────────────────────────

/// Keep-alive lifecycle of a control connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeepAliveState {
    /// Keep-alive disabled or stopped for good.
    None,
    /// Idle, counting down to the next probe.
    Waiting,
    /// A probe command is on the wire.
    Processing,
    /// A normal command arrived while a probe was in flight; it runs
    /// once the probe completes.
    WaitingForEndOfProcessing,
    /// A normal command is using the connection; probes are suppressed.
    Forbidden,
}

/// Tracks when probes are due and suppresses them around real commands.
pub struct KeepAliveMachine {
    policy: KeepAlivePolicy,
    state: KeepAliveState,
    /// Last non-probe command completion; probes do not count.
    last_real_activity: Instant,
}

impl KeepAliveMachine {
    pub fn new(policy: KeepAlivePolicy, now: Instant) -> Self {
        let state = if policy.enabled {
            KeepAliveState::Waiting
        } else {
            KeepAliveState::None
        };
        Self {
            policy,
            state,
            last_real_activity: now,
        }
    }

    pub fn state(&self) -> KeepAliveState {
        self.state
    }

    pub fn command(&self) -> KeepAliveCommand {
        self.policy.command
    }

    /// Whether a probe should be sent now. Applies the stop-after
    /// cutoff: once the connection has been idle that long, probing
    /// stops for good.
    pub fn probe_due(&mut self, now: Instant) -> bool {
        if self.state != KeepAliveState::Waiting {
            return false;
        }
        let idle = now.saturating_duration_since(self.last_real_activity);
        if idle >= Duration::from_secs(self.policy.stop_after_sec) {
            self.state = KeepAliveState::None;
            return false;
        }
        idle >= Duration::from_secs(self.policy.send_every_sec)
    }

    pub fn begin_probe(&mut self) {
        self.state = KeepAliveState::Processing;
    }

    pub fn probe_finished(&mut self) {
        self.state = match self.state {
            KeepAliveState::None => KeepAliveState::None,
            // a command queued up behind the probe takes over
            KeepAliveState::WaitingForEndOfProcessing => KeepAliveState::Forbidden,
            _ => KeepAliveState::Waiting,
        };
    }

    /// A normal command is about to use the connection.
    pub fn begin_command(&mut self) {
        self.state = match self.state {
            KeepAliveState::None => KeepAliveState::None,
            KeepAliveState::Processing | KeepAliveState::WaitingForEndOfProcessing => {
                KeepAliveState::WaitingForEndOfProcessing
            }
            _ => KeepAliveState::Forbidden,
        };
    }

    /// A normal command finished; the idle countdown restarts.
    pub fn end_command(&mut self, now: Instant) {
        self.last_real_activity = now;
        if self.state != KeepAliveState::None {
            self.state = KeepAliveState::Waiting;
        }
    }
}

// ─── Command flags and outcome ───────────────────────────────────────

/// Per-command behaviour of `send_command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandFlags {
    /// Cancellation sends ABOR instead of dropping the connection.
    pub allow_abort: bool,
    /// Command may change the server's working directory.
    pub resets_path_cache: bool,
    /// Command may change the server's transfer type.
    pub resets_mode_cache: bool,
}

/// Final reply of a command plus context gathered along the way.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub reply: Reply,
    /// Size hint from a provisional reply, e.g. "(12345 bytes)".
    pub byte_count_hint: Option<u64>,
}

// ─── Raw stream (login phase) ────────────────────────────────────────

enum RawStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl RawStream {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            RawStream::Plain(s) => s.read(buf).await,
            RawStream::Tls(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            RawStream::Plain(s) => s.write_all(bytes).await,
            RawStream::Tls(s) => s.write_all(bytes).await,
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Control connection ──────────────────────────────────────────────

/// An authenticated FTP control connection.
pub struct ControlConnection {
    params: ConnectionParameters,
    log_id: LogId,
    writer: BoxedWriter,
    in_buf: Arc<Mutex<Vec<u8>>>,
    events: EventQueue,
    reader: JoinHandle<()>,
    peer_ip: Option<IpAddr>,
    local_ip: Option<IpAddr>,
    path_type: ServerPathType,
    compression_active: bool,
    working_path: Option<String>,
    mode_cache: TransferModeCache,
    keep_alive: KeepAliveMachine,
    in_flight: bool,
    /// An ABOR may leave a second completion reply in flight; drained
    /// before the next command.
    stray_reply_pending: bool,
    closed: bool,
    lost_fired: bool,
    lost_observer: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl ControlConnection {
    /// Connect, upgrade to TLS if asked, log in, negotiate session
    /// options and hand back a ready connection.
    pub async fn connect(params: ConnectionParameters, cancel: &CancelFlag) -> FtpResult<Self> {
        let log_id = LOGS.create(&params.host, params.port);
        Self::connect_with_log(params, cancel, log_id).await
    }

    async fn connect_with_log(
        params: ConnectionParameters,
        cancel: &CancelFlag,
        log_id: LogId,
    ) -> FtpResult<Self> {
        LOGS.append(
            log_id,
            &format!("Connecting to {}:{}", params.host, params.port),
        );
        let connect_timeout = Duration::from_secs(params.connect_timeout_sec);
        let cmd_timeout = Duration::from_secs(params.command_timeout_sec);

        let tcp = proxy::connect_tcp(&params.proxy, &params.host, params.port, connect_timeout)
            .await?;
        let peer_ip = tcp.peer_addr().ok().map(|a| a.ip());
        let local_ip = tcp.local_addr().ok().map(|a| a.ip());

        let mut stream = match params.security {
            SecurityMode::Implicit => RawStream::Tls(Box::new(
                tls::wrap_stream(tcp, &params.host, params.accept_invalid_certs).await?,
            )),
            _ => RawStream::Plain(tcp),
        };

        let mut buf: Vec<u8> = Vec::new();
        let greeting = read_reply_direct(&mut stream, &mut buf, cmd_timeout, log_id).await?;
        if !greeting.is_success() {
            return Err(greeting.to_error());
        }

        if params.security == SecurityMode::Explicit {
            let r = exchange_direct(
                &mut stream,
                &mut buf,
                CommandText::plain("AUTH TLS"),
                cmd_timeout,
                log_id,
            )
            .await?;
            if !r.is_success() {
                return Err(FtpError::tls_failed(format!(
                    "AUTH TLS rejected: {}",
                    r.detail()
                )));
            }
            stream = match stream {
                RawStream::Plain(tcp) => RawStream::Tls(Box::new(
                    tls::wrap_stream(tcp, &params.host, params.accept_invalid_certs).await?,
                )),
                tls => tls,
            };
            // the TLS record stream starts fresh
            buf.clear();
        }

        if cancel.is_cancelled() {
            return Err(FtpError::cancelled());
        }
        login(&mut stream, &mut buf, &params, cmd_timeout, log_id).await?;

        if params.protect_data_channel && params.security != SecurityMode::None {
            for cmd in ["PBSZ 0", "PROT P"] {
                let r = exchange_direct(
                    &mut stream,
                    &mut buf,
                    CommandText::plain(cmd),
                    cmd_timeout,
                    log_id,
                )
                .await?;
                if !r.is_success() {
                    return Err(FtpError::tls_failed(format!(
                        "{} rejected: {}",
                        cmd,
                        r.detail()
                    )));
                }
            }
        }

        // server flavour drives name-comparison rules; failure tolerated
        let path_type = match exchange_direct(
            &mut stream,
            &mut buf,
            CommandText::plain("SYST"),
            cmd_timeout,
            log_id,
        )
        .await
        {
            Ok(r) if r.is_success() => classify_system(&r.detail()),
            _ => ServerPathType::Unix,
        };

        let mut compression_active = false;
        if params.compress_data {
            let r = exchange_direct(
                &mut stream,
                &mut buf,
                CommandText::plain("MODE Z"),
                cmd_timeout,
                log_id,
            )
            .await?;
            compression_active = r.is_success();
            if !compression_active {
                LOGS.append(log_id, "MODE Z refused, transfers stay uncompressed");
            }
        }

        // session established; the read half moves into the reader task
        let (read_half, write_half): (BoxedReader, BoxedWriter) = match stream {
            RawStream::Plain(t) => {
                let (r, w) = tokio::io::split(t);
                (Box::new(r), Box::new(w))
            }
            RawStream::Tls(t) => {
                let (r, w) = tokio::io::split(*t);
                (Box::new(r), Box::new(w))
            }
        };
        let in_buf = Arc::new(Mutex::new(buf));
        let events = EventQueue::new();
        if let Some(ip) = peer_ip {
            events.push(ConnEvent::IpResolved(ip));
        }
        events.push(ConnEvent::Connected);
        let reader = tokio::spawn(reader_task(read_half, in_buf.clone(), events.clone()));

        log::debug!("control connection to {}:{} ready", params.host, params.port);
        let keep_alive = KeepAliveMachine::new(params.keep_alive.clone(), Instant::now());
        Ok(Self {
            params,
            log_id,
            writer: write_half,
            in_buf,
            events,
            reader,
            peer_ip,
            local_ip,
            path_type,
            compression_active,
            working_path: None,
            mode_cache: TransferModeCache::Unknown,
            keep_alive,
            in_flight: false,
            stray_reply_pending: false,
            closed: false,
            lost_fired: false,
            lost_observer: None,
        })
    }

    /// Drop the current session and establish a fresh one with the same
    /// parameters. Working-path and transfer-mode caches start unknown,
    /// buffers start empty.
    pub async fn reconnect(&mut self, cancel: &CancelFlag) -> FtpResult<()> {
        let params = self.params.clone();
        let observer = self.lost_observer.take();
        self.hard_close("reconnecting");
        let mut fresh = Self::connect(params, cancel).await?;
        fresh.lost_observer = observer;
        *self = fresh;
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    pub fn log_id(&self) -> LogId {
        self.log_id
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.peer_ip
    }

    /// Our address on the control channel, as the server sees us.
    pub fn local_ip(&self) -> Option<IpAddr> {
        self.local_ip
    }

    pub fn path_type(&self) -> ServerPathType {
        self.path_type
    }

    pub fn compression_active(&self) -> bool {
        self.compression_active
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn keep_alive_state(&self) -> KeepAliveState {
        self.keep_alive.state()
    }

    pub fn transfer_mode_cache(&self) -> TransferModeCache {
        self.mode_cache
    }

    /// Called exactly once when the connection is lost or closed.
    pub fn set_lost_observer(&mut self, f: Box<dyn Fn(&str) + Send + Sync>) {
        self.lost_observer = Some(f);
    }

    /// Queue a session event originating outside the reader task, such
    /// as a bound active-mode listener or finished external work.
    pub(crate) fn note_event(&self, event: ConnEvent) {
        self.events.push(event);
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Send one command and wait for its final reply. Provisional (1xx)
    /// replies are logged and awaited transparently; their byte-count
    /// hint is surfaced in the outcome.
    pub async fn send_command(
        &mut self,
        cmd: CommandText,
        flags: CommandFlags,
        cancel: &CancelFlag,
    ) -> FtpResult<CommandOutcome> {
        if self.closed {
            return Err(FtpError::connection_lost("connection is closed"));
        }
        if self.in_flight {
            return Err(FtpError::protocol_error("a command is already in flight"));
        }
        self.in_flight = true;
        self.keep_alive.begin_command();
        let result = self.send_command_inner(&cmd, &flags, cancel).await;
        self.in_flight = false;
        self.keep_alive.end_command(Instant::now());
        if let Err(e) = &result {
            if e.kind == FtpErrorKind::ConnectionLost {
                let reason = e.message.clone();
                self.hard_close(&reason);
            }
        }
        result
    }

    async fn send_command_inner(
        &mut self,
        cmd: &CommandText,
        flags: &CommandFlags,
        cancel: &CancelFlag,
    ) -> FtpResult<CommandOutcome> {
        self.drain_stray_replies()?;
        // effect on the server is unknown until the reply arrives, so
        // the caches reset regardless of the outcome
        if flags.resets_path_cache {
            self.working_path = None;
        }
        if flags.resets_mode_cache {
            self.mode_cache = TransferModeCache::Unknown;
        }

        self.write_wire(cmd.wire.as_bytes()).await?;
        LOGS.append(self.log_id, &format!("> {}", cmd.log));

        let timeout = Duration::from_secs(self.params.command_timeout_sec);
        let deadline = Instant::now() + timeout;
        let mut hint: Option<u64> = None;
        loop {
            match self.await_reply(deadline, cancel).await {
                Ok(reply) => {
                    LOGS.append(self.log_id, &reply.text());
                    if reply.is_provisional() {
                        hint = reply.byte_count_hint().or(hint);
                        continue;
                    }
                    return Ok(CommandOutcome {
                        reply,
                        byte_count_hint: hint,
                    });
                }
                Err(e) if e.kind == FtpErrorKind::Cancelled && flags.allow_abort => {
                    self.abort_in_flight().await?;
                    return Err(FtpError::cancelled());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Interrupt the command in flight. The server answers with one or
    /// two completion replies; the first is consumed here, any second
    /// is drained before the next command (best effort).
    async fn abort_in_flight(&mut self) -> FtpResult<()> {
        self.write_wire(b"ABOR\r\n").await?;
        LOGS.append(self.log_id, "> ABOR");
        let quiet = CancelFlag::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        match self.await_reply(deadline, &quiet).await {
            Ok(r) => LOGS.append(self.log_id, &r.text()),
            Err(e) => log::debug!("abort reply not seen: {}", e),
        }
        self.stray_reply_pending = true;
        Ok(())
    }

    /// Discard complete replies that arrived unattributed after an
    /// abort. Non-blocking: only what is already buffered.
    fn drain_stray_replies(&mut self) -> FtpResult<()> {
        if !self.stray_reply_pending {
            return Ok(());
        }
        while let Some(reply) = self.pop_reply()? {
            LOGS.append(
                self.log_id,
                &format!("(discarded) {}", reply.text()),
            );
        }
        self.stray_reply_pending = false;
        Ok(())
    }

    /// Set the server's transfer type, skipping the round trip when the
    /// cached mode already matches.
    pub async fn set_transfer_type(
        &mut self,
        mode: TransferMode,
        cancel: &CancelFlag,
    ) -> FtpResult<()> {
        if self.mode_cache.matches(mode) {
            return Ok(());
        }
        let cmd = match mode {
            TransferMode::Binary => "TYPE I",
            TransferMode::Ascii => "TYPE A",
        };
        let out = self
            .send_command(CommandText::plain(cmd), CommandFlags::default(), cancel)
            .await?;
        if !out.reply.is_success() {
            return Err(out.reply.to_error());
        }
        self.mode_cache = match mode {
            TransferMode::Binary => TransferModeCache::Binary,
            TransferMode::Ascii => TransferModeCache::Ascii,
        };
        Ok(())
    }

    /// Current working directory, cached until a command invalidates it.
    pub async fn working_path(&mut self, cancel: &CancelFlag) -> FtpResult<String> {
        if let Some(p) = &self.working_path {
            return Ok(p.clone());
        }
        let out = self
            .send_command(CommandText::plain("PWD"), CommandFlags::default(), cancel)
            .await?;
        if !out.reply.is_success() {
            return Err(out.reply.to_error());
        }
        let detail = out.reply.detail();
        let path = parse_quoted_path(&detail).unwrap_or(detail);
        self.working_path = Some(path.clone());
        Ok(path)
    }

    pub async fn change_working_path(
        &mut self,
        path: &str,
        cancel: &CancelFlag,
    ) -> FtpResult<()> {
        let flags = CommandFlags {
            resets_path_cache: true,
            ..Default::default()
        };
        let out = self
            .send_command(
                CommandText::plain(format!("CWD {}", path)),
                flags,
                cancel,
            )
            .await?;
        if !out.reply.is_success() {
            return Err(out.reply.to_error());
        }
        self.working_path = Some(path.to_string());
        Ok(())
    }

    // ── Keep-alive ───────────────────────────────────────────────

    /// Send a keep-alive probe if one is due. Call from the owner's
    /// idle loop; a no-op while disabled, suppressed or not yet due.
    pub async fn tick_keep_alive(&mut self, cancel: &CancelFlag) -> FtpResult<()> {
        if self.closed || !self.keep_alive.probe_due(Instant::now()) {
            return Ok(());
        }
        self.keep_alive.begin_probe();
        let result = match self.keep_alive.command() {
            KeepAliveCommand::NoOp => self.probe_simple("NOOP", cancel).await,
            KeepAliveCommand::PrintWorkingPath => self.probe_simple("PWD", cancel).await,
            KeepAliveCommand::ListNames => self.probe_with_data("NLST", cancel).await,
            KeepAliveCommand::List => {
                let cmd = self
                    .params
                    .list_command
                    .clone()
                    .unwrap_or_else(|| "LIST".to_string());
                self.probe_with_data(&cmd, cancel).await
            }
        };
        self.keep_alive.probe_finished();
        if let Err(e) = &result {
            if e.kind == FtpErrorKind::ConnectionLost {
                let reason = e.message.clone();
                self.hard_close(&reason);
            }
        }
        result
    }

    /// Probe without a data connection (NOOP / PWD).
    async fn probe_simple(&mut self, verb: &str, cancel: &CancelFlag) -> FtpResult<()> {
        let reply = self.raw_exchange(CommandText::plain(verb), cancel).await?;
        log::trace!("keep-alive {} -> {}", verb, reply.code);
        Ok(())
    }

    /// Probe with a throwaway passive data connection (NLST / LIST).
    /// The listing content is read and discarded.
    async fn probe_with_data(&mut self, verb: &str, cancel: &CancelFlag) -> FtpResult<()> {
        let pasv = self.raw_exchange(CommandText::plain("PASV"), cancel).await?;
        if !pasv.is_success() {
            log::debug!("keep-alive PASV refused: {}", pasv.detail());
            return Ok(());
        }
        let addr = parse_passive_addr(&pasv.text())
            .ok_or_else(|| FtpError::protocol_error("unparsable PASV reply"))?;
        let tcp = proxy::connect_tcp(
            &self.params.proxy,
            &addr.ip().to_string(),
            addr.port(),
            Duration::from_secs(self.params.connect_timeout_sec),
        )
        .await?;
        let mut data: BoxedReader = if self.params.protect_data_channel {
            Box::new(
                tls::wrap_stream(tcp, &self.params.host, self.params.accept_invalid_certs)
                    .await?,
            )
        } else {
            Box::new(tcp)
        };
        // drain concurrently so the server never stalls on a full socket
        let drain = tokio::spawn(async move {
            let mut tmp = [0u8; 4096];
            loop {
                match data.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });
        let reply = self.raw_exchange(CommandText::plain(verb), cancel).await;
        let _ = drain.await;
        let reply = reply?;
        log::trace!("keep-alive {} -> {}", verb, reply.code);
        Ok(())
    }

    // ── Close ────────────────────────────────────────────────────

    /// Close the connection. Graceful close sends QUIT and waits
    /// briefly for the goodbye; hard close just tears down.
    pub async fn close(mut self, graceful: bool) {
        if graceful && !self.closed {
            if self.write_wire(b"QUIT\r\n").await.is_ok() {
                LOGS.append(self.log_id, "> QUIT");
                let quiet = CancelFlag::new();
                let deadline = Instant::now() + Duration::from_secs(5);
                if let Ok(r) = self.await_reply(deadline, &quiet).await {
                    LOGS.append(self.log_id, &r.text());
                }
            }
        }
        self.hard_close(if graceful { "closed" } else { "aborted" });
    }

    fn hard_close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.reader.abort();
        self.working_path = None;
        self.mode_cache = TransferModeCache::Unknown;
        self.in_buf.lock().unwrap().clear();
        self.events.clear();
        LOGS.append(self.log_id, &format!("Connection closed: {}", reason));
        LOGS.mark_closed(self.log_id);
        if !self.lost_fired {
            self.lost_fired = true;
            if let Some(f) = &self.lost_observer {
                f(reason);
            }
        }
    }

    // ── Wire plumbing ────────────────────────────────────────────

    /// Direct command/reply round trip without keep-alive bookkeeping.
    /// Used by probes and graceful close.
    async fn raw_exchange(&mut self, cmd: CommandText, cancel: &CancelFlag) -> FtpResult<Reply> {
        self.write_wire(cmd.wire.as_bytes()).await?;
        LOGS.append(self.log_id, &format!("> {}", cmd.log));
        let deadline = Instant::now() + Duration::from_secs(self.params.command_timeout_sec);
        loop {
            let r = self.await_reply(deadline, cancel).await?;
            LOGS.append(self.log_id, &r.text());
            if r.is_provisional() {
                continue;
            }
            return Ok(r);
        }
    }

    async fn write_wire(&mut self, bytes: &[u8]) -> FtpResult<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        self.events.push(ConnEvent::WriteDone);
        Ok(())
    }

    fn pop_reply(&self) -> FtpResult<Option<Reply>> {
        let mut buf = self.in_buf.lock().unwrap();
        match parse_reply(&buf)? {
            Some((reply, used)) => {
                buf.drain(..used);
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }

    async fn await_reply(&mut self, deadline: Instant, cancel: &CancelFlag) -> FtpResult<Reply> {
        loop {
            if let Some(reply) = self.pop_reply()? {
                return Ok(reply);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FtpError::connection_lost("server reply timed out"));
            }
            match self.events.wait(cancel, Some(remaining)).await {
                WaitOutcome::Event(ConnEvent::BytesRead) => {}
                WaitOutcome::Event(ConnEvent::Closed { graceful }) => {
                    return Err(FtpError::connection_lost(if graceful {
                        "server closed the connection"
                    } else {
                        "connection reset"
                    }));
                }
                WaitOutcome::Event(_) => {}
                WaitOutcome::Cancelled => return Err(FtpError::cancelled()),
                WaitOutcome::Timeout => {
                    return Err(FtpError::connection_lost("server reply timed out"))
                }
            }
        }
    }
}

impl Drop for ControlConnection {
    fn drop(&mut self) {
        self.hard_close("dropped");
    }
}

// ─── Connect-phase helpers ───────────────────────────────────────────

async fn reader_task(mut read: BoxedReader, in_buf: Arc<Mutex<Vec<u8>>>, events: EventQueue) {
    let mut tmp = [0u8; 4096];
    loop {
        match read.read(&mut tmp).await {
            Ok(0) => {
                events.push(ConnEvent::Closed { graceful: true });
                break;
            }
            Ok(n) => {
                in_buf.lock().unwrap().extend_from_slice(&tmp[..n]);
                events.push(ConnEvent::BytesRead);
            }
            Err(_) => {
                events.push(ConnEvent::Closed { graceful: false });
                break;
            }
        }
    }
}

/// Read one final (non-provisional) reply directly from the stream.
async fn read_reply_direct(
    stream: &mut RawStream,
    buf: &mut Vec<u8>,
    timeout: Duration,
    log_id: LogId,
) -> FtpResult<Reply> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some((reply, used)) = parse_reply(buf)? {
            buf.drain(..used);
            LOGS.append(log_id, &reply.text());
            if reply.is_provisional() {
                continue;
            }
            return Ok(reply);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(FtpError::connection_lost("server reply timed out"));
        }
        let mut tmp = [0u8; 4096];
        let n = tokio::select! {
            r = stream.read(&mut tmp) => r?,
            _ = tokio::time::sleep(remaining) => {
                return Err(FtpError::connection_lost("server reply timed out"));
            }
        };
        if n == 0 {
            return Err(FtpError::connection_lost("server closed the connection"));
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

async fn exchange_direct(
    stream: &mut RawStream,
    buf: &mut Vec<u8>,
    cmd: CommandText,
    timeout: Duration,
    log_id: LogId,
) -> FtpResult<Reply> {
    stream.write_all(cmd.wire.as_bytes()).await?;
    LOGS.append(log_id, &format!("> {}", cmd.log));
    read_reply_direct(stream, buf, timeout, log_id).await
}

/// USER / PASS / ACCT sequence. Passwords never reach the log.
async fn login(
    stream: &mut RawStream,
    buf: &mut Vec<u8>,
    params: &ConnectionParameters,
    timeout: Duration,
    log_id: LogId,
) -> FtpResult<()> {
    let user = exchange_direct(
        stream,
        buf,
        CommandText::plain(format!("USER {}", params.username)),
        timeout,
        log_id,
    )
    .await?;
    let reply = match user.code {
        230 => return Ok(()), // no password needed
        331 | 332 => {
            exchange_direct(
                stream,
                buf,
                CommandText::masked("PASS", &params.password),
                timeout,
                log_id,
            )
            .await?
        }
        _ => return Err(FtpError::auth_failed(user.detail()).with_code(user.code)),
    };
    match reply.code {
        200..=299 => Ok(()),
        332 => {
            let account = params.account.as_deref().ok_or_else(|| {
                FtpError::auth_failed("server requires an ACCT value, none configured")
            })?;
            let acct = exchange_direct(
                stream,
                buf,
                CommandText::masked("ACCT", account),
                timeout,
                log_id,
            )
            .await?;
            if acct.is_success() {
                Ok(())
            } else {
                Err(FtpError::auth_failed(acct.detail()).with_code(acct.code))
            }
        }
        _ => Err(FtpError::auth_failed(reply.detail()).with_code(reply.code)),
    }
}

/// Map a SYST reply to a path-syntax family.
fn classify_system(detail: &str) -> ServerPathType {
    let upper = detail.to_ascii_uppercase();
    if upper.contains("VMS") {
        ServerPathType::OpenVms
    } else if upper.contains("WINDOWS") || upper.contains("WIN32") || upper.contains("WIN64") {
        ServerPathType::Windows
    } else {
        ServerPathType::Unix
    }
}

/// Extract the quoted path from a 257 reply, honouring `""` escapes.
fn parse_quoted_path(detail: &str) -> Option<String> {
    let start = detail.find('"')?;
    let rest = &detail[start + 1..];
    let mut path = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                path.push('"');
            } else {
                return Some(path);
            }
        } else {
            path.push(c);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn test_params(port: u16) -> ConnectionParameters {
        ConnectionParameters {
            host: "127.0.0.1".into(),
            port,
            username: "test".into(),
            password: "hunter2".into(),
            command_timeout_sec: 5,
            connect_timeout_sec: 5,
            ..Default::default()
        }
    }

    /// Minimal scripted server: greets, answers USER/PASS/SYST, then
    /// hands each further command line to `script`.
    async fn scripted_server<F>(listener: TcpListener, script: F)
    where
        F: Fn(&str) -> Option<String> + Send + 'static,
    {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        write.write_all(b"220 Test server ready\r\n").await.unwrap();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = if line.starts_with("USER") {
                "331 Password required\r\n".to_string()
            } else if line.starts_with("PASS") {
                "230 Logged in\r\n".to_string()
            } else if line.starts_with("SYST") {
                "215 UNIX Type: L8\r\n".to_string()
            } else if line.starts_with("QUIT") {
                write.write_all(b"221 Bye\r\n").await.unwrap();
                break;
            } else {
                match script(&line) {
                    Some(r) => r,
                    None => break,
                }
            };
            write.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    async fn connect_scripted<F>(script: F) -> ControlConnection
    where
        F: Fn(&str) -> Option<String> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(scripted_server(listener, script));
        ControlConnection::connect(test_params(port), &CancelFlag::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn connect_login_and_command() {
        let mut conn = connect_scripted(|line| {
            if line.starts_with("NOOP") {
                Some("200 OK\r\n".into())
            } else {
                None
            }
        })
        .await;
        assert_eq!(conn.path_type(), ServerPathType::Unix);
        let out = conn
            .send_command(
                CommandText::plain("NOOP"),
                CommandFlags::default(),
                &CancelFlag::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.reply.code, 200);
        conn.close(true).await;
    }

    #[tokio::test]
    async fn session_events_queued_in_arrival_order() {
        let mut conn = connect_scripted(|_| None).await;

        // connect announces the resolved peer and the live session
        match conn.events.try_pop() {
            Some(ConnEvent::IpResolved(ip)) => assert!(ip.is_loopback()),
            other => panic!("expected IpResolved, got {:?}", other),
        }
        assert_eq!(conn.events.try_pop(), Some(ConnEvent::Connected));

        // every completed wire write is announced
        conn.write_wire(b"").await.unwrap();
        assert_eq!(conn.events.try_pop(), Some(ConnEvent::WriteDone));

        // externally produced events land in the same queue
        conn.note_event(ConnEvent::ExternalWorkDone);
        assert_eq!(conn.events.try_pop(), Some(ConnEvent::ExternalWorkDone));

        conn.close(false).await;
    }

    #[tokio::test]
    async fn password_never_logged() {
        let conn = connect_scripted(|_| None).await;
        let text = LOGS.get(conn.log_id()).unwrap().text().to_string();
        assert!(text.contains("PASS (hidden)"));
        assert!(!text.contains("hunter2"));
        conn.close(false).await;
    }

    #[tokio::test]
    async fn provisional_reply_awaited_and_hint_surfaced() {
        let mut conn = connect_scripted(|line| {
            if line.starts_with("RETR") {
                Some(
                    "150 Opening BINARY mode data connection (9876 bytes)\r\n226 Done\r\n"
                        .into(),
                )
            } else {
                None
            }
        })
        .await;
        let out = conn
            .send_command(
                CommandText::plain("RETR f"),
                CommandFlags::default(),
                &CancelFlag::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.reply.code, 226);
        assert_eq!(out.byte_count_hint, Some(9876));
        conn.close(false).await;
    }

    #[tokio::test]
    async fn cancel_with_abort_recovers() {
        let mut conn = connect_scripted(|line| {
            if line.starts_with("RETR") {
                // provisional only; the transfer hangs until ABOR
                Some("150 Opening data connection\r\n".into())
            } else if line.starts_with("ABOR") {
                Some("426 Transfer aborted\r\n226 ABOR successful\r\n".into())
            } else if line.starts_with("NOOP") {
                Some("200 OK\r\n".into())
            } else {
                None
            }
        })
        .await;
        let cancel = CancelFlag::new();
        let c2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c2.cancel();
        });
        let err = conn
            .send_command(
                CommandText::plain("RETR f"),
                CommandFlags {
                    allow_abort: true,
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::Cancelled);
        // the stray second reply must not confuse the next command
        let out = conn
            .send_command(
                CommandText::plain("NOOP"),
                CommandFlags::default(),
                &CancelFlag::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.reply.code, 200);
        conn.close(false).await;
    }

    #[tokio::test]
    async fn working_path_cached_and_invalidated() {
        let mut conn = connect_scripted(|line| {
            if line.starts_with("PWD") {
                Some("257 \"/home/test\" is current directory\r\n".into())
            } else if line.starts_with("CWD") {
                Some("250 Directory changed\r\n".into())
            } else {
                None
            }
        })
        .await;
        let cancel = CancelFlag::new();
        assert_eq!(conn.working_path(&cancel).await.unwrap(), "/home/test");
        // cached: no round trip
        assert_eq!(conn.working_path(&cancel).await.unwrap(), "/home/test");
        conn.change_working_path("/tmp", &cancel).await.unwrap();
        assert_eq!(conn.working_path(&cancel).await.unwrap(), "/tmp");
        conn.close(false).await;
    }

    #[tokio::test]
    async fn transfer_type_cached() {
        let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let hits2 = hits.clone();
        let mut conn = connect_scripted(move |line| {
            if line.starts_with("TYPE") {
                hits2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Some("200 Type set\r\n".into())
            } else {
                None
            }
        })
        .await;
        let cancel = CancelFlag::new();
        conn.set_transfer_type(TransferMode::Binary, &cancel)
            .await
            .unwrap();
        conn.set_transfer_type(TransferMode::Binary, &cancel)
            .await
            .unwrap();
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        conn.close(false).await;
    }

    #[tokio::test]
    async fn lost_observer_fires_once() {
        let fired = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let fired2 = fired.clone();
        let mut conn = connect_scripted(|_| None).await;
        conn.set_lost_observer(Box::new(move |_| {
            fired2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        conn.close(false).await;
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    // ── Keep-alive machine ───────────────────────────────────────

    fn ka_policy(cmd: KeepAliveCommand) -> KeepAlivePolicy {
        KeepAlivePolicy {
            enabled: true,
            send_every_sec: 60,
            stop_after_sec: 3600,
            command: cmd,
        }
    }

    #[test]
    fn keep_alive_disabled_stays_none() {
        let t0 = Instant::now();
        let mut m = KeepAliveMachine::new(KeepAlivePolicy::default(), t0);
        assert_eq!(m.state(), KeepAliveState::None);
        assert!(!m.probe_due(t0 + Duration::from_secs(999)));
        m.begin_command();
        m.end_command(t0);
        assert_eq!(m.state(), KeepAliveState::None);
    }

    #[test]
    fn keep_alive_probe_after_idle() {
        let t0 = Instant::now();
        let mut m = KeepAliveMachine::new(ka_policy(KeepAliveCommand::NoOp), t0);
        assert!(!m.probe_due(t0 + Duration::from_secs(30)));
        assert!(m.probe_due(t0 + Duration::from_secs(61)));
        m.begin_probe();
        assert_eq!(m.state(), KeepAliveState::Processing);
        m.probe_finished();
        assert_eq!(m.state(), KeepAliveState::Waiting);
    }

    #[test]
    fn keep_alive_stop_after_cutoff() {
        let t0 = Instant::now();
        let mut m = KeepAliveMachine::new(ka_policy(KeepAliveCommand::NoOp), t0);
        assert!(!m.probe_due(t0 + Duration::from_secs(3601)));
        assert_eq!(m.state(), KeepAliveState::None);
        // stays off even after the idle window
        assert!(!m.probe_due(t0 + Duration::from_secs(3700)));
    }

    #[test]
    fn keep_alive_command_during_probe() {
        let t0 = Instant::now();
        let mut m = KeepAliveMachine::new(ka_policy(KeepAliveCommand::List), t0);
        assert!(m.probe_due(t0 + Duration::from_secs(100)));
        m.begin_probe();
        m.begin_command();
        assert_eq!(m.state(), KeepAliveState::WaitingForEndOfProcessing);
        m.probe_finished();
        assert_eq!(m.state(), KeepAliveState::Forbidden);
        m.end_command(t0 + Duration::from_secs(101));
        assert_eq!(m.state(), KeepAliveState::Waiting);
        // idle countdown restarted by the command
        assert!(!m.probe_due(t0 + Duration::from_secs(130)));
    }

    #[test]
    fn keep_alive_command_suppresses_probe() {
        let t0 = Instant::now();
        let mut m = KeepAliveMachine::new(ka_policy(KeepAliveCommand::NoOp), t0);
        m.begin_command();
        assert_eq!(m.state(), KeepAliveState::Forbidden);
        assert!(!m.probe_due(t0 + Duration::from_secs(120)));
        m.end_command(t0 + Duration::from_secs(120));
        assert!(m.probe_due(t0 + Duration::from_secs(181)));
    }

    #[test]
    fn quoted_path_parsing() {
        assert_eq!(
            parse_quoted_path("\"/home/test\" is current directory"),
            Some("/home/test".into())
        );
        assert_eq!(
            parse_quoted_path("\"/a\"\"b\" created"),
            Some("/a\"b".into())
        );
        assert_eq!(parse_quoted_path("no quotes"), None);
    }

    #[test]
    fn system_classification() {
        assert_eq!(classify_system("UNIX Type: L8"), ServerPathType::Unix);
        assert_eq!(classify_system("Windows_NT"), ServerPathType::Windows);
        assert_eq!(classify_system("VMS V5.5"), ServerPathType::OpenVms);
        assert_eq!(classify_system("something"), ServerPathType::Unix);
    }
}
