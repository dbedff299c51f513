//! Data connections: the ephemeral transport for file bytes.
//!
//! A data connection is created per transfer attempt and destroyed when
//! the attempt concludes. The socket work runs in a spawned task; the
//! worker exchanges chunks with it over a bounded channel and collects
//! a final outcome (bytes moved, how the stream ended, any captured
//! socket/TLS/decompression error) once the task finishes.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::events::CancelFlag;
use crate::ftp::log::{LogId, LOGS};
use crate::ftp::proxy::DataListener;
use crate::ftp::speed::SpeedMeter;
use crate::ftp::tls;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Disk-flush granularity for downloads and uploads.
pub const FLUSH_BUFFER_SIZE: usize = 65_536;
/// A partially filled flush buffer is handed over after this long.
pub const FLUSH_TIMEOUT: Duration = Duration::from_millis(1000);
/// How often the no-data watchdog checks for a stalled connection.
pub const WATCHDOG_PERIOD: Duration = Duration::from_millis(10_000);

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

// ─── Establishment ───────────────────────────────────────────────────

/// Where the data socket comes from.
pub enum DataStreamSource {
    /// Passive mode: already connected out to the server's address.
    Connected(TcpStream),
    /// Active mode: the server connects to us once the transfer command
    /// is accepted.
    Listening(DataListener),
}

/// TLS upgrade applied right after connect/accept (PROT P).
pub struct DataTlsConfig {
    pub host: String,
    pub accept_invalid_certs: bool,
}

pub struct DataConnectionConfig {
    pub source: DataStreamSource,
    pub tls: Option<DataTlsConfig>,
    /// MODE Z: inflate downloads, deflate uploads.
    pub compress: bool,
    pub no_data_timeout: Duration,
    /// How long an active-mode listener waits for the server.
    pub accept_timeout: Duration,
    pub watchdog_period: Duration,
    pub speed: Arc<SpeedMeter>,
    /// Operation-wide aggregate meter, fed alongside the per-connection one.
    pub global_speed: Option<Arc<SpeedMeter>>,
    pub log_id: LogId,
}

impl DataConnectionConfig {
    pub fn new(source: DataStreamSource, log_id: LogId) -> Self {
        Self {
            source,
            tls: None,
            compress: false,
            no_data_timeout: Duration::from_secs(300),
            accept_timeout: Duration::from_secs(30),
            watchdog_period: WATCHDOG_PERIOD,
            speed: Arc::new(SpeedMeter::new()),
            global_speed: None,
            log_id,
        }
    }
}

/// Final state of a finished data connection, queried by the worker.
/// The worker is the single point that turns this into an item outcome.
#[derive(Debug, Default)]
pub struct DataOutcome {
    /// Wire bytes moved (compressed size under MODE Z).
    pub bytes_transferred: u64,
    /// The transport was actually established at some point.
    pub ever_connected: bool,
    /// Orderly EOF after having connected; normal completion.
    pub graceful_eof: bool,
    /// The no-data watchdog force-closed the connection.
    pub watchdog_closed: bool,
    pub error: Option<FtpError>,
}

async fn establish(
    source: DataStreamSource,
    tls_cfg: &Option<DataTlsConfig>,
    accept_timeout: Duration,
) -> FtpResult<Box<dyn AsyncStream>> {
    let tcp = match source {
        DataStreamSource::Connected(t) => t,
        DataStreamSource::Listening(l) => l.accept(accept_timeout).await?,
    };
    match tls_cfg {
        Some(t) => Ok(Box::new(
            tls::wrap_stream(tcp, &t.host, t.accept_invalid_certs).await?,
        )),
        None => Ok(Box::new(tcp)),
    }
}

// ─── MODE Z codecs ───────────────────────────────────────────────────

struct Inflater {
    inner: Decompress,
}

impl Inflater {
    fn new() -> Self {
        Self {
            inner: Decompress::new(true),
        }
    }

    fn inflate(&mut self, input: &[u8]) -> FtpResult<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() * 2);
        let mut offset = 0usize;
        while offset < input.len() {
            if out.capacity() == out.len() {
                out.reserve(32 * 1024);
            }
            let before_in = self.inner.total_in();
            let status = self
                .inner
                .decompress_vec(&input[offset..], &mut out, FlushDecompress::None)
                .map_err(|e| FtpError::data_channel(format!("MODE Z inflate: {}", e)))?;
            offset += (self.inner.total_in() - before_in) as usize;
            if status == Status::StreamEnd {
                break;
            }
        }
        Ok(out)
    }
}

struct Deflater {
    inner: Compress,
}

impl Deflater {
    fn new() -> Self {
        Self {
            inner: Compress::new(Compression::default(), true),
        }
    }

    fn deflate(&mut self, input: &[u8]) -> FtpResult<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len());
        let mut offset = 0usize;
        while offset < input.len() {
            if out.capacity() == out.len() {
                out.reserve(32 * 1024);
            }
            let before_in = self.inner.total_in();
            self.inner
                .compress_vec(&input[offset..], &mut out, FlushCompress::None)
                .map_err(|e| FtpError::data_channel(format!("MODE Z deflate: {}", e)))?;
            offset += (self.inner.total_in() - before_in) as usize;
        }
        Ok(out)
    }

    fn finish(&mut self) -> FtpResult<Vec<u8>> {
        let mut out = Vec::with_capacity(1024);
        loop {
            if out.capacity() == out.len() {
                out.reserve(1024);
            }
            let status = self
                .inner
                .compress_vec(&[], &mut out, FlushCompress::Finish)
                .map_err(|e| FtpError::data_channel(format!("MODE Z deflate: {}", e)))?;
            if status == Status::StreamEnd {
                return Ok(out);
            }
        }
    }
}

// ─── Download connection ─────────────────────────────────────────────

/// Receives file bytes from the server and hands them to the worker in
/// flush-sized chunks.
pub struct DownloadConnection {
    chunks: mpsc::Receiver<Vec<u8>>,
    handle: JoinHandle<DataOutcome>,
    force: CancelFlag,
}

impl DownloadConnection {
    pub fn start(cfg: DataConnectionConfig) -> Self {
        let (tx, rx) = mpsc::channel(4);
        let force = CancelFlag::new();
        let f2 = force.clone();
        let handle = tokio::spawn(run_download(cfg, f2, tx));
        Self {
            chunks: rx,
            handle,
            force,
        }
    }

    /// Next chunk of (decompressed) payload; `None` once the stream is
    /// done for any reason; `finish` tells which.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.chunks.recv().await
    }

    /// Force-close mid-flight (cancellation, control-channel failure).
    pub fn force_close(&self) {
        self.force.cancel();
    }

    pub async fn finish(mut self) -> DataOutcome {
        // unclaimed buffers are discarded
        self.chunks.close();
        while self.chunks.recv().await.is_some() {}
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => DataOutcome {
                error: Some(FtpError::data_channel(format!("data task failed: {}", e))),
                ..Default::default()
            },
        }
    }
}

async fn run_download(
    cfg: DataConnectionConfig,
    force: CancelFlag,
    chunks: mpsc::Sender<Vec<u8>>,
) -> DataOutcome {
    let mut outcome = DataOutcome::default();
    let mut stream = match establish(cfg.source, &cfg.tls, cfg.accept_timeout).await {
        Ok(s) => s,
        Err(e) => {
            outcome.error = Some(e);
            return outcome;
        }
    };
    outcome.ever_connected = true;

    let mut inflater = if cfg.compress {
        Some(Inflater::new())
    } else {
        None
    };
    let mut tmp = [0u8; 16 * 1024];
    let mut flush_buf: Vec<u8> = Vec::with_capacity(FLUSH_BUFFER_SIZE);
    let mut flush_deadline = Instant::now() + FLUSH_TIMEOUT;
    let mut watchdog = tokio::time::interval_at(
        Instant::now() + cfg.watchdog_period,
        cfg.watchdog_period,
    );
    let mut last_activity = std::time::Instant::now();

    'transfer: loop {
        tokio::select! {
            r = stream.read(&mut tmp) => match r {
                Ok(0) => {
                    outcome.graceful_eof = true;
                    break 'transfer;
                }
                Ok(n) => {
                    let now = std::time::Instant::now();
                    last_activity = now;
                    cfg.speed.bytes_transferred(n as u64, now);
                    if let Some(g) = &cfg.global_speed {
                        g.bytes_transferred(n as u64, now);
                    }
                    outcome.bytes_transferred += n as u64;
                    let payload = match &mut inflater {
                        Some(f) => match f.inflate(&tmp[..n]) {
                            Ok(p) => p,
                            Err(e) => {
                                outcome.error = Some(e);
                                break 'transfer;
                            }
                        },
                        None => tmp[..n].to_vec(),
                    };
                    flush_buf.extend_from_slice(&payload);
                    while flush_buf.len() >= FLUSH_BUFFER_SIZE {
                        let chunk: Vec<u8> = flush_buf.drain(..FLUSH_BUFFER_SIZE).collect();
                        if chunks.send(chunk).await.is_err() {
                            // receiver gone: the worker gave up on us
                            break 'transfer;
                        }
                        flush_deadline = Instant::now() + FLUSH_TIMEOUT;
                    }
                }
                Err(e) => {
                    outcome.error = Some(e.into());
                    break 'transfer;
                }
            },
            _ = tokio::time::sleep_until(flush_deadline) => {
                if !flush_buf.is_empty() {
                    let chunk = std::mem::take(&mut flush_buf);
                    if chunks.send(chunk).await.is_err() {
                        break 'transfer;
                    }
                }
                flush_deadline = Instant::now() + FLUSH_TIMEOUT;
            }
            _ = watchdog.tick() => {
                if last_activity.elapsed() >= cfg.no_data_timeout {
                    LOGS.append(cfg.log_id, "Data connection closed: no data transferred");
                    outcome.watchdog_closed = true;
                    break 'transfer;
                }
            }
            _ = force.cancelled() => break 'transfer,
        }
    }

    if !flush_buf.is_empty() {
        let _ = chunks.send(flush_buf).await;
    }
    outcome
}

// ─── Upload connection ───────────────────────────────────────────────

/// Sends file bytes to the server. The worker feeds disk-read chunks
/// into the flush channel; the task drains its own write buffer to the
/// socket in throughput-adapted packets, so disk latency never stalls
/// the socket.
pub struct UploadConnection {
    tx: mpsc::Sender<Vec<u8>>,
    handle: JoinHandle<DataOutcome>,
    force: CancelFlag,
}

impl UploadConnection {
    pub fn start(cfg: DataConnectionConfig) -> Self {
        let (tx, rx) = mpsc::channel(2);
        let force = CancelFlag::new();
        let f2 = force.clone();
        let handle = tokio::spawn(run_upload(cfg, f2, rx));
        Self { tx, handle, force }
    }

    /// Queue one chunk of file content. Errors once the task is gone.
    pub async fn send_chunk(&self, data: Vec<u8>) -> FtpResult<()> {
        self.tx
            .send(data)
            .await
            .map_err(|_| FtpError::data_channel("data connection closed early"))
    }

    pub fn force_close(&self) {
        self.force.cancel();
    }

    /// Signal end of file and collect the outcome.
    pub async fn finish(self) -> DataOutcome {
        drop(self.tx);
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => DataOutcome {
                error: Some(FtpError::data_channel(format!("data task failed: {}", e))),
                ..Default::default()
            },
        }
    }
}

async fn run_upload(
    cfg: DataConnectionConfig,
    force: CancelFlag,
    mut rx: mpsc::Receiver<Vec<u8>>,
) -> DataOutcome {
    let mut outcome = DataOutcome::default();
    let mut stream = match establish(cfg.source, &cfg.tls, cfg.accept_timeout).await {
        Ok(s) => s,
        Err(e) => {
            outcome.error = Some(e);
            return outcome;
        }
    };
    outcome.ever_connected = true;

    let mut deflater = if cfg.compress {
        Some(Deflater::new())
    } else {
        None
    };
    let mut sizer = PacketSizer::new();
    // write buffer; the channel plays the flush buffer's role
    let mut pending: Vec<u8> = Vec::new();
    let mut eof = false;
    let mut resize_deadline = Instant::now() + PACKET_RESIZE_PERIOD;
    let mut watchdog = tokio::time::interval_at(
        Instant::now() + cfg.watchdog_period,
        cfg.watchdog_period,
    );
    let mut last_activity = std::time::Instant::now();

    'transfer: loop {
        if pending.is_empty() {
            if eof {
                break 'transfer;
            }
            // write buffer empty: swap in the next flush-buffer load
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(c) => {
                        pending = match &mut deflater {
                            Some(d) => match d.deflate(&c) {
                                Ok(p) => p,
                                Err(e) => {
                                    outcome.error = Some(e);
                                    break 'transfer;
                                }
                            },
                            None => c,
                        };
                    }
                    None => {
                        eof = true;
                        if let Some(d) = &mut deflater {
                            match d.finish() {
                                Ok(tail) => pending = tail,
                                Err(e) => {
                                    outcome.error = Some(e);
                                    break 'transfer;
                                }
                            }
                        }
                    }
                },
                _ = watchdog.tick() => {
                    if last_activity.elapsed() >= cfg.no_data_timeout {
                        LOGS.append(cfg.log_id, "Data connection closed: no data transferred");
                        outcome.watchdog_closed = true;
                        break 'transfer;
                    }
                }
                _ = force.cancelled() => break 'transfer,
            }
            continue;
        }

        let packet = pending.len().min(sizer.current());
        tokio::select! {
            r = stream.write(&pending[..packet]) => match r {
                Ok(0) => {
                    outcome.error = Some(FtpError::connection_lost("server closed the data connection"));
                    break 'transfer;
                }
                Ok(n) => {
                    pending.drain(..n);
                    let now = std::time::Instant::now();
                    last_activity = now;
                    cfg.speed.bytes_transferred(n as u64, now);
                    if let Some(g) = &cfg.global_speed {
                        g.bytes_transferred(n as u64, now);
                    }
                    outcome.bytes_transferred += n as u64;
                }
                Err(e) => {
                    outcome.error = Some(e.into());
                    break 'transfer;
                }
            },
            _ = tokio::time::sleep_until(resize_deadline) => {
                let now = std::time::Instant::now();
                sizer.reestimate(cfg.speed.speed(now), now);
                resize_deadline = Instant::now() + PACKET_RESIZE_PERIOD;
            }
            _ = watchdog.tick() => {
                if last_activity.elapsed() >= cfg.no_data_timeout {
                    LOGS.append(cfg.log_id, "Data connection closed: no data transferred");
                    outcome.watchdog_closed = true;
                    break 'transfer;
                }
            }
            _ = force.cancelled() => break 'transfer,
        }
    }

    if outcome.error.is_none() && !outcome.watchdog_closed && !force.is_cancelled() {
        // orderly FIN so the server sees end of file
        if let Err(e) = stream.shutdown().await {
            outcome.error = Some(e.into());
        } else {
            outcome.graceful_eof = true;
        }
    }
    outcome
}

// ─── Adaptive packet sizing ──────────────────────────────────────────

/// Packet sizes the upload path steps through.
pub const UPLOAD_PACKET_SIZES: [usize; 5] = [512, 1024, 4096, 8192, 32_768];
/// How often the packet size is re-estimated from measured throughput.
pub const PACKET_RESIZE_PERIOD: Duration = Duration::from_secs(5);
/// A throughput collapse this soon after an increase blames the increase.
const COLLAPSE_WINDOW: Duration = Duration::from_secs(1);

/// Chooses the upload packet size from measured throughput. Sizes that
/// made the link collapse are blacklisted for the rest of the transfer;
/// some server/network combinations stall on large packets.
pub struct PacketSizer {
    current: usize,
    too_big: Vec<usize>,
    /// Time of the last size increase and the speed measured then.
    last_increase: Option<(std::time::Instant, u64)>,
}

impl PacketSizer {
    pub fn new() -> Self {
        Self {
            current: UPLOAD_PACKET_SIZES[0],
            too_big: Vec::new(),
            last_increase: None,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    fn base_for_speed(speed: u64) -> usize {
        if speed < 4_096 {
            512
        } else if speed < 8_192 {
            1_024
        } else if speed < 32_768 {
            4_096
        } else if speed < 65_536 {
            8_192
        } else {
            32_768
        }
    }

    fn step_down(&self, from: usize) -> usize {
        UPLOAD_PACKET_SIZES
            .iter()
            .rev()
            .find(|&&s| s < from && !self.too_big.contains(&s))
            .copied()
            .unwrap_or(UPLOAD_PACKET_SIZES[0])
    }

    /// Re-estimate from the current measured speed (bytes/sec).
    pub fn reestimate(&mut self, speed: u64, now: std::time::Instant) {
        if let Some((at, speed_before)) = self.last_increase {
            if now.duration_since(at) <= COLLAPSE_WINDOW {
                if speed.saturating_mul(3) < speed_before {
                    if !self.too_big.contains(&self.current) {
                        self.too_big.push(self.current);
                    }
                    self.current = self.step_down(self.current);
                    self.last_increase = None;
                    return;
                }
            } else {
                self.last_increase = None;
            }
        }
        let mut target = Self::base_for_speed(speed);
        while self.too_big.contains(&target) && target > UPLOAD_PACKET_SIZES[0] {
            target = self.step_down(target);
        }
        if target > self.current {
            self.last_increase = Some((now, speed));
        }
        self.current = target;
    }
}

impl Default for PacketSizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn cfg(source: DataStreamSource) -> DataConnectionConfig {
        DataConnectionConfig::new(source, 0)
    }

    #[tokio::test]
    async fn download_delivers_all_bytes() {
        let (client, mut server) = pair().await;
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let sent = payload.clone();
        tokio::spawn(async move {
            server.write_all(&sent).await.unwrap();
            server.shutdown().await.unwrap();
        });

        let mut conn = DownloadConnection::start(cfg(DataStreamSource::Connected(client)));
        let mut got = Vec::new();
        while let Some(chunk) = conn.next_chunk().await {
            got.extend_from_slice(&chunk);
        }
        let outcome = conn.finish().await;
        assert_eq!(got, payload);
        assert!(outcome.graceful_eof);
        assert!(outcome.ever_connected);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.bytes_transferred, payload.len() as u64);
    }

    #[tokio::test]
    async fn download_inflates_mode_z() {
        use flate2::write::ZlibEncoder;
        use std::io::Write as _;
        let (client, mut server) = pair().await;
        let payload = b"hello hello hello hello hello".repeat(1000);
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&payload).unwrap();
        let compressed = enc.finish().unwrap();
        tokio::spawn(async move {
            server.write_all(&compressed).await.unwrap();
            server.shutdown().await.unwrap();
        });

        let mut c = cfg(DataStreamSource::Connected(client));
        c.compress = true;
        let mut conn = DownloadConnection::start(c);
        let mut got = Vec::new();
        while let Some(chunk) = conn.next_chunk().await {
            got.extend_from_slice(&chunk);
        }
        let outcome = conn.finish().await;
        assert_eq!(got, payload);
        assert!(outcome.error.is_none());
        // wire bytes, not inflated bytes
        assert!(outcome.bytes_transferred < payload.len() as u64);
    }

    #[tokio::test]
    async fn download_force_close_discards() {
        let (client, mut server) = pair().await;
        tokio::spawn(async move {
            // trickle data forever
            loop {
                if server.write_all(&[0u8; 64]).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        let conn = DownloadConnection::start(cfg(DataStreamSource::Connected(client)));
        conn.force_close();
        let outcome = conn.finish().await;
        assert!(!outcome.graceful_eof);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn download_watchdog_closes_stalled_connection() {
        let (client, server) = pair().await;
        let mut c = cfg(DataStreamSource::Connected(client));
        c.no_data_timeout = Duration::from_millis(50);
        c.watchdog_period = Duration::from_millis(25);
        let mut conn = DownloadConnection::start(c);
        assert!(conn.next_chunk().await.is_none());
        let outcome = conn.finish().await;
        assert!(outcome.watchdog_closed);
        drop(server);
    }

    #[tokio::test]
    async fn upload_sends_all_bytes() {
        let (client, mut server) = pair().await;
        let reader = tokio::spawn(async move {
            let mut got = Vec::new();
            server.read_to_end(&mut got).await.unwrap();
            got
        });

        let conn = UploadConnection::start(cfg(DataStreamSource::Connected(client)));
        let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 241) as u8).collect();
        for chunk in payload.chunks(FLUSH_BUFFER_SIZE) {
            conn.send_chunk(chunk.to_vec()).await.unwrap();
        }
        let outcome = conn.finish().await;
        assert!(outcome.error.is_none());
        assert!(outcome.graceful_eof);
        assert_eq!(outcome.bytes_transferred, payload.len() as u64);
        assert_eq!(reader.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn upload_deflates_mode_z() {
        use flate2::read::ZlibDecoder;
        use std::io::Read as _;
        let (client, mut server) = pair().await;
        let reader = tokio::spawn(async move {
            let mut got = Vec::new();
            server.read_to_end(&mut got).await.unwrap();
            got
        });

        let mut c = cfg(DataStreamSource::Connected(client));
        c.compress = true;
        let conn = UploadConnection::start(c);
        let payload = b"compress me ".repeat(5000);
        conn.send_chunk(payload.clone()).await.unwrap();
        let outcome = conn.finish().await;
        assert!(outcome.error.is_none());

        let wire = reader.await.unwrap();
        let mut inflated = Vec::new();
        ZlibDecoder::new(&wire[..]).read_to_end(&mut inflated).unwrap();
        assert_eq!(inflated, payload);
    }

    // ── Packet sizer ─────────────────────────────────────────────

    #[test]
    fn packet_size_table() {
        assert_eq!(PacketSizer::base_for_speed(0), 512);
        assert_eq!(PacketSizer::base_for_speed(4_095), 512);
        assert_eq!(PacketSizer::base_for_speed(4_096), 1_024);
        assert_eq!(PacketSizer::base_for_speed(8_192), 4_096);
        assert_eq!(PacketSizer::base_for_speed(32_768), 8_192);
        assert_eq!(PacketSizer::base_for_speed(65_536), 32_768);
        assert_eq!(PacketSizer::base_for_speed(1_000_000), 32_768);
    }

    #[test]
    fn collapse_after_increase_blacklists_size() {
        let t0 = std::time::Instant::now();
        let mut sizer = PacketSizer::new();
        sizer.reestimate(100_000, t0);
        assert_eq!(sizer.current(), 32_768);
        // throughput collapses to under a third within the window
        sizer.reestimate(20_000, t0 + Duration::from_millis(500));
        assert_eq!(sizer.current(), 8_192);
        // the blacklisted size is never picked again
        sizer.reestimate(1_000_000, t0 + Duration::from_secs(60));
        assert_eq!(sizer.current(), 8_192);
    }

    #[test]
    fn slowdown_outside_window_is_not_blamed() {
        let t0 = std::time::Instant::now();
        let mut sizer = PacketSizer::new();
        sizer.reestimate(100_000, t0);
        assert_eq!(sizer.current(), 32_768);
        // collapse, but long after the increase: plain re-estimate
        sizer.reestimate(20_000, t0 + Duration::from_secs(5));
        assert_eq!(sizer.current(), 4_096);
        sizer.reestimate(100_000, t0 + Duration::from_secs(10));
        assert_eq!(sizer.current(), 32_768);
    }

    #[test]
    fn mild_slowdown_within_window_not_blamed() {
        let t0 = std::time::Instant::now();
        let mut sizer = PacketSizer::new();
        sizer.reestimate(100_000, t0);
        // above a third of the prior speed: keep the size
        sizer.reestimate(50_000, t0 + Duration::from_millis(500));
        assert_eq!(sizer.current(), 32_768);
    }

    // ── MODE Z codecs ────────────────────────────────────────────

    #[test]
    fn inflate_deflate_byte_split() {
        let mut deflater = Deflater::new();
        let mut wire = deflater.deflate(b"the quick brown fox jumps over the lazy dog").unwrap();
        wire.extend(deflater.finish().unwrap());

        // feed the inflater one byte at a time, as a pathological peer would
        let mut inflater = Inflater::new();
        let mut out = Vec::new();
        for b in wire {
            out.extend(inflater.inflate(&[b]).unwrap());
        }
        assert_eq!(out, b"the quick brown fox jumps over the lazy dog");
    }

    #[test]
    fn inflate_garbage_is_error() {
        let mut inflater = Inflater::new();
        assert!(inflater.inflate(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
