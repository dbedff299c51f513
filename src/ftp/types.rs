//! Shared types for the transfer engine.

use serde::{Deserialize, Serialize};

// ─── Connection parameters ───────────────────────────────────────────

/// Security mode for the control channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum SecurityMode {
    /// Plain-text FTP (port 21).
    None,
    /// Explicit FTPS: starts plain then upgrades via AUTH TLS (port 21).
    Explicit,
    /// Implicit FTPS: TLS from the first byte (port 990).
    Implicit,
}

impl Default for SecurityMode {
    fn default() -> Self {
        Self::None
    }
}

/// Transfer type (RFC 959 TYPE command).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum TransferMode {
    Ascii,
    Binary,
}

impl Default for TransferMode {
    fn default() -> Self {
        Self::Binary
    }
}

/// What the server is currently set to, as far as we know.
///
/// Cached per control connection so TYPE is only sent when the mode
/// actually differs; cleared on reconnect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransferModeCache {
    Unknown,
    Binary,
    Ascii,
}

impl TransferModeCache {
    pub fn matches(&self, mode: TransferMode) -> bool {
        matches!(
            (self, mode),
            (TransferModeCache::Binary, TransferMode::Binary)
                | (TransferModeCache::Ascii, TransferMode::Ascii)
        )
    }
}

/// Command used for keep-alive probes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum KeepAliveCommand {
    /// NOOP: no data connection.
    NoOp,
    /// PWD: no data connection.
    PrintWorkingPath,
    /// NLST: opens a throwaway data connection.
    ListNames,
    /// LIST: opens a throwaway data connection.
    List,
}

impl KeepAliveCommand {
    pub fn opens_data_connection(&self) -> bool {
        matches!(self, Self::ListNames | Self::List)
    }
}

/// Keep-alive policy for a control connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepAlivePolicy {
    pub enabled: bool,
    /// Idle seconds before a probe is sent.
    #[serde(default = "default_ka_send_every")]
    pub send_every_sec: u64,
    /// Total idle seconds after which probing stops for good.
    #[serde(default = "default_ka_stop_after")]
    pub stop_after_sec: u64,
    #[serde(default = "default_ka_command")]
    pub command: KeepAliveCommand,
}

fn default_ka_send_every() -> u64 {
    60
}
fn default_ka_stop_after() -> u64 {
    3600
}
fn default_ka_command() -> KeepAliveCommand {
    KeepAliveCommand::NoOp
}

impl Default for KeepAlivePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            send_every_sec: default_ka_send_every(),
            stop_after_sec: default_ka_stop_after(),
            command: default_ka_command(),
        }
    }
}

/// Proxy in front of the control and/or data connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ProxyDescriptor {
    Direct,
    Socks5 {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    },
    HttpConnect {
        host: String,
        port: u16,
    },
}

impl Default for ProxyDescriptor {
    fn default() -> Self {
        Self::Direct
    }
}

/// Everything needed to open one FTP session. Set once before the
/// session starts, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParameters {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// ACCT value, sent only if the server asks for it after PASS.
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub proxy: ProxyDescriptor,
    /// Passive (PASV) vs. active (PORT) data connections.
    #[serde(default = "default_true")]
    pub passive_mode: bool,
    #[serde(default)]
    pub keep_alive: KeepAlivePolicy,
    #[serde(default)]
    pub security: SecurityMode,
    /// Protect the data channel with TLS as well (PROT P).
    #[serde(default)]
    pub protect_data_channel: bool,
    /// Negotiate MODE Z compression for data transfers.
    #[serde(default)]
    pub compress_data: bool,
    /// Custom listing command, e.g. "LIST -la". None = plain LIST.
    #[serde(default)]
    pub list_command: Option<String>,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Local address to bind for active-mode data connections.
    #[serde(default)]
    pub active_bind_address: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u64,
    /// Timeout for a single command/reply round trip.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_sec: u64,
    /// No-data-transfer watchdog cutoff for data connections.
    #[serde(default = "default_no_data_timeout")]
    pub no_data_timeout_sec: u64,
    /// Below this size a partial target is overwritten instead of resumed.
    #[serde(default = "default_resume_min_size")]
    pub resume_min_file_size: u64,
    /// Bytes of existing tail re-read and verified on resume.
    #[serde(default = "default_resume_overlap")]
    pub resume_overlap: u64,
}

fn default_true() -> bool {
    true
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_command_timeout() -> u64 {
    30
}
fn default_no_data_timeout() -> u64 {
    300
}
fn default_resume_min_size() -> u64 {
    32_768
}
fn default_resume_overlap() -> u64 {
    1_024
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 21,
            username: "anonymous".into(),
            password: "anonymous@".into(),
            account: None,
            proxy: ProxyDescriptor::Direct,
            passive_mode: true,
            keep_alive: KeepAlivePolicy::default(),
            security: SecurityMode::None,
            protect_data_channel: false,
            compress_data: false,
            list_command: None,
            accept_invalid_certs: false,
            active_bind_address: None,
            connect_timeout_sec: default_connect_timeout(),
            command_timeout_sec: default_command_timeout(),
            no_data_timeout_sec: default_no_data_timeout(),
            resume_min_file_size: default_resume_min_size(),
            resume_overlap: default_resume_overlap(),
        }
    }
}

// ─── Remote path flavour ─────────────────────────────────────────────

/// Path syntax family reported by the server; drives name-comparison
/// case rules in the listing caches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ServerPathType {
    Unix,
    Windows,
    OpenVms,
}

impl ServerPathType {
    pub fn is_case_sensitive(&self) -> bool {
        matches!(self, Self::Unix)
    }

    /// Compare two entry names under this path type's case rules.
    pub fn names_equal(&self, a: &str, b: &str) -> bool {
        if self.is_case_sensitive() {
            a == b
        } else {
            a.eq_ignore_ascii_case(b)
        }
    }

    pub fn compare_names(&self, a: &str, b: &str) -> std::cmp::Ordering {
        if self.is_case_sensitive() {
            a.cmp(b)
        } else {
            a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase())
        }
    }
}

// ─── Listing entries ─────────────────────────────────────────────────

/// Kind of a remote filesystem entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    Link,
}

/// One structured entry produced by the listing-text service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListingEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

// ─── Queue items ─────────────────────────────────────────────────────

/// What a queue item asks the engine to do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ItemOperation {
    /// Transfer a file, leaving the source in place.
    Copy,
    /// Copy, then delete the source after the target is confirmed.
    Move,
    Delete,
    Rename { new_name: String },
    CreateDir,
}

/// Direction of a transfer item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    Download,
    Upload,
}

/// How to treat an already existing partial target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ResumeMode {
    /// Resume only; fail if the server cannot resume.
    Resume,
    /// Resume if possible, otherwise overwrite from scratch.
    ResumeOrOverwrite,
    Overwrite,
    /// Fail if the target already exists.
    CreateNew,
}

/// What to do when ASCII-mode data turns out to be binary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum AsciiMismatchPolicy {
    /// Hand the item back to the user (UserInputNeeded).
    Prompt,
    /// Roll back and retry the item in binary mode.
    RetryInBinary,
    Skip,
}

impl Default for AsciiMismatchPolicy {
    fn default() -> Self {
        Self::Prompt
    }
}

/// One requested operation. Owned by the external queue; the worker
/// only references it by id and reports status transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub operation: ItemOperation,
    pub direction: TransferDirection,
    /// Remote directory of the file.
    pub remote_path: String,
    pub name: String,
    /// Local counterpart (target for download, source for upload).
    pub local_path: String,
    /// Size the server/listing claimed, if known. Never trusted over a
    /// locally measured size.
    pub expected_size: Option<u64>,
    #[serde(default = "default_resume_mode")]
    pub resume_mode: ResumeMode,
    #[serde(default)]
    pub transfer_mode: TransferMode,
    #[serde(default)]
    pub ascii_mismatch: AsciiMismatchPolicy,
}

fn default_resume_mode() -> ResumeMode {
    ResumeMode::ResumeOrOverwrite
}

impl QueueItem {
    /// New item with a generated id and default resume/type policy.
    pub fn new(
        operation: ItemOperation,
        direction: TransferDirection,
        remote_path: impl Into<String>,
        name: impl Into<String>,
        local_path: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            direction,
            remote_path: remote_path.into(),
            name: name.into(),
            local_path: local_path.into(),
            expected_size: None,
            resume_mode: default_resume_mode(),
            transfer_mode: TransferMode::default(),
            ascii_mismatch: AsciiMismatchPolicy::default(),
        }
    }
}

/// Status transitions reported for a queue item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ItemStatus {
    Waiting,
    Processing,
    UserInputNeeded,
    Skipped,
    Failed {
        reason: String,
        /// OS-level error code, when one exists.
        os_error: Option<i32>,
        /// Server's literal reply text or other detail.
        detail: String,
    },
    Done,
}

/// Receiver of queue-item status transitions.
///
/// Implemented by the external queue. Must be cheap and non-blocking;
/// called from worker tasks.
pub trait ItemStatusSink: Send + Sync {
    fn item_status(&self, item_id: &str, status: ItemStatus);
}
