//! FTP client transfer engine.
//!
//! The crate splits the protocol into a control side and a data side.
//! [`control::ControlConnection`] owns the command channel: connect,
//! TLS upgrade, login, one command in flight at a time, keep-alive and
//! loss detection. [`data`] moves payload bytes over separate
//! connections with optional TLS and MODE Z compression. A
//! [`worker::TransferWorker`] binds the two together for one queue item
//! at a time, and [`engine::TransferEngine`] owns everything the
//! workers share: disk I/O, listing caches, target locks and the
//! connection limiter.
//!
//! Control connections are single-owner values. There is no internal
//! locking around them; whoever holds one is its only user, and the
//! engine moves them between callers and workers by value.

pub mod cache;
pub mod control;
pub mod data;
pub mod disk;
pub mod engine;
pub mod error;
pub mod events;
pub mod log;
pub mod protocol;
pub mod proxy;
pub mod speed;
pub mod tls;
pub mod types;
pub mod upload_cache;
pub mod worker;

pub use cache::{ListingCache, ListingKey};
pub use control::ControlConnection;
pub use engine::{EngineConfig, ListingParser, TransferEngine, UnixListingParser};
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use events::CancelFlag;
pub use speed::SpeedMeter;
pub use types::{
    AsciiMismatchPolicy, ConnectionParameters, EntryKind, ItemOperation, ItemStatus,
    ItemStatusSink, KeepAliveCommand, KeepAlivePolicy, ListingEntry, ProxyDescriptor, QueueItem,
    ResumeMode, SecurityMode, ServerPathType, TransferDirection, TransferMode,
};
pub use upload_cache::{ChangeKind, UploadCacheLookup, UploadListingCache};
pub use worker::{TargetLocks, TransferWorker};
