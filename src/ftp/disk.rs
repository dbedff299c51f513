//! Disk I/O worker.
//!
//! One dedicated thread serves a FIFO of blocking file requests so
//! transfer workers never touch the local disk themselves. Completion
//! is delivered over a oneshot; requests are processed strictly in
//! submission order.

use crate::ftp::error::{FtpError, FtpResult};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;

/// Content check applied before a write goes to disk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteValidation {
    /// Reject the chunk if it looks binary; the safety valve for
    /// transfers running in ASCII mode.
    RejectBinary,
}

pub enum DiskRequest {
    ReadChunk {
        file: Arc<File>,
        offset: u64,
        len: usize,
    },
    WriteChunk {
        file: Arc<File>,
        offset: u64,
        data: Vec<u8>,
        validate: Option<WriteValidation>,
    },
    Truncate {
        file: Arc<File>,
        len: u64,
    },
}

#[derive(Debug)]
pub enum DiskResponse {
    /// Shorter than asked at end of file; empty means EOF.
    Read { data: Vec<u8> },
    Written { bytes: usize },
    Truncated,
}

/// ASCII-mode heuristic: text never carries NUL bytes.
pub fn looks_binary(data: &[u8]) -> bool {
    data.contains(&0)
}

struct Job {
    request: DiskRequest,
    done: oneshot::Sender<FtpResult<DiskResponse>>,
}

/// Handle to the disk thread. Cloning shares the same FIFO; dropping
/// the last handle shuts the thread down.
#[derive(Clone)]
pub struct DiskWorker {
    tx: std_mpsc::Sender<Job>,
    _thread: Arc<ThreadGuard>,
}

struct ThreadGuard {
    handle: Option<JoinHandle<()>>,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl DiskWorker {
    pub fn spawn() -> Self {
        let (tx, rx) = std_mpsc::channel::<Job>();
        let handle = std::thread::Builder::new()
            .name("ftp-disk-io".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    let result = serve(job.request);
                    // receiver may have been cancelled; the work is done anyway
                    let _ = job.done.send(result);
                }
            })
            .expect("spawning the disk I/O thread");
        Self {
            tx,
            _thread: Arc::new(ThreadGuard {
                handle: Some(handle),
            }),
        }
    }

    /// Queue one request and await its completion.
    pub async fn submit(&self, request: DiskRequest) -> FtpResult<DiskResponse> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Job { request, done })
            .map_err(|_| FtpError::io_error("disk worker is gone"))?;
        wait.await
            .map_err(|_| FtpError::io_error("disk worker dropped the request"))?
    }
}

fn serve(request: DiskRequest) -> FtpResult<DiskResponse> {
    match request {
        DiskRequest::ReadChunk { file, offset, len } => {
            let mut f: &File = &file;
            f.seek(SeekFrom::Start(offset))?;
            let mut data = vec![0u8; len];
            let mut filled = 0usize;
            while filled < len {
                let n = f.read(&mut data[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            data.truncate(filled);
            Ok(DiskResponse::Read { data })
        }
        DiskRequest::WriteChunk {
            file,
            offset,
            data,
            validate,
        } => {
            if validate == Some(WriteValidation::RejectBinary) && looks_binary(&data) {
                return Err(FtpError::integrity(
                    "binary content detected in an ASCII-mode transfer",
                ));
            }
            let mut f: &File = &file;
            f.seek(SeekFrom::Start(offset))?;
            f.write_all(&data)?;
            Ok(DiskResponse::Written { bytes: data.len() })
        }
        DiskRequest::Truncate { file, len } => {
            file.set_len(len)?;
            Ok(DiskResponse::Truncated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn open_rw(path: &std::path::Path) -> Arc<File> {
        Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = open_rw(&dir.path().join("t.bin"));
        let worker = DiskWorker::spawn();

        let resp = worker
            .submit(DiskRequest::WriteChunk {
                file: file.clone(),
                offset: 0,
                data: b"hello disk".to_vec(),
                validate: None,
            })
            .await
            .unwrap();
        assert!(matches!(resp, DiskResponse::Written { bytes: 10 }));

        let resp = worker
            .submit(DiskRequest::ReadChunk {
                file,
                offset: 6,
                len: 16,
            })
            .await
            .unwrap();
        match resp {
            DiskResponse::Read { data } => assert_eq!(data, b"disk"),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn truncate_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let file = open_rw(&dir.path().join("t.bin"));
        let worker = DiskWorker::spawn();
        worker
            .submit(DiskRequest::WriteChunk {
                file: file.clone(),
                offset: 0,
                data: vec![7u8; 1000],
                validate: None,
            })
            .await
            .unwrap();
        worker
            .submit(DiskRequest::Truncate {
                file: file.clone(),
                len: 100,
            })
            .await
            .unwrap();
        assert_eq!(file.metadata().unwrap().len(), 100);
    }

    #[tokio::test]
    async fn binary_in_ascii_rejected_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let file = open_rw(&dir.path().join("t.txt"));
        let worker = DiskWorker::spawn();
        let err = worker
            .submit(DiskRequest::WriteChunk {
                file: file.clone(),
                offset: 0,
                data: vec![b'a', 0, b'b'],
                validate: Some(WriteValidation::RejectBinary),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::ftp::error::FtpErrorKind::Integrity);
        // nothing reached the disk
        assert_eq!(file.metadata().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn requests_served_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = open_rw(&dir.path().join("t.bin"));
        let worker = DiskWorker::spawn();
        for i in 0..10u8 {
            worker
                .submit(DiskRequest::WriteChunk {
                    file: file.clone(),
                    offset: i as u64,
                    data: vec![i],
                    validate: None,
                })
                .await
                .unwrap();
        }
        let resp = worker
            .submit(DiskRequest::ReadChunk {
                file,
                offset: 0,
                len: 10,
            })
            .await
            .unwrap();
        match resp {
            DiskResponse::Read { data } => {
                assert_eq!(data, (0..10u8).collect::<Vec<u8>>())
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn binary_heuristic() {
        assert!(!looks_binary(b"plain text\r\nwith lines"));
        assert!(looks_binary(b"has a \0 byte"));
    }
}
