//! Compressing appender
//!
//! A [`CompressingAppender`] appends raw chunks to a primary file and mirrors
//! every chunk into a gzip archive next to it (`<primary>.gz`). Compression
//! runs on a single blocking task fed through a bounded queue, so callers only
//! wait for the primary append and, when the queue is full, for a free slot.
//!
//! ## Layout
//!
//! ```text
//! <primary>      raw bytes, appended synchronously
//! <primary>.gz   gzip stream of the same bytes, written in the background
//! ```

use std::fs::File as StdFile;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::config::RotationConfig;
use crate::error::{LogSinkError, Result};

/// Extension appended to a primary path to name its archive
pub const ARCHIVE_EXTENSION: &str = "gz";

/// Path of the archive paired with `primary`
pub fn archive_path_for(primary: &Path) -> PathBuf {
    let mut name = primary.as_os_str().to_owned();
    name.push(".");
    name.push(ARCHIVE_EXTENSION);
    PathBuf::from(name)
}

/// Lifecycle of an appender. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AppenderState {
    /// Accepting writes
    Open = 0,
    /// `close()` has started draining the compression queue
    Closing = 1,
    /// All files are closed
    Closed = 2,
}

impl AppenderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Primary file and compression queue, locked together so chunks are
/// enqueued in append order
struct Primary {
    file: Option<File>,
    queue: Option<mpsc::Sender<Bytes>>,
}

/// Appends raw bytes to a primary file and compresses a copy in the background
///
/// Dropping an appender without closing it still finalizes the archive: the
/// compression task sees the queue close and finishes the gzip stream on its
/// own. Only [`close`](Self::close) waits for that to happen.
pub struct CompressingAppender {
    path: PathBuf,
    archive_path: PathBuf,
    state: AtomicU8,
    sync_on_close: bool,
    primary: AsyncMutex<Primary>,
    compressor: Mutex<Option<JoinHandle<io::Result<()>>>>,
}

impl CompressingAppender {
    /// Open an appender at `path`
    ///
    /// The primary file is created or opened for append, and the archive is
    /// created fresh. Bytes already present in the primary file are compressed
    /// before anything written through this appender.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>, config: &RotationConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let archive_path = archive_path_for(&path);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let existing = file.metadata().await?.len();

        // Only the bytes present now; later appends arrive through the queue.
        let backlog = if existing > 0 {
            let reader = File::open(&path).await?.into_std().await;
            Some(reader.take(existing))
        } else {
            None
        };

        let archive = File::create(&archive_path).await?.into_std().await;
        let encoder = GzEncoder::new(archive, Compression::new(config.compression_level.min(9)));

        let (queue, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let sync_on_close = config.sync_on_close;
        let compressor = tokio::task::spawn_blocking(move || {
            run_compressor(encoder, backlog, receiver, sync_on_close)
        });

        debug!(
            existing_bytes = existing,
            archive = %archive_path.display(),
            "Appender opened"
        );

        Ok(Self {
            path,
            archive_path,
            state: AtomicU8::new(AppenderState::Open as u8),
            sync_on_close,
            primary: AsyncMutex::new(Primary {
                file: Some(file),
                queue: Some(queue),
            }),
            compressor: Mutex::new(Some(compressor)),
        })
    }

    /// Append a chunk and queue it for compression
    ///
    /// Returns once the chunk is in the primary file; compression happens
    /// later. Fails with [`LogSinkError::Closed`] once closing has begun.
    pub async fn write(&self, chunk: &[u8]) -> Result<usize> {
        let mut guard = self.primary.lock().await;
        if self.is_closed() {
            return Err(LogSinkError::Closed);
        }
        let primary = &mut *guard;
        let (Some(file), Some(queue)) = (primary.file.as_mut(), primary.queue.as_ref()) else {
            return Err(LogSinkError::Closed);
        };

        file.write_all(chunk).await?;
        file.flush().await?;

        queue
            .send(Bytes::copy_from_slice(chunk))
            .await
            .map_err(|_| LogSinkError::io("compression task stopped"))?;

        Ok(chunk.len())
    }

    /// Current length of the primary file
    pub async fn size(&self) -> Result<u64> {
        let primary = self.primary.lock().await;
        let file = primary.file.as_ref().ok_or(LogSinkError::Closed)?;
        Ok(file.metadata().await?.len())
    }

    /// Flush the primary file to stable storage
    pub async fn sync(&self) -> Result<()> {
        let primary = self.primary.lock().await;
        let file = primary.file.as_ref().ok_or(LogSinkError::Closed)?;
        file.sync_all().await?;
        Ok(())
    }

    /// Current lifecycle state
    pub fn state(&self) -> AppenderState {
        AppenderState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the appender is closing or closed
    pub fn is_closed(&self) -> bool {
        self.state() != AppenderState::Open
    }

    /// Path of the primary file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the archive this appender writes
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Drain pending compression and close all files
    ///
    /// Only the first call does any work; later or concurrent calls return
    /// `Ok(())` immediately. The gzip stream, the archive and the primary file
    /// are closed in that order. Each is attempted, and the first failure in
    /// that order is returned.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn close(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(
                AppenderState::Open as u8,
                AppenderState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(());
        }

        let file = {
            let mut primary = self.primary.lock().await;
            // Dropping the sender ends the compressor's input.
            primary.queue.take();
            primary.file.take()
        };

        let compressor = self.compressor.lock().take();
        let compressed = match compressor {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(io::Error::other(format!("compression task failed: {e}"))),
            },
            None => Ok(()),
        };

        let primary_closed = match file {
            Some(mut file) => {
                let flushed = file.flush().await;
                let synced = if self.sync_on_close {
                    file.sync_all().await
                } else {
                    Ok(())
                };
                flushed.and(synced)
            }
            None => Ok(()),
        };

        self.state
            .store(AppenderState::Closed as u8, Ordering::Release);

        if let Err(e) = &compressed {
            warn!(error = %e, archive = %self.archive_path.display(), "Archive incomplete");
        }
        debug!("Appender closed");

        compressed.and(primary_closed).map_err(LogSinkError::from)
    }
}

impl std::fmt::Debug for CompressingAppender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressingAppender")
            .field("path", &self.path)
            .field("archive_path", &self.archive_path)
            .field("state", &self.state())
            .finish()
    }
}

/// Body of the compression task
///
/// Keeps draining the queue after a write failure so producers never stall on
/// a full queue; the first failure is reported when the queue closes.
fn run_compressor(
    mut encoder: GzEncoder<StdFile>,
    backlog: Option<io::Take<StdFile>>,
    mut queue: mpsc::Receiver<Bytes>,
    sync_on_close: bool,
) -> io::Result<()> {
    let mut failure = None;

    if let Some(mut backlog) = backlog {
        if let Err(e) = io::copy(&mut backlog, &mut encoder) {
            warn!(error = %e, "Failed to compress existing primary content");
            failure = Some(e);
        }
    }

    while let Some(chunk) = queue.blocking_recv() {
        if failure.is_some() {
            continue;
        }
        if let Err(e) = encoder.write_all(&chunk) {
            warn!(error = %e, "Compression stream write failed");
            failure = Some(e);
        }
    }

    let stream = match failure {
        Some(e) => Err(e),
        None => encoder.try_finish(),
    };
    let archive = if sync_on_close {
        encoder.get_ref().sync_all()
    } else {
        Ok(())
    };
    drop(encoder);

    stream.and(archive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn gunzip(path: &Path) -> Vec<u8> {
        let mut decoder = GzDecoder::new(std::fs::File::open(path).unwrap());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        out
    }

    async fn create_test_appender() -> (CompressingAppender, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let appender =
            CompressingAppender::open(temp_dir.path().join("app.log"), &RotationConfig::default())
                .await
                .unwrap();
        (appender, temp_dir)
    }

    #[test]
    fn test_archive_path_for() {
        let path = archive_path_for(Path::new("/var/log/app.log"));
        assert_eq!(path, PathBuf::from("/var/log/app.log.gz"));
    }

    #[tokio::test]
    async fn test_write_appends_and_compresses() {
        let (appender, temp) = create_test_appender().await;

        let mut expected = Vec::new();
        for i in 0..50 {
            let line = format!("line {i}\n");
            let n = appender.write(line.as_bytes()).await.unwrap();
            assert_eq!(n, line.len());
            expected.extend_from_slice(line.as_bytes());
        }

        assert_eq!(appender.size().await.unwrap(), expected.len() as u64);
        appender.close().await.unwrap();

        let primary = temp.path().join("app.log");
        assert_eq!(std::fs::read(&primary).unwrap(), expected);
        assert_eq!(gunzip(&archive_path_for(&primary)), expected);
    }

    #[tokio::test]
    async fn test_size_tracks_appends() {
        let (appender, _temp) = create_test_appender().await;
        assert_eq!(appender.size().await.unwrap(), 0);

        appender.write(b"0123456789").await.unwrap();
        assert_eq!(appender.size().await.unwrap(), 10);

        appender.write(b"abc").await.unwrap();
        assert_eq!(appender.size().await.unwrap(), 13);

        appender.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (appender, temp) = create_test_appender().await;
        appender.write(b"before").await.unwrap();
        appender.close().await.unwrap();

        let err = appender.write(b"after").await.unwrap_err();
        assert!(err.is_closed());
        assert_eq!(std::fs::read(temp.path().join("app.log")).unwrap(), b"before");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (appender, _temp) = create_test_appender().await;
        appender.write(b"data").await.unwrap();

        appender.close().await.unwrap();
        appender.close().await.unwrap();
        assert_eq!(appender.state(), AppenderState::Closed);
    }

    #[tokio::test]
    async fn test_concurrent_close() {
        let (appender, temp) = create_test_appender().await;
        appender.write(b"data").await.unwrap();

        let (a, b) = tokio::join!(appender.close(), appender.close());
        a.unwrap();
        b.unwrap();
        assert!(appender.is_closed());

        // The winner drained the queue before returning.
        assert_eq!(gunzip(&temp.path().join("app.log.gz")), b"data");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_close_reports_archive_failure_and_still_closes_primary() {
        let temp = TempDir::new().unwrap();
        let primary = temp.path().join("app.log");
        std::os::unix::fs::symlink("/dev/full", archive_path_for(&primary)).unwrap();

        let appender = CompressingAppender::open(&primary, &RotationConfig::default())
            .await
            .unwrap();
        let chunk: Vec<u8> = (0..1024u32).map(|i| (i * 7 % 251) as u8).collect();
        for _ in 0..100 {
            appender.write(&chunk).await.unwrap();
        }

        let err = appender.close().await.unwrap_err();
        assert!(
            matches!(&err, LogSinkError::Io(e) if e.kind() == io::ErrorKind::StorageFull),
            "unexpected error: {err}"
        );
        assert_eq!(appender.state(), AppenderState::Closed);

        // The primary file was still flushed and closed.
        assert_eq!(std::fs::read(&primary).unwrap().len(), 100 * chunk.len());

        appender.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (appender, _temp) = create_test_appender().await;
        assert_eq!(appender.state(), AppenderState::Open);
        assert!(!appender.is_closed());

        appender.close().await.unwrap();
        assert_eq!(appender.state(), AppenderState::Closed);
        assert!(appender.size().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_reconciles_existing_content() {
        let temp = TempDir::new().unwrap();
        let primary = temp.path().join("app.log");
        std::fs::write(&primary, b"left over from a previous run\n").unwrap();

        let appender = CompressingAppender::open(&primary, &RotationConfig::default())
            .await
            .unwrap();
        assert_eq!(appender.size().await.unwrap(), 30);
        appender.write(b"new\n").await.unwrap();
        appender.close().await.unwrap();

        let expected = b"left over from a previous run\nnew\n".to_vec();
        assert_eq!(std::fs::read(&primary).unwrap(), expected);
        assert_eq!(gunzip(&archive_path_for(&primary)), expected);
    }

    #[tokio::test]
    async fn test_small_queue_applies_backpressure_without_loss() {
        let temp = TempDir::new().unwrap();
        let config = RotationConfig {
            channel_capacity: 1,
            ..Default::default()
        };
        let appender = CompressingAppender::open(temp.path().join("app.log"), &config)
            .await
            .unwrap();

        let mut expected = Vec::new();
        for i in 0..500u32 {
            let chunk = i.to_le_bytes();
            appender.write(&chunk).await.unwrap();
            expected.extend_from_slice(&chunk);
        }
        appender.close().await.unwrap();

        assert_eq!(gunzip(&temp.path().join("app.log.gz")), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_keep_archive_in_sync() {
        let (appender, temp) = create_test_appender().await;
        let appender = Arc::new(appender);

        let mut handles = Vec::new();
        for t in 0..8u8 {
            let appender = Arc::clone(&appender);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    appender.write(&[b'a' + t; 16]).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        appender.close().await.unwrap();

        let primary = std::fs::read(temp.path().join("app.log")).unwrap();
        assert_eq!(primary.len(), 8 * 100 * 16);
        assert_eq!(gunzip(&temp.path().join("app.log.gz")), primary);
    }
}
