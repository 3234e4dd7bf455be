//! Size-triggered rotation
//!
//! [`RotationManager`] owns the current [`CompressingAppender`] behind an
//! atomic swap cell. Every write goes to whichever appender is current; once
//! the active file grows past `max_size` the manager rotates:
//!
//! 1. shift `P.gz.1 .. P.gz.N` up by one, deleting whatever would pass `max_files`
//! 2. rename the active archive `P.gz` to `P.gz.1`
//! 3. remove `P`, open a fresh appender there and publish it
//! 4. close the previous appender, draining its queue into `P.gz.1`
//!
//! If step 2 or 3 fails the archive numbering is put back so slots stay
//! contiguous from 1, and the previous appender stays current.
//!
//! The previous appender keeps its file descriptors across steps 2 and 3, so
//! writes that land on it mid-rotation still end up in the archive.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use arc_swap::ArcSwap;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::appender::{CompressingAppender, archive_path_for};
use crate::config::RotationConfig;
use crate::error::{LogSinkError, Result, RotationPhase};

/// Rotating, compressing log sink for a single base path
///
/// Cloning is cheap and every clone writes to the same stream.
#[derive(Clone)]
pub struct RotationManager {
    inner: Arc<Inner>,
}

struct Inner {
    base: PathBuf,
    /// Settings applied to each appender opened by this manager
    config: RotationConfig,
    current: ArcSwap<CompressingAppender>,
    max_size: AtomicU64,
    max_files: AtomicU32,
    blocking: AtomicBool,
    /// Held by the one task allowed to rotate
    rotating: AtomicBool,
    /// Serializes archive renames with shutdown
    rename_lock: Mutex<()>,
    closed: AtomicBool,
}

/// Clears the rotation flag when a rotation ends, including on error
struct RotationFlag<'a>(&'a AtomicBool);

impl Drop for RotationFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RotationManager {
    /// Open a sink at `base` with the default configuration
    pub async fn new(base: impl Into<PathBuf>) -> Result<Self> {
        Self::open(base, RotationConfig::default()).await
    }

    /// Start building a sink at `base`
    pub fn builder(base: impl Into<PathBuf>) -> RotationManagerBuilder {
        RotationManagerBuilder::new(base)
    }

    /// Open a sink at `base`
    ///
    /// Creates the parent directory if needed. An existing primary file is
    /// kept and its content is compressed into the fresh active archive.
    #[instrument(skip_all)]
    pub async fn open(base: impl Into<PathBuf>, config: RotationConfig) -> Result<Self> {
        let base = base.into();

        if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        info!(
            path = %base.display(),
            max_size = config.max_size,
            max_files = config.max_files,
            blocking = config.blocking,
            "Opening rotating log"
        );

        let appender = CompressingAppender::open(&base, &config).await?;

        Ok(Self {
            inner: Arc::new(Inner {
                max_size: AtomicU64::new(config.max_size),
                max_files: AtomicU32::new(config.max_files),
                blocking: AtomicBool::new(config.blocking),
                base,
                config,
                current: ArcSwap::from_pointee(appender),
                rotating: AtomicBool::new(false),
                rename_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Write a chunk to the current file, rotating afterwards if it grew too large
    ///
    /// A write that loses a race with a rotation is retried against the newly
    /// published appender. Under the blocking policy a failed rotation is
    /// returned here even though the chunk itself was written.
    pub async fn write(&self, chunk: &[u8]) -> Result<usize> {
        let inner = &self.inner;

        let (appender, written) = loop {
            if inner.closed.load(Ordering::Acquire) {
                return Err(LogSinkError::Closed);
            }
            let appender = inner.current.load_full();
            match appender.write(chunk).await {
                Ok(n) => break (appender, n),
                Err(_) if appender.is_closed() => {
                    trace!("Appender retired during write, retrying");
                }
                Err(e) => return Err(e),
            }
        };

        let size = match appender.size().await {
            Ok(size) => size,
            // Someone else already rotated this appender away.
            Err(_) if appender.is_closed() => return Ok(written),
            Err(e) => return Err(e),
        };

        if size > inner.max_size.load(Ordering::Relaxed) {
            if inner.blocking.load(Ordering::Relaxed) {
                inner.rotate(&appender).await?;
            } else {
                let inner = Arc::clone(inner);
                tokio::spawn(async move {
                    if let Err(e) = inner.rotate(&appender).await {
                        error!(error = %e, path = %inner.base.display(), "Background rotation failed");
                    }
                });
            }
        }

        Ok(written)
    }

    /// Length of the current primary file
    pub async fn size(&self) -> Result<u64> {
        self.inner.current.load_full().size().await
    }

    /// Flush the current primary file to stable storage
    pub async fn sync(&self) -> Result<()> {
        self.inner.current.load_full().sync().await
    }

    /// Close the sink
    ///
    /// Waits for an in-flight rotation, then drains and closes the current
    /// appender, then removes the active archive. `P` holds the same bytes and
    /// reopening rebuilds the archive from it. Later writes fail with
    /// [`LogSinkError::Closed`].
    #[instrument(skip(self), fields(path = %self.inner.base.display()))]
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        let _rename = self.inner.rename_lock.lock().await;
        self.inner.current.load_full().close().await?;

        match fs::remove_file(archive_path_for(&self.inner.base)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Set the number of archives to retain
    pub fn set_max_files(&self, max_files: u32) -> &Self {
        self.inner.max_files.store(max_files, Ordering::Relaxed);
        self
    }

    /// Set the size the active file must exceed to trigger a rotation
    pub fn set_max_size(&self, max_size: u64) -> &Self {
        self.inner.max_size.store(max_size, Ordering::Relaxed);
        self
    }

    /// Rotate on the writing task (`true`) or in the background (`false`)
    pub fn set_blocking(&self, blocking: bool) -> &Self {
        self.inner.blocking.store(blocking, Ordering::Relaxed);
        self
    }

    /// Number of archives retained
    pub fn max_files(&self) -> u32 {
        self.inner.max_files.load(Ordering::Relaxed)
    }

    /// Rotation threshold in bytes
    pub fn max_size(&self) -> u64 {
        self.inner.max_size.load(Ordering::Relaxed)
    }

    /// Whether rotation runs on the writing task
    pub fn is_blocking(&self) -> bool {
        self.inner.blocking.load(Ordering::Relaxed)
    }

    /// Path of the live uncompressed file
    pub fn base_path(&self) -> &Path {
        &self.inner.base
    }

    /// Path of the archive with suffix `n` (1 is newest)
    pub fn archive_path(&self, n: u32) -> PathBuf {
        self.inner.archive_path(n)
    }

    /// Path of the archive being written by the current appender
    pub fn active_archive_path(&self) -> PathBuf {
        archive_path_for(&self.inner.base)
    }
}

impl std::fmt::Debug for RotationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationManager")
            .field("base", &self.inner.base)
            .field("max_size", &self.max_size())
            .field("max_files", &self.max_files())
            .field("blocking", &self.is_blocking())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Inner {
    fn archive_path(&self, n: u32) -> PathBuf {
        let mut name = archive_path_for(&self.base).into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    /// Replace `previous` with a fresh appender
    ///
    /// A no-op when another rotation is running, when `previous` is no longer
    /// current, or when the sink is closed.
    async fn rotate(&self, previous: &Arc<CompressingAppender>) -> Result<()> {
        if self
            .rotating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("Rotation already in progress");
            return Ok(());
        }
        let _flag = RotationFlag(&self.rotating);
        let _rename = self.rename_lock.lock().await;

        let still_current = Arc::ptr_eq(&self.current.load_full(), previous);
        if !still_current || self.closed.load(Ordering::Acquire) {
            debug!("Skipping stale rotation");
            return Ok(());
        }

        self.free_slot(1)
            .await
            .map_err(|e| LogSinkError::rotation(RotationPhase::Renumber, e))?;

        let active_archive = archive_path_for(&self.base);
        let demoted = match fs::rename(&active_archive, self.archive_path(1)).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %active_archive.display(), "No active archive to demote");
                self.close_gap(1).await;
                false
            }
            Err(e) => {
                self.close_gap(1).await;
                return Err(LogSinkError::rotation(RotationPhase::Demote, e));
            }
        };

        if let Err(e) = self.publish_replacement().await {
            // The previous appender stays current, so its archive returns to P.gz.
            let restored = if demoted {
                fs::rename(self.archive_path(1), &active_archive).await
            } else {
                Ok(())
            };
            if let Err(restore) = restored {
                error!(error = %restore, "Failed to restore active archive");
            }
            self.close_gap(1).await;
            return Err(e);
        }

        previous
            .close()
            .await
            .map_err(|e| LogSinkError::rotation(RotationPhase::Retire, e))?;

        info!(path = %self.base.display(), "Rotated log");
        Ok(())
    }

    /// Remove the retired primary file and publish a fresh appender at its path
    async fn publish_replacement(&self) -> Result<()> {
        match fs::remove_file(&self.base).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(LogSinkError::rotation(RotationPhase::Unlink, e)),
        }
        let replacement = CompressingAppender::open(&self.base, &self.config)
            .await
            .map_err(|e| LogSinkError::rotation(RotationPhase::Create, e))?;
        self.current.store(Arc::new(replacement));
        Ok(())
    }

    /// Shift archives above slot `n` down by one if `n` is empty
    async fn close_gap(&self, mut n: u32) {
        if !matches!(fs::try_exists(self.archive_path(n)).await, Ok(false)) {
            return;
        }
        loop {
            let next = self.archive_path(n + 1);
            if !matches!(fs::try_exists(&next).await, Ok(true)) {
                return;
            }
            if let Err(e) = fs::rename(&next, self.archive_path(n)).await {
                warn!(error = %e, path = %next.display(), "Failed to shift archive down");
                return;
            }
            n += 1;
        }
    }

    /// Make archive slot `n` free, shifting the archives above it first
    fn free_slot(&self, n: u32) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let name = self.archive_path(n);
            match fs::metadata(&name).await {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e),
            }

            if n >= self.max_files.load(Ordering::Relaxed).max(1) {
                debug!(path = %name.display(), "Removing archive past retention");
                return fs::remove_file(&name).await;
            }

            self.free_slot(n + 1).await?;
            debug!(from = n, to = n + 1, "Shifting archive");
            fs::rename(&name, self.archive_path(n + 1)).await
        })
    }
}

/// Builder for [`RotationManager`]
#[derive(Debug)]
pub struct RotationManagerBuilder {
    base: PathBuf,
    config: RotationConfig,
}

impl RotationManagerBuilder {
    /// Create a builder for a sink at `base`
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            config: RotationConfig::default(),
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: RotationConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the rotation threshold
    pub fn max_size(mut self, max_size: u64) -> Self {
        self.config.max_size = max_size;
        self
    }

    /// Set the archive retention count
    pub fn max_files(mut self, max_files: u32) -> Self {
        self.config.max_files = max_files;
        self
    }

    /// Choose between blocking and background rotation
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.config.blocking = blocking;
        self
    }

    /// Open the sink
    pub async fn open(self) -> Result<RotationManager> {
        RotationManager::open(self.base, self.config).await
    }
}
