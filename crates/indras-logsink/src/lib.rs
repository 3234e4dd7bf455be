//! # Indras Log Sink
//!
//! Size-triggered rotating, gzip-compressing append-only log sink.
//!
//! Callers write byte records to one logical stream. The sink appends them to
//! a live file, keeps a gzip copy of that file up to date in the background,
//! and rotates once the live file passes a size threshold, retiring archives
//! beyond a retention count.
//!
//! ## Features
//!
//! - **CompressingAppender**: raw append plus background gzip of the same bytes
//! - **RotationManager**: lock-free current-writer swap, one rotation per
//!   threshold crossing, blocking or background rotation
//! - **Retention window**: `P.gz.1` (newest) to `P.gz.<max_files>` (oldest)
//! - **Resume**: content left in the live file by a previous run is
//!   compressed when the sink reopens
//!
//! ## File Layout
//!
//! ```text
//! app.log        live uncompressed stream
//! app.log.gz     gzip of app.log, written while the writer is open
//! app.log.gz.1   most recently retired archive
//! app.log.gz.N   oldest retained archive (N = max_files)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use indras_logsink::RotationManager;
//!
//! #[tokio::main]
//! async fn main() -> indras_logsink::Result<()> {
//!     let log = RotationManager::builder("./logs/app.log")
//!         .max_size(10 * 1024 * 1024)
//!         .max_files(5)
//!         .open()
//!         .await?;
//!
//!     log.write(b"hello\n").await?;
//!
//!     // Drains pending compression before returning
//!     log.close().await?;
//!     Ok(())
//! }
//! ```

pub mod appender;
pub mod config;
pub mod error;
pub mod rotation;

// Re-exports
pub use appender::{ARCHIVE_EXTENSION, AppenderState, CompressingAppender, archive_path_for};
pub use config::RotationConfig;
pub use error::{LogSinkError, Result, RotationPhase};
pub use rotation::{RotationManager, RotationManagerBuilder};
