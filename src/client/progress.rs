//! Transfer progress reporting and the streaming copy loop

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Minimum spacing between intermediate progress callbacks
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Transfer progress information
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressInfo {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// 0-100
    pub percentage: f64,
    /// Bytes per second since the transfer started
    pub speed: f64,
}

/// Progress callback
#[derive(Clone)]
pub struct ProgressSink(Arc<dyn Fn(&ProgressInfo) + Send + Sync>);

impl ProgressSink {
    pub fn new(f: impl Fn(&ProgressInfo) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn emit(&self, info: &ProgressInfo) {
        (self.0)(info)
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressSink(..)")
    }
}

#[derive(Debug)]
pub(crate) enum CopyError {
    Read(io::Error),
    Write(io::Error),
    Cancelled,
}

struct Tracker<'a> {
    sink: Option<&'a ProgressSink>,
    total: u64,
    started: Instant,
    last_emit: Instant,
    interval: Duration,
}

impl Tracker<'_> {
    fn info(&self, transferred: u64, percentage: f64) -> ProgressInfo {
        let elapsed = self.started.elapsed().as_secs_f64();
        ProgressInfo {
            bytes_transferred: transferred,
            total_bytes: self.total,
            percentage,
            speed: if elapsed > 0.0 {
                transferred as f64 / elapsed
            } else {
                0.0
            },
        }
    }

    fn percentage(&self, transferred: u64) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            ((transferred as f64 / self.total as f64) * 100.0).min(100.0)
        }
    }

    fn start(&self) {
        if let Some(sink) = self.sink {
            sink.emit(&self.info(0, 0.0));
        }
    }

    fn update(&mut self, transferred: u64) {
        let Some(sink) = self.sink else {
            return;
        };
        if self.last_emit.elapsed() >= self.interval {
            sink.emit(&self.info(transferred, self.percentage(transferred)));
            self.last_emit = Instant::now();
        }
    }

    fn finish(&self, transferred: u64) {
        if let Some(sink) = self.sink {
            sink.emit(&self.info(transferred, 100.0));
        }
    }
}

/// Stream `reader` into `writer` through a `buffer_size` buffer.
///
/// Emits one zero update up front, throttled updates at most every
/// `interval`, and a final update at 100 %. Cancellation is checked
/// between chunks. The writer is shut down on success.
pub(crate) async fn copy_with_progress<R, W>(
    reader: &mut R,
    writer: &mut W,
    total: u64,
    buffer_size: usize,
    sink: Option<&ProgressSink>,
    interval: Duration,
    ctx: &CancellationToken,
) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let now = Instant::now();
    let mut tracker = Tracker {
        sink,
        total,
        started: now,
        last_emit: now,
        interval,
    };
    tracker.start();

    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut transferred: u64 = 0;

    loop {
        if ctx.is_cancelled() {
            debug!("Copy cancelled at {} bytes", transferred);
            return Err(CopyError::Cancelled);
        }

        let n = reader.read(&mut buffer).await.map_err(CopyError::Read)?;
        if n == 0 {
            break;
        }

        writer
            .write_all(&buffer[..n])
            .await
            .map_err(CopyError::Write)?;

        transferred += n as u64;
        tracker.update(transferred);
    }

    writer.flush().await.map_err(CopyError::Write)?;
    writer.shutdown().await.map_err(CopyError::Write)?;

    tracker.finish(transferred);
    Ok(transferred)
}
