//! Producer/consumer pipeline for coverage extraction
//!
//! The extractor runs as one task and each of the caller's consumers as
//! another, all on one `JoinSet`. The first failure cancels the shared token so the other side
//! stops at its next check point, and that first failure is what the caller
//! gets back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncBufRead;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ExtractConfig;
use crate::coverage::{extract, ExtractError, ExtractStats, Package};

/// Terminal error of a pipeline run
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The extraction side stopped early
    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// The consumer failed while processing packages
    #[error("consumer failed: {0:#}")]
    Consumer(anyhow::Error),

    /// One of the tasks panicked or was aborted
    #[error("pipeline task failed: {0}")]
    Join(#[from] JoinError),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Extract(e) if e.is_cancelled())
    }
}

/// Tuning for one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Packages buffered between producer and consumer (at least 1)
    pub capacity: usize,
    /// Cancel the run once this much time has passed
    pub timeout: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            capacity: 16,
            timeout: None,
        }
    }
}

impl From<&ExtractConfig> for PipelineOptions {
    fn from(config: &ExtractConfig) -> Self {
        Self {
            capacity: config.channel_capacity,
            timeout: config.timeout_seconds.map(Duration::from_secs),
        }
    }
}

/// Receiving end handed to each consumer.
///
/// Clones share one channel: every package goes to exactly one of them, in
/// document order of the hand-offs.
#[derive(Clone)]
pub struct PackageReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Package>>>,
    cancel: CancellationToken,
}

impl PackageReceiver {
    pub fn new(rx: mpsc::Receiver<Package>, cancel: CancellationToken) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
            cancel,
        }
    }

    /// Next package, or `None` once the channel is closed.
    ///
    /// Packages already in the channel are still delivered after cancellation;
    /// only waiting for new ones stops.
    pub async fn recv(&mut self) -> Option<Package> {
        let mut rx = self.rx.lock().await;
        recv_package(&mut rx, &self.cancel).await
    }
}

/// Cancellable receive on a package channel
pub async fn recv_package(
    rx: &mut mpsc::Receiver<Package>,
    cancel: &CancellationToken,
) -> Option<Package> {
    tokio::select! {
        biased;
        package = rx.recv() => package,
        _ = cancel.cancelled() => {
            // Drain what the producer managed to send before it stopped
            rx.try_recv().ok()
        }
    }
}

enum Outcome<T> {
    Producer(Result<ExtractStats, ExtractError>),
    Consumer(usize, anyhow::Result<T>),
}

/// Run extraction and a consumer concurrently, failing fast.
///
/// Cancelling `cancel` stops both sides; internal failures only cancel a
/// child of it, so the caller's token is never cancelled on its behalf.
pub async fn run_pipeline<R, F, Fut, T>(
    source: R,
    options: PipelineOptions,
    cancel: CancellationToken,
    consumer: F,
) -> Result<(ExtractStats, T), PipelineError>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    F: FnOnce(PackageReceiver) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let (stats, outputs) = run_group(source, options, cancel, |packages| vec![consumer(packages)]).await?;
    match outputs.into_iter().next() {
        Some(output) => Ok((stats, output)),
        None => Err(PipelineError::Extract(ExtractError::Cancelled)),
    }
}

/// Like [`run_pipeline`], with `workers` consumers draining the same channel.
///
/// Outputs come back in consumer order. The first failure of any consumer or
/// of the producer cancels the whole group.
pub async fn run_pipeline_shared<R, F, Fut, T>(
    source: R,
    options: PipelineOptions,
    cancel: CancellationToken,
    workers: usize,
    mut consumer: F,
) -> Result<(ExtractStats, Vec<T>), PipelineError>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    F: FnMut(usize, PackageReceiver) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    run_group(source, options, cancel, |packages| {
        (0..workers.max(1))
            .map(|worker| consumer(worker, packages.clone()))
            .collect()
    })
    .await
}

async fn run_group<R, S, Fut, T>(
    source: R,
    options: PipelineOptions,
    cancel: CancellationToken,
    start_consumers: S,
) -> Result<(ExtractStats, Vec<T>), PipelineError>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    S: FnOnce(PackageReceiver) -> Vec<Fut>,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let group = cancel.child_token();
    let (tx, rx) = mpsc::channel(options.capacity.max(1));

    let deadline = options.timeout.map(|timeout| {
        let token = group.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "extraction deadline elapsed");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    });

    let mut join_set = JoinSet::new();
    let producer_token = group.clone();
    join_set.spawn(async move { Outcome::Producer(extract(source, tx, producer_token).await) });

    let consumers = start_consumers(PackageReceiver::new(rx, group.clone()));
    let mut outputs: Vec<Option<T>> = consumers.iter().map(|_| None).collect();
    for (index, fut) in consumers.into_iter().enumerate() {
        join_set.spawn(consumer_future(index, fut));
    }

    let mut stats = None;
    let mut first_error: Option<PipelineError> = None;

    while let Some(joined) = join_set.join_next().await {
        let error = match joined {
            Ok(Outcome::Producer(Ok(s))) => {
                stats = Some(s);
                continue;
            }
            Ok(Outcome::Consumer(index, Ok(value))) => {
                outputs[index] = Some(value);
                continue;
            }
            Ok(Outcome::Producer(Err(e))) => PipelineError::Extract(e),
            Ok(Outcome::Consumer(_, Err(e))) => PipelineError::Consumer(e),
            Err(e) => PipelineError::Join(e),
        };

        debug!(error = %error, "pipeline task failed, cancelling the group");
        group.cancel();

        // A cancellation caused by the other side's failure never hides that failure
        first_error = match first_error {
            Some(existing) if !(existing.is_cancelled() && !error.is_cancelled()) => Some(existing),
            _ => Some(error),
        };
    }

    if let Some(handle) = deadline {
        handle.abort();
    }

    if let Some(error) = first_error {
        return Err(error);
    }

    let outputs: Option<Vec<T>> = outputs.into_iter().collect();
    match (stats, outputs) {
        (Some(stats), Some(outputs)) => Ok((stats, outputs)),
        _ => Err(PipelineError::Extract(ExtractError::Cancelled)),
    }
}

async fn consumer_future<Fut, T>(index: usize, fut: Fut) -> Outcome<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    Outcome::Consumer(index, fut.await)
}
