//! Chunked producer/consumer pipeline.
//!
//! Worker tasks pull keys from a [`KeySource`], collect them into
//! chunks, run each chunk through a [`PooledExecutor`] and push the
//! results into a bounded output queue. Consumers take results with
//! [`Pipeline::read`], [`Pipeline::poll`] or [`Pipeline::read_chunk`].
//!
//! Scan sources use the bulk loop: flush every `chunk_size` keys and
//! once more when the source is exhausted. Live sources add a periodic
//! flush so a trickle of notifications doesn't sit in a half-full chunk;
//! the read loop and the ticker share one chunk behind a mutex, so only
//! one of them flushes at a time.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ReaderConfig;
use crate::error::{Error, Result};
use crate::executor::{Operation, PooledExecutor};
use crate::reader::KeySource;

/// Pipeline sizing and timing.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub chunk_size: usize,
    /// Number of worker tasks.
    pub threads: usize,
    /// Capacity of the output queue.
    pub queue_capacity: usize,
    /// Period of the live workers' flush.
    pub flush_interval: Duration,
    /// Wait used by [`Pipeline::read`] between checks.
    pub poll_timeout: Duration,
    /// How long [`Pipeline::close`] waits for workers before aborting them.
    pub close_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            threads: 1,
            queue_capacity: 10_000,
            flush_interval: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(100),
            close_timeout: Duration::from_secs(3),
        }
    }
}

impl PipelineOptions {
    /// Rejects sizes and periods the workers can't run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.threads == 0 || self.queue_capacity == 0 {
            return Err(Error::Config(
                "chunk_size, threads and queue_capacity must be at least 1".into(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::Config("flush_interval must be positive".into()));
        }
        if self.poll_timeout.is_zero() {
            return Err(Error::Config("poll_timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn from_reader(reader: &ReaderConfig) -> Self {
        Self {
            chunk_size: reader.chunk_size.max(1),
            threads: reader.threads.max(1),
            queue_capacity: reader.queue_capacity.max(1),
            flush_interval: reader.flush_interval,
            poll_timeout: reader.poll_timeout,
            ..Self::default()
        }
    }
}

/// What a finished pipeline did.
#[derive(Debug, Default)]
pub struct PipelineSummary {
    /// Results pushed to the output queue.
    pub items: u64,
    /// Worker failures, one per failed worker.
    pub errors: Vec<Error>,
}

impl PipelineSummary {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// State shared by one worker's read loop and ticker.
struct Worker<O: Operation<Input = Bytes>> {
    id: usize,
    source: Arc<KeySource>,
    executor: Arc<PooledExecutor<O>>,
    tx: mpsc::Sender<O::Output>,
    chunk_size: usize,
    flush_interval: Duration,
    items: Arc<AtomicU64>,
}

/// Decrements the running-worker count however the task ends.
struct Running(Arc<AtomicUsize>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Pipeline<O: Operation<Input = Bytes>> {
    source: Arc<KeySource>,
    executor: Arc<PooledExecutor<O>>,
    rx: Mutex<mpsc::Receiver<O::Output>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<Result<()>>>>,
    running: Arc<AtomicUsize>,
    items: Arc<AtomicU64>,
    options: PipelineOptions,
}

impl<O: Operation<Input = Bytes>> Pipeline<O> {
    /// Opens the source and starts the workers.
    pub async fn start(
        source: KeySource,
        executor: PooledExecutor<O>,
        options: PipelineOptions,
    ) -> Result<Self> {
        Self::start_shared(Arc::new(source), Arc::new(executor), options).await
    }

    /// Like [`start`](Self::start), for a source or executor shared with
    /// other components.
    pub async fn start_shared(
        source: Arc<KeySource>,
        executor: Arc<PooledExecutor<O>>,
        options: PipelineOptions,
    ) -> Result<Self> {
        options.validate()?;
        source.open().await?;

        let (tx, rx) = mpsc::channel(options.queue_capacity);
        let threads = options.threads;
        let running = Arc::new(AtomicUsize::new(threads));
        let items = Arc::new(AtomicU64::new(0));
        let live = source.is_live();

        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let worker = Worker {
                id,
                source: Arc::clone(&source),
                executor: Arc::clone(&executor),
                tx: tx.clone(),
                chunk_size: options.chunk_size,
                flush_interval: options.flush_interval,
                items: Arc::clone(&items),
            };
            let guard = Running(Arc::clone(&running));
            workers.push(tokio::spawn(async move {
                let result = if live {
                    worker.run_live().await
                } else {
                    worker.run_bulk().await
                };
                match &result {
                    Ok(()) => debug!(worker = worker.id, "worker finished"),
                    Err(e) => error!(worker = worker.id, "worker failed: {e}"),
                }
                // counted out before the sender goes, so whoever sees the
                // output end also sees every worker done
                drop(guard);
                drop(worker);
                result
            }));
        }
        info!(threads, live, chunk_size = options.chunk_size, "pipeline started");

        Ok(Self {
            source,
            executor,
            rx: Mutex::new(rx),
            workers: parking_lot::Mutex::new(workers),
            running,
            items,
            options,
        })
    }

    /// Next result. Returns `None` only once every worker has finished
    /// and the output queue is empty.
    pub async fn read(&self) -> Option<O::Output> {
        loop {
            let mut rx = self.rx.lock().await;
            match tokio::time::timeout(self.options.poll_timeout, rx.recv()).await {
                Ok(item) => return item,
                Err(_) => continue,
            }
        }
    }

    /// Waits up to `timeout` for the next result.
    pub async fn poll(&self, timeout: Duration) -> Option<O::Output> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Takes up to `count` results that are ready now.
    pub async fn read_chunk(&self, count: usize) -> Vec<O::Output> {
        let mut rx = self.rx.lock().await;
        let mut out = Vec::with_capacity(count.min(1024));
        while out.len() < count {
            match rx.try_recv() {
                Ok(item) => out.push(item),
                Err(_) => break,
            }
        }
        out
    }

    /// True once every worker has finished. Results may still be queued.
    pub fn is_done(&self) -> bool {
        self.running.load(Ordering::Acquire) == 0
    }

    /// Results produced so far.
    pub fn items(&self) -> u64 {
        self.items.load(Ordering::Relaxed)
    }

    pub fn executor(&self) -> &Arc<PooledExecutor<O>> {
        &self.executor
    }

    /// Closes the key source so workers drain and stop.
    pub async fn close_source(&self) -> Result<()> {
        self.source.close().await
    }

    /// Waits for every worker to finish on its own. The output queue must
    /// be consumed meanwhile or workers stall on a full queue.
    pub async fn join(&self) -> PipelineSummary {
        let handles = std::mem::take(&mut *self.workers.lock());
        let mut summary = PipelineSummary::default();
        for handle in handles {
            collect(handle.await, &mut summary);
        }
        summary.items = self.items();
        summary
    }

    /// Stops the pipeline: closes the source, waits up to the close
    /// timeout for workers to drain, aborts stragglers and discards
    /// queued results.
    pub async fn close(&self) -> PipelineSummary {
        let mut summary = PipelineSummary::default();
        if let Err(e) = self.close_source().await {
            summary.errors.push(e);
        }

        let mut handles = std::mem::take(&mut *self.workers.lock());
        let deadline = tokio::time::Instant::now() + self.options.close_timeout;
        for handle in handles.iter_mut() {
            match tokio::time::timeout_at(deadline, &mut *handle).await {
                Ok(joined) => collect(joined, &mut summary),
                Err(_) => {
                    handle.abort();
                    debug!("aborted worker after close timeout");
                }
            }
        }

        let mut rx = self.rx.lock().await;
        rx.close();
        let mut discarded = 0usize;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "discarded queued results on close");
        }
        self.executor.close();

        summary.items = self.items();
        summary
    }
}

fn collect(joined: std::result::Result<Result<()>, tokio::task::JoinError>, summary: &mut PipelineSummary) {
    match joined {
        Ok(Ok(())) => {}
        // a worker cut off by close is not a failure
        Ok(Err(Error::Interrupted)) => {}
        Ok(Err(e)) => summary.errors.push(e),
        Err(e) if e.is_cancelled() => {}
        Err(e) => summary.errors.push(Error::WorkerPanicked(e.to_string())),
    }
}

impl<O: Operation<Input = Bytes>> Worker<O> {
    async fn run_bulk(&self) -> Result<()> {
        let mut chunk = Vec::with_capacity(self.chunk_size);
        while let Some(key) = self.source.read().await? {
            chunk.push(key);
            if chunk.len() >= self.chunk_size {
                self.flush(&mut chunk).await?;
            }
        }
        self.flush(&mut chunk).await
    }

    async fn run_live(&self) -> Result<()> {
        let chunk = Mutex::new(Vec::with_capacity(self.chunk_size));
        let stop = Notify::new();

        let read_loop = async {
            let result = async {
                while let Some(key) = self.source.read().await? {
                    let mut chunk = chunk.lock().await;
                    chunk.push(key);
                    if chunk.len() >= self.chunk_size {
                        self.flush(&mut chunk).await?;
                    }
                }
                Ok::<(), Error>(())
            }
            .await;
            stop.notify_one();
            result
        };

        let ticker = async {
            let mut interval = tokio::time::interval(self.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop.notified() => return Ok::<(), Error>(()),
                }
                let mut chunk = chunk.lock().await;
                self.flush(&mut chunk).await?;
            }
        };

        tokio::try_join!(read_loop, ticker)?;
        let mut chunk = chunk.lock().await;
        self.flush(&mut chunk).await
    }

    async fn flush(&self, chunk: &mut Vec<Bytes>) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let keys = std::mem::replace(chunk, Vec::with_capacity(self.chunk_size));
        let n = keys.len();
        let outputs = self.executor.execute(keys).await?;
        for item in outputs {
            self.tx.send(item).await.map_err(|_| Error::Interrupted)?;
        }
        self.items.fetch_add(n as u64, Ordering::Relaxed);
        crate::metrics::record_pipeline_items(n);
        debug!(worker = self.id, items = n, "flushed chunk");
        Ok(())
    }
}
