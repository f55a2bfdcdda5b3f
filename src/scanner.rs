use log::{debug, error, info, warn};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ::time::{format_description::well_known, OffsetDateTime};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::output::ResultSink;
use crate::probe::Prober;
use crate::targets::TargetSource;
use crate::types::{ProbeResult, ScanSummary, Target};

/// Progress is logged once every this many scans.
pub const PROGRESS_EVERY: u64 = 10;

/// Single pull cursor shared by every worker.
pub type SharedSource = Arc<Mutex<TargetSource>>;

/// Tuning for [`run_scan`].
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub workers: usize,
    /// Pause after each probe, per worker.
    pub pause: Duration,
    /// How often the driver checks for shutdown.
    pub poll_interval: Duration,
    /// How long to wait for busy workers after shutdown was requested.
    pub shutdown_grace: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            workers: 10,
            pause: Duration::from_millis(100),
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Tuning for [`run_batch`].
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub chunk_size: usize,
    pub chunk_pause: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            chunk_pause: Duration::from_secs(1),
        }
    }
}

/// Shared state of one run: counters, start time and the shutdown flag.
#[derive(Debug)]
pub struct ScanSession {
    scanned: AtomicU64,
    feasible: AtomicU64,
    pulled: AtomicU64,
    active_workers: AtomicUsize,
    started: Instant,
    started_at: OffsetDateTime,
    shutdown: CancellationToken,
}

impl ScanSession {
    pub fn new() -> Self {
        Self {
            scanned: AtomicU64::new(0),
            feasible: AtomicU64::new(0),
            pulled: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            started: Instant::now(),
            started_at: OffsetDateTime::now_utc(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Ask every worker to stop at its next pull. Safe to call any number of times.
    pub fn request_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("shutdown requested; waiting for in-flight probes");
        }
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn scanned(&self) -> u64 {
        self.scanned.load(Ordering::SeqCst)
    }

    pub fn feasible(&self) -> u64 {
        self.feasible.load(Ordering::SeqCst)
    }

    /// Targets handed out by the source so far.
    pub fn pulled(&self) -> u64 {
        self.pulled.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// RFC 3339 wall-clock start of the run.
    pub fn started_at(&self) -> String {
        self.started_at
            .format(&well_known::Rfc3339)
            .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
    }

    pub fn summary(&self, completed: bool) -> ScanSummary {
        ScanSummary {
            scanned: self.scanned(),
            feasible: self.feasible(),
            elapsed: self.elapsed(),
            completed,
        }
    }

    /// Count one finished probe and emit it if it is feasible.
    ///
    /// `feasible` only moves once the row is in the sink. Returns whether this
    /// scan logged a progress line.
    pub async fn record<W>(&self, result: Option<&ProbeResult>, sink: &ResultSink<W>) -> io::Result<bool>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let scanned = self.scanned.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(result) = result.filter(|r| r.feasible) {
            if sink.write_result(result).await? {
                self.feasible.fetch_add(1, Ordering::SeqCst);
                info!(
                    "feasible: {} ({}) cn={} issuer={:?}",
                    result.address, result.origin, result.certificate_domain, result.certificate_issuer
                );
            } else {
                warn!("sink closed; dropped {}", result.address);
            }
        }
        let progress = scanned % PROGRESS_EVERY == 0;
        if progress {
            let secs = self.elapsed().as_secs_f64();
            let rate = if secs > 0.0 { scanned as f64 / secs } else { 0.0 };
            info!(
                "scanned {scanned}, feasible {}, {rate:.1} scans/s",
                self.feasible()
            );
        }
        Ok(progress)
    }

    async fn pull(&self, cursor: &SharedSource) -> Option<Target> {
        let next = {
            let mut source = cursor.lock().await;
            source.next().await
        };
        if next.is_some() {
            self.pulled.fetch_add(1, Ordering::SeqCst);
        }
        next
    }

    /// Sleep, waking early on shutdown.
    async fn pause(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        tokio::select! {
            _ = time::sleep(d) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

impl Default for ScanSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps `active_workers` accurate even if a worker panics.
struct ActiveWorker(Arc<ScanSession>);

impl ActiveWorker {
    fn enter(session: Arc<ScanSession>) -> Self {
        session.active_workers.fetch_add(1, Ordering::SeqCst);
        Self(session)
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.0.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn worker<P, W>(
    id: usize,
    cursor: SharedSource,
    prober: Arc<P>,
    sink: Arc<ResultSink<W>>,
    session: Arc<ScanSession>,
    pause: Duration,
) where
    P: Prober,
    W: AsyncWrite + Unpin + Send,
{
    let _active = ActiveWorker::enter(session.clone());
    debug!("worker {id} started");
    while !session.is_shutting_down() {
        let Some(target) = session.pull(&cursor).await else {
            break;
        };
        let result = prober.probe(target).await;
        if let Err(e) = session.record(result.as_ref(), &sink).await {
            error!("worker {id}: writing result failed: {e}");
            session.request_shutdown();
            break;
        }
        session.pause(pause).await;
    }
    debug!("worker {id} exited");
}

/// Run `opts.workers` workers over one shared source until it is exhausted or
/// shutdown is requested, then close the sink.
///
/// After a shutdown request the driver waits at most `opts.shutdown_grace` for
/// busy workers; whatever is still running after that is abandoned.
pub async fn run_scan<P, W>(
    source: TargetSource,
    prober: Arc<P>,
    sink: Arc<ResultSink<W>>,
    session: Arc<ScanSession>,
    opts: &ScanOptions,
) -> ScanSummary
where
    P: Prober,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let unbounded = source.is_unbounded();
    let cursor: SharedSource = Arc::new(Mutex::new(source));
    let workers_n = opts.workers.max(1);
    let mut workers = JoinSet::new();
    for id in 0..workers_n {
        workers.spawn(worker(
            id,
            cursor.clone(),
            prober.clone(),
            sink.clone(),
            session.clone(),
            opts.pause,
        ));
    }
    info!(
        "started {workers_n} workers over a {} source",
        if unbounded { "unbounded" } else { "finite" }
    );

    let mut ticker = time::interval(opts.poll_interval.max(Duration::from_millis(1)));
    loop {
        tokio::select! {
            joined = workers.join_next() => match joined {
                None => break,
                Some(Err(e)) => {
                    error!("worker died: {e}");
                    session.request_shutdown();
                }
                Some(Ok(())) => {}
            },
            _ = ticker.tick() => {
                if session.is_shutting_down() {
                    break;
                }
            }
        }
    }

    if session.is_shutting_down() {
        drain(&mut workers, &session, opts).await;
    }

    if let Err(e) = sink.close().await {
        error!("failed to flush results: {e}");
    }
    session.summary(!session.is_shutting_down())
}

async fn drain(workers: &mut JoinSet<()>, session: &ScanSession, opts: &ScanOptions) {
    let deadline = Instant::now() + opts.shutdown_grace;
    let step = opts.poll_interval.max(Duration::from_millis(1));
    loop {
        let busy = session.active_workers();
        if busy == 0 {
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(
                "{busy} workers still busy after {:?}; closing without them",
                opts.shutdown_grace
            );
            break;
        }
        time::sleep(step.min(deadline - now)).await;
    }
    workers.abort_all();
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            if !e.is_cancelled() {
                error!("worker died: {e}");
            }
        }
    }
}

/// Probe a finite source in fixed-size chunks, each chunk fanned out and
/// awaited as a whole. A panicking probe only loses its own result.
pub async fn run_batch<P, W>(
    mut source: TargetSource,
    prober: Arc<P>,
    sink: Arc<ResultSink<W>>,
    session: Arc<ScanSession>,
    opts: &BatchOptions,
) -> ScanSummary
where
    P: Prober,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let chunk_size = opts.chunk_size.max(1);
    'chunks: while !session.is_shutting_down() {
        let mut chunk = Vec::with_capacity(chunk_size);
        while chunk.len() < chunk_size {
            match source.next().await {
                Some(target) => {
                    session.pulled.fetch_add(1, Ordering::SeqCst);
                    chunk.push(target);
                }
                None => break,
            }
        }
        if chunk.is_empty() {
            break;
        }
        let last = chunk.len() < chunk_size;

        let mut probes = JoinSet::new();
        for target in chunk {
            let prober = prober.clone();
            probes.spawn(async move { prober.probe(target).await });
        }
        while let Some(joined) = probes.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                warn!("probe task failed: {e}");
                None
            });
            if let Err(e) = session.record(result.as_ref(), &sink).await {
                error!("writing result failed: {e}");
                session.request_shutdown();
                break 'chunks;
            }
        }

        if last {
            break;
        }
        session.pause(opts.chunk_pause).await;
    }

    if let Err(e) = sink.close().await {
        error!("failed to flush results: {e}");
    }
    session.summary(!session.is_shutting_down())
}
