//! Client-side pool of workers.
//!
//! [`ClientPool`] spreads outbound sessions across several transports. A
//! session goes to the first worker that admits it; when none does, exactly
//! one new transport is opened and dispatch is retried once. Transports are
//! opened through a [`Connector`] with bounded, exponentially backed-off
//! retries.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics::MuxMetrics;
use crate::mux::client::{ClientStrategy, ClientWorker};
use crate::mux::frame::Destination;

/// Opens new transports for the pool.
pub trait Connector: Send + Sync + 'static {
    /// The transport type produced by this connector.
    type Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Establish a new transport.
    fn connect(&self) -> impl Future<Output = io::Result<Self::Transport>> + Send;
}

/// Raw TCP transports to a fixed server.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Connect to `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Override the connect timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connector for TcpConnector {
    type Transport = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Backoff schedule for opening transports.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before giving up (at least one is always made)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Cap on any single delay
    pub max_backoff: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Add up to 25% random delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-indexed), without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let nanos = (self.initial_backoff.as_nanos() as f64 * factor).round();
        if !nanos.is_finite() || nanos >= self.max_backoff.as_nanos() as f64 {
            return self.max_backoff;
        }
        Duration::from_nanos(nanos.max(0.0) as u64)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..0.25);
        base.mul_f64(1.0 + extra)
    }
}

/// Pool settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Sessions ever dispatched per worker ever opened, above which a spare
    /// worker is opened
    pub worker_ratio: f64,
    /// Admission strategy of every worker
    pub strategy: ClientStrategy,
    /// Transport connect retries
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_ratio: 7.5,
            strategy: ClientStrategy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

struct PoolInner<C> {
    connector: C,
    config: PoolConfig,
    workers: RwLock<Vec<Arc<ClientWorker>>>,
    create_lock: tokio::sync::Mutex<()>,
    growing: AtomicBool,
    closed: AtomicBool,
    dispatched: AtomicU64,
    opened: AtomicU64,
    metrics: Arc<MuxMetrics>,
}

/// Load-balances sessions over a growing set of client workers.
///
/// Cheap to clone; clones share the same workers.
pub struct ClientPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ClientPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ClientPool<C> {
    /// Create an empty pool. Transports are opened on demand.
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                workers: RwLock::new(Vec::new()),
                create_lock: tokio::sync::Mutex::new(()),
                growing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                dispatched: AtomicU64::new(0),
                opened: AtomicU64::new(0),
                metrics: Arc::new(MuxMetrics::new()),
            }),
        }
    }

    /// Metrics shared by every worker of the pool.
    pub fn metrics(&self) -> &Arc<MuxMetrics> {
        &self.inner.metrics
    }

    /// Pool settings.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Number of workers not yet closed.
    pub fn worker_count(&self) -> usize {
        self.inner
            .workers
            .read()
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }

    /// Number of live sessions across all workers.
    pub fn session_count(&self) -> usize {
        self.inner
            .workers
            .read()
            .iter()
            .map(|w| w.active_sessions())
            .sum()
    }

    /// Carry `conn` to `destination` on some worker.
    ///
    /// Fails with [`Error::WorkerClosed`] once the pool has been closed.
    pub async fn dispatch<S>(&self, destination: Destination, conn: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.is_closed() {
            return Err(Error::WorkerClosed);
        }
        let conn = match self.try_workers(&destination, conn) {
            Ok(()) => {
                self.after_dispatch();
                return Ok(());
            }
            Err(conn) => conn,
        };

        self.create_worker().await?;
        match self.try_workers(&destination, conn) {
            Ok(()) => {
                self.after_dispatch();
                Ok(())
            }
            Err(_) => {
                warn!(%destination, "no worker accepted the session");
                Err(Error::PoolExhausted)
            }
        }
    }

    /// Open a session to `destination` and return its local end.
    pub async fn dial(&self, destination: Destination) -> Result<DuplexStream> {
        let size = self.inner.config.strategy.buffer_size.max(1);
        let (local, remote) = tokio::io::duplex(size);
        self.dispatch(destination, remote).await?;
        Ok(local)
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close every worker. Later dispatches fail.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let workers: Vec<_> = self.inner.workers.write().drain(..).collect();
        for worker in workers {
            worker.close().await;
        }
    }

    fn try_workers<S>(&self, destination: &Destination, mut conn: S) -> std::result::Result<(), S>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut workers = self.inner.workers.write();
        workers.retain(|w| !w.is_closed());
        for worker in workers.iter() {
            match worker.dispatch(destination.clone(), conn) {
                Ok(()) => return Ok(()),
                Err(rejected) => conn = rejected,
            }
        }
        Err(conn)
    }

    fn after_dispatch(&self) {
        let dispatched = self.inner.dispatched.fetch_add(1, Ordering::AcqRel) + 1;
        let workers = self.inner.opened.load(Ordering::Acquire);
        if workers == 0 {
            return;
        }
        let ratio = dispatched as f64 / workers as f64;
        if ratio <= self.inner.config.worker_ratio {
            return;
        }
        if self.inner.growing.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!(ratio, workers, "opening spare worker");
        let pool = self.clone();
        tokio::spawn(async move {
            if let Err(e) = pool.create_worker().await {
                warn!(error = %e, "spare worker failed");
            }
            pool.inner.growing.store(false, Ordering::Release);
        });
    }

    async fn create_worker(&self) -> Result<Arc<ClientWorker>> {
        let _guard = self.inner.create_lock.lock().await;
        let transport = self.connect_with_retry().await?;
        let mut workers = self.inner.workers.write();
        // close() drains under this lock, so nothing is added afterwards
        if self.is_closed() {
            return Err(Error::WorkerClosed);
        }
        let worker = Arc::new(ClientWorker::with_metrics(
            transport,
            self.inner.config.strategy.clone(),
            Arc::clone(&self.inner.metrics),
        ));
        workers.push(Arc::clone(&worker));
        self.inner.opened.fetch_add(1, Ordering::AcqRel);
        info!(workers = workers.len(), "worker added to pool");
        Ok(worker)
    }

    async fn connect_with_retry(&self) -> Result<C::Transport> {
        let policy = &self.inner.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.inner.connector.connect().await {
                Ok(transport) => return Ok(transport),
                Err(e) if attempt >= max_attempts => {
                    warn!(attempts = attempt, error = %e, "transport connect failed");
                    return Err(Error::Transport(e));
                }
                Err(e) => {
                    let delay = policy.backoff(attempt);
                    debug!(attempt, ?delay, error = %e, "transport connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
