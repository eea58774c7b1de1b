//! Client worker: originates sessions over one transport.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::error::Result;
use crate::metrics::MuxMetrics;
use crate::mux::buf::BUFFER_SIZE;
use crate::mux::frame::{Destination, SessionStatus};
use crate::mux::session::{signalled, BoxedRead};
use crate::mux::worker::WorkerCore;
use crate::mux::writer::SessionWriter;

/// Admission limits and timers of a client worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStrategy {
    /// Max live sessions at once (0 = unlimited)
    pub max_concurrency: usize,
    /// Max sessions over the worker's lifetime (0 = unlimited)
    pub max_connection: u64,
    /// Idle check period; an idle worker closes itself (zero disables)
    pub idle_timeout: Duration,
    /// Read buffer size per session
    pub buffer_size: usize,
}

impl Default for ClientStrategy {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            max_connection: 16,
            idle_timeout: Duration::from_secs(30 * 60),
            buffer_size: BUFFER_SIZE,
        }
    }
}

/// Lifecycle of a client worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Accepting sessions
    Active,
    /// Draining: no new sessions, live ones continue
    Closing,
    /// Transport torn down
    Closed,
}

/// Multiplexes locally originated connections onto one transport.
pub struct ClientWorker {
    core: Arc<WorkerCore>,
    strategy: ClientStrategy,
    admission: Mutex<()>,
}

impl ClientWorker {
    /// Start a worker over `transport`. Must be called inside a tokio runtime.
    pub fn new<T>(transport: T, strategy: ClientStrategy) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_metrics(transport, strategy, Arc::new(MuxMetrics::new()))
    }

    /// Start a worker recording into shared `metrics`.
    pub fn with_metrics<T>(transport: T, strategy: ClientStrategy, metrics: Arc<MuxMetrics>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        metrics.increment_workers_created();
        let (core, reader) = WorkerCore::new("client", transport, metrics, strategy.buffer_size);

        tokio::spawn(run(Arc::clone(&core), reader));
        if !strategy.idle_timeout.is_zero() {
            tokio::spawn(monitor(Arc::clone(&core), strategy.idle_timeout));
        }
        info!(role = "client", "worker started");

        Self {
            core,
            strategy,
            admission: Mutex::new(()),
        }
    }

    /// Admission strategy.
    pub fn strategy(&self) -> &ClientStrategy {
        &self.strategy
    }

    fn at_connection_limit(&self) -> bool {
        self.strategy.max_connection > 0
            && self.core.sessions.count() >= self.strategy.max_connection
    }

    fn at_concurrency_limit(&self) -> bool {
        self.strategy.max_concurrency > 0
            && self.core.sessions.size() >= self.strategy.max_concurrency
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        if self.core.is_closed() {
            WorkerState::Closed
        } else if self.core.sessions.is_closed() || self.at_connection_limit() {
            WorkerState::Closing
        } else {
            WorkerState::Active
        }
    }

    /// Whether the worker refuses new sessions.
    pub fn is_full(&self) -> bool {
        self.is_closed() || self.at_connection_limit() || self.at_concurrency_limit()
    }

    /// Whether the transport has been torn down.
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.core.sessions.size()
    }

    /// Number of sessions ever carried.
    pub fn total_sessions(&self) -> u64 {
        self.core.sessions.count()
    }

    /// Carry `conn` to `destination` on a new session.
    ///
    /// Returns the connection back when the worker is full or closed.
    pub fn dispatch<S>(&self, destination: Destination, conn: S) -> std::result::Result<(), S>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let session = {
            let _admit = self.admission.lock();
            if self.is_full() {
                return Err(conn);
            }
            self.core
                .sessions
                .allocate_stream(destination.network, conn)?
        };
        debug!(session_id = session.id(), %destination, "session dispatched");

        let writer = SessionWriter::new(session.id(), destination, self.core.writer.clone());
        let core = Arc::clone(&self.core);
        let max_connection = self.strategy.max_connection;
        tokio::spawn(async move {
            core.pump(session, writer, true).await;
            // A worker that used up its lifetime budget closes once drained
            let spent = max_connection > 0 && core.sessions.count() >= max_connection;
            if spent && core.sessions.close_if_no_session() {
                core.shutdown().await;
            }
        });
        Ok(())
    }

    /// Close the worker and every session on it.
    pub async fn close(&self) {
        self.core.shutdown().await;
    }

    /// Wait until the worker has closed.
    pub async fn closed(&self) {
        self.core.wait_closed().await;
    }
}

impl std::fmt::Debug for ClientWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientWorker")
            .field("state", &self.state())
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

async fn run(core: Arc<WorkerCore>, mut reader: BoxedRead) {
    let result = read_loop(&core, &mut reader).await;
    core.finish(result).await;
}

async fn read_loop(core: &WorkerCore, reader: &mut BoxedRead) -> Result<()> {
    let mut done = core.subscribe();
    while let Some(meta) = core.next_frame(reader, &mut done).await? {
        let payload = match meta.status {
            // Never initiated toward a client, only drained
            SessionStatus::New | SessionStatus::KeepAlive => core.discard(&meta, reader).await?,
            SessionStatus::Keep => core.handle_keep(&meta, reader).await?,
            SessionStatus::End => core.handle_end(&meta, reader).await?,
        };
        core.metrics.record_frame_received(payload);
    }
    Ok(())
}

async fn monitor(core: Arc<WorkerCore>, period: Duration) {
    let mut done = core.subscribe();
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = signalled(&mut done) => return,
            _ = ticker.tick() => {}
        }
        if core.sessions.size() == 0 && core.sessions.close_if_no_session() {
            info!(role = core.role, "idle worker closing");
            core.shutdown().await;
            return;
        }
    }
}
