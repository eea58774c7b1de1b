//! Server worker: serves peer-originated sessions over one transport.
//!
//! Every New frame is handed to a [`Dispatcher`]; the upstream connection it
//! returns is registered under the peer-chosen id and relayed both ways.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics::MuxMetrics;
use crate::mux::buf::{Buffer, BUFFER_SIZE};
use crate::mux::dispatcher::Dispatcher;
use crate::mux::frame::{read_payload, FrameMetadata, SessionStatus};
use crate::mux::session::{BoxedRead, Session};
use crate::mux::worker::WorkerCore;
use crate::mux::writer::SessionWriter;

/// Demultiplexes one transport toward upstream connections.
pub struct ServerWorker {
    core: Arc<WorkerCore>,
}

impl ServerWorker {
    /// Start serving `transport`. Must be called inside a tokio runtime.
    pub fn new<D, T>(dispatcher: D, transport: T) -> Self
    where
        D: Dispatcher,
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_metrics(dispatcher, transport, Arc::new(MuxMetrics::new()))
    }

    /// Start serving `transport`, recording into shared `metrics`.
    pub fn with_metrics<D, T>(dispatcher: D, transport: T, metrics: Arc<MuxMetrics>) -> Self
    where
        D: Dispatcher,
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (core, reader) = WorkerCore::new("server", transport, metrics, BUFFER_SIZE);
        tokio::spawn(run(Arc::clone(&core), dispatcher, reader));
        info!(role = "server", "worker started");
        Self { core }
    }

    /// Number of live sessions.
    pub fn active_connections(&self) -> usize {
        self.core.sessions.size()
    }

    /// Whether the transport has been torn down.
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Metrics this worker records into.
    pub fn metrics(&self) -> &Arc<MuxMetrics> {
        &self.core.metrics
    }

    /// Close the worker and every upstream connection.
    pub async fn close(&self) {
        self.core.shutdown().await;
    }

    /// Wait until the worker has closed.
    pub async fn closed(&self) {
        self.core.wait_closed().await;
    }
}

impl std::fmt::Debug for ServerWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerWorker")
            .field("closed", &self.is_closed())
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

async fn run<D: Dispatcher>(core: Arc<WorkerCore>, dispatcher: D, mut reader: BoxedRead) {
    let result = read_loop(&core, &dispatcher, &mut reader).await;
    core.finish(result).await;
}

async fn read_loop<D: Dispatcher>(
    core: &Arc<WorkerCore>,
    dispatcher: &D,
    reader: &mut BoxedRead,
) -> Result<()> {
    let mut done = core.subscribe();
    while let Some(meta) = core.next_frame(reader, &mut done).await? {
        let payload = match meta.status {
            SessionStatus::New => handle_new(core, dispatcher, &meta, reader).await?,
            SessionStatus::Keep => core.handle_keep(&meta, reader).await?,
            SessionStatus::End => core.handle_end(&meta, reader).await?,
            SessionStatus::KeepAlive => core.discard(&meta, reader).await?,
        };
        core.metrics.record_frame_received(payload);
    }
    Ok(())
}

async fn handle_new<D: Dispatcher>(
    core: &Arc<WorkerCore>,
    dispatcher: &D,
    meta: &FrameMetadata,
    reader: &mut BoxedRead,
) -> Result<usize> {
    let id = meta.session_id;
    let destination = meta
        .target
        .clone()
        .ok_or_else(|| Error::invalid_frame("new frame without target"))?;

    // The first payload must leave the transport before anything else is read
    let first = if meta.has_data() {
        let mut buf = Buffer::new();
        read_payload(reader, &mut buf).await?;
        Some(buf)
    } else {
        None
    };
    let consumed = first.as_ref().map_or(0, Buffer::len);

    let conn = match dispatcher.dispatch(&destination).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(session_id = id, %destination, error = %e, "dispatch failed");
            core.metrics.increment_dispatch_failures();
            core.writer.send_end(id, true).await?;
            return Ok(consumed);
        }
    };

    if let Some(stale) = core.sessions.get(id) {
        debug!(session_id = id, "new frame replaces live session");
        stale.abort().await;
    }

    let (input, output) = tokio::io::split(conn);
    let session = Session::new(
        id,
        destination.network,
        Box::new(input),
        Box::new(output),
        &core.sessions,
    );
    if !core.sessions.add(Arc::clone(&session)) {
        session.abort().await;
        return Ok(consumed);
    }
    debug!(session_id = id, %destination, "session opened");

    if let Some(buf) = first {
        core.deliver(&session, &buf).await?;
        if session.is_closed() {
            return Ok(consumed);
        }
    }

    let writer = SessionWriter::response(id, core.writer.clone());
    let pump_core = Arc::clone(core);
    tokio::spawn(async move { pump_core.pump(session, writer, false).await });
    Ok(consumed)
}
