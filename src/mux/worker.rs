//! Demultiplexing shared by both worker roles.
//!
//! A worker owns one transport connection: a single read loop decodes frames
//! and routes them to sessions, while one pump task per session frames local
//! bytes back onto the transport. [`WorkerCore`] holds the pieces both roles
//! have in common; the role-specific loops live in `client` and `server`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics::MuxMetrics;
use crate::mux::buf::Buffer;
use crate::mux::frame::{discard_payload, read_payload, FrameMetadata};
use crate::mux::session::{signalled, BoxedRead, Session, SessionManager};
use crate::mux::writer::{FrameWriter, SessionWriter};

/// Why a pump task stopped.
enum PumpEnd {
    /// Local side reached end of stream
    Eof,
    /// Reading the local side failed
    LocalError,
    /// Closed by someone else, usually a peer End
    Interrupted,
    /// Writing to the transport failed
    Transport(Error),
}

pub(crate) struct WorkerCore {
    pub(crate) role: &'static str,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) writer: FrameWriter,
    pub(crate) metrics: Arc<MuxMetrics>,
    buffer_size: usize,
    closing: AtomicBool,
    done: watch::Sender<bool>,
}

impl WorkerCore {
    /// Split `transport` and build the core. Returns the read half for the
    /// role's read loop.
    pub(crate) fn new<T>(
        role: &'static str,
        transport: T,
        metrics: Arc<MuxMetrics>,
        buffer_size: usize,
    ) -> (Arc<Self>, BoxedRead)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(transport);
        let core = Arc::new(Self {
            role,
            sessions: SessionManager::with_metrics(Arc::clone(&metrics)),
            writer: FrameWriter::new(Box::new(writer), Arc::clone(&metrics)),
            metrics,
            buffer_size,
            closing: AtomicBool::new(false),
            done: watch::channel(false).0,
        });
        (core, Box::new(BufReader::new(reader)))
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.done.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    pub(crate) async fn wait_closed(&self) {
        signalled(&mut self.done.subscribe()).await
    }

    /// Tear the worker down: every session, then the transport. Idempotent.
    ///
    /// The worker only reports closed once both are released.
    pub(crate) async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sessions.close().await;
        self.writer.shutdown().await;
        self.done.send_replace(true);
        info!(role = self.role, "worker closed");
    }

    /// Read the next frame header, or `None` once the transport ended cleanly
    /// or the worker was closed.
    pub(crate) async fn next_frame(
        &self,
        reader: &mut BoxedRead,
        done: &mut watch::Receiver<bool>,
    ) -> Result<Option<FrameMetadata>> {
        tokio::select! {
            biased;
            _ = signalled(done) => Ok(None),
            meta = FrameMetadata::read_from(reader) => meta,
        }
    }

    /// Record how the read loop ended and close the worker.
    pub(crate) async fn finish(&self, result: Result<()>) {
        match result {
            Ok(()) => debug!(role = self.role, "transport read loop ended"),
            Err(e) => {
                if e.is_decode_error() {
                    self.metrics.increment_decode_errors();
                }
                warn!(role = self.role, error = %e, "transport failed");
            }
        }
        self.shutdown().await;
    }

    /// Drain the payload of a frame nobody consumes.
    pub(crate) async fn discard(&self, meta: &FrameMetadata, reader: &mut BoxedRead) -> Result<usize> {
        if meta.has_data() {
            discard_payload(reader).await
        } else {
            Ok(0)
        }
    }

    /// Deliver a Keep frame to its session.
    ///
    /// An unknown session is told to end; a failed local write ends the
    /// session with the Error option.
    pub(crate) async fn handle_keep(
        &self,
        meta: &FrameMetadata,
        reader: &mut BoxedRead,
    ) -> Result<usize> {
        let Some(session) = self.sessions.get(meta.session_id) else {
            debug!(role = self.role, session_id = meta.session_id, "keep for unknown session");
            self.writer.send_end(meta.session_id, false).await?;
            return self.discard(meta, reader).await;
        };
        if !meta.has_data() {
            return Ok(0);
        }

        let mut buf = Buffer::with_capacity(self.buffer_size);
        read_payload(reader, &mut buf).await?;
        let len = buf.len();
        self.deliver(&session, &buf).await?;
        Ok(len)
    }

    /// Write peer data into a session's local side; on failure abort it and
    /// report End(Error) to the peer.
    pub(crate) async fn deliver(&self, session: &Session, buf: &Buffer) -> Result<()> {
        if let Err(e) = session.write(buf.bytes()).await {
            debug!(role = self.role, session_id = session.id(), error = %e, "local write failed");
            if session.abort().await {
                self.writer.send_end(session.id(), true).await?;
            }
        }
        Ok(())
    }

    /// Close the session named by an End frame.
    pub(crate) async fn handle_end(
        &self,
        meta: &FrameMetadata,
        reader: &mut BoxedRead,
    ) -> Result<usize> {
        if let Some(session) = self.sessions.get(meta.session_id) {
            if meta.has_error() {
                session.abort().await;
            } else {
                session.close().await;
            }
        }
        self.discard(meta, reader).await
    }

    /// Copy the session's local input onto the transport until it ends.
    ///
    /// When `announce` is set a metadata-only New frame goes out before the
    /// first local read.
    pub(crate) async fn pump(&self, session: Arc<Session>, mut writer: SessionWriter, announce: bool) {
        let Some(mut input) = session.take_input() else {
            return;
        };
        let mut buf = Buffer::with_capacity(self.buffer_size);

        let end = 'pump: {
            if announce {
                if let Err(e) = writer.write(&[]).await {
                    break 'pump PumpEnd::Transport(e);
                }
            }

            loop {
                buf.clear();
                let read = tokio::select! {
                    res = buf.read_from(&mut input) => res,
                    _ = session.interrupted() => break PumpEnd::Interrupted,
                };
                match read {
                    Ok(0) => break PumpEnd::Eof,
                    Ok(_) => {
                        if let Err(e) = writer.write(buf.bytes()).await {
                            break PumpEnd::Transport(e);
                        }
                    }
                    Err(e) => {
                        debug!(role = self.role, session_id = session.id(), error = %e, "local read failed");
                        break PumpEnd::LocalError;
                    }
                }
            }
        };
        drop(input);

        match end {
            PumpEnd::Interrupted => {}
            PumpEnd::Eof | PumpEnd::LocalError => {
                let error = matches!(end, PumpEnd::LocalError);
                if session.close().await {
                    if let Err(e) = writer.close(error).await {
                        warn!(role = self.role, error = %e, "transport failed");
                        self.shutdown().await;
                    }
                }
            }
            PumpEnd::Transport(e) => {
                warn!(role = self.role, session_id = session.id(), error = %e, "transport failed");
                self.shutdown().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::frame::{Destination, Frame, SessionStatus, TargetNetwork};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn core() -> (Arc<WorkerCore>, BoxedRead, DuplexStream) {
        let (transport, peer) = tokio::io::duplex(256 * 1024);
        let (core, reader) = WorkerCore::new("test", transport, Arc::new(MuxMetrics::new()), 8192);
        (core, reader, peer)
    }

    #[tokio::test]
    async fn test_keep_for_unknown_session_sends_one_end() {
        let (core, _reader, mut peer) = core();

        let bytes = Frame::with_payload(FrameMetadata::keep(42), &b"orphan"[..])
            .encode()
            .unwrap();
        let mut src: BoxedRead = Box::new(std::io::Cursor::new(bytes));
        let meta = FrameMetadata::read_from(&mut src).await.unwrap().unwrap();

        assert_eq!(core.handle_keep(&meta, &mut src).await.unwrap(), 6);
        core.writer.shutdown().await;

        let end = Frame::read_from(&mut peer).await.unwrap().unwrap();
        assert_eq!(end.meta, FrameMetadata::end(42, false));
        assert!(Frame::read_from(&mut peer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keep_delivers_to_session() {
        let (core, _reader, _peer) = core();
        let (local, mut user) = tokio::io::duplex(1024);
        let session = core
            .sessions
            .allocate_stream(TargetNetwork::Tcp, local)
            .unwrap();

        let bytes = Frame::with_payload(FrameMetadata::keep(session.id()), &b"hello"[..])
            .encode()
            .unwrap();
        let mut src: BoxedRead = Box::new(std::io::Cursor::new(bytes));
        let meta = FrameMetadata::read_from(&mut src).await.unwrap().unwrap();
        core.handle_keep(&meta, &mut src).await.unwrap();

        let mut got = [0u8; 5];
        user.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");
    }

    #[tokio::test]
    async fn test_end_with_error_aborts_session() {
        let (core, _reader, _peer) = core();
        let (local, _user) = tokio::io::duplex(1024);
        let session = core
            .sessions
            .allocate_stream(TargetNetwork::Tcp, local)
            .unwrap();

        let mut src: BoxedRead = Box::new(tokio::io::empty());
        core.handle_end(&FrameMetadata::end(session.id(), true), &mut src)
            .await
            .unwrap();
        assert!(session.is_closed());
        assert_eq!(core.sessions.size(), 0);
    }

    #[tokio::test]
    async fn test_pump_announces_then_ends() {
        let (core, _reader, mut peer) = core();
        let (local, mut user) = tokio::io::duplex(1024);
        let session = core
            .sessions
            .allocate_stream(TargetNetwork::Tcp, local)
            .unwrap();
        let writer = SessionWriter::new(
            session.id(),
            Destination::tcp("127.0.0.1:9000"),
            core.writer.clone(),
        );

        user.write_all(b"ping").await.unwrap();
        let pump = {
            let core = Arc::clone(&core);
            let session = Arc::clone(&session);
            tokio::spawn(async move { core.pump(session, writer, true).await })
        };

        let first = Frame::read_from(&mut peer).await.unwrap().unwrap();
        assert_eq!(
            first.meta,
            FrameMetadata::new_session(session.id(), Destination::tcp("127.0.0.1:9000"))
        );
        assert!(first.payload.is_none());

        let data = Frame::read_from(&mut peer).await.unwrap().unwrap();
        assert_eq!(data.meta.status, SessionStatus::Keep);
        assert_eq!(data.payload.as_deref(), Some(&b"ping"[..]));

        user.shutdown().await.unwrap();
        drop(user);
        pump.await.unwrap();

        let end = Frame::read_from(&mut peer).await.unwrap().unwrap();
        assert_eq!(end.meta, FrameMetadata::end(session.id(), false));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_pump_stops_silently_when_interrupted() {
        let (core, _reader, mut peer) = core();
        let (local, _user) = tokio::io::duplex(1024);
        let session = core
            .sessions
            .allocate_stream(TargetNetwork::Tcp, local)
            .unwrap();
        let writer = SessionWriter::response(session.id(), core.writer.clone());

        let pump = {
            let core = Arc::clone(&core);
            let session = Arc::clone(&session);
            tokio::spawn(async move { core.pump(session, writer, false).await })
        };
        tokio::task::yield_now().await;
        session.close().await;
        pump.await.unwrap();

        core.writer.shutdown().await;
        assert!(Frame::read_from(&mut peer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (core, mut reader, _peer) = core();
        let (local, _user) = tokio::io::duplex(64);
        let session = core
            .sessions
            .allocate_stream(TargetNetwork::Tcp, local)
            .unwrap();

        core.shutdown().await;
        core.shutdown().await;
        core.wait_closed().await;
        assert!(core.is_closed());
        assert!(session.is_closed());
        assert!(core.sessions.is_closed());

        let mut done = core.subscribe();
        assert!(core.next_frame(&mut reader, &mut done).await.unwrap().is_none());
    }
}
