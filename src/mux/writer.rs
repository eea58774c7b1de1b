//! Frame writers.
//!
//! [`FrameWriter`] owns the write half of a transport. Every frame is written
//! while holding one lock, so metadata and payload of one frame are never
//! interleaved with another session's frame. [`SessionWriter`] frames the
//! byte stream of a single session on top of it.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::metrics::MuxMetrics;
use crate::mux::buf::Buffer;
use crate::mux::frame::{
    write_payload_len, Destination, FrameMetadata, FrameOption, SessionId, MAX_CHUNK,
};

/// Boxed write half of a stream.
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Serialized writer over the shared transport.
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<Option<BoxedWrite>>>,
    metrics: Arc<MuxMetrics>,
}

impl FrameWriter {
    /// Wrap the write half of a transport.
    pub fn new(writer: BoxedWrite, metrics: Arc<MuxMetrics>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(writer))),
            metrics,
        }
    }

    /// Write one frame atomically with respect to other writers.
    ///
    /// A payload is attached (and the Data option set) when `payload` is
    /// `Some`. Errors are transport errors and are fatal for the connection.
    pub async fn write_frame(&self, meta: &FrameMetadata, payload: Option<&[u8]>) -> Result<()> {
        let mut header = Buffer::with_capacity(crate::mux::buf::MIN_POOL_SIZE);
        match payload {
            Some(data) => {
                let mut meta = meta.clone();
                meta.option.insert(FrameOption::DATA);
                meta.write_to(&mut header)?;
                write_payload_len(&mut header, data)?;
            }
            None => meta.write_to(&mut header)?,
        }

        let mut guard = self.inner.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Transport(std::io::ErrorKind::NotConnected.into()))?;

        writer
            .write_all(header.bytes())
            .await
            .map_err(Error::Transport)?;
        if let Some(data) = payload {
            writer.write_all(data).await.map_err(Error::Transport)?;
        }
        writer.flush().await.map_err(Error::Transport)?;
        drop(guard);

        let sent = payload.map_or(0, <[u8]>::len);
        self.metrics.record_frame_sent(sent);
        Ok(())
    }

    /// Tell the peer a session is gone.
    pub async fn send_end(&self, session_id: SessionId, error: bool) -> Result<()> {
        self.write_frame(&FrameMetadata::end(session_id, error), None)
            .await
    }

    /// Shut the transport write half down. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(mut writer) = self.inner.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Whether the write half has been shut down.
    pub async fn is_shutdown(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

/// Frames the bytes of one session onto the transport.
///
/// The first frame written by a requesting writer is New and carries the
/// destination; every later frame is Keep.
pub struct SessionWriter {
    id: SessionId,
    target: Option<Destination>,
    transport: FrameWriter,
    followup: bool,
}

impl SessionWriter {
    /// Writer for a locally originated session.
    pub fn new(id: SessionId, destination: Destination, transport: FrameWriter) -> Self {
        Self {
            id,
            target: Some(destination),
            transport,
            followup: false,
        }
    }

    /// Writer for the response direction of a peer-originated session.
    pub fn response(id: SessionId, transport: FrameWriter) -> Self {
        Self {
            id,
            target: None,
            transport,
            followup: true,
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    fn next_meta(&mut self) -> FrameMetadata {
        if self.followup {
            return FrameMetadata::keep(self.id);
        }
        self.followup = true;
        match self.target.clone() {
            Some(target) => FrameMetadata::new_session(self.id, target),
            None => FrameMetadata::keep(self.id),
        }
    }

    /// Frame `data`.
    ///
    /// Empty data produces a metadata-only frame, which is how a New frame is
    /// announced before any payload. Larger data is split into chunks that fit
    /// a frame's payload length field.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            let meta = self.next_meta();
            return self.transport.write_frame(&meta, None).await;
        }
        for chunk in data.chunks(MAX_CHUNK) {
            let meta = self.next_meta();
            self.transport.write_frame(&meta, Some(chunk)).await?;
        }
        Ok(())
    }

    /// Send the End frame, marking an abnormal end when `error` is set.
    pub async fn close(self, error: bool) -> Result<()> {
        self.transport.send_end(self.id, error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::frame::{Frame, SessionStatus};

    fn pipe() -> (FrameWriter, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (FrameWriter::new(Box::new(a), Arc::new(MuxMetrics::new())), b)
    }

    #[tokio::test]
    async fn test_session_writer_new_then_keep() {
        let (transport, mut peer) = pipe();
        let mut writer = SessionWriter::new(5, Destination::tcp("127.0.0.1:80"), transport);

        writer.write(&[]).await.unwrap();
        writer.write(b"abc").await.unwrap();
        writer.close(false).await.unwrap();

        let first = Frame::read_from(&mut peer).await.unwrap().unwrap();
        assert_eq!(first.meta, FrameMetadata::new_session(5, Destination::tcp("127.0.0.1:80")));
        assert!(first.payload.is_none());

        let second = Frame::read_from(&mut peer).await.unwrap().unwrap();
        assert_eq!(second.meta.status, SessionStatus::Keep);
        assert_eq!(second.payload.as_deref(), Some(&b"abc"[..]));

        let third = Frame::read_from(&mut peer).await.unwrap().unwrap();
        assert_eq!(third.meta, FrameMetadata::end(5, false));
    }

    #[tokio::test]
    async fn test_response_writer_starts_with_keep() {
        let (transport, mut peer) = pipe();
        let mut writer = SessionWriter::response(9, transport);
        writer.write(b"x").await.unwrap();
        writer.close(true).await.unwrap();

        let first = Frame::read_from(&mut peer).await.unwrap().unwrap();
        assert_eq!(first.meta.status, SessionStatus::Keep);
        let end = Frame::read_from(&mut peer).await.unwrap().unwrap();
        assert!(end.meta.has_error());
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        let (transport, mut peer) = pipe();
        let mut writer = SessionWriter::response(1, transport);
        let data = vec![0x5Au8; MAX_CHUNK + 10];
        writer.write(&data).await.unwrap();

        let a = Frame::read_from(&mut peer).await.unwrap().unwrap();
        let b = Frame::read_from(&mut peer).await.unwrap().unwrap();
        assert_eq!(a.payload.unwrap().len(), MAX_CHUNK);
        assert_eq!(b.payload.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_interleave() {
        let (transport, mut peer) = pipe();

        let mut handles = Vec::new();
        for id in 1..=8u16 {
            let transport = transport.clone();
            handles.push(tokio::spawn(async move {
                let mut writer = SessionWriter::response(id, transport);
                for _ in 0..20 {
                    writer.write(&vec![id as u8; 1000]).await.unwrap();
                }
            }));
        }

        let reader = tokio::spawn(async move {
            let mut frames = 0;
            while frames < 160 {
                let frame = Frame::read_from(&mut peer).await.unwrap().unwrap();
                let payload = frame.payload.unwrap();
                assert!(payload.iter().all(|b| *b == frame.meta.session_id as u8));
                frames += 1;
            }
        });

        for h in handles {
            h.await.unwrap();
        }
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_after_shutdown_is_fatal() {
        let (transport, _peer) = pipe();
        transport.shutdown().await;
        transport.shutdown().await;
        assert!(transport.is_shutdown().await);

        let err = transport.send_end(1, false).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
