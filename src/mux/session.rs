//! Session registry for one transport connection.
//!
//! A [`Session`] is one logical flow multiplexed onto a transport. It holds
//! the two halves of the local (or upstream) connection it is piped to: the
//! write half is used by the transport read loop to deliver peer data, the
//! read half is taken by the pump task that frames local data. Closing a
//! session releases both halves and deregisters it from its
//! [`SessionManager`]; closing twice is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::metrics::MuxMetrics;
use crate::mux::frame::{SessionId, TargetNetwork};
use crate::mux::writer::BoxedWrite;

/// Boxed read half of a stream.
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Wait until a close flag flips to `true` (or its sender is gone).
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// One multiplexed flow.
pub struct Session {
    id: SessionId,
    network: TargetNetwork,
    input: Mutex<Option<BoxedRead>>,
    output: tokio::sync::Mutex<Option<BoxedWrite>>,
    closed: watch::Sender<bool>,
    parent: Weak<SessionManager>,
    metrics: Arc<MuxMetrics>,
}

impl Session {
    /// Build a session piped to `input`/`output`, owned by `parent`.
    ///
    /// The session is not registered; see [`SessionManager::add`].
    pub fn new(
        id: SessionId,
        network: TargetNetwork,
        input: BoxedRead,
        output: BoxedWrite,
        parent: &Arc<SessionManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            network,
            input: Mutex::new(Some(input)),
            output: tokio::sync::Mutex::new(Some(output)),
            closed: watch::channel(false).0,
            parent: Arc::downgrade(parent),
            metrics: Arc::clone(&parent.metrics),
        })
    }

    /// Get session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Get the network kind of the flow.
    pub fn network(&self) -> TargetNetwork {
        self.network
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Take the local read half. Only the pump task calls this, once.
    pub fn take_input(&self) -> Option<BoxedRead> {
        self.input.lock().take()
    }

    /// Deliver peer data to the local connection.
    ///
    /// A write blocked on a slow local reader is abandoned when the session
    /// closes.
    ///
    /// Failures are [`Error::Network`]: they end this session only.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut closed = self.closed.subscribe();
        let mut output = self.output.lock().await;
        let writer = output
            .as_mut()
            .ok_or_else(|| Error::Network(std::io::ErrorKind::BrokenPipe.into()))?;

        let res: std::io::Result<()> = tokio::select! {
            res = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => res,
            _ = signalled(&mut closed) => Err(std::io::ErrorKind::BrokenPipe.into()),
        };
        Ok(res?)
    }

    /// Resolve once the session is closed.
    pub async fn interrupted(&self) {
        signalled(&mut self.closed.subscribe()).await
    }

    /// Close gracefully: flush and shut down the local write half.
    ///
    /// Returns `false` if the session was already closed.
    pub async fn close(&self) -> bool {
        self.shutdown(true).await
    }

    /// Close abruptly: drop the local halves without a shutdown.
    ///
    /// Returns `false` if the session was already closed.
    pub async fn abort(&self) -> bool {
        self.shutdown(false).await
    }

    async fn shutdown(&self, graceful: bool) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }
        drop(self.take_input());
        if let Some(parent) = self.parent.upgrade() {
            parent.deregister(self);
        }

        if let Some(mut output) = self.output.lock().await.take() {
            if graceful {
                let _ = output.shutdown().await;
            }
        }
        self.metrics.increment_sessions_closed();
        tracing::debug!(session_id = self.id, graceful, "session closed");
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("network", &self.network)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct Registry {
    sessions: HashMap<SessionId, Arc<Session>>,
    next_id: SessionId,
    total: u64,
    closed: bool,
}

/// Owns every session of one transport connection.
pub struct SessionManager {
    registry: Mutex<Registry>,
    metrics: Arc<MuxMetrics>,
}

impl SessionManager {
    /// Create a new session manager with its own metrics.
    pub fn new() -> Arc<Self> {
        Self::with_metrics(Arc::new(MuxMetrics::new()))
    }

    /// Create a new session manager recording into `metrics`.
    pub fn with_metrics(metrics: Arc<MuxMetrics>) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry {
                sessions: HashMap::with_capacity(16),
                next_id: 0,
                total: 0,
                closed: false,
            }),
            metrics,
        })
    }

    /// Whether the manager is closed.
    pub fn is_closed(&self) -> bool {
        self.registry.lock().closed
    }

    /// Number of live sessions.
    pub fn size(&self) -> usize {
        self.registry.lock().sessions.len()
    }

    /// Number of sessions ever registered.
    pub fn count(&self) -> u64 {
        self.registry.lock().total
    }

    /// Register a new session with the next free id.
    ///
    /// Returns `None` once the manager is closed.
    pub fn allocate(
        self: &Arc<Self>,
        network: TargetNetwork,
        input: BoxedRead,
        output: BoxedWrite,
    ) -> Option<Arc<Session>> {
        let mut registry = self.registry.lock();
        let id = Self::next_id(&mut registry)?;
        Some(self.register(&mut registry, id, network, input, output))
    }

    /// Register a new session over both halves of `conn`.
    ///
    /// The connection is only split once an id is granted; a closed manager
    /// hands it back untouched.
    pub fn allocate_stream<S>(
        self: &Arc<Self>,
        network: TargetNetwork,
        conn: S,
    ) -> std::result::Result<Arc<Session>, S>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut registry = self.registry.lock();
        let Some(id) = Self::next_id(&mut registry) else {
            return Err(conn);
        };
        let (input, output) = tokio::io::split(conn);
        Ok(self.register(&mut registry, id, network, Box::new(input), Box::new(output)))
    }

    fn next_id(registry: &mut Registry) -> Option<SessionId> {
        if registry.closed || registry.sessions.len() > SessionId::MAX as usize {
            return None;
        }
        // Skip ids still held by live sessions after wraparound
        let mut id = registry.next_id.wrapping_add(1);
        while registry.sessions.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        registry.next_id = id;
        Some(id)
    }

    fn register(
        self: &Arc<Self>,
        registry: &mut Registry,
        id: SessionId,
        network: TargetNetwork,
        input: BoxedRead,
        output: BoxedWrite,
    ) -> Arc<Session> {
        let session = Session::new(id, network, input, output, self);
        registry.total += 1;
        registry.sessions.insert(id, Arc::clone(&session));
        self.metrics.increment_sessions_opened();
        session
    }

    /// Register a session whose id was chosen by the peer.
    ///
    /// Returns `false` without registering once the manager is closed.
    pub fn add(&self, session: Arc<Session>) -> bool {
        let mut registry = self.registry.lock();
        if registry.closed {
            return false;
        }
        registry.total += 1;
        registry.sessions.insert(session.id(), session);
        self.metrics.increment_sessions_opened();
        true
    }

    /// Look a session up.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        let registry = self.registry.lock();
        if registry.closed {
            return None;
        }
        registry.sessions.get(&id).cloned()
    }

    /// Deregister a session. No-op once closed.
    pub fn remove(&self, id: SessionId) {
        let mut registry = self.registry.lock();
        if registry.closed {
            return;
        }
        registry.sessions.remove(&id);
    }

    fn deregister(&self, session: &Session) {
        let mut registry = self.registry.lock();
        if registry.closed {
            return;
        }
        // The id may already belong to a replacement session
        let same = registry
            .sessions
            .get(&session.id())
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session));
        if same {
            registry.sessions.remove(&session.id());
        }
    }

    /// Mark the manager closed if, and only if, it holds no sessions.
    ///
    /// Returns `true` when the manager is (now) closed.
    pub fn close_if_no_session(&self) -> bool {
        let mut registry = self.registry.lock();
        if registry.closed {
            return true;
        }
        if !registry.sessions.is_empty() {
            return false;
        }
        registry.closed = true;
        true
    }

    /// Close the manager and every live session. Idempotent.
    pub async fn close(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut registry = self.registry.lock();
            if registry.closed && registry.sessions.is_empty() {
                return;
            }
            registry.closed = true;
            registry.sessions.drain().map(|(_, s)| s).collect()
        };

        for session in sessions {
            session.abort().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::AsyncReadExt;

    struct CountingWriter(Arc<AtomicUsize>);

    impl AsyncWrite for CountingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl Drop for CountingWriter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn halves() -> (BoxedRead, BoxedWrite) {
        (Box::new(tokio::io::empty()), Box::new(tokio::io::sink()))
    }

    fn allocate(manager: &Arc<SessionManager>) -> Option<Arc<Session>> {
        let (input, output) = halves();
        manager.allocate(TargetNetwork::Tcp, input, output)
    }

    #[test]
    fn test_allocate_increasing_ids() {
        let manager = SessionManager::new();
        let ids: Vec<_> = (0..10).map(|_| allocate(&manager).unwrap().id()).collect();

        assert_eq!(ids, (1..=10).collect::<Vec<u16>>());
        assert_eq!(manager.size(), 10);
        assert_eq!(manager.count(), 10);
    }

    #[test]
    fn test_allocate_skips_live_ids_after_wrap() {
        let manager = SessionManager::new();
        let first = allocate(&manager).unwrap();
        assert_eq!(first.id(), 1);

        manager.registry.lock().next_id = u16::MAX - 1;
        assert_eq!(allocate(&manager).unwrap().id(), u16::MAX);
        assert_eq!(allocate(&manager).unwrap().id(), 0);
        // 1 is still live
        assert_eq!(allocate(&manager).unwrap().id(), 2);
    }

    #[tokio::test]
    async fn test_closed_manager_rejects_everything() {
        let manager = SessionManager::new();
        let session = allocate(&manager).unwrap();
        manager.close().await;

        assert!(manager.is_closed());
        assert!(session.is_closed());
        assert!(allocate(&manager).is_none());
        assert!(manager.get(session.id()).is_none());

        let (input, output) = halves();
        let late = Session::new(77, TargetNetwork::Tcp, input, output, &manager);
        assert!(!manager.add(late));
        assert!(manager.get(77).is_none());
        assert_eq!(manager.size(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let manager = SessionManager::new();
        let drops = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let output: BoxedWrite = Box::new(CountingWriter(Arc::clone(&drops)));
            manager
                .allocate(TargetNetwork::Tcp, Box::new(tokio::io::empty()), output)
                .unwrap();
        }

        manager.close().await;
        manager.close().await;
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_session_close_deregisters_once() {
        let manager = SessionManager::new();
        let drops = Arc::new(AtomicUsize::new(0));
        let output: BoxedWrite = Box::new(CountingWriter(Arc::clone(&drops)));
        let session = manager
            .allocate(TargetNetwork::Udp, Box::new(tokio::io::empty()), output)
            .unwrap();
        assert_eq!(session.network(), TargetNetwork::Udp);

        assert!(session.close().await);
        assert!(!session.close().await);
        assert!(!session.abort().await);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(manager.get(session.id()).is_none());
        assert_eq!(manager.size(), 0);
        assert_eq!(manager.count(), 1);

        // Closing the manager afterwards must not touch the session again
        manager.close().await;
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_of_replaced_session_keeps_replacement() {
        let manager = SessionManager::new();
        let (input, output) = halves();
        let stale = Session::new(5, TargetNetwork::Tcp, input, output, &manager);
        assert!(manager.add(Arc::clone(&stale)));

        let (input, output) = halves();
        let fresh = Session::new(5, TargetNetwork::Tcp, input, output, &manager);
        assert!(manager.add(Arc::clone(&fresh)));

        stale.close().await;
        let found = manager.get(5).unwrap();
        assert!(Arc::ptr_eq(&found, &fresh));
    }

    #[test]
    fn test_close_if_no_session() {
        let manager = SessionManager::new();
        let session = allocate(&manager).unwrap();
        assert!(!manager.close_if_no_session());
        assert!(!manager.is_closed());

        manager.remove(session.id());
        assert!(manager.close_if_no_session());
        assert!(manager.is_closed());
        assert!(manager.close_if_no_session());
        assert!(allocate(&manager).is_none());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let manager = SessionManager::new();
        let session = allocate(&manager).unwrap();
        session.write(b"ok").await.unwrap();

        session.close().await;
        let err = session.write(b"late").await.unwrap_err();
        assert!(matches!(err, Error::Network(ref e) if e.kind() == std::io::ErrorKind::BrokenPipe));
        assert!(!err.is_fatal());
        assert!(session.take_input().is_none());
    }

    #[tokio::test]
    async fn test_interrupted_wakes_on_close() {
        let manager = SessionManager::new();
        let session = allocate(&manager).unwrap();

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.interrupted().await })
        };
        tokio::task::yield_now().await;
        session.close().await;

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // Already closed: resolves immediately
        session.interrupted().await;
    }

    #[tokio::test]
    async fn test_allocate_stream_returns_conn_when_closed() {
        let manager = SessionManager::new();
        let (conn, _peer) = tokio::io::duplex(64);
        let session = manager.allocate_stream(TargetNetwork::Tcp, conn).unwrap();
        assert_eq!(session.id(), 1);

        manager.close().await;
        let (conn, _peer) = tokio::io::duplex(64);
        assert!(manager.allocate_stream(TargetNetwork::Tcp, conn).is_err());
    }

    #[tokio::test]
    async fn test_blocked_write_is_abandoned_on_close() {
        let manager = SessionManager::new();
        let (conn, mut peer) = tokio::io::duplex(4);
        let session = manager.allocate_stream(TargetNetwork::Tcp, conn).unwrap();

        let writer = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.write(&[1u8; 64]).await })
        };
        tokio::task::yield_now().await;
        session.abort().await;

        let err = writer.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Network(ref e) if e.kind() == std::io::ErrorKind::BrokenPipe));

        // Local end sees whatever fit, then EOF
        let mut seen = Vec::new();
        peer.read_to_end(&mut seen).await.unwrap();
        assert!(seen.len() <= 4);
    }
}
