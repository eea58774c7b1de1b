//! Session multiplexing over a single transport.
//!
//! Many logical TCP/UDP flows share one ordered duplex byte stream. The
//! client side ([`ClientWorker`], usually through a [`ClientPool`]) assigns
//! each local connection a session id and frames its bytes; the server side
//! ([`ServerWorker`]) opens the requested upstream through a [`Dispatcher`]
//! and relays the response the same way.
//!
//! ```text
//! local conn ─▶ ClientWorker ══ transport ══ ServerWorker ─▶ upstream
//!            ◀─  (session 1..n, one frame writer, one read loop)  ◀─
//! ```

pub mod buf;
pub mod client;
pub mod dispatcher;
pub mod frame;
pub mod pool;
pub mod server;
pub mod session;
mod worker;
pub mod writer;

pub use buf::{Buffer, BufferPool};
pub use client::{ClientStrategy, ClientWorker, WorkerState};
pub use dispatcher::{AsyncStream, BoxedConn, DirectDispatcher, Dispatcher, EchoDispatcher, UdpConn};
pub use frame::{
    Destination, Frame, FrameMetadata, FrameOption, SessionId, SessionStatus, TargetNetwork,
};
pub use pool::{ClientPool, Connector, PoolConfig, RetryPolicy, TcpConnector};
pub use server::ServerWorker;
pub use session::{BoxedRead, Session, SessionManager};
pub use writer::{BoxedWrite, FrameWriter, SessionWriter};
