//! # tcpover
//!
//! Multiplexes many TCP/UDP flows over one duplex transport (a raw TCP socket
//! or any other ordered byte stream).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  ClientPool (spreads sessions over several transports)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  ClientWorker  ◀══ transport ══▶  ServerWorker          │
//! ├─────────────────────────────────────────────────────────┤
//! │  SessionManager / Session (per-flow state and teardown) │
//! ├─────────────────────────────────────────────────────────┤
//! │  Frame codec + serialized frame writer                  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Buffer pool                                            │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire format
//!
//! Every frame is a length-prefixed metadata block (session id, status,
//! options, and for New frames the destination), optionally followed by a
//! length-prefixed payload. See [`mux::frame`].
//!
//! ## Failure model
//!
//! Session-scoped errors (a failed dial, a broken local connection) end that
//! session with an End frame and leave the transport alone. Transport-scoped
//! errors (a malformed frame, a failed transport write) close the worker and
//! every session on it. See [`Error::is_fatal`].

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod mux;

pub use error::{Error, Result};
pub use metrics::{MetricsSnapshot, MuxMetrics};
pub use mux::{
    ClientPool, ClientStrategy, ClientWorker, Destination, DirectDispatcher, Dispatcher,
    EchoDispatcher, PoolConfig, ServerWorker, TargetNetwork,
};
