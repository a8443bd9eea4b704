//! # RDMA Rail Transport
//!
//! A multi-rail RDMA transport core for collective-communications
//! libraries: eager sends, rendezvous writes striped across an
//! endpoint's rails, and the connection handshake and completion-queue
//! progress engine that drive them. The crate has no entry point of its
//! own — it is a library meant to sit behind the thin plugin shim that
//! adapts [`FabricProvider`](fabric::FabricProvider) calls to a real
//! fabric library (or, for development and testing, to
//! [`fabric::loopback::LoopbackFabric`]).
//!
//! Module map:
//! - [`config`] — environment-driven [`RdmaConfig`](config::RdmaConfig).
//! - [`error`] — the crate-wide [`TransportError`](error::TransportError).
//! - [`fabric`] — the [`FabricProvider`](fabric::FabricProvider) adapter
//!   trait and its loopback/verbs implementations.
//! - [`wire`] — CONN/CONN_RESP/CTRL message layouts and the RDMA-write
//!   immediate-data encoding.
//! - [`scheduler`] — splits a message into per-rail transfer segments.
//! - [`message_buffer`] — the sliding window reconciling unordered
//!   CTRL/EAGER arrivals against local posts.
//! - [`bounce`] — pre-registered receive slots for unsolicited arrivals.
//! - [`request`] — the polymorphic request object.
//! - [`freelist`], [`ids`], [`pending`] — the pool/allocator/queue
//!   primitives the rest of the crate is built on.
//! - [`comm`] — the three communicator flavors.
//! - [`endpoint`] — [`Device`](endpoint::Device) and its lazily created,
//!   per-thread [`Endpoint`](endpoint::Endpoint).
//! - [`handshake`] — `listen`/`connect`/`accept`.
//! - [`progress`] — the CQ/pending-queue drain every operation runs.
//! - [`protocol`] — `send`/`irecv`/`test`/`iflush`.
//! - [`api`] — `reg_mr`/`dereg_mr`/`close_{send,recv,listen}`.
//! - [`logging`] — the `tracing` subscriber installed by binaries, never
//!   by library code.

pub mod api;
pub mod bounce;
pub mod comm;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fabric;
pub mod freelist;
pub mod handshake;
pub mod ids;
pub mod logging;
pub mod message_buffer;
pub mod pending;
pub mod progress;
pub mod protocol;
pub mod request;
pub mod scheduler;
pub mod wire;

pub use config::RdmaConfig;
pub use endpoint::{Device, Endpoint};
pub use error::TransportError;
pub use fabric::FabricProvider;
pub use request::{Request, RequestKind};

/// The current version of this transport core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
