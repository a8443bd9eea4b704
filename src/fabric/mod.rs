//! # Fabric Adapter
//!
//! The wrapper around "the underlying reliable-datagram library"
//! (spec.md §2.1): endpoints, address vectors, memory registration,
//! completion queues, and the five verbs the rest of the crate is built
//! on (`send`, `send_with_immediate`, `recv`, `write_with_immediate`,
//! `read`). Every other component — scheduler excepted, which only deals
//! in byte ranges — talks to the network exclusively through
//! [`FabricProvider`].
//!
//! The one-time setup sequence named in spec.md §6
//! (`get_providers`/`open_fabric`/`open_domain`/`open_endpoint`/`open_av`/`open_cq`)
//! is discovery and resource-allocation detail specific to whichever
//! concrete fabric library is linked in; it is folded into
//! [`FabricProvider::open_endpoint`] here; spec.md §4's component design
//! only ever calls the per-message surface below, which this trait
//! exposes one-to-one.
//!
//! Two implementations ship in this crate:
//! - [`loopback::LoopbackFabric`] — always available, an in-process
//!   software fabric used by every test and by the demo binary.
//! - `verbs::VerbsFabric` — gated behind the `verbs` feature, a thin
//!   wrapper over real `libibverbs` reliable-datagram queue pairs via the
//!   `rdma-sys` crate, for deployment on actual RDMA-capable hosts.

pub mod loopback;
#[cfg(feature = "verbs")]
pub mod verbs;

use crate::error::TransportError;
use crate::wire::EndpointName;

/// Opaque per-provider endpoint handle.
pub type EndpointHandle = u64;
/// Opaque per-provider completion-queue handle.
pub type CqHandle = u64;
/// Opaque per-provider resolved remote address (an address-vector entry).
pub type AddressHandle = u64;

/// A registered memory region's key, used by the remote peer to target a
/// `write_with_immediate`/`read` at a buffer this endpoint owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrHandle(pub u64);

/// The memory kind a `reg_mr` call is registering (spec.md §6's
/// `reg_mr` signature). Host vs. GPU matters to the rest of the crate
/// only insofar as it gates whether a receive needs a flush afterward
/// (spec.md §4.8) — the fabric provider itself registers all three the
/// same way unless it has vendor-specific GPU-memory handling to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    Host,
    GpuVendor1,
    GpuVendor2,
}

/// `EAGAIN` is surfaced as data, never as a panic or a fused error type —
/// it is the routine signal that backpressures a post onto the
/// pending-request queue (spec.md §6, §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricError {
    Again,
    Fatal(TransportError),
}

impl From<TransportError> for FabricError {
    fn from(e: TransportError) -> Self {
        FabricError::Fatal(e)
    }
}

pub type FabricResult<T> = Result<T, FabricError>;

/// The class of operation a completion queue entry reports, used by the
/// progress engine's dispatch (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// Local completion of a `send`/`send_with_immediate`.
    Send,
    /// Local completion of a posted `recv` (an unsolicited arrival).
    Recv,
    /// Remote completion of a peer's `write_with_immediate` landing in
    /// our memory.
    RemoteWrite,
    /// Local completion of our own `write_with_immediate`.
    Write,
    /// Local completion of our own `read`.
    Read,
}

/// One successful completion-queue entry.
#[derive(Debug, Clone, Copy)]
pub struct CqEntry {
    /// Opaque context supplied at post time. Zero for `RemoteWrite`
    /// entries, which carry no context — the target request is located
    /// via `immediate_data` instead (spec.md §4.4).
    pub ctx: u64,
    pub kind: CompletionKind,
    pub len: usize,
    pub immediate_data: Option<u32>,
}

/// One failed completion-queue entry (from `cq_readerr`).
#[derive(Debug, Clone, Copy)]
pub struct CqError {
    pub ctx: u64,
    /// Present only for failed remote-write deliveries, which — like
    /// their successful counterpart — are located via immediate data
    /// rather than context (spec.md §4.4: "for remote-write errors the
    /// target request is located via the immediate data").
    pub immediate_data: Option<u32>,
    pub errno: i32,
    pub prov_errno: i32,
}

/// The fabric adapter surface every other component is built on.
pub trait FabricProvider: Send + Sync {
    /// One-time setup: open (fabric, domain, endpoint, address vector,
    /// completion queue) and return the endpoint handle. Each rail owns
    /// exactly one endpoint.
    fn open_endpoint(&self) -> Result<EndpointHandle, TransportError>;

    /// The completion queue bound to `ep` at `open_endpoint` time.
    fn cq_of(&self, ep: EndpointHandle) -> Result<CqHandle, TransportError>;

    /// This endpoint's address, to be handed to a remote peer and resolved
    /// there via [`FabricProvider::av_insert`].
    fn get_ep_name(&self, ep: EndpointHandle) -> Result<EndpointName, TransportError>;

    /// Resolve a remote peer's name into a local address usable as the
    /// `dest`/`src` argument of the verbs below.
    fn av_insert(&self, ep: EndpointHandle, name: &EndpointName) -> Result<AddressHandle, TransportError>;

    /// Register `len` bytes starting at `addr` for local and remote
    /// access. `addr` must remain valid and page-resident for the
    /// lifetime of the registration (spec.md §9: buffers backing a
    /// registration must be page-aligned).
    fn reg_mr(&self, ep: EndpointHandle, addr: usize, len: usize, mem_type: MemType) -> Result<MrHandle, TransportError>;

    fn dereg_mr(&self, ep: EndpointHandle, mr: MrHandle) -> Result<(), TransportError>;

    /// Whether this provider can source GPUDirect RDMA flushes for
    /// receives landing in GPU memory (spec.md §3/§8's `support_gdr`
    /// tri-state). Probed once per process and then fixed for the
    /// program's lifetime — see [`crate::endpoint::Endpoint::support_gdr`].
    fn supports_gdr(&self) -> bool;

    /// Two-sided send with no completion data on the receiver's CQ
    /// beyond the payload itself (used for CONN / CONN_RESP / CTRL).
    fn send(&self, ep: EndpointHandle, buf_addr: usize, buf_len: usize, mr: MrHandle, dest: AddressHandle, ctx: u64) -> FabricResult<()>;

    /// Two-sided send carrying 32 bits of immediate data, delivered to
    /// the receiver's CQ alongside the payload (used for eager messages).
    fn send_with_immediate(&self, ep: EndpointHandle, buf_addr: usize, buf_len: usize, mr: MrHandle, imm: u32, dest: AddressHandle, ctx: u64) -> FabricResult<()>;

    /// Post a receive buffer with `ANY_SRC` semantics — matches whichever
    /// send (with or without immediate data) arrives next.
    fn recv(&self, ep: EndpointHandle, buf_addr: usize, buf_len: usize, mr: MrHandle, ctx: u64) -> FabricResult<()>;

    /// One-sided write into the peer's registered buffer at
    /// `remote_addr`/`remote_key`, carrying 32 bits of immediate data
    /// delivered to the peer's CQ as a `RemoteWrite` completion.
    #[allow(clippy::too_many_arguments)]
    fn write_with_immediate(
        &self,
        ep: EndpointHandle,
        buf_addr: usize,
        buf_len: usize,
        mr: MrHandle,
        imm: u32,
        dest: AddressHandle,
        remote_addr: u64,
        remote_key: u64,
        ctx: u64,
    ) -> FabricResult<()>;

    /// One-sided read of `buf_len` bytes from the peer's registered
    /// buffer into local memory at `buf_addr`. No completion is delivered
    /// to the peer.
    #[allow(clippy::too_many_arguments)]
    fn read(
        &self,
        ep: EndpointHandle,
        buf_addr: usize,
        buf_len: usize,
        mr: MrHandle,
        dest: AddressHandle,
        remote_addr: u64,
        remote_key: u64,
        ctx: u64,
    ) -> FabricResult<()>;

    /// Drain up to `max` successful completions.
    fn cq_read(&self, cq: CqHandle, max: usize) -> Vec<CqEntry>;

    /// Drain the error queue.
    fn cq_readerr(&self, cq: CqHandle) -> Vec<CqError>;
}
