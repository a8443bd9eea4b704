//! # Request Model
//!
//! The polymorphic request object named in spec.md §2/§3: tagged with one
//! of the kinds below, carrying a state/completion-count/size triple under
//! its own lock, and linked to related requests — a RECV's SEND_CTRL and
//! RECV_SEGMS sub-requests, a bounce request's backing slot — by plain
//! indices into the owning [`crate::freelist::FreeList`] rather than
//! pointers, per spec.md §9 ("use indices into a pool rather than pointer
//! cycles"). Rust's ownership rules make a pointer cycle awkward to
//! express safely in the first place, which is the same reason the
//! teacher's code favors handles/ids over raw references wherever a graph
//! of mutable state needs to outlive any one stack frame.

use parking_lot::Mutex;

use crate::error::TransportError;
use crate::fabric::MrHandle;
use crate::scheduler::Schedule;
use crate::wire::CtrlMessage;

/// Placeholder `total_compls` for a `RecvSegms` request at creation time:
/// the sender's schedule (hence the real segment count) isn't known
/// until the first segment's immediate data arrives. [`Request::record_segment`]
/// overwrites it with the real value on that first arrival.
pub const UNKNOWN_TOTAL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Send,
    Recv,
    SendCtrl,
    RecvSegms,
    EagerCopy,
    Flush,
    Bounce,
    SendConn,
    RecvConn,
    SendConnResp,
    RecvConnResp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Created,
    Pending,
    Completed,
    Error(TransportError),
}

/// The mutable triple spec.md §3 calls out as guarded by "the request's
/// own lock": status, accumulated completion count, and accumulated byte
/// size.
#[derive(Debug)]
struct State {
    status: Status,
    ncompls: u32,
    total_compls: u32,
    size: usize,
}

/// One request-pool entry. `parent` links a sub-request (SEND_CTRL,
/// RECV_SEGMS, EAGER_COPY) back to the RECV that owns it, by index into
/// the same pool; completing a sub-request bubbles one completion up to
/// its parent (spec.md §4.7: "chain them so sub-request completion
/// propagates").
pub struct Request {
    pub kind: RequestKind,
    pub comm_id: u32,
    pub seq: u16,
    pub parent: Option<usize>,
    pub schedule: Mutex<Option<Schedule>>,
    /// True while linked into the pending-request queue; the queue's own
    /// sole source of truth for membership (spec.md §9, "attempts to
    /// enqueue the same request twice must be prevented").
    pub queued: std::sync::atomic::AtomicBool,
    /// A SEND request created before its matching CTRL arrived (spec.md
    /// §4.6 step 1, `have_ctrl == false`) stages its data pointer here so
    /// the progress engine can resume posting once the CTRL shows up
    /// (step 5's race case). `None` once the write schedule has started.
    pub staged_send: Mutex<Option<StagedSend>>,
    /// For a `Send` request only, once posting has actually started
    /// (`have_ctrl || eager` at step 6, or the CTRL race-closure arrival
    /// resolving a staged send): everything the progress engine's
    /// pending-queue retry needs to resume the post without re-deriving
    /// it from the communicator (spec.md §4.6, "the schedule tracks
    /// `xferred_rail_id` so that partial success followed by `EAGAIN`
    /// resumes on the right rail").
    pub send_ctx: Mutex<Option<SendContext>>,
    /// For a `RecvSegms` request only: `(expected, seen)` segment counts.
    /// `expected` is learned from the first arriving segment's immediate
    /// data (spec.md §4.4, "locate the target receive request ... check
    /// whether all segments arrived") and is unknown before that.
    pub segments: Mutex<Option<(u8, u8)>>,
    /// For a `RecvSegms` request only: the user's destination
    /// `(addr, len)`. RDMA-writes land here directly and need no copy;
    /// it is read only when an EAGER payload arrives after the matching
    /// `irecv` was already posted, so the progress engine has somewhere
    /// to copy it.
    pub recv_dest: Mutex<Option<(usize, usize)>>,
    /// Sub-request pool indices owned by a `Recv` parent (its `SEND_CTRL`
    /// and `RECV_SEGMS` children), freed alongside it once `test` observes
    /// a terminal state (spec.md §3, request lifecycle).
    pub children: Mutex<Vec<usize>>,
    /// For a `Flush` request only: the read's arguments, kept around so a
    /// pending-queue retry can reissue the exact same `fabric.read` call
    /// that hit `EAGAIN` on its first attempt.
    pub flush_ctx: Mutex<Option<FlushContext>>,
    state: Mutex<State>,
}

/// What a `Flush` request needs to (re)issue its flush read.
#[derive(Debug, Clone, Copy)]
pub struct FlushContext {
    pub local_addr: usize,
    pub local_len: usize,
    pub local_mr: MrHandle,
    pub remote_addr: u64,
    pub remote_key: u64,
}

/// A SEND request's data, staged until the matching CTRL arrives.
#[derive(Debug, Clone, Copy)]
pub struct StagedSend {
    pub data_addr: usize,
    pub data_len: usize,
    pub mr: MrHandle,
}

/// What a SEND request needs to (re)post its remaining segments: the
/// immediate-data identity of the message, the local data pointer, and —
/// for rendezvous — the peer's buffer coordinates. `eager == true` means
/// `ctrl` is only ever `None`; a rendezvous send always carries one.
#[derive(Debug, Clone)]
pub struct SendContext {
    pub wire_comm_id: u32,
    pub data_addr: usize,
    pub mr: MrHandle,
    pub eager: bool,
    pub ctrl: Option<CtrlMessage>,
}

impl Request {
    pub fn new(kind: RequestKind, comm_id: u32, seq: u16, total_compls: u32, parent: Option<usize>) -> Self {
        Self {
            kind,
            comm_id,
            seq,
            parent,
            schedule: Mutex::new(None),
            queued: std::sync::atomic::AtomicBool::new(false),
            staged_send: Mutex::new(None),
            send_ctx: Mutex::new(None),
            segments: Mutex::new(None),
            recv_dest: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            flush_ctx: Mutex::new(None),
            state: Mutex::new(State {
                status: Status::Created,
                ncompls: 0,
                total_compls,
                size: 0,
            }),
        }
    }

    pub fn mark_pending(&self) {
        let mut state = self.state.lock();
        if state.status == Status::Created {
            state.status = Status::Pending;
        }
    }

    /// Record one completion of `bytes` bytes. Returns `true` if this
    /// completion brought the request to `Completed`.
    pub fn record_completion(&self, bytes: usize) -> bool {
        let mut state = self.state.lock();
        state.ncompls += 1;
        state.size += bytes;
        if state.ncompls >= state.total_compls {
            state.status = Status::Completed;
            true
        } else {
            false
        }
    }

    /// Record one arrived segment on a `RecvSegms` request. `expected` is
    /// taken from the arriving completion's immediate data and fixed on
    /// the first call (which also fixes `total_compls`, since a
    /// `RecvSegms` request is created not knowing how many segments the
    /// sender's own schedule will produce — see [`RequestKind::RecvSegms`]'s
    /// `UNKNOWN_TOTAL` sentinel); later calls ignore a mismatched
    /// `expected` since all segments of one message share the same
    /// schedule. Returns `true` once every expected segment has arrived.
    pub fn record_segment(&self, expected: u8) -> bool {
        let mut segments = self.segments.lock();
        let first = segments.is_none();
        let (exp, seen) = segments.get_or_insert((expected, 0));
        *seen += 1;
        let done = *seen >= *exp;
        drop(segments);
        if first {
            self.state.lock().total_compls = expected as u32;
        }
        done
    }

    pub fn fail(&self, err: TransportError) {
        let mut state = self.state.lock();
        state.status = Status::Error(err);
    }

    pub fn status(&self) -> Status {
        self.state.lock().status.clone()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status(), Status::Completed | Status::Error(_))
    }

    /// Accumulated byte size, valid once the request is `Completed`
    /// (spec.md §4.9: "read accumulated size under the request lock").
    pub fn size(&self) -> usize {
        self.state.lock().size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_after_expected_number_of_completions() {
        let req = Request::new(RequestKind::Send, 0, 0, 2, None);
        assert!(!req.record_completion(10));
        assert!(!req.is_terminal());
        assert!(req.record_completion(5));
        assert_eq!(req.status(), Status::Completed);
        assert_eq!(req.size(), 15);
    }

    #[test]
    fn fail_sets_error_status() {
        let req = Request::new(RequestKind::Recv, 1, 0, 1, None);
        req.fail(TransportError::Protocol("boom".into()));
        assert!(matches!(req.status(), Status::Error(_)));
        assert!(req.is_terminal());
    }

    #[test]
    fn sub_request_carries_parent_index() {
        let req = Request::new(RequestKind::SendCtrl, 2, 3, 1, Some(7));
        assert_eq!(req.parent, Some(7));
    }

    #[test]
    fn record_segment_completes_once_expected_count_reached() {
        let req = Request::new(RequestKind::RecvSegms, 4, 0, 1, None);
        assert!(!req.record_segment(3));
        assert!(!req.record_segment(3));
        assert!(req.record_segment(3));
    }
}
