use std::fmt;

use paio_var::Var;

use crate::convert::MemType;
use crate::error::{Error, Status};

/// Handle for a pending nonblocking request, returned by the posting
/// methods on [`Dataset`](crate::Dataset).
///
/// The parity of the raw id encodes the direction: writes get even ids,
/// reads get odd ids. Ids are assigned in posting order and never reused
/// within the lifetime of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(i32);

impl RequestId {
    pub(crate) fn from_raw(raw: i32) -> Self {
        RequestId(raw)
    }

    pub(crate) fn raw(self) -> i32 {
        self.0
    }

    /// True if this id was returned by a read posting.
    pub fn is_read(self) -> bool {
        self.0 & 1 == 1
    }

    /// True if this id was returned by a write posting.
    pub fn is_write(self) -> bool {
        self.0 & 1 == 0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which pending requests a `wait` or `cancel` call should act on.
#[derive(Debug, Clone, Copy)]
pub enum Selector<'a> {
    /// Exactly these requests. The outcome carries one completion slot per
    /// id, in the same order.
    Ids(&'a [RequestId]),
    /// Every pending request, writes first, then reads.
    All,
    /// Every pending read request.
    Reads,
    /// Every pending write request.
    Writes,
}

/// The final word on one logical request.
#[derive(Debug)]
pub struct Completion {
    /// The id this slot reports on.
    pub id: RequestId,
    /// Per-request status. Errors recorded here (bad geometry, range
    /// clamping, block overflow) degrade only this request; the rest of the
    /// batch still transfers.
    pub status: Status,
    /// The caller's buffer, handed back. For reads it now holds the data;
    /// for writes its contents are as posted (any in-place byte swap has
    /// been undone). `None` for pool-backed writes, which never borrow the
    /// caller's memory past the posting call.
    pub buf: Option<Vec<u8>>,
}

/// Result of a `wait`, `wait_all` or `cancel` call that ran to the end.
#[derive(Debug)]
pub struct WaitOutcome {
    /// First error seen by this process, or `Ok` if everything succeeded.
    /// Under a collective wait this stays the *local* verdict even when the
    /// processes agreed to abort because of a remote error.
    pub status: Status,
    /// One slot per logical request acted on. For [`Selector::Ids`] the
    /// order matches the id list; for the catch-all selectors it is posting
    /// order, writes before reads.
    pub completions: Vec<Completion>,
}

impl WaitOutcome {
    pub(crate) fn empty() -> Self {
        WaitOutcome { status: Ok(()), completions: Vec::new() }
    }
}

/// Record an error in a completion slot, keeping whatever got there first.
pub(crate) fn set_slot(slots: &mut [Completion], slot: usize, err: Error) {
    if slots[slot].status.is_ok() {
        slots[slot].status = Err(err);
    }
}

pub(crate) fn note_err(first: &mut Option<Error>, err: Error) {
    if first.is_none() {
        *first = Some(err);
    }
}

/// Byte position inside one staging arena.
///
/// An arena is the single allocation backing one logical request (the
/// caller's own buffer, an engine-owned conversion buffer, or a slot of the
/// attached pool). Two addresses are contiguous only if they name the same
/// arena; distinct arenas are never assumed adjacent, whatever the
/// allocator did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufAddr {
    pub(crate) arena: u64,
    pub(crate) off: i64,
}

impl BufAddr {
    pub(crate) fn add(self, bytes: i64) -> Self {
        BufAddr { arena: self.arena, off: self.off + bytes }
    }
}

/// How a read entry's staged bytes reach the caller's buffer at completion.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum UnpackPlan {
    /// Staged straight into the caller's buffer; nothing left to do.
    None,
    /// Element byte order must be flipped in place.
    SwapInPlace,
    /// External elements convert one-for-one into the caller's memory type.
    Convert,
    /// Elements scatter through an index map (in element units, one stride
    /// per dimension of `count`).
    Mapped { imap: Vec<i64>, count: Vec<i64> },
}

/// One physical queue entry.
///
/// A logical request becomes several entries when it spans `R > 1` records
/// (one per record) or posts many subranges at once; they share a staging
/// arena and exactly one of them is the lead. Lead-only fields are
/// meaningless on the others.
#[derive(Debug)]
pub(crate) struct Queued {
    pub(crate) id: i32,
    pub(crate) var: Var,
    pub(crate) start: Vec<i64>,
    pub(crate) count: Vec<i64>,
    pub(crate) stride: Option<Vec<i64>>,
    /// Elements covered by this entry alone.
    pub(crate) bnelems: i64,
    /// Records the logical request spans, positive exactly on the lead
    /// entry and zero on the others. The release path keys on it.
    pub(crate) num_recs: i64,
    /// First byte of this entry's external-format data.
    pub(crate) buf: BufAddr,
    pub(crate) mem: MemType,
    /// Lead only: the caller's buffer was byte-swapped in place and must be
    /// restored once the data is on disk (or the request is cancelled).
    pub(crate) need_swap_back: bool,
    /// Lead only: conversion at posting time clamped out-of-range values.
    pub(crate) range_flagged: bool,
    /// Lead only: total elements across all entries of the logical request.
    pub(crate) lead_nelems: i64,
    /// Lead only: caller buffer to hand back, when the arena is not it.
    pub(crate) user_buf: Option<Vec<u8>>,
    /// Lead only, reads: completion-time unpack strategy.
    pub(crate) plan: UnpackPlan,
    /// Completion slot index; assigned when the entry is extracted.
    pub(crate) slot: usize,
    /// Byte extent in the file, filled in by the committer. `offset_end` is
    /// inclusive: the last byte the access touches.
    pub(crate) offset_start: i64,
    pub(crate) offset_end: i64,
}

impl Queued {
    /// Bytes this entry moves over the wire.
    pub(crate) fn nbytes(&self) -> i64 {
        self.bnelems * self.var.xsz()
    }
}
