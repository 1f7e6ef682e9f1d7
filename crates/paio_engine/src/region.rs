//! From sorted request entries to transferable regions.
//!
//! The committer hands this module the entries of one direction, sorted by
//! starting offset. They are split into runs ("groups") that are either
//! pairwise non-interleaved, in which case their flattened blocks simply
//! concatenate, or interleaved, in which case the group is flattened,
//! merged into canonical segments, and coalesced. All groups then chain
//! into one file-side and one memory-side block list whose byte streams
//! align exactly.

use std::ops::Range;

use crate::error::Error;
use crate::flatten::{flatten_subarray, Segment};
use crate::merge::merge_segments;
use crate::request::{note_err, set_slot, Completion, Queued};

/// `len` bytes at absolute file offset `off`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FileBlock {
    pub(crate) off: i64,
    pub(crate) len: i32,
}

/// `len` staging bytes at `off` within arena `arena`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct MemBlock {
    pub(crate) arena: u64,
    pub(crate) off: i64,
    pub(crate) len: i32,
}

#[derive(Debug, Default)]
pub(crate) struct Regions {
    pub(crate) file: Vec<FileBlock>,
    pub(crate) mem: Vec<MemBlock>,
}

impl Regions {
    pub(crate) fn total_bytes(&self) -> i64 {
        self.file.iter().map(|b| b.len as i64).sum()
    }
}

/// How one group of entries turns into regions.
#[derive(Debug, PartialEq)]
pub(crate) enum GroupPlan {
    /// No two members interleave: flatten each and concatenate.
    Concat(Range<usize>),
    /// Members overlap or cross: flatten all, merge, then coalesce.
    Merged(Range<usize>),
}

/// Partition sorted entries into maximal groups.
///
/// A non-interleaved run ends at the first pair whose extents cross; the
/// earlier member of that pair opens the interleaved group. An interleaved
/// group ends once a pair no longer crosses, and the next group starts
/// after it, peeking one pair ahead to pick its own kind.
pub(crate) fn split_groups(reqs: &[Queued]) -> Vec<GroupPlan> {
    let n = reqs.len();
    if n <= 1 {
        return vec![GroupPlan::Concat(0..n)];
    }
    let plan = |inter: bool, r: Range<usize>| {
        if inter {
            GroupPlan::Merged(r)
        } else {
            GroupPlan::Concat(r)
        }
    };

    let mut groups = Vec::new();
    let mut begin = 0usize;
    let mut interleaved = reqs[0].offset_end > reqs[1].offset_start;
    for i in 1..n - 1 {
        if !interleaved && reqs[i].offset_end > reqs[i + 1].offset_start {
            groups.push(plan(false, begin..i));
            begin = i;
            interleaved = true;
        } else if interleaved && reqs[i].offset_end <= reqs[i + 1].offset_start {
            groups.push(plan(true, begin..i + 1));
            begin = i + 1;
            interleaved = i + 2 < n && reqs[i + 1].offset_end > reqs[i + 2].offset_start;
        }
    }
    groups.push(plan(interleaved, begin..n));
    groups
}

/// Flatten one entry into segments. Record variables fold the record index
/// into the base offset and flatten only the in-record dimensions.
pub(crate) fn entry_segments(q: &Queued, recsize: i64, out: &mut Vec<Segment>) {
    if q.bnelems == 0 {
        return;
    }
    let var = &q.var;
    if var.is_record() {
        let begin = var.begin + q.start[0] * recsize;
        flatten_subarray(
            &var.shape[1..],
            var.xsz(),
            begin,
            q.buf,
            &q.start[1..],
            &q.count[1..],
            q.stride.as_deref().map(|s| &s[1..]),
            out,
        );
    } else {
        flatten_subarray(
            &var.shape,
            var.xsz(),
            var.begin,
            q.buf,
            &q.start,
            &q.count,
            q.stride.as_deref(),
            out,
        );
    }
}

fn push_mem(mem: &mut Vec<MemBlock>, arena: u64, off: i64, len: i64) {
    let mut off = off;
    let mut len = len;
    if let Some(last) = mem.last_mut() {
        if last.arena == arena && last.off + last.len as i64 == off {
            let grown = (last.len as i64 + len).min(i32::MAX as i64);
            let eat = grown - last.len as i64;
            last.len = grown as i32;
            off += eat;
            len -= eat;
        }
    }
    while len > 0 {
        let take = len.min(i32::MAX as i64);
        mem.push(MemBlock { arena, off, len: take as i32 });
        off += take;
        len -= take;
    }
}

/// Append one request's blocks: its flattened segments on the file side,
/// one contiguous staging run on the memory side. Fails without touching
/// `regions` if any single segment overflows 32-bit block addressing.
fn append_request(q: &Queued, recsize: i64, regions: &mut Regions) -> Result<(), Error> {
    let mut segs = Vec::new();
    entry_segments(q, recsize, &mut segs);
    let mut file = Vec::with_capacity(segs.len());
    for s in &segs {
        if s.len == 0 {
            continue;
        }
        if s.len > i32::MAX as i64 {
            return Err(Error::Overflow { bytes: s.len });
        }
        file.push(FileBlock { off: s.off, len: s.len as i32 });
    }
    regions.file.extend(file);
    push_mem(&mut regions.mem, q.buf.arena, q.buf.off, q.nbytes());
    Ok(())
}

fn compose_concat(
    reqs: &[Queued],
    recsize: i64,
    regions: &mut Regions,
    slots: &mut [Completion],
    first_err: &mut Option<Error>,
) {
    for q in reqs {
        if q.bnelems == 0 {
            continue;
        }
        if let Err(e) = append_request(q, recsize, regions) {
            tracing::warn!(id = q.id, %e, "request degraded");
            set_slot(slots, q.slot, e.clone());
            note_err(first_err, e);
        }
    }
}

fn compose_merged(
    reqs: &[Queued],
    recsize: i64,
    regions: &mut Regions,
    slots: &mut [Completion],
    first_err: &mut Option<Error>,
) {
    let mut segs = Vec::new();
    for q in reqs {
        entry_segments(q, recsize, &mut segs);
    }
    merge_segments(&mut segs);

    let mut file: Vec<FileBlock> = Vec::with_capacity(segs.len());
    let mut mem: Vec<MemBlock> = Vec::with_capacity(segs.len());
    let mut overflow = None;
    'build: for s in &segs {
        if s.len == 0 {
            continue;
        }
        // Coalesce byte-adjacent runs on the file side; a coalesced run
        // must still fit a 32-bit block length.
        if let Some(last) = file.last_mut() {
            if last.off + last.len as i64 == s.off {
                let grown = last.len as i64 + s.len;
                if grown > i32::MAX as i64 {
                    overflow = Some(grown);
                    break 'build;
                }
                last.len = grown as i32;
                push_mem(&mut mem, s.buf.arena, s.buf.off, s.len);
                continue;
            }
        }
        if s.len > i32::MAX as i64 {
            overflow = Some(s.len);
            break 'build;
        }
        file.push(FileBlock { off: s.off, len: s.len as i32 });
        push_mem(&mut mem, s.buf.arena, s.buf.off, s.len);
    }

    if let Some(bytes) = overflow {
        // The whole group degrades; it still participates, moving nothing.
        let err = Error::Overflow { bytes };
        tracing::warn!(members = reqs.len(), bytes, "interleaved group degraded");
        for q in reqs {
            set_slot(slots, q.slot, err.clone());
        }
        note_err(first_err, err);
        return;
    }
    regions.file.extend(file);
    regions.mem.extend(mem);
}

/// Compose the regions for one direction's entries, already sorted by
/// `offset_start`. `interleaved` is the committer's verdict on whether any
/// neighboring pair crosses; when false the whole list is one concat group.
pub(crate) fn compose(
    reqs: &[Queued],
    recsize: i64,
    interleaved: bool,
    slots: &mut [Completion],
    first_err: &mut Option<Error>,
) -> Regions {
    let mut regions = Regions::default();
    if !interleaved {
        compose_concat(reqs, recsize, &mut regions, slots, first_err);
        return regions;
    }
    for plan in split_groups(reqs) {
        match plan {
            GroupPlan::Concat(r) => {
                compose_concat(&reqs[r], recsize, &mut regions, slots, first_err)
            }
            GroupPlan::Merged(r) => {
                compose_merged(&reqs[r], recsize, &mut regions, slots, first_err)
            }
        }
    }
    regions
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use paio_var::{ExtType, VarMeta};

    use super::*;
    use crate::convert::MemType;
    use crate::flatten::access_range;
    use crate::request::{BufAddr, RequestId, UnpackPlan};

    fn var_1d(len: i64, begin: i64) -> Arc<VarMeta> {
        let mut v = VarMeta::new("v", ExtType::U8, &[len]);
        v.begin = begin;
        Arc::new(v)
    }

    fn entry(id: i32, var: &Arc<VarMeta>, start: i64, count: i64, arena: u64, slot: usize) -> Queued {
        let (offset_start, offset_end) =
            access_range(var, 0, &[start], &[count], None);
        Queued {
            id,
            var: Arc::clone(var),
            start: vec![start],
            count: vec![count],
            stride: None,
            bnelems: count,
            num_recs: 1,
            buf: BufAddr { arena, off: 0 },
            mem: MemType::U8,
            need_swap_back: false,
            range_flagged: false,
            lead_nelems: count,
            user_buf: None,
            plan: UnpackPlan::None,
            slot,
            offset_start,
            offset_end,
        }
    }

    fn slots(n: usize) -> Vec<Completion> {
        (0..n)
            .map(|i| Completion { id: RequestId::from_raw(i as i32 * 2), status: Ok(()), buf: None })
            .collect()
    }

    #[test]
    fn grouping_alternates_and_peeks_ahead() {
        let v = var_1d(1000, 0);
        // Extents: [0,10) [20,30) [25,40) [60,70) [65,80) [90,95)
        let reqs = vec![
            entry(0, &v, 0, 10, 0, 0),
            entry(2, &v, 20, 10, 1, 1),
            entry(4, &v, 25, 15, 2, 2),
            entry(6, &v, 60, 10, 3, 3),
            entry(8, &v, 65, 15, 4, 4),
            entry(10, &v, 90, 5, 5, 5),
        ];
        let groups = split_groups(&reqs);
        assert_eq!(
            groups,
            vec![
                GroupPlan::Concat(0..1),
                GroupPlan::Merged(1..3),
                GroupPlan::Merged(3..5),
                GroupPlan::Concat(5..6),
            ]
        );
    }

    #[test]
    fn touching_extents_do_not_interleave() {
        let v = var_1d(100, 0);
        // [0,50) and [50,80): end 49 is not past start 50.
        let reqs = vec![entry(0, &v, 0, 50, 0, 0), entry(2, &v, 50, 30, 1, 1)];
        assert_eq!(split_groups(&reqs), vec![GroupPlan::Concat(0..2)]);
    }

    #[test]
    fn concat_keeps_file_blocks_and_fuses_shared_arena() {
        let v = var_1d(100, 10);
        let mut reqs = vec![entry(0, &v, 0, 4, 7, 0), entry(0, &v, 50, 4, 7, 0)];
        reqs[1].buf.off = 4; // second entry right after the first in staging
        reqs[1].num_recs = 0;
        let mut sl = slots(1);
        let mut first = None;
        let regions = compose(&reqs, 0, false, &mut sl, &mut first);
        assert_eq!(
            regions.file,
            vec![FileBlock { off: 10, len: 4 }, FileBlock { off: 60, len: 4 }]
        );
        assert_eq!(regions.mem, vec![MemBlock { arena: 7, off: 0, len: 8 }]);
        assert!(first.is_none());
    }

    #[test]
    fn merged_group_trims_the_later_overlap() {
        let v = var_1d(200, 0);
        // Posted: [100,200) under arena 1, then [50,150) under arena 2.
        let a = entry(0, &v, 100, 100, 1, 0);
        let b = entry(2, &v, 50, 100, 2, 1);
        let mut reqs = vec![b, a];
        reqs.sort_by_key(|q| q.offset_start);
        let mut sl = slots(2);
        let mut first = None;
        let regions = compose(&reqs, 0, true, &mut sl, &mut first);
        // Sorted: [50,150) arena 2 first, then [100,200) arena 1 keeps
        // only its tail [150,200).
        assert_eq!(regions.file, vec![FileBlock { off: 50, len: 150 }]);
        assert_eq!(
            regions.mem,
            vec![
                MemBlock { arena: 2, off: 0, len: 100 },
                MemBlock { arena: 1, off: 50, len: 50 },
            ]
        );
        assert!(first.is_none());
    }

    #[test]
    fn oversized_segment_degrades_only_its_request() {
        let big = var_1d(3_000_000_000, 0);
        let small = var_1d(10, 4_000_000_000);
        let reqs = vec![
            entry(0, &big, 0, 2_200_000_000, 0, 0),
            entry(2, &small, 0, 10, 1, 1),
        ];
        let mut sl = slots(2);
        let mut first = None;
        let regions = compose(&reqs, 0, false, &mut sl, &mut first);
        assert_eq!(sl[0].status, Err(Error::Overflow { bytes: 2_200_000_000 }));
        assert!(sl[1].status.is_ok());
        assert_eq!(first, Some(Error::Overflow { bytes: 2_200_000_000 }));
        assert_eq!(regions.file, vec![FileBlock { off: 4_000_000_000, len: 10 }]);
        assert_eq!(regions.mem, vec![MemBlock { arena: 1, off: 0, len: 10 }]);
    }

    #[test]
    fn zero_element_entries_add_nothing() {
        let v = var_1d(100, 0);
        let mut q = entry(0, &v, 5, 0, 0, 0);
        q.bnelems = 0;
        let mut sl = slots(1);
        let mut first = None;
        let regions = compose(&[q], 0, false, &mut sl, &mut first);
        assert!(regions.file.is_empty() && regions.mem.is_empty());
        assert!(sl[0].status.is_ok());
    }
}
