//! Collapse the flattened segments of many interleaved requests into one
//! sorted, non-overlapping list.
//!
//! When two segments claim the same file bytes, the bytes stay with the
//! segment that sorts earlier, and the later one is trimmed to its
//! uncovered tail. The sort is stable, so segments at equal offsets keep
//! posting order and the earlier-posted request wins deterministically.

use crate::flatten::Segment;

/// Sort `segs` by file offset (skipped when they already are sorted) and
/// merge them in place.
pub(crate) fn merge_segments(segs: &mut Vec<Segment>) {
    if segs.len() < 2 {
        return;
    }
    if segs.windows(2).any(|w| w[0].off > w[1].off) {
        segs.sort_by_key(|s| s.off);
    }

    let mut i = 0;
    for j in 1..segs.len() {
        // Fully covered by the segment we are growing: drop it.
        if segs[i].off + segs[i].len >= segs[j].off + segs[j].len {
            continue;
        }
        let gap = segs[i].off + segs[i].len - segs[j].off;
        if gap >= 0 {
            // Partial overlap: the first `gap` bytes of j lose to i.
            let tail_len = segs[j].len - gap;
            let tail_off = segs[j].off + gap;
            let tail_buf = segs[j].buf.add(gap);
            let contiguous = segs[i].buf.arena == tail_buf.arena
                && segs[i].buf.off + segs[i].len == tail_buf.off;
            if contiguous {
                segs[i].len += tail_len;
            } else {
                i += 1;
                segs[i] = Segment { off: tail_off, len: tail_len, buf: tail_buf };
            }
        } else {
            // Disjoint: keep j as the next segment.
            i += 1;
            if i < j {
                segs[i] = segs[j];
            }
        }
    }
    segs.truncate(i + 1);
}
