//! Turn one strided subarray access into a flat list of byte segments:
//! `(file offset, length, buffer address)` triples, emitted in row-major
//! element order so the buffer side stays a single advancing cursor.

use paio_var::VarMeta;

use crate::request::BufAddr;

/// One contiguous run of bytes: `len` bytes at file offset `off`, backed by
/// the staging bytes starting at `buf`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Segment {
    pub(crate) off: i64,
    pub(crate) len: i64,
    pub(crate) buf: BufAddr,
}

/// Flatten a subarray of an array with dimension lengths `dimlen` into
/// segments appended to `out`.
///
/// `var_begin` is the file offset of element (0, 0, ..., 0) and `base` the
/// staging address of the first element of the access. For record variables
/// the caller strips the record dimension and folds the record offset into
/// `var_begin` before calling.
///
/// The segment count is `count[last] * count[0] * ... * count[last-1]` when
/// the innermost stride is greater than one, otherwise the innermost
/// dimension collapses into single runs of `count[last]` elements.
pub(crate) fn flatten_subarray(
    dimlen: &[i64],
    el_size: i64,
    var_begin: i64,
    base: BufAddr,
    start: &[i64],
    count: &[i64],
    stride: Option<&[i64]>,
    out: &mut Vec<Segment>,
) {
    let ndim = dimlen.len();
    if ndim == 0 {
        out.push(Segment { off: var_begin, len: el_size, buf: base });
        return;
    }

    let ones: Vec<i64>;
    let stride: &[i64] = match stride {
        Some(s) => s,
        None => {
            ones = vec![1; ndim];
            &ones
        }
    };

    let first = out.len();
    let mut cursor = 0i64;

    // Innermost dimension: a unit stride collapses the whole row into one
    // segment, anything else emits one segment per element.
    let (seg_len, nstride) = if stride[ndim - 1] == 1 {
        (count[ndim - 1] * el_size, 1)
    } else {
        (el_size, count[ndim - 1])
    };
    let mut off = var_begin + start[ndim - 1] * el_size;
    for _ in 0..nstride {
        out.push(Segment { off, len: seg_len, buf: base.add(cursor) });
        cursor += seg_len;
        off += stride[ndim - 1] * el_size;
    }

    // Work outward: shift what we have to this dimension's start, then
    // replicate it once per further index along the dimension.
    let mut subarray_len = nstride;
    let mut array_len = 1i64;
    for d in (0..ndim - 1).rev() {
        array_len *= dimlen[d + 1];
        let shift = start[d] * array_len * el_size;
        for seg in &mut out[first..] {
            seg.off += shift;
        }
        let step = array_len * stride[d] * el_size;
        for j in 1..count[d] {
            for k in 0..subarray_len as usize {
                let mut seg = out[first + k];
                seg.off += step * j;
                seg.buf = base.add(cursor);
                cursor += seg.len;
                out.push(seg);
            }
        }
        subarray_len *= count[d];
    }
}

/// First and last byte a subarray access touches, as absolute file offsets.
/// The end is inclusive. A zero-element access degenerates to
/// `(first, first)`.
pub(crate) fn access_range(
    var: &VarMeta,
    recsize: i64,
    start: &[i64],
    count: &[i64],
    stride: Option<&[i64]>,
) -> (i64, i64) {
    let xsz = var.xsz();
    let shape = &var.shape;
    let ndims = shape.len();
    let stride_at = |d: usize| stride.map_or(1, |s| s[d]);
    let empty = count.iter().any(|&c| c == 0);

    let mut first = var.begin;
    let mut last = var.begin;
    let lo = if var.is_record() {
        first += start[0] * recsize;
        if !empty {
            last += (start[0] + (count[0] - 1) * stride_at(0)) * recsize;
        }
        1
    } else {
        0
    };

    let mut prod = xsz;
    for d in (lo..ndims).rev() {
        first += start[d] * prod;
        if !empty {
            last += (start[d] + (count[d] - 1) * stride_at(d)) * prod;
        }
        prod *= shape[d];
    }
    if empty {
        (first, first)
    } else {
        (first, last + xsz - 1)
    }
}
