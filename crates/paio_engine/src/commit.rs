//! The commit path: everything between "these requests leave the queue"
//! and "their buffers are back with the caller".
//!
//! Extracted entries, whatever later fails, are always walked to the end of
//! release: swap-backs undone, pool slots freed, caller buffers moved into
//! their completion slots. There is no path that strands a buffer.

use std::collections::HashMap;
use std::io::IoSlice;
use std::mem;

use crate::convert::{scatter_mapped, swap_in_place, unpack_from_ext};
use crate::dataset::Dataset;
use crate::dispatch::{execute_read, execute_write};
use crate::error::Error;
use crate::flatten::access_range;
use crate::region::compose;
use crate::request::{note_err, set_slot, Completion, Queued, Selector, UnpackPlan, WaitOutcome};
use crate::store::{ArenaBuf, Extracted};

impl Dataset {
    /// Commit the selected requests: agree (collectively) on the rounds to
    /// run, write, advance the record count, read, then unpack and release.
    pub(crate) fn commit(&mut self, sel: Selector<'_>, collective: bool) -> WaitOutcome {
        let mut ex = self.store.extract(sel);
        let mut first_err = ex.first_err.take();
        let mut slots = mem::take(&mut ex.slots);
        tracing::debug!(
            writes = ex.puts.len(),
            reads = ex.gets.len(),
            collective,
            "committing"
        );

        // High-water mark the queued record writes reach.
        let mut newnumrecs = self.numrecs;
        for q in &ex.puts {
            if q.var.is_record() && q.bnelems > 0 {
                newnumrecs = newnumrecs.max(q.start[0] + q.count[0]);
            }
        }

        let mut do_write = !ex.puts.is_empty();
        let mut do_read = !ex.gets.is_empty();
        let mut aborted = false;
        if collective {
            let mut vals = [
                ex.gets.len() as i64,
                ex.puts.len() as i64,
                -first_err.as_ref().map_or(0, Error::code),
                newnumrecs,
            ];
            match self.comm.allreduce_max(&mut vals) {
                Ok(()) => {
                    do_read = vals[0] > 0;
                    do_write = vals[1] > 0;
                    newnumrecs = vals[3];
                    if vals[2] != 0 {
                        // Some process failed before transfer; everyone
                        // backs out, each returning its own local verdict.
                        tracing::debug!(code = -vals[2], "collective commit aborted");
                        aborted = true;
                    }
                }
                Err(e) => {
                    note_err(&mut first_err, Error::Comm(e));
                    aborted = true;
                }
            }
        }

        if !aborted {
            if do_write {
                self.flush(&mut ex.puts, &mut ex.arenas, true, &mut slots, &mut first_err);
                self.update_numrecs(newnumrecs, collective, &mut first_err);
            }
            if do_read {
                self.flush(&mut ex.gets, &mut ex.arenas, false, &mut slots, &mut first_err);
            }
        }

        self.release_writes(&mut ex, &mut slots, &mut first_err);
        self.release_reads(&mut ex, &mut slots, &mut first_err, !aborted);

        if self.opts.fsync_on_write && do_write && !aborted {
            if let Err(e) = self.fio.sync() {
                note_err(&mut first_err, Error::Write(e.to_string()));
            }
            if collective {
                if let Err(e) = self.comm.barrier() {
                    note_err(&mut first_err, Error::Comm(e));
                }
            }
        }

        WaitOutcome {
            status: first_err.map_or(Ok(()), Err),
            completions: slots,
        }
    }

    /// Cancel the selected requests: no transfer, no unpack, buffers
    /// restored and handed back.
    pub(crate) fn do_cancel(&mut self, sel: Selector<'_>) -> WaitOutcome {
        let mut ex = self.store.extract(sel);
        let mut first_err = ex.first_err.take();
        let mut slots = mem::take(&mut ex.slots);
        tracing::debug!(writes = ex.puts.len(), reads = ex.gets.len(), "cancelling");

        self.release_writes(&mut ex, &mut slots, &mut first_err);
        self.release_reads(&mut ex, &mut slots, &mut first_err, false);

        // Cancelling every write wipes the pool wholesale, dropping even
        // slots an earlier id-based cancel left stranded mid-pool.
        if matches!(sel, Selector::All | Selector::Writes) {
            if let Some(pool) = &mut self.abuf {
                pool.reset();
            }
        }

        WaitOutcome {
            status: first_err.map_or(Ok(()), Err),
            completions: slots,
        }
    }

    /// One direction's physical round: compute extents, sort, classify,
    /// compose regions and run the transfer. With no local entries this
    /// still makes the (empty) transfer round, so a process with nothing
    /// to do stays in step with the others.
    fn flush(
        &mut self,
        reqs: &mut Vec<Queued>,
        arenas: &mut HashMap<u64, ArenaBuf>,
        writing: bool,
        slots: &mut [Completion],
        first_err: &mut Option<Error>,
    ) {
        let recsize = self.layout.recsize;
        for q in reqs.iter_mut() {
            let (s, e) = access_range(&q.var, recsize, &q.start, &q.count, q.stride.as_deref());
            q.offset_start = s;
            q.offset_end = e;
        }
        if reqs.windows(2).any(|w| w[0].offset_start > w[1].offset_start) {
            reqs.sort_by_key(|q| q.offset_start);
        }
        let interleaved = reqs
            .windows(2)
            .any(|w| w[0].offset_end > w[1].offset_start);

        let regions = compose(reqs, recsize, interleaved, slots, first_err);
        tracing::debug!(
            writing,
            interleaved,
            blocks = regions.file.len(),
            bytes = regions.total_bytes(),
            "transfer round"
        );
        let moved = if writing {
            execute_write(self.fio.as_mut(), &regions, arenas, self.abuf.as_ref())
        } else {
            execute_read(self.fio.as_mut(), &regions, arenas)
        };
        match moved {
            Ok(n) => {
                if writing {
                    self.put_size += n;
                } else {
                    self.get_size += n;
                }
            }
            Err(e) => note_err(first_err, e),
        }
    }

    /// Writes come back to the caller: restore in-place swaps, free pool
    /// slots, move buffers into their slots, surface posting-time clamps.
    fn release_writes(
        &mut self,
        ex: &mut Extracted,
        slots: &mut [Completion],
        first_err: &mut Option<Error>,
    ) {
        for q in &mut ex.puts {
            if q.num_recs == 0 {
                continue;
            }
            if q.range_flagged {
                set_slot(slots, q.slot, Error::Range);
                note_err(first_err, Error::Range);
            }
            let extent = (q.lead_nelems * q.var.xsz()) as usize;
            match ex.arenas.remove(&q.buf.arena) {
                Some(ArenaBuf::Caller(mut v)) => {
                    if q.need_swap_back {
                        swap_in_place(&mut v[..extent], q.var.xsz() as usize);
                    }
                    slots[q.slot].buf = Some(v);
                }
                Some(ArenaBuf::Temp(_)) => {
                    slots[q.slot].buf = q.user_buf.take();
                }
                Some(ArenaBuf::Pool { index }) => {
                    if let Some(pool) = &mut self.abuf {
                        pool.free(index);
                    }
                }
                None => {}
            }
        }
        if let Some(pool) = &mut self.abuf {
            pool.coalesce();
        }
    }

    /// Reads land with the caller: unpack staged bytes (unless the round
    /// never transferred) and hand the destination buffer back. A clamp
    /// while unpacking counts against the round like any other error.
    fn release_reads(
        &mut self,
        ex: &mut Extracted,
        slots: &mut [Completion],
        first_err: &mut Option<Error>,
        unpack: bool,
    ) {
        for q in &mut ex.gets {
            if q.num_recs == 0 {
                continue;
            }
            let xsz = q.var.xsz();
            let extent = (q.lead_nelems * xsz) as usize;
            match ex.arenas.remove(&q.buf.arena) {
                Some(ArenaBuf::Caller(mut v)) => {
                    if unpack && q.plan == UnpackPlan::SwapInPlace {
                        swap_in_place(&mut v[..extent], xsz as usize);
                    }
                    slots[q.slot].buf = Some(v);
                }
                Some(ArenaBuf::Temp(staged)) => {
                    let mut dest = match q.user_buf.take() {
                        Some(d) => d,
                        None => continue,
                    };
                    if unpack {
                        let clamped = match &q.plan {
                            UnpackPlan::Convert => unpack_from_ext(
                                q.var.xtype,
                                q.mem,
                                &staged[..extent],
                                &mut dest,
                                q.lead_nelems as usize,
                            ),
                            UnpackPlan::Mapped { imap, count } => scatter_mapped(
                                q.var.xtype,
                                q.mem,
                                &staged[..extent],
                                &mut dest,
                                count,
                                imap,
                            ),
                            _ => false,
                        };
                        if clamped {
                            set_slot(slots, q.slot, Error::Range);
                            note_err(first_err, Error::Range);
                        }
                    }
                    slots[q.slot].buf = Some(dest);
                }
                _ => {}
            }
        }
    }

    fn update_numrecs(
        &mut self,
        newnumrecs: i64,
        collective: bool,
        first_err: &mut Option<Error>,
    ) {
        if newnumrecs <= self.numrecs {
            return;
        }
        if collective {
            self.numrecs = newnumrecs;
            self.numrecs_dirty = false;
            if self.comm.is_root() {
                if let Err(e) = self.persist_numrecs() {
                    note_err(first_err, e);
                }
            }
        } else {
            self.numrecs = newnumrecs;
            self.numrecs_dirty = true;
        }
    }

    pub(crate) fn persist_numrecs(&mut self) -> Result<(), Error> {
        let be = self.numrecs.to_be_bytes();
        tracing::trace!(numrecs = self.numrecs, "persisting record count");
        self.fio
            .writev_at(&[IoSlice::new(&be)], self.layout.numrecs_offset)
            .map_err(|e| Error::Write(e.to_string()))
    }
}
