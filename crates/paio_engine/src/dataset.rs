use std::sync::Arc;

use paio_comm::Communicator;
use paio_var::{Layout, Var};

use crate::abuf::AttachedBuf;
use crate::convert::{gather_mapped, need_convert, need_swap, pack_to_ext, swap_in_place, MemType};
use crate::error::Error;
use crate::request::{BufAddr, Queued, RequestId, Selector, UnpackPlan, WaitOutcome};
use crate::store::{ArenaBuf, ReqStore};
use crate::transport::FileIo;

/// Knobs shared by every process opening the same dataset. They must be
/// set identically everywhere, or collective calls stop lining up.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatasetOptions {
    /// Sync file data to stable storage after every committed write round
    /// (with a barrier after the sync under collective commits).
    pub fsync_on_write: bool,
}

/// One process's handle on a shared dataset file.
///
/// All the nonblocking posting methods validate eagerly, stage the data in
/// its external representation, and return a [`RequestId`]; nothing reaches
/// the file until [`wait`], [`wait_all`] or [`cancel`] resolves the queue.
///
/// [`wait`]: Dataset::wait
/// [`wait_all`]: Dataset::wait_all
/// [`cancel`]: Dataset::cancel
pub struct Dataset {
    pub(crate) comm: Box<dyn Communicator>,
    pub(crate) fio: Box<dyn FileIo>,
    pub(crate) layout: Layout,
    pub(crate) opts: DatasetOptions,
    pub(crate) store: ReqStore,
    pub(crate) abuf: Option<AttachedBuf>,
    pub(crate) numrecs: i64,
    pub(crate) numrecs_dirty: bool,
    pub(crate) indep: bool,
    pub(crate) next_seq: i32,
    pub(crate) put_size: i64,
    pub(crate) get_size: i64,
}

impl Dataset {
    /// Wrap an open file. `numrecs` is the record count the file's header
    /// currently carries. The dataset starts in collective mode.
    pub fn new(
        layout: Layout,
        numrecs: i64,
        fio: Box<dyn FileIo>,
        comm: Box<dyn Communicator>,
        opts: DatasetOptions,
    ) -> Self {
        Dataset {
            comm,
            fio,
            layout,
            opts,
            store: ReqStore::default(),
            abuf: None,
            numrecs,
            numrecs_dirty: false,
            indep: false,
            next_seq: 1,
            put_size: 0,
            get_size: 0,
        }
    }

    /// Look a variable up by name.
    pub fn var(&self, name: &str) -> Option<&Var> {
        self.layout.var(name)
    }

    /// Records the dataset currently holds, as this process knows it.
    pub fn num_records(&self) -> i64 {
        self.numrecs
    }

    /// Bytes this process has physically written through commits.
    pub fn bytes_written(&self) -> i64 {
        self.put_size
    }

    /// Bytes this process has physically read through commits.
    pub fn bytes_read(&self) -> i64 {
        self.get_size
    }

    /// Pending `(writes, reads)` entry counts.
    pub fn pending(&self) -> (usize, usize) {
        (self.store.num_pending_writes(), self.store.num_pending_reads())
    }

    // ------------------------------------------------------------------
    // Access mode
    // ------------------------------------------------------------------

    /// Leave collective mode. Until [`end_independent`], requests commit
    /// through [`wait`] and no other process needs to participate.
    ///
    /// [`end_independent`]: Dataset::end_independent
    /// [`wait`]: Dataset::wait
    pub fn begin_independent(&mut self) -> Result<(), Error> {
        if self.indep {
            return Err(Error::Independent);
        }
        if self.opts.fsync_on_write {
            self.fio.sync().map_err(|e| Error::Write(e.to_string()))?;
            self.comm.barrier()?;
        }
        self.indep = true;
        Ok(())
    }

    /// Re-enter collective mode. This call is collective: every process
    /// makes it, and a record count grown independently on any process is
    /// agreed on and persisted before it returns.
    pub fn end_independent(&mut self) -> Result<(), Error> {
        if !self.indep {
            return Err(Error::NotIndependent);
        }
        let mut vals = [self.numrecs, self.numrecs_dirty as i64];
        self.comm.allreduce_max(&mut vals)?;
        self.numrecs = vals[0];
        if vals[1] > 0 {
            if self.comm.is_root() {
                self.persist_numrecs()?;
            }
            self.numrecs_dirty = false;
        }
        if self.opts.fsync_on_write {
            self.fio.sync().map_err(|e| Error::Write(e.to_string()))?;
            self.comm.barrier()?;
        }
        self.indep = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Committing and cancelling
    // ------------------------------------------------------------------

    /// Commit requests independently. The dataset must be in independent
    /// mode; no other process is involved.
    pub fn wait(&mut self, sel: Selector<'_>) -> Result<WaitOutcome, Error> {
        if !self.indep {
            return Err(Error::NotIndependent);
        }
        if let Selector::Ids(ids) = sel {
            if ids.is_empty() {
                return Ok(WaitOutcome::empty());
            }
        }
        Ok(self.commit(sel, false))
    }

    /// Commit requests collectively. Every process of the communicator
    /// must call this, even with nothing selected: processes with no work
    /// still take part in the agreement and the transfer rounds.
    pub fn wait_all(&mut self, sel: Selector<'_>) -> Result<WaitOutcome, Error> {
        if self.indep {
            return Err(Error::Independent);
        }
        Ok(self.commit(sel, true))
    }

    /// Drop pending requests without touching the file. Data buffers come
    /// back exactly as posted. Cancelling is local in either mode; ids
    /// already committed or cancelled report [`Error::InvalidRequest`].
    pub fn cancel(&mut self, sel: Selector<'_>) -> WaitOutcome {
        self.do_cancel(sel)
    }

    // ------------------------------------------------------------------
    // Attached buffer pool
    // ------------------------------------------------------------------

    /// Attach a `size`-byte staging pool for [`write_pooled`].
    ///
    /// [`write_pooled`]: Dataset::write_pooled
    pub fn attach_pool(&mut self, size: usize) -> Result<(), Error> {
        if self.abuf.is_some() {
            return Err(Error::PoolInUse);
        }
        self.abuf = Some(AttachedBuf::new(size));
        Ok(())
    }

    /// Detach the pool. Fails while any pooled write is still pending.
    pub fn detach_pool(&mut self) -> Result<(), Error> {
        match &self.abuf {
            None => Err(Error::NoPool),
            Some(pool) if pool.occupied() => Err(Error::PoolInUse),
            Some(_) => {
                self.abuf = None;
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Posting writes
    // ------------------------------------------------------------------

    /// Queue a write of the subarray `start`/`count` of `var`. `data`
    /// holds `mem`-typed elements in row-major order; the engine owns it
    /// until the request completes and hands it back in the completion.
    pub fn write_subarray(
        &mut self,
        var: &Var,
        start: &[i64],
        count: &[i64],
        data: Vec<u8>,
        mem: MemType,
    ) -> Result<RequestId, Error> {
        self.post_write(var, start, count, None, None, data, mem)
    }

    /// Queue a strided write: element `i` along dimension `d` comes from
    /// index `start[d] + i * stride[d]` of the variable.
    pub fn write_strided(
        &mut self,
        var: &Var,
        start: &[i64],
        count: &[i64],
        stride: &[i64],
        data: Vec<u8>,
        mem: MemType,
    ) -> Result<RequestId, Error> {
        self.post_write(var, start, count, Some(stride), None, data, mem)
    }

    /// Queue a write whose elements are gathered from `data` through an
    /// index map: `imap[d]` is the element stride in `data` for dimension
    /// `d` of `count`.
    pub fn write_mapped(
        &mut self,
        var: &Var,
        start: &[i64],
        count: &[i64],
        stride: Option<&[i64]>,
        imap: &[i64],
        data: Vec<u8>,
        mem: MemType,
    ) -> Result<RequestId, Error> {
        self.post_write(var, start, count, stride, Some(imap), data, mem)
    }

    /// Queue writes of several subarrays of one variable under a single
    /// request id. `data` holds the ranges' elements back to back.
    pub fn write_multi(
        &mut self,
        var: &Var,
        ranges: &[(&[i64], &[i64])],
        data: Vec<u8>,
        mem: MemType,
    ) -> Result<RequestId, Error> {
        let total = self.validate_multi(var, ranges, data.len(), mem)?;
        let xsz = var.xsz();
        let id = self.next_write_id();

        let identity = !need_convert(var.xtype, mem);
        let (arena, swapped, user_buf, range) = if identity && !need_swap(xsz) {
            (self.store.new_arena(ArenaBuf::Caller(data)), false, None, false)
        } else if identity {
            let mut v = data;
            swap_in_place(&mut v, xsz as usize);
            (self.store.new_arena(ArenaBuf::Caller(v)), true, None, false)
        } else {
            let mut staging = vec![0u8; (total * xsz) as usize];
            let clamped =
                pack_to_ext(mem, var.xtype, &data, &mut staging, total as usize);
            (self.store.new_arena(ArenaBuf::Temp(staging)), false, Some(data), clamped)
        };
        self.enqueue_parts(
            var,
            &parts_of(ranges),
            id,
            arena,
            mem,
            swapped,
            range,
            user_buf,
            UnpackPlan::None,
            total,
        );
        Ok(RequestId::from_raw(id))
    }

    /// Queue a write staged through the attached pool: `data` is copied
    /// (and converted) into the pool during this call and is free to reuse
    /// as soon as it returns.
    pub fn write_pooled(
        &mut self,
        var: &Var,
        start: &[i64],
        count: &[i64],
        stride: Option<&[i64]>,
        data: &[u8],
        mem: MemType,
    ) -> Result<RequestId, Error> {
        var.validate_access(start, count, stride)?;
        let nelems: i64 = count.iter().product();
        let expected = nelems as usize * mem.size();
        if data.len() != expected {
            return Err(Error::BufferSize { expected, got: data.len() });
        }
        let xsz = var.xsz();
        let pool = self.abuf.as_mut().ok_or(Error::NoPool)?;
        let index = pool.alloc(nelems * xsz)?;
        let slice = pool.slice_mut(index);
        let clamped = if need_convert(var.xtype, mem) {
            pack_to_ext(mem, var.xtype, data, slice, nelems as usize)
        } else {
            slice.copy_from_slice(data);
            if need_swap(xsz) {
                swap_in_place(slice, xsz as usize);
            }
            false
        };

        let id = self.next_write_id();
        let arena = self.store.new_arena(ArenaBuf::Pool { index });
        self.enqueue_parts(
            var,
            &[(start, count, stride)],
            id,
            arena,
            mem,
            false,
            clamped,
            None,
            UnpackPlan::None,
            nelems,
        );
        Ok(RequestId::from_raw(id))
    }

    // ------------------------------------------------------------------
    // Posting reads
    // ------------------------------------------------------------------

    /// Queue a read of the subarray `start`/`count` of `var` into `dest`,
    /// which must hold exactly the accessed element count in `mem` layout.
    /// The filled buffer comes back in the completion.
    pub fn read_subarray(
        &mut self,
        var: &Var,
        start: &[i64],
        count: &[i64],
        dest: Vec<u8>,
        mem: MemType,
    ) -> Result<RequestId, Error> {
        self.post_read(var, start, count, None, None, dest, mem)
    }

    /// Strided counterpart of [`read_subarray`](Dataset::read_subarray).
    pub fn read_strided(
        &mut self,
        var: &Var,
        start: &[i64],
        count: &[i64],
        stride: &[i64],
        dest: Vec<u8>,
        mem: MemType,
    ) -> Result<RequestId, Error> {
        self.post_read(var, start, count, Some(stride), None, dest, mem)
    }

    /// Queue a read that scatters into `dest` through an index map. Bytes
    /// of `dest` the map does not name stay untouched.
    pub fn read_mapped(
        &mut self,
        var: &Var,
        start: &[i64],
        count: &[i64],
        stride: Option<&[i64]>,
        imap: &[i64],
        dest: Vec<u8>,
        mem: MemType,
    ) -> Result<RequestId, Error> {
        self.post_read(var, start, count, stride, Some(imap), dest, mem)
    }

    /// Queue reads of several subarrays of one variable under a single
    /// request id, landing back to back in `dest`.
    pub fn read_multi(
        &mut self,
        var: &Var,
        ranges: &[(&[i64], &[i64])],
        dest: Vec<u8>,
        mem: MemType,
    ) -> Result<RequestId, Error> {
        let total = self.validate_multi(var, ranges, dest.len(), mem)?;
        let xsz = var.xsz();
        let id = self.next_read_id();

        let identity = !need_convert(var.xtype, mem);
        let (arena, user_buf, plan) = if identity && !need_swap(xsz) {
            (self.store.new_arena(ArenaBuf::Caller(dest)), None, UnpackPlan::None)
        } else if identity {
            (self.store.new_arena(ArenaBuf::Caller(dest)), None, UnpackPlan::SwapInPlace)
        } else {
            let staging = vec![0u8; (total * xsz) as usize];
            (
                self.store.new_arena(ArenaBuf::Temp(staging)),
                Some(dest),
                UnpackPlan::Convert,
            )
        };
        self.enqueue_parts(
            var,
            &parts_of(ranges),
            id,
            arena,
            mem,
            false,
            false,
            user_buf,
            plan,
            total,
        );
        Ok(RequestId::from_raw(id))
    }

    // ------------------------------------------------------------------
    // Posting internals
    // ------------------------------------------------------------------

    fn post_write(
        &mut self,
        var: &Var,
        start: &[i64],
        count: &[i64],
        stride: Option<&[i64]>,
        imap: Option<&[i64]>,
        data: Vec<u8>,
        mem: MemType,
    ) -> Result<RequestId, Error> {
        var.validate_access(start, count, stride)?;
        let nelems: i64 = count.iter().product();
        let expected = nelems as usize * mem.size();
        if data.len() != expected {
            return Err(Error::BufferSize { expected, got: data.len() });
        }
        let xsz = var.xsz();
        let id = self.next_write_id();

        let identity = !need_convert(var.xtype, mem) && imap.is_none();
        let (arena, swapped, user_buf, range) = if identity && !need_swap(xsz) {
            (self.store.new_arena(ArenaBuf::Caller(data)), false, None, false)
        } else if identity {
            let mut v = data;
            swap_in_place(&mut v, xsz as usize);
            (self.store.new_arena(ArenaBuf::Caller(v)), true, None, false)
        } else {
            let mut staging = vec![0u8; (nelems * xsz) as usize];
            let clamped = match imap {
                Some(m) => gather_mapped(mem, var.xtype, &data, &mut staging, count, m),
                None => pack_to_ext(mem, var.xtype, &data, &mut staging, nelems as usize),
            };
            (self.store.new_arena(ArenaBuf::Temp(staging)), false, Some(data), clamped)
        };
        self.enqueue_parts(
            var,
            &[(start, count, stride)],
            id,
            arena,
            mem,
            swapped,
            range,
            user_buf,
            UnpackPlan::None,
            nelems,
        );
        Ok(RequestId::from_raw(id))
    }

    fn post_read(
        &mut self,
        var: &Var,
        start: &[i64],
        count: &[i64],
        stride: Option<&[i64]>,
        imap: Option<&[i64]>,
        dest: Vec<u8>,
        mem: MemType,
    ) -> Result<RequestId, Error> {
        var.validate_access(start, count, stride)?;
        let nelems: i64 = count.iter().product();
        let expected = nelems as usize * mem.size();
        if dest.len() != expected {
            return Err(Error::BufferSize { expected, got: dest.len() });
        }
        let xsz = var.xsz();
        let id = self.next_read_id();

        let identity = !need_convert(var.xtype, mem) && imap.is_none();
        let (arena, user_buf, plan) = if identity && !need_swap(xsz) {
            (self.store.new_arena(ArenaBuf::Caller(dest)), None, UnpackPlan::None)
        } else if identity {
            (self.store.new_arena(ArenaBuf::Caller(dest)), None, UnpackPlan::SwapInPlace)
        } else {
            let staging = vec![0u8; (nelems * xsz) as usize];
            let plan = match imap {
                Some(m) => UnpackPlan::Mapped { imap: m.to_vec(), count: count.to_vec() },
                None => UnpackPlan::Convert,
            };
            (self.store.new_arena(ArenaBuf::Temp(staging)), Some(dest), plan)
        };
        self.enqueue_parts(
            var,
            &[(start, count, stride)],
            id,
            arena,
            mem,
            false,
            false,
            user_buf,
            plan,
            nelems,
        );
        Ok(RequestId::from_raw(id))
    }

    fn validate_multi(
        &self,
        var: &Var,
        ranges: &[(&[i64], &[i64])],
        buf_len: usize,
        mem: MemType,
    ) -> Result<i64, Error> {
        let mut total = 0i64;
        for (start, count) in ranges {
            var.validate_access(start, count, None)?;
            total += count.iter().product::<i64>();
        }
        let expected = total as usize * mem.size();
        if buf_len != expected {
            return Err(Error::BufferSize { expected, got: buf_len });
        }
        Ok(total)
    }

    /// Build and enqueue the physical entries of one logical request.
    /// Requests spanning `R > 1` records split into one entry per record;
    /// the first entry overall is the lead and carries the request-wide
    /// state.
    #[allow(clippy::too_many_arguments)]
    fn enqueue_parts(
        &mut self,
        var: &Var,
        parts: &[(&[i64], &[i64], Option<&[i64]>)],
        id: i32,
        arena: u64,
        mem: MemType,
        need_swap_back: bool,
        range_flagged: bool,
        user_buf: Option<Vec<u8>>,
        plan: UnpackPlan,
        lead_nelems: i64,
    ) {
        let xsz = var.xsz();
        let mut entries: Vec<Queued> = Vec::new();
        let mut off = 0i64;
        let base = |start: Vec<i64>, count: Vec<i64>, stride: Option<Vec<i64>>,
                    bnelems: i64, num_recs: i64, off: i64| Queued {
            id,
            var: Arc::clone(var),
            start,
            count,
            stride,
            bnelems,
            num_recs,
            buf: BufAddr { arena, off },
            mem,
            need_swap_back: false,
            range_flagged: false,
            lead_nelems: 0,
            user_buf: None,
            plan: UnpackPlan::None,
            slot: usize::MAX,
            offset_start: 0,
            offset_end: 0,
        };

        for (start, count, stride) in parts {
            let pel: i64 = count.iter().product();
            if var.is_record() && count[0] > 1 && pel > 0 {
                let per_rec: i64 = count[1..].iter().product();
                let recs = count[0];
                let step = stride.map_or(1, |s| s[0]);
                for k in 0..recs {
                    let mut st = start.to_vec();
                    st[0] = start[0] + k * step;
                    let mut ct = count.to_vec();
                    ct[0] = 1;
                    entries.push(base(
                        st,
                        ct,
                        stride.map(|s| s.to_vec()),
                        per_rec,
                        if k == 0 { recs } else { 0 },
                        off + k * per_rec * xsz,
                    ));
                }
            } else {
                entries.push(base(
                    start.to_vec(),
                    count.to_vec(),
                    stride.map(|s| s.to_vec()),
                    pel,
                    1,
                    off,
                ));
            }
            off += pel * xsz;
        }
        if entries.is_empty() {
            // A multi-range request with no ranges still needs a queue
            // presence so the id resolves and takes part in commits.
            let nd = var.ndims().max(1);
            entries.push(base(vec![0; nd], vec![0; nd], None, 0, 1, 0));
        }

        // Only the lead keeps a positive record count; a later range that
        // split per record must not masquerade as one.
        for q in &mut entries[1..] {
            q.num_recs = 0;
        }
        let lead = &mut entries[0];
        lead.need_swap_back = need_swap_back;
        lead.range_flagged = range_flagged;
        lead.lead_nelems = lead_nelems;
        lead.user_buf = user_buf;
        lead.plan = plan;
        tracing::trace!(id, entries = entries.len(), "queued");
        self.store.enqueue(entries);
    }

    fn next_write_id(&mut self) -> i32 {
        let id = self.next_seq * 2;
        self.next_seq += 1;
        id
    }

    fn next_read_id(&mut self) -> i32 {
        let id = self.next_seq * 2 + 1;
        self.next_seq += 1;
        id
    }
}

fn parts_of<'a>(
    ranges: &'a [(&'a [i64], &'a [i64])],
) -> Vec<(&'a [i64], &'a [i64], Option<&'a [i64]>)> {
    ranges.iter().map(|(s, c)| (*s, *c, None)).collect()
}
