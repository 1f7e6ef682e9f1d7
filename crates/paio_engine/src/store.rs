//! Pending-request bookkeeping: two id-ordered lists (writes and reads),
//! plus ownership of every staging arena, keyed by arena id.
//!
//! Entries of one logical request sit consecutively in their list, so
//! extraction by id is a scan for the first entry followed by a run. The
//! lists are rebuilt without the extracted entries in one pass, preserving
//! posting order for whatever stays behind.

use std::collections::HashMap;
use std::mem;

use crate::error::Error;
use crate::request::{Completion, Queued, RequestId, Selector};

/// The allocation backing one logical request's external-format bytes.
#[derive(Debug)]
pub(crate) enum ArenaBuf {
    /// The caller's own buffer, to be handed back at completion.
    Caller(Vec<u8>),
    /// Engine-owned staging, dropped at release.
    Temp(Vec<u8>),
    /// A slot of the attached pool; the bytes live there.
    Pool { index: usize },
}

/// Everything a wait or cancel call pulled out of the store in one go.
#[derive(Debug)]
pub(crate) struct Extracted {
    pub(crate) puts: Vec<Queued>,
    pub(crate) gets: Vec<Queued>,
    pub(crate) arenas: HashMap<u64, ArenaBuf>,
    /// One slot per logical request, in selector order. Entries point into
    /// this via `Queued::slot`.
    pub(crate) slots: Vec<Completion>,
    /// First error hit during extraction (an unknown id, typically).
    pub(crate) first_err: Option<Error>,
}

#[derive(Debug, Default)]
pub(crate) struct ReqStore {
    puts: Vec<Queued>,
    gets: Vec<Queued>,
    arenas: HashMap<u64, ArenaBuf>,
    next_arena: u64,
}

impl ReqStore {
    pub(crate) fn new_arena(&mut self, buf: ArenaBuf) -> u64 {
        let id = self.next_arena;
        self.next_arena += 1;
        self.arenas.insert(id, buf);
        id
    }

    /// Append the entries of one freshly posted logical request. All
    /// entries share an id; its parity picks the list.
    pub(crate) fn enqueue(&mut self, entries: Vec<Queued>) {
        debug_assert!(!entries.is_empty());
        debug_assert!(entries.windows(2).all(|w| w[0].id == w[1].id));
        let list = if entries[0].id & 1 == 1 { &mut self.gets } else { &mut self.puts };
        list.extend(entries);
    }

    pub(crate) fn num_pending_writes(&self) -> usize {
        self.puts.len()
    }

    pub(crate) fn num_pending_reads(&self) -> usize {
        self.gets.len()
    }

    /// Pull the selected requests out of the store. Unknown ids report
    /// [`Error::InvalidRequest`] in their slot and do not disturb the rest.
    pub(crate) fn extract(&mut self, sel: Selector<'_>) -> Extracted {
        match sel {
            Selector::Ids(ids) => self.extract_ids(ids),
            Selector::All => self.extract_whole(true, true),
            Selector::Writes => self.extract_whole(true, false),
            Selector::Reads => self.extract_whole(false, true),
        }
    }

    fn extract_ids(&mut self, ids: &[RequestId]) -> Extracted {
        let mut slots: Vec<Completion> = ids
            .iter()
            .map(|&id| Completion { id, status: Ok(()), buf: None })
            .collect();
        let mut first_err = None;

        let mut put_slot: Vec<Option<usize>> = vec![None; self.puts.len()];
        let mut get_slot: Vec<Option<usize>> = vec![None; self.gets.len()];
        let mut put_cursor = 0usize;
        let mut get_cursor = 0usize;

        for (slot, &rid) in ids.iter().enumerate() {
            let (list, taken, cursor) = if rid.is_read() {
                (&self.gets, &mut get_slot, &mut get_cursor)
            } else {
                (&self.puts, &mut put_slot, &mut put_cursor)
            };
            let raw = rid.raw();
            let mut k = *cursor;
            while k < list.len() && (taken[k].is_some() || list[k].id != raw) {
                k += 1;
            }
            if k == list.len() {
                slots[slot].status = Err(Error::InvalidRequest(rid));
                if first_err.is_none() {
                    first_err = Some(Error::InvalidRequest(rid));
                }
                continue;
            }
            while k < list.len() && list[k].id == raw {
                taken[k] = Some(slot);
                k += 1;
            }
            while *cursor < list.len() && taken[*cursor].is_some() {
                *cursor += 1;
            }
        }

        let mut out = Extracted {
            puts: Vec::new(),
            gets: Vec::new(),
            arenas: HashMap::new(),
            slots: Vec::new(),
            first_err,
        };
        self.rebuild(true, &put_slot, &mut out);
        self.rebuild(false, &get_slot, &mut out);
        out.slots = slots;
        out
    }

    /// One pass over a list: extracted entries move out (tagged with their
    /// slot), the rest slide forward in order.
    fn rebuild(&mut self, writes: bool, taken: &[Option<usize>], out: &mut Extracted) {
        let list = if writes { &mut self.puts } else { &mut self.gets };
        let old = mem::take(list);
        let dst = if writes { &mut out.puts } else { &mut out.gets };
        for (k, mut q) in old.into_iter().enumerate() {
            match taken[k] {
                Some(slot) => {
                    q.slot = slot;
                    if let Some(a) = self.arenas.remove(&q.buf.arena) {
                        out.arenas.insert(q.buf.arena, a);
                    }
                    dst.push(q);
                }
                None => {
                    let list = if writes { &mut self.puts } else { &mut self.gets };
                    list.push(q);
                }
            }
        }
    }

    fn extract_whole(&mut self, writes: bool, reads: bool) -> Extracted {
        let mut out = Extracted {
            puts: Vec::new(),
            gets: Vec::new(),
            arenas: HashMap::new(),
            slots: Vec::new(),
            first_err: None,
        };
        if writes {
            out.puts = mem::take(&mut self.puts);
        }
        if reads {
            out.gets = mem::take(&mut self.gets);
        }
        let mut last_id: Option<i32> = None;
        for q in out.puts.iter_mut().chain(out.gets.iter_mut()) {
            if last_id != Some(q.id) {
                out.slots.push(Completion {
                    id: RequestId::from_raw(q.id),
                    status: Ok(()),
                    buf: None,
                });
                last_id = Some(q.id);
            }
            q.slot = out.slots.len() - 1;
            if let Some(a) = self.arenas.remove(&q.buf.arena) {
                out.arenas.insert(q.buf.arena, a);
            }
        }
        out
    }
}
