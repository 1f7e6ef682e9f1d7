use std::sync::{Arc, Condvar, Mutex};

use crate::{CommError, Communicator};

/// State of the round in flight, shared by all ranks of a [`LocalGroup`].
#[derive(Debug, Default)]
struct Round {
    /// Ranks that have arrived at the current collective.
    arrived: usize,

    /// Bumped when a round completes; waiters watch this, not `arrived`,
    /// so a fast rank re-entering the next round cannot confuse them.
    generation: u64,

    /// Element-wise running maximum of the values brought so far.
    acc: Vec<i64>,

    /// Result of the last completed round.
    result: Vec<i64>,
}

#[derive(Debug, Default)]
struct Shared {
    round: Mutex<Round>,
    all_arrived: Condvar,
}

/// An in-process group of `size` ranks backed by one shared rendezvous.
///
/// `LocalGroup::new(n)` hands out `n` endpoints; move each into its own
/// thread. The group exists to exercise the engine's collective paths in
/// tests and benches without a multi-process launcher.
#[derive(Debug)]
pub struct LocalGroup;

impl LocalGroup {
    /// Creates the group and returns one [`GroupComm`] endpoint per rank.
    pub fn new(size: usize) -> Vec<GroupComm> {
        assert!(size > 0, "a process group needs at least one rank");
        let shared = Arc::new(Shared::default());
        (0..size)
            .map(|rank| GroupComm {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One rank's endpoint of a [`LocalGroup`].
#[derive(Debug)]
pub struct GroupComm {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl GroupComm {
    /// Runs one collective round: fold `vals` into the accumulator, wait
    /// for the rest of the group, and copy the reduced result back out.
    fn rendezvous(&self, vals: &mut [i64]) -> Result<(), CommError> {
        let mut round = self.shared.round.lock().map_err(|_| CommError::Poisoned)?;

        if round.arrived == 0 {
            round.acc = vals.to_vec();
        } else {
            if round.acc.len() != vals.len() {
                return Err(CommError::WidthMismatch {
                    expected: round.acc.len(),
                    got: vals.len(),
                });
            }
            for (acc, val) in round.acc.iter_mut().zip(vals.iter()) {
                *acc = (*acc).max(*val);
            }
        }
        round.arrived += 1;

        if round.arrived == self.size {
            // Last to arrive: publish the result and open the next round.
            round.arrived = 0;
            round.generation = round.generation.wrapping_add(1);
            round.result = std::mem::take(&mut round.acc);
            vals.copy_from_slice(&round.result);
            self.shared.all_arrived.notify_all();
        } else {
            let generation = round.generation;
            while round.generation == generation {
                round = self
                    .shared
                    .all_arrived
                    .wait(round)
                    .map_err(|_| CommError::Poisoned)?;
            }
            // `result` stays intact until every rank of this round has
            // returned: the next round cannot complete without us.
            vals.copy_from_slice(&round.result);
        }
        Ok(())
    }
}

impl Communicator for GroupComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn allreduce_max(&self, vals: &mut [i64]) -> Result<(), CommError> {
        self.rendezvous(vals)
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.rendezvous(&mut [])
    }
}
