#![doc = include_str!("../README.md")]

mod group;

pub use group::{GroupComm, LocalGroup};

/// Errors surfaced by collective operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    /// Ranks entered the same collective with different value widths.
    #[error("collective entered with width {got}, another rank used {expected}")]
    WidthMismatch {
        /// Width used by the rank that opened the round.
        expected: usize,
        /// Width this rank brought.
        got: usize,
    },

    /// Another rank panicked while holding the group state.
    #[error("process group state poisoned by a panicked rank")]
    Poisoned,
}

/// One rank's endpoint into a process group.
///
/// All collective methods must be called by every rank of the group, in the
/// same order, with the same `vals` width. `allreduce_max` blocks until all
/// ranks arrive and leaves the element-wise maximum in `vals` on every rank.
pub trait Communicator: Send {
    /// This rank's index, `0..size`.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Element-wise max-reduction across all ranks, in place.
    fn allreduce_max(&self, vals: &mut [i64]) -> Result<(), CommError>;

    /// Blocks until every rank of the group has arrived.
    fn barrier(&self) -> Result<(), CommError>;

    /// Whether this rank is the designated metadata writer.
    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// The one-rank group: every collective is an identity operation.
#[derive(Debug, Default)]
pub struct SoloComm;

impl Communicator for SoloComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn allreduce_max(&self, _vals: &mut [i64]) -> Result<(), CommError> {
        Ok(())
    }

    fn barrier(&self) -> Result<(), CommError> {
        Ok(())
    }
}
