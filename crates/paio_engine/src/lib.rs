#![doc = include_str!("../README.md")]

pub(crate) mod abuf;
pub(crate) mod commit;
pub(crate) mod convert;
pub(crate) mod dataset;
pub(crate) mod dispatch;
pub(crate) mod error;
pub(crate) mod flatten;
pub(crate) mod merge;
pub(crate) mod region;
pub(crate) mod request;
pub(crate) mod store;
pub(crate) mod transport;

pub use crate::convert::MemType;
pub use crate::dataset::{Dataset, DatasetOptions};
pub use crate::error::{Error, Status};
pub use crate::request::{Completion, RequestId, Selector, WaitOutcome};
pub use crate::transport::{FileIo, LocalFile};

// The metadata and process-group crates travel with the engine; re-export
// them so callers can set a dataset up from this crate alone.
pub use paio_comm::{CommError, Communicator, GroupComm, LocalGroup, SoloComm};
pub use paio_var::{
    ExtType, FormatVariant, Layout, LayoutBuilder, Var, VarError, VarMeta, UNLIMITED,
};
