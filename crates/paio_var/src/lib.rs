#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

use std::sync::Arc;

mod layout;

pub use layout::{validate_var_sizes, FormatVariant, Layout, LayoutBuilder};

/// Extent of an unlimited (record) dimension.
///
/// A variable whose first dimension has this extent grows by whole records;
/// its storage for record `r` lives at `begin + r * recsize`, where
/// `recsize` is the dataset-wide record stride computed by [`Layout`].
pub const UNLIMITED: i64 = 0;

/// External (on-file) element types. The file encoding is big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ExtType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ExtType {
    /// Size of one element in its external encoding, in bytes.
    pub const fn xsz(self) -> usize {
        match self {
            ExtType::I8 | ExtType::U8 => 1,
            ExtType::I16 | ExtType::U16 => 2,
            ExtType::I32 | ExtType::U32 | ExtType::F32 => 4,
            ExtType::I64 | ExtType::U64 | ExtType::F64 => 8,
        }
    }
}

/// Errors reported by shape/size validation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VarError {
    /// A selector's rank does not match the variable's rank.
    #[error("selector rank {got} does not match variable rank {expected}")]
    RankMismatch {
        /// The variable's number of dimensions.
        expected: usize,
        /// The selector's number of entries.
        got: usize,
    },

    /// A start or count entry is negative.
    #[error("negative start or count in dimension {dim}")]
    NegativeEdge {
        /// Dimension index.
        dim: usize,
    },

    /// A stride entry is less than 1.
    #[error("stride must be at least 1, got {stride} in dimension {dim}")]
    BadStride {
        /// Dimension index.
        dim: usize,
        /// The offending stride.
        stride: i64,
    },

    /// The access reaches past the dimension's extent.
    #[error("access reaches index {end} in dimension {dim} but the extent is {extent}")]
    OutOfBounds {
        /// Dimension index.
        dim: usize,
        /// Last index the access touches.
        end: i64,
        /// Declared extent of the dimension.
        extent: i64,
    },

    /// A variable's per-record size exceeds the format's ceiling.
    #[error("variable {name:?} exceeds the {variant:?} per-record size ceiling")]
    TooLarge {
        /// Name of the offending variable.
        name: String,
        /// The format variant whose ceiling was exceeded.
        variant: FormatVariant,
    },

    /// More than one variable exceeds the ceiling.
    #[error("only one variable may exceed the {variant:?} size ceiling")]
    MultipleLargeVars {
        /// The format variant whose ceiling was exceeded.
        variant: FormatVariant,
    },

    /// The oversized variable is not the last one defined.
    #[error("variable {name:?} exceeds the size ceiling but is not the last one defined")]
    LargeVarNotLast {
        /// Name of the offending variable.
        name: String,
    },

    /// A record variable coexists with an oversized fixed-size variable.
    #[error("record variables are not allowed when a fixed-size variable exceeds the size ceiling")]
    RecordWithLargeFixedVar,
}

/// Metadata describing one variable of the dataset.
///
/// `shape[0] == UNLIMITED` marks a record variable. Extents are element
/// counts, not bytes. `begin` is the byte offset of the variable's data in
/// the file (for a record variable, of its slab within record 0) and is
/// assigned by [`Layout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarMeta {
    /// Variable name, unique in the dataset.
    pub name: String,

    /// External element type.
    pub xtype: ExtType,

    /// Per-dimension extents; `shape[0] == UNLIMITED` for a record variable.
    pub shape: Vec<i64>,

    /// Starting byte offset of the variable's data in the file.
    pub begin: i64,
}

impl VarMeta {
    /// Creates a variable with an unassigned `begin` offset.
    pub fn new(name: impl Into<String>, xtype: ExtType, shape: &[i64]) -> Self {
        Self {
            name: name.into(),
            xtype,
            shape: shape.to_vec(),
            begin: 0,
        }
    }

    /// Number of dimensions.
    pub fn ndims(&self) -> usize {
        self.shape.len()
    }

    /// Whether the variable's first dimension is the record dimension.
    pub fn is_record(&self) -> bool {
        self.shape.first() == Some(&UNLIMITED)
    }

    /// External element size in bytes, widened for file-offset arithmetic.
    pub fn xsz(&self) -> i64 {
        self.xtype.xsz() as i64
    }

    /// Number of elements in one record's worth of this variable.
    ///
    /// For a fixed-size variable this is the total element count; for a
    /// record variable, the product of the extents after the record
    /// dimension. A 0-dimensional variable holds one element.
    pub fn nelems_per_record(&self) -> i64 {
        let dims = if self.is_record() {
            &self.shape[1..]
        } else {
            &self.shape[..]
        };
        dims.iter().product()
    }

    /// Bytes occupied by one record's worth of this variable, unpadded.
    pub fn slab_bytes(&self) -> i64 {
        self.nelems_per_record() * self.xsz()
    }

    /// Checks a start/count/stride selector against the variable's shape.
    ///
    /// `stride == None` means unit stride in every dimension. The record
    /// dimension of a record variable has no upper bound; every other
    /// dimension must satisfy `start + (count - 1) * stride < extent`.
    /// A zero count in some dimension is legal (the access is empty).
    pub fn validate_access(
        &self,
        start: &[i64],
        count: &[i64],
        stride: Option<&[i64]>,
    ) -> Result<(), VarError> {
        let ndims = self.ndims();
        if start.len() != ndims {
            return Err(VarError::RankMismatch {
                expected: ndims,
                got: start.len(),
            });
        }
        if count.len() != ndims {
            return Err(VarError::RankMismatch {
                expected: ndims,
                got: count.len(),
            });
        }
        if let Some(s) = stride {
            if s.len() != ndims {
                return Err(VarError::RankMismatch {
                    expected: ndims,
                    got: s.len(),
                });
            }
        }
        for dim in 0..ndims {
            if start[dim] < 0 || count[dim] < 0 {
                return Err(VarError::NegativeEdge { dim });
            }
            let step = stride.map_or(1, |s| s[dim]);
            if step < 1 {
                return Err(VarError::BadStride { dim, stride: step });
            }
            if count[dim] == 0 {
                continue;
            }
            let end = start[dim] + (count[dim] - 1) * step;
            let unbounded = dim == 0 && self.is_record();
            if !unbounded && end >= self.shape[dim] {
                return Err(VarError::OutOfBounds {
                    dim,
                    end,
                    extent: self.shape[dim],
                });
            }
        }
        Ok(())
    }
}

/// Shorthand for the shared-ownership form the engine passes around.
pub type Var = Arc<VarMeta>;
