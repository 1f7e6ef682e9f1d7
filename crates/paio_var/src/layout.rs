//! File layout assignment and per-format variable-size ceilings.

use std::sync::Arc;

use crate::{Var, VarError, VarMeta};

/// Variables and record slabs are padded to this boundary.
const ALIGN: i64 = 4;

/// On-disk format variant. The variants differ in the width of offsets and
/// sizes they can encode, which caps how large a variable may be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVariant {
    /// 32-bit offsets and sizes.
    Classic,
    /// 64-bit offsets, 32-bit sizes.
    Offset64,
    /// 64-bit offsets and sizes.
    Data64,
}

impl FormatVariant {
    /// Maximum per-record byte size of a variable under this variant.
    ///
    /// The `- 3` leaves room for the size after it is rounded up to the
    /// 4-byte boundary.
    pub const fn max_vlen(self) -> i64 {
        match self {
            FormatVariant::Classic => i32::MAX as i64 - 3,
            FormatVariant::Offset64 => u32::MAX as i64 - 3,
            FormatVariant::Data64 => i64::MAX - 3,
        }
    }
}

/// Whether `var`'s per-record byte size fits under `vlen_max`, computed
/// without overflowing the running product.
fn fits_ceiling(var: &VarMeta, vlen_max: i64) -> bool {
    let mut prod = var.xsz();
    let from = if var.is_record() { 1 } else { 0 };
    for &extent in &var.shape[from..] {
        if extent > vlen_max / prod {
            return false;
        }
        prod *= extent;
    }
    true
}

/// Checks every variable's per-record size against `variant`'s ceiling.
///
/// At most one fixed-size variable may exceed the ceiling, and then only if
/// it is the last fixed-size variable defined and the dataset has no record
/// variables. At most one record variable may exceed the ceiling, and only
/// if it is the last record variable defined. Under [`FormatVariant::Data64`]
/// exceeding the ceiling is an error outright.
pub fn validate_var_sizes(vars: &[VarMeta], variant: FormatVariant) -> Result<(), VarError> {
    if vars.is_empty() {
        return Ok(());
    }
    let vlen_max = variant.max_vlen();

    // First pass: fixed-size variables. `last_is_large` tracks whether the
    // most recently seen fixed-size variable was the oversized one.
    let mut large_fix_vars = 0;
    let mut rec_vars = 0;
    let mut last_is_large = false;
    let mut large_name = String::new();
    for var in vars {
        if var.is_record() {
            rec_vars += 1;
            continue;
        }
        last_is_large = false;
        if !fits_ceiling(var, vlen_max) {
            if variant == FormatVariant::Data64 {
                return Err(VarError::TooLarge {
                    name: var.name.clone(),
                    variant,
                });
            }
            large_fix_vars += 1;
            large_name = var.name.clone();
            last_is_large = true;
        }
    }
    if large_fix_vars > 1 {
        return Err(VarError::MultipleLargeVars { variant });
    }
    if large_fix_vars == 1 && !last_is_large {
        return Err(VarError::LargeVarNotLast { name: large_name });
    }
    if rec_vars == 0 {
        return Ok(());
    }
    if large_fix_vars == 1 {
        return Err(VarError::RecordWithLargeFixedVar);
    }

    // Second pass: record variables.
    let mut large_rec_vars = 0;
    last_is_large = false;
    for var in vars {
        if !var.is_record() {
            continue;
        }
        last_is_large = false;
        if !fits_ceiling(var, vlen_max) {
            if variant == FormatVariant::Data64 {
                return Err(VarError::TooLarge {
                    name: var.name.clone(),
                    variant,
                });
            }
            large_rec_vars += 1;
            large_name = var.name.clone();
            last_is_large = true;
        }
    }
    if large_rec_vars > 1 {
        return Err(VarError::MultipleLargeVars { variant });
    }
    if large_rec_vars == 1 && !last_is_large {
        return Err(VarError::LargeVarNotLast { name: large_name });
    }
    Ok(())
}

const fn round_up(n: i64, align: i64) -> i64 {
    (n + align - 1) / align * align
}

/// The assigned file layout of a dataset's variables.
///
/// Fixed-size variables are laid out first, in definition order, each begin
/// padded to a 4-byte boundary. Record variables follow: record `r` of
/// record variable `v` lives at `v.begin + r * recsize`, where `recsize`
/// is the sum of all record variables' slabs, each padded to 4 bytes —
/// except when there is exactly one record variable, which is stored
/// unpadded.
#[derive(Debug, Clone)]
pub struct Layout {
    /// All variables, in definition order, with `begin` offsets assigned.
    pub vars: Vec<Var>,

    /// Byte stride between consecutive records of the record section.
    pub recsize: i64,

    /// File offset where the record section starts.
    pub begin_rec: i64,

    /// File offset of the on-disk record count (8 bytes, big-endian).
    pub numrecs_offset: i64,
}

impl Layout {
    /// Starts building a layout whose data section begins at `header_end`.
    pub fn builder(header_end: i64) -> LayoutBuilder {
        LayoutBuilder {
            header_end,
            numrecs_offset: 4,
            vars: Vec::new(),
        }
    }

    /// Looks a variable up by name.
    pub fn var(&self, name: &str) -> Option<&Var> {
        self.vars.iter().find(|v| v.name == name)
    }
}

/// Builder for [`Layout`]. Variables are added in definition order.
#[derive(Debug)]
pub struct LayoutBuilder {
    header_end: i64,
    numrecs_offset: i64,
    vars: Vec<VarMeta>,
}

impl LayoutBuilder {
    /// Overrides where the on-disk record count is stored (default: 4).
    pub fn numrecs_offset(mut self, offset: i64) -> Self {
        self.numrecs_offset = offset;
        self
    }

    /// Defines a variable. `shape[0] == UNLIMITED` makes it a record
    /// variable.
    pub fn var(mut self, name: impl Into<String>, xtype: crate::ExtType, shape: &[i64]) -> Self {
        self.vars.push(VarMeta::new(name, xtype, shape));
        self
    }

    /// Validates sizes against `variant` and assigns `begin` offsets.
    pub fn build(self, variant: FormatVariant) -> Result<Layout, VarError> {
        validate_var_sizes(&self.vars, variant)?;

        let mut vars = self.vars;
        let mut cursor = round_up(self.header_end, ALIGN);
        for var in vars.iter_mut().filter(|v| !v.is_record()) {
            var.begin = cursor;
            cursor += round_up(var.slab_bytes(), ALIGN);
        }

        let begin_rec = cursor;
        let num_rec_vars = vars.iter().filter(|v| v.is_record()).count();
        let mut recsize = 0;
        for var in vars.iter_mut().filter(|v| v.is_record()) {
            var.begin = begin_rec + recsize;
            recsize += if num_rec_vars == 1 {
                var.slab_bytes()
            } else {
                round_up(var.slab_bytes(), ALIGN)
            };
        }

        Ok(Layout {
            vars: vars.into_iter().map(Arc::new).collect(),
            recsize,
            begin_rec,
            numrecs_offset: self.numrecs_offset,
        })
    }
}
