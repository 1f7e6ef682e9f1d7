//! Element representation plumbing: native memory layouts on one side,
//! big-endian external layouts on the other, with range-clamping casts in
//! between.
//!
//! Out-of-range values never abort a conversion. They clamp to the nearest
//! representable value and raise a flag, and the caller records that flag in
//! the request's status while the (clamped) transfer goes ahead.

use paio_var::ExtType;

/// The caller's in-memory element type, independent of the variable's
/// external type. Any combination converts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
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

impl MemType {
    /// Bytes per element in the caller's buffer.
    pub fn size(self) -> usize {
        match self {
            MemType::I8 | MemType::U8 => 1,
            MemType::I16 | MemType::U16 => 2,
            MemType::I32 | MemType::U32 | MemType::F32 => 4,
            MemType::I64 | MemType::U64 | MemType::F64 => 8,
        }
    }

    pub(crate) fn kind(self) -> Kind {
        match self {
            MemType::I8 => Kind::I8,
            MemType::U8 => Kind::U8,
            MemType::I16 => Kind::I16,
            MemType::U16 => Kind::U16,
            MemType::I32 => Kind::I32,
            MemType::U32 => Kind::U32,
            MemType::I64 => Kind::I64,
            MemType::U64 => Kind::U64,
            MemType::F32 => Kind::F32,
            MemType::F64 => Kind::F64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
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

pub(crate) fn ext_kind(xtype: ExtType) -> Kind {
    match xtype {
        ExtType::I8 => Kind::I8,
        ExtType::U8 => Kind::U8,
        ExtType::I16 => Kind::I16,
        ExtType::U16 => Kind::U16,
        ExtType::I32 => Kind::I32,
        ExtType::U32 => Kind::U32,
        ExtType::I64 => Kind::I64,
        ExtType::U64 => Kind::U64,
        ExtType::F32 => Kind::F32,
        ExtType::F64 => Kind::F64,
    }
}

/// True when elements need a real numeric conversion, not just a byte swap.
pub(crate) fn need_convert(xtype: ExtType, mem: MemType) -> bool {
    ext_kind(xtype) != mem.kind()
}

/// True when same-type transfers still need their byte order flipped.
pub(crate) fn need_swap(xsz: i64) -> bool {
    xsz > 1 && cfg!(target_endian = "little")
}

/// Reverse the byte order of every `xsz`-sized element, in place.
pub(crate) fn swap_in_place(buf: &mut [u8], xsz: usize) {
    debug_assert!(xsz > 1);
    debug_assert_eq!(buf.len() % xsz, 0);
    for elem in buf.chunks_exact_mut(xsz) {
        elem.reverse();
    }
}

/// Exact integers ride in `I`; anything float-typed rides in `F`. Integer
/// casts through `I` are lossless up to the clamp; float paths keep the
/// precision C's casts would.
#[derive(Clone, Copy)]
enum Value {
    I(i128),
    F(f64),
}

trait Prim: Copy {
    const SIZE: usize;
    fn from_ne(b: &[u8]) -> Self;
    fn to_ne(self, out: &mut [u8]);
    fn from_be(b: &[u8]) -> Self;
    fn to_be(self, out: &mut [u8]);
    fn to_value(self) -> Value;
    /// Returns the (possibly clamped) value and whether clamping happened.
    fn from_value(v: Value) -> (Self, bool);
}

macro_rules! prim_bytes {
    ($t:ty) => {
        const SIZE: usize = std::mem::size_of::<$t>();
        fn from_ne(b: &[u8]) -> Self {
            let mut a = [0u8; std::mem::size_of::<$t>()];
            a.copy_from_slice(&b[..Self::SIZE]);
            <$t>::from_ne_bytes(a)
        }
        fn to_ne(self, out: &mut [u8]) {
            out[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
        }
        fn from_be(b: &[u8]) -> Self {
            let mut a = [0u8; std::mem::size_of::<$t>()];
            a.copy_from_slice(&b[..Self::SIZE]);
            <$t>::from_be_bytes(a)
        }
        fn to_be(self, out: &mut [u8]) {
            out[..Self::SIZE].copy_from_slice(&self.to_be_bytes());
        }
    };
}

macro_rules! prim_int {
    ($t:ty) => {
        impl Prim for $t {
            prim_bytes!($t);
            fn to_value(self) -> Value {
                Value::I(self as i128)
            }
            fn from_value(v: Value) -> (Self, bool) {
                match v {
                    Value::I(i) if i < <$t>::MIN as i128 => (<$t>::MIN, true),
                    Value::I(i) if i > <$t>::MAX as i128 => (<$t>::MAX, true),
                    Value::I(i) => (i as $t, false),
                    // `as` saturates floats, and turns NaN into zero.
                    Value::F(f) => {
                        let in_range = f >= <$t>::MIN as f64 && f <= <$t>::MAX as f64;
                        (f as $t, !in_range)
                    }
                }
            }
        }
    };
}

prim_int!(i8);
prim_int!(u8);
prim_int!(i16);
prim_int!(u16);
prim_int!(i32);
prim_int!(u32);
prim_int!(i64);
prim_int!(u64);

impl Prim for f32 {
    prim_bytes!(f32);
    fn to_value(self) -> Value {
        Value::F(self as f64)
    }
    fn from_value(v: Value) -> (Self, bool) {
        match v {
            Value::I(i) => (i as f32, false),
            Value::F(f) => {
                let overflow = f.is_finite() && f.abs() > f32::MAX as f64;
                (f as f32, overflow)
            }
        }
    }
}

impl Prim for f64 {
    prim_bytes!(f64);
    fn to_value(self) -> Value {
        Value::F(self)
    }
    fn from_value(v: Value) -> (Self, bool) {
        match v {
            Value::I(i) => (i as f64, false),
            Value::F(f) => (f, false),
        }
    }
}

macro_rules! with_prim {
    ($kind:expr, $T:ident, $body:block) => {
        match $kind {
            Kind::I8 => {
                type $T = i8;
                $body
            }
            Kind::U8 => {
                type $T = u8;
                $body
            }
            Kind::I16 => {
                type $T = i16;
                $body
            }
            Kind::U16 => {
                type $T = u16;
                $body
            }
            Kind::I32 => {
                type $T = i32;
                $body
            }
            Kind::U32 => {
                type $T = u32;
                $body
            }
            Kind::I64 => {
                type $T = i64;
                $body
            }
            Kind::U64 => {
                type $T = u64;
                $body
            }
            Kind::F32 => {
                type $T = f32;
                $body
            }
            Kind::F64 => {
                type $T = f64;
                $body
            }
        }
    };
}

fn to_ext_loop<M: Prim, X: Prim>(src: &[u8], dst: &mut [u8], nelems: usize) -> bool {
    let mut clamped = false;
    for k in 0..nelems {
        let m = M::from_ne(&src[k * M::SIZE..]);
        let (x, c) = X::from_value(m.to_value());
        clamped |= c;
        x.to_be(&mut dst[k * X::SIZE..]);
    }
    clamped
}

fn from_ext_loop<X: Prim, M: Prim>(src: &[u8], dst: &mut [u8], nelems: usize) -> bool {
    let mut clamped = false;
    for k in 0..nelems {
        let x = X::from_be(&src[k * X::SIZE..]);
        let (m, c) = M::from_value(x.to_value());
        clamped |= c;
        m.to_ne(&mut dst[k * M::SIZE..]);
    }
    clamped
}

/// Convert `nelems` native elements of `mem` type into big-endian external
/// elements. Returns true if any value had to be clamped.
pub(crate) fn pack_to_ext(
    mem: MemType,
    xtype: ExtType,
    src: &[u8],
    dst: &mut [u8],
    nelems: usize,
) -> bool {
    with_prim!(mem.kind(), M, {
        with_prim!(ext_kind(xtype), X, { to_ext_loop::<M, X>(src, dst, nelems) })
    })
}

/// Convert `nelems` big-endian external elements into native `mem` elements.
/// Returns true if any value had to be clamped.
pub(crate) fn unpack_from_ext(
    xtype: ExtType,
    mem: MemType,
    src: &[u8],
    dst: &mut [u8],
    nelems: usize,
) -> bool {
    with_prim!(ext_kind(xtype), X, {
        with_prim!(mem.kind(), M, { from_ext_loop::<X, M>(src, dst, nelems) })
    })
}

fn gather_loop<M: Prim, X: Prim>(
    src: &[u8],
    dst: &mut [u8],
    count: &[i64],
    imap: &[i64],
) -> bool {
    let total: i64 = count.iter().product();
    let mut idx = vec![0i64; count.len()];
    let mut clamped = false;
    for k in 0..total as usize {
        let src_elem: i64 = idx.iter().zip(imap).map(|(i, m)| i * m).sum();
        let m = M::from_ne(&src[src_elem as usize * M::SIZE..]);
        let (x, c) = X::from_value(m.to_value());
        clamped |= c;
        x.to_be(&mut dst[k * X::SIZE..]);
        for d in (0..count.len()).rev() {
            idx[d] += 1;
            if idx[d] < count[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    clamped
}

fn scatter_loop<X: Prim, M: Prim>(
    src: &[u8],
    dst: &mut [u8],
    count: &[i64],
    imap: &[i64],
) -> bool {
    let total: i64 = count.iter().product();
    let mut idx = vec![0i64; count.len()];
    let mut clamped = false;
    for k in 0..total as usize {
        let dst_elem: i64 = idx.iter().zip(imap).map(|(i, m)| i * m).sum();
        let x = X::from_be(&src[k * X::SIZE..]);
        let (m, c) = M::from_value(x.to_value());
        clamped |= c;
        m.to_ne(&mut dst[dst_elem as usize * M::SIZE..]);
        for d in (0..count.len()).rev() {
            idx[d] += 1;
            if idx[d] < count[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    clamped
}

/// Gather elements out of a caller buffer through an index map, converting
/// into consecutive big-endian external elements. `imap[d]` is the caller
/// buffer's element stride for dimension `d` of `count`; iteration runs in
/// row-major order over `count`.
pub(crate) fn gather_mapped(
    mem: MemType,
    xtype: ExtType,
    src: &[u8],
    dst: &mut [u8],
    count: &[i64],
    imap: &[i64],
) -> bool {
    with_prim!(mem.kind(), M, {
        with_prim!(ext_kind(xtype), X, { gather_loop::<M, X>(src, dst, count, imap) })
    })
}

/// Inverse of [`gather_mapped`]: scatter consecutive external elements into
/// a caller buffer through an index map. Bytes of `dst` the map never names
/// are left untouched.
pub(crate) fn scatter_mapped(
    xtype: ExtType,
    mem: MemType,
    src: &[u8],
    dst: &mut [u8],
    count: &[i64],
    imap: &[i64],
) -> bool {
    with_prim!(ext_kind(xtype), X, {
        with_prim!(mem.kind(), M, { scatter_loop::<X, M>(src, dst, count, imap) })
    })
}
