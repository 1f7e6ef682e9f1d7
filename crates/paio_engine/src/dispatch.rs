//! Drive composed regions through the transport.
//!
//! The file-side and memory-side block lists describe the same byte stream
//! in two coordinate systems. A write gathers the staging slices covering
//! each contiguous file block into one vectored call; a read stages each
//! file block into scratch and scatters it back out. Both walk the memory
//! list with a single cursor and never look back.

use std::collections::HashMap;
use std::io::IoSlice;

use crate::abuf::AttachedBuf;
use crate::error::Error;
use crate::region::{MemBlock, Regions};
use crate::store::ArenaBuf;
use crate::transport::FileIo;

struct MemCursor<'r> {
    blocks: &'r [MemBlock],
    idx: usize,
    used: i64,
}

impl<'r> MemCursor<'r> {
    fn new(blocks: &'r [MemBlock]) -> Self {
        MemCursor { blocks, idx: 0, used: 0 }
    }

    /// Next run of up to `max` bytes: `(arena, offset, len)`.
    fn take(&mut self, max: i64) -> (u64, i64, i64) {
        let mb = &self.blocks[self.idx];
        let avail = mb.len as i64 - self.used;
        let len = avail.min(max);
        let out = (mb.arena, mb.off + self.used, len);
        self.used += len;
        if self.used == mb.len as i64 {
            self.idx += 1;
            self.used = 0;
        }
        out
    }
}

fn arena_slice<'a>(
    arenas: &'a HashMap<u64, ArenaBuf>,
    pool: Option<&'a AttachedBuf>,
    arena: u64,
    off: i64,
    len: i64,
) -> &'a [u8] {
    let bytes = match &arenas[&arena] {
        ArenaBuf::Caller(v) | ArenaBuf::Temp(v) => v.as_slice(),
        ArenaBuf::Pool { index } => {
            let pool = pool.unwrap_or_else(|| unreachable!("pool entry with no pool attached"));
            pool.slice(*index)
        }
    };
    &bytes[off as usize..(off + len) as usize]
}

fn arena_slice_mut(
    arenas: &mut HashMap<u64, ArenaBuf>,
    arena: u64,
    off: i64,
    len: i64,
) -> &mut [u8] {
    let bytes = match arenas.get_mut(&arena) {
        Some(ArenaBuf::Caller(v)) | Some(ArenaBuf::Temp(v)) => v.as_mut_slice(),
        // Reads never stage through the pool.
        _ => unreachable!("read entry without a writable arena"),
    };
    &mut bytes[off as usize..(off + len) as usize]
}

/// Write every region out. Returns the bytes moved.
pub(crate) fn execute_write(
    fio: &mut dyn FileIo,
    regions: &Regions,
    arenas: &HashMap<u64, ArenaBuf>,
    pool: Option<&AttachedBuf>,
) -> Result<i64, Error> {
    let mut cursor = MemCursor::new(&regions.mem);
    let mut iov: Vec<IoSlice<'_>> = Vec::new();
    for fb in &regions.file {
        iov.clear();
        let mut need = fb.len as i64;
        while need > 0 {
            let (arena, off, len) = cursor.take(need);
            iov.push(IoSlice::new(arena_slice(arenas, pool, arena, off, len)));
            need -= len;
        }
        fio.writev_at(&iov, fb.off).map_err(|e| Error::Write(e.to_string()))?;
    }
    tracing::trace!(blocks = regions.file.len(), bytes = regions.total_bytes(), "wrote");
    Ok(regions.total_bytes())
}

/// Read every region in, staging each file block and scattering it into
/// the arenas. Returns the bytes moved.
pub(crate) fn execute_read(
    fio: &mut dyn FileIo,
    regions: &Regions,
    arenas: &mut HashMap<u64, ArenaBuf>,
) -> Result<i64, Error> {
    let mut cursor = MemCursor::new(&regions.mem);
    let mut staging = Vec::new();
    for fb in &regions.file {
        staging.resize(fb.len as usize, 0);
        fio.read_at(&mut staging, fb.off).map_err(|e| Error::Read(e.to_string()))?;
        let mut done = 0i64;
        while done < fb.len as i64 {
            let (arena, off, len) = cursor.take(fb.len as i64 - done);
            arena_slice_mut(arenas, arena, off, len)
                .copy_from_slice(&staging[done as usize..(done + len) as usize]);
            done += len;
        }
    }
    tracing::trace!(blocks = regions.file.len(), bytes = regions.total_bytes(), "read");
    Ok(regions.total_bytes())
}

#[cfg(test)]
mod tests {
    use crate::region::FileBlock;
    use crate::transport::LocalFile;

    use super::*;

    fn arenas_of(bufs: Vec<Vec<u8>>) -> HashMap<u64, ArenaBuf> {
        bufs.into_iter()
            .enumerate()
            .map(|(i, v)| (i as u64, ArenaBuf::Caller(v)))
            .collect()
    }

    fn file_in(dir: &tempfile::TempDir) -> LocalFile {
        LocalFile::create(dir.path().join("t")).unwrap()
    }

    #[test]
    fn write_zippers_misaligned_streams() {
        // Memory: [4][6] across two arenas; file: [6][4] at two offsets.
        let dir = tempfile::tempdir().unwrap();
        let mut f = file_in(&dir);
        let arenas = arenas_of(vec![b"abcd".to_vec(), b"efghij".to_vec()]);
        let regions = Regions {
            file: vec![FileBlock { off: 0, len: 6 }, FileBlock { off: 10, len: 4 }],
            mem: vec![
                MemBlock { arena: 0, off: 0, len: 4 },
                MemBlock { arena: 1, off: 0, len: 6 },
            ],
        };
        let n = execute_write(&mut f, &regions, &arenas, None).unwrap();
        assert_eq!(n, 10);

        let mut back = vec![0u8; 14];
        f.read_at(&mut back, 0).unwrap();
        assert_eq!(&back, b"abcdef\0\0\0\0ghij");
    }

    #[test]
    fn read_scatters_into_arenas() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = file_in(&dir);
        f.writev_at(&[IoSlice::new(b"0123456789")], 0).unwrap();

        let mut arenas = arenas_of(vec![vec![0; 3], vec![0; 4]]);
        let regions = Regions {
            file: vec![FileBlock { off: 2, len: 5 }, FileBlock { off: 8, len: 2 }],
            mem: vec![
                MemBlock { arena: 0, off: 0, len: 3 },
                MemBlock { arena: 1, off: 0, len: 4 },
            ],
        };
        let n = execute_read(&mut f, &regions, &mut arenas).unwrap();
        assert_eq!(n, 7);
        match (&arenas[&0], &arenas[&1]) {
            (ArenaBuf::Caller(a), ArenaBuf::Caller(b)) => {
                assert_eq!(a.as_slice(), b"234");
                assert_eq!(b.as_slice(), b"5689");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn empty_regions_touch_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = file_in(&dir);
        let arenas = HashMap::new();
        let regions = Regions::default();
        assert_eq!(execute_write(&mut f, &regions, &arenas, None).unwrap(), 0);
    }

    #[test]
    fn pool_backed_blocks_write_from_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = file_in(&dir);
        let mut pool = AttachedBuf::new(16);
        let slot = pool.alloc(4).unwrap();
        pool.slice_mut(slot).copy_from_slice(b"pppp");
        let mut arenas = HashMap::new();
        arenas.insert(0u64, ArenaBuf::Pool { index: slot });
        let regions = Regions {
            file: vec![FileBlock { off: 0, len: 4 }],
            mem: vec![MemBlock { arena: 0, off: 0, len: 4 }],
        };
        execute_write(&mut f, &regions, &arenas, Some(&pool)).unwrap();
        let mut back = vec![0u8; 4];
        f.read_at(&mut back, 0).unwrap();
        assert_eq!(&back, b"pppp");
    }
}
