//! Positioned, vectored file access behind a small trait, so the engine
//! can be pointed at anything byte-addressable.

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice};
use std::path::Path;

use nix::sys::uio::{pread, pwritev};

/// Most kernels cap an iovec list at 1024 entries.
const IOV_BATCH: usize = 1024;

/// Byte-level transport the committer drives. One contiguous span of the
/// file per call; the scatter/gather across spans happens above this trait.
pub trait FileIo: Send {
    /// Write the concatenation of `bufs` at `offset`, entirely.
    fn writev_at(&mut self, bufs: &[IoSlice<'_>], offset: i64) -> io::Result<()>;

    /// Fill `buf` from `offset`. Bytes past end-of-file read as zero.
    fn read_at(&mut self, buf: &mut [u8], offset: i64) -> io::Result<()>;

    /// Push everything written so far to stable storage.
    fn sync(&mut self) -> io::Result<()>;
}

/// [`FileIo`] over one local file.
#[derive(Debug)]
pub struct LocalFile {
    file: File,
}

impl LocalFile {
    /// Open for read/write, creating the file if needed.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        Ok(LocalFile { file })
    }

    /// Open an existing file for read/write.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(LocalFile { file })
    }
}

impl FileIo for LocalFile {
    fn writev_at(&mut self, bufs: &[IoSlice<'_>], offset: i64) -> io::Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut done = 0usize;
        let mut iov: Vec<IoSlice<'_>> = Vec::with_capacity(bufs.len().min(IOV_BATCH));
        while done < total {
            iov.clear();
            let mut seen = 0usize;
            for b in bufs {
                if seen + b.len() <= done {
                    seen += b.len();
                    continue;
                }
                // Only the first unconsumed buffer can be partially done.
                let skip = done.saturating_sub(seen);
                iov.push(IoSlice::new(&b[skip..]));
                seen += b.len();
                if iov.len() == IOV_BATCH {
                    break;
                }
            }
            match pwritev(&self.file, &iov, offset + done as i64) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "pwritev made no progress",
                    ))
                }
                Ok(n) => done += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
        Ok(())
    }

    fn read_at(&mut self, buf: &mut [u8], offset: i64) -> io::Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            match pread(&self.file, &mut buf[done..], offset + done as i64) {
                Ok(0) => {
                    // Reading a hole or past EOF: the bytes are zero.
                    buf[done..].fill(0);
                    break;
                }
                Ok(n) => done += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}
