//! Anonymous pipes.
//!
//! A pipe is a bounded byte queue with one read end and one write end, each
//! surfaced to user code as a file object. Pipes come from a fixed pool;
//! both ends hold a counted handle to the same entry, and the entry is
//! recycled when the second end closes.

use crate::arena::{Arena, ArenaObject, ArrayArena, Rc};
use crate::lock::{new_spin_lock, SpinLock};
use crate::param::NPIPE;
use crate::proc::WaitChannel;

const PIPESIZE: usize = 512;

struct PipeInner {
    data: [u8; PIPESIZE],

    /// Number of bytes read.
    nread: u32,

    /// Number of bytes written.
    nwrite: u32,

    /// Read fd is still open.
    readopen: bool,

    /// Write fd is still open.
    writeopen: bool,
}

enum PipeError {
    WaitForIo,
    Broken,
}

impl PipeInner {
    const fn new() -> Self {
        Self {
            data: [0; PIPESIZE],
            nread: 0,
            nwrite: 0,
            readopen: true,
            writeopen: true,
        }
    }

    fn try_read(&mut self, dst: &mut [u8]) -> Result<usize, PipeError> {
        if self.nread == self.nwrite {
            if self.writeopen {
                return Err(PipeError::WaitForIo);
            }
            // Write end closed and the queue drained: end of file.
            return Ok(0);
        }
        let mut i = 0;
        while i < dst.len() && self.nread != self.nwrite {
            dst[i] = self.data[self.nread as usize % PIPESIZE];
            self.nread += 1;
            i += 1;
        }
        Ok(i)
    }

    fn try_write(&mut self, src: &[u8]) -> Result<usize, PipeError> {
        if !self.readopen {
            return Err(PipeError::Broken);
        }
        let mut i = 0;
        while i < src.len() && self.nwrite < self.nread + PIPESIZE as u32 {
            self.data[self.nwrite as usize % PIPESIZE] = src[i];
            self.nwrite += 1;
            i += 1;
        }
        Ok(i)
    }
}

pub struct Pipe {
    inner: SpinLock<PipeInner>,

    /// Says there are unread bytes in the queue.
    read_waitchannel: WaitChannel,

    /// Says there is room to write.
    write_waitchannel: WaitChannel,
}

impl Pipe {
    fn new() -> Self {
        Self {
            inner: new_spin_lock("pipe", PipeInner::new()),
            read_waitchannel: WaitChannel::new(),
            write_waitchannel: WaitChannel::new(),
        }
    }

    /// Reads up to `dst.len()` bytes, sleeping while the queue is empty and
    /// the write end is open. Returns 0 at end of file.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, ()> {
        let mut inner = self.inner.lock();
        loop {
            match inner.try_read(dst) {
                Ok(r) => {
                    self.write_waitchannel.wakeup();
                    return Ok(r);
                }
                Err(PipeError::WaitForIo) => self.read_waitchannel.sleep(&mut inner),
                Err(_) => return Err(()),
            }
        }
    }

    /// Writes all of `src`, sleeping whenever the queue fills while the
    /// read end is open. Fails once the read end has closed.
    pub fn write(&self, src: &[u8]) -> Result<usize, ()> {
        let mut written = 0;
        let mut inner = self.inner.lock();
        loop {
            match inner.try_write(&src[written..]) {
                Ok(r) => {
                    written += r;
                    self.read_waitchannel.wakeup();
                    if written < src.len() {
                        self.write_waitchannel.sleep(&mut inner);
                    } else {
                        return Ok(written);
                    }
                }
                Err(_) => return Err(()),
            }
        }
    }

    /// Closes one end, waking the other side so it can observe the change.
    pub(crate) fn close(&self, writable: bool) {
        let mut inner = self.inner.lock();
        if writable {
            inner.writeopen = false;
            drop(inner);
            self.read_waitchannel.wakeup();
        } else {
            inner.readopen = false;
            drop(inner);
            self.write_waitchannel.wakeup();
        }
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaObject for Pipe {
    fn finalize<A: Arena<Data = Self>>(&mut self, _guard: &mut A::Guard<'_>) {
        // Both ends are closed by the time the last handle drops; the next
        // allocation reinitializes the queue.
    }
}

/// The pipe pool.
pub type PipeTable = SpinLock<ArrayArena<Pipe, NPIPE>>;

/// A counted handle to a pooled pipe; each end of the pipe holds one.
pub type RcPipe = Rc<PipeTable>;

impl PipeTable {
    /// Allocates a fresh pipe with both ends open.
    pub(crate) fn alloc_pipe(&self) -> Result<RcPipe, ()> {
        self.alloc(|p| *p = Pipe::new()).ok_or(())
    }
}
