//! Read buffers.
//!
//! A [`ReadBuffer`] is the byte ring a read fills: the host owns it, binds it
//! to a socket with `set_read_buffer`, and consumes `[read_pos, write_pos)`
//! at its own pace. Storage comes from the pool lazily, on the first
//! buffer-request callback of the first read, and the true capacity is
//! whatever the pool rounded the size hint up to. The buffer never shrinks
//! or compacts; reclaiming consumed space is the host's job via
//! [`advance_read`](ReadBuffer::advance_read).

use std::cell::RefCell;
use std::rc::Rc;

use crate::errno;
use crate::pool::{Pool, PoolBlock};

/// Shared handle to a read buffer, as held by hosts and sockets.
pub type ReadBufferRef = Rc<RefCell<ReadBuffer>>;

#[derive(Debug)]
pub struct ReadBuffer {
    /// Allocation hint; the pool decides the real capacity.
    size: usize,
    block: Option<PoolBlock>,
    capacity: usize,
    read_pos: usize,
    write_pos: usize,
}

impl ReadBuffer {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            size,
            block: None,
            capacity: 0,
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Convenience constructor for the shared form.
    #[must_use]
    pub fn shared(size: usize) -> ReadBufferRef {
        Rc::new(RefCell::new(Self::new(size)))
    }

    /// Real capacity: 0 until first use, then the pool's rounded size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    #[must_use]
    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Allocate backing storage on first use.
    ///
    /// Returns `ENOMEM` when the pool declines; the caller stops the read
    /// and resumes the waiting coroutine with the code.
    pub fn ensure_allocated(&mut self, pool: &Rc<Pool>) -> Result<(), i32> {
        if self.capacity != 0 {
            return Ok(());
        }
        let block = pool.alloc(self.size).ok_or(errno::ENOMEM)?;
        self.capacity = block.capacity();
        self.block = Some(block);
        self.read_pos = 0;
        self.write_pos = 0;
        Ok(())
    }

    /// The slice the kernel may fill: `[write_pos, capacity)`.
    #[must_use]
    pub fn writable(&mut self) -> &mut [u8] {
        let range = self.write_pos..self.capacity;
        self.block
            .as_mut()
            .map_or(&mut [], |block| &mut block[range])
    }

    #[must_use]
    pub fn writable_len(&self) -> usize {
        self.capacity - self.write_pos
    }

    /// Record `n` freshly written bytes. The write cursor only moves
    /// forward.
    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(self.write_pos + n <= self.capacity);
        self.write_pos += n;
    }

    /// Unconsumed data: `[read_pos, write_pos)`.
    #[must_use]
    pub fn readable(&self) -> &[u8] {
        let range = self.read_pos..self.write_pos;
        self.block.as_ref().map_or(&[], |block| &block[range])
    }

    /// Consume `n` bytes from the front of the readable region.
    pub fn advance_read(&mut self, n: usize) {
        debug_assert!(self.read_pos + n <= self.write_pos);
        self.read_pos += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazy_allocation_takes_pool_capacity() {
        let pool = Pool::new();
        let mut buf = ReadBuffer::new(1000);
        assert_eq!(buf.capacity(), 0);

        buf.ensure_allocated(&pool).unwrap();
        // The pool rounds 1000 up to its 1024 class.
        assert_eq!(buf.capacity(), 1024);
        assert_eq!(buf.writable_len(), 1024);
        assert_eq!(pool.live_blocks(), 1);

        // Idempotent once allocated.
        buf.ensure_allocated(&pool).unwrap();
        assert_eq!(pool.live_blocks(), 1);
    }

    #[test]
    fn cursors_stay_ordered() {
        let pool = Pool::new();
        let mut buf = ReadBuffer::new(64);
        buf.ensure_allocated(&pool).unwrap();

        buf.writable()[..4].copy_from_slice(b"ping");
        buf.advance_write(4);
        assert_eq!(buf.readable(), b"ping");

        buf.advance_read(2);
        assert_eq!(buf.readable(), b"ng");
        assert!(buf.read_pos() <= buf.write_pos());
        assert!(buf.write_pos() <= buf.capacity());
    }

    #[test]
    fn allocation_failure_reports_enomem() {
        let pool = Pool::new();
        pool.set_block_limit(Some(0));
        let mut buf = ReadBuffer::new(64);
        assert_eq!(buf.ensure_allocated(&pool), Err(errno::ENOMEM));
        assert_eq!(buf.capacity(), 0);
    }
}
