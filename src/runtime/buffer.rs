//! Per-connection fixed-capacity byte buffer.
//!
//! Every accepted connection owns exactly one `ConnectionBuffer`. Bytes read
//! from the peer are appended at the write cursor and flushed back from the
//! read cursor, so the buffer is a strict FIFO: nothing is reordered,
//! duplicated or lost between a read and the matching write.
//!
//! Storage is linear rather than a ring so that both the readable and the
//! writable region are always a single contiguous slice, which is what the
//! socket calls want. Unread bytes are moved to the front when the free tail
//! gets too short, and both cursors reset whenever the buffer empties.

#![allow(dead_code)] // push/expand are exercised by tests only

use std::io::{self, Read, Write};

/// Fixed-capacity FIFO byte buffer bound to one connection.
#[derive(Debug)]
pub struct ConnectionBuffer {
    /// Backing storage, `capacity` bytes long.
    data: Box<[u8]>,
    /// Offset of the oldest unread byte.
    read_pos: usize,
    /// Offset one past the newest byte.
    write_pos: usize,
}

impl ConnectionBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Maximum number of bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Free space, `capacity - len`.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Append as many bytes as fit and return how many were accepted.
    ///
    /// The caller keeps the unaccepted tail for a later attempt.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        if n == 0 {
            return 0;
        }
        self.spare_mut()[..n].copy_from_slice(&bytes[..n]);
        self.commit(n);
        n
    }

    /// Oldest buffered bytes, at most `max_len` of them, without removing them.
    pub fn peek_chunk(&self, max_len: usize) -> &[u8] {
        let n = self.len().min(max_len);
        &self.data[self.read_pos..self.read_pos + n]
    }

    /// Remove the first `n` buffered bytes.
    ///
    /// # Panics
    /// Panics if `n` exceeds the number of buffered bytes.
    pub fn drain(&mut self, n: usize) {
        assert!(
            n <= self.len(),
            "drain of {n} bytes from buffer holding {}",
            self.len()
        );
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// The whole free region as one contiguous slice.
    ///
    /// Bytes written here become visible only after `commit`.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        if self.capacity() - self.write_pos < self.remaining() {
            self.compact();
        }
        &mut self.data[self.write_pos..]
    }

    /// Mark `n` bytes of the spare region as filled.
    ///
    /// # Panics
    /// Panics if `n` exceeds the free space.
    pub fn commit(&mut self, n: usize) {
        assert!(
            self.write_pos + n <= self.capacity(),
            "commit of {n} bytes overflows buffer"
        );
        self.write_pos += n;
    }

    /// Perform one read of at most `remaining()` bytes from `reader`.
    ///
    /// Returns the reader's result unchanged, so `Ok(0)` means end of stream.
    /// A full buffer is reported as `WouldBlock` instead of issuing a
    /// zero-length read that would be indistinguishable from EOF.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        if self.is_full() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = reader.read(self.spare_mut())?;
        self.commit(n);
        Ok(n)
    }

    /// Perform one write of at most `max_len` buffered bytes to `writer`,
    /// draining whatever the writer accepted.
    pub fn write_to<W: Write>(&mut self, writer: &mut W, max_len: usize) -> io::Result<usize> {
        let chunk = self.peek_chunk(max_len);
        if chunk.is_empty() {
            return Ok(0);
        }
        let n = writer.write(chunk)?;
        self.drain(n);
        Ok(n)
    }

    /// Grow the buffer to `new_capacity`, keeping buffered bytes in order.
    ///
    /// Shrinking is not supported; a smaller or equal capacity is a no-op.
    pub fn expand(&mut self, new_capacity: usize) {
        if new_capacity <= self.capacity() {
            return;
        }
        let mut data = vec![0u8; new_capacity].into_boxed_slice();
        let len = self.len();
        data[..len].copy_from_slice(&self.data[self.read_pos..self.write_pos]);
        self.data = data;
        self.read_pos = 0;
        self.write_pos = len;
    }

    /// Move unread bytes to the start of storage.
    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        self.data.copy_within(self.read_pos..self.write_pos, 0);
        self.write_pos -= self.read_pos;
        self.read_pos = 0;
    }
}
