//! Per-connection frame buffers.
//!
//! Both buffers hold exactly one maximum-size frame ([`MAX_FRAME`] bytes).
//! The capacity is a protocol bound, not a tuning knob: a request that
//! would not fit is rejected by the framing layer before it overflows.

use crate::runtime::protocol::MAX_FRAME;

/// Inbound bytes waiting to be framed.
///
/// Bytes are appended at `len` and consumed from the front; any remainder
/// after a consumed frame is shifted back to offset zero.
pub struct ReadBuffer {
    data: [u8; MAX_FRAME],
    len: usize,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self {
            data: [0u8; MAX_FRAME],
            len: 0,
        }
    }

    /// Valid bytes currently held.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        MAX_FRAME
    }

    /// The valid bytes.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Unused capacity that the next read may fill.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Mark `n` bytes of the spare capacity as filled.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.len + n <= MAX_FRAME, "read buffer overrun");
        self.len += n;
    }

    /// Drop `n` bytes from the front, keeping the remainder.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len, "consumed more than buffered");
        if n < self.len {
            self.data.copy_within(n..self.len, 0);
        }
        self.len -= n;
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound response bytes.
///
/// `sent <= len <= MAX_FRAME` always holds.
pub struct WriteBuffer {
    data: [u8; MAX_FRAME],
    len: usize,
    sent: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self {
            data: [0u8; MAX_FRAME],
            len: 0,
            sent: 0,
        }
    }

    /// Total bytes queued for the current response.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Bytes of the current response already written.
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole buffer, for encoding a fresh response.
    ///
    /// Only valid while the buffer is empty.
    pub fn frame_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.is_empty(), "response already queued");
        &mut self.data
    }

    /// Queue the first `len` bytes written through [`frame_mut`](Self::frame_mut).
    pub fn queue(&mut self, len: usize) {
        debug_assert!(self.is_empty(), "response already queued");
        debug_assert!(len <= MAX_FRAME, "response exceeds buffer");
        self.len = len;
        self.sent = 0;
    }

    /// Bytes still waiting to be written.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.sent..self.len]
    }

    /// Record that `n` more bytes were written.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.sent + n <= self.len, "advanced past queued data");
        self.sent += n;
    }

    /// True once every queued byte has been written.
    pub fn is_drained(&self) -> bool {
        self.sent == self.len
    }

    /// Forget the current response.
    pub fn reset(&mut self) {
        self.len = 0;
        self.sent = 0;
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_buffer_fill_and_consume() {
        let mut buf = ReadBuffer::new();
        assert!(buf.is_empty());
        assert_eq!(buf.spare_mut().len(), MAX_FRAME);

        buf.spare_mut()[..6].copy_from_slice(b"abcdef");
        buf.commit(6);
        assert_eq!(buf.filled(), b"abcdef");
        assert_eq!(buf.spare_mut().len(), MAX_FRAME - 6);

        // Remainder moves to the front
        buf.consume(4);
        assert_eq!(buf.filled(), b"ef");

        buf.consume(2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_read_buffer_full() {
        let mut buf = ReadBuffer::new();
        let cap = buf.capacity();
        buf.commit(cap);
        assert_eq!(buf.len(), MAX_FRAME);
        assert!(buf.spare_mut().is_empty());
    }

    #[test]
    fn test_write_buffer_partial_sends() {
        let mut buf = WriteBuffer::new();
        buf.frame_mut()[..5].copy_from_slice(b"hello");
        buf.queue(5);
        assert_eq!(buf.pending(), b"hello");

        buf.advance(2);
        assert_eq!(buf.sent(), 2);
        assert_eq!(buf.pending(), b"llo");
        assert!(!buf.is_drained());

        buf.advance(3);
        assert!(buf.is_drained());
        assert!(buf.pending().is_empty());

        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.sent(), 0);
    }
}
