//! Growable byte accumulator for one direction of a connection
//!
//! ```text
//!   0        read_index      write_index        buf.len()       max_size
//!   |  consumed  |   unread     |   contiguous     |  growth room  |
//! ```
//!
//! Appends first reuse the consumed prefix, then grow the vector by twice
//! the shortfall, never past `max_size`. An append that cannot fit leaves
//! the buffer untouched and reports failure; that is the backpressure point
//! for both reads and writes.

use costack_core::kwarn;

pub struct ConnectionBuffer {
    buf: Vec<u8>,
    read_index: usize,
    write_index: usize,
    max_size: usize,
}

impl ConnectionBuffer {
    /// Buffer with `initial` bytes of capacity that may grow to `max_size`
    pub fn with_limits(initial: usize, max_size: usize) -> Self {
        let max_size = max_size.max(initial);
        Self {
            buf: vec![0; initial],
            read_index: 0,
            write_index: 0,
            max_size,
        }
    }

    /// Unread bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.write_index - self.read_index
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_index == self.write_index
    }

    /// Currently allocated bytes
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Bytes that can be written at `write_slice()` without reallocating
    #[inline]
    pub fn contiguous_space(&self) -> usize {
        self.buf.len() - self.write_index
    }

    /// Bytes that can still be appended before the hard limit
    #[inline]
    pub fn space_before_full(&self) -> usize {
        self.max_size - self.len()
    }

    /// The contiguous free tail, to be filled in place and then committed
    /// with `add_bytes`
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.write_index..]
    }

    /// Commit `n` bytes written through `write_slice()`
    ///
    /// # Panics
    ///
    /// If `n` exceeds `contiguous_space()`.
    pub fn add_bytes(&mut self, n: usize) {
        assert!(
            n <= self.contiguous_space(),
            "add_bytes({}) past contiguous space {}",
            n,
            self.contiguous_space()
        );
        self.write_index += n;
    }

    /// Copy `data` in, growing if needed; false when it would pass the limit
    pub fn append(&mut self, data: &[u8]) -> bool {
        if !self.ensure_space(data.len()) {
            kwarn!(
                "buffer append of {} bytes refused, {} unread, limit {}",
                data.len(),
                self.len(),
                self.max_size
            );
            return false;
        }
        let start = self.write_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.write_index += data.len();
        true
    }

    /// Peek at all unread bytes
    #[inline]
    pub fn read(&self) -> &[u8] {
        &self.buf[self.read_index..self.write_index]
    }

    /// Move up to `out.len()` unread bytes into `out`
    pub fn read_and_clear(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        out[..n].copy_from_slice(&self.buf[self.read_index..self.read_index + n]);
        self.consume_bytes(n);
        n
    }

    /// Drop `n` unread bytes
    ///
    /// # Panics
    ///
    /// If fewer than `n` bytes are unread.
    pub fn consume_bytes(&mut self, n: usize) {
        assert!(n <= self.len(), "consume_bytes({}) past {} unread", n, self.len());
        self.read_index += n;
        if self.read_index == self.write_index {
            self.read_index = 0;
            self.write_index = 0;
        }
    }

    fn ensure_space(&mut self, n: usize) -> bool {
        if n > self.space_before_full() {
            return false;
        }
        if self.contiguous_space() >= n {
            return true;
        }
        if self.read_index > 0 {
            self.buf.copy_within(self.read_index..self.write_index, 0);
            self.write_index -= self.read_index;
            self.read_index = 0;
            if self.contiguous_space() >= n {
                return true;
            }
        }
        let shortfall = n - self.contiguous_space();
        let new_size = (self.buf.len() + shortfall * 2).min(self.max_size);
        self.buf.resize(new_size, 0);
        debug_assert!(self.contiguous_space() >= n);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: usize = 64 * 1024;
    const MAX: usize = 1024 * 1024;

    fn buffer() -> ConnectionBuffer {
        ConnectionBuffer::with_limits(DEFAULT, MAX)
    }

    #[test]
    fn test_append_until_limit() {
        let mut buffer = buffer();
        let length = buffer.contiguous_space();
        assert!(buffer.append(&[0x3f]));
        assert!(buffer.append(&vec![0; length - 1]));
        assert!(!buffer.append(&vec![0; MAX]));
        // The refused append left nothing behind.
        assert_eq!(buffer.len(), length);
        assert_eq!(buffer.space_before_full(), MAX - length);
        assert!(buffer.append(&vec![0; MAX - length]));
        assert!(!buffer.append(&[0x3f]));
        assert_eq!(buffer.capacity(), MAX);
    }

    #[test]
    fn test_write_slice_in_place() {
        let mut buffer = buffer();
        let length = buffer.contiguous_space();
        buffer.write_slice().fill(0x3f);
        buffer.add_bytes(length);
        assert_eq!(buffer.contiguous_space(), 0);
        assert_eq!(buffer.space_before_full(), MAX - DEFAULT);
        assert!(buffer.read().iter().all(|&b| b == 0x3f));
    }

    #[test]
    #[should_panic(expected = "past contiguous space")]
    fn test_add_bytes_past_space_panics() {
        let mut buffer = buffer();
        let length = buffer.contiguous_space();
        buffer.add_bytes(length + 1);
    }

    #[test]
    fn test_contiguous_space() {
        let mut buffer = buffer();
        assert_eq!(buffer.contiguous_space(), DEFAULT);
        let s = b"The final answer is 42!";
        assert!(buffer.append(s));
        assert_eq!(buffer.contiguous_space(), DEFAULT - s.len());
        buffer.consume_bytes(s.len());
        assert_eq!(buffer.contiguous_space(), DEFAULT);

        assert!(buffer.append(&vec![0; DEFAULT + 1]));
        assert!(buffer.capacity() > DEFAULT);
        assert_eq!(buffer.contiguous_space(), buffer.capacity() - buffer.len());
    }

    #[test]
    fn test_growth_doubles_shortfall() {
        let mut buffer = ConnectionBuffer::with_limits(16, 1024);
        assert!(buffer.append(&[1; 10]));
        assert!(buffer.append(&[2; 10]));
        // 6 bytes were free, shortfall 4, grows by 8
        assert_eq!(buffer.capacity(), 24);
        assert!(buffer.append(&[3; 500]));
        assert_eq!(buffer.capacity(), (24 + (500 - 4) * 2).min(1024));
    }

    #[test]
    fn test_read_peeks() {
        let mut buffer = buffer();
        assert!(buffer.read().is_empty());
        let s = b"The answer is 42";
        assert!(buffer.append(s));
        assert_eq!(buffer.read(), s);
        assert_eq!(buffer.read(), s);
    }

    #[test]
    fn test_consume_bytes() {
        let mut buffer = buffer();
        let s = b"Balabala";
        buffer.append(s);
        buffer.consume_bytes(1);
        assert_eq!(buffer.read(), &s[1..]);
        buffer.consume_bytes(s.len() - 1);
        assert!(buffer.read().is_empty());
        assert!(buffer.is_empty());
        assert_eq!(buffer.contiguous_space(), DEFAULT);
    }

    #[test]
    fn test_read_and_clear() {
        let mut buffer = buffer();
        buffer.append(b"hello world");
        let mut out = [0u8; 5];
        assert_eq!(buffer.read_and_clear(&mut out), 5);
        assert_eq!(&out, b"hello");
        let mut rest = [0u8; 32];
        assert_eq!(buffer.read_and_clear(&mut rest), 6);
        assert_eq!(&rest[..6], b" world");
        assert_eq!(buffer.read_and_clear(&mut rest), 0);
    }

    #[test]
    fn test_consumed_prefix_is_reused() {
        let mut buffer = ConnectionBuffer::with_limits(16, 16);
        assert!(buffer.append(&[7; 12]));
        buffer.consume_bytes(8);
        assert!(buffer.append(&[9; 10]));
        assert_eq!(buffer.capacity(), 16);
        assert_eq!(buffer.read(), &[7, 7, 7, 7, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9]);
        assert!(!buffer.append(&[0; 3]));
    }
}
