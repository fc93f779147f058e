//! Fixed-capacity read buffer that slides unread bytes back to the start.

/// A fixed-capacity byte buffer for incremental socket reads.
///
/// Bytes are appended at the tail via [`SlideBuffer::space`] + [`SlideBuffer::commit`]
/// and consumed from the head via [`SlideBuffer::unread`] + [`SlideBuffer::consume`].
/// Requesting write space when the tail has reached capacity slides any unread
/// bytes back to the start of the buffer, so a parser that consumes slowly never
/// loses data and never grows the allocation.
#[derive(Debug)]
pub struct SlideBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl SlideBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of unread bytes currently buffered.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The unread bytes, oldest first.
    pub fn unread(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Marks the first `n` unread bytes as consumed.
    ///
    /// Panics if `n` exceeds [`SlideBuffer::len`].
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len());
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Returns the writable tail of the buffer, sliding unread bytes to the
    /// start first if that frees additional room. Returns an empty slice only
    /// when the buffer is full of unread bytes.
    pub fn space(&mut self) -> &mut [u8] {
        if self.end == self.buf.len() && self.start > 0 {
            self.slide();
        }
        &mut self.buf[self.end..]
    }

    /// Marks `n` bytes written into [`SlideBuffer::space`] as readable.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.buf.len());
        self.end += n;
    }

    fn slide(&mut self) {
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fill_and_drain() {
        let mut b = SlideBuffer::with_capacity(8);
        assert!(b.is_empty());
        b.space()[..5].copy_from_slice(b"hello");
        b.commit(5);
        assert_eq!(b.unread(), b"hello");
        b.consume(2);
        assert_eq!(b.unread(), b"llo");
        b.consume(3);
        assert!(b.is_empty());
    }

    #[test]
    fn slides_unread_bytes_when_tail_is_full() {
        let mut b = SlideBuffer::with_capacity(8);
        b.space()[..8].copy_from_slice(b"abcdefgh");
        b.commit(8);
        b.consume(6);
        // tail exhausted, two unread bytes slid back to the front
        let space = b.space();
        assert_eq!(space.len(), 6);
        space[..3].copy_from_slice(b"ijk");
        b.commit(3);
        assert_eq!(b.unread(), b"ghijk");
    }

    #[test]
    fn survives_repeated_short_reads() {
        // simulate a peer that trickles one byte per read
        let mut b = SlideBuffer::with_capacity(4);
        let mut out = Vec::new();
        for (i, byte) in b"0123456789".iter().enumerate() {
            let space = b.space();
            assert!(!space.is_empty());
            space[0] = *byte;
            b.commit(1);
            if i % 2 == 1 {
                out.extend_from_slice(b.unread());
                let n = b.len();
                b.consume(n);
            }
        }
        assert_eq!(out, b"0123456789");
    }

    #[test]
    fn full_buffer_reports_no_space() {
        let mut b = SlideBuffer::with_capacity(4);
        b.space()[..4].copy_from_slice(b"full");
        b.commit(4);
        assert!(b.space().is_empty());
        assert_eq!(b.unread(), b"full");
    }
}
