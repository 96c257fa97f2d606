use crate::{MAX_PACKET_SIZE, RECV_BUFFER_SIZE};
use std::io;

/// Byte staging buffer for socket reads. Data is appended at the write
/// cursor and consumed from the read cursor; when the free suffix gets too
/// small to hold a maximal packet the unread bytes are moved back to the
/// front.
pub struct RecvBuffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl RecvBuffer {
    #[inline]
    pub fn new() -> RecvBuffer {
        RecvBuffer {
            data: vec![0u8; RECV_BUFFER_SIZE].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// The number of unread bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Contiguous free space after the write cursor.
    #[inline]
    pub fn free_suffix(&self) -> usize {
        self.data.len() - self.tail
    }

    /// The writable region. Fill it and `commit` the written length.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.tail..]
    }

    /// Advances the write cursor over freshly written bytes.
    #[inline]
    pub fn commit(&mut self, count: usize) -> io::Result<()> {
        if count > self.free_suffix() {
            return Err(io::Error::new(io::ErrorKind::Other, "Buffer overrun"));
        }

        self.tail += count;
        Ok(())
    }

    /// The readable region.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Advances the read cursor over parsed bytes.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.len());

        self.head += count;

        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Moves unread bytes to offset zero when the free suffix can no longer
    /// take a maximal packet.
    #[inline]
    pub fn compact(&mut self) {
        if self.free_suffix() >= MAX_PACKET_SIZE || self.head == 0 {
            return;
        }

        self.data.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(buffer: &mut RecvBuffer, bytes: &[u8]) {
        buffer.write_slice()[..bytes.len()].copy_from_slice(bytes);
        buffer.commit(bytes.len()).unwrap();
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut buffer = RecvBuffer::new();

        assert!(buffer.is_empty());
        assert_eq!(buffer.free_suffix(), RECV_BUFFER_SIZE);

        write(&mut buffer, &[1, 2, 3, 4, 5]);

        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.read_slice(), &[1, 2, 3, 4, 5]);

        buffer.consume(2);
        assert_eq!(buffer.read_slice(), &[3, 4, 5]);

        buffer.consume(3);
        assert!(buffer.is_empty());
        // Fully drained buffers rewind to the front.
        assert_eq!(buffer.free_suffix(), RECV_BUFFER_SIZE);
    }

    #[test]
    fn test_commit_overrun_is_an_error() {
        let mut buffer = RecvBuffer::new();

        assert!(buffer.commit(RECV_BUFFER_SIZE).is_ok());

        let err = buffer.commit(1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert_eq!(err.to_string(), "Buffer overrun");
    }

    #[test]
    fn test_compact_reclaims_consumed_prefix() {
        let mut buffer = RecvBuffer::new();

        let chunk = vec![7u8; RECV_BUFFER_SIZE - 100];
        write(&mut buffer, &chunk);
        buffer.consume(RECV_BUFFER_SIZE - 200);

        assert_eq!(buffer.len(), 100);
        assert!(buffer.free_suffix() < MAX_PACKET_SIZE);

        buffer.compact();

        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.free_suffix(), RECV_BUFFER_SIZE - 100);
        assert_eq!(buffer.read_slice(), &vec![7u8; 100][..]);
    }

    #[test]
    fn test_compact_is_a_noop_with_enough_space() {
        let mut buffer = RecvBuffer::new();

        write(&mut buffer, &[1, 2, 3]);
        buffer.consume(1);

        buffer.compact();

        // Plenty of suffix left: cursors untouched.
        assert_eq!(buffer.read_slice(), &[2, 3]);
        assert_eq!(buffer.free_suffix(), RECV_BUFFER_SIZE - 3);
    }

    #[test]
    fn test_clear() {
        let mut buffer = RecvBuffer::new();

        write(&mut buffer, &[1, 2, 3]);
        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.free_suffix(), RECV_BUFFER_SIZE);
    }
}
