//! Fixed-capacity scratch buffers used for one-shot reads off a tunneled
//! endpoint. Unlike the tunnel's framed reads, a tunneled endpoint is read
//! with a single non-retried `recv` per readiness notification, so a plain
//! reusable byte buffer is all that's needed here — no ring-buffer
//! bookkeeping across calls.

use std::io::{self, Read};

pub struct RecvBuffer {
    data: Vec<u8>,
}

impl RecvBuffer {
    pub fn with_capacity(capacity: usize) -> RecvBuffer {
        RecvBuffer { data: vec![0u8; capacity] }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Performs one `read` call into the buffer and returns the slice that
    /// was actually filled. A zero-length result means the peer shut the
    /// write half of its connection (EOF).
    pub fn fill_once<R: Read>(&mut self, mut reader: R) -> io::Result<&[u8]> {
        let n = reader.read(&mut self.data)?;
        Ok(&self.data[..n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn fill_once_returns_bytes_read() {
        let mut buf = RecvBuffer::with_capacity(8);
        let mut source = Cursor::new(vec![1, 2, 3]);
        let filled = buf.fill_once(&mut source).unwrap();
        assert_eq!(filled, &[1, 2, 3]);
    }

    #[test]
    fn fill_once_truncates_to_capacity() {
        let mut buf = RecvBuffer::with_capacity(2);
        let mut source = Cursor::new(vec![9, 8, 7, 6]);
        let filled = buf.fill_once(&mut source).unwrap();
        assert_eq!(filled, &[9, 8]);
    }

    #[test]
    fn fill_once_reports_eof_as_empty() {
        let mut buf = RecvBuffer::with_capacity(8);
        let mut source = Cursor::new(Vec::<u8>::new());
        let filled = buf.fill_once(&mut source).unwrap();
        assert!(filled.is_empty());
    }
}
