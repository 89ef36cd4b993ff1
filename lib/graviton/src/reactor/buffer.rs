use std::io;

// Storage grows in page-sized steps up to the hard cap.
const BUF_SIZE_INCREMENT: usize = 4096;

/// A dynamically sized and buffered FIFO byte queue. Data is appended at the
/// tail and read from the head; storage compacts when the head catches up and
/// grows in increments up to a hard per-buffer cap.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    tail: usize,
    cap: usize,
}

impl Buffer {
    #[inline]
    pub fn new(cap: usize) -> Buffer {
        if cap % BUF_SIZE_INCREMENT != 0 {
            panic!("Buffer cap must be divisible by {}, got {}", BUF_SIZE_INCREMENT, cap);
        }

        Buffer {
            data: vec![0; BUF_SIZE_INCREMENT.min(cap)],
            head: 0,
            tail: 0,
            cap,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Remaining free capacity up to the hard cap.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.cap - self.len()
    }

    /// Slice containing buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Consume `count` bytes from the head.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        debug_assert!(count <= self.len());
        self.head += count;

        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Commit `count` bytes previously written into `write_slice`.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        debug_assert!(self.tail + count <= self.data.len());
        self.tail += count;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Makes room for at least `count` more bytes, compacting and growing the
    /// storage as needed. Returns false when the hard cap cannot fit them.
    pub fn reserve(&mut self, count: usize) -> bool {
        if count > self.free_capacity() {
            return false;
        }

        if self.data.len() - self.tail >= count {
            return true;
        }

        if self.head > 0 {
            self.data.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }

        if self.data.len() - self.tail < count {
            let needed = self.tail + count;
            let size = ((needed + BUF_SIZE_INCREMENT - 1) / BUF_SIZE_INCREMENT * BUF_SIZE_INCREMENT)
                .min(self.cap);
            self.data.resize(size, 0);
        }

        true
    }

    /// Slice containing free space after the tail. Call `reserve` first.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.tail..]
    }

    /// Appends the supplied bytes. Returns false when the cap cannot fit them,
    /// in which case nothing is written.
    pub fn write(&mut self, bytes: &[u8]) -> bool {
        if !self.reserve(bytes.len()) {
            return false;
        }

        self.data[self.tail..self.tail + bytes.len()].copy_from_slice(bytes);
        self.tail += bytes.len();
        true
    }

    /// Write the contents of the buffer to the supplied writer, advancing the
    /// head. A writer that would block ends the pass without error.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0usize;

        while !self.is_empty() {
            match writer.write(self.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.move_head(count);
                    total += count;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }

    /// Read all available data from the supplied reader into the buffer.
    /// Returns the byte count and whether the reader reported end of stream.
    /// A full buffer ends the pass; backpressure is the caller's concern.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<(usize, bool)> {
        let mut total = 0usize;

        loop {
            if !self.reserve(BUF_SIZE_INCREMENT) {
                return Ok((total, false));
            }

            match reader.read(self.write_slice()) {
                Ok(0) => return Ok((total, true)),
                Ok(count) => {
                    self.move_tail(count);
                    total += count;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok((total, false)),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
