//! Chunk-pooled byte buffers.
//!
//! Client output buffers, upstream reply readers and per-request raw buffers all grow
//! monotonically while the owning object is alive (spec: "Buffers ... grow monotonically
//! until the owning object is freed"). Backing storage is handed out in fixed-size chunks
//! from a pool so that freeing one connection's buffers makes that memory available to the
//! next one without returning it to the allocator.

use std::collections::VecDeque;
use std::io;

pub(crate) const CHUNK_SIZE: usize = 8192;

/// A single fixed-capacity slab of bytes with a read cursor and a write cursor.
pub struct Chunk {
    data: Box<[u8; CHUNK_SIZE]>,
    start: usize,
    end: usize,
}

impl Chunk {
    #[inline]
    fn new() -> Chunk {
        Chunk {
            data: Box::new([0; CHUNK_SIZE]),
            start: 0,
            end: 0,
        }
    }

    #[inline]
    fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        CHUNK_SIZE - self.end
    }

    #[inline]
    pub fn remaining_data(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn readable_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    #[inline]
    pub fn writeable_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.end..CHUNK_SIZE]
    }

    /// Advance the read cursor, as if `count` bytes were consumed.
    #[inline]
    pub fn advance(&mut self, count: usize) {
        assert!(self.start + count <= self.end, "advance past chunk edge");
        self.start += count;
        if self.start == self.end {
            self.reset();
        }
    }

    /// Advance the write cursor, as if `count` bytes were written in.
    #[inline]
    pub fn expand(&mut self, count: usize) {
        assert!(self.end + count <= CHUNK_SIZE, "expand past chunk size");
        self.end += count;
    }
}

/// Simple free list of chunks. Chunks are reused rather than reallocated, so a busy proxy
/// settles into a steady-state pool size instead of churning the allocator per request.
#[derive(Default)]
pub struct ChunkPool {
    free: Vec<Chunk>,
}

impl ChunkPool {
    pub fn new() -> ChunkPool {
        ChunkPool { free: Vec::new() }
    }

    #[inline]
    pub fn alloc(&mut self) -> Chunk {
        self.free.pop().unwrap_or_else(Chunk::new)
    }

    #[inline]
    pub fn reclaim(&mut self, mut chunk: Chunk) {
        chunk.reset();
        self.free.push(chunk);
    }
}

/// A growable, double-ended FIFO byte queue backed by pooled chunks. Data is appended at the
/// tail and consumed from the head; `ingress`/`egress` drive a non-blocking `Read`/`Write`
/// until it would block, mirroring the read/write suspension points in the scheduler.
pub struct ByteBuf {
    chunks: VecDeque<Chunk>,
}

impl ByteBuf {
    pub fn new() -> ByteBuf {
        let mut chunks = VecDeque::new();
        chunks.push_back(Chunk::new());
        ByteBuf { chunks }
    }

    /// Total unread bytes currently buffered.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Chunk::remaining_data).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append raw bytes to the tail, growing chunks as needed. Used when a caller already
    /// holds a slice (e.g. copying an upstream reply into a client's output buffer) rather
    /// than reading from an `io::Read` source.
    pub fn append(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let chunk = self.chunks.back_mut().expect("buffer always has a chunk");
            let cap = chunk.capacity();
            if cap == 0 {
                self.chunks.push_back(Chunk::new());
                continue;
            }
            let take = cap.min(data.len());
            chunk.writeable_slice()[..take].copy_from_slice(&data[..take]);
            chunk.expand(take);
            data = &data[take..];
        }
    }

    /// Read from `reader` into the tail of the buffer until it would block or errors.
    /// Returns the number of bytes read. `Ok(0)` together with an open, empty `reader` is
    /// ambiguous with a real EOF; callers distinguish EOF by the underlying `read()`
    /// returning `Ok(0)` directly, which this propagates as `Err(UnexpectedEof)`.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R, pool: &mut ChunkPool) -> io::Result<usize> {
        let mut total = 0usize;
        loop {
            let chunk = self.chunks.back_mut().expect("buffer always has a chunk");
            if chunk.capacity() == 0 {
                self.chunks.push_back(pool.alloc());
                continue;
            }
            match reader.read(chunk.writeable_slice()) {
                Ok(0) => {
                    if total == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                    return Ok(total);
                }
                Ok(n) => {
                    chunk.expand(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }

    /// Write from the head of the buffer into `writer` until it would block, errors, or the
    /// buffer is drained. Consumed chunks are returned to `pool`.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W, pool: &mut ChunkPool) -> io::Result<usize> {
        let mut total = 0usize;
        loop {
            if self.chunks.len() == 1 && self.chunks[0].remaining_data() == 0 {
                return Ok(total);
            }
            let chunk = self.chunks.front_mut().expect("buffer always has a chunk");
            if chunk.remaining_data() == 0 {
                let done = self.chunks.pop_front().unwrap();
                pool.reclaim(done);
                continue;
            }
            match writer.write(chunk.readable_slice()) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    chunk.advance(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }

    /// Copy out the first `count` unread bytes without consuming them. Used to hand a reply's
    /// exact byte range to the client's output buffer before compacting the reader.
    pub fn peek(&self, count: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(count);
        let mut remaining = count;
        for chunk in &self.chunks {
            if remaining == 0 {
                break;
            }
            let slice = chunk.readable_slice();
            let take = remaining.min(slice.len());
            out.extend_from_slice(&slice[..take]);
            remaining -= take;
        }
        out
    }

    /// Drop the first `count` unread bytes, reclaiming any chunk that becomes fully
    /// consumed. This is the "compact the reader buffer" step after a reply is extracted.
    pub fn consume(&mut self, mut count: usize, pool: &mut ChunkPool) {
        while count > 0 {
            let chunk = self.chunks.front_mut().expect("buffer always has a chunk");
            let avail = chunk.remaining_data();
            let take = avail.min(count);
            chunk.advance(take);
            count -= take;
            if chunk.remaining_data() == 0 && self.chunks.len() > 1 {
                let done = self.chunks.pop_front().unwrap();
                pool.reclaim(done);
            } else if take == 0 {
                break;
            }
        }
    }
}

impl Default for ByteBuf {
    fn default() -> Self {
        ByteBuf::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn ingress_spans_multiple_chunks() {
        let mut pool = ChunkPool::new();
        let mut buf = ByteBuf::new();
        let data: Vec<u8> = (0..(CHUNK_SIZE * 2 + 10)).map(|i| i as u8).collect();
        let mut cursor = Cursor::new(data.clone());

        buf.ingress(&mut cursor, &mut pool).unwrap();

        assert_eq!(buf.len(), data.len());
        assert_eq!(buf.peek(data.len()), data);
    }

    #[test]
    fn egress_drains_and_reclaims() {
        let mut pool = ChunkPool::new();
        let mut buf = ByteBuf::new();
        buf.append(&[1, 2, 3, 4]);

        let mut out = Vec::new();
        buf.egress(&mut out, &mut pool).unwrap();

        assert_eq!(out, vec![1, 2, 3, 4]);
        assert!(buf.is_empty());
    }

    #[test]
    fn consume_compacts_buffer() {
        let mut pool = ChunkPool::new();
        let mut buf = ByteBuf::new();
        buf.append(&[1, 2, 3, 4, 5]);

        buf.consume(2, &mut pool);

        assert_eq!(buf.len(), 3);
        assert_eq!(buf.peek(3), vec![3, 4, 5]);
    }

    #[test]
    fn ingress_reports_eof() {
        let mut pool = ChunkPool::new();
        let mut buf = ByteBuf::new();
        let mut cursor = Cursor::new(Vec::<u8>::new());

        let err = buf.ingress(&mut cursor, &mut pool).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
