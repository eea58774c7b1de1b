//! Size-bucketed byte buffer pool.
//!
//! Buffers come from four size classes (2, 4, 8 and 16 KiB). `alloc` hands out
//! the smallest class that fits, `free` returns a buffer to the largest class
//! its capacity covers. Requests above the largest class fall through to a
//! plain heap allocation. Pooling only saves allocations; nothing depends on a
//! buffer actually being recycled.

use std::sync::OnceLock;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Number of size classes.
pub const NUM_POOLS: usize = 4;

/// Smallest size class in bytes.
pub const MIN_POOL_SIZE: usize = 2048;

/// Default capacity of a [`Buffer`].
pub const BUFFER_SIZE: usize = 8 * 1024;

/// Free buffers retained per size class.
const MAX_RETAINED: usize = 64;

struct SizeClass {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

/// Pool of reusable byte vectors grouped by capacity class.
pub struct BufferPool {
    classes: [SizeClass; NUM_POOLS],
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            classes: std::array::from_fn(|i| SizeClass {
                size: MIN_POOL_SIZE << i,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Process-wide pool used by [`Buffer`].
    pub fn global() -> &'static BufferPool {
        static POOL: OnceLock<BufferPool> = OnceLock::new();
        POOL.get_or_init(BufferPool::new)
    }

    /// Capacity of each size class, smallest first.
    pub fn class_sizes(&self) -> [usize; NUM_POOLS] {
        std::array::from_fn(|i| self.classes[i].size)
    }

    /// Get an empty vector with capacity of at least `size` bytes.
    pub fn alloc(&self, size: usize) -> Vec<u8> {
        match self.classes.iter().find(|c| size <= c.size) {
            Some(class) => class
                .free
                .lock()
                .pop()
                .unwrap_or_else(|| Vec::with_capacity(class.size)),
            None => Vec::with_capacity(size),
        }
    }

    /// Return a vector to the pool.
    ///
    /// Vectors smaller than the smallest class are dropped.
    pub fn free(&self, mut buf: Vec<u8>) {
        let cap = buf.capacity();
        if let Some(class) = self.classes.iter().rev().find(|c| cap >= c.size) {
            let mut free = class.free.lock();
            if free.len() < MAX_RETAINED {
                buf.clear();
                free.push(buf);
            }
        }
    }

    /// Number of idle buffers held by the class that serves `size`.
    pub fn idle(&self, size: usize) -> usize {
        self.classes
            .iter()
            .find(|c| size <= c.size)
            .map(|c| c.free.lock().len())
            .unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A pooled byte buffer with a read cursor.
///
/// Bytes between the cursor and the end are the buffer's content. The
/// backing storage goes back to the global pool on drop.
pub struct Buffer {
    data: Vec<u8>,
    start: usize,
}

impl Buffer {
    /// Allocate a buffer of the default size.
    pub fn new() -> Self {
        Self::with_capacity(BUFFER_SIZE)
    }

    /// Allocate a buffer that holds at least `size` bytes.
    pub fn with_capacity(size: usize) -> Self {
        Self {
            data: BufferPool::global().alloc(size),
            start: 0,
        }
    }

    /// Content bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Content bytes, writable in place.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.start..]
    }

    /// Content length.
    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    /// Whether the buffer holds no content.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total capacity of the backing storage.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Append `n` zeroed bytes and return them for writing.
    pub fn extend(&mut self, n: usize) -> &mut [u8] {
        let end = self.data.len();
        self.data.resize(end + n, 0);
        &mut self.data[end..]
    }

    /// Append a single byte.
    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    /// Append a big-endian u16.
    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a slice.
    pub fn extend_from_slice(&mut self, src: &[u8]) {
        self.data.extend_from_slice(src);
    }

    /// Drop `n` bytes from the front of the content.
    pub fn advance(&mut self, n: usize) {
        self.start = (self.start + n).min(self.data.len());
    }

    /// Discard all content, keeping the storage.
    pub fn clear(&mut self) {
        self.data.clear();
        self.start = 0;
    }

    /// Return the storage to the pool now.
    pub fn release(self) {
        drop(self)
    }

    /// Perform one read into the spare capacity.
    ///
    /// Returns the number of bytes read; 0 means end of stream.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if self.data.len() == self.data.capacity() {
            self.data.reserve(MIN_POOL_SIZE);
        }
        reader.read_buf(&mut self.data).await
    }

    /// Read exactly `n` more bytes.
    pub async fn read_full_from<R>(&mut self, reader: &mut R, n: usize) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let dst = self.extend(n);
        reader.read_exact(dst).await?;
        Ok(())
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        BufferPool::global().free(std::mem::take(&mut self.data));
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_sizes_double() {
        let pool = BufferPool::new();
        assert_eq!(pool.class_sizes(), [2048, 4096, 8192, 16384]);
    }

    #[test]
    fn test_alloc_smallest_fitting_class() {
        let pool = BufferPool::new();
        assert_eq!(pool.alloc(1).capacity(), 2048);
        assert_eq!(pool.alloc(2048).capacity(), 2048);
        assert_eq!(pool.alloc(2049).capacity(), 4096);
        assert_eq!(pool.alloc(10_000).capacity(), 16384);
    }

    #[test]
    fn test_alloc_oversized_bypasses_pool() {
        let pool = BufferPool::new();
        let buf = pool.alloc(100_000);
        assert!(buf.capacity() >= 100_000);

        pool.free(buf);
        // Recycled into the largest class it covers
        assert_eq!(pool.idle(16384), 1);
    }

    #[test]
    fn test_free_reuses_storage() {
        let pool = BufferPool::new();
        let mut buf = pool.alloc(4096);
        buf.extend_from_slice(b"stale");
        let ptr = buf.as_ptr();
        pool.free(buf);
        assert_eq!(pool.idle(4096), 1);

        let again = pool.alloc(3000);
        assert_eq!(again.as_ptr(), ptr);
        assert!(again.is_empty());
        assert_eq!(pool.idle(4096), 0);
    }

    #[test]
    fn test_free_drops_tiny_buffers() {
        let pool = BufferPool::new();
        pool.free(Vec::with_capacity(100));
        for size in pool.class_sizes() {
            assert_eq!(pool.idle(size), 0);
        }
    }

    #[test]
    fn test_retention_is_bounded() {
        let pool = BufferPool::new();
        for _ in 0..(MAX_RETAINED + 10) {
            pool.free(Vec::with_capacity(2048));
        }
        assert_eq!(pool.idle(2048), MAX_RETAINED);
    }

    #[test]
    fn test_buffer_extend_advance_clear() {
        let mut buf = Buffer::new();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= BUFFER_SIZE);

        buf.extend(2).copy_from_slice(&[0xAB, 0xCD]);
        buf.put_u8(1);
        buf.put_u16(0x0203);
        assert_eq!(buf.bytes(), &[0xAB, 0xCD, 1, 2, 3]);

        buf.advance(2);
        assert_eq!(buf.bytes(), &[1, 2, 3]);
        buf.advance(100);
        assert!(buf.is_empty());

        buf.extend_from_slice(b"xy");
        buf.clear();
        assert_eq!(buf.len(), 0);
    }

    #[tokio::test]
    async fn test_buffer_reads() {
        let mut src: &[u8] = b"hello world";
        let mut buf = Buffer::new();
        buf.read_full_from(&mut src, 5).await.unwrap();
        assert_eq!(buf.bytes(), b"hello");

        let n = buf.read_from(&mut src).await.unwrap();
        assert_eq!(n, 6);
        assert_eq!(buf.bytes(), b"hello world");

        assert_eq!(buf.read_from(&mut src).await.unwrap(), 0);

        let mut short: &[u8] = b"ab";
        let err = buf.read_full_from(&mut short, 3).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
