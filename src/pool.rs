use std::sync::Mutex;

/// Default buffer size when none is configured.
const DEFAULT_BUFFER_SIZE: usize = 32 << 10;

/// Thread-safe free list of fixed-size byte buffers.
///
/// Every buffer handed out has exactly the configured length, so record
/// framing and copy loops never have to re-check capacity. Returning a
/// buffer of the wrong size silently drops it.
#[derive(Debug)]
pub struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl BufferPool {
    /// Creates a pool producing buffers of `size` bytes (0 selects the default).
    pub fn new(size: usize) -> Self {
        let size = if size == 0 { DEFAULT_BUFFER_SIZE } else { size };
        Self {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Returns the configured buffer length.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Takes a buffer from the free list, allocating when empty.
    pub fn get(&self) -> Vec<u8> {
        let buf = self.free.lock().expect("buffer pool lock").pop();
        buf.unwrap_or_else(|| vec![0; self.size])
    }

    /// Returns a buffer to the free list.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() == self.size {
            self.free.lock().expect("buffer pool lock").push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_have_exact_size() {
        let pool = BufferPool::new(1024);
        let buf = pool.get();
        assert_eq!(buf.len(), 1024);
        pool.put(buf);
        assert_eq!(pool.get().len(), 1024);
    }

    #[test]
    fn reuses_returned_buffers() {
        let pool = BufferPool::new(64);
        let mut buf = pool.get();
        buf[0] = 0xAB;
        let ptr = buf.as_ptr();
        pool.put(buf);
        let buf = pool.get();
        assert_eq!(buf.as_ptr(), ptr);
    }

    #[test]
    fn drops_foreign_buffers() {
        let pool = BufferPool::new(64);
        pool.put(vec![0; 16]);
        assert_eq!(pool.get().len(), 64);
    }

    #[test]
    fn zero_selects_default() {
        assert_eq!(BufferPool::new(0).buffer_size(), DEFAULT_BUFFER_SIZE);
    }
}
