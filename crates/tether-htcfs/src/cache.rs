use parking_lot::Mutex;

struct Cached {
    handle: i32,
    file_size: i64,
    data: Vec<u8>,
}

/// Single-slot read cache holding the head of the most recently opened
/// file, when the host's open response carried a cache hint.
pub(crate) struct CacheManager {
    capacity: usize,
    slot: Mutex<Option<Cached>>,
}

impl CacheManager {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, slot: Mutex::new(None) }
    }

    pub fn record(&self, file_size: i64, data: &[u8], handle: i32) {
        let kept = data.len().min(self.capacity);
        *self.slot.lock() = Some(Cached { handle, file_size, data: data[..kept].to_vec() });
    }

    pub fn invalidate(&self) {
        *self.slot.lock() = None;
    }

    pub fn invalidate_handle(&self, handle: i32) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|c| c.handle == handle) {
            *slot = None;
        }
    }

    pub fn file_size(&self, handle: i32) -> Option<i64> {
        let slot = self.slot.lock();
        slot.as_ref().filter(|c| c.handle == handle).map(|c| c.file_size)
    }

    /// Serves a read entirely inside the cached region, or declines.
    pub fn read(&self, dst: &mut [u8], handle: i32, offset: usize) -> Option<usize> {
        let slot = self.slot.lock();
        let cached = slot.as_ref().filter(|c| c.handle == handle)?;
        let end = offset.checked_add(dst.len())?;
        if end > cached.data.len() {
            return None;
        }
        dst.copy_from_slice(&cached.data[offset..end]);
        Some(dst.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serves_only_in_range_reads() {
        let cache = CacheManager::new(16);
        cache.record(100, &[1, 2, 3, 4], 7);

        let mut buf = [0u8; 2];
        assert_eq!(cache.read(&mut buf, 7, 1), Some(2));
        assert_eq!(buf, [2, 3]);

        // Out of cached range, wrong handle.
        assert_eq!(cache.read(&mut buf, 7, 3), None);
        assert_eq!(cache.read(&mut buf, 8, 0), None);
    }

    #[test]
    fn trims_to_capacity() {
        let cache = CacheManager::new(2);
        cache.record(10, &[9, 9, 9, 9], 1);
        let mut buf = [0u8; 3];
        assert_eq!(cache.read(&mut buf, 1, 0), None);
        let mut two = [0u8; 2];
        assert_eq!(cache.read(&mut two, 1, 0), Some(2));
    }

    #[test]
    fn invalidation() {
        let cache = CacheManager::new(16);
        cache.record(5, &[1], 3);
        assert_eq!(cache.file_size(3), Some(5));

        cache.invalidate_handle(2);
        assert_eq!(cache.file_size(3), Some(5));
        cache.invalidate_handle(3);
        assert_eq!(cache.file_size(3), None);

        cache.record(5, &[1], 3);
        cache.invalidate();
        assert_eq!(cache.file_size(3), None);
    }
}
