//! Per-thread map variants
//!
//! Logically an array of `MAX_REG_THREADS` inner maps. Every operation
//! dispatches through the caller's registered thread id, which is also
//! the safety argument: each inner map is touched by exactly one
//! thread.

use crate::config::MAX_REG_THREADS;
use crate::map::array::ArrayMap;
use crate::map::spsc_hashmap::SpscHashMap;

/// One array per registered thread.
pub struct PerThreadArray {
    inner: Box<[ArrayMap]>,
}

impl PerThreadArray {
    /// Create `MAX_REG_THREADS` inner arrays.
    pub fn new(value_size: u32, max_entries: u32) -> Option<Self> {
        let inner = (0..MAX_REG_THREADS)
            .map(|_| ArrayMap::new(value_size, max_entries))
            .collect::<Option<Box<[_]>>>()?;
        Some(Self { inner })
    }

    /// The calling thread's inner array.
    pub fn for_thread(&self, thread_id: usize) -> Option<&ArrayMap> {
        self.inner.get(thread_id)
    }
}

/// One single-owner hashmap per registered thread.
pub struct PerThreadHashMap {
    inner: Box<[SpscHashMap]>,
}

impl PerThreadHashMap {
    /// Create `MAX_REG_THREADS` inner hashmaps.
    pub fn new(key_size: u32, value_size: u32, max_entries: u32) -> Option<Self> {
        let inner = (0..MAX_REG_THREADS)
            .map(|_| SpscHashMap::new(key_size, value_size, max_entries))
            .collect::<Option<Box<[_]>>>()?;
        Some(Self { inner })
    }

    /// The calling thread's inner hashmap.
    pub fn for_thread(&self, thread_id: usize) -> Option<&SpscHashMap> {
        self.inner.get(thread_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::MAP_SUCCESS;

    #[test]
    fn test_threads_see_independent_arrays() {
        let map = PerThreadArray::new(4, 2).unwrap();
        let v = 5u32.to_le_bytes();
        unsafe { map.for_thread(0).unwrap().update(0, v.as_ptr()) };

        let t0 = unsafe { std::ptr::read(map.for_thread(0).unwrap().lookup(0) as *const u32) };
        let t1 = unsafe { std::ptr::read(map.for_thread(1).unwrap().lookup(0) as *const u32) };
        assert_eq!(t0, 5);
        assert_eq!(t1, 0);
    }

    #[test]
    fn test_threads_see_independent_hashmaps() {
        let map = PerThreadHashMap::new(4, 4, 4).unwrap();
        let key = 1u32.to_le_bytes();
        assert_eq!(
            map.for_thread(3).unwrap().update(&key, &9u32.to_le_bytes()),
            MAP_SUCCESS
        );
        assert!(!map.for_thread(3).unwrap().lookup(&key).is_null());
        assert!(map.for_thread(4).unwrap().lookup(&key).is_null());
    }

    #[test]
    fn test_out_of_range_thread_id() {
        let map = PerThreadArray::new(4, 2).unwrap();
        assert!(map.for_thread(MAX_REG_THREADS).is_none());
    }
}
