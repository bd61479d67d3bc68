//! Concurrent hashmap
//!
//! Multi-reader, single-writer-at-a-time hash table. Readers are
//! lock-free: buckets are atomic pointers to immutable chained nodes,
//! traversed with acquire loads under the caller's epoch section.
//! Writers serialize on a try-lock (contention reports `BUSY`) and
//! retire superseded nodes through the caller's epoch record, so a
//! reader that raced a replace keeps a valid node until its section
//! ends. Node payloads `[next | key | value]` come from a private data
//! mempool sized at twice the entry capacity to cover retired nodes
//! awaiting reclamation.

use crate::epoch;
use crate::hash::{hashlittle, MAP_HASH_SEED};
use crate::map::{MAP_BUSY, MAP_ERROR, MAP_FULL, MAP_SUCCESS};
use crate::mempool::Mempool;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

/// Offset of the key inside a node (after the embedded next pointer).
const NODE_KEY_OFFSET: usize = std::mem::size_of::<AtomicPtr<u8>>();

/// Lock-free-read hashmap with epoch-reclaimed nodes.
pub struct BpfHashMap {
    buckets: Box<[AtomicPtr<u8>]>,
    mask: usize,
    key_size: usize,
    value_size: usize,
    max_entries: usize,
    count: AtomicUsize,
    writer: Mutex<()>,
    pool: Arc<Mempool>,
}

unsafe impl Send for BpfHashMap {}
unsafe impl Sync for BpfHashMap {}

impl BpfHashMap {
    /// Create a map for `max_entries` live entries.
    pub fn new(key_size: u32, value_size: u32, max_entries: u32) -> Option<Self> {
        let key_size = key_size as usize;
        let value_size = value_size as usize;
        let max_entries = max_entries as usize;
        if key_size == 0 || value_size == 0 || max_entries == 0 {
            return None;
        }
        let num_buckets = max_entries.next_power_of_two();
        let buckets = (0..num_buckets)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        // Twice the capacity: live nodes plus replacements queued for
        // deferred reclamation.
        let pool = Arc::new(Mempool::new(
            max_entries * 2,
            NODE_KEY_OFFSET + key_size + value_size,
        )?);
        Some(Self {
            buckets,
            mask: num_buckets - 1,
            key_size,
            value_size,
            max_entries,
            count: AtomicUsize::new(0),
            writer: Mutex::new(()),
            pool,
        })
    }

    #[inline]
    fn bucket_for(&self, key: &[u8]) -> &AtomicPtr<u8> {
        let idx = hashlittle(key, MAP_HASH_SEED) as usize & self.mask;
        &self.buckets[idx]
    }

    #[inline]
    fn node_next(node: *mut u8) -> &'static AtomicPtr<u8> {
        unsafe { &*(node as *const AtomicPtr<u8>) }
    }

    #[inline]
    fn node_key<'a>(&self, node: *mut u8) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(node.add(NODE_KEY_OFFSET), self.key_size) }
    }

    #[inline]
    fn node_value(&self, node: *mut u8) -> *mut u8 {
        unsafe { node.add(NODE_KEY_OFFSET + self.key_size) }
    }

    fn find(&self, key: &[u8]) -> *mut u8 {
        let mut node = self.bucket_for(key).load(Ordering::Acquire);
        while !node.is_null() {
            if self.node_key(node) == key {
                return node;
            }
            node = Self::node_next(node).load(Ordering::Acquire);
        }
        std::ptr::null_mut()
    }

    /// Retire a node through the calling thread's epoch record.
    fn retire(&self, node: *mut u8, epoch_idx: usize) {
        let pool = self.pool.clone();
        let addr = node as usize;
        epoch::domain().defer(epoch_idx, Box::new(move || pool.free(addr as *mut u8)));
    }

    /// Lock-free lookup. The returned interior pointer stays valid for
    /// the caller's current epoch section.
    pub fn lookup(&self, key: &[u8]) -> *mut u8 {
        debug_assert_eq!(key.len(), self.key_size);
        let node = self.find(key);
        if node.is_null() {
            std::ptr::null_mut()
        } else {
            self.node_value(node)
        }
    }

    /// Lookup and zero the value in place.
    pub fn reset(&self, key: &[u8]) -> *mut u8 {
        let value = self.lookup(key);
        if !value.is_null() {
            unsafe { std::ptr::write_bytes(value, 0, self.value_size) };
        }
        value
    }

    /// Insert or replace the entry for `key`.
    ///
    /// `epoch_idx` is the calling thread's epoch record, used to retire
    /// a superseded node.
    pub fn update(&self, key: &[u8], value: &[u8], epoch_idx: usize) -> i32 {
        debug_assert_eq!(key.len(), self.key_size);
        debug_assert_eq!(value.len(), self.value_size);
        let Some(_guard) = self.writer.try_lock() else {
            return MAP_BUSY;
        };

        let existing = self.find(key);
        if existing.is_null() && self.count.load(Ordering::Relaxed) == self.max_entries {
            return MAP_FULL;
        }

        let node = self.pool.alloc();
        if node.is_null() {
            return MAP_ERROR;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(key.as_ptr(), node.add(NODE_KEY_OFFSET), self.key_size);
            std::ptr::copy_nonoverlapping(
                value.as_ptr(),
                node.add(NODE_KEY_OFFSET + self.key_size),
                self.value_size,
            );
        }

        let bucket = self.bucket_for(key);
        if existing.is_null() {
            // Push-front insert.
            let head = bucket.load(Ordering::Relaxed);
            Self::node_next(node).store(head, Ordering::Relaxed);
            bucket.store(node, Ordering::Release);
            self.count.fetch_add(1, Ordering::Relaxed);
        } else {
            // Splice the replacement into the old node's position, then
            // retire the old node once readers have drained.
            let successor = Self::node_next(existing).load(Ordering::Relaxed);
            Self::node_next(node).store(successor, Ordering::Relaxed);
            let mut link = bucket;
            loop {
                let current = link.load(Ordering::Relaxed);
                if current == existing {
                    link.store(node, Ordering::Release);
                    break;
                }
                link = Self::node_next(current);
            }
            self.retire(existing, epoch_idx);
        }
        MAP_SUCCESS
    }

    /// Remove the entry for `key`.
    pub fn delete(&self, key: &[u8], epoch_idx: usize) -> i32 {
        debug_assert_eq!(key.len(), self.key_size);
        let Some(_guard) = self.writer.try_lock() else {
            return MAP_BUSY;
        };
        let node = self.find(key);
        if node.is_null() {
            return MAP_ERROR;
        }
        let successor = Self::node_next(node).load(Ordering::Relaxed);
        let bucket = self.bucket_for(key);
        let mut link = bucket;
        loop {
            let current = link.load(Ordering::Relaxed);
            if current == node {
                link.store(successor, Ordering::Release);
                break;
            }
            link = Self::node_next(current);
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.retire(node, epoch_idx);
        MAP_SUCCESS
    }

    /// Retire every live entry and empty the table.
    pub fn clear(&self, epoch_idx: usize) -> i32 {
        let Some(_guard) = self.writer.try_lock() else {
            return MAP_BUSY;
        };
        for bucket in self.buckets.iter() {
            let mut node = bucket.swap(std::ptr::null_mut(), Ordering::AcqRel);
            while !node.is_null() {
                let next = Self::node_next(node).load(Ordering::Relaxed);
                self.retire(node, epoch_idx);
                node = next;
            }
        }
        self.count.store(0, Ordering::Relaxed);
        MAP_SUCCESS
    }

    /// Number of live entries, or `BUSY` while a writer holds the lock.
    pub fn size(&self) -> i32 {
        let Some(_guard) = self.writer.try_lock() else {
            return MAP_BUSY;
        };
        self.count.load(Ordering::Relaxed) as i32
    }

    /// Serialize every `[key | value]` pair into `out` atomically with
    /// respect to writers.
    ///
    /// Returns the entry count, 0 when `out` is too small (nothing is
    /// written), or `BUSY` under writer contention.
    pub fn dump(&self, out: &mut [u8]) -> i32 {
        let Some(_guard) = self.writer.try_lock() else {
            return MAP_BUSY;
        };
        let count = self.count.load(Ordering::Relaxed);
        let pair = self.key_size + self.value_size;
        if out.len() < count * pair {
            return 0;
        }
        let mut written = 0usize;
        for bucket in self.buckets.iter() {
            let mut node = bucket.load(Ordering::Relaxed);
            while !node.is_null() {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        node.add(NODE_KEY_OFFSET),
                        out.as_mut_ptr().add(written * pair),
                        pair,
                    );
                }
                written += 1;
                node = Self::node_next(node).load(Ordering::Relaxed);
            }
        }
        debug_assert_eq!(written, count);
        written as i32
    }
}

impl Drop for BpfHashMap {
    fn drop(&mut self) {
        // Callers barrier the epoch domain before dropping the last
        // reference, so remaining nodes are exclusively ours.
        for bucket in self.buckets.iter() {
            let mut node = bucket.load(Ordering::Relaxed);
            while !node.is_null() {
                let next = Self::node_next(node).load(Ordering::Relaxed);
                self.pool.free(node);
                node = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch;
    use crate::thread::register_thread;

    fn key(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }

    fn read_u64(ptr: *mut u8) -> u64 {
        assert!(!ptr.is_null());
        let mut raw = [0u8; 8];
        unsafe { std::ptr::copy_nonoverlapping(ptr, raw.as_mut_ptr(), 8) };
        u64::from_le_bytes(raw)
    }

    #[test]
    fn test_update_then_lookup_observes_value() {
        let rec = register_thread().unwrap();
        let map = BpfHashMap::new(4, 8, 16).unwrap();
        for i in 0..16u32 {
            let v = (i as u64 + 100).to_le_bytes();
            assert_eq!(map.update(&key(i), &v, rec), MAP_SUCCESS);
        }
        assert_eq!(map.size(), 16);
        for i in 0..16u32 {
            assert_eq!(read_u64(map.lookup(&key(i))), i as u64 + 100);
        }
        epoch::domain().barrier();
    }

    #[test]
    fn test_replace_retires_old_node() {
        let rec = register_thread().unwrap();
        let map = BpfHashMap::new(4, 8, 4).unwrap();
        map.update(&key(1), &1u64.to_le_bytes(), rec);
        let before = map.pool.available();
        map.update(&key(1), &2u64.to_le_bytes(), rec);
        assert_eq!(read_u64(map.lookup(&key(1))), 2);
        // The old node is queued, not yet back in the pool.
        assert_eq!(map.pool.available(), before - 1);
        epoch::domain().barrier();
        assert_eq!(map.pool.available(), before);
    }

    #[test]
    fn test_full_table_rejects_new_key() {
        let rec = register_thread().unwrap();
        let map = BpfHashMap::new(4, 4, 4).unwrap();
        for i in 0..4u32 {
            assert_eq!(map.update(&key(i), &i.to_le_bytes(), rec), MAP_SUCCESS);
        }
        assert_eq!(map.update(&key(9), &9u32.to_le_bytes(), rec), MAP_FULL);
        assert_eq!(map.update(&key(2), &7u32.to_le_bytes(), rec), MAP_SUCCESS);
        epoch::domain().barrier();
    }

    #[test]
    fn test_delete_unlinks_entry() {
        let rec = register_thread().unwrap();
        let map = BpfHashMap::new(4, 4, 8).unwrap();
        for i in 0..8u32 {
            map.update(&key(i), &i.to_le_bytes(), rec);
        }
        assert_eq!(map.delete(&key(3), rec), MAP_SUCCESS);
        assert_eq!(map.delete(&key(3), rec), MAP_ERROR);
        assert!(map.lookup(&key(3)).is_null());
        assert_eq!(map.size(), 7);
        epoch::domain().barrier();
    }

    #[test]
    fn test_clear_empties_map() {
        let rec = register_thread().unwrap();
        let map = BpfHashMap::new(4, 4, 8).unwrap();
        for i in 0..8u32 {
            map.update(&key(i), &i.to_le_bytes(), rec);
        }
        assert_eq!(map.clear(rec), MAP_SUCCESS);
        assert_eq!(map.size(), 0);
        for i in 0..8u32 {
            assert!(map.lookup(&key(i)).is_null());
        }
        epoch::domain().barrier();
        assert_eq!(map.pool.available(), map.pool.capacity());
    }

    #[test]
    fn test_dump_complete_or_nothing() {
        let rec = register_thread().unwrap();
        let map = BpfHashMap::new(4, 4, 8).unwrap();
        for i in 0..6u32 {
            map.update(&key(i), &(i * 3).to_le_bytes(), rec);
        }
        let mut small = vec![0xAAu8; 8];
        assert_eq!(map.dump(&mut small), 0);
        assert!(small.iter().all(|&b| b == 0xAA));

        let mut buf = vec![0u8; 6 * 8];
        assert_eq!(map.dump(&mut buf), 6);
        let mut seen = std::collections::HashMap::new();
        for chunk in buf.chunks(8) {
            let k = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
            let v = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
            assert!(seen.insert(k, v).is_none());
        }
        for i in 0..6u32 {
            assert_eq!(seen[&i], i * 3);
        }
        epoch::domain().barrier();
    }

    #[test]
    fn test_writer_contention_reports_busy() {
        let rec = register_thread().unwrap();
        let map = BpfHashMap::new(4, 4, 4).unwrap();
        let _guard = map.writer.lock();
        assert_eq!(map.update(&key(1), &1u32.to_le_bytes(), rec), MAP_BUSY);
        assert_eq!(map.delete(&key(1), rec), MAP_BUSY);
        assert_eq!(map.clear(rec), MAP_BUSY);
        assert_eq!(map.size(), MAP_BUSY);
    }

    #[test]
    fn test_concurrent_readers_with_writer() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let rec = register_thread().unwrap();
        let map = Arc::new(BpfHashMap::new(4, 8, 64).unwrap());
        map.update(&key(1), &1u64.to_le_bytes(), rec);
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let map = map.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    let record = register_thread().unwrap();
                    let domain = epoch::domain();
                    while !stop.load(Ordering::Relaxed) {
                        domain.begin(record);
                        let ptr = map.lookup(&key(1));
                        if !ptr.is_null() {
                            let v = read_u64(ptr);
                            assert!(v >= 1, "torn or stale-freed value {v}");
                        }
                        domain.end(record);
                    }
                })
            })
            .collect();

        for round in 1..500u64 {
            let _ = map.update(&key(1), &round.to_le_bytes(), rec);
            if round % 64 == 0 {
                epoch::domain().poll(rec);
            }
        }
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }
        epoch::domain().barrier();
    }
}
