//! Map runtime
//!
//! A map is a typed key/value store reachable from codelets through a
//! relocated pointer. The variants live behind one tag-dispatched sum
//! type: hot-path helpers branch on the tag instead of chasing a
//! vtable. Storage sits behind an `Arc` so a linked map can be a
//! lightweight wrapper sharing the underlying data with its siblings.

pub mod array;
pub mod hashmap;
pub mod perthread;
pub mod spsc_hashmap;

pub use array::ArrayMap;
pub use hashmap::BpfHashMap;
pub use perthread::{PerThreadArray, PerThreadHashMap};
pub use spsc_hashmap::SpscHashMap;

use crate::io::{ChannelDirection, IoChannel, IoError, StreamId, Transport};
use crate::thread;
use serde::Deserialize;
use std::sync::Arc;

/// Map operation succeeded.
pub const MAP_SUCCESS: i32 = 0;
/// Map operation failed.
pub const MAP_ERROR: i32 = -1;
/// The map's writer lock is contended; retry.
pub const MAP_BUSY: i32 = -2;
/// Insert attempted on a full map.
pub const MAP_FULL: i32 = -4;

/// Map type tag, with the on-wire numbering used in object files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapType {
    /// Flat indexed array.
    Array = 1,
    /// Multi-reader concurrent hashmap.
    Hashmap = 2,
    /// Multi-producer output channel with single-call submit.
    Ringbuf = 3,
    /// Consumer-side channel feeding records into codelets.
    ControlInput = 4,
    /// One array per registered thread.
    PerThreadArray = 5,
    /// One hashmap per registered thread.
    PerThreadHashmap = 6,
    /// Output channel with reserve/commit semantics.
    Output = 7,
}

impl MapType {
    /// Whether this map variant is backed by an IO channel.
    pub fn is_io(self) -> bool {
        matches!(self, MapType::Ringbuf | MapType::ControlInput | MapType::Output)
    }
}

/// Map shape as declared in a codelet object file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MapDef {
    /// Variant tag.
    #[serde(rename = "type")]
    pub map_type: MapType,
    /// Key size in bytes; ignored for IO variants.
    #[serde(default)]
    pub key_size: u32,
    /// Value size in bytes.
    pub value_size: u32,
    /// Capacity in entries.
    pub max_entries: u32,
}

/// Map creation failures.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// Zero-sized dimension or allocation failure.
    #[error("could not allocate storage for map {0}")]
    Alloc(String),

    /// IO variant declared without a matching channel descriptor.
    #[error("map {0} is an IO map but has no channel descriptor")]
    MissingChannel(String),

    /// The IO transport rejected the channel.
    #[error("channel for map {0} failed: {1}")]
    Channel(String, IoError),

    /// The process-wide map budget is exhausted.
    #[error("maximum number of maps reached")]
    TooManyMaps,
}

/// Channel parameters resolved from the load request for an IO map.
pub struct IoBinding {
    /// Transport that will own the channel.
    pub transport: Arc<dyn Transport>,
    /// Stream id from the channel descriptor.
    pub stream_id: StreamId,
    /// Optional serde object bytes read from disk.
    pub serde_obj: Option<Vec<u8>>,
}

enum MapStorage {
    Array(ArrayMap),
    Hashmap(BpfHashMap),
    PerThreadArray(PerThreadArray),
    PerThreadHashmap(PerThreadHashMap),
    Channel {
        channel: Arc<dyn IoChannel>,
        transport: Arc<dyn Transport>,
    },
}

impl Drop for MapStorage {
    fn drop(&mut self) {
        if let MapStorage::Channel { channel, transport } = self {
            transport.destroy_channel(&channel.stream_id());
        }
    }
}

/// A live map: immutable shape plus shared storage.
pub struct Map {
    name: String,
    map_type: MapType,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    storage: Arc<MapStorage>,
}

impl Map {
    /// Create the backing storage for `def`. IO variants require an
    /// [`IoBinding`].
    pub fn new(name: &str, def: &MapDef, io: Option<IoBinding>) -> Result<Map, MapError> {
        let storage = match def.map_type {
            MapType::Array => MapStorage::Array(
                ArrayMap::new(def.value_size, def.max_entries)
                    .ok_or_else(|| MapError::Alloc(name.to_string()))?,
            ),
            MapType::Hashmap => MapStorage::Hashmap(
                BpfHashMap::new(def.key_size, def.value_size, def.max_entries)
                    .ok_or_else(|| MapError::Alloc(name.to_string()))?,
            ),
            MapType::PerThreadArray => MapStorage::PerThreadArray(
                PerThreadArray::new(def.value_size, def.max_entries)
                    .ok_or_else(|| MapError::Alloc(name.to_string()))?,
            ),
            MapType::PerThreadHashmap => MapStorage::PerThreadHashmap(
                PerThreadHashMap::new(def.key_size, def.value_size, def.max_entries)
                    .ok_or_else(|| MapError::Alloc(name.to_string()))?,
            ),
            MapType::Ringbuf | MapType::Output | MapType::ControlInput => {
                let io = io.ok_or_else(|| MapError::MissingChannel(name.to_string()))?;
                let direction = if def.map_type == MapType::ControlInput {
                    ChannelDirection::Input
                } else {
                    ChannelDirection::Output
                };
                let channel = io
                    .transport
                    .create_channel(
                        direction,
                        def.max_entries,
                        def.value_size,
                        io.stream_id,
                        io.serde_obj.as_deref(),
                    )
                    .map_err(|err| MapError::Channel(name.to_string(), err))?;
                MapStorage::Channel {
                    channel,
                    transport: io.transport,
                }
            }
        };
        Ok(Map {
            name: name.to_string(),
            map_type: def.map_type,
            key_size: def.key_size,
            value_size: def.value_size,
            max_entries: def.max_entries,
            storage: Arc::new(storage),
        })
    }

    /// Create a linked-map wrapper sharing this map's storage.
    pub fn share_as(&self, name: &str) -> Map {
        Map {
            name: name.to_string(),
            map_type: self.map_type,
            key_size: self.key_size,
            value_size: self.value_size,
            max_entries: self.max_entries,
            storage: self.storage.clone(),
        }
    }

    /// Whether `other` declares exactly this map's shape.
    pub fn shape_matches(&self, def: &MapDef) -> bool {
        self.map_type == def.map_type
            && self.key_size == def.key_size
            && self.value_size == def.value_size
            && self.max_entries == def.max_entries
    }

    /// Map name (unique within its codelet).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Variant tag.
    pub fn map_type(&self) -> MapType {
        self.map_type
    }

    /// Key size in bytes.
    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    /// Value size in bytes.
    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    /// Capacity in entries.
    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    /// Whether this map shares storage with `other`.
    pub fn shares_storage_with(&self, other: &Map) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// The IO channel behind this map, if it is an IO variant.
    pub fn channel(&self) -> Option<&Arc<dyn IoChannel>> {
        match &*self.storage {
            MapStorage::Channel { channel, .. } => Some(channel),
            _ => None,
        }
    }

    /// Whether destroying this map must wait for read-side sections
    /// (it owns epoch-reclaimed nodes).
    pub fn needs_epoch_barrier(&self) -> bool {
        matches!(&*self.storage, MapStorage::Hashmap(_))
    }

    #[inline]
    unsafe fn array_key(key: *const u8) -> u32 {
        std::ptr::read_unaligned(key as *const u32)
    }

    #[inline]
    unsafe fn key_slice(&self, key: *const u8) -> &[u8] {
        std::slice::from_raw_parts(key, self.key_size as usize)
    }

    /// Look up an element, returning an interior pointer or null.
    ///
    /// # Safety
    /// `key` must be readable for this map's key size.
    pub unsafe fn lookup(&self, key: *const u8) -> *mut u8 {
        match &*self.storage {
            MapStorage::Array(map) => map.lookup(Self::array_key(key)),
            MapStorage::Hashmap(map) => map.lookup(self.key_slice(key)),
            MapStorage::PerThreadArray(map) => {
                let index = Self::array_key(key);
                match thread::current_thread_id().and_then(|id| map.for_thread(id)) {
                    Some(inner) => inner.lookup(index),
                    None => std::ptr::null_mut(),
                }
            }
            MapStorage::PerThreadHashmap(map) => {
                let key = self.key_slice(key);
                match thread::current_thread_id().and_then(|id| map.for_thread(id)) {
                    Some(inner) => inner.lookup(key),
                    None => std::ptr::null_mut(),
                }
            }
            MapStorage::Channel { .. } => std::ptr::null_mut(),
        }
    }

    /// Look up an element and zero its value in place.
    ///
    /// # Safety
    /// `key` must be readable for this map's key size.
    pub unsafe fn lookup_reset(&self, key: *const u8) -> *mut u8 {
        match &*self.storage {
            MapStorage::Array(map) => map.reset(Self::array_key(key)),
            MapStorage::Hashmap(map) => map.reset(self.key_slice(key)),
            MapStorage::PerThreadArray(map) => {
                let index = Self::array_key(key);
                match thread::current_thread_id().and_then(|id| map.for_thread(id)) {
                    Some(inner) => inner.reset(index),
                    None => std::ptr::null_mut(),
                }
            }
            MapStorage::PerThreadHashmap(map) => {
                let key = self.key_slice(key);
                match thread::current_thread_id().and_then(|id| map.for_thread(id)) {
                    Some(inner) => inner.reset(key),
                    None => std::ptr::null_mut(),
                }
            }
            MapStorage::Channel { .. } => std::ptr::null_mut(),
        }
    }

    /// Insert or replace an element. `flags` is accepted for ABI
    /// compatibility and ignored.
    ///
    /// # Safety
    /// `key` and `value` must be readable for this map's key and value
    /// sizes.
    pub unsafe fn update(&self, key: *const u8, value: *const u8, _flags: u64) -> i32 {
        match &*self.storage {
            MapStorage::Array(map) => map.update(Self::array_key(key), value),
            MapStorage::Hashmap(map) => match thread::current_thread_id() {
                Some(id) => map.update(
                    self.key_slice(key),
                    std::slice::from_raw_parts(value, self.value_size as usize),
                    id,
                ),
                None => MAP_ERROR,
            },
            MapStorage::PerThreadArray(map) => {
                let index = Self::array_key(key);
                match thread::current_thread_id().and_then(|id| map.for_thread(id)) {
                    Some(inner) => inner.update(index, value),
                    None => MAP_ERROR,
                }
            }
            MapStorage::PerThreadHashmap(map) => {
                let key = self.key_slice(key);
                let value = std::slice::from_raw_parts(value, self.value_size as usize);
                match thread::current_thread_id().and_then(|id| map.for_thread(id)) {
                    Some(inner) => inner.update(key, value),
                    None => MAP_ERROR,
                }
            }
            MapStorage::Channel { .. } => MAP_ERROR,
        }
    }

    /// Delete an element. Arrays do not support deletion.
    ///
    /// # Safety
    /// `key` must be readable for this map's key size.
    pub unsafe fn delete(&self, key: *const u8) -> i32 {
        match &*self.storage {
            MapStorage::Hashmap(map) => match thread::current_thread_id() {
                Some(id) => map.delete(self.key_slice(key), id),
                None => MAP_ERROR,
            },
            MapStorage::PerThreadHashmap(map) => {
                let key = self.key_slice(key);
                match thread::current_thread_id().and_then(|id| map.for_thread(id)) {
                    Some(inner) => inner.delete(key),
                    None => MAP_ERROR,
                }
            }
            _ => MAP_ERROR,
        }
    }

    /// Remove (or zero) every element.
    pub fn clear(&self) -> i32 {
        match &*self.storage {
            MapStorage::Array(map) => map.clear(),
            MapStorage::Hashmap(map) => match thread::current_thread_id() {
                Some(id) => map.clear(id),
                None => MAP_ERROR,
            },
            MapStorage::PerThreadArray(map) => match thread::current_thread_id() {
                Some(id) => map.for_thread(id).map_or(MAP_ERROR, ArrayMap::clear),
                None => MAP_ERROR,
            },
            MapStorage::PerThreadHashmap(map) => match thread::current_thread_id() {
                Some(id) => map.for_thread(id).map_or(MAP_ERROR, SpscHashMap::clear),
                None => MAP_ERROR,
            },
            MapStorage::Channel { .. } => MAP_ERROR,
        }
    }

    /// Serialize all live pairs into `out`, hashmap variants only.
    ///
    /// # Safety
    /// `out` must be writable for `max_size` bytes.
    pub unsafe fn dump(&self, out: *mut u8, max_size: u32) -> i32 {
        let buf = std::slice::from_raw_parts_mut(out, max_size as usize);
        match &*self.storage {
            MapStorage::Hashmap(map) => map.dump(buf),
            MapStorage::PerThreadHashmap(map) => {
                match thread::current_thread_id().and_then(|id| map.for_thread(id)) {
                    Some(inner) => inner.dump(buf),
                    None => MAP_ERROR,
                }
            }
            _ => MAP_ERROR,
        }
    }

    /// Live entry count for hashmap variants; `BUSY` under writer
    /// contention.
    pub fn size(&self) -> i32 {
        match &*self.storage {
            MapStorage::Hashmap(map) => map.size(),
            MapStorage::PerThreadHashmap(map) => {
                match thread::current_thread_id().and_then(|id| map.for_thread(id)) {
                    Some(inner) => inner.len() as i32,
                    None => MAP_ERROR,
                }
            }
            _ => MAP_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::register_thread;

    fn plain_def(map_type: MapType) -> MapDef {
        MapDef {
            map_type,
            key_size: 4,
            value_size: 4,
            max_entries: 4,
        }
    }

    #[test]
    fn test_map_shape_is_fixed_at_creation() {
        let def = plain_def(MapType::Array);
        let map = Map::new("m", &def, None).unwrap();
        assert!(map.shape_matches(&def));
        assert!(!map.shape_matches(&MapDef {
            value_size: 8,
            ..def
        }));
        assert_eq!(map.name(), "m");
        assert_eq!(map.map_type(), MapType::Array);
    }

    #[test]
    fn test_io_map_without_binding_fails() {
        let def = MapDef {
            map_type: MapType::Output,
            key_size: 0,
            value_size: 8,
            max_entries: 4,
        };
        assert!(matches!(
            Map::new("out", &def, None),
            Err(MapError::MissingChannel(_))
        ));
    }

    #[test]
    fn test_dispatch_array_roundtrip() {
        register_thread().unwrap();
        let map = Map::new("arr", &plain_def(MapType::Array), None).unwrap();
        let key = 2u32.to_le_bytes();
        let value = 77u32.to_le_bytes();
        unsafe {
            assert_eq!(map.update(key.as_ptr(), value.as_ptr(), 0), MAP_SUCCESS);
            let got = std::ptr::read(map.lookup(key.as_ptr()) as *const u32);
            assert_eq!(got, 77);
        }
    }

    #[test]
    fn test_dispatch_hashmap_roundtrip() {
        register_thread().unwrap();
        let map = Map::new("h", &plain_def(MapType::Hashmap), None).unwrap();
        let key = 9u32.to_le_bytes();
        let value = 5u32.to_le_bytes();
        unsafe {
            assert_eq!(map.update(key.as_ptr(), value.as_ptr(), 0), MAP_SUCCESS);
            assert_eq!(std::ptr::read(map.lookup(key.as_ptr()) as *const u32), 5);
            assert_eq!(map.delete(key.as_ptr()), MAP_SUCCESS);
            assert!(map.lookup(key.as_ptr()).is_null());
        }
        crate::epoch::domain().barrier();
    }

    #[test]
    fn test_per_thread_dispatch_uses_thread_id() {
        register_thread().unwrap();
        let map = Map::new("pt", &plain_def(MapType::PerThreadHashmap), None).unwrap();
        let key = 1u32.to_le_bytes();
        let value = 3u32.to_le_bytes();
        unsafe {
            assert_eq!(map.update(key.as_ptr(), value.as_ptr(), 0), MAP_SUCCESS);
            assert!(!map.lookup(key.as_ptr()).is_null());
        }

        // Another thread sees its own empty inner map.
        let map = std::sync::Arc::new(map);
        let other = map.clone();
        std::thread::spawn(move || {
            register_thread().unwrap();
            let key = 1u32.to_le_bytes();
            unsafe { assert!(other.lookup(key.as_ptr()).is_null()) };
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_linked_wrapper_shares_storage() {
        register_thread().unwrap();
        let base = Map::new("counter", &plain_def(MapType::Array), None).unwrap();
        let alias = base.share_as("counter");
        assert!(base.shares_storage_with(&alias));

        let key = 0u32.to_le_bytes();
        let value = 11u32.to_le_bytes();
        unsafe {
            base.update(key.as_ptr(), value.as_ptr(), 0);
            let got = std::ptr::read(alias.lookup(key.as_ptr()) as *const u32);
            assert_eq!(got, 11);
        }
    }

    #[test]
    fn test_unsupported_ops_report_error() {
        register_thread().unwrap();
        let map = Map::new("arr", &plain_def(MapType::Array), None).unwrap();
        let key = 0u32.to_le_bytes();
        unsafe {
            assert_eq!(map.delete(key.as_ptr()), MAP_ERROR);
            let mut buf = [0u8; 64];
            assert_eq!(map.dump(buf.as_mut_ptr(), 64), MAP_ERROR);
        }
        assert_eq!(map.size(), MAP_ERROR);
    }
}
