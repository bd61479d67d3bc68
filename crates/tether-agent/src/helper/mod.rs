//! Helper function registry and ABI
//!
//! Helpers are host functions codelets call through numbered
//! relocation slots. The ABI is uniform: five `u64` arguments in, one
//! `u64` out, with pointers and sizes cast in and out by both sides.
//! The registry is a fixed 64-slot table; the built-in set occupies a
//! reserved prefix and operator helpers start at
//! [`ids::CUSTOM_START`]. Each codelet compile takes an immutable
//! snapshot of the table, so mutating the registry never affects
//! already-loaded codelets.

pub mod builtins;

use parking_lot::RwLock;
use std::sync::{Arc, LazyLock};

/// Uniform helper calling convention.
pub type HelperFn = fn(u64, u64, u64, u64, u64) -> u64;

/// Helper relocation ids.
pub mod ids {
    /// Table capacity; valid ids are `1..MAX`.
    pub const MAX: usize = 64;
    /// First id available to operator-registered helpers.
    pub const CUSTOM_START: u32 = 32;

    /// `map_lookup(map, key)`
    pub const MAP_LOOKUP: u32 = 1;
    /// `map_lookup_reset(map, key)`
    pub const MAP_LOOKUP_RESET: u32 = 2;
    /// `map_update(map, key, value, flags)`
    pub const MAP_UPDATE: u32 = 3;
    /// `map_delete(map, key)`
    pub const MAP_DELETE: u32 = 4;
    /// `map_clear(map)`
    pub const MAP_CLEAR: u32 = 5;
    /// `map_dump(map, buf, max_size, flags)`
    pub const MAP_DUMP: u32 = 6;
    /// `time_get_ns()`
    pub const TIME_GET_NS: u32 = 7;
    /// `get_sys_time(is_start)`
    pub const GET_SYS_TIME: u32 = 8;
    /// `get_sys_time_diff_ns(start, end)`
    pub const GET_SYS_TIME_DIFF_NS: u32 = 9;
    /// `hash(buf, size)`
    pub const HASH: u32 = 10;
    /// `printf(fmt, len, a1, a2, a3)`
    pub const PRINTF: u32 = 11;
    /// `ringbuf_output(map, data, size)`
    pub const RINGBUF_OUTPUT: u32 = 12;
    /// `mark_runtime_init()`
    pub const MARK_RUNTIME_INIT: u32 = 13;
    /// `runtime_limit_exceeded()`
    pub const RUNTIME_LIMIT_EXCEEDED: u32 = 14;
    /// `rand()`
    pub const RAND: u32 = 15;
    /// `control_input_receive(map, buf, size)`
    pub const CONTROL_INPUT_RECEIVE: u32 = 16;
    /// `get_output_buf(map)`
    pub const GET_OUTPUT_BUF: u32 = 17;
    /// `send_output(map)`
    pub const SEND_OUTPUT: u32 = 18;
}

/// Argument kinds for static verifier prototypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Unused slot.
    None,
    /// Plain scalar.
    Value,
    /// Pointer to a relocated map.
    MapHandle,
    /// Pointer into codelet-accessible memory.
    Buffer,
    /// Byte length of the preceding buffer argument.
    BufferLen,
}

/// Static prototype the external verifier checks calls against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperProto {
    /// Number of meaningful arguments.
    pub num_args: u8,
    /// Kind of each argument slot.
    pub args: [ArgKind; 5],
}

impl HelperProto {
    /// Prototype taking the given argument kinds.
    pub const fn new(args: &[ArgKind]) -> Self {
        let mut proto = [ArgKind::None; 5];
        let mut i = 0;
        while i < args.len() {
            proto[i] = args[i];
            i += 1;
        }
        Self {
            num_args: args.len() as u8,
            args: proto,
        }
    }
}

/// A helper registration.
#[derive(Clone)]
pub struct HelperDef {
    /// Relocation slot, `0 < reloc_id < ids::MAX`.
    pub reloc_id: u32,
    /// Symbolic name bound into the VM.
    pub name: String,
    /// Implementation.
    pub func: HelperFn,
    /// Verifier prototype.
    pub proto: HelperProto,
}

#[derive(Clone)]
struct Slot {
    name: Arc<str>,
    func: HelperFn,
    proto: HelperProto,
}

static REGISTRY: LazyLock<RwLock<Vec<Option<Slot>>>> =
    LazyLock::new(|| RwLock::new(builtins::default_table()));

fn default_slots() -> Vec<Option<Slot>> {
    builtins::default_table()
}

pub(crate) fn slot_from_def(def: &HelperDef) -> Slot {
    Slot {
        name: def.name.as_str().into(),
        func: def.func,
        proto: def.proto,
    }
}

/// Insert or replace the helper at `def.reloc_id`.
///
/// Returns 0 on insert, 1 on replace, −1 for an invalid id.
pub fn register_helper(def: HelperDef) -> i32 {
    if def.reloc_id == 0 || def.reloc_id as usize >= ids::MAX {
        return -1;
    }
    let mut registry = REGISTRY.write();
    let slot = &mut registry[def.reloc_id as usize];
    let replaced = slot.is_some();
    log::debug!("registering helper {} at id {}", def.name, def.reloc_id);
    *slot = Some(slot_from_def(&def));
    replaced as i32
}

/// Clear the helper slot at `reloc_id`.
///
/// Returns 0 on success, −1 when the slot is already empty, −2 for an
/// out-of-range id.
pub fn deregister_helper(reloc_id: u32) -> i32 {
    if reloc_id == 0 || reloc_id as usize >= ids::MAX {
        return -2;
    }
    let mut registry = REGISTRY.write();
    match registry[reloc_id as usize].take() {
        Some(_) => 0,
        None => -1,
    }
}

/// Restore the compile-time default helper set.
pub fn reset_helpers() {
    *REGISTRY.write() = default_slots();
}

/// Immutable snapshot of the helper table, bound into a codelet at
/// compile time.
#[derive(Clone)]
pub struct HelperTable {
    entries: Arc<[Option<Slot>]>,
}

impl HelperTable {
    /// Name of the helper at `reloc_id`, if the slot is occupied.
    pub fn name(&self, reloc_id: u32) -> Option<&str> {
        self.entries
            .get(reloc_id as usize)?
            .as_ref()
            .map(|s| &*s.name)
    }

    /// Function bound at `reloc_id`.
    pub fn get(&self, reloc_id: u32) -> Option<HelperFn> {
        self.entries.get(reloc_id as usize)?.as_ref().map(|s| s.func)
    }

    /// Prototype of the helper at `reloc_id`.
    pub fn proto(&self, reloc_id: u32) -> Option<HelperProto> {
        self.entries
            .get(reloc_id as usize)?
            .as_ref()
            .map(|s| s.proto)
    }

    /// Call the helper at `reloc_id`. Calling an empty slot is a
    /// codelet bug the verifier should have rejected; it reports −1.
    pub fn call(&self, reloc_id: u32, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64) -> u64 {
        match self.get(reloc_id) {
            Some(func) => func(a1, a2, a3, a4, a5),
            None => -1i64 as u64,
        }
    }

    /// Ids of all occupied slots.
    pub fn registered_ids(&self) -> Vec<u32> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id as u32))
            .collect()
    }
}

/// Snapshot the current helper table.
pub fn snapshot() -> HelperTable {
    HelperTable {
        entries: REGISTRY.read().clone().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    // The registry is process-global; serialize tests that mutate it.
    static LOCK: Mutex<()> = Mutex::new(());

    fn noop(_: u64, _: u64, _: u64, _: u64, _: u64) -> u64 {
        42
    }

    fn custom_def(id: u32) -> HelperDef {
        HelperDef {
            reloc_id: id,
            name: format!("custom_{id}"),
            func: noop,
            proto: HelperProto::new(&[ArgKind::Value]),
        }
    }

    #[test]
    fn test_builtins_present_in_snapshot() {
        let _guard = LOCK.lock();
        reset_helpers();
        let table = snapshot();
        assert_eq!(table.name(ids::MAP_LOOKUP), Some("map_lookup"));
        assert_eq!(table.name(ids::SEND_OUTPUT), Some("send_output"));
        assert!(table.get(ids::HASH).is_some());
        assert!(table.name(31).is_none());
    }

    #[test]
    fn test_register_replace_deregister() {
        let _guard = LOCK.lock();
        reset_helpers();
        assert_eq!(register_helper(custom_def(40)), 0);
        assert_eq!(register_helper(custom_def(40)), 1);
        assert_eq!(snapshot().call(40, 0, 0, 0, 0, 0), 42);

        assert_eq!(deregister_helper(40), 0);
        assert_eq!(deregister_helper(40), -1);
        assert_eq!(deregister_helper(0), -2);
        assert_eq!(deregister_helper(64), -2);
        assert_eq!(register_helper(custom_def(0)), -1);
        assert_eq!(register_helper(custom_def(64)), -1);
    }

    #[test]
    fn test_snapshot_is_immutable() {
        let _guard = LOCK.lock();
        reset_helpers();
        let table = snapshot();
        register_helper(custom_def(41));
        // The earlier snapshot does not see the new helper.
        assert!(table.get(41).is_none());
        assert!(snapshot().get(41).is_some());
        deregister_helper(41);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let _guard = LOCK.lock();
        register_helper(custom_def(42));
        reset_helpers();
        assert!(snapshot().get(42).is_none());
        assert!(snapshot().get(ids::MAP_UPDATE).is_some());
    }

    #[test]
    fn test_call_empty_slot_reports_error() {
        let _guard = LOCK.lock();
        reset_helpers();
        assert_eq!(snapshot().call(50, 0, 0, 0, 0, 0), -1i64 as u64);
    }

    #[test]
    fn test_proto_argument_kinds() {
        let _guard = LOCK.lock();
        reset_helpers();
        let proto = snapshot().proto(ids::MAP_UPDATE).unwrap();
        assert_eq!(proto.num_args, 4);
        assert_eq!(proto.args[0], ArgKind::MapHandle);
    }
}
