//! Built-in helper implementations
//!
//! These are the host calls every codelet can rely on. All of them
//! take the uniform five-`u64` ABI; map handles are the relocated
//! pointers handed out during codelet load, buffers are pointers into
//! memory the verifier proved accessible.

use super::{ArgKind, HelperFn, HelperProto, Slot};
use crate::hash::hashlittle;
use crate::map::{Map, MapType};
use crate::thread;
use crate::time;

/// Longest format or `%s` operand accepted by the printf helper.
pub const MAX_PRINTF_STR_LEN: usize = 64;

#[inline]
unsafe fn map_ref<'a>(handle: u64) -> Option<&'a Map> {
    if handle == 0 {
        None
    } else {
        Some(&*(handle as *const Map))
    }
}

fn helper_map_lookup(map: u64, key: u64, _: u64, _: u64, _: u64) -> u64 {
    if key == 0 {
        return 0;
    }
    match unsafe { map_ref(map) } {
        Some(map) => unsafe { map.lookup(key as *const u8) as u64 },
        None => 0,
    }
}

fn helper_map_lookup_reset(map: u64, key: u64, _: u64, _: u64, _: u64) -> u64 {
    if key == 0 {
        return 0;
    }
    match unsafe { map_ref(map) } {
        Some(map) => unsafe { map.lookup_reset(key as *const u8) as u64 },
        None => 0,
    }
}

fn helper_map_update(map: u64, key: u64, value: u64, flags: u64, _: u64) -> u64 {
    if key == 0 || value == 0 {
        return -1i64 as u64;
    }
    match unsafe { map_ref(map) } {
        Some(map) => {
            unsafe { map.update(key as *const u8, value as *const u8, flags) as i64 as u64 }
        }
        None => -1i64 as u64,
    }
}

fn helper_map_delete(map: u64, key: u64, _: u64, _: u64, _: u64) -> u64 {
    if key == 0 {
        return -1i64 as u64;
    }
    match unsafe { map_ref(map) } {
        Some(map) => unsafe { map.delete(key as *const u8) as i64 as u64 },
        None => -1i64 as u64,
    }
}

fn helper_map_clear(map: u64, _: u64, _: u64, _: u64, _: u64) -> u64 {
    match unsafe { map_ref(map) } {
        Some(map) => map.clear() as i64 as u64,
        None => -1i64 as u64,
    }
}

fn helper_map_dump(map: u64, buf: u64, max_size: u64, _flags: u64, _: u64) -> u64 {
    if buf == 0 {
        return -1i64 as u64;
    }
    match unsafe { map_ref(map) } {
        Some(map) => unsafe { map.dump(buf as *mut u8, max_size as u32) as i64 as u64 },
        None => -1i64 as u64,
    }
}

fn helper_time_get_ns(_: u64, _: u64, _: u64, _: u64, _: u64) -> u64 {
    time::wall_clock_ns()
}

fn helper_get_sys_time(is_start: u64, _: u64, _: u64, _: u64, _: u64) -> u64 {
    if is_start != 0 {
        time::start_time()
    } else {
        time::stop_time()
    }
}

fn helper_get_sys_time_diff_ns(start: u64, end: u64, _: u64, _: u64, _: u64) -> u64 {
    time::diff_ns(start, end)
}

fn helper_hash(item: u64, size: u64, _: u64, _: u64, _: u64) -> u64 {
    if item == 0 {
        return 0;
    }
    let data = unsafe { std::slice::from_raw_parts(item as *const u8, size as usize) };
    hashlittle(data, 0) as u64
}

#[cfg(not(feature = "perf-opt"))]
fn format_printf(fmt: &str, args: [u64; 3]) -> Result<String, ()> {
    let mut out = String::new();
    let mut chars = fmt.chars().peekable();
    let mut used = 0usize;
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let Some(&spec) = chars.peek() else {
            return Err(());
        };
        if spec == '%' {
            chars.next();
            out.push('%');
            continue;
        }
        // Skip length modifiers such as l / ll / z.
        let mut spec = spec;
        while matches!(spec, 'l' | 'z' | 'h') {
            chars.next();
            spec = *chars.peek().ok_or(())?;
        }
        chars.next();
        if used == 3 {
            return Err(());
        }
        let arg = args[used];
        used += 1;
        match spec {
            'd' | 'i' => out.push_str(&(arg as i64).to_string()),
            'u' => out.push_str(&arg.to_string()),
            'x' => out.push_str(&format!("{arg:x}")),
            'p' => out.push_str(&format!("{arg:#x}")),
            'c' => out.push((arg as u8) as char),
            's' => {
                if arg == 0 {
                    return Err(());
                }
                // The operand must be a NUL-terminated string within a
                // bounded window.
                let bytes =
                    unsafe { std::slice::from_raw_parts(arg as *const u8, MAX_PRINTF_STR_LEN) };
                let len = bytes.iter().position(|&b| b == 0).ok_or(())?;
                out.push_str(std::str::from_utf8(&bytes[..len]).map_err(|_| ())?);
            }
            _ => return Err(()),
        }
    }
    Ok(out)
}

#[cfg(not(feature = "perf-opt"))]
fn helper_printf(fmt: u64, len: u64, a1: u64, a2: u64, a3: u64) -> u64 {
    if fmt == 0 || len == 0 || len as usize > MAX_PRINTF_STR_LEN {
        return -1i64 as u64;
    }
    let raw = unsafe { std::slice::from_raw_parts(fmt as *const u8, len as usize) };
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let Ok(fmt) = std::str::from_utf8(&raw[..end]) else {
        return -1i64 as u64;
    };
    let wanted = fmt.matches('%').count() - 2 * fmt.matches("%%").count();
    if wanted > 3 {
        log::error!("printf helper supports at most 3 arguments");
        return -1i64 as u64;
    }
    match format_printf(fmt, [a1, a2, a3]) {
        Ok(msg) => {
            log::debug!(target: "codelet", "{msg}");
            0
        }
        Err(()) => -1i64 as u64,
    }
}

#[cfg(feature = "perf-opt")]
fn helper_printf(_: u64, _: u64, _: u64, _: u64, _: u64) -> u64 {
    0
}

fn helper_ringbuf_output(map: u64, data: u64, size: u64, _: u64, _: u64) -> u64 {
    if data == 0 {
        return -1i64 as u64;
    }
    let Some(map) = (unsafe { map_ref(map) }) else {
        return -1i64 as u64;
    };
    if map.map_type() != MapType::Ringbuf {
        return -1i64 as u64;
    }
    let Some(channel) = map.channel() else {
        return -1i64 as u64;
    };
    unsafe { channel.send(data as *const u8, size as usize) as i64 as u64 }
}

fn helper_mark_runtime_init(_: u64, _: u64, _: u64, _: u64, _: u64) -> u64 {
    thread::set_runtime_mark(time::start_time());
    0
}

fn helper_runtime_limit_exceeded(_: u64, _: u64, _: u64, _: u64, _: u64) -> u64 {
    let threshold = thread::runtime_threshold();
    if threshold == 0 {
        return 0;
    }
    let elapsed = time::diff_ns(thread::runtime_mark(), time::stop_time());
    (elapsed > threshold) as u64
}

fn helper_rand(_: u64, _: u64, _: u64, _: u64, _: u64) -> u64 {
    thread::rand_u32() as u64
}

fn helper_control_input_receive(map: u64, buf: u64, size: u64, _: u64, _: u64) -> u64 {
    if buf == 0 {
        return -1i64 as u64;
    }
    let Some(map) = (unsafe { map_ref(map) }) else {
        return -1i64 as u64;
    };
    if map.map_type() != MapType::ControlInput || (size as u32) < map.value_size() {
        return -1i64 as u64;
    }
    let Some(channel) = map.channel() else {
        return -1i64 as u64;
    };
    unsafe { channel.recv(buf as *mut u8) as i64 as u64 }
}

fn helper_get_output_buf(map: u64, _: u64, _: u64, _: u64, _: u64) -> u64 {
    let Some(map) = (unsafe { map_ref(map) }) else {
        return 0;
    };
    if map.map_type() != MapType::Output {
        return 0;
    }
    let (Some(channel), Some(thread_id)) = (map.channel(), thread::current_thread_id()) else {
        return 0;
    };
    channel.reserve_buf(thread_id) as u64
}

fn helper_send_output(map: u64, _: u64, _: u64, _: u64, _: u64) -> u64 {
    let Some(map) = (unsafe { map_ref(map) }) else {
        return -1i64 as u64;
    };
    if map.map_type() != MapType::Output {
        return -1i64 as u64;
    }
    let (Some(channel), Some(thread_id)) = (map.channel(), thread::current_thread_id()) else {
        return -1i64 as u64;
    };
    channel.submit_buf(thread_id) as i64 as u64
}

struct Builtin {
    id: u32,
    name: &'static str,
    func: HelperFn,
    proto: HelperProto,
}

const MAP_KEY: &[ArgKind] = &[ArgKind::MapHandle, ArgKind::Buffer];
const MAP_ONLY: &[ArgKind] = &[ArgKind::MapHandle];
const NO_ARGS: &[ArgKind] = &[];

fn builtin_set() -> Vec<Builtin> {
    use super::ids;
    vec![
        Builtin {
            id: ids::MAP_LOOKUP,
            name: "map_lookup",
            func: helper_map_lookup,
            proto: HelperProto::new(MAP_KEY),
        },
        Builtin {
            id: ids::MAP_LOOKUP_RESET,
            name: "map_lookup_reset",
            func: helper_map_lookup_reset,
            proto: HelperProto::new(MAP_KEY),
        },
        Builtin {
            id: ids::MAP_UPDATE,
            name: "map_update",
            func: helper_map_update,
            proto: HelperProto::new(&[
                ArgKind::MapHandle,
                ArgKind::Buffer,
                ArgKind::Buffer,
                ArgKind::Value,
            ]),
        },
        Builtin {
            id: ids::MAP_DELETE,
            name: "map_delete",
            func: helper_map_delete,
            proto: HelperProto::new(MAP_KEY),
        },
        Builtin {
            id: ids::MAP_CLEAR,
            name: "map_clear",
            func: helper_map_clear,
            proto: HelperProto::new(MAP_ONLY),
        },
        Builtin {
            id: ids::MAP_DUMP,
            name: "map_dump",
            func: helper_map_dump,
            proto: HelperProto::new(&[
                ArgKind::MapHandle,
                ArgKind::Buffer,
                ArgKind::BufferLen,
                ArgKind::Value,
            ]),
        },
        Builtin {
            id: ids::TIME_GET_NS,
            name: "time_get_ns",
            func: helper_time_get_ns,
            proto: HelperProto::new(NO_ARGS),
        },
        Builtin {
            id: ids::GET_SYS_TIME,
            name: "get_sys_time",
            func: helper_get_sys_time,
            proto: HelperProto::new(&[ArgKind::Value]),
        },
        Builtin {
            id: ids::GET_SYS_TIME_DIFF_NS,
            name: "get_sys_time_diff_ns",
            func: helper_get_sys_time_diff_ns,
            proto: HelperProto::new(&[ArgKind::Value, ArgKind::Value]),
        },
        Builtin {
            id: ids::HASH,
            name: "hash",
            func: helper_hash,
            proto: HelperProto::new(&[ArgKind::Buffer, ArgKind::BufferLen]),
        },
        Builtin {
            id: ids::PRINTF,
            name: "printf",
            func: helper_printf,
            proto: HelperProto::new(&[
                ArgKind::Buffer,
                ArgKind::BufferLen,
                ArgKind::Value,
                ArgKind::Value,
                ArgKind::Value,
            ]),
        },
        Builtin {
            id: ids::RINGBUF_OUTPUT,
            name: "ringbuf_output",
            func: helper_ringbuf_output,
            proto: HelperProto::new(&[ArgKind::MapHandle, ArgKind::Buffer, ArgKind::BufferLen]),
        },
        Builtin {
            id: ids::MARK_RUNTIME_INIT,
            name: "mark_runtime_init",
            func: helper_mark_runtime_init,
            proto: HelperProto::new(NO_ARGS),
        },
        Builtin {
            id: ids::RUNTIME_LIMIT_EXCEEDED,
            name: "runtime_limit_exceeded",
            func: helper_runtime_limit_exceeded,
            proto: HelperProto::new(NO_ARGS),
        },
        Builtin {
            id: ids::RAND,
            name: "rand",
            func: helper_rand,
            proto: HelperProto::new(NO_ARGS),
        },
        Builtin {
            id: ids::CONTROL_INPUT_RECEIVE,
            name: "control_input_receive",
            func: helper_control_input_receive,
            proto: HelperProto::new(&[ArgKind::MapHandle, ArgKind::Buffer, ArgKind::BufferLen]),
        },
        Builtin {
            id: ids::GET_OUTPUT_BUF,
            name: "get_output_buf",
            func: helper_get_output_buf,
            proto: HelperProto::new(MAP_ONLY),
        },
        Builtin {
            id: ids::SEND_OUTPUT,
            name: "send_output",
            func: helper_send_output,
            proto: HelperProto::new(MAP_ONLY),
        },
    ]
}

/// Build the default helper table: built-ins in their reserved slots,
/// everything else empty.
pub(super) fn default_table() -> Vec<Option<Slot>> {
    let mut table: Vec<Option<Slot>> = vec![None; super::ids::MAX];
    for builtin in builtin_set() {
        table[builtin.id as usize] = Some(Slot {
            name: builtin.name.into(),
            func: builtin.func,
            proto: builtin.proto,
        });
    }
    table
}
