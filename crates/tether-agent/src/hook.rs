//! Hooks and the dispatch fast path
//!
//! A hook is a named dispatch point compiled into the host. Hosts
//! declare hooks as statics and hand them to `Agent::init`; the
//! lifecycle controller attaches compiled codelets to them. The
//! codelet list is a priority-sorted boxed slice published through one
//! atomic pointer store: dispatch never locks, registration swaps the
//! whole list under a mutex and reclaims the old one through the epoch
//! domain.

use crate::epoch;
use crate::perf::PerfSlab;
use crate::thread;
use crate::time;
use crate::vm::{codelet_fn_id, CodeletFn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// Return value a control hook reports when no codelet is attached.
pub const DEFAULT_CTRL_OP: u64 = 0;

/// Hook flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookType {
    /// Observational; codelet return values are discarded, any number
    /// of codelets may attach.
    Monitoring,
    /// Decision point; the single attached codelet's return value is
    /// handed back to the host.
    Control,
}

/// One entry of a hook's dispatch list.
///
/// Carries a copy of the codelet's runtime threshold so the fast path
/// never chases the codelet struct.
#[derive(Clone)]
pub struct HookCodelet {
    func: CodeletFn,
    priority: u32,
    runtime_threshold: u64,
}

struct CodeletList {
    entries: Vec<HookCodelet>,
}

/// Errors from codelet (de)registration on a hook.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// Control hooks accept exactly one codelet.
    #[error("control hook {0} already has a codelet")]
    ControlHookOccupied(String),

    /// The codelet is not attached to this hook.
    #[error("codelet is not registered on hook {0}")]
    NotFound(String),

    /// The calling thread could not obtain a thread id.
    #[error("calling thread could not be registered")]
    ThreadUnregistered,
}

// One writer at a time across all hooks; the fast path never takes
// this.
static HOOK_MUTEX: Mutex<()> = Mutex::new(());

/// A named dispatch point.
///
/// Const-constructible so hosts can declare hooks as statics:
///
/// ```ignore
/// static PACKET_SEEN: Hook = Hook::new("packet_seen", HookType::Monitoring);
/// ```
pub struct Hook {
    name: &'static str,
    hook_type: HookType,
    codelets: AtomicPtr<CodeletList>,
    perf_active: AtomicBool,
    perf: AtomicPtr<PerfSlab>,
}

impl Hook {
    /// Declare a hook. Registration with the agent happens at
    /// `Agent::init`.
    pub const fn new(name: &'static str, hook_type: HookType) -> Self {
        Self {
            name,
            hook_type,
            codelets: AtomicPtr::new(std::ptr::null_mut()),
            perf_active: AtomicBool::new(true),
            perf: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Hook name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Hook flavor.
    pub fn hook_type(&self) -> HookType {
        self.hook_type
    }

    /// Toggle perf recording for this hook.
    pub fn set_perf_active(&self, active: bool) {
        self.perf_active.store(active, Ordering::Relaxed);
    }

    /// Number of codelets currently attached.
    pub fn num_codelets(&self) -> usize {
        let rec = match thread::register_thread() {
            Some(rec) => rec,
            None => return 0,
        };
        let domain = epoch::domain();
        domain.begin(rec);
        let count = match unsafe { self.codelets.load(Ordering::Acquire).as_ref() } {
            Some(list) => list.entries.len(),
            None => 0,
        };
        domain.end(rec);
        count
    }

    /// Allocate the perf slab if this hook does not have one yet.
    pub(crate) fn init_perf(&self) {
        if self.perf.load(Ordering::Acquire).is_null() {
            let slab = Box::into_raw(Box::new(PerfSlab::new()));
            if self
                .perf
                .compare_exchange(
                    std::ptr::null_mut(),
                    slab,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                drop(unsafe { Box::from_raw(slab) });
            }
        }
    }

    /// Swap the perf slab for a fresh one, returning the old snapshot.
    /// The caller must pass an epoch barrier before reading it.
    pub(crate) fn rotate_perf(&self) -> Option<Box<PerfSlab>> {
        if self.perf.load(Ordering::Acquire).is_null() {
            return None;
        }
        let fresh = Box::into_raw(Box::new(PerfSlab::new()));
        let old = self.perf.swap(fresh, Ordering::AcqRel);
        if old.is_null() {
            None
        } else {
            Some(unsafe { Box::from_raw(old) })
        }
    }

    /// Attach a compiled codelet at the position its priority orders.
    ///
    /// Higher priority runs earlier; ties keep registration order. A
    /// codelet already attached (same compiled function) is a no-op.
    /// Control hooks reject a second codelet.
    pub fn register_codelet(
        &self,
        func: CodeletFn,
        runtime_threshold: u64,
        priority: u32,
    ) -> Result<(), HookError> {
        let rec = thread::register_thread().ok_or(HookError::ThreadUnregistered)?;
        let _guard = HOOK_MUTEX.lock();
        let domain = epoch::domain();

        domain.begin(rec);
        let old_ptr = self.codelets.load(Ordering::Acquire);
        let old = unsafe { old_ptr.as_ref() };

        if let Some(old) = old {
            if old
                .entries
                .iter()
                .any(|entry| codelet_fn_id(&entry.func) == codelet_fn_id(&func))
            {
                log::info!("codelet already registered to {}", self.name);
                domain.end(rec);
                return Ok(());
            }
            if self.hook_type == HookType::Control && !old.entries.is_empty() {
                domain.end(rec);
                return Err(HookError::ControlHookOccupied(self.name.to_string()));
            }
        }

        let mut entries = old.map(|l| l.entries.clone()).unwrap_or_default();
        let pos = entries
            .iter()
            .position(|entry| entry.priority < priority)
            .unwrap_or(entries.len());
        entries.insert(
            pos,
            HookCodelet {
                func,
                priority,
                runtime_threshold,
            },
        );
        let count = entries.len();

        let new_ptr = Box::into_raw(Box::new(CodeletList { entries }));
        self.codelets.store(new_ptr, Ordering::Release);
        domain.end(rec);

        if !old_ptr.is_null() {
            let addr = old_ptr as usize;
            domain.defer(
                rec,
                Box::new(move || drop(unsafe { Box::from_raw(addr as *mut CodeletList) })),
            );
            domain.barrier();
        }
        log::info!("{} codelets now registered to {}", count, self.name);
        Ok(())
    }

    /// Detach a codelet by its compiled function identity.
    pub fn remove_codelet(&self, func: &CodeletFn) -> Result<(), HookError> {
        let rec = thread::register_thread().ok_or(HookError::ThreadUnregistered)?;
        let _guard = HOOK_MUTEX.lock();
        let domain = epoch::domain();
        let target = codelet_fn_id(func);

        domain.begin(rec);
        let old_ptr = self.codelets.load(Ordering::Acquire);
        let Some(old) = (unsafe { old_ptr.as_ref() }) else {
            domain.end(rec);
            return Err(HookError::NotFound(self.name.to_string()));
        };

        let remaining: Vec<HookCodelet> = old
            .entries
            .iter()
            .filter(|entry| codelet_fn_id(&entry.func) != target)
            .cloned()
            .collect();
        if remaining.len() == old.entries.len() {
            domain.end(rec);
            return Err(HookError::NotFound(self.name.to_string()));
        }

        if remaining.is_empty() {
            self.codelets
                .store(std::ptr::null_mut(), Ordering::Release);
        } else {
            let new_ptr = Box::into_raw(Box::new(CodeletList { entries: remaining }));
            self.codelets.store(new_ptr, Ordering::Release);
        }
        domain.end(rec);

        // Wait out in-flight dispatches, then the old list is ours.
        domain.synchronize();
        drop(unsafe { Box::from_raw(old_ptr) });
        Ok(())
    }

    #[inline]
    fn record_perf(&self, thread_id: usize, elapsed_ns: u64) {
        let slab = self.perf.load(Ordering::Acquire);
        if let Some(slab) = unsafe { slab.as_ref() } {
            slab.record(thread_id, elapsed_ns);
        }
    }

    /// Dispatch a monitoring hook with `ctx`.
    ///
    /// The common idle path is one atomic load; with codelets attached
    /// the list runs in priority order inside an epoch section, each
    /// codelet's runtime threshold stamped into thread-local state
    /// first.
    #[inline]
    pub fn dispatch<C>(&self, ctx: &mut C) {
        if self.codelets.load(Ordering::Acquire).is_null() {
            return;
        }
        let Some(thread_id) = thread::register_thread() else {
            return;
        };
        let domain = epoch::domain();
        domain.begin(thread_id);
        // Re-read under the epoch; the early load only shortcut the
        // idle path and may be stale by now.
        let list_ptr = self.codelets.load(Ordering::Acquire);
        if let Some(list) = unsafe { list_ptr.as_ref() } {
            let ctx_ptr = ctx as *mut C as *mut u8;
            let ctx_len = std::mem::size_of::<C>();
            let start = time::start_time();
            for entry in &list.entries {
                thread::set_runtime_threshold(entry.runtime_threshold);
                (entry.func)(ctx_ptr, ctx_len);
            }
            let end = time::stop_time();
            if self.perf_active.load(Ordering::Relaxed) {
                self.record_perf(thread_id, time::diff_ns(start, end));
            }
        }
        domain.end(thread_id);
    }

    /// Dispatch a control hook with `ctx`, returning the codelet's
    /// value, or [`DEFAULT_CTRL_OP`] when none is attached.
    #[inline]
    pub fn dispatch_ctrl<C>(&self, ctx: &mut C) -> u64 {
        let mut result = DEFAULT_CTRL_OP;
        if self.codelets.load(Ordering::Acquire).is_null() {
            return result;
        }
        let Some(thread_id) = thread::register_thread() else {
            return result;
        };
        let domain = epoch::domain();
        domain.begin(thread_id);
        let list_ptr = self.codelets.load(Ordering::Acquire);
        if let Some(list) = unsafe { list_ptr.as_ref() } {
            if let Some(entry) = list.entries.first() {
                let start = time::start_time();
                thread::set_runtime_threshold(entry.runtime_threshold);
                result = (entry.func)(ctx as *mut C as *mut u8, std::mem::size_of::<C>());
                let end = time::stop_time();
                if self.perf_active.load(Ordering::Relaxed) {
                    self.record_perf(thread_id, time::diff_ns(start, end));
                }
            }
        }
        domain.end(thread_id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex as StdMutex};

    fn make_fn(order: Arc<StdMutex<Vec<u32>>>, tag: u32) -> CodeletFn {
        Arc::new(move |_ctx, _len| {
            order.lock().unwrap().push(tag);
            tag as u64
        })
    }

    #[test]
    fn test_dispatch_runs_in_priority_order() {
        static HOOK: Hook = Hook::new("hook_test_priority", HookType::Monitoring);
        let order = Arc::new(StdMutex::new(Vec::new()));
        let low = make_fn(order.clone(), 1);
        let high = make_fn(order.clone(), 10);
        let mid = make_fn(order.clone(), 5);

        HOOK.register_codelet(low.clone(), 0, 1).unwrap();
        HOOK.register_codelet(high.clone(), 0, 10).unwrap();
        HOOK.register_codelet(mid.clone(), 0, 5).unwrap();
        assert_eq!(HOOK.num_codelets(), 3);

        let mut ctx = 0u64;
        HOOK.dispatch(&mut ctx);
        assert_eq!(*order.lock().unwrap(), vec![10, 5, 1]);

        HOOK.remove_codelet(&low).unwrap();
        HOOK.remove_codelet(&mid).unwrap();
        HOOK.remove_codelet(&high).unwrap();
        assert_eq!(HOOK.num_codelets(), 0);
    }

    #[test]
    fn test_equal_priority_keeps_registration_order() {
        static HOOK: Hook = Hook::new("hook_test_ties", HookType::Monitoring);
        let order = Arc::new(StdMutex::new(Vec::new()));
        let first = make_fn(order.clone(), 1);
        let second = make_fn(order.clone(), 2);

        HOOK.register_codelet(first.clone(), 0, 7).unwrap();
        HOOK.register_codelet(second.clone(), 0, 7).unwrap();
        let mut ctx = ();
        HOOK.dispatch(&mut ctx);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);

        HOOK.remove_codelet(&first).unwrap();
        HOOK.remove_codelet(&second).unwrap();
    }

    #[test]
    fn test_duplicate_registration_is_noop() {
        static HOOK: Hook = Hook::new("hook_test_dup", HookType::Monitoring);
        let order = Arc::new(StdMutex::new(Vec::new()));
        let func = make_fn(order, 1);
        HOOK.register_codelet(func.clone(), 0, 1).unwrap();
        HOOK.register_codelet(func.clone(), 0, 1).unwrap();
        assert_eq!(HOOK.num_codelets(), 1);
        HOOK.remove_codelet(&func).unwrap();
    }

    #[test]
    fn test_control_hook_single_codelet() {
        static HOOK: Hook = Hook::new("hook_test_ctrl", HookType::Control);
        let order = Arc::new(StdMutex::new(Vec::new()));
        let first = make_fn(order.clone(), 11);
        let second = make_fn(order.clone(), 22);

        HOOK.register_codelet(first.clone(), 0, 1).unwrap();
        assert!(matches!(
            HOOK.register_codelet(second, 0, 1),
            Err(HookError::ControlHookOccupied(_))
        ));

        let mut ctx = 0u32;
        assert_eq!(HOOK.dispatch_ctrl(&mut ctx), 11);
        HOOK.remove_codelet(&first).unwrap();
        assert_eq!(HOOK.dispatch_ctrl(&mut ctx), DEFAULT_CTRL_OP);
    }

    #[test]
    fn test_remove_unknown_codelet() {
        static HOOK: Hook = Hook::new("hook_test_rm", HookType::Monitoring);
        let order = Arc::new(StdMutex::new(Vec::new()));
        let attached = make_fn(order.clone(), 1);
        let stranger = make_fn(order, 2);

        assert!(matches!(
            HOOK.remove_codelet(&stranger),
            Err(HookError::NotFound(_))
        ));
        HOOK.register_codelet(attached.clone(), 0, 1).unwrap();
        assert!(matches!(
            HOOK.remove_codelet(&stranger),
            Err(HookError::NotFound(_))
        ));
        HOOK.remove_codelet(&attached).unwrap();
    }

    #[test]
    fn test_threshold_stamped_per_codelet() {
        static HOOK: Hook = Hook::new("hook_test_thresh", HookType::Monitoring);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let func: CodeletFn = Arc::new(move |_ctx, _len| {
            sink.lock().unwrap().push(thread::runtime_threshold());
            0
        });
        HOOK.register_codelet(func.clone(), 12_345, 1).unwrap();
        let mut ctx = ();
        HOOK.dispatch(&mut ctx);
        assert_eq!(*seen.lock().unwrap(), vec![12_345]);
        HOOK.remove_codelet(&func).unwrap();
    }

    #[test]
    fn test_dispatch_visibility_after_remove() {
        static HOOK: Hook = Hook::new("hook_test_vis", HookType::Monitoring);
        let hits = Arc::new(AtomicUsize::new(0));
        let sink = hits.clone();
        let func: CodeletFn = Arc::new(move |_ctx, _len| {
            sink.fetch_add(1, Ordering::SeqCst);
            0
        });
        HOOK.register_codelet(func.clone(), 0, 1).unwrap();
        let mut ctx = ();
        HOOK.dispatch(&mut ctx);
        HOOK.remove_codelet(&func).unwrap();
        HOOK.dispatch(&mut ctx);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ctx_reaches_codelet() {
        static HOOK: Hook = Hook::new("hook_test_ctx", HookType::Monitoring);
        #[repr(C)]
        struct Packet {
            counter: u32,
        }
        let func: CodeletFn = Arc::new(|ctx, len| {
            assert_eq!(len, std::mem::size_of::<Packet>());
            let packet = unsafe { &mut *(ctx as *mut Packet) };
            packet.counter += 1;
            0
        });
        HOOK.register_codelet(func.clone(), 0, 1).unwrap();
        let mut packet = Packet { counter: 7 };
        HOOK.dispatch(&mut packet);
        assert_eq!(packet.counter, 8);
        HOOK.remove_codelet(&func).unwrap();
    }
}
