//! Codelet model
//!
//! A codelet is one verified, JIT-compiled program together with the
//! maps relocated into it. The VM instance stays alive for the
//! codelet's lifetime, it owns the compiled code the entry function
//! points into.

use crate::map::Map;
use crate::vm::{CodeletFn, CodeletVm};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One loaded program bound to a hook.
pub struct Codelet {
    name: String,
    hook_name: String,
    priority: u32,
    runtime_threshold: u64,
    func: CodeletFn,
    maps: HashMap<String, Arc<Map>>,
    installed: bool,
    // Owns the compiled program; dropped last, only mutated during
    // load under the lifecycle mutex.
    _vm: Mutex<Box<dyn CodeletVm>>,
}

impl Codelet {
    /// Assemble a codelet from its compiled parts.
    pub(crate) fn new(
        name: String,
        hook_name: String,
        priority: u32,
        runtime_threshold: u64,
        func: CodeletFn,
        maps: HashMap<String, Arc<Map>>,
        vm: Box<dyn CodeletVm>,
    ) -> Self {
        Self {
            name,
            hook_name,
            priority,
            runtime_threshold,
            func,
            maps,
            installed: false,
            _vm: Mutex::new(vm),
        }
    }

    /// Codelet name, unique within its set.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hook this codelet attaches to.
    pub fn hook_name(&self) -> &str {
        &self.hook_name
    }

    /// Dispatch priority.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Advisory runtime budget in nanoseconds.
    pub fn runtime_threshold(&self) -> u64 {
        self.runtime_threshold
    }

    /// Compiled entry function.
    pub fn func(&self) -> &CodeletFn {
        &self.func
    }

    /// Look up one of this codelet's maps by name.
    pub fn map(&self, name: &str) -> Option<&Arc<Map>> {
        self.maps.get(name)
    }

    /// Number of maps relocated into this codelet.
    pub fn num_maps(&self) -> usize {
        self.maps.len()
    }

    /// Take ownership of the map table for destruction.
    pub(crate) fn take_maps(&mut self) -> HashMap<String, Arc<Map>> {
        std::mem::take(&mut self.maps)
    }

    /// Whether the codelet is currently attached to its hook.
    pub(crate) fn installed(&self) -> bool {
        self.installed
    }

    pub(crate) fn set_installed(&mut self, installed: bool) {
        self.installed = installed;
    }
}
