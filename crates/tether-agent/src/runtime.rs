//! Process-wide runtime singletons
//!
//! The hook dispatch fast path runs on arbitrary host threads with no
//! agent handle in scope, so the epoch domain, the thread-id bitmap and
//! the hook registry live in one lazily initialized process singleton.
//! Everything else (lifecycle state, transports, configuration) is
//! owned by the [`crate::agent::Agent`] instance and passed by
//! reference.

use crate::config::{MAX_NUM_HOOKS, MAX_REG_THREADS};
use crate::epoch::EpochDomain;
use crate::hook::Hook;
use crate::thread::Bitmap;
use parking_lot::RwLock;
use std::sync::LazyLock;

/// The shared runtime state.
pub struct Runtime {
    /// Epoch reclamation domain, one record per registered thread.
    pub epoch: EpochDomain,
    /// Bitmap of allocated thread ids.
    pub threads: Bitmap,
    hooks: RwLock<Vec<&'static Hook>>,
}

static RUNTIME: LazyLock<Runtime> = LazyLock::new(|| Runtime {
    epoch: EpochDomain::new(MAX_REG_THREADS),
    threads: Bitmap::new(MAX_REG_THREADS),
    hooks: RwLock::new(Vec::new()),
});

/// Access the process runtime.
pub fn global() -> &'static Runtime {
    &RUNTIME
}

/// Errors from hook registration at agent init.
#[derive(Debug, thiserror::Error)]
pub enum HookRegistryError {
    /// More hooks than [`MAX_NUM_HOOKS`] were supplied.
    #[error("number of hooks exceeds the maximum of {MAX_NUM_HOOKS}")]
    TooManyHooks,
}

impl Runtime {
    /// Register the given hooks, skipping ones already present.
    ///
    /// Hooks are static: they can be registered once and stay for the
    /// process lifetime; only their codelet lists and perf slabs churn.
    pub fn register_hooks(
        &self,
        hooks: &[&'static Hook],
    ) -> Result<(), HookRegistryError> {
        let mut registry = self.hooks.write();
        for hook in hooks {
            if registry
                .iter()
                .any(|h| std::ptr::eq(*h as *const Hook, *hook as *const Hook))
            {
                continue;
            }
            if registry.len() == MAX_NUM_HOOKS {
                return Err(HookRegistryError::TooManyHooks);
            }
            hook.init_perf();
            registry.push(hook);
            log::debug!("registered hook {}", hook.name());
        }
        Ok(())
    }

    /// Look up a hook by name.
    pub fn find_hook(&self, name: &str) -> Option<&'static Hook> {
        self.hooks.read().iter().copied().find(|h| h.name() == name)
    }

    /// Whether a hook with this name is registered.
    pub fn hook_exists(&self, name: &str) -> bool {
        self.find_hook(name).is_some()
    }

    /// Snapshot of all registered hooks.
    pub fn hooks(&self) -> Vec<&'static Hook> {
        self.hooks.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::HookType;

    static HOOK_A: Hook = Hook::new("runtime_test_a", HookType::Monitoring);
    static HOOK_B: Hook = Hook::new("runtime_test_b", HookType::Control);

    #[test]
    fn test_register_and_find_hooks() {
        let rt = global();
        rt.register_hooks(&[&HOOK_A, &HOOK_B]).unwrap();
        // Re-registration of the same statics is a no-op.
        rt.register_hooks(&[&HOOK_A]).unwrap();

        assert!(rt.hook_exists("runtime_test_a"));
        assert!(rt.hook_exists("runtime_test_b"));
        assert!(!rt.hook_exists("runtime_test_missing"));
        let found = rt.find_hook("runtime_test_a").unwrap();
        assert!(std::ptr::eq(found as *const Hook, &HOOK_A as *const Hook));
    }
}
