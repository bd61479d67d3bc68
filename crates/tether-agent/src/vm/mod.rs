//! Codelet VM seam
//!
//! The bytecode verifier and JIT compiler are external collaborators;
//! this module pins the interface the lifecycle controller drives them
//! through. A VM instance loads one object file, calling back into the
//! controller once per map symbol (`MapResolver`), then compiles to a
//! callable entry point against an immutable helper-table snapshot.
//! The bundled [`manifest`] backend implements the same contract for
//! declarative JSON objects, so every lifecycle path runs without a
//! real JIT in the process.

pub mod manifest;

use crate::helper::HelperTable;
use crate::map::MapDef;
use std::sync::Arc;

/// A compiled codelet entry point.
///
/// Called as `fn(ctx_ptr, ctx_len) -> u64`; the context layout is
/// hook-defined. Clones share the same underlying function, and
/// pointer identity (via [`codelet_fn_id`]) distinguishes distinct
/// compilations.
pub type CodeletFn = Arc<dyn Fn(*mut u8, usize) -> u64 + Send + Sync>;

/// Stable identity of a compiled entry point, used to reject duplicate
/// hook registrations.
pub fn codelet_fn_id(func: &CodeletFn) -> usize {
    Arc::as_ptr(func) as *const u8 as usize
}

/// Relocation callback the VM invokes once per map symbol.
///
/// Returns the address the JIT patches into the codelet's map
/// references; the pointee must stay valid for the codelet's lifetime.
pub trait MapResolver {
    /// Resolve `symbol` with the shape declared in the object file.
    fn resolve_map(&mut self, symbol: &str, def: &MapDef) -> Result<u64, VmError>;
}

/// Failures surfaced by a VM backend.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// The object file is malformed or failed verification.
    #[error("verification failed: {0}")]
    Verify(String),

    /// A map symbol could not be resolved.
    #[error("map relocation failed: {0}")]
    Relocation(String),

    /// JIT compilation failed.
    #[error("compilation failed: {0}")]
    Compile(String),
}

/// One VM instance owning one loaded codelet program.
pub trait CodeletVm: Send {
    /// Verify and load `object`, resolving every map symbol through
    /// `resolver`. `entry` names the exported entry function.
    fn load(
        &mut self,
        object: &[u8],
        entry: &str,
        resolver: &mut dyn MapResolver,
    ) -> Result<(), VmError>;

    /// JIT-compile the loaded program, binding the given helper table.
    /// Helper bindings are frozen at this point; later registry
    /// mutations do not affect the returned function.
    fn compile(&mut self, helpers: &HelperTable) -> Result<CodeletFn, VmError>;
}

/// Factory creating one VM instance per codelet load.
pub trait VmFactory: Send + Sync {
    /// Create a fresh VM instance.
    fn create_vm(&self) -> Box<dyn CodeletVm>;
}
