//! Manifest VM backend
//!
//! A reference implementation of the VM seam for environments without
//! the external verifier/JIT pair. The "object file" is a JSON
//! manifest declaring the codelet's maps, required helper ids and a
//! program name; programs are host-registered Rust functions. Loading
//! performs real map relocation through [`MapResolver`] and compiling
//! performs real helper binding, so the lifecycle engine is exercised
//! end to end. The test-suite and the emulator host run on this
//! backend.

use crate::config::CODELET_ENTRY_FN;
use crate::helper::HelperTable;
use crate::map::MapDef;
use crate::vm::{CodeletFn, CodeletVm, MapResolver, VmError, VmFactory};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Deserialize)]
struct ManifestMap {
    name: String,
    #[serde(flatten)]
    def: MapDef,
}

#[derive(Deserialize)]
struct Manifest {
    /// Map symbols the program references.
    #[serde(default)]
    maps: Vec<ManifestMap>,
    /// Name of the registered program implementing the codelet body.
    program: String,
    /// Exported entry symbol; must match the loader's expectation.
    #[serde(default = "default_entry")]
    entry: String,
    /// Helper ids the program calls; unresolved ids fail the load.
    #[serde(default)]
    helpers: Vec<u32>,
}

fn default_entry() -> String {
    CODELET_ENTRY_FN.to_string()
}

/// Execution environment handed to a manifest program.
pub struct ProgramEnv {
    maps: HashMap<String, u64>,
    helpers: HelperTable,
}

impl ProgramEnv {
    /// Relocated handle of the map declared under `name`, or 0 when
    /// the program never declared it.
    pub fn map(&self, name: &str) -> u64 {
        self.maps.get(name).copied().unwrap_or(0)
    }

    /// Call a bound helper by relocation id.
    pub fn call_helper(&self, id: u32, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64) -> u64 {
        self.helpers.call(id, a1, a2, a3, a4, a5)
    }
}

/// A host-registered codelet body.
pub type ProgramFn = Arc<dyn Fn(&ProgramEnv, *mut u8, usize) -> u64 + Send + Sync>;

/// Registry of program names available to manifest objects.
#[derive(Default)]
pub struct ProgramRegistry {
    programs: DashMap<String, ProgramFn>,
}

impl ProgramRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a program body under `name`.
    pub fn register(
        &self,
        name: &str,
        program: impl Fn(&ProgramEnv, *mut u8, usize) -> u64 + Send + Sync + 'static,
    ) {
        self.programs.insert(name.to_string(), Arc::new(program));
    }

    fn get(&self, name: &str) -> Option<ProgramFn> {
        self.programs.get(name).map(|entry| entry.clone())
    }
}

/// Factory producing manifest VM instances over a shared program
/// registry.
pub struct ManifestVmFactory {
    programs: Arc<ProgramRegistry>,
}

impl ManifestVmFactory {
    /// Build a factory over `programs`.
    pub fn new(programs: Arc<ProgramRegistry>) -> Self {
        Self { programs }
    }
}

impl VmFactory for ManifestVmFactory {
    fn create_vm(&self) -> Box<dyn CodeletVm> {
        Box::new(ManifestVm {
            programs: self.programs.clone(),
            loaded: None,
        })
    }
}

struct LoadedProgram {
    maps: HashMap<String, u64>,
    program: ProgramFn,
    required_helpers: Vec<u32>,
}

/// VM instance interpreting one JSON manifest object.
pub struct ManifestVm {
    programs: Arc<ProgramRegistry>,
    loaded: Option<LoadedProgram>,
}

impl CodeletVm for ManifestVm {
    fn load(
        &mut self,
        object: &[u8],
        entry: &str,
        resolver: &mut dyn MapResolver,
    ) -> Result<(), VmError> {
        let manifest: Manifest = serde_json::from_slice(object)
            .map_err(|err| VmError::Verify(format!("invalid codelet object: {err}")))?;
        if manifest.entry != entry {
            return Err(VmError::Verify(format!(
                "object exports entry {} but {} was requested",
                manifest.entry, entry
            )));
        }
        let program = self.programs.get(&manifest.program).ok_or_else(|| {
            VmError::Verify(format!("unknown program {}", manifest.program))
        })?;

        let mut maps = HashMap::with_capacity(manifest.maps.len());
        for map in &manifest.maps {
            let handle = resolver.resolve_map(&map.name, &map.def)?;
            maps.insert(map.name.clone(), handle);
        }

        self.loaded = Some(LoadedProgram {
            maps,
            program,
            required_helpers: manifest.helpers,
        });
        Ok(())
    }

    fn compile(&mut self, helpers: &HelperTable) -> Result<CodeletFn, VmError> {
        let loaded = self
            .loaded
            .take()
            .ok_or_else(|| VmError::Compile("no program loaded".to_string()))?;
        for id in &loaded.required_helpers {
            if helpers.get(*id).is_none() {
                return Err(VmError::Compile(format!(
                    "program references unregistered helper id {id}"
                )));
            }
        }
        let env = ProgramEnv {
            maps: loaded.maps,
            helpers: helpers.clone(),
        };
        let program = loaded.program;
        Ok(Arc::new(move |ctx, ctx_len| program(&env, ctx, ctx_len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper;
    use crate::map::MapType;

    struct FakeResolver {
        resolved: Vec<(String, MapDef)>,
    }

    impl MapResolver for FakeResolver {
        fn resolve_map(&mut self, symbol: &str, def: &MapDef) -> Result<u64, VmError> {
            if symbol == "poison" {
                return Err(VmError::Relocation("poisoned symbol".to_string()));
            }
            self.resolved.push((symbol.to_string(), *def));
            Ok(0x1000 + self.resolved.len() as u64)
        }
    }

    fn registry_with_probe() -> Arc<ProgramRegistry> {
        let registry = Arc::new(ProgramRegistry::new());
        registry.register("probe", |env, _ctx, _len| env.map("counter"));
        registry
    }

    const OBJECT: &[u8] = br#"{
        "maps": [
            {"name": "counter", "type": "array", "key_size": 4,
             "value_size": 4, "max_entries": 1}
        ],
        "program": "probe"
    }"#;

    #[test]
    fn test_load_resolves_maps_and_compiles() {
        let factory = ManifestVmFactory::new(registry_with_probe());
        let mut vm = factory.create_vm();
        let mut resolver = FakeResolver { resolved: vec![] };
        vm.load(OBJECT, CODELET_ENTRY_FN, &mut resolver).unwrap();
        assert_eq!(resolver.resolved.len(), 1);
        assert_eq!(resolver.resolved[0].0, "counter");
        assert_eq!(resolver.resolved[0].1.map_type, MapType::Array);

        let func = vm.compile(&helper::snapshot()).unwrap();
        // The program returns its relocated map handle.
        assert_eq!(func(std::ptr::null_mut(), 0), 0x1001);
    }

    #[test]
    fn test_load_rejects_unknown_program() {
        let factory = ManifestVmFactory::new(registry_with_probe());
        let mut vm = factory.create_vm();
        let object = br#"{"program": "missing"}"#;
        let mut resolver = FakeResolver { resolved: vec![] };
        let err = vm
            .load(object, CODELET_ENTRY_FN, &mut resolver)
            .unwrap_err();
        assert!(matches!(err, VmError::Verify(_)));
    }

    #[test]
    fn test_load_rejects_wrong_entry_name() {
        let factory = ManifestVmFactory::new(registry_with_probe());
        let mut vm = factory.create_vm();
        let object = br#"{"program": "probe", "entry": "other_entry"}"#;
        let mut resolver = FakeResolver { resolved: vec![] };
        assert!(vm.load(object, CODELET_ENTRY_FN, &mut resolver).is_err());
    }

    #[test]
    fn test_load_propagates_relocation_failure() {
        let factory = ManifestVmFactory::new(registry_with_probe());
        let mut vm = factory.create_vm();
        let object = br#"{
            "maps": [{"name": "poison", "type": "hashmap", "key_size": 4,
                      "value_size": 4, "max_entries": 4}],
            "program": "probe"
        }"#;
        let mut resolver = FakeResolver { resolved: vec![] };
        let err = vm
            .load(object, CODELET_ENTRY_FN, &mut resolver)
            .unwrap_err();
        assert!(matches!(err, VmError::Relocation(_)));
    }

    #[test]
    fn test_compile_rejects_missing_helper() {
        let factory = ManifestVmFactory::new(registry_with_probe());
        let mut vm = factory.create_vm();
        let object = br#"{"program": "probe", "helpers": [62]}"#;
        let mut resolver = FakeResolver { resolved: vec![] };
        vm.load(object, CODELET_ENTRY_FN, &mut resolver).unwrap();
        let err = match vm.compile(&helper::snapshot()) {
            Ok(_) => panic!("expected compile to fail"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("62"));
    }

    #[test]
    fn test_malformed_object_fails_verification() {
        let factory = ManifestVmFactory::new(registry_with_probe());
        let mut vm = factory.create_vm();
        let mut resolver = FakeResolver { resolved: vec![] };
        let err = vm
            .load(b"not json", CODELET_ENTRY_FN, &mut resolver)
            .unwrap_err();
        assert!(matches!(err, VmError::Verify(_)));
    }
}
