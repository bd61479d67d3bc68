//! Codeletset lifecycle controller
//!
//! Owns the load and unload pipelines. Both entry points serialize on
//! one process-wide mutex; the hook dispatch fast path never takes it.
//! A load validates the request, seeds the linked-map alias table,
//! creates and relocates every codelet (the VM calls back into
//! [`Relocator`] once per map symbol), verifies the link counts, and
//! only then attaches codelets to their hooks and publishes the set.
//! Any failure rolls back every side effect of the current call.

use crate::codelet::Codelet;
use crate::codeletset::{link_alias, Codeletset, LinkedMapTable};
use crate::config::{
    CODELET_ENTRY_FN, MAX_CODELET_MAPS, MAX_LOADED_CODELETS, MAX_LOADED_CODELETSETS, MAX_NUM_MAPS,
};
use crate::epoch;
use crate::helper;
use crate::io::Transport;
use crate::map::{IoBinding, Map, MapDef, MapError};
use crate::runtime;
use crate::vm::{MapResolver, VmError, VmFactory};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tether_lcm::api::{
    validate_string_param, CodeletDesc, CodeletsetLoadReq, CodeletsetUnloadReq, IoChannelDesc,
    LoadError, UnloadError, CODELETSET_NAME_LEN, CODELET_NAME_LEN, HOOK_NAME_LEN,
    IO_CHANNEL_NAME_LEN, MAP_NAME_LEN, MAX_CODELETS_IN_CODELETSET, MAX_IO_CHANNEL,
    MAX_LINKED_MAPS, PATH_LEN,
};

/// Lifecycle controller: the agent's control plane.
pub struct LifecycleController {
    lcm_mutex: Mutex<()>,
    registry: DashMap<String, Codeletset>,
    total_codelets: AtomicUsize,
    map_count: AtomicUsize,
    vm_factory: Box<dyn VmFactory>,
    transport: Arc<dyn Transport>,
}

impl LifecycleController {
    /// Create a controller over the given VM backend and IO transport.
    pub fn new(vm_factory: Box<dyn VmFactory>, transport: Arc<dyn Transport>) -> Self {
        Self {
            lcm_mutex: Mutex::new(()),
            registry: DashMap::new(),
            total_codelets: AtomicUsize::new(0),
            map_count: AtomicUsize::new(0),
            vm_factory,
            transport,
        }
    }

    /// Number of codeletsets currently installed.
    pub fn installed_codeletsets(&self) -> usize {
        self.registry.len()
    }

    /// Number of codelets currently installed across all sets.
    pub fn total_codelets(&self) -> usize {
        self.total_codelets.load(Ordering::Relaxed)
    }

    /// Number of live maps (linked maps count once).
    pub fn num_maps(&self) -> usize {
        self.map_count.load(Ordering::Relaxed)
    }

    /// Run `f` against an installed codeletset.
    pub fn with_codeletset<T>(&self, id: &str, f: impl FnOnce(&Codeletset) -> T) -> Option<T> {
        self.registry.get(id).map(|set| f(&set))
    }

    /// Atomically install the codeletset described by `req`.
    pub fn load(&self, req: &CodeletsetLoadReq) -> Result<(), LoadError> {
        let _guard = self.lcm_mutex.lock();

        validate_load_req(req)?;

        for desc in &req.codelets {
            if !runtime::global().hook_exists(&desc.hook_name) {
                return Err(LoadError::HookNotExist(desc.hook_name.clone()));
            }
        }

        if self.registry.len() >= MAX_LOADED_CODELETSETS {
            return Err(LoadError::CreationFail(
                "max number of codeletsets exceeded".to_string(),
            ));
        }
        if self.registry.contains_key(&req.codeletset_id) {
            return Err(LoadError::AlreadyLoaded(req.codeletset_id.clone()));
        }
        if self.total_codelets.load(Ordering::Relaxed) + req.codelets.len() > MAX_LOADED_CODELETS {
            return Err(LoadError::CreationFail(format!(
                "max number of codelets exceeded, loading {} more would pass {}",
                req.codelets.len(),
                MAX_LOADED_CODELETS
            )));
        }

        let mut set = Codeletset::new(req.codeletset_id.clone(), LinkedMapTable::seed(req));

        for desc in &req.codelets {
            match self.create_codelet(&mut set.links, desc) {
                Ok(codelet) => {
                    debug!("created codelet {} for hook {}", codelet.name(), codelet.hook_name());
                    self.total_codelets.fetch_add(1, Ordering::Relaxed);
                    set.codelets.push(codelet);
                }
                Err(err) => {
                    let msg = format!(
                        "failed to create codelet {} of codeletset {}: {err}",
                        desc.codelet_name, req.codeletset_id
                    );
                    error!("{msg}");
                    self.destroy_set(set);
                    return Err(LoadError::CreationFail(msg));
                }
            }
        }

        if !set.links.fully_linked() {
            self.destroy_set(set);
            return Err(LoadError::LoadFail(
                "linked map validation failed: a declared link was not resolved on both sides"
                    .to_string(),
            ));
        }

        for i in 0..set.codelets.len() {
            let (hook_name, func, threshold, priority) = {
                let codelet = &set.codelets[i];
                (
                    codelet.hook_name().to_string(),
                    codelet.func().clone(),
                    codelet.runtime_threshold(),
                    codelet.priority(),
                )
            };
            let Some(hook) = runtime::global().find_hook(&hook_name) else {
                self.destroy_set(set);
                return Err(LoadError::LoadFail(format!("hook {hook_name} disappeared")));
            };
            match hook.register_codelet(func, threshold, priority) {
                Ok(()) => set.codelets[i].set_installed(true),
                Err(err) => {
                    let msg = format!(
                        "failed to attach codelet {}: {err}",
                        set.codelets[i].name()
                    );
                    error!("{msg}");
                    self.destroy_set(set);
                    return Err(LoadError::LoadFail(msg));
                }
            }
        }

        info!(
            "codeletset {} loaded with {} codelets",
            set.id,
            set.codelets.len()
        );
        self.registry.insert(set.id.clone(), set);
        Ok(())
    }

    /// Remove an installed codeletset and every resource it owns.
    pub fn unload(&self, req: &CodeletsetUnloadReq) -> Result<(), UnloadError> {
        let _guard = self.lcm_mutex.lock();

        validate_string_param("codeletset_id", &req.codeletset_id, CODELETSET_NAME_LEN)
            .map_err(UnloadError::ParamInvalid)?;

        let Some((_, set)) = self.registry.remove(&req.codeletset_id) else {
            return Err(UnloadError::Fail(format!(
                "codeletset {} does not exist",
                req.codeletset_id
            )));
        };
        info!("unloading codeletset {}", set.id);
        self.destroy_set(set);
        Ok(())
    }

    /// Unload every installed codeletset (agent shutdown).
    pub fn unload_all(&self) {
        let ids: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.unload(&CodeletsetUnloadReq { codeletset_id: id });
        }
    }

    /// Detach installed codelets, release maps and drop the set. Used
    /// by both the unload path and load rollback.
    fn destroy_set(&self, mut set: Codeletset) {
        for codelet in &set.codelets {
            if !codelet.installed() {
                continue;
            }
            match runtime::global().find_hook(codelet.hook_name()) {
                Some(hook) => {
                    if let Err(err) = hook.remove_codelet(codelet.func()) {
                        warn!("failed to detach codelet {}: {err}", codelet.name());
                    }
                }
                None => warn!(
                    "hook {} vanished before codelet {} was detached",
                    codelet.hook_name(),
                    codelet.name()
                ),
            }
        }

        let mut codelets = std::mem::take(&mut set.codelets);
        for codelet in codelets.iter_mut() {
            let maps = codelet.take_maps();
            self.release_codelet_maps(&mut set.links, codelet.name(), maps);
            self.total_codelets.fetch_sub(1, Ordering::Relaxed);
        }
        drop(codelets);

        // Aliases of codelets that never resolved their symbol (load
        // rollback): drop the seeded references.
        for (_, descriptor) in set.links.drain() {
            let mut descriptor = descriptor.lock();
            descriptor.total_refs = descriptor.total_refs.saturating_sub(1);
        }
    }

    /// Release a codelet's maps, honoring linked-map reference counts.
    fn release_codelet_maps(
        &self,
        links: &mut LinkedMapTable,
        codelet_name: &str,
        maps: HashMap<String, Arc<Map>>,
    ) {
        for (map_name, map) in maps {
            let alias = link_alias(codelet_name, &map_name);
            match links.remove(&alias) {
                Some(descriptor) => {
                    let released = {
                        let mut descriptor = descriptor.lock();
                        descriptor.ref_count = descriptor.ref_count.saturating_sub(1);
                        descriptor.total_refs = descriptor.total_refs.saturating_sub(1);
                        if descriptor.ref_count == 0 {
                            descriptor.map.take()
                        } else {
                            None
                        }
                    };
                    match released {
                        Some(shared) => {
                            debug!("last reference to linked map {map_name}, releasing");
                            drop(map);
                            self.release_map(shared);
                        }
                        // Siblings still reference the storage; drop
                        // only this codelet's wrapper.
                        None => drop(map),
                    }
                }
                None => self.release_map(map),
            }
        }
    }

    fn release_map(&self, map: Arc<Map>) {
        debug!("destroying map {} of type {:?}", map.name(), map.map_type());
        self.map_count.fetch_sub(1, Ordering::Relaxed);
        if map.needs_epoch_barrier() {
            // Readers may still hold interior pointers into the map.
            epoch::domain().barrier();
        }
        drop(map);
    }

    fn create_map(
        &self,
        name: &str,
        def: &MapDef,
        io: Option<IoBinding>,
    ) -> Result<Arc<Map>, MapError> {
        if self.map_count.load(Ordering::Relaxed) >= MAX_NUM_MAPS {
            return Err(MapError::TooManyMaps);
        }
        let map = Arc::new(Map::new(name, def, io)?);
        self.map_count.fetch_add(1, Ordering::Relaxed);
        Ok(map)
    }

    fn create_codelet(
        &self,
        links: &mut LinkedMapTable,
        desc: &CodeletDesc,
    ) -> Result<Codelet, String> {
        let object = std::fs::read(&desc.codelet_path)
            .map_err(|err| format!("could not read codelet object {}: {err}", desc.codelet_path))?;
        let in_serde = read_serde_objects(&desc.in_io_channels)?;
        let out_serde = read_serde_objects(&desc.out_io_channels)?;

        let mut vm = self.vm_factory.create_vm();
        let mut maps: HashMap<String, Arc<Map>> = HashMap::new();

        let compiled = {
            let mut relocator = Relocator {
                controller: self,
                desc,
                in_serde: &in_serde,
                out_serde: &out_serde,
                links: &*links,
                maps: &mut maps,
            };
            vm.load(&object, CODELET_ENTRY_FN, &mut relocator)
        }
        .and_then(|()| vm.compile(&helper::snapshot()));

        match compiled {
            Ok(func) => Ok(Codelet::new(
                desc.codelet_name.clone(),
                desc.hook_name.clone(),
                desc.priority,
                desc.runtime_threshold,
                func,
                maps,
                vm,
            )),
            Err(err) => {
                self.release_codelet_maps(links, &desc.codelet_name, maps);
                Err(err.to_string())
            }
        }
    }
}

/// Read the serde object file of each channel that declares one.
fn read_serde_objects(channels: &[IoChannelDesc]) -> Result<Vec<Option<Vec<u8>>>, String> {
    channels
        .iter()
        .map(|channel| match &channel.serde_path {
            Some(path) => std::fs::read(path)
                .map(Some)
                .map_err(|err| format!("could not read serde object {path}: {err}")),
            None => Ok(None),
        })
        .collect()
}

/// Relocation context of one codelet being loaded.
struct Relocator<'a> {
    controller: &'a LifecycleController,
    desc: &'a CodeletDesc,
    in_serde: &'a [Option<Vec<u8>>],
    out_serde: &'a [Option<Vec<u8>>],
    links: &'a LinkedMapTable,
    maps: &'a mut HashMap<String, Arc<Map>>,
}

impl Relocator<'_> {
    fn channel_binding(&self, symbol: &str, def: &MapDef) -> Result<IoBinding, VmError> {
        let (channels, blobs) = if def.map_type == crate::map::MapType::ControlInput {
            (&self.desc.in_io_channels, self.in_serde)
        } else {
            (&self.desc.out_io_channels, self.out_serde)
        };
        let idx = channels
            .iter()
            .position(|channel| channel.name == symbol)
            .ok_or_else(|| {
                VmError::Relocation(format!("IO map {symbol} has no matching channel descriptor"))
            })?;
        Ok(IoBinding {
            transport: self.controller.transport.clone(),
            stream_id: channels[idx].stream_id,
            serde_obj: blobs.get(idx).cloned().flatten(),
        })
    }
}

impl MapResolver for Relocator<'_> {
    fn resolve_map(&mut self, symbol: &str, def: &MapDef) -> Result<u64, VmError> {
        // Idempotent on repeated relocation of the same symbol.
        if let Some(existing) = self.maps.get(symbol) {
            debug!("map {symbol} is already registered");
            return Ok(Arc::as_ptr(existing) as u64);
        }
        if symbol.is_empty() || symbol.len() >= MAP_NAME_LEN {
            return Err(VmError::Relocation(format!(
                "map symbol {symbol:?} has an invalid length"
            )));
        }
        if self.maps.len() == MAX_CODELET_MAPS {
            return Err(VmError::Relocation(format!(
                "codelet {} declares more than {MAX_CODELET_MAPS} maps",
                self.desc.codelet_name
            )));
        }

        let alias = link_alias(&self.desc.codelet_name, symbol);
        let map = match self.links.get(&alias) {
            None => {
                let io = if def.map_type.is_io() {
                    Some(self.channel_binding(symbol, def)?)
                } else {
                    None
                };
                self.controller
                    .create_map(symbol, def, io)
                    .map_err(|err| VmError::Relocation(err.to_string()))?
            }
            Some(descriptor) => {
                if def.map_type.is_io() {
                    return Err(VmError::Relocation(format!(
                        "map {symbol}: IO maps cannot be linked"
                    )));
                }
                let mut descriptor = descriptor.lock();
                let map = if descriptor.ref_count == 0 {
                    debug!("first reference to linked map {symbol}, creating it");
                    let created = self
                        .controller
                        .create_map(symbol, def, None)
                        .map_err(|err| VmError::Relocation(err.to_string()))?;
                    descriptor.map = Some(created.clone());
                    created
                } else {
                    let existing = descriptor.map.as_ref().ok_or_else(|| {
                        VmError::Relocation(format!("linked map {symbol} lost its backing map"))
                    })?;
                    if !existing.shape_matches(def) {
                        return Err(VmError::Relocation(format!(
                            "map {symbol} definition does not match the registered linked map"
                        )));
                    }
                    debug!("linked map {symbol} already exists, referencing it");
                    Arc::new(existing.share_as(symbol))
                };
                descriptor.ref_count += 1;
                map
            }
        };

        let handle = Arc::as_ptr(&map) as u64;
        self.maps.insert(symbol.to_string(), map);
        Ok(handle)
    }
}

/// Structural validation of a load request (§step 1 of the pipeline).
fn validate_load_req(req: &CodeletsetLoadReq) -> Result<(), LoadError> {
    let invalid = |msg: String| {
        error!("{msg}");
        Err(LoadError::ParamInvalid(msg))
    };

    if let Err(msg) =
        validate_string_param("codeletset_id", &req.codeletset_id, CODELETSET_NAME_LEN)
    {
        return invalid(msg);
    }
    if req.codelets.is_empty() {
        return invalid("number of codelets in codeletset is zero".to_string());
    }
    if req.codelets.len() > MAX_CODELETS_IN_CODELETSET {
        return invalid("number of codelets in codeletset exceeds maximum allowed".to_string());
    }

    for desc in &req.codelets {
        for (field, value, maxlen) in [
            ("codelet_name", &desc.codelet_name, CODELET_NAME_LEN),
            ("hook_name", &desc.hook_name, HOOK_NAME_LEN),
            ("codelet_path", &desc.codelet_path, PATH_LEN),
        ] {
            if let Err(msg) = validate_string_param(field, value, maxlen) {
                return invalid(msg);
            }
        }

        if desc.in_io_channels.len() > MAX_IO_CHANNEL
            || desc.out_io_channels.len() > MAX_IO_CHANNEL
        {
            return invalid(format!(
                "codelet {} declares more than {MAX_IO_CHANNEL} IO channels",
                desc.codelet_name
            ));
        }
        for channel in desc.in_io_channels.iter().chain(&desc.out_io_channels) {
            if let Err(msg) =
                validate_string_param("io_channel.name", &channel.name, IO_CHANNEL_NAME_LEN)
            {
                return invalid(msg);
            }
            if let Some(path) = &channel.serde_path {
                if let Err(msg) = validate_string_param("io_channel.serde", path, PATH_LEN) {
                    return invalid(msg);
                }
                if !Path::new(path).exists() {
                    return invalid(format!("io_channel serde object does not exist: {path}"));
                }
            }
        }

        if desc.linked_maps.len() > MAX_LINKED_MAPS {
            return invalid(format!(
                "codelet {} declares more than {MAX_LINKED_MAPS} linked maps",
                desc.codelet_name
            ));
        }
        for link in &desc.linked_maps {
            for (field, value, maxlen) in [
                ("linked_maps.map_name", &link.map_name, MAP_NAME_LEN),
                (
                    "linked_maps.linked_codelet_name",
                    &link.linked_codelet_name,
                    CODELET_NAME_LEN,
                ),
                (
                    "linked_maps.linked_map_name",
                    &link.linked_map_name,
                    MAP_NAME_LEN,
                ),
            ] {
                if let Err(msg) = validate_string_param(field, value, maxlen) {
                    return invalid(msg);
                }
            }
            if link.linked_codelet_name == desc.codelet_name {
                return invalid(format!(
                    "codelet {} declares a linked map within itself ({} -> {})",
                    desc.codelet_name, link.map_name, link.linked_map_name
                ));
            }
        }
        for (i, link) in desc.linked_maps.iter().enumerate() {
            for other in &desc.linked_maps[i + 1..] {
                if link.map_name == other.map_name {
                    return invalid(format!("map_name {} is not unique", link.map_name));
                }
                if link.linked_codelet_name == other.linked_codelet_name
                    && link.linked_map_name == other.linked_map_name
                {
                    return invalid(format!(
                        "linked_codelet_name {} and linked_map_name {} tuple is not unique",
                        link.linked_codelet_name, link.linked_map_name
                    ));
                }
            }
        }
    }

    for (i, desc) in req.codelets.iter().enumerate() {
        for other in &req.codelets[i + 1..] {
            if desc.codelet_name == other.codelet_name {
                return invalid(format!(
                    "codelet_name {} is not unique",
                    desc.codelet_name
                ));
            }
        }
    }

    Ok(())
}
