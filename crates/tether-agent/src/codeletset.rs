//! Codeletset model and linked-map bookkeeping
//!
//! A codeletset is the atomic unit of install/uninstall: an ordered
//! set of codelets plus the alias table describing which maps are
//! shared across them. Every declared link contributes two aliases,
//! `<codelet>_<map>` for each side, pointing at one shared descriptor.
//! The descriptor counts how many aliases exist (`total_refs`) and how
//! many codelets actually resolved a map through it (`ref_count`); a
//! load is only valid when the two agree on every descriptor.

use crate::codelet::Codelet;
use crate::map::Map;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tether_lcm::api::CodeletsetLoadReq;

/// Shared state of one linked map.
pub struct LinkedMapDescriptor {
    /// The backing map, created by the first side to relocate it.
    pub map: Option<Arc<Map>>,
    /// Codelets that resolved a map symbol through this descriptor.
    pub ref_count: u32,
    /// Alias entries pointing at this descriptor.
    pub total_refs: u32,
}

pub(crate) type SharedLinkedMap = Arc<Mutex<LinkedMapDescriptor>>;

/// Alias table of a codeletset's linked maps.
#[derive(Default)]
pub struct LinkedMapTable {
    entries: HashMap<String, SharedLinkedMap>,
}

/// Alias key of a codelet-side map reference.
pub(crate) fn link_alias(codelet_name: &str, map_name: &str) -> String {
    format!("{codelet_name}_{map_name}")
}

impl LinkedMapTable {
    /// Seed the table from a load request, before any relocation runs.
    ///
    /// For each declared link both side aliases are inserted, pointing
    /// at the same descriptor; an alias that already exists is
    /// tolerated (duplicate link declarations on both sides), the
    /// descriptor simply picks up no extra reference for it.
    pub fn seed(req: &CodeletsetLoadReq) -> Self {
        let mut entries: HashMap<String, SharedLinkedMap> = HashMap::new();
        for desc in &req.codelets {
            for link in &desc.linked_maps {
                let alias_a = link_alias(&desc.codelet_name, &link.map_name);
                let alias_b = link_alias(&link.linked_codelet_name, &link.linked_map_name);

                let existing_a = entries.get(&alias_a).cloned();
                let existing_b = entries.get(&alias_b).cloned();
                let missing =
                    existing_a.is_none() as u32 + existing_b.is_none() as u32;

                let descriptor = existing_a.or(existing_b).unwrap_or_else(|| {
                    Arc::new(Mutex::new(LinkedMapDescriptor {
                        map: None,
                        ref_count: 0,
                        total_refs: 0,
                    }))
                });
                descriptor.lock().total_refs += missing;

                entries.entry(alias_a).or_insert_with(|| descriptor.clone());
                entries.entry(alias_b).or_insert_with(|| descriptor.clone());
            }
        }
        Self { entries }
    }

    /// Descriptor behind `alias`, if the alias was declared.
    pub(crate) fn get(&self, alias: &str) -> Option<SharedLinkedMap> {
        self.entries.get(alias).cloned()
    }

    /// Remove one alias entry, returning its descriptor.
    pub(crate) fn remove(&mut self, alias: &str) -> Option<SharedLinkedMap> {
        self.entries.remove(alias)
    }

    /// Drain every remaining alias (rollback path).
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = (String, SharedLinkedMap)> + '_ {
        self.entries.drain()
    }

    /// Whether every descriptor saw all its declared sides resolve.
    pub fn fully_linked(&self) -> bool {
        self.entries.values().all(|descriptor| {
            let descriptor = descriptor.lock();
            descriptor.ref_count == descriptor.total_refs
        })
    }

    /// Number of alias entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no aliases.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A named, installed (or in-flight) collection of codelets.
pub struct Codeletset {
    /// Codeletset name, unique across the process.
    pub id: String,
    /// The member codelets, in descriptor order.
    pub codelets: Vec<Codelet>,
    /// Linked-map alias table.
    pub links: LinkedMapTable,
}

impl Codeletset {
    /// Create an empty set with a seeded alias table.
    pub fn new(id: String, links: LinkedMapTable) -> Self {
        Self {
            id,
            codelets: Vec::new(),
            links,
        }
    }

    /// Find a member codelet by name.
    pub fn codelet(&self, name: &str) -> Option<&Codelet> {
        self.codelets.iter().find(|c| c.name() == name)
    }
}
