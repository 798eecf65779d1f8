//! Registry of allocatable units.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::core::types::Health;
use crate::core::types::Injection;
use crate::core::types::ResourceSpec;
use crate::core::types::Unit;
use crate::core::types::UnitList;

/// Injections every new unit is created with, before `{unit}` substitution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitTemplate {
    pub injections: Vec<Injection>,
}

impl UnitTemplate {
    pub fn new(injections: Vec<Injection>) -> Self {
        Self { injections }
    }

    fn instantiate(&self, id: String) -> Unit {
        let injections = self.injections.iter().map(|i| i.render(&id)).collect();
        Unit {
            id,
            health: Health::Healthy,
            injections,
        }
    }
}

/// Mapping from unit identifier to unit, kept in index order.
///
/// Identifiers are `"{prefix}-{index}"`, so shrinking only drops the highest
/// indexes and growing only appends. Surviving units are carried over as they are.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    prefix: String,
    template: UnitTemplate,
    units: Vec<Unit>,
    index: HashMap<String, usize>,
}

impl DeviceRegistry {
    pub fn new(prefix: impl Into<String>, template: UnitTemplate) -> Self {
        Self {
            prefix: prefix.into(),
            template,
            units: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Identifier of the unit at `index`.
    pub fn unit_id(&self, index: usize) -> String {
        format!("{}-{}", self.prefix, index)
    }

    /// Resizes the registry to `new_count` units. Returns whether the identifier set changed.
    ///
    /// The new mapping is assembled first and swapped in with a single assignment.
    pub fn rebuild(&mut self, new_count: usize) -> bool {
        let old_count = self.units.len();
        if new_count == old_count {
            return false;
        }

        let mut units = Vec::with_capacity(new_count);
        units.extend(self.units.iter().take(new_count).cloned());
        for i in old_count..new_count {
            units.push(self.template.instantiate(self.unit_id(i)));
        }
        let index = units
            .iter()
            .enumerate()
            .map(|(i, unit)| (unit.id.clone(), i))
            .collect();

        self.units = units;
        self.index = index;
        true
    }

    pub fn get(&self, id: &str) -> Option<&Unit> {
        self.index.get(id).map(|&i| &self.units[i])
    }

    /// Replaces the entry with the same identifier. Returns false when the unit is unknown.
    pub fn replace_unit(&mut self, unit: Unit) -> bool {
        match self.index.get(&unit.id) {
            Some(&i) => {
                self.units[i] = unit;
                true
            }
            None => false,
        }
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(|unit| unit.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn clear(&mut self) {
        self.units = Vec::new();
        self.index = HashMap::new();
    }
}

/// Largest registry a [`PoolState`] builds unless told otherwise.
pub const DEFAULT_MAX_UNITS: u64 = 65536;

/// Resource spec and registry, always read and written together.
#[derive(Debug)]
pub struct PoolState {
    spec: ResourceSpec,
    registry: DeviceRegistry,
    max_units: u64,
    /// a unit was replaced since the last publish
    dirty: bool,
}

/// The one lock shared by the publish loop and the allocation handler.
pub type SharedPoolState = Arc<Mutex<PoolState>>;

impl PoolState {
    pub fn new(resource_name: impl Into<String>, registry: DeviceRegistry) -> Self {
        Self {
            spec: ResourceSpec::new(resource_name),
            registry,
            max_units: DEFAULT_MAX_UNITS,
            dirty: false,
        }
    }

    /// Caps the unit count any sampled capacity can produce.
    pub fn with_max_units(mut self, max_units: u64) -> Self {
        self.max_units = max_units;
        self
    }

    pub fn shared(self) -> SharedPoolState {
        Arc::new(Mutex::new(self))
    }

    /// Rebuilds the registry for `units` and records the count. Returns whether the set changed.
    ///
    /// Counts above the unit limit are clamped to it.
    pub fn apply_capacity(&mut self, units: u64) -> bool {
        let units = if units > self.max_units {
            warn!(
                units,
                max_units = self.max_units,
                "sampled unit count exceeds the limit, clamping"
            );
            self.max_units
        } else {
            units
        };
        let count = usize::try_from(units).unwrap_or(usize::MAX);
        let changed = self.registry.rebuild(count);
        self.spec.count = self.registry.len() as u64;
        changed
    }

    pub fn spec(&self) -> &ResourceSpec {
        &self.spec
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Swaps in `unit` and marks the list for publishing. Returns false when the unit is unknown.
    pub fn replace_unit(&mut self, unit: Unit) -> bool {
        let replaced = self.registry.replace_unit(unit);
        self.dirty |= replaced;
        replaced
    }

    /// Whether a unit was replaced since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn unit_list(&self) -> UnitList {
        self.registry.units().to_vec()
    }

    /// Drops every unit; used once the plugin stops.
    pub fn clear(&mut self) {
        self.registry.clear();
        self.spec.count = 0;
        self.dirty = false;
    }
}
