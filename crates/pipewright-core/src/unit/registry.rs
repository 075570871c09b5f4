//! Name-indexed registry of work units.
//!
//! Built explicitly at startup and handed to the executor; there is no
//! global registry.

use std::collections::HashMap;
use std::time::Duration;

use super::box_unit::BoxWorkUnit;
use super::work_unit::WorkUnit;

struct Entry {
    unit: BoxWorkUnit,
    timeout: Option<Duration>,
}

/// Registry of available work units, indexed by name.
#[derive(Default)]
pub struct UnitRegistry {
    units: HashMap<String, Entry>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit under its own name, replacing any previous one.
    pub fn register<T: WorkUnit + 'static>(&mut self, unit: T) {
        let name = unit.name().to_string();
        self.units.insert(
            name,
            Entry {
                unit: BoxWorkUnit::new(unit),
                timeout: None,
            },
        );
    }

    /// Register a unit with its own per-attempt timeout, overriding the
    /// tenant default.
    pub fn register_with_timeout<T: WorkUnit + 'static>(&mut self, unit: T, timeout: Duration) {
        let name = unit.name().to_string();
        self.units.insert(
            name,
            Entry {
                unit: BoxWorkUnit::new(unit),
                timeout: Some(timeout),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&BoxWorkUnit> {
        self.units.get(name).map(|e| &e.unit)
    }

    pub fn timeout_for(&self, name: &str) -> Option<Duration> {
        self.units.get(name).and_then(|e| e.timeout)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.units.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl std::fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitRegistry").field("units", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::builtin::EchoUnit;

    #[test]
    fn lookup_by_name() {
        let mut registry = UnitRegistry::new();
        registry.register(EchoUnit::new("echo"));
        registry.register_with_timeout(EchoUnit::new("slow"), Duration::from_secs(5));

        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.timeout_for("slow"), Some(Duration::from_secs(5)));
        assert_eq!(registry.timeout_for("echo"), None);
        assert_eq!(registry.names(), vec!["echo", "slow"]);
    }

    #[test]
    fn re_registering_replaces() {
        let mut registry = UnitRegistry::new();
        registry.register(EchoUnit::new("echo"));
        registry.register(EchoUnit::new("echo"));
        assert_eq!(registry.len(), 1);
    }
}
