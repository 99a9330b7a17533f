//! Machine preset catalog.
//!
//! A preset is a named resource profile (cpu units, memory units, price per
//! millisecond). Every run carries exactly one preset name; the dequeue
//! scheduler charges the preset's cost against a consumer's resource budget.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// CPU and memory units, used both for a preset's cost and for a budget.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MachineResources {
    pub cpu: f64,
    pub memory: f64,
}

impl MachineResources {
    pub const fn new(cpu: f64, memory: f64) -> Self {
        Self { cpu, memory }
    }
}

/// A named resource and pricing profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachinePreset {
    pub name: String,
    pub cpu: f64,
    pub memory: f64,
    pub cents_per_ms: f64,
}

impl MachinePreset {
    pub fn new(name: impl Into<String>, cpu: f64, memory: f64, cents_per_ms: f64) -> Self {
        Self {
            name: name.into(),
            cpu,
            memory,
            cents_per_ms,
        }
    }

    /// Resource cost charged at dequeue time.
    pub fn resources(&self) -> MachineResources {
        MachineResources::new(self.cpu, self.memory)
    }
}

/// Catalog configuration as loaded from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub default_machine: String,
    pub machines: BTreeMap<String, MachinePreset>,
    #[serde(default)]
    pub base_cost_in_cents: f64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        let machines = [
            MachinePreset::new("micro", 0.25, 0.25, 0.000_008_5),
            MachinePreset::new("small-1x", 0.5, 0.5, 0.000_017),
            MachinePreset::new("small-2x", 1.0, 1.0, 0.000_034),
            MachinePreset::new("medium-1x", 1.0, 2.0, 0.000_068),
            MachinePreset::new("medium-2x", 2.0, 4.0, 0.000_136),
            MachinePreset::new("large-1x", 4.0, 8.0, 0.000_272),
            MachinePreset::new("large-2x", 8.0, 16.0, 0.000_544),
        ]
        .into_iter()
        .map(|preset| (preset.name.clone(), preset))
        .collect();

        Self {
            default_machine: "small-1x".to_string(),
            machines,
            base_cost_in_cents: 0.0,
        }
    }
}

/// Immutable preset lookup, built once at startup.
#[derive(Debug, Clone)]
pub struct MachinePresetCatalog {
    default_machine: String,
    machines: BTreeMap<String, MachinePreset>,
    base_cost_in_cents: f64,
}

impl MachinePresetCatalog {
    /// Builds a catalog. The default preset must be one of `machines`.
    pub fn new(config: MachineConfig) -> EngineResult<Self> {
        if !config.machines.contains_key(&config.default_machine) {
            return Err(EngineError::UnknownMachinePreset(config.default_machine));
        }

        Ok(Self {
            default_machine: config.default_machine,
            machines: config.machines,
            base_cost_in_cents: config.base_cost_in_cents,
        })
    }

    pub fn get(&self, name: &str) -> Option<&MachinePreset> {
        self.machines.get(name)
    }

    pub fn default_preset(&self) -> &MachinePreset {
        // Presence checked in `new`.
        &self.machines[&self.default_machine]
    }

    /// Resolves an optional explicit preset to a catalog entry.
    pub fn resolve(&self, name: Option<&str>) -> EngineResult<&MachinePreset> {
        match name {
            None => Ok(self.default_preset()),
            Some(name) => self
                .get(name)
                .ok_or_else(|| EngineError::UnknownMachinePreset(name.to_string())),
        }
    }

    pub fn base_cost_in_cents(&self) -> f64 {
        self.base_cost_in_cents
    }

    pub fn presets(&self) -> impl Iterator<Item = &MachinePreset> {
        self.machines.values()
    }
}
