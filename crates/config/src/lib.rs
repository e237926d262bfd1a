// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Default schema version for YAML configs
fn default_schema_version() -> String {
    "1.0".to_string()
}

/// Mapped size used when a device entry gives none.
pub const DEFAULT_DEVICE_SIZE: u64 = 0x1000;

/// Upper bound on `simulation.irq_lines`.
pub const MAX_IRQ_LINES: u32 = 4096;

fn default_tick_us() -> u64 {
    1000
}

fn default_join_timeout_ms() -> u64 {
    500
}

fn default_irq_lines() -> u32 {
    256
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SimulationSettings {
    /// Simulated time per tick.
    #[serde(default = "default_tick_us")]
    pub tick_us: u64,
    /// Wall-clock wait between ticks; defaults to `tick_us`.
    #[serde(default)]
    pub pacing_us: Option<u64>,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    #[serde(default = "default_irq_lines")]
    pub irq_lines: u32,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            tick_us: default_tick_us(),
            pacing_us: None,
            join_timeout_ms: default_join_timeout_ms(),
            irq_lines: default_irq_lines(),
        }
    }
}

impl SimulationSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_micros(self.tick_us)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_micros(self.pacing_us.unwrap_or(self.tick_us))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceConfig {
    pub id: String,
    pub r#type: String, // "uart", "timer", "can", etc.
    pub base_address: u64,
    #[serde(default)]
    pub size: Option<String>, // e.g. "1KiB"
    #[serde(default)]
    pub irq: Option<u32>,
    #[serde(default)]
    pub config: HashMap<String, serde_yaml::Value>,
}

impl DeviceConfig {
    /// Mapped size in bytes.
    pub fn size_bytes(&self) -> Result<u64> {
        match &self.size {
            Some(size) => parse_size(size)
                .with_context(|| format!("Invalid size for device '{}'", self.id)),
            None => Ok(DEFAULT_DEVICE_SIZE),
        }
    }

    /// Unsigned integer extra from the `config` map.
    pub fn extra_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.config.get(key) {
            None => Ok(None),
            Some(v) => v.as_u64().map(Some).ok_or_else(|| {
                anyhow::anyhow!(
                    "Field '{}' in 'config' for device '{}' must be an unsigned integer",
                    key,
                    self.id
                )
            }),
        }
    }
}

/// A simulated board: stepping parameters plus the device map.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BoardDescriptor {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub name: String,
    #[serde(default)]
    pub simulation: SimulationSettings,
    pub devices: Vec<DeviceConfig>,
}

impl BoardDescriptor {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to open board descriptor at {:?}", path))?;

        let board: Self = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse board descriptor JSON from {:?}", path))?
        } else {
            serde_yaml::from_str(&content).context("Failed to parse Board Descriptor YAML")?
        };
        board.validate()?;
        tracing::debug!("Loaded board '{}' with {} devices", board.name, board.devices.len());
        Ok(board)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let board: Self =
            serde_yaml::from_str(yaml).context("Failed to parse Board Descriptor YAML")?;
        board.validate()?;
        Ok(board)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != "1.0" {
            anyhow::bail!(
                "Unsupported schema_version '{}'. Supported versions: '1.0'",
                self.schema_version
            );
        }

        if self.simulation.tick_us == 0 {
            anyhow::bail!("Simulation 'tick_us' must be greater than zero");
        }

        let lines = self.simulation.irq_lines;
        if lines == 0 || lines > MAX_IRQ_LINES {
            anyhow::bail!(
                "Simulation 'irq_lines' must be between 1 and {}, got {}",
                MAX_IRQ_LINES,
                lines
            );
        }

        let mut seen = HashSet::new();
        for dev in &self.devices {
            if dev.id.trim().is_empty() {
                anyhow::bail!("Device at {:#x} has an empty id", dev.base_address);
            }
            if !seen.insert(dev.id.as_str()) {
                anyhow::bail!("Duplicate device id '{}'", dev.id);
            }
            dev.size_bytes()?;
        }

        Ok(())
    }

    pub fn device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == id)
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}
