// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod bus;
pub mod interrupt;
pub mod metrics;
pub mod peripherals;
pub mod register;
pub mod simulator;
pub mod snapshot;
pub mod system;

use std::any::Any;
use std::time::Duration;

pub use bus::{MemoryBus, SystemBus};
pub use register::{ReadAction, Register, RegisterBank, WriteAction};
pub use simulator::{Firmware, IsrContext, SimConfig, Simulator, TickReport};

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("device '{name}' at {base:#x} (size {size:#x}) overlaps '{other}'")]
    AddressOverlap {
        name: String,
        base: u64,
        size: u64,
        other: String,
    },
    #[error("device '{name}' has an invalid address range {base:#x} (size {size:#x})")]
    InvalidRange { name: String, base: u64, size: u64 },
    #[error("interrupt line {line} out of range (controller has {lines} lines)")]
    InvalidIrqLine { line: u32, lines: u32 },
    #[error("simulator threads did not exit within {0:?}")]
    ShutdownTimeout(Duration),
    #[error("{0} is not available inside an interrupt handler")]
    InIsr(&'static str),
    #[error("simulator is already running")]
    AlreadyRunning,
    #[error("failed to spawn {name} thread")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

pub type SimResult<T> = Result<T, SimError>;

/// Width of a single memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    Byte,
    Half,
    Word,
    Double,
}

impl AccessSize {
    pub fn bytes(self) -> u64 {
        match self {
            AccessSize::Byte => 1,
            AccessSize::Half => 2,
            AccessSize::Word => 4,
            AccessSize::Double => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Outcome of one `Device::update` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickResult {
    /// Request the device's own interrupt line.
    pub irq: bool,
    /// Additional lines requested by this device, by absolute line index.
    pub explicit_irqs: Vec<u32>,
}

impl TickResult {
    pub fn irq(irq: bool) -> Self {
        Self {
            irq,
            ..Default::default()
        }
    }
}

/// Trait for observing simulation events in a modular way.
pub trait SimulationObserver: std::fmt::Debug + Send + Sync {
    fn on_simulation_start(&self) {}
    fn on_simulation_stop(&self) {}
    fn on_tick_start(&self, _tick: u64) {}
    fn on_device_update(&self, _name: &str, _result: &TickResult) {}
    fn on_irq_dispatch(&self, _line: u32) {}
    fn on_tick_end(&self, _tick: u64) {}
}

/// Trait representing a memory-mapped peripheral model.
///
/// A device owns its [`RegisterBank`]. Firmware accesses land in
/// [`Device::read_register`] / [`Device::write_register`], which run the
/// per-register hooks; `update` advances the model by one tick.
pub trait Device: std::fmt::Debug + Send {
    fn registers(&self) -> &RegisterBank;
    fn registers_mut(&mut self) -> &mut RegisterBank;

    /// Pre-read hook. The default returns the stored value unchanged.
    fn pre_read(&mut self, index: usize) -> u32 {
        self.registers().value(index)
    }

    /// Post-write hook. The default stores the value through the register's
    /// write action.
    fn post_write(&mut self, index: usize, value: u32) {
        self.registers_mut().store(index, value);
    }

    fn update(&mut self, _dt: Duration) -> TickResult {
        TickResult::default()
    }

    /// Read the register at `offset`. Offsets without a register read as zero.
    fn read_register(&mut self, offset: u64) -> u32 {
        let Some(index) = self.registers().index_of(offset) else {
            return 0;
        };
        let value = self.pre_read(index);
        self.registers_mut().after_read(index);
        value
    }

    /// Write the register at `offset`. Offsets without a register ignore the write.
    fn write_register(&mut self, offset: u64, value: u32) {
        if let Some(index) = self.registers().index_of(offset) {
            self.post_write(index, value);
        }
    }

    fn as_any(&self) -> Option<&dyn Any> {
        None
    }
    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        None
    }
    fn snapshot(&self) -> serde_json::Value {
        self.registers().snapshot()
    }
}
