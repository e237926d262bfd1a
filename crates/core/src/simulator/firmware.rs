// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::gate::lock;
use super::{in_tick, Shared};
use crate::bus::{MemoryBus, SystemBus};
use crate::interrupt::InterruptController;
use crate::{AccessSize, Direction, SimError, SimResult};
use std::sync::Arc;

/// The firmware's handle on the simulated MCU.
///
/// Passed to the firmware entry point; every memory access and interrupt
/// call goes through it instead of through process-wide state. Cloning is
/// cheap and clones refer to the same simulator.
#[derive(Clone)]
pub struct Firmware {
    pub(super) shared: Arc<Shared>,
}

impl std::fmt::Debug for Firmware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firmware")
            .field("running", &self.is_running())
            .field("tick", &self.ticks())
            .finish()
    }
}

impl Firmware {
    /// Install `handler` for `line`, replacing any earlier handler.
    ///
    /// Fails with [`SimError::InIsr`] when called from a handler, since the
    /// handler table is locked for the duration of the tick.
    pub fn register_isr<F>(&self, line: u32, handler: F) -> SimResult<()>
    where
        F: FnMut(&mut IsrContext<'_>) + Send + 'static,
    {
        if in_tick() {
            tracing::error!("register_isr called from an ISR");
            return Err(SimError::InIsr("register_isr"));
        }
        self.shared.register_isr(line, Box::new(handler))
    }

    /// Pend `line`; returns whether it is enabled.
    pub fn request_irq(&self, line: u32) -> bool {
        self.shared.request_irq(line)
    }

    pub fn enable_irq(&self, line: u32) {
        self.shared.nvic.set_enabled(line, true);
    }

    pub fn disable_irq(&self, line: u32) {
        self.shared.nvic.set_enabled(line, false);
    }

    /// `false` once the simulator has begun shutting down.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Sleep until the stepping loop dispatches an interrupt.
    ///
    /// Returns `false` when woken by shutdown instead; the entry point should
    /// return then.
    pub fn wait_for_interrupt(&self) -> bool {
        if in_tick() {
            tracing::error!("wait_for_interrupt called from an ISR");
            return false;
        }
        let seen = self.shared.epoch.dispatched();
        self.shared.epoch.wait_dispatch_after(seen)
    }

    /// Sleep for `ticks` simulated ticks. Returns `false` on shutdown.
    pub fn delay_ticks(&self, ticks: u64) -> bool {
        if in_tick() {
            tracing::error!("delay_ticks called from an ISR");
            return false;
        }
        let target = self.shared.epoch.tick() + ticks;
        self.shared.epoch.wait_tick(target)
    }

    /// Ticks completed so far.
    pub fn ticks(&self) -> u64 {
        self.shared.epoch.tick()
    }
}

impl MemoryBus for Firmware {
    fn operation(
        &mut self,
        addr: u64,
        size: AccessSize,
        direction: Direction,
        payload: u64,
    ) -> u64 {
        if in_tick() {
            // The stepping loop holds the core and has firmware suspended.
            tracing::error!(
                "Firmware handle used inside a tick ({:?} at {:#x}); ISRs must use their IsrContext",
                direction,
                addr
            );
            return 0;
        }
        self.shared.gate.wait_resumed();
        lock(&self.shared.core)
            .bus
            .operation(addr, size, direction, payload)
    }
}

/// What an interrupt handler sees while it runs on the stepping loop.
///
/// Memory accesses go straight to the devices: firmware is suspended and the
/// tick's updates are complete.
pub struct IsrContext<'a> {
    pub(super) bus: &'a mut SystemBus,
    pub(super) line: u32,
    pub(super) tick: u64,
}

impl IsrContext<'_> {
    /// Line being serviced.
    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Pend another line. It is delivered on the next tick at the earliest.
    pub fn request_irq(&self, line: u32) -> bool {
        self.bus.nvic.request_irq(line)
    }
}

impl MemoryBus for IsrContext<'_> {
    fn operation(
        &mut self,
        addr: u64,
        size: AccessSize,
        direction: Direction,
        payload: u64,
    ) -> u64 {
        self.bus.operation(addr, size, direction, payload)
    }
}
