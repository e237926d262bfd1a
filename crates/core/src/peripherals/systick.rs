// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::TickClock;
use crate::{Device, ReadAction, Register, RegisterBank, TickResult};
use std::time::Duration;

const CSR: usize = 0;
const RVR: usize = 1;
const CVR: usize = 2;

const CSR_ENABLE: u32 = 1 << 0;
const CSR_TICKINT: u32 = 1 << 1;
const CSR_COUNTFLAG: u32 = 1 << 16;

pub const DEFAULT_CORE_CLOCK_HZ: u64 = 48_000_000;

/// Mocked SysTick Timer peripheral
/// Standard address: 0xE000_E010
#[derive(Debug)]
pub struct Systick {
    regs: RegisterBank,
    clock: TickClock,
}

impl Default for Systick {
    fn default() -> Self {
        Self::new()
    }
}

impl Systick {
    pub fn new() -> Self {
        Self::with_clock(DEFAULT_CORE_CLOCK_HZ)
    }

    pub fn with_clock(hz: u64) -> Self {
        Self {
            regs: RegisterBank::new(vec![
                Register::new("CSR", 0x00)
                    .writable(0x7)
                    .on_read(ReadAction::Clear(CSR_COUNTFLAG)),
                Register::new("RVR", 0x04).writable(0x00FF_FFFF),
                Register::new("CVR", 0x08).writable(0x00FF_FFFF),
                // No reference clock, no skew
                Register::new("CALIB", 0x0C).reset_value(0x4000_0000).read_only(),
            ]),
            clock: TickClock::new(hz),
        }
    }
}

impl Device for Systick {
    fn registers(&self) -> &RegisterBank {
        &self.regs
    }

    fn registers_mut(&mut self) -> &mut RegisterBank {
        &mut self.regs
    }

    fn post_write(&mut self, index: usize, value: u32) {
        match index {
            // Any write to CVR clears the counter and COUNTFLAG.
            CVR => {
                self.regs.force(CVR, 0);
                self.regs.clear_bits(CSR, CSR_COUNTFLAG);
            }
            _ => self.regs.store(index, value),
        }
    }

    fn update(&mut self, dt: Duration) -> TickResult {
        let cycles = self.clock.advance(dt);
        let csr = self.regs.value(CSR);
        if csr & CSR_ENABLE == 0 || cycles == 0 {
            return TickResult::default();
        }

        let cvr = self.regs.value(CVR) as u64;
        let rvr = self.regs.value(RVR) as u64;
        if cycles <= cvr {
            self.regs.force(CVR, (cvr - cycles) as u32);
            return TickResult::default();
        }

        // The counter reached zero at least once this tick.
        if rvr == 0 {
            self.regs.force(CVR, 0);
            return TickResult::default();
        }
        let remaining = (cycles - cvr - 1) % (rvr + 1);
        self.regs.force(CVR, (rvr - remaining) as u32);
        self.regs.set_bits(CSR, CSR_COUNTFLAG);
        TickResult::irq(csr & CSR_TICKINT != 0)
    }

    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }
}
