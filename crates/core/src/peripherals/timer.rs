// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::TickClock;
use crate::{Device, Register, RegisterBank, TickResult, WriteAction};
use std::time::Duration;

const CR1: usize = 0;
const DIER: usize = 1;
const SR: usize = 2;
const EGR: usize = 3;
const CNT: usize = 4;
const PSC: usize = 5;
const ARR: usize = 6;

const CR1_CEN: u32 = 1 << 0;
const CR1_OPM: u32 = 1 << 3;
const DIER_UIE: u32 = 1 << 0;
const SR_UIF: u32 = 1 << 0;
const EGR_UG: u32 = 1 << 0;

pub const DEFAULT_TIMER_CLOCK_HZ: u64 = 1_000_000;

/// Basic STM32 General Purpose Timer (TIM2-TIM5 compatible)
#[derive(Debug)]
pub struct Timer {
    regs: RegisterBank,
    clock: TickClock,
    // Internal state
    psc_cnt: u32,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self::with_clock(DEFAULT_TIMER_CLOCK_HZ)
    }

    pub fn with_clock(hz: u64) -> Self {
        Self {
            regs: RegisterBank::new(vec![
                Register::new("CR1", 0x00).writable(0x3FF),
                Register::new("DIER", 0x0C).writable(0x5F),
                // TIMx_SR is rc_w0 for status flags.
                Register::new("SR", 0x10)
                    .writable(0x1FFFF)
                    .on_write(WriteAction::WriteZeroToClear),
                Register::new("EGR", 0x14).writable(0xFF),
                Register::new("CNT", 0x24).writable(0xFFFF),
                Register::new("PSC", 0x28).writable(0xFFFF),
                Register::new("ARR", 0x2C).reset_value(0xFFFF).writable(0xFFFF),
            ]),
            clock: TickClock::new(hz),
            psc_cnt: 0,
        }
    }

    fn level_irq(&self) -> bool {
        self.regs.value(SR) & SR_UIF != 0 && self.regs.value(DIER) & DIER_UIE != 0
    }
}

impl Device for Timer {
    fn registers(&self) -> &RegisterBank {
        &self.regs
    }

    fn registers_mut(&mut self) -> &mut RegisterBank {
        &mut self.regs
    }

    fn pre_read(&mut self, index: usize) -> u32 {
        match index {
            // EGR is write-only.
            EGR => 0,
            _ => self.regs.value(index),
        }
    }

    fn post_write(&mut self, index: usize, value: u32) {
        self.regs.store(index, value);
        if index == EGR && value & EGR_UG != 0 {
            self.regs.force(CNT, 0);
            self.psc_cnt = 0;
            self.regs.set_bits(SR, SR_UIF);
            self.regs.force(EGR, 0);
        }
    }

    fn update(&mut self, dt: Duration) -> TickResult {
        let cycles = self.clock.advance(dt);
        if self.regs.value(CR1) & CR1_CEN == 0 || cycles == 0 {
            // Keep IRQ level high while UIF is latched and UIE is enabled.
            return TickResult::irq(self.level_irq());
        }

        let prescale = self.regs.value(PSC) as u64 + 1;
        let total = self.psc_cnt as u64 + cycles;
        self.psc_cnt = (total % prescale) as u32;
        let counts = total / prescale;

        let period = self.regs.value(ARR) as u64 + 1;
        let cnt = self.regs.value(CNT) as u64 + counts;
        if cnt >= period {
            self.regs.force(CNT, (cnt % period) as u32);
            self.regs.set_bits(SR, SR_UIF);
            if self.regs.value(CR1) & CR1_OPM != 0 {
                self.regs.clear_bits(CR1, CR1_CEN);
                self.regs.force(CNT, 0);
            }
        } else {
            self.regs.force(CNT, cnt as u32);
        }

        TickResult::irq(self.level_irq())
    }

    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::device_access;
    use crate::{AccessSize, Direction};

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_egr_ug_sets_uif_and_cnt_reset() {
        let mut tim = Timer::new();
        device_access(&mut tim, 0x24, AccessSize::Byte, Direction::Write, 0x34);
        device_access(&mut tim, 0x25, AccessSize::Byte, Direction::Write, 0x12);
        assert_eq!(tim.read_register(0x24), 0x1234);

        tim.write_register(0x14, 0x01); // EGR.UG

        assert_eq!(tim.read_register(0x24), 0);
        assert_eq!(tim.read_register(0x10) & 0x1, 0x1);
    }

    #[test]
    fn test_sr_write_zero_clears_uif_and_drops_irq() {
        let mut tim = Timer::new();

        // Enable UIE and set UIF via UG.
        tim.write_register(0x0C, 0x01);
        tim.write_register(0x14, 0x01);
        assert!(tim.update(MS).irq);

        // Clear UIF by writing 0 to SR bit 0.
        tim.write_register(0x10, 0x00);
        assert_eq!(tim.read_register(0x10) & 0x1, 0);
        assert!(!tim.update(MS).irq);
    }

    #[test]
    fn test_update_event_after_period() {
        // 1 MHz clock, prescaler /1000 -> 1 kHz count, ARR 9 -> 10 ms period.
        let mut tim = Timer::new();
        tim.write_register(0x28, 999);
        tim.write_register(0x2C, 9);
        tim.write_register(0x0C, DIER_UIE);
        tim.write_register(0x00, CR1_CEN);

        for _ in 0..9 {
            assert!(!tim.update(MS).irq);
        }
        assert_eq!(tim.read_register(0x24), 9);
        assert!(tim.update(MS).irq);
        assert_eq!(tim.read_register(0x24), 0);
    }

    #[test]
    fn test_one_pulse_mode_stops_counter() {
        let mut tim = Timer::new();
        tim.write_register(0x28, 999);
        tim.write_register(0x2C, 0);
        tim.write_register(0x00, CR1_CEN | CR1_OPM);
        tim.update(MS);
        assert_eq!(tim.read_register(0x00) & CR1_CEN, 0);
        assert_eq!(tim.read_register(0x10) & SR_UIF, SR_UIF);
    }
}
