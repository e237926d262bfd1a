// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::TickClock;
use crate::{Device, Register, RegisterBank, TickResult, WriteAction};
use std::any::Any;
use std::time::Duration;

const SR: usize = 0;
const CR1: usize = 1;
const CR2: usize = 2;
const SQR3: usize = 3;
const DR: usize = 4;

const SR_EOC: u32 = 1 << 1;
const SR_STRT: u32 = 1 << 4;
const CR1_EOCIE: u32 = 1 << 5;
const CR2_ADON: u32 = 1 << 0;
const CR2_CONT: u32 = 1 << 1;
const CR2_SWSTART: u32 = 1 << 30;

pub const CHANNELS: usize = 18;
pub const DEFAULT_ADC_CLOCK_HZ: u64 = 1_000_000;

/// Single-channel-sequence ADC whose samples come from host-set channel
/// values (load cells, thermistors).
#[derive(Debug)]
pub struct Adc {
    regs: RegisterBank,
    clock: TickClock,
    channels: [u16; CHANNELS],

    // Internal State
    converting: bool,
    cycles_remaining: u64,
    conversion_time: u64, // ADC clock cycles per conversion
}

impl Default for Adc {
    fn default() -> Self {
        Self::new()
    }
}

impl Adc {
    pub fn new() -> Self {
        Self::with_clock(DEFAULT_ADC_CLOCK_HZ)
    }

    pub fn with_clock(hz: u64) -> Self {
        Self {
            regs: RegisterBank::new(vec![
                Register::new("SR", 0x00)
                    .writable(0x1F)
                    .on_write(WriteAction::WriteZeroToClear),
                Register::new("CR1", 0x04),
                Register::new("CR2", 0x08),
                Register::new("SQR3", 0x34).writable(0x3FFF_FFFF),
                Register::new("DR", 0x4C).read_only(),
            ]),
            clock: TickClock::new(hz),
            channels: [0; CHANNELS],
            converting: false,
            cycles_remaining: 0,
            conversion_time: 14,
        }
    }

    /// Set the 12-bit value the next conversion of `channel` returns.
    pub fn set_channel(&mut self, channel: usize, value: u16) {
        if let Some(slot) = self.channels.get_mut(channel) {
            *slot = value & 0xFFF;
        }
    }

    pub fn channel(&self, channel: usize) -> Option<u16> {
        self.channels.get(channel).copied()
    }

    pub fn is_converting(&self) -> bool {
        self.converting
    }

    fn start_conversion(&mut self) {
        self.converting = true;
        self.cycles_remaining = self.conversion_time;
        // Clear EOC bit on start
        self.regs.clear_bits(SR, SR_EOC);
        self.regs.set_bits(SR, SR_STRT);
    }

    fn selected_channel(&self) -> usize {
        (self.regs.value(SQR3) & 0x1F) as usize
    }
}

impl Device for Adc {
    fn registers(&self) -> &RegisterBank {
        &self.regs
    }

    fn registers_mut(&mut self) -> &mut RegisterBank {
        &mut self.regs
    }

    fn pre_read(&mut self, index: usize) -> u32 {
        let value = self.regs.value(index);
        if index == DR {
            // EOC is cleared by reading DR.
            self.regs.clear_bits(SR, SR_EOC);
        }
        value
    }

    fn post_write(&mut self, index: usize, value: u32) {
        let old = self.regs.value(index);
        self.regs.store(index, value);
        if index != CR2 {
            return;
        }

        let cr2 = self.regs.value(CR2);
        // If ADON is set and SWSTART transitions 0->1, start conversion
        if cr2 & CR2_ADON != 0 && cr2 & CR2_SWSTART != 0 && old & CR2_SWSTART == 0 {
            self.start_conversion();
        }
        // SWSTART is cleared by hardware once the conversion starts.
        self.regs.clear_bits(CR2, CR2_SWSTART);
    }

    fn update(&mut self, dt: Duration) -> TickResult {
        let cycles = self.clock.advance(dt);
        if !self.converting {
            return TickResult::default();
        }
        if cycles <= self.cycles_remaining {
            self.cycles_remaining -= cycles;
            return TickResult::default();
        }

        // Conversion Complete
        self.converting = false;
        let sample = self.channels.get(self.selected_channel()).copied().unwrap_or(0);
        self.regs.force(DR, sample as u32);
        self.regs.set_bits(SR, SR_EOC);
        let irq = self.regs.value(CR1) & CR1_EOCIE != 0;

        let cr2 = self.regs.value(CR2);
        if cr2 & CR2_CONT != 0 && cr2 & CR2_ADON != 0 {
            self.start_conversion();
        }

        TickResult::irq(irq)
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }
    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "registers": self.regs.snapshot(),
            "channels": self.channels.to_vec(),
            "converting": self.converting,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One ADC cycle per tick keeps the conversion timing visible.
    fn slow_adc() -> Adc {
        Adc::with_clock(1_000)
    }

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_adc_basic_conversion() {
        let mut adc = slow_adc();
        adc.set_channel(3, 0x7AB);
        adc.write_register(0x34, 3); // SQ1 = channel 3
        adc.write_register(0x08, CR2_ADON);
        adc.write_register(0x08, CR2_ADON | CR2_SWSTART);

        assert!(adc.converting);
        assert_eq!(adc.cycles_remaining, 14);
        assert_eq!(adc.read_register(0x08) & CR2_SWSTART, 0);

        for _ in 0..14 {
            let res = adc.update(MS);
            assert!(adc.converting);
            assert!(!res.irq);
        }

        adc.update(MS);
        assert!(!adc.converting);
        assert_ne!(adc.read_register(0x00) & SR_EOC, 0);
        assert_eq!(adc.read_register(0x4C), 0x7AB);
        // Reading DR cleared EOC.
        assert_eq!(adc.read_register(0x00) & SR_EOC, 0);
    }

    #[test]
    fn test_adc_interrupt() {
        let mut adc = slow_adc();
        adc.write_register(0x04, CR1_EOCIE);
        adc.write_register(0x08, CR2_ADON);
        adc.write_register(0x08, CR2_ADON | CR2_SWSTART);

        for _ in 0..15 {
            let res = adc.update(MS);
            if !adc.converting {
                assert!(res.irq);
                return;
            }
        }
        panic!("ADC failed to complete conversion");
    }

    #[test]
    fn test_swstart_without_adon_is_ignored() {
        let mut adc = Adc::new();
        adc.write_register(0x08, CR2_SWSTART);
        assert!(!adc.is_converting());
    }

    #[test]
    fn test_continuous_mode_restarts() {
        let mut adc = Adc::new();
        adc.set_channel(0, 100);
        adc.write_register(0x08, CR2_ADON | CR2_CONT);
        adc.write_register(0x08, CR2_ADON | CR2_CONT | CR2_SWSTART);
        adc.update(MS);
        assert!(adc.is_converting());
        assert_eq!(adc.read_register(0x4C), 100);
    }
}
