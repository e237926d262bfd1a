// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::TickClock;
use crate::{Device, Register, RegisterBank, TickResult};
use std::time::Duration;

const CRH: usize = 0;
const CRL: usize = 1;
const PRLH: usize = 2;
const PRLL: usize = 3;
const DIVH: usize = 4;
const DIVL: usize = 5;
const CNTH: usize = 6;
const CNTL: usize = 7;
const ALRH: usize = 8;
const ALRL: usize = 9;

const CRL_SECF: u32 = 1 << 0;
const CRL_ALRF: u32 = 1 << 1;
const CRL_OWF: u32 = 1 << 2;
const CRL_RSF: u32 = 1 << 3;
const CRL_CNF: u32 = 1 << 4;
const CRL_RTOFF: u32 = 1 << 5;
const CRL_FLAGS: u32 = CRL_SECF | CRL_ALRF | CRL_OWF | CRL_RSF;

pub const LSE_HZ: u64 = 32_768;

/// STM32F1 real-time clock: a 32-bit seconds counter behind a 20-bit
/// prescaler, clocked from the 32.768 kHz LSE.
#[derive(Debug)]
pub struct Rtc {
    regs: RegisterBank,
    clock: TickClock,
    prl: u32,
    div: u32,
    cnt: u32,
    alr: u32,
}

impl Default for Rtc {
    fn default() -> Self {
        Self::new()
    }
}

impl Rtc {
    pub fn new() -> Self {
        Self::with_clock(LSE_HZ)
    }

    pub fn with_clock(hz: u64) -> Self {
        Self {
            regs: RegisterBank::new(vec![
                Register::new("CRH", 0x00).writable(0x7),
                Register::new("CRL", 0x04).reset_value(CRL_RTOFF),
                Register::new("PRLH", 0x08),
                Register::new("PRLL", 0x0C),
                Register::new("DIVH", 0x10),
                Register::new("DIVL", 0x14),
                Register::new("CNTH", 0x18),
                Register::new("CNTL", 0x1C),
                Register::new("ALRH", 0x20),
                Register::new("ALRL", 0x24),
            ]),
            clock: TickClock::new(hz),
            prl: 0x8000,
            div: 0x8000,
            cnt: 0,
            alr: u32::MAX,
        }
    }

    pub fn counter(&self) -> u32 {
        self.cnt
    }

    fn in_config_mode(&self) -> bool {
        self.regs.value(CRL) & CRL_CNF != 0
    }

    fn write_crl(&mut self, value: u32) {
        let crl = self.regs.value(CRL);
        // Flags are rc_w0, CNF is plain read/write, RTOFF is read-only.
        let flags = crl & value & CRL_FLAGS;
        self.regs
            .force(CRL, flags | (value & CRL_CNF) | (crl & CRL_RTOFF));
    }
}

fn high(value: u32) -> u32 {
    value >> 16
}

fn low(value: u32) -> u32 {
    value & 0xFFFF
}

fn set_high(word: u32, value: u32) -> u32 {
    (word & 0xFFFF) | ((value & 0xFFFF) << 16)
}

fn set_low(word: u32, value: u32) -> u32 {
    (word & 0xFFFF_0000) | (value & 0xFFFF)
}

impl Device for Rtc {
    fn registers(&self) -> &RegisterBank {
        &self.regs
    }

    fn registers_mut(&mut self) -> &mut RegisterBank {
        &mut self.regs
    }

    fn pre_read(&mut self, index: usize) -> u32 {
        match index {
            DIVH => high(self.div) & 0xF,
            DIVL => low(self.div),
            CNTH => high(self.cnt),
            CNTL => low(self.cnt),
            // PRL and ALR are write-only.
            PRLH | PRLL | ALRH | ALRL => 0,
            _ => self.regs.value(index),
        }
    }

    fn post_write(&mut self, index: usize, value: u32) {
        match index {
            CRL => self.write_crl(value),
            CRH => self.regs.store(CRH, value),
            PRLH | PRLL | CNTH | CNTL | ALRH | ALRL if !self.in_config_mode() => {
                tracing::trace!("RTC write outside configuration mode ignored");
            }
            PRLH => self.prl = set_high(self.prl, value & 0xF),
            PRLL => self.prl = set_low(self.prl, value),
            CNTH => self.cnt = set_high(self.cnt, value),
            CNTL => self.cnt = set_low(self.cnt, value),
            ALRH => self.alr = set_high(self.alr, value),
            ALRL => self.alr = set_low(self.alr, value),
            _ => {}
        }
    }

    fn update(&mut self, dt: Duration) -> TickResult {
        let cycles = self.clock.advance(dt);
        if cycles == 0 || self.in_config_mode() {
            return TickResult::default();
        }

        let period = self.prl as u64 + 1;
        let div = self.div as u64;
        let seconds = if cycles <= div {
            self.div = (div - cycles) as u32;
            0
        } else {
            let past = cycles - div - 1;
            self.div = (self.prl as u64 - past % period) as u32;
            1 + past / period
        };
        if seconds == 0 {
            return TickResult::default();
        }

        let old = self.cnt;
        let new = old.wrapping_add(seconds as u32);
        let mut events = CRL_SECF;
        if seconds > u32::MAX as u64 || new < old {
            events |= CRL_OWF;
        }
        // Alarm fires when the counter passes through ALR.
        if (self.alr.wrapping_sub(old).wrapping_sub(1) as u64) < seconds {
            events |= CRL_ALRF;
        }
        self.cnt = new;
        self.regs.set_bits(CRL, events);

        // CRH interrupt enables line up with the CRL flag bits.
        TickResult::irq(self.regs.value(CRH) & events != 0)
    }

    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "crh": self.regs.value(CRH),
            "crl": self.regs.value(CRL),
            "prl": self.prl,
            "div": self.div,
            "cnt": self.cnt,
            "alr": self.alr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configure(rtc: &mut Rtc, prl: u32, cnt: u32, alr: u32) {
        rtc.write_register(0x04, CRL_CNF);
        rtc.write_register(0x08, prl >> 16);
        rtc.write_register(0x0C, prl & 0xFFFF);
        rtc.write_register(0x18, cnt >> 16);
        rtc.write_register(0x1C, cnt & 0xFFFF);
        rtc.write_register(0x20, alr >> 16);
        rtc.write_register(0x24, alr & 0xFFFF);
        rtc.write_register(0x04, 0);
    }

    #[test]
    fn test_counts_seconds_from_lse() {
        let mut rtc = Rtc::new();
        configure(&mut rtc, 0x7FFF, 0, u32::MAX);
        rtc.write_register(0x00, CRL_SECF); // SECIE

        let mut irqs = 0;
        for _ in 0..3000 {
            if rtc.update(Duration::from_millis(1)).irq {
                irqs += 1;
            }
        }
        assert_eq!(rtc.counter(), 2);
        assert_eq!(irqs, 2);
        assert_eq!(rtc.read_register(0x1C), 2);
        assert_ne!(rtc.read_register(0x04) & CRL_SECF, 0);
    }

    #[test]
    fn test_alarm_flag_and_interrupt() {
        let mut rtc = Rtc::new();
        configure(&mut rtc, 0x7FFF, 9, 10);
        rtc.write_register(0x00, CRL_ALRF); // ALRIE only
        assert!(rtc.update(Duration::from_millis(1001)).irq);
        assert_ne!(rtc.read_register(0x04) & CRL_ALRF, 0);

        // Flags are rc_w0.
        rtc.write_register(0x04, !CRL_ALRF & 0xF);
        assert_eq!(rtc.read_register(0x04) & CRL_ALRF, 0);
        assert_ne!(rtc.read_register(0x04) & CRL_SECF, 0);
    }

    #[test]
    fn test_counter_protected_outside_config_mode() {
        let mut rtc = Rtc::new();
        rtc.write_register(0x1C, 42);
        assert_eq!(rtc.counter(), 0);
        assert_eq!(rtc.read_register(0x04) & CRL_RTOFF, CRL_RTOFF);
    }

    #[test]
    fn test_overflow_flag() {
        let mut rtc = Rtc::new();
        configure(&mut rtc, 0x7FFF, u32::MAX, 5);
        rtc.update(Duration::from_millis(1001));
        assert_eq!(rtc.counter(), 0);
        assert_ne!(rtc.read_register(0x04) & CRL_OWF, 0);
    }
}
