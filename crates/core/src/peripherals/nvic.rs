// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::interrupt::{bank_and_bit, InterruptController, LINES_PER_BANK};
use crate::{Device, Register, RegisterBank};
use chambersim_config::MAX_IRQ_LINES;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const ISER: u64 = 0x000;
const ICER: u64 = 0x080;
const ISPR: u64 = 0x100;
const ICPR: u64 = 0x180;

/// Shared enable/pending state for the interrupt controller.
///
/// Held behind an `Arc` by the simulator, the memory-mapped [`Nvic`] view and
/// any harness that injects interrupts, so requests never need the
/// simulator lock.
#[derive(Debug)]
pub struct NvicState {
    lines: u32,
    iser: Vec<AtomicU32>,
    ispr: Vec<AtomicU32>,
}

impl Default for NvicState {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NvicState {
    /// Controller with `lines` lines, rounded up to whole banks and capped at
    /// [`MAX_IRQ_LINES`].
    pub fn new(lines: u32) -> Self {
        if lines > MAX_IRQ_LINES {
            tracing::warn!(
                "{} interrupt lines requested, capping at {}",
                lines,
                MAX_IRQ_LINES
            );
        }
        let banks = lines.min(MAX_IRQ_LINES).div_ceil(LINES_PER_BANK).max(1);
        Self {
            lines: banks * LINES_PER_BANK,
            iser: (0..banks).map(|_| AtomicU32::new(0)).collect(),
            ispr: (0..banks).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn bank_count(&self) -> usize {
        self.iser.len()
    }

    pub fn enabled_bank(&self, bank: usize) -> u32 {
        self.iser
            .get(bank)
            .map_or(0, |b| b.load(Ordering::SeqCst))
    }

    pub fn pending_bank(&self, bank: usize) -> u32 {
        self.ispr
            .get(bank)
            .map_or(0, |b| b.load(Ordering::SeqCst))
    }

    fn set_enable_mask(&self, bank: usize, mask: u32) {
        if let Some(b) = self.iser.get(bank) {
            b.fetch_or(mask, Ordering::SeqCst);
        }
    }

    fn clear_enable_mask(&self, bank: usize, mask: u32) {
        if let Some(b) = self.iser.get(bank) {
            b.fetch_and(!mask, Ordering::SeqCst);
        }
    }

    fn set_pending_mask(&self, bank: usize, mask: u32) {
        if let Some(b) = self.ispr.get(bank) {
            b.fetch_or(mask, Ordering::SeqCst);
        }
    }

    fn clear_pending_mask(&self, bank: usize, mask: u32) {
        if let Some(b) = self.ispr.get(bank) {
            b.fetch_and(!mask, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let iser: Vec<u32> = self.iser.iter().map(|a| a.load(Ordering::Relaxed)).collect();
        let ispr: Vec<u32> = self.ispr.iter().map(|a| a.load(Ordering::Relaxed)).collect();
        serde_json::json!({
            "iser": iser,
            "ispr": ispr,
        })
    }
}

impl InterruptController for NvicState {
    fn line_count(&self) -> u32 {
        self.lines
    }

    fn request_irq(&self, line: u32) -> bool {
        if line >= self.lines {
            tracing::warn!("IRQ request for line {} beyond controller range", line);
            return false;
        }
        let (bank, bit) = bank_and_bit(line);
        self.set_pending_mask(bank, 1 << bit);
        self.is_enabled(line)
    }

    fn set_enabled(&self, line: u32, enabled: bool) {
        let (bank, bit) = bank_and_bit(line);
        if enabled {
            self.set_enable_mask(bank, 1 << bit);
        } else {
            self.clear_enable_mask(bank, 1 << bit);
        }
    }

    fn is_enabled(&self, line: u32) -> bool {
        let (bank, bit) = bank_and_bit(line);
        self.enabled_bank(bank) & (1 << bit) != 0
    }

    fn is_pending(&self, line: u32) -> bool {
        let (bank, bit) = bank_and_bit(line);
        self.pending_bank(bank) & (1 << bit) != 0
    }

    fn clear_pending(&self, line: u32) {
        let (bank, bit) = bank_and_bit(line);
        self.clear_pending_mask(bank, 1 << bit);
    }

    fn next_pending_irq(&self) -> Option<u32> {
        for (bank, (en, pend)) in self.iser.iter().zip(&self.ispr).enumerate() {
            loop {
                let ready = en.load(Ordering::SeqCst) & pend.load(Ordering::SeqCst);
                if ready == 0 {
                    break;
                }
                let bit = ready.trailing_zeros();
                let prev = pend.fetch_and(!(1 << bit), Ordering::SeqCst);
                if prev & (1 << bit) != 0 {
                    return Some(bank as u32 * LINES_PER_BANK + bit);
                }
                // Cleared concurrently; rescan this bank.
            }
        }
        None
    }

    fn ready_lines(&self) -> Vec<u32> {
        let mut lines = Vec::new();
        for (bank, (en, pend)) in self.iser.iter().zip(&self.ispr).enumerate() {
            let mut ready = en.load(Ordering::SeqCst) & pend.load(Ordering::SeqCst);
            while ready != 0 {
                let bit = ready.trailing_zeros();
                lines.push(bank as u32 * LINES_PER_BANK + bit);
                ready &= ready - 1;
            }
        }
        lines
    }

    fn acknowledge(&self, line: u32) -> bool {
        if !self.is_enabled(line) {
            return false;
        }
        let (bank, bit) = bank_and_bit(line);
        match self.ispr.get(bank) {
            Some(pend) => pend.fetch_and(!(1 << bit), Ordering::SeqCst) & (1 << bit) != 0,
            None => false,
        }
    }
}

/// Memory-mapped view of [`NvicState`] (ISER/ICER/ISPR/ICPR banks).
#[derive(Debug)]
pub struct Nvic {
    state: Arc<NvicState>,
    regs: RegisterBank,
}

impl Nvic {
    pub fn new(state: Arc<NvicState>) -> Self {
        let banks = state.bank_count() as u64;
        let mut regs = Vec::new();
        for (prefix, base) in [("ISER", ISER), ("ICER", ICER), ("ISPR", ISPR), ("ICPR", ICPR)] {
            for n in 0..banks {
                regs.push(Register::new(format!("{}{}", prefix, n), base + n * 4));
            }
        }
        Self {
            state,
            regs: RegisterBank::new(regs),
        }
    }

    pub fn state(&self) -> &Arc<NvicState> {
        &self.state
    }

    fn decode(&self, index: usize) -> (u64, usize) {
        let offset = self.regs.reg(index).offset();
        let group = offset & !0x7F;
        (group, ((offset - group) / 4) as usize)
    }
}

impl Device for Nvic {
    fn registers(&self) -> &RegisterBank {
        &self.regs
    }

    fn registers_mut(&mut self) -> &mut RegisterBank {
        &mut self.regs
    }

    fn pre_read(&mut self, index: usize) -> u32 {
        let (group, bank) = self.decode(index);
        match group {
            ISER | ICER => self.state.enabled_bank(bank),
            _ => self.state.pending_bank(bank),
        }
    }

    fn post_write(&mut self, index: usize, value: u32) {
        let (group, bank) = self.decode(index);
        match group {
            ISER => self.state.set_enable_mask(bank, value),
            ICER => self.state.clear_enable_mask(bank, value),
            ISPR => self.state.set_pending_mask(bank, value),
            _ => self.state.clear_pending_mask(bank, value),
        }
    }

    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }

    fn snapshot(&self) -> serde_json::Value {
        self.state.snapshot()
    }
}
