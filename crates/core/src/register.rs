// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::collections::HashMap;

/// Side effect applied after a firmware read completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadAction {
    #[default]
    None,
    /// Bits in the mask are cleared once the read has returned them.
    Clear(u32),
}

/// How a firmware write combines with the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAction {
    #[default]
    None,
    /// rc_w1: writing 1 clears the bit, writing 0 leaves it.
    WriteOneToClear,
    /// rc_w0: writing 0 clears the bit, writing 1 leaves it.
    WriteZeroToClear,
}

/// A named 32-bit memory-mapped cell.
///
/// Firmware writes only reach the bits in the `writable` mask; hardware-side
/// updates go through [`Register::force`], [`Register::set_bits`] and
/// [`Register::clear_bits`] which ignore the mask.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Register {
    name: String,
    offset: u64,
    value: u32,
    reset: u32,
    writable: u32,
    read_action: ReadAction,
    write_action: WriteAction,
}

impl Register {
    pub fn new(name: impl Into<String>, offset: u64) -> Self {
        Self {
            name: name.into(),
            offset,
            value: 0,
            reset: 0,
            writable: u32::MAX,
            read_action: ReadAction::None,
            write_action: WriteAction::None,
        }
    }

    pub fn reset_value(mut self, reset: u32) -> Self {
        self.reset = reset;
        self.value = reset;
        self
    }

    pub fn writable(mut self, mask: u32) -> Self {
        self.writable = mask;
        self
    }

    pub fn read_only(self) -> Self {
        self.writable(0)
    }

    pub fn on_read(mut self, action: ReadAction) -> Self {
        self.read_action = action;
        self
    }

    pub fn on_write(mut self, action: WriteAction) -> Self {
        self.write_action = action;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Apply a firmware write through the write action and writable mask.
    pub fn store(&mut self, value: u32) {
        let next = match self.write_action {
            WriteAction::None => value,
            WriteAction::WriteOneToClear => self.value & !value,
            WriteAction::WriteZeroToClear => self.value & value,
        };
        self.value = (self.value & !self.writable) | (next & self.writable);
    }

    /// Build the full word for a sub-word write.
    ///
    /// Lanes outside `lane_mask` are filled so that the write action leaves
    /// them untouched.
    pub fn merge_lanes(&self, lane_mask: u32, lanes: u32) -> u32 {
        let fill = match self.write_action {
            WriteAction::None => self.value,
            WriteAction::WriteOneToClear => 0,
            WriteAction::WriteZeroToClear => u32::MAX,
        };
        (fill & !lane_mask) | (lanes & lane_mask)
    }

    pub fn force(&mut self, value: u32) {
        self.value = value;
    }

    pub fn set_bits(&mut self, mask: u32) {
        self.value |= mask;
    }

    pub fn clear_bits(&mut self, mask: u32) {
        self.value &= !mask;
    }

    pub fn reset(&mut self) {
        self.value = self.reset;
    }

    fn after_read(&mut self) {
        if let ReadAction::Clear(mask) = self.read_action {
            self.value &= !mask;
        }
    }
}

/// Ordered register collection owned by a single device.
///
/// Devices address their registers by position, so the construction order is
/// the index order.
#[derive(Debug, Clone, Default)]
pub struct RegisterBank {
    regs: Vec<Register>,
    by_offset: HashMap<u64, usize>,
}

impl RegisterBank {
    pub fn new(regs: Vec<Register>) -> Self {
        let by_offset = regs
            .iter()
            .enumerate()
            .map(|(index, reg)| (reg.offset, index))
            .collect();
        Self { regs, by_offset }
    }

    pub fn index_of(&self, offset: u64) -> Option<usize> {
        self.by_offset.get(&offset).copied()
    }

    pub fn find(&self, name: &str) -> Option<&Register> {
        self.regs.iter().find(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Register> {
        self.regs.iter()
    }

    pub fn value(&self, index: usize) -> u32 {
        self.regs[index].value
    }

    pub fn store(&mut self, index: usize, value: u32) {
        self.regs[index].store(value);
    }

    pub fn force(&mut self, index: usize, value: u32) {
        self.regs[index].force(value);
    }

    pub fn set_bits(&mut self, index: usize, mask: u32) {
        self.regs[index].set_bits(mask);
    }

    pub fn clear_bits(&mut self, index: usize, mask: u32) {
        self.regs[index].clear_bits(mask);
    }

    pub fn reg(&self, index: usize) -> &Register {
        &self.regs[index]
    }

    /// Return register `index` to its reset value.
    pub fn reset(&mut self, index: usize) {
        self.regs[index].reset();
    }

    pub(crate) fn after_read(&mut self, index: usize) {
        self.regs[index].after_read();
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .regs
            .iter()
            .map(|r| (r.name.clone(), serde_json::Value::from(r.value)))
            .collect();
        serde_json::Value::Object(map)
    }
}
