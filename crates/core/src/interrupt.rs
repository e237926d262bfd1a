// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::fmt::Debug;

/// Lines per enable/pending bank.
pub const LINES_PER_BANK: u32 = 32;

/// Trait representing a generic interrupt controller.
///
/// Lines are delivered lowest index first; there is no other priority
/// scheme and no preemption.
pub trait InterruptController: Debug + Send + Sync {
    /// Number of lines the controller tracks.
    fn line_count(&self) -> u32;

    /// Latch `line` as pending. Returns whether the line is currently enabled.
    fn request_irq(&self, line: u32) -> bool;

    fn set_enabled(&self, line: u32, enabled: bool);

    fn is_enabled(&self, line: u32) -> bool;

    fn is_pending(&self, line: u32) -> bool;

    fn clear_pending(&self, line: u32);

    /// First enabled-and-pending line in index order, with its pending bit
    /// cleared. `None` if nothing is deliverable.
    fn next_pending_irq(&self) -> Option<u32>;

    /// All lines currently enabled and pending, in index order, without
    /// clearing anything.
    fn ready_lines(&self) -> Vec<u32>;

    /// Clear `line`'s pending bit if it is enabled and pending. Returns
    /// whether the line was deliverable.
    fn acknowledge(&self, line: u32) -> bool;
}

pub(crate) fn bank_and_bit(line: u32) -> (usize, u32) {
    ((line / LINES_PER_BANK) as usize, line % LINES_PER_BANK)
}
