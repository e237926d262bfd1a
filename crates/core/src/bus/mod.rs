// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::interrupt::InterruptController;
use crate::peripherals::nvic::NvicState;
use crate::{AccessSize, Device, Direction, SimError, SimResult, SimulationObserver};
use std::sync::Arc;
use std::time::Duration;

/// Firmware-facing memory primitives.
///
/// Every width funnels into [`MemoryBus::operation`], so implementors only
/// decide how one access reaches the dispatcher.
pub trait MemoryBus {
    fn operation(&mut self, addr: u64, size: AccessSize, direction: Direction, payload: u64)
        -> u64;

    fn read_u8(&mut self, addr: u64) -> u8 {
        self.operation(addr, AccessSize::Byte, Direction::Read, 0) as u8
    }

    fn read_u16(&mut self, addr: u64) -> u16 {
        self.operation(addr, AccessSize::Half, Direction::Read, 0) as u16
    }

    fn read_u32(&mut self, addr: u64) -> u32 {
        self.operation(addr, AccessSize::Word, Direction::Read, 0) as u32
    }

    fn read_u64(&mut self, addr: u64) -> u64 {
        self.operation(addr, AccessSize::Double, Direction::Read, 0)
    }

    fn write_u8(&mut self, addr: u64, value: u8) {
        self.operation(addr, AccessSize::Byte, Direction::Write, value as u64);
    }

    fn write_u16(&mut self, addr: u64, value: u16) {
        self.operation(addr, AccessSize::Half, Direction::Write, value as u64);
    }

    fn write_u32(&mut self, addr: u64, value: u32) {
        self.operation(addr, AccessSize::Word, Direction::Write, value as u64);
    }

    fn write_u64(&mut self, addr: u64, value: u64) {
        self.operation(addr, AccessSize::Double, Direction::Write, value);
    }

    /// Read-modify-write: clear `clear`, then set `set`.
    fn modify_u32(&mut self, addr: u64, clear: u32, set: u32) {
        let value = self.read_u32(addr);
        self.write_u32(addr, (value & !clear) | set);
    }
}

pub struct DeviceEntry {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub irq: Option<u32>,
    pub dev: Box<dyn Device>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mapping {
    base: u64,
    end: u64,
    index: usize,
}

/// Address-range index over the simulator's devices.
///
/// Holds device indices only; the devices themselves live in
/// [`SystemBus::devices`].
#[derive(Debug, Default)]
pub struct MemoryDispatcher {
    mappings: Vec<Mapping>,
}

impl MemoryDispatcher {
    /// Map `[base, base + size)` to device `index`, rejecting overlaps.
    ///
    /// On overlap the error names the index of the conflicting device in
    /// `other`; the caller substitutes its name.
    fn map(&mut self, base: u64, size: u64, index: usize) -> Result<(), Option<usize>> {
        let end = base.checked_add(size).filter(|_| size > 0).ok_or(None)?;
        if let Some(m) = self
            .mappings
            .iter()
            .find(|m| base < m.end && m.base < end)
        {
            return Err(Some(m.index));
        }
        let pos = self.mappings.partition_point(|m| m.base < base);
        self.mappings.insert(pos, Mapping { base, end, index });
        Ok(())
    }

    /// Resolve `addr` to `(device index, offset within device)`.
    pub fn resolve(&self, addr: u64) -> Option<(usize, u64)> {
        let pos = self.mappings.partition_point(|m| m.base <= addr);
        let m = self.mappings.get(pos.checked_sub(1)?)?;
        (addr < m.end).then(|| (m.index, addr - m.base))
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// Composition root for devices: owns them, routes accesses and collects
/// their interrupt requests.
pub struct SystemBus {
    pub devices: Vec<DeviceEntry>,
    pub nvic: Arc<NvicState>,
    dispatcher: MemoryDispatcher,
}

impl Default for SystemBus {
    fn default() -> Self {
        Self::new(Arc::new(NvicState::default()))
    }
}

impl SystemBus {
    pub fn new(nvic: Arc<NvicState>) -> Self {
        Self {
            devices: Vec::new(),
            nvic,
            dispatcher: MemoryDispatcher::default(),
        }
    }

    /// Register a device. Overlapping or empty ranges and out-of-range
    /// interrupt lines are construction errors.
    pub fn register_device(&mut self, entry: DeviceEntry) -> SimResult<usize> {
        if let Some(line) = entry.irq {
            let lines = self.nvic.line_count();
            if line >= lines {
                return Err(SimError::InvalidIrqLine { line, lines });
            }
        }

        let index = self.devices.len();
        match self.dispatcher.map(entry.base, entry.size, index) {
            Ok(()) => {}
            Err(Some(other)) => {
                return Err(SimError::AddressOverlap {
                    name: entry.name,
                    base: entry.base,
                    size: entry.size,
                    other: self.devices[other].name.clone(),
                })
            }
            Err(None) => {
                return Err(SimError::InvalidRange {
                    name: entry.name,
                    base: entry.base,
                    size: entry.size,
                })
            }
        }

        tracing::debug!(
            "Mapped {} at {:#x}..{:#x} (irq {:?})",
            entry.name,
            entry.base,
            entry.base + entry.size,
            entry.irq
        );
        self.devices.push(entry);
        Ok(index)
    }

    pub fn find(&self, name: &str) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut DeviceEntry> {
        self.devices.iter_mut().find(|d| d.name == name)
    }

    /// Absolute address of register `reg` in device `device`.
    pub fn register_address(&self, device: &str, reg: &str) -> Option<u64> {
        let entry = self.find(device)?;
        let offset = entry.dev.registers().find(reg)?.offset();
        Some(entry.base + offset)
    }

    /// Update every device once, then latch the lines they requested.
    ///
    /// Returns the requested lines in device order.
    pub fn update_devices(
        &mut self,
        dt: Duration,
        observers: &[Arc<dyn SimulationObserver>],
    ) -> Vec<u32> {
        let mut requested = Vec::new();
        for entry in &mut self.devices {
            let res = entry.dev.update(dt);
            for observer in observers {
                observer.on_device_update(&entry.name, &res);
            }
            if res.irq {
                match entry.irq {
                    Some(line) => requested.push(line),
                    None => tracing::trace!("{} raised an IRQ with no line attached", entry.name),
                }
            }
            requested.extend(res.explicit_irqs);
        }

        for &line in &requested {
            self.nvic.request_irq(line);
        }
        requested
    }
}

impl MemoryBus for SystemBus {
    fn operation(
        &mut self,
        addr: u64,
        size: AccessSize,
        direction: Direction,
        payload: u64,
    ) -> u64 {
        let Some((index, offset)) = self.dispatcher.resolve(addr) else {
            tracing::trace!("Unmapped {:?} of {} bytes at {:#x}", direction, size.bytes(), addr);
            return 0;
        };
        let entry = &mut self.devices[index];
        let value = device_access(entry.dev.as_mut(), offset, size, direction, payload);
        tracing::trace!(
            "{} {:?} +{:#x} = {:#x}",
            entry.name,
            direction,
            offset,
            if direction == Direction::Read { value } else { payload }
        );
        value
    }
}

/// Perform one access of `size` at device `offset`, splitting it across the
/// 32-bit registers it touches.
pub fn device_access(
    dev: &mut dyn Device,
    offset: u64,
    size: AccessSize,
    direction: Direction,
    payload: u64,
) -> u64 {
    let bytes = size.bytes();
    if bytes == 8 && offset % 4 == 0 {
        let lo = word_access(dev, offset, 4, direction, payload & 0xFFFF_FFFF);
        let hi = word_access(dev, offset + 4, 4, direction, payload >> 32);
        return lo | (hi << 32);
    }
    if (offset % 4) + bytes <= 4 {
        return word_access(dev, offset, bytes, direction, payload);
    }

    // Misaligned access straddling registers: fall back to byte lanes.
    let mut value = 0u64;
    for i in 0..bytes {
        let lane = word_access(dev, offset + i, 1, direction, (payload >> (i * 8)) & 0xFF);
        value |= lane << (i * 8);
    }
    value
}

fn word_access(
    dev: &mut dyn Device,
    offset: u64,
    bytes: u64,
    direction: Direction,
    payload: u64,
) -> u64 {
    let word = offset & !3;
    let shift = ((offset % 4) * 8) as u32;
    let lane_mask = if bytes >= 4 {
        u32::MAX
    } else {
        ((1u32 << (bytes * 8)) - 1) << shift
    };

    match direction {
        Direction::Read => ((dev.read_register(word) & lane_mask) >> shift) as u64,
        Direction::Write => {
            let lanes = (payload as u32) << shift;
            let merged = if lane_mask == u32::MAX {
                lanes
            } else {
                match dev.registers().index_of(word) {
                    Some(index) => dev.registers().reg(index).merge_lanes(lane_mask, lanes),
                    None => return 0,
                }
            };
            dev.write_register(word, merged);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ReadAction, Register, RegisterBank, TickResult, WriteAction};

    #[derive(Debug)]
    struct Scratch {
        regs: RegisterBank,
        writes: usize,
    }

    impl Scratch {
        fn new() -> Self {
            Self {
                regs: RegisterBank::new(vec![
                    Register::new("DATA0", 0x00),
                    Register::new("DATA1", 0x04),
                    Register::new("STATUS", 0x08)
                        .reset_value(0x3)
                        .on_read(ReadAction::Clear(0x1)),
                    Register::new("FLAGS", 0x0C).on_write(WriteAction::WriteOneToClear),
                ]),
                writes: 0,
            }
        }
    }

    impl Device for Scratch {
        fn registers(&self) -> &RegisterBank {
            &self.regs
        }
        fn registers_mut(&mut self) -> &mut RegisterBank {
            &mut self.regs
        }
        fn post_write(&mut self, index: usize, value: u32) {
            self.writes += 1;
            self.regs.store(index, value);
        }
        fn update(&mut self, _dt: Duration) -> TickResult {
            TickResult::irq(true)
        }
        fn as_any(&self) -> Option<&dyn std::any::Any> {
            Some(self)
        }
    }

    fn entry(name: &str, base: u64, size: u64, irq: Option<u32>) -> DeviceEntry {
        DeviceEntry {
            name: name.to_string(),
            base,
            size,
            irq,
            dev: Box::new(Scratch::new()),
        }
    }

    fn writes_of(bus: &SystemBus, index: usize) -> usize {
        bus.devices[index]
            .dev
            .as_any()
            .and_then(|any| any.downcast_ref::<Scratch>())
            .map(|s| s.writes)
            .unwrap()
    }

    #[test]
    fn test_overlapping_ranges_rejected() {
        let mut bus = SystemBus::default();
        bus.register_device(entry("a", 0x4000_0000, 0x400, None)).unwrap();
        let err = bus
            .register_device(entry("b", 0x4000_03FC, 0x400, None))
            .unwrap_err();
        match err {
            SimError::AddressOverlap { name, other, .. } => {
                assert_eq!(name, "b");
                assert_eq!(other, "a");
            }
            other => panic!("unexpected error {other:?}"),
        }
        // Adjacent ranges are fine.
        bus.register_device(entry("c", 0x4000_0400, 0x400, None)).unwrap();
    }

    #[test]
    fn test_empty_range_and_bad_irq_rejected() {
        let mut bus = SystemBus::new(Arc::new(NvicState::new(32)));
        assert!(matches!(
            bus.register_device(entry("empty", 0x1000, 0, None)),
            Err(SimError::InvalidRange { .. })
        ));
        assert!(matches!(
            bus.register_device(entry("wrap", u64::MAX - 4, 0x10, None)),
            Err(SimError::InvalidRange { .. })
        ));
        assert!(matches!(
            bus.register_device(entry("irq", 0x1000, 0x10, Some(40))),
            Err(SimError::InvalidIrqLine { line: 40, lines: 32 })
        ));
    }

    #[test]
    fn test_unmapped_access_is_silent_noop() {
        let mut bus = SystemBus::default();
        bus.register_device(entry("a", 0x4000_0000, 0x400, None)).unwrap();
        assert_eq!(bus.read_u32(0x5000_0000), 0);
        bus.write_u32(0x5000_0000, 0xDEAD_BEEF);
        assert_eq!(bus.read_u32(0x4000_0000), 0);
    }

    #[test]
    fn test_access_reaches_only_owning_device() {
        let mut bus = SystemBus::default();
        let a = bus.register_device(entry("a", 0x4000_0000, 0x400, None)).unwrap();
        let b = bus.register_device(entry("b", 0x4000_0400, 0x400, None)).unwrap();

        bus.write_u32(0x4000_0404, 0x1234_5678);
        assert_eq!(bus.read_u32(0x4000_0404), 0x1234_5678);
        assert_eq!(bus.read_u32(0x4000_0004), 0);
        assert_eq!(writes_of(&bus, a), 0);
        assert_eq!(writes_of(&bus, b), 1);
    }

    #[test]
    fn test_pure_storage_round_trip() {
        let mut bus = SystemBus::default();
        bus.register_device(entry("a", 0x4000_0000, 0x400, None)).unwrap();
        for value in [0u32, 1, 0x8000_0000, 0xFFFF_FFFF, 0xA5A5_5A5A] {
            bus.write_u32(0x4000_0000, value);
            assert_eq!(bus.read_u32(0x4000_0000), value);
        }
    }

    #[test]
    fn test_sub_word_lanes() {
        let mut bus = SystemBus::default();
        bus.register_device(entry("a", 0x4000_0000, 0x400, None)).unwrap();
        bus.write_u32(0x4000_0000, 0x1122_3344);
        bus.write_u8(0x4000_0001, 0xAA);
        assert_eq!(bus.read_u32(0x4000_0000), 0x1122_AA44);
        bus.write_u16(0x4000_0002, 0xBEEF);
        assert_eq!(bus.read_u32(0x4000_0000), 0xBEEF_AA44);
        assert_eq!(bus.read_u8(0x4000_0003), 0xBE);
        assert_eq!(bus.read_u16(0x4000_0000), 0xAA44);
    }

    #[test]
    fn test_double_word_splits_low_first() {
        let mut bus = SystemBus::default();
        bus.register_device(entry("a", 0x4000_0000, 0x400, None)).unwrap();
        bus.write_u64(0x4000_0000, 0x0102_0304_0506_0708);
        assert_eq!(bus.read_u32(0x4000_0000), 0x0506_0708);
        assert_eq!(bus.read_u32(0x4000_0004), 0x0102_0304);
        assert_eq!(bus.read_u64(0x4000_0000), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_clear_on_read_status() {
        let mut bus = SystemBus::default();
        bus.register_device(entry("a", 0x4000_0000, 0x400, None)).unwrap();
        assert_eq!(bus.read_u32(0x4000_0008), 0x3);
        assert_eq!(bus.read_u32(0x4000_0008), 0x2);
    }

    #[test]
    fn test_byte_write_to_w1c_only_touches_its_lane() {
        let mut bus = SystemBus::default();
        let a = bus.register_device(entry("a", 0x4000_0000, 0x400, None)).unwrap();
        bus.devices[a].dev.registers_mut().force(3, 0x0100_0001);
        bus.write_u8(0x4000_000C, 0x01);
        assert_eq!(bus.read_u32(0x4000_000C), 0x0100_0000);
    }

    #[test]
    fn test_update_devices_latches_attached_lines() {
        let mut bus = SystemBus::default();
        bus.register_device(entry("a", 0x4000_0000, 0x400, Some(7))).unwrap();
        bus.register_device(entry("b", 0x4000_0400, 0x400, None)).unwrap();
        let requested = bus.update_devices(Duration::from_millis(1), &[]);
        assert_eq!(requested, vec![7]);
        assert!(bus.nvic.is_pending(7));
    }
}
