// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use chambersim_core::peripherals::can::{
    code, cs, mb_offset, std_id, CanDirection, CanFrame, CanState, CanTrace, FlexCan, IFLAG1,
    IMASK1, MCR, REGION_SIZE, RXMGMASK,
};
use chambersim_core::{MemoryBus, SimConfig, Simulator};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CAN1: u64 = 0x4002_4000;
const CAN1_IRQ: u32 = 20;

fn can_sim() -> Simulator {
    let sim = Simulator::new(SimConfig::default());
    sim.add_device("can1", CAN1, REGION_SIZE, Some(CAN1_IRQ), Box::new(FlexCan::new(0)))
        .unwrap();
    sim.enable_irq(CAN1_IRQ, true);

    // Leave freeze mode with MB0..MB15 active.
    let mut fw = sim.firmware();
    fw.write_u32(CAN1 + MCR, 0x0F);
    sim.step();
    assert_eq!(state(&sim), CanState::Idle);
    sim
}

fn state(sim: &Simulator) -> CanState {
    sim.with_device::<FlexCan, _>("can1", |can| can.state()).unwrap()
}

fn transitions(sim: &Simulator) -> Vec<CanState> {
    sim.with_device::<FlexCan, _>("can1", |can| can.last_transitions().to_vec())
        .unwrap()
}

#[test]
fn test_rx_accept_then_reject() {
    let sim = can_sim();
    let mut fw = sim.firmware();
    fw.write_u32(CAN1 + RXMGMASK, std_id(0x7FF));
    fw.write_u32(CAN1 + mb_offset(0) + 4, std_id(0x123));
    fw.write_u32(CAN1 + mb_offset(0), cs(code::RX_EMPTY, 0));
    fw.write_u32(CAN1 + IMASK1, 1);

    let received = Arc::new(AtomicU32::new(0));
    let r = received.clone();
    sim.register_isr(CAN1_IRQ, move |ctx| {
        let data = ctx.read_u32(CAN1 + mb_offset(0) + 8);
        r.store(data, Ordering::SeqCst);
        // Unlock the buffer and acknowledge.
        ctx.write_u32(CAN1 + mb_offset(0), cs(code::RX_EMPTY, 0));
        ctx.write_u32(CAN1 + IFLAG1, 1);
    })
    .unwrap();

    let port = sim.can_port(0).unwrap();
    port.inject(CanFrame::new(0x123, &[0x11, 0x22, 0x33, 0x44]));
    let report = sim.step();
    assert_eq!(transitions(&sim), vec![CanState::Rx, CanState::Idle]);
    assert_eq!(report.dispatched, vec![CAN1_IRQ]);
    assert_eq!(received.load(Ordering::SeqCst), 0x1122_3344);
    assert_eq!(fw.read_u32(CAN1 + IFLAG1), 0);

    // Edge triggered: nothing further without a new frame.
    assert!(sim.step().dispatched.is_empty());

    port.inject(CanFrame::new(0x456, &[0xAA, 0xBB, 0xCC, 0xDD]));
    let report = sim.step();
    assert!(report.dispatched.is_empty());
    assert_eq!(state(&sim), CanState::Idle);
    let mb = sim
        .with_device::<FlexCan, _>("can1", |can| can.mailbox(0))
        .flatten()
        .unwrap();
    assert_eq!(mb.code, code::RX_EMPTY);
    assert_eq!(fw.read_u32(CAN1 + IFLAG1), 0);
}

#[test]
fn test_masked_buffer_sets_flag_without_dispatch() {
    let sim = can_sim();
    let mut fw = sim.firmware();
    fw.write_u32(CAN1 + mb_offset(1) + 4, std_id(0x50));
    fw.write_u32(CAN1 + mb_offset(1), cs(code::RX_EMPTY, 0));

    sim.can_port(0).unwrap().inject(CanFrame::new(0x50, &[1]));
    assert!(sim.step().dispatched.is_empty());
    assert_eq!(fw.read_u32(CAN1 + IFLAG1), 1 << 1);
}

#[test]
fn test_tx_forwarded_exactly_once() {
    let sim = can_sim();
    let mut fw = sim.firmware();
    let trace: CanTrace = Arc::new(Mutex::new(Vec::new()));
    assert_eq!(sim.attach_can_trace(trace.clone()), 1);

    fw.write_u32(CAN1 + IMASK1, 1 << 8);
    fw.write_u32(CAN1 + mb_offset(8) + 4, std_id(0x700));
    fw.write_u32(CAN1 + mb_offset(8) + 8, 0x0500_0000);
    fw.write_u32(CAN1 + mb_offset(8), cs(code::TX_DATA, 1));

    let tx_done = Arc::new(AtomicU32::new(0));
    let t = tx_done.clone();
    sim.register_isr(CAN1_IRQ, move |ctx| {
        let flags = ctx.read_u32(CAN1 + IFLAG1);
        ctx.write_u32(CAN1 + IFLAG1, flags);
        t.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    let report = sim.step();
    assert_eq!(report.dispatched, vec![CAN1_IRQ]);
    assert_eq!(transitions(&sim), vec![CanState::Tx, CanState::Idle]);
    let cs_word = fw.read_u32(CAN1 + mb_offset(8));
    assert_eq!((cs_word >> 24) & 0xF, code::TX_INACTIVE);

    sim.run_ticks(5);
    let frames = sim.can_port(0).unwrap().drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id, 0x700);
    assert_eq!(frames[0].payload(), &[0x05]);
    assert_eq!(tx_done.load(Ordering::SeqCst), 1);

    let events = trace.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].direction, CanDirection::Tx);
    assert_eq!(events[0].buffer, Some(8));
}

#[test]
fn test_host_waits_for_frame_from_running_firmware() {
    let mut sim = can_sim();
    let port = sim.can_port(0).unwrap();
    sim.start(|mut fw| {
        fw.write_u32(CAN1 + mb_offset(8) + 4, std_id(0x321));
        fw.write_u32(CAN1 + mb_offset(8) + 8, 0xBEEF_0000);
        fw.write_u32(CAN1 + mb_offset(8), cs(code::TX_DATA, 2));
        while fw.delay_ticks(1) {}
    })
    .unwrap();

    let frame = port.recv_timeout(Duration::from_secs(5));
    sim.stop().unwrap();
    let frame = frame.expect("no frame transmitted");
    assert_eq!(frame.id, 0x321);
    assert_eq!(frame.payload(), &[0xBE, 0xEF]);
    assert_eq!(port.recv_timeout(Duration::from_millis(10)), None);
}

#[test]
fn test_two_controllers_keep_separate_buses() {
    let sim = can_sim();
    sim.add_device("can2", 0x4002_5000, REGION_SIZE, Some(21), Box::new(FlexCan::new(1)))
        .unwrap();
    let mut fw = sim.firmware();
    fw.write_u32(0x4002_5000 + MCR, 0x0F);
    fw.write_u32(0x4002_5000 + mb_offset(0), cs(code::RX_EMPTY, 0));
    fw.write_u32(CAN1 + mb_offset(0), cs(code::RX_EMPTY, 0));
    sim.step();

    sim.can_port(1).unwrap().inject(CanFrame::new(0x0, &[9]));
    sim.step();
    let on = |name: &str| {
        sim.with_device::<FlexCan, _>(name, |can| can.mailbox(0).map(|mb| mb.code))
            .flatten()
    };
    assert_eq!(on("can1"), Some(code::RX_EMPTY));
    assert_eq!(on("can2"), Some(code::RX_FULL));
}
