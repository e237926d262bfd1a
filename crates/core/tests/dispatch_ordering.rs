// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use chambersim_core::{
    Device, MemoryBus, Register, RegisterBank, SimConfig, SimulationObserver, Simulator,
    TickResult,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const SENSOR: u64 = 0x5000_0000;
const SENSOR_IRQ: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    TickStart(u64),
    Update,
    Read,
    Isr(u64),
    TickEnd(u64),
}

type Log = Arc<Mutex<Vec<Event>>>;

/// Requests its line every tick and logs every firmware read.
#[derive(Debug)]
struct Sensor {
    regs: RegisterBank,
    log: Log,
}

impl Device for Sensor {
    fn registers(&self) -> &RegisterBank {
        &self.regs
    }

    fn registers_mut(&mut self) -> &mut RegisterBank {
        &mut self.regs
    }

    fn pre_read(&mut self, index: usize) -> u32 {
        self.log.lock().unwrap().push(Event::Read);
        self.regs.value(index)
    }

    fn update(&mut self, _dt: Duration) -> TickResult {
        self.log.lock().unwrap().push(Event::Update);
        TickResult::irq(true)
    }
}

#[derive(Debug)]
struct TickLogger {
    log: Log,
}

impl SimulationObserver for TickLogger {
    fn on_tick_start(&self, tick: u64) {
        self.log.lock().unwrap().push(Event::TickStart(tick));
    }

    fn on_tick_end(&self, tick: u64) {
        self.log.lock().unwrap().push(Event::TickEnd(tick));
    }
}

#[test]
fn test_no_firmware_access_between_update_and_dispatch() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut sim = Simulator::new(SimConfig {
        pacing: Duration::from_millis(1),
        irq_lines: 32,
        ..Default::default()
    });
    sim.add_device(
        "sensor",
        SENSOR,
        0x100,
        Some(SENSOR_IRQ),
        Box::new(Sensor {
            regs: RegisterBank::new(vec![Register::new("DATA", 0x00)]),
            log: log.clone(),
        }),
    )
    .unwrap();
    sim.add_observer(Arc::new(TickLogger { log: log.clone() }));

    let isr_log = log.clone();
    sim.register_isr(SENSOR_IRQ, move |ctx| {
        isr_log.lock().unwrap().push(Event::Isr(ctx.tick()));
    })
    .unwrap();
    sim.enable_irq(SENSOR_IRQ, true);

    sim.start(|mut fw| {
        while fw.is_running() {
            fw.read_u32(SENSOR);
            thread::sleep(Duration::from_micros(50));
        }
    })
    .unwrap();
    assert!(sim.wait_until_tick(30, Duration::from_secs(10)));
    sim.stop().unwrap();

    let events = log.lock().unwrap().clone();
    let mut in_tick = None;
    let mut reads = 0;
    let mut isrs = 0;
    for event in &events {
        match *event {
            Event::TickStart(t) => {
                assert_eq!(in_tick, None, "nested tick");
                in_tick = Some(t);
            }
            Event::Update => assert!(in_tick.is_some(), "update outside a tick"),
            Event::Isr(t) => {
                assert_eq!(in_tick, Some(t), "ISR outside its tick");
                isrs += 1;
            }
            Event::TickEnd(t) => {
                assert_eq!(in_tick, Some(t));
                in_tick = None;
            }
            Event::Read => {
                assert_eq!(in_tick, None, "firmware read observed inside a tick");
                reads += 1;
            }
        }
    }
    assert!(reads > 0);
    assert!(isrs >= 30);
}

#[test]
fn test_all_updates_complete_before_first_dispatch() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sim = Simulator::new(SimConfig {
        irq_lines: 32,
        ..Default::default()
    });
    for (n, base) in [SENSOR, SENSOR + 0x100].into_iter().enumerate() {
        sim.add_device(
            format!("sensor{n}"),
            base,
            0x100,
            Some(SENSOR_IRQ + n as u32),
            Box::new(Sensor {
                regs: RegisterBank::new(vec![Register::new("DATA", 0x00)]),
                log: log.clone(),
            }),
        )
        .unwrap();
        let isr_log = log.clone();
        sim.register_isr(SENSOR_IRQ + n as u32, move |ctx| {
            isr_log.lock().unwrap().push(Event::Isr(ctx.tick()));
        })
        .unwrap();
        sim.enable_irq(SENSOR_IRQ + n as u32, true);
    }

    let report = sim.step();
    assert_eq!(report.requested, vec![SENSOR_IRQ, SENSOR_IRQ + 1]);
    assert_eq!(report.dispatched, vec![SENSOR_IRQ, SENSOR_IRQ + 1]);
    assert_eq!(
        *log.lock().unwrap(),
        vec![Event::Update, Event::Update, Event::Isr(1), Event::Isr(1)]
    );
}
