// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SimulatorSnapshot {
    pub tick: u64,
    pub sim_time_us: u64,
    /// Enable and pending banks of the interrupt controller.
    pub interrupts: serde_json::Value,
    pub devices: HashMap<String, serde_json::Value>,
}
