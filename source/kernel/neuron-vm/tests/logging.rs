// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration test for VM diagnostics on the hosted log sink
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! TEST_COVERAGE: 1 integration test
//!
//! TEST_SCOPE:
//!   - Budget overflow is reported at error level under the "vm" target
//!
//! TEST_SCENARIOS:
//!   - kill_is_logged(): ProcessTooLarge emits one ERROR line naming the pid

mod common;

use common::Machine;
use neuron_vm::swap::policy::SecondChanceFifo;
use neuron_vm::{VmConfig, VmError, PAGE_SIZE};

#[test]
fn kill_is_logged() {
    let mut machine = Machine::new(32);
    let config = VmConfig::new(2, 3).expect("budget");
    let mut vm = machine.spawn::<SecondChanceFifo>(7, config);
    let mut ctx = machine.ctx();
    let _ = neuron_vm::log::take_lines();
    assert_eq!(vm.grow(&mut ctx, 8 * PAGE_SIZE), Err(VmError::ProcessTooLarge));
    let lines = neuron_vm::log::take_lines();
    let kills: Vec<_> = lines.iter().filter(|line| line.starts_with("[ERROR vm]")).collect();
    assert_eq!(kills.len(), 1, "log was {:?}", lines);
    assert!(kills[0].contains("pid 7"));
    vm.destroy(&mut ctx);
}
