// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Console UART used as the log sink on the `virt` machine.

use core::fmt::{self, Write};
use spin::Mutex;

/// Address of the first UART on the `virt` machine.
const UART0_BASE: usize = 0x1000_0000;
const UART_TX: usize = 0x0;
const UART_LSR: usize = 0x5;
const LSR_TX_IDLE: u8 = 1 << 5;

static UART0: Mutex<KernelUart> = Mutex::new(KernelUart::new(UART0_BASE));

/// Polled NS16550A transmitter.
pub struct KernelUart {
    base: usize,
}

impl KernelUart {
    const fn new(base: usize) -> Self {
        Self { base }
    }

    /// Returns a guard for the console UART.
    pub fn lock() -> spin::MutexGuard<'static, KernelUart> {
        UART0.lock()
    }

    fn put(&self, value: u8) {
        let tx = (self.base + UART_TX) as *mut u8;
        let lsr = (self.base + UART_LSR) as *const u8;
        // SAFETY: the UART registers are identity mapped for the kernel lifetime.
        unsafe {
            while core::ptr::read_volatile(lsr) & LSR_TX_IDLE == 0 {}
            core::ptr::write_volatile(tx, value);
        }
    }
}

impl Write for KernelUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                self.put(b'\r');
            }
            self.put(byte);
        }
        Ok(())
    }
}
