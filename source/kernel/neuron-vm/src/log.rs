// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Exercised by swap/address-space tests via take_lines()
//! PUBLIC API: log_* macros, emit(level,target,args), take_lines() (hosted)
//! DEPENDS_ON: uart::KernelUart (OS), spin::Mutex
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission

use core::fmt::{Arguments, Write};

/// Logging severity used by the VM layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn enabled(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        }
    }
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !level.enabled() {
        return;
    }
    sink::write_line(level, target, args);
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod sink {
    use super::{Arguments, Level, Write};

    pub(super) fn write_line(level: Level, target: &'static str, args: Arguments<'_>) {
        let mut uart = crate::uart::KernelUart::lock();
        let writer = &mut *uart;
        let _ = writer.write_fmt(format_args!("[{} {}] ", level.tag(), target));
        let _ = writer.write_fmt(args);
        let _ = writer.write_char('\n');
    }
}

// Hosted builds keep the most recent lines in memory instead of driving MMIO.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
mod sink {
    use super::{Arguments, Level, Write};
    use alloc::collections::VecDeque;
    use alloc::string::String;
    use alloc::vec::Vec;
    use spin::Mutex;

    const RING_LINES: usize = 512;

    static RING: Mutex<VecDeque<String>> = Mutex::new(VecDeque::new());

    pub(super) fn write_line(level: Level, target: &'static str, args: Arguments<'_>) {
        let mut line = String::new();
        let _ = write!(line, "[{} {}] ", level.tag(), target);
        let _ = line.write_fmt(args);
        let mut ring = RING.lock();
        if ring.len() == RING_LINES {
            ring.pop_front();
        }
        ring.push_back(line);
    }

    pub(super) fn take_lines() -> Vec<String> {
        RING.lock().drain(..).collect()
    }
}

/// Drains the lines captured by the hosted sink, oldest first.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn take_lines() -> alloc::vec::Vec<alloc::string::String> {
    sink::take_lines()
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}
