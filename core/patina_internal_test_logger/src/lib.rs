//! Stdout logger for the unit and integration tests of the workspace crates.
//!
//! The crate's own tests install the logger through a constructor; dependents call [`init`] from
//! their test setup.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use std::io::{self, Write};

use log::{LevelFilter, Log};

static LOGGER: TestLogger = TestLogger;

/// Installs [`TestLogger`] at trace level. Does nothing if a logger is already installed.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logger() {
    init();
}

pub struct TestLogger;

impl Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        _ = writeln!(io::stdout(), "[{:<5} {}] {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {
        _ = io::stdout().flush()
    }
}
