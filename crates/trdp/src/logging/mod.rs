// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Log backend bridging the `log` facade into a TRDP [`Output`].
//!
//! All engine code logs through `log::{error, warn, info, debug, trace}`
//! with a `[SUBSYSTEM]` tag in the message. `init_logging` installs the
//! host-supplied output as the process-wide `log` backend; hosts that
//! already run their own `log` implementation simply skip the call.

mod output;

pub use output::{ConsoleOutput, FileOutput, LogLevel, Output};

use std::sync::{Arc, OnceLock};

static BACKEND: OnceLock<Arc<dyn Output>> = OnceLock::new();

struct Bridge;

fn to_level(level: log::Level) -> LogLevel {
    match level {
        log::Level::Error => LogLevel::Error,
        log::Level::Warn => LogLevel::Warning,
        log::Level::Info => LogLevel::Info,
        log::Level::Debug | log::Level::Trace => LogLevel::Debug,
    }
}

impl log::Log for Bridge {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        BACKEND.get().is_some()
    }

    fn log(&self, record: &log::Record) {
        if let Some(out) = BACKEND.get() {
            // A failing sink must not feed back into the engine
            let _ = out.write(to_level(record.level()), &record.args().to_string());
        }
    }

    fn flush(&self) {
        if let Some(out) = BACKEND.get() {
            let _ = out.flush();
        }
    }
}

static BRIDGE: Bridge = Bridge;

/// Install `output` as the global `log` backend with the given minimum
/// level. Only the first call in a process wins; later calls (and hosts
/// with their own `log` setup) are ignored.
pub fn init_logging(output: Arc<dyn Output>, level: LogLevel) {
    if BACKEND.set(output).is_ok() {
        let max = match level {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        };
        if log::set_logger(&BRIDGE).is_ok() {
            log::set_max_level(max);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging(Arc::new(ConsoleOutput::new()), LogLevel::Warning);
        init_logging(Arc::new(ConsoleOutput::new()), LogLevel::Debug);
        log::warn!("[TEST] logging bridge self-test");
    }
}
