//! An explicit logger handle threaded through every pipeline stage.
//!
//! The original tool kept a single global `loglevel` variable that every
//! `log_debug`/`log_normal` call site read. Per the redesign notes, a global
//! is replaced here with a small `Logger` value that stages take by
//! reference; it is backed by the `log` facade so the actual formatting and
//! filtering still goes through the same ecosystem crate the rest of the
//! pack uses, but *which* level is active is a property of one `Logger`
//! instance rather than process-wide state.

#[derive(Clone, Copy, Debug)]
pub struct Logger {
    debug: bool,
}

impl Logger {
    pub fn new(debug: bool) -> Self {
        Logger { debug }
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    /// Corresponds to the original's `log_debug`.
    pub fn debug(&self, args: core::fmt::Arguments<'_>) {
        if self.debug {
            log::debug!("{}", args);
        }
    }

    /// Corresponds to the original's `log_normal`.
    pub fn normal(&self, args: core::fmt::Arguments<'_>) {
        log::info!("{}", args);
    }

    /// Advisory / WARN severity: does not abort the run.
    pub fn warn(&self, args: core::fmt::Arguments<'_>) {
        log::warn!("{}", args);
    }
}

/// Initializes the process-wide `log` backend once, at CLI startup. This is
/// the one place the crate deals with a process-global: `stderrlog` needs to
/// install itself before any `log::*!` call fires, but which messages a
/// given stage *emits* is still controlled by the `Logger` handle it was
/// given, not by reading this global back.
pub fn init_backend(debug: bool) {
    // stderrlog's verbosity is a step count above its quiet default: 0 is
    // errors only, each additional step unlocks warn, info, then debug.
    let verbosity: usize = if debug { 3 } else { 2 };
    let _ = stderrlog::new().verbosity(verbosity).init();
}

#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)*) => {
        $logger.debug(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_normal {
    ($logger:expr, $($arg:tt)*) => {
        $logger.normal(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $($arg:tt)*) => {
        $logger.warn(format_args!($($arg)*))
    };
}
