//! Logging macros for the rollout engine with verbosity level control.
//!
//! Nothing is formatted when a level is disabled.
//! Verbosity levels:
//! - 0: SILENT (correctness warnings only)
//! - 1: STEPS (each forecast step applied, with elapsed time)
//! - 2: CACHE (checkpoint hit/miss decisions)
//! - 3: DEBUG (planner internals)

use chrono::{DateTime, Utc};

use crate::models::Timestamp;

/// Verbosity level constants.
pub const VERBOSITY_SILENT: u8 = 0;
pub const VERBOSITY_STEPS: u8 = 1;
pub const VERBOSITY_CACHE: u8 = 2;
pub const VERBOSITY_DEBUG: u8 = 3;

/// Render a UTC timestamp for log lines.
///
/// Falls back to the raw seconds when the value is outside chrono's range.
pub fn iso(timestamp: Timestamp) -> String {
    match DateTime::<Utc>::from_timestamp(timestamp, 0) {
        Some(dt) => dt.to_rfc3339(),
        None => format!("@{}", timestamp),
    }
}

/// Log a correctness warning. Emitted at every verbosity level.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        eprintln!("warning: {}", format_args!($($arg)*));
    };
}

/// Log at STEPS level (verbosity >= 1).
///
/// Used for: steps applied, model timings, rollout start/finish.
#[macro_export]
macro_rules! log_steps {
    ($verbosity:expr, $($arg:tt)*) => {
        if $verbosity >= $crate::logging::VERBOSITY_STEPS {
            eprintln!($($arg)*);
        }
    };
}

/// Log at CACHE level (verbosity >= 2).
///
/// Used for: checkpoint hits and misses, lazy reloads from the store.
#[macro_export]
macro_rules! log_cache {
    ($verbosity:expr, $($arg:tt)*) => {
        if $verbosity >= $crate::logging::VERBOSITY_CACHE {
            eprintln!($($arg)*);
        }
    };
}

/// Log at DEBUG level (verbosity >= 3).
#[macro_export]
macro_rules! log_debug {
    ($verbosity:expr, $($arg:tt)*) => {
        if $verbosity >= $crate::logging::VERBOSITY_DEBUG {
            eprintln!($($arg)*);
        }
    };
}
