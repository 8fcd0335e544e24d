//! Logging setup shared by the bufpond crates
//!
//! Every crate logs through the macros below, which forward to `emit`.
//! The level is chosen once per process from the BUFPOND_LOG variable:
//! - BUFPOND_LOG=off (default) - no logs
//! - BUFPOND_LOG=error | warn - failures only
//! - BUFPOND_LOG=info - compaction summaries
//! - BUFPOND_LOG=debug - retries, state transitions, byte counts

use std::sync::Once;

// Re-export emit so macros can use it
pub use emit;

/// Environment variable consulted by [`init_diagnostics`]
pub const LOG_ENV: &str = "BUFPOND_LOG";

static INIT: Once = Once::new();

/// Parse a BUFPOND_LOG value.
///
/// `Ok(None)` means logging is off. Unknown values are returned as `Err`
/// so the caller can fall back and say so.
pub fn parse_level(value: &str) -> Result<Option<emit::Level>, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "off" | "none" => Ok(None),
        "debug" | "trace" => Ok(Some(emit::Level::Debug)),
        "info" => Ok(Some(emit::Level::Info)),
        "warn" | "warning" => Ok(Some(emit::Level::Warn)),
        "error" => Ok(Some(emit::Level::Error)),
        other => Err(other.to_string()),
    }
}

/// Initialize diagnostics based on the BUFPOND_LOG environment variable
///
/// Safe to call any number of times; only the first call has an effect.
pub fn init_diagnostics() {
    let value = std::env::var(LOG_ENV).unwrap_or_else(|_| "off".to_string());
    match parse_level(&value) {
        Ok(level) => init_with_level(level),
        Err(unknown) => {
            init_with_level(Some(emit::Level::Info));
            // The emitter may be filtered off, so say it on stderr directly
            #[allow(clippy::print_stderr)]
            {
                eprintln!("Warning: Unknown {LOG_ENV} value '{unknown}', using 'info'");
            }
        }
    }
}

/// Initialize diagnostics at an explicit level (`None` disables logging)
pub fn init_with_level(level: Option<emit::Level>) {
    INIT.call_once(|| {
        let Some(level) = level else {
            return;
        };

        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(level))
            .init();

        // The runtime must outlive every emitting thread
        std::mem::forget(rt);
    });
}

/// Log basic operations (compactions finished, stores opened)
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Log detailed diagnostics (state transitions, offsets, byte counts)
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Log recoverable conditions (retries, buffer recreation, swallowed cleanup failures)
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Log failures that lose or quarantine data (corrupt objects, failed compactions)
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

/// Re-export the init function for convenience
pub use init_diagnostics as init;
