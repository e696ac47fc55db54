//! Logger setup plus conditional logging macros that check a module-level
//! `ENABLE_LOGS` flag.
//!
//! Usage:
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_info, log_warn};
//!
//! log_info!("catalog resolved {} studies", count);
//! ```

use std::sync::Once;

/// Env var that overrides `RUST_LOG` for this crate's binary and tests.
pub const LOG_ENV: &str = "IMAGING_LOG";

static INIT: Once = Once::new();

/// Initialize `env_logger` once. Defaults to `info`; `IMAGING_LOG` (or `RUST_LOG`)
/// takes precedence when set.
pub fn init() {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::from_default_env();
        builder.filter_level(log::LevelFilter::Info);
        if let Ok(filters) = std::env::var(LOG_ENV) {
            builder.parse_filters(&filters);
        } else if let Ok(filters) = std::env::var("RUST_LOG") {
            builder.parse_filters(&filters);
        }
        // A test harness may already have installed a logger.
        let _ = builder.try_init();
    });
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*);
        }
    };
}

/// Conditional info logging; the calling module must define `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
