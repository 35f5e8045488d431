//! # Utility Modules
//!
//! Supporting utilities shared by the engine, connections and the timer.
//!
//! ## Components
//! - **Backoff**: doubling retry delays for accept and reconnect loops
//! - **Compression**: LZ4 and Zstd with caller-supplied size limits
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Timeout**: Default deadlines and async timeout wrappers

use std::any::Any;

pub mod backoff;
pub mod compression;
pub mod logging;
pub mod metrics;
pub mod timeout;

/// Best-effort text of a caught panic payload
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_variants() {
        let caught = std::panic::catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(panic_message(&*caught), "static text");

        let caught = std::panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(&*caught), "formatted 7");
    }
}
