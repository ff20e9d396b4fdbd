//! Logging initialization

/// Initialize the logging system
///
/// Uses env_logger with default filter level of `info`.
/// Override with RUST_LOG environment variable.
///
/// # Example
/// ```no_run
/// svox::core::logging::init();
/// log::info!("renderer started");
/// ```
pub fn init() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    )
    .format_timestamp_millis()
    .init();
}

/// Like [`init`] but safe to call more than once, for tests and embedders
/// that may already have installed a logger
pub fn try_init() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    )
    .is_test(cfg!(test))
    .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_init_is_repeatable() {
        try_init();
        try_init();
        log::info!("logger installed twice without panicking");
    }
}
