#[macro_export]
macro_rules! mux_debug {
    ($($arg:tt)*) => {
        if log::log_enabled!(log::Level::Debug) {
            log::debug!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! mux_info {
    ($($arg:tt)*) => {
        if log::log_enabled!(log::Level::Info) {
            log::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! mux_warn {
    ($($arg:tt)*) => {
        if log::log_enabled!(log::Level::Warn) {
            log::warn!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! mux_error {
    ($($arg:tt)*) => {
        if log::log_enabled!(log::Level::Error) {
            log::error!($($arg)*);
        }
    };
}

/// Frame-level chatter; compiled in but silent unless `RUST_LOG=trace`.
#[macro_export]
macro_rules! mux_trace {
    ($($arg:tt)*) => {
        if log::log_enabled!(log::Level::Trace) {
            log::trace!($($arg)*);
        }
    };
}
