#![allow(unused_macros)]

cfg_if::cfg_if! {
    if #[cfg(feature = "log")] {
        macro_rules! store_log {
            (trace, $($arg:expr),*) => { log::trace!($($arg),*) };
            (debug, $($arg:expr),*) => { log::debug!($($arg),*) };
            (warn, $($arg:expr),*) => { log::warn!($($arg),*) };
            (error, $($arg:expr),*) => { log::error!($($arg),*) };
        }
    } else {
        macro_rules! store_log {
            ($level:ident, $($arg:expr),*) => {{ $( let _ = $arg; )* }}
        }
    }
}

macro_rules! store_trace {
    ($($arg:expr),*) => (store_log!(trace, $($arg),*));
}

macro_rules! store_debug {
    ($($arg:expr),*) => (store_log!(debug, $($arg),*));
}

macro_rules! store_warn {
    ($($arg:expr),*) => (store_log!(warn, $($arg),*));
}

macro_rules! store_error {
    ($($arg:expr),*) => (store_log!(error, $($arg),*));
}

/// Trace output that is only worth its cost when chasing a fan-out problem.
macro_rules! store_verbose {
    ($($arg:expr),*) => {
        #[cfg(feature = "verbose")]
        store_log!(trace, $($arg),*);
    };
}
