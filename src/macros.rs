#![allow(unused_macros)]

#[cfg(feature = "defmt-logging")]
macro_rules! van_log {
    (trace,   $($arg:expr),*) => { defmt::trace!($($arg),*) };
    (debug,   $($arg:expr),*) => { defmt::debug!($($arg),*) };
    (info,    $($arg:expr),*) => { defmt::info!($($arg),*) };
    (warn,    $($arg:expr),*) => { defmt::warn!($($arg),*) };
    (error,   $($arg:expr),*) => { defmt::error!($($arg),*) };
}

#[cfg(not(feature = "defmt-logging"))]
macro_rules! van_log {
    ($level:ident, $($arg:expr),*) => {{ $( let _ = $arg; )* }}
}

macro_rules! van_trace {
    ($($arg:expr),*) => (van_log!(trace, $($arg),*));
}

macro_rules! van_debug {
    ($($arg:expr),*) => (van_log!(debug, $($arg),*));
}

macro_rules! van_info {
    ($($arg:expr),*) => (van_log!(info, $($arg),*));
}

macro_rules! van_warn {
    ($($arg:expr),*) => (van_log!(warn, $($arg),*));
}

macro_rules! van_error {
    ($($arg:expr),*) => (van_log!(error, $($arg),*));
}
