//! Logging shim, active behind the `log` feature.
//!
//! debug for lifecycle steps, warning for dropped handles and detached
//! destinations, error for capability failures.
#![allow(unused, reason = "logger")]

macro_rules! debug {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        ::log::debug!($($tt)*);
    };
}

macro_rules! warning {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        ::log::warn!($($tt)*);
    };
}

macro_rules! error {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        ::log::error!($($tt)*);
    };
}

pub(crate) use {debug, warning, error};
