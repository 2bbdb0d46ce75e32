//! No-op twins of the diagnostic macros, taken when `enable_log` is off.
//!
//! The arguments are still type-checked (and count as used), they just
//! never reach a subscriber.

#[macro_export]
macro_rules! debug {
    ($($args:tt)*) => {
        if false {
            let _ = ::core::format_args!($($args)*);
        }
    };
}

#[macro_export]
macro_rules! error {
    ($($args:tt)*) => {
        if false {
            let _ = ::core::format_args!($($args)*);
        }
    };
}

#[macro_export]
macro_rules! info {
    ($($args:tt)*) => {
        if false {
            let _ = ::core::format_args!($($args)*);
        }
    };
}

#[macro_export]
macro_rules! trace {
    ($($args:tt)*) => {
        if false {
            let _ = ::core::format_args!($($args)*);
        }
    };
}

#[macro_export]
macro_rules! warn {
    ($($args:tt)*) => {
        if false {
            let _ = ::core::format_args!($($args)*);
        }
    };
}
