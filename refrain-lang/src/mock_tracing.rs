// Stand-ins for the `tracing` macros when the `tracing` feature is disabled.
// Field values and format arguments are borrowed inside a block that never
// runs, so bindings only used for logging still count as used.

#[allow(unused_macros)]
macro_rules! mock_fields {
    () => {};
    ($message:literal $(, $arg:expr)* $(,)?) => {
        $(let _ = &$arg;)*
    };
    (% $($key:ident).+ $(, $($rest:tt)*)?) => {
        let _ = &$($key).+;
        $(mock_fields!($($rest)*);)?
    };
    (? $($key:ident).+ $(, $($rest:tt)*)?) => {
        let _ = &$($key).+;
        $(mock_fields!($($rest)*);)?
    };
    ($($key:ident).+ = % $value:expr $(, $($rest:tt)*)?) => {
        let _ = &$value;
        $(mock_fields!($($rest)*);)?
    };
    ($($key:ident).+ = ? $value:expr $(, $($rest:tt)*)?) => {
        let _ = &$value;
        $(mock_fields!($($rest)*);)?
    };
    ($($key:ident).+ = $value:expr $(, $($rest:tt)*)?) => {
        let _ = &$value;
        $(mock_fields!($($rest)*);)?
    };
    ($($key:ident).+ $(, $($rest:tt)*)?) => {
        let _ = &$($key).+;
        $(mock_fields!($($rest)*);)?
    };
}

#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {
        if false {
            mock_fields!($($arg)*);
        }
    };
}

#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => {
        if false {
            mock_fields!($($arg)*);
        }
    };
}

#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {
        if false {
            mock_fields!($($arg)*);
        }
    };
}

#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => {
        if false {
            mock_fields!($($arg)*);
        }
    };
}
