// Protocol breaches are not recoverable: log everything we know and stop.

/// Halt the process. Called only after the diagnostic context has been logged.
#[cold]
pub fn halt() -> ! {
    std::process::abort()
}

/// Log a protocol breach with structured diagnostic fields, then halt.
///
/// ```ignore
/// breach!("acknowledge in wrong state", queue = self.name(), state = state);
/// ```
#[macro_export]
macro_rules! breach {
    ($msg:expr $(, $key:ident = $val:expr)* $(,)?) => {{
        ::tracing::error!($($key = ?$val,)* "protocol breach: {}", $msg);
        $crate::Core::fatal::halt()
    }};
}
