// probe.rs — the diagnostic chokepoint.
//
// Every fallible device operation passes its outcome through `report`
// before the call site decides what to do with it. The probe only
// prints: it never panics, never aborts and returns nothing the caller
// could branch on. Whether an error is fatal is decided by the pipeline,
// not here.
//
// Output goes through `tracing` at ERROR level; `main` installs a fmt
// subscriber writing to stdout, so a non-fatal device error shows up as
// one line on standard output:
//
//   ERROR gpufilter::probe: Code -30, writing to input buffer: ...

use std::fmt;

/// Stable numeric status for an error value.
///
/// Codes are negative, zero is reserved for success. They exist so a
/// diagnostic line can be grepped or compared across runs without
/// parsing the human-readable message.
pub trait StatusCode {
    fn code(&self) -> i32;
}

/// Report `result` if it is an error. Success is silent.
pub fn report<T, E>(result: &Result<T, E>, message: &str)
where
    E: StatusCode + fmt::Display,
{
    if let Err(e) = result {
        report_error(e, message);
    }
}

/// Report an error value unconditionally.
pub fn report_error<E>(error: &E, message: &str)
where
    E: StatusCode + fmt::Display + ?Sized,
{
    tracing::error!("Code {}, {}: {}", error.code(), message, error);
}

/// Report a warning-class diagnostic that has no error value attached
/// (e.g. an under-covering work decomposition).
pub fn report_warning(message: &str) {
    tracing::warn!("{message}");
}
