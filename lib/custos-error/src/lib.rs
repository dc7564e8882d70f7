//! Error primitives shared across the supervision runtime.
//!
//! Concern-specific errors are modeled as `snafu` enums in their own crates. Anything that crosses a `serve` boundary,
//! or otherwise needs to carry an arbitrary cause along with context, is converted into a [`GenericError`].

/// An opaque error that carries a chain of causes and context.
pub type GenericError = anyhow::Error;

/// Macro for constructing a generic error.
///
/// The resulting value evaluates to [`GenericError`], and can be constructed from a string literal, a format string
/// (with arguments accepted, in the same order as `std::format!`), or a value which implements `Debug` and `Display`,
/// such as an existing error that implements `std::error::Error`.
///
/// When the value given implements `std::error::Error`, the source of the existing error value will be used as the
/// source of the error created by this macro.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

use std::fmt::Display;

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
    impl<T> Sealed for Option<T> {}
}

// NOTE: `anyhow::Context` is wrapped so its extension methods don't collide with `snafu::ResultExt`/`OptionExt` in
// modules that need both.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wrap the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wrap the error value with additional context that is evaluated lazily only once an error does occur.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, context: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, context)
    }
}

impl<T> ErrorContext<T, std::convert::Infallible> for Option<T> {
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, std::convert::Infallible>>::context(self, context)
    }

    fn with_error_context<C, F>(self, context: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, std::convert::Infallible>>::with_context(self, context)
    }
}

/// Renders an error and its full chain of causes on a single line.
///
/// Useful when an error has to be shipped somewhere that only accepts a flat string, such as the payload of an error
/// response on the wire.
pub fn format_error_chain(error: &GenericError) -> String {
    format!("{:#}", error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_prepended_to_chain() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::other("disk on fire"));
        let error = result.error_context("Failed to write state.").unwrap_err();
        assert_eq!(format_error_chain(&error), "Failed to write state.: disk on fire");
    }

    #[test]
    fn option_context() {
        let value: Option<u32> = None;
        let error = value.with_error_context(|| format!("missing key '{}'", "a.b")).unwrap_err();
        assert_eq!(error.to_string(), "missing key 'a.b'");
    }

    #[test]
    fn macro_forms() {
        let a = generic_error!("plain");
        let b = generic_error!("formatted {}", 42);
        assert_eq!(a.to_string(), "plain");
        assert_eq!(b.to_string(), "formatted 42");
    }
}
