// This file is part of Zangetsu, a replicated time-partitioned record store.
// Copyright (C) 2026 The Zangetsu Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::error::Error as StdError;
use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/0e00c430827e81d61e1e7164ef04ca21ccbfaa77/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. See that link for descriptions of
/// each error.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        })
    }
}

struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

/// The common error type: a kind, an optional message, and an optional source.
///
/// Boxed so that `Result<T, Error>` stays a pointer wide on the happy path.
pub struct Error(Box<ErrorInner>);

impl Error {
    /// Wraps another error with the given kind.
    pub fn wrap<E: Into<Box<dyn StdError + Send + Sync>>>(kind: ErrorKind, e: E) -> Self {
        Error(Box::new(ErrorInner {
            kind,
            msg: None,
            source: Some(e.into()),
        }))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns an object which displays the full chain of errors, colon-separated.
    pub fn chain(&self) -> ErrorChain<'_> {
        ErrorChain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.msg {
            Some(ref msg) => write!(f, "{}: {}", self.0.kind, msg),
            None => fmt::Display::fmt(&self.0.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.chain())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

/// Displays an [`Error`] followed by all its sources.
pub struct ErrorChain<'a>(&'a Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut source = self.0.source();
        while let Some(e) = source {
            write!(f, ": {e}")?;
            source = e.source();
        }
        Ok(())
    }
}

/// Incrementally constructed [`Error`], as produced by the [`crate::err!`] macro.
pub struct ErrorBuilder {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl ErrorBuilder {
    pub fn msg(mut self, msg: String) -> Self {
        self.msg = Some(msg);
        self
    }

    pub fn source<E: Into<Box<dyn StdError + Send + Sync>>>(mut self, source: E) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn build(self) -> Error {
        Error(Box::new(ErrorInner {
            kind: self.kind,
            msg: self.msg,
            source: self.source,
        }))
    }
}

impl From<ErrorKind> for ErrorBuilder {
    fn from(kind: ErrorKind) -> Self {
        ErrorBuilder {
            kind,
            msg: None,
            source: None,
        }
    }
}

impl From<std::io::Error> for ErrorBuilder {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let kind = match e.kind() {
            IoKind::NotFound => ErrorKind::NotFound,
            IoKind::AlreadyExists => ErrorKind::AlreadyExists,
            IoKind::PermissionDenied => ErrorKind::PermissionDenied,
            IoKind::InvalidData => ErrorKind::DataLoss,
            IoKind::InvalidInput => ErrorKind::InvalidArgument,
            IoKind::TimedOut => ErrorKind::DeadlineExceeded,
            IoKind::UnexpectedEof => ErrorKind::OutOfRange,
            _ => ErrorKind::Unknown,
        };
        ErrorBuilder::from(kind).source(e)
    }
}

impl From<Error> for ErrorBuilder {
    fn from(e: Error) -> Self {
        ErrorBuilder::from(e.kind()).source(e)
    }
}

impl From<ErrorBuilder> for Error {
    fn from(b: ErrorBuilder) -> Self {
        b.build()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        ErrorBuilder::from(e).build()
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind.
    /// Example:
    /// ```
    /// use zangetsu_base::{ErrorKind, ResultExt};
    /// use std::io::Read;
    /// let mut buf = [0u8; 1];
    /// let r = std::io::Cursor::new("").read_exact(&mut buf[..]).err_kind(ErrorKind::Internal);
    /// assert_eq!(r.unwrap_err().kind(), ErrorKind::Internal);
    /// ```
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, e))
    }
}

/// Constructs an [`ErrorBuilder`].
///
/// The first argument is an `ErrorKind` variant name (imported into scope by
/// the macro), an `std::io::Error`, or an existing [`Error`] to re-wrap. It
/// may be followed by `msg(...)` (format string + args) and/or
/// `source(e)` components. Example:
/// ```
/// use zangetsu_base::err;
/// let e = err!(Unauthenticated, msg("unknown user: {}", "slamb")).build();
/// assert_eq!(e.kind(), zangetsu_base::ErrorKind::Unauthenticated);
/// assert_eq!(e.to_string(), "Unauthenticated: unknown user: slamb");
/// ```
#[macro_export]
macro_rules! err {
    ($src:expr $(,)?) => {{
        #[allow(unused_imports)]
        use $crate::ErrorKind::*;
        $crate::ErrorBuilder::from($src)
    }};
    ($src:expr, msg($($marg:tt)*) $(,)?) => {{
        #[allow(unused_imports)]
        use $crate::ErrorKind::*;
        $crate::ErrorBuilder::from($src).msg(format!($($marg)*))
    }};
    ($src:expr, source($serr:expr) $(,)?) => {{
        #[allow(unused_imports)]
        use $crate::ErrorKind::*;
        $crate::ErrorBuilder::from($src).source($serr)
    }};
    ($src:expr, msg($($marg:tt)*), source($serr:expr) $(,)?) => {{
        #[allow(unused_imports)]
        use $crate::ErrorKind::*;
        $crate::ErrorBuilder::from($src)
            .msg(format!($($marg)*))
            .source($serr)
    }};
    ($src:expr, source($serr:expr), msg($($marg:tt)*) $(,)?) => {{
        #[allow(unused_imports)]
        use $crate::ErrorKind::*;
        $crate::ErrorBuilder::from($src)
            .source($serr)
            .msg(format!($($marg)*))
    }};
}

/// Like [`crate::err!`], but returns the built error from the enclosing function.
/// ```
/// use zangetsu_base::bail;
/// let e = || -> Result<(), zangetsu_base::Error> {
///     bail!(Unauthenticated, msg("unknown user: {}", "slamb"));
/// }()
/// .unwrap_err();
/// assert_eq!(e.kind(), zangetsu_base::ErrorKind::Unauthenticated);
/// ```
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => {
        return Err($crate::err!($($t)*).build())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "oh no");
        let e = err!(Internal, msg("outer"), source(io)).build();
        assert_eq!(e.kind(), ErrorKind::Internal);
        assert_eq!(e.msg(), Some("outer"));
        assert_eq!(e.chain().to_string(), "Internal: outer: oh no");
    }

    #[test]
    fn io_kind_mapping() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: Error = err!(io).build();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }
}
