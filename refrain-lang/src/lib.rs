//! The execution core of the Refrain language: runtime values, a linker for
//! bitcode, a binary module format, and a garbage-collected virtual machine.

macro_rules! impl_from {
    ($on:ty, $from:ty, $variant:ident) => {
        impl From<$from> for $on {
            fn from(value: $from) -> Self {
                Self::$variant(value.into())
            }
        }
    };
}

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;
#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

pub mod runtime;
pub mod vm;

#[cfg(test)]
mod tests;

use std::fmt::Display;

pub use refuse;
use refuse::Trace;
use vm::module::FinderError;
use vm::{ExecutionError, LinkError};

/// Summarizes an error's kind.
pub trait ErrorKind {
    /// Returns the summary of the error being raised.
    fn kind(&self) -> &'static str;
}

/// An error raised while linking, loading, or executing Refrain code.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Bitcode or a compiled artifact could not be linked.
    Link(LinkError),
    /// A module could not be located or compiled.
    Module(FinderError),
    /// An execution error.
    Execution(ExecutionError),
}

impl_from!(Error, LinkError, Link);
impl_from!(Error, FinderError, Module);
impl_from!(Error, ExecutionError, Execution);

impl ErrorKind for Error {
    fn kind(&self) -> &'static str {
        match self {
            Error::Link(err) => err.kind(),
            Error::Module(err) => err.kind(),
            Error::Execution(err) => err.kind(),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Link(err) => Display::fmt(err, f),
            Error::Module(err) => Display::fmt(err, f),
            Error::Execution(err) => Display::fmt(err, f),
        }
    }
}

impl std::error::Error for Error {}

impl Trace for Error {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        if let Error::Execution(err) = self {
            err.trace(tracer);
        }
    }
}
