//! Error envelopes.

use refuse::{NoMapping, Trace};

use crate::runtime::symbol::Symbol;
use crate::runtime::value::Value;
use crate::vm::StackFrame;

/// The category of a raised error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorCategory {
    /// A value raised by a `Throw` instruction.
    Thrown,
    /// Arguments did not match a callable's signature.
    Binding,
    /// An attribute or element could not be read or written.
    Attribute,
    /// An operator was applied to unsupported operands.
    Operator,
    /// A module could not be loaded.
    Module,
    /// The call stack exceeded its configured depth.
    Stack,
}

impl ErrorCategory {
    /// Returns the name of this category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Thrown => "thrown",
            ErrorCategory::Binding => "binding",
            ErrorCategory::Attribute => "attribute",
            ErrorCategory::Operator => "operator",
            ErrorCategory::Module => "module",
            ErrorCategory::Stack => "stack",
        }
    }
}

/// A raised value along with where it was raised.
#[derive(Debug)]
pub struct Exception {
    value: Value,
    category: ErrorCategory,
    message: Symbol,
    backtrace: Vec<StackFrame>,
}

impl Exception {
    /// Returns an envelope for `value`.
    #[must_use]
    pub fn new(
        value: Value,
        category: ErrorCategory,
        message: impl Into<Symbol>,
        backtrace: Vec<StackFrame>,
    ) -> Self {
        Self {
            value,
            category,
            message: message.into(),
            backtrace,
        }
    }

    /// Returns the raised value.
    #[must_use]
    pub const fn value(&self) -> Value {
        self.value
    }

    /// Returns the category of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.category
    }

    /// Returns a human readable description of this error.
    #[must_use]
    pub const fn message(&self) -> &Symbol {
        &self.message
    }

    /// Returns the frames that were executing when this error was raised,
    /// outermost first.
    #[must_use]
    pub fn backtrace(&self) -> &[StackFrame] {
        &self.backtrace
    }
}

impl Trace for Exception {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        self.value.trace(tracer);
    }
}

impl NoMapping for Exception {}
