//! Shared storage for captured variables.

use parking_lot::Mutex;
use refuse::{NoMapping, Trace};

use crate::runtime::value::Value;

/// A single mutable slot shared by every closure that captured the same
/// variable instance.
#[derive(Debug, Default)]
pub struct Cell(Mutex<Value>);

impl Cell {
    /// Returns a cell containing `value`.
    #[must_use]
    pub const fn new(value: Value) -> Self {
        Self(Mutex::new(value))
    }

    /// Returns the contained value.
    #[must_use]
    pub fn get(&self) -> Value {
        *self.0.lock()
    }

    /// Stores `value`, returning the previous contents.
    pub fn set(&self, value: Value) -> Value {
        std::mem::replace(&mut *self.0.lock(), value)
    }
}

impl Trace for Cell {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        self.0.lock().trace(tracer);
    }
}

impl NoMapping for Cell {}
