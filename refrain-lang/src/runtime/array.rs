//! The built-in array type.

use parking_lot::Mutex;
use refuse::{NoMapping, Trace};

use crate::runtime::value::Value;
use crate::vm::Fault;

/// An ordered, growable list of [`Value`]s.
///
/// A sealed array keeps accepting writes to existing indices, but its length
/// is fixed: pushing and popping both fail.
#[derive(Debug, Default)]
pub struct Array(Mutex<ArrayState>);

#[derive(Debug, Default)]
struct ArrayState {
    values: Vec<Value>,
    sealed: bool,
}

impl Array {
    /// Returns an empty array.
    #[must_use]
    pub const fn new() -> Self {
        Self(Mutex::new(ArrayState {
            values: Vec::new(),
            sealed: false,
        }))
    }

    /// Returns the value at `index`.
    pub fn get(&self, index: i64) -> Result<Value, Fault> {
        let state = self.0.lock();
        let index = Self::checked_index(index, state.values.len())?;
        Ok(state.values[index])
    }

    /// Replaces the value at `index` with `value`, returning the previous
    /// value.
    pub fn set(&self, index: i64, value: Value) -> Result<Value, Fault> {
        let mut state = self.0.lock();
        let index = Self::checked_index(index, state.values.len())?;
        Ok(std::mem::replace(&mut state.values[index], value))
    }

    /// Appends `value` to the end of this array.
    pub fn push(&self, value: Value) -> Result<(), Fault> {
        let mut state = self.0.lock();
        if state.sealed {
            return Err(Fault::Sealed);
        }
        state.values.push(value);
        Ok(())
    }

    /// Removes and returns the last value in this array.
    pub fn pop(&self) -> Result<Option<Value>, Fault> {
        let mut state = self.0.lock();
        if state.sealed {
            return Err(Fault::Sealed);
        }
        Ok(state.values.pop())
    }

    /// Returns the number of values in this array.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().values.len()
    }

    /// Returns true if this array contains no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixes the length of this array.
    pub fn seal(&self) {
        self.0.lock().sealed = true;
    }

    /// Returns true if this array has been sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.0.lock().sealed
    }

    /// Returns a copy of the contained values.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.lock().values.clone()
    }

    fn checked_index(index: i64, len: usize) -> Result<usize, Fault> {
        usize::try_from(index)
            .ok()
            .filter(|index| *index < len)
            .ok_or(Fault::OutOfBounds)
    }
}

impl From<Vec<Value>> for Array {
    fn from(values: Vec<Value>) -> Self {
        Self(Mutex::new(ArrayState {
            values,
            sealed: false,
        }))
    }
}

impl Trace for Array {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        for value in &self.0.lock().values {
            value.trace(tracer);
        }
    }
}

impl NoMapping for Array {}
