//! The dynamically typed [`Value`] that every instruction operates on.

use std::cmp::Ordering;
use std::fmt::Debug;

use refuse::{AnyRef, CollectionGuard, Ref, Trace};

use crate::runtime::array::Array;
use crate::runtime::exception::Exception;
use crate::runtime::function::{CodeObject, Function};
use crate::runtime::object::Object;
use crate::runtime::symbol::{Symbol, SymbolRef};
use crate::runtime::template::Template;
use crate::vm::Fault;

/// A Refrain value.
///
/// Primitives are stored inline. Composite values are references into the
/// garbage collector, so copying a [`Value`] never copies the referenced
/// data.
#[derive(Clone, Copy)]
pub enum Value {
    /// The absence of a value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed 64-bit integer.
    Int(i64),
    /// A 64-bit floating point number.
    Float(f64),
    /// An interned string.
    String(SymbolRef),
    /// An ordered list of values.
    Array(Ref<Array>),
    /// A collection of named attributes.
    Object(Ref<Object>),
    /// A factory for objects with a fixed set of methods.
    Template(Ref<Template>),
    /// A compiled function body that has not been instantiated.
    Code(Ref<CodeObject>),
    /// A callable value.
    Function(Ref<Function>),
    /// An error envelope produced by a raise.
    Error(Ref<Exception>),
}

impl Value {
    /// Returns a string value containing `text`.
    #[must_use]
    pub fn string(text: impl Into<SymbolRef>) -> Self {
        Self::String(text.into())
    }

    /// Returns true if this value is [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns this value as an `i64`, if it is an integer.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns this value as an `f64`, converting integers.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns this value as a `bool`, if it is a boolean.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the contained string reference, if this is a string.
    #[must_use]
    pub const fn as_symbol_ref(&self) -> Option<SymbolRef> {
        match self {
            Value::String(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the contained string, if this is a string that is still
    /// allocated.
    #[must_use]
    pub fn as_str<'guard>(&self, guard: &'guard CollectionGuard<'_>) -> Option<&'guard str> {
        match self {
            Value::String(value) => value.load(guard),
            _ => None,
        }
    }

    /// Returns the allocation this value refers to, or `None` for
    /// primitives.
    #[must_use]
    pub fn as_any_ref(&self) -> Option<AnyRef> {
        match self {
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) => None,
            Value::String(value) => Some(value.as_any()),
            Value::Array(value) => Some(AnyRef::from(*value)),
            Value::Object(value) => Some(AnyRef::from(*value)),
            Value::Template(value) => Some(AnyRef::from(*value)),
            Value::Code(value) => Some(AnyRef::from(*value)),
            Value::Function(value) => Some(AnyRef::from(*value)),
            Value::Error(value) => Some(AnyRef::from(*value)),
        }
    }

    /// Returns the referenced object, if this is an object.
    #[must_use]
    pub const fn as_object(&self) -> Option<Ref<Object>> {
        match self {
            Value::Object(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the referenced array, if this is an array.
    #[must_use]
    pub const fn as_array(&self) -> Option<Ref<Array>> {
        match self {
            Value::Array(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the referenced function, if this is a function.
    #[must_use]
    pub const fn as_function(&self) -> Option<Ref<Function>> {
        match self {
            Value::Function(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the referenced error envelope, if this is an error.
    #[must_use]
    pub const fn as_error(&self) -> Option<Ref<Exception>> {
        match self {
            Value::Error(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the name of this value's type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Template(_) => "template",
            Value::Code(_) => "code",
            Value::Function(_) => "function",
            Value::Error(_) => "error",
        }
    }

    /// Returns true if this value is considered true in a conditional.
    ///
    /// `null`, `false`, zero, and the empty string are false. Every composite
    /// value is true.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(value) => *value,
            Value::Int(value) => *value != 0,
            Value::Float(value) => *value != 0.0,
            Value::String(value) => *value != *Symbol::empty(),
            Value::Array(_)
            | Value::Object(_)
            | Value::Template(_)
            | Value::Code(_)
            | Value::Function(_)
            | Value::Error(_) => true,
        }
    }

    /// Compares two values for equality without consulting operator
    /// overloads.
    ///
    /// Numbers compare by numeric value across integers and floats, strings
    /// compare by contents, and composite values compare by identity.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Template(a), Value::Template(b)) => a == b,
            (Value::Code(a), Value::Code(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }

    /// Orders two values.
    ///
    /// Returns `Ok(None)` when both values are numbers but cannot be ordered,
    /// which happens when either is `NaN`.
    #[allow(clippy::cast_precision_loss)]
    pub fn compare(
        &self,
        other: &Value,
        guard: &CollectionGuard<'_>,
    ) -> Result<Option<Ordering>, Fault> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(Some(a.cmp(b))),
            (Value::Float(a), Value::Float(b)) => Ok(a.partial_cmp(b)),
            (Value::Int(a), Value::Float(b)) => Ok((*a as f64).partial_cmp(b)),
            (Value::Float(a), Value::Int(b)) => Ok(a.partial_cmp(&(*b as f64))),
            (Value::String(a), Value::String(b)) => {
                let a = a.try_load(guard)?;
                let b = b.try_load(guard)?;
                Ok(Some(a.cmp(b)))
            }
            (Value::Bool(a), Value::Bool(b)) => Ok(Some(a.cmp(b))),
            _ => Err(Fault::UnsupportedOperation),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) => false,
            _ => self.equals(other),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(value) => f.debug_tuple("Bool").field(value).finish(),
            Value::Int(value) => f.debug_tuple("Int").field(value).finish(),
            Value::Float(value) => f.debug_tuple("Float").field(value).finish(),
            Value::String(value) => f.debug_tuple("String").field(value).finish(),
            other => write!(f, "{}(..)", other.type_name()),
        }
    }
}

impl Trace for Value {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        if let Some(allocation) = self.as_any_ref() {
            tracer.mark(allocation);
        }
    }
}

macro_rules! impl_value_from {
    ($from:ty, $variant:ident) => {
        impl From<$from> for Value {
            fn from(value: $from) -> Self {
                Self::$variant(value.into())
            }
        }
    };
}

impl_value_from!(bool, Bool);
impl_value_from!(i64, Int);
impl_value_from!(i32, Int);
impl_value_from!(u32, Int);
impl_value_from!(f64, Float);
impl_value_from!(SymbolRef, String);
impl_value_from!(&'_ Symbol, String);
impl_value_from!(&'_ str, String);
impl_value_from!(Ref<Array>, Array);
impl_value_from!(Ref<Object>, Object);
impl_value_from!(Ref<Function>, Function);
impl_value_from!(Ref<Exception>, Error);

impl From<()> for Value {
    fn from((): ()) -> Self {
        Self::Null
    }
}

/// A value was freed by the garbage collector while it was still being used.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ValueFreed;

impl From<ValueFreed> for Fault {
    fn from(_: ValueFreed) -> Self {
        Self::ValueFreed
    }
}
