//! Argument vectors built at call sites.

use kempt::Map;
use refuse::{AnyRef, Trace};

use crate::runtime::symbol::SymbolRef;
use crate::runtime::value::Value;

/// The arguments of a single call: ordered positionals and named keywords.
///
/// A call site builds an argument vector one append at a time and the call
/// consumes it.
#[derive(Debug, Default, Clone)]
pub struct ArgumentVector {
    positional: Vec<Value>,
    keywords: Map<SymbolRef, Value>,
}

impl ArgumentVector {
    /// Returns an empty argument vector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            positional: Vec::new(),
            keywords: Map::new(),
        }
    }

    /// Appends a positional argument.
    pub fn push(&mut self, value: Value) {
        self.positional.push(value);
    }

    /// Sets the keyword argument `name`, replacing any previous value.
    pub fn push_keyword(&mut self, name: SymbolRef, value: Value) {
        self.keywords.insert(name, value);
    }

    /// Appends a positional argument and returns self.
    #[must_use]
    pub fn with(mut self, value: impl Into<Value>) -> Self {
        self.push(value.into());
        self
    }

    /// Sets a keyword argument and returns self.
    #[must_use]
    pub fn with_keyword(mut self, name: impl Into<SymbolRef>, value: impl Into<Value>) -> Self {
        self.push_keyword(name.into(), value.into());
        self
    }

    /// Returns the positional arguments.
    #[must_use]
    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    /// Returns the keyword argument `name`, if provided.
    #[must_use]
    pub fn keyword(&self, name: SymbolRef) -> Option<Value> {
        self.keywords.get(&name).copied()
    }

    /// Returns an iterator over the keyword arguments.
    pub fn keywords(&self) -> impl Iterator<Item = (SymbolRef, Value)> + '_ {
        self.keywords.iter().map(|field| (*field.key(), field.value))
    }

    /// Returns true if any keyword arguments were provided.
    #[must_use]
    pub fn has_keywords(&self) -> bool {
        !self.keywords.is_empty()
    }

    /// Splits this vector into its positional and keyword arguments.
    #[must_use]
    pub fn into_parts(self) -> (Vec<Value>, Map<SymbolRef, Value>) {
        (self.positional, self.keywords)
    }

    /// Returns every allocation these arguments refer to, including keyword
    /// names.
    pub(crate) fn allocations(&self) -> impl Iterator<Item = AnyRef> + '_ {
        self.positional
            .iter()
            .filter_map(Value::as_any_ref)
            .chain(self.keywords.iter().flat_map(|field| {
                std::iter::once(field.key().as_any()).chain(field.value.as_any_ref())
            }))
    }
}

impl<T, const N: usize> From<[T; N]> for ArgumentVector
where
    T: Into<Value>,
{
    fn from(values: [T; N]) -> Self {
        Self {
            positional: values.into_iter().map(T::into).collect(),
            keywords: Map::new(),
        }
    }
}

impl Trace for ArgumentVector {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        for allocation in self.allocations() {
            tracer.mark(allocation);
        }
    }
}
