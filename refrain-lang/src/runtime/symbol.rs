//! Interned strings.
//!
//! Every string value in Refrain is a symbol: only one copy of each unique
//! string exists in the garbage collector's string pool, which makes equality
//! checks and hashing pointer comparisons.

use std::cmp::Ordering;
use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::OnceLock;

use refuse::{AnyRef, CollectionGuard, Trace};
use refuse_pool::{RefString, RootString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::runtime::value::ValueFreed;

/// A weak, copyable handle to an interned string.
///
/// Values store strings as [`SymbolRef`]s. The string stays alive as long as
/// the value is reachable by the garbage collector.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Trace)]
pub struct SymbolRef(RefString);

impl SymbolRef {
    /// Returns the string, or `None` if it has been collected.
    #[must_use]
    pub fn load<'guard>(&self, guard: &'guard CollectionGuard<'_>) -> Option<&'guard str> {
        self.0.load(guard)
    }

    /// Returns the string, or [`ValueFreed`] if it has been collected.
    pub fn try_load<'guard>(
        &self,
        guard: &'guard CollectionGuard<'_>,
    ) -> Result<&'guard str, ValueFreed> {
        self.load(guard).ok_or(ValueFreed)
    }

    /// Returns the type-erased reference to the pooled string.
    #[must_use]
    pub fn as_any(&self) -> AnyRef {
        self.0.as_any()
    }

    /// Returns a strong [`Symbol`] for this string.
    pub fn try_upgrade(&self, guard: &CollectionGuard<'_>) -> Result<Symbol, ValueFreed> {
        self.0.as_root(guard).map(Symbol).ok_or(ValueFreed)
    }
}

/// An interned string that keeps its pooled allocation alive.
///
/// Names in bitcode, linked code and module tables are symbols, so they
/// survive collections even when no value refers to them.
#[derive(Clone, Trace)]
pub struct Symbol(RootString);

impl Symbol {
    /// Returns a weak handle to this symbol.
    #[must_use]
    pub const fn downgrade(&self) -> SymbolRef {
        SymbolRef(self.0.downgrade())
    }
}

impl kempt::Sort<SymbolRef> for Symbol {
    fn compare(&self, other: &SymbolRef) -> Ordering {
        self.0.downgrade_any().cmp(&other.0.as_any())
    }
}

impl Eq for Symbol {}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.downgrade() == other.downgrade()
    }
}

impl PartialEq<SymbolRef> for Symbol {
    fn eq(&self, other: &SymbolRef) -> bool {
        self.downgrade() == *other
    }
}

impl PartialEq<Symbol> for SymbolRef {
    fn eq(&self, other: &Symbol) -> bool {
        *self == other.downgrade()
    }
}

impl PartialEq<str> for Symbol {
    fn eq(&self, other: &str) -> bool {
        &**self == other
    }
}

impl PartialEq<&'_ str> for Symbol {
    fn eq(&self, other: &&'_ str) -> bool {
        &**self == *other
    }
}

impl Ord for Symbol {
    fn cmp(&self, other: &Self) -> Ordering {
        self.downgrade().cmp(&other.downgrade())
    }
}

impl PartialOrd for Symbol {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.downgrade().hash(state);
    }
}

impl Deref for Symbol {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&**self, f)
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self)
    }
}

impl From<&'_ str> for Symbol {
    fn from(value: &'_ str) -> Self {
        Self(RootString::from(value))
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Self(RootString::from(value))
    }
}

impl From<&'_ String> for Symbol {
    fn from(value: &'_ String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<&'_ Symbol> for Symbol {
    fn from(value: &'_ Symbol) -> Self {
        value.clone()
    }
}

impl From<&'_ str> for SymbolRef {
    fn from(value: &'_ str) -> Self {
        Self(RefString::from(value))
    }
}

impl From<String> for SymbolRef {
    fn from(value: String) -> Self {
        Self(RefString::from(value))
    }
}

impl From<&'_ String> for SymbolRef {
    fn from(value: &'_ String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<Symbol> for SymbolRef {
    fn from(value: Symbol) -> Self {
        value.downgrade()
    }
}

impl From<&'_ Symbol> for SymbolRef {
    fn from(value: &'_ Symbol) -> Self {
        value.downgrade()
    }
}

/// Converts into an optional [`Symbol`], allowing APIs to accept either a
/// name or `None`.
pub trait IntoOptionSymbol {
    /// Returns the symbol, if any.
    fn into_symbol(self) -> Option<Symbol>;
}

impl<T> IntoOptionSymbol for T
where
    T: Into<Symbol>,
{
    fn into_symbol(self) -> Option<Symbol> {
        Some(self.into())
    }
}

impl IntoOptionSymbol for Option<Symbol> {
    fn into_symbol(self) -> Option<Symbol> {
        self
    }
}

impl Serialize for Symbol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Symbol::from)
    }
}

/// Declares accessors for symbols the virtual machine looks up by name.
macro_rules! well_known {
    ($($name:ident => $string:literal),+ $(,)?) => {
        impl Symbol {
            $(
                #[doc = concat!("Returns the symbol `", $string, "`.")]
                pub fn $name() -> &'static Self {
                    static SYMBOL: OnceLock<Symbol> = OnceLock::new();
                    SYMBOL.get_or_init(|| Symbol::from($string))
                }
            )+
        }
    };
}

well_known!(
    empty => "",
    bind_symbol => "bind",
    concat_symbol => "concat",
    get_symbol => "get",
    kind_symbol => "kind",
    length_symbol => "length",
    message_symbol => "message",
    name_symbol => "name",
    pop_symbol => "pop",
    push_symbol => "push",
    set_symbol => "set",
    value_symbol => "value",
    add_symbol => "+",
    subtract_symbol => "-",
    multiply_symbol => "*",
    divide_symbol => "/",
    remainder_symbol => "%",
    bitwise_and_symbol => "&",
    bitwise_or_symbol => "|",
    bitwise_xor_symbol => "^",
    shift_left_symbol => "<<",
    shift_right_symbol => ">>",
    equal_symbol => "==",
    less_than_symbol => "<",
    less_than_or_equal_symbol => "<=",
    greater_than_symbol => ">",
    greater_than_or_equal_symbol => ">=",
    negate_symbol => "neg",
    not_symbol => "not",
);

#[cfg(test)]
mod tests {
    use super::{Symbol, SymbolRef};

    #[test]
    fn symbols_are_interned() {
        let a = Symbol::from("interned");
        let b = Symbol::from(String::from("interned"));
        assert_eq!(a, b);
        assert_eq!(a, SymbolRef::from("interned"));
        assert_eq!(a, "interned");
        assert_ne!(a, Symbol::from("other"));
    }
}
