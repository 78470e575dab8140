//! Data-record templates: factories for objects with a fixed set of methods.

use refuse::{ContainsNoRefs, NoMapping};

use crate::runtime::symbol::Symbol;
use crate::vm::code::Code;
use crate::vm::module::ModuleId;

/// A named factory for objects.
///
/// Calling a template constructs a new object whose attributes are the
/// keyword arguments of the call and whose methods are bound to the new
/// instance. Instances of sealed templates are sealed.
#[derive(Debug, Clone)]
pub struct Template {
    name: Symbol,
    sealed: bool,
    methods: Vec<(Symbol, Code)>,
    module: ModuleId,
}

impl Template {
    /// Returns a new template declared in `module`.
    #[must_use]
    pub fn new(name: Symbol, sealed: bool, methods: Vec<(Symbol, Code)>, module: ModuleId) -> Self {
        Self {
            name,
            sealed,
            methods,
            module,
        }
    }

    /// Returns the name of this template.
    #[must_use]
    pub const fn name(&self) -> &Symbol {
        &self.name
    }

    /// Returns true if instances of this template are sealed.
    #[must_use]
    pub const fn sealed(&self) -> bool {
        self.sealed
    }

    /// Returns the methods attached to each instance.
    #[must_use]
    pub fn methods(&self) -> &[(Symbol, Code)] {
        &self.methods
    }

    /// Returns the module this template was declared in.
    #[must_use]
    pub const fn module(&self) -> ModuleId {
        self.module
    }
}

impl ContainsNoRefs for Template {}

impl NoMapping for Template {}
