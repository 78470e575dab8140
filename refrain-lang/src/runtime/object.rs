//! Objects: collections of named attributes.

use kempt::Map;
use parking_lot::{Mutex, MutexGuard};
use refuse::{NoMapping, Trace};

use crate::runtime::symbol::SymbolRef;
use crate::runtime::value::Value;
use crate::vm::module::ModuleId;
use crate::vm::Fault;

/// A mutable collection of named attributes.
///
/// Each attribute can independently be:
///
/// - *const*: it accepts exactly one assignment.
/// - *locked*: it rejects every write.
/// - *exported*: it is visible to code executing in other modules. This only
///   has an effect on module objects.
///
/// A sealed object rejects new attributes while still allowing existing,
/// writable attributes to change.
#[derive(Debug)]
pub struct Object {
    module: Option<ModuleId>,
    state: Mutex<ObjectState>,
}

#[derive(Debug, Default)]
struct ObjectState {
    attributes: Map<SymbolRef, Attribute>,
    sealed: bool,
    initializing: bool,
}

#[derive(Debug, Clone, Copy)]
struct Attribute {
    value: Value,
    assigned: bool,
    constant: bool,
    exported: bool,
    locked: bool,
}

impl Attribute {
    const fn new(value: Value) -> Self {
        Self {
            value,
            assigned: true,
            constant: false,
            exported: false,
            locked: false,
        }
    }
}

impl Object {
    /// Returns a new, empty object.
    #[must_use]
    pub fn new() -> Self {
        Self {
            module: None,
            state: Mutex::new(ObjectState::default()),
        }
    }

    /// Returns the object that holds the declarations of `module`.
    ///
    /// Attributes of module objects are only visible to code executing in
    /// other modules once exported.
    #[must_use]
    pub fn for_module(module: ModuleId) -> Self {
        Self {
            module: Some(module),
            state: Mutex::new(ObjectState {
                initializing: true,
                ..ObjectState::default()
            }),
        }
    }

    /// Returns the module this object belongs to, if it is a module object.
    #[must_use]
    pub const fn module(&self) -> Option<ModuleId> {
        self.module
    }

    fn state(&self) -> MutexGuard<'_, ObjectState> {
        self.state.lock()
    }

    fn check_access(&self, attribute: &Attribute, caller: Option<ModuleId>) -> Result<(), Fault> {
        match self.module {
            Some(module) if caller != Some(module) && !attribute.exported => Err(Fault::Forbidden),
            _ => Ok(()),
        }
    }

    /// Returns the value of the attribute `name`, as visible to code executing
    /// in `caller`.
    pub fn get(&self, name: SymbolRef, caller: Option<ModuleId>) -> Result<Value, Fault> {
        let state = self.state();
        match state.attributes.get(&name) {
            Some(attribute) => {
                self.check_access(attribute, caller)?;
                if attribute.assigned {
                    Ok(attribute.value)
                } else {
                    Err(Fault::Uninitialized)
                }
            }
            None if state.initializing => Err(Fault::Uninitialized),
            None => Err(Fault::UnknownAttribute),
        }
    }

    /// Returns the value of `name` if it exists, ignoring access rules.
    #[must_use]
    pub fn lookup(&self, name: SymbolRef) -> Option<Value> {
        self.state()
            .attributes
            .get(&name)
            .filter(|attribute| attribute.assigned)
            .map(|attribute| attribute.value)
    }

    /// Assigns `value` to the attribute `name`, creating it if needed.
    pub fn set(&self, name: SymbolRef, value: Value, caller: Option<ModuleId>) -> Result<(), Fault> {
        let mut state = self.state();
        let sealed = state.sealed;
        match state.attributes.get_mut(&name) {
            Some(attribute) => {
                self.check_access(attribute, caller)?;
                if attribute.locked {
                    Err(Fault::Locked)
                } else if attribute.constant && attribute.assigned {
                    Err(Fault::Immutable)
                } else {
                    attribute.value = value;
                    attribute.assigned = true;
                    Ok(())
                }
            }
            None if sealed => Err(Fault::Sealed),
            None => {
                if self.module.is_some_and(|module| caller != Some(module)) {
                    return Err(Fault::Forbidden);
                }
                state.attributes.insert(name, Attribute::new(value));
                Ok(())
            }
        }
    }

    /// Defines `name` as a const attribute containing `value`.
    ///
    /// An existing const attribute that has not yet been assigned receives
    /// `value` as its single assignment.
    pub fn declare_const(
        &self,
        name: SymbolRef,
        value: Value,
        caller: Option<ModuleId>,
    ) -> Result<(), Fault> {
        let mut state = self.state();
        let sealed = state.sealed;
        match state.attributes.get_mut(&name) {
            Some(attribute) => {
                self.check_access(attribute, caller)?;
                if attribute.locked {
                    Err(Fault::Locked)
                } else if attribute.constant && attribute.assigned {
                    Err(Fault::Immutable)
                } else {
                    attribute.value = value;
                    attribute.assigned = true;
                    attribute.constant = true;
                    Ok(())
                }
            }
            None if sealed => Err(Fault::Sealed),
            None => {
                if self.module.is_some_and(|module| caller != Some(module)) {
                    return Err(Fault::Forbidden);
                }
                state.attributes.insert(
                    name,
                    Attribute {
                        constant: true,
                        ..Attribute::new(value)
                    },
                );
                Ok(())
            }
        }
    }

    /// Reserves `name` as a const attribute that has not been assigned.
    ///
    /// Reading the attribute before its assignment raises
    /// [`Fault::Uninitialized`].
    pub fn reserve_const(&self, name: SymbolRef) -> Result<(), Fault> {
        let mut state = self.state();
        if state.attributes.contains(&name) {
            return Err(Fault::Immutable);
        } else if state.sealed {
            return Err(Fault::Sealed);
        }
        state.attributes.insert(
            name,
            Attribute {
                assigned: false,
                constant: true,
                ..Attribute::new(Value::Null)
            },
        );
        Ok(())
    }

    /// Makes `name` visible to code running in other modules.
    pub fn export(&self, name: SymbolRef, caller: Option<ModuleId>) -> Result<(), Fault> {
        self.update_flags(name, caller, |attribute| attribute.exported = true)
    }

    /// Prevents any further writes to `name`.
    pub fn lock(&self, name: SymbolRef, caller: Option<ModuleId>) -> Result<(), Fault> {
        self.update_flags(name, caller, |attribute| attribute.locked = true)
    }

    fn update_flags(
        &self,
        name: SymbolRef,
        caller: Option<ModuleId>,
        update: impl FnOnce(&mut Attribute),
    ) -> Result<(), Fault> {
        let mut state = self.state();
        let attribute = state
            .attributes
            .get_mut(&name)
            .ok_or(Fault::UnknownAttribute)?;
        if self.module.is_some_and(|module| caller != Some(module)) {
            return Err(Fault::Forbidden);
        }
        update(attribute);
        Ok(())
    }

    /// Returns true if `name` is exported.
    #[must_use]
    pub fn is_exported(&self, name: SymbolRef) -> bool {
        self.state()
            .attributes
            .get(&name)
            .is_some_and(|attribute| attribute.exported)
    }

    /// Prevents new attributes from being added to this object.
    pub fn seal(&self) {
        self.state().sealed = true;
    }

    /// Returns true if this object has been sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.state().sealed
    }

    /// Returns the number of attributes on this object.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().attributes.len()
    }

    /// Returns true if this object has no attributes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the names of every attribute in this object.
    #[must_use]
    pub fn names(&self) -> Vec<SymbolRef> {
        self.state()
            .attributes
            .iter()
            .map(|field| *field.key())
            .collect()
    }

    pub(crate) fn finish_initializing(&self) {
        self.state().initializing = false;
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

impl Trace for Object {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        for field in &self.state().attributes {
            field.key().trace(tracer);
            field.value.value.trace(tracer);
        }
    }
}

impl NoMapping for Object {}
