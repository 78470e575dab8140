//! Callable values.

use std::fmt::Debug;
use std::sync::Arc;

use refuse::{ContainsNoRefs, NoMapping, Ref, Trace};

use crate::runtime::args::ArgumentVector;
use crate::runtime::cell::Cell;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::Value;
use crate::vm::code::Code;
use crate::vm::module::ModuleId;
use crate::vm::{Fault, FiberContext};

/// A linked [`Code`] body stored in the garbage collector so it can be
/// referenced by a [`Value`].
#[derive(Debug, Clone)]
pub struct CodeObject(pub Code);

impl ContainsNoRefs for CodeObject {}

impl NoMapping for CodeObject {}

/// A function implemented in Rust.
///
/// Native functions receive the executing fiber, the receiver the function
/// was called with, and the call's arguments.
#[derive(Clone)]
pub struct NativeFunction {
    name: Option<Symbol>,
    function: Arc<NativeFn>,
}

type NativeFn = dyn Fn(&mut FiberContext<'_, '_>, Value, ArgumentVector) -> Result<Value, Fault>
    + Send
    + Sync;

impl NativeFunction {
    /// Returns a native function that executes `function` when invoked.
    pub fn new<F>(name: impl Into<Symbol>, function: F) -> Self
    where
        F: Fn(&mut FiberContext<'_, '_>, Value, ArgumentVector) -> Result<Value, Fault>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: Some(name.into()),
            function: Arc::new(function),
        }
    }

    /// Returns the name of this function.
    #[must_use]
    pub const fn name(&self) -> Option<&Symbol> {
        self.name.as_ref()
    }

    pub(crate) fn invoke(
        &self,
        context: &mut FiberContext<'_, '_>,
        receiver: Value,
        args: ArgumentVector,
    ) -> Result<Value, Fault> {
        (self.function)(context, receiver, args)
    }
}

impl Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The implementation of a [`Function`].
#[derive(Debug, Clone)]
pub enum FunctionBody {
    /// A linked code body and the cells it captured when it was
    /// instantiated, in the order of the code's capture list.
    Interpreted {
        /// The code to execute.
        code: Code,
        /// The captured variable cells.
        captures: Arc<[Ref<Cell>]>,
    },
    /// A function implemented in Rust.
    Native(NativeFunction),
}

/// A callable value: a function body bound to a receiver.
#[derive(Debug, Clone)]
pub struct Function {
    module: Option<ModuleId>,
    receiver: Value,
    body: FunctionBody,
}

impl Function {
    /// Returns an interpreted function executing `code` within `module`.
    #[must_use]
    pub fn interpreted(
        module: ModuleId,
        code: Code,
        captures: impl Into<Arc<[Ref<Cell>]>>,
        receiver: Value,
    ) -> Self {
        Self {
            module: Some(module),
            receiver,
            body: FunctionBody::Interpreted {
                code,
                captures: captures.into(),
            },
        }
    }

    /// Returns a function that executes `function` when called.
    #[must_use]
    pub fn native(function: NativeFunction) -> Self {
        Self {
            module: None,
            receiver: Value::Null,
            body: FunctionBody::Native(function),
        }
    }

    /// Returns a native function that belongs to `module`.
    #[must_use]
    pub fn native_in(module: ModuleId, function: NativeFunction) -> Self {
        Self {
            module: Some(module),
            ..Self::native(function)
        }
    }

    /// Returns a new function sharing this function's body and captured cells
    /// with `receiver` bound.
    #[must_use]
    pub fn bind(&self, receiver: Value) -> Self {
        Self {
            module: self.module,
            receiver,
            body: self.body.clone(),
        }
    }

    /// Returns the module this function was defined in.
    #[must_use]
    pub const fn module(&self) -> Option<ModuleId> {
        self.module
    }

    /// Returns the receiver bound to this function.
    #[must_use]
    pub const fn receiver(&self) -> Value {
        self.receiver
    }

    /// Returns this function's body.
    #[must_use]
    pub const fn body(&self) -> &FunctionBody {
        &self.body
    }

    /// Returns the name of this function.
    #[must_use]
    pub fn name(&self) -> Option<&Symbol> {
        match &self.body {
            FunctionBody::Interpreted { code, .. } => code.name(),
            FunctionBody::Native(native) => native.name(),
        }
    }
}

impl Trace for Function {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        self.receiver.trace(tracer);
        if let FunctionBody::Interpreted { captures, .. } = &self.body {
            for cell in captures.iter() {
                tracer.mark(*cell);
            }
        }
    }
}

impl NoMapping for Function {}
