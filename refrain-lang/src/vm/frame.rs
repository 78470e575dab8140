use std::fmt::Debug;
use std::sync::Arc;

use ahash::AHashSet;
use refuse::{AnyRef, CollectionGuard, Ref};

use crate::runtime::args::ArgumentVector;
use crate::runtime::array::Array;
use crate::runtime::cell::Cell;
use crate::runtime::function::Function;
use crate::runtime::object::Object;
use crate::runtime::symbol::SymbolRef;
use crate::runtime::value::Value;
use crate::vm::code::{Code, Signature, SourceRange};
use crate::vm::module::ModuleId;
use crate::vm::Fault;

/// A frame of a backtrace: the code that was executing and the instruction
/// within it.
#[derive(Clone, PartialEq)]
pub struct StackFrame {
    code: Code,
    instruction: usize,
}

impl StackFrame {
    pub(crate) const fn new(code: Code, instruction: usize) -> Self {
        Self { code, instruction }
    }

    /// Returns the code that was executing.
    #[must_use]
    pub const fn code(&self) -> &Code {
        &self.code
    }

    /// Returns the index of the instruction that was executing.
    #[must_use]
    pub const fn instruction(&self) -> usize {
        self.instruction
    }

    /// Returns the source range of the instruction, if it is still within
    /// the code.
    #[must_use]
    pub fn source_range(&self) -> Option<SourceRange> {
        self.code.source_range(self.instruction)
    }
}

impl Debug for StackFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackFrame")
            .field("code", &self.code.name())
            .field("instruction", &self.instruction)
            .field("range", &self.source_range())
            .finish()
    }
}

/// What the caller of a frame receives when it completes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Continuation {
    /// The returned value.
    Return,
    /// The negated truthiness of the returned value.
    Not,
    /// Finishes loading a module. When `object` is true the caller receives
    /// the module object instead of the returned value.
    Module { id: ModuleId, object: bool },
}

/// Where an interpreted frame's function lives: its module, that module's
/// runtime constants, and its global object.
#[derive(Clone)]
pub(crate) struct Scope {
    pub(crate) module: ModuleId,
    pub(crate) constants: Arc<[Value]>,
    pub(crate) globals: Ref<Object>,
}

pub(crate) struct Frame {
    pub(crate) function: Ref<Function>,
    pub(crate) code: Code,
    pub(crate) scope: Scope,
    pub(crate) captures: Arc<[Ref<Cell>]>,
    pub(crate) slots: Vec<Value>,
    pub(crate) cells: Vec<Option<Ref<Cell>>>,
    pub(crate) stack: Vec<Value>,
    pub(crate) args: Vec<ArgumentVector>,
    pub(crate) instruction: usize,
    pub(crate) pending_error: Option<Value>,
    pub(crate) continuation: Continuation,
}

impl Frame {
    /// Binds `args` to the parameters of `code`, returning the frame ready to
    /// execute its first instruction.
    ///
    /// Every check happens before anything is allocated, so a binding failure
    /// has no side effects.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn bind(
        function: Ref<Function>,
        code: Code,
        captures: Arc<[Ref<Cell>]>,
        scope: Scope,
        receiver: Value,
        args: &ArgumentVector,
        guard: &CollectionGuard<'_>,
    ) -> Result<Self, Fault> {
        let signature = code.signature();
        check_arguments(&code, signature, args)?;

        let mut slots = vec![Value::Null; signature.parameter_slots().max(Signature::FIRST_PARAMETER)];
        slots[Signature::CALLABLE_SLOT] = Value::Function(function);
        slots[Signature::RECEIVER_SLOT] = receiver;

        let required = signature.positional_count();
        let (positional, extra) = args.positional().split_at(required);
        slots[Signature::FIRST_PARAMETER..Signature::FIRST_PARAMETER + required]
            .copy_from_slice(positional);
        if let Some(slot) = signature.variadic_positional_slot() {
            slots[slot] = Value::Array(Ref::new(Array::from(extra.to_vec()), guard));
        }

        let mut extra_keywords = Vec::new();
        for (name, value) in args.keywords() {
            match code.keyword_slot(&name) {
                Some(slot) => slots[slot] = value,
                None => extra_keywords.push((name, value)),
            }
        }
        if let Some(slot) = signature.variadic_keyword_slot() {
            let object = Object::new();
            for (name, value) in extra_keywords {
                object.set(name, value, None)?;
            }
            slots[slot] = Value::Object(Ref::new(object, guard));
        }

        Ok(Self {
            function,
            code,
            scope,
            captures,
            slots,
            cells: Vec::new(),
            stack: Vec::new(),
            args: Vec::new(),
            instruction: 0,
            pending_error: None,
            continuation: Continuation::Return,
        })
    }

    pub(crate) fn with_continuation(mut self, continuation: Continuation) -> Self {
        self.continuation = continuation;
        self
    }

    pub(crate) fn receiver(&self) -> Value {
        self.slots
            .get(Signature::RECEIVER_SLOT)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Result<Value, Fault> {
        self.stack.pop().ok_or(Fault::InvalidInstruction)
    }

    pub(crate) fn peek(&self) -> Result<Value, Fault> {
        self.stack.last().copied().ok_or(Fault::InvalidInstruction)
    }

    pub(crate) fn constant(&self, index: usize) -> Result<Value, Fault> {
        self.scope
            .constants
            .get(index)
            .copied()
            .ok_or(Fault::InvalidInstruction)
    }

    pub(crate) fn name(&self, index: usize) -> Result<SymbolRef, Fault> {
        self.constant(index)?
            .as_symbol_ref()
            .ok_or(Fault::InvalidInstruction)
    }

    pub(crate) fn local(&self, slot: usize) -> Value {
        self.slots.get(slot).copied().unwrap_or_default()
    }

    pub(crate) fn set_local(&mut self, slot: usize, value: Value) {
        if slot >= self.slots.len() {
            self.slots.resize(slot + 1, Value::Null);
        }
        self.slots[slot] = value;
    }

    /// Returns the cell holding the captured local `slot`, creating it from
    /// the slot's current value on first use.
    pub(crate) fn cell(&mut self, slot: usize, guard: &CollectionGuard<'_>) -> Ref<Cell> {
        if let Some(Some(cell)) = self.cells.get(slot) {
            return *cell;
        }
        self.new_cell(slot, self.local(slot), guard)
    }

    /// Starts a new instance of the captured local `slot`.
    pub(crate) fn new_cell(&mut self, slot: usize, value: Value, guard: &CollectionGuard<'_>) -> Ref<Cell> {
        let cell = Ref::new(Cell::new(value), guard);
        if slot >= self.cells.len() {
            self.cells.resize(slot + 1, None);
        }
        self.cells[slot] = Some(cell);
        cell
    }

    pub(crate) fn capture(&self, index: usize) -> Result<Ref<Cell>, Fault> {
        self.captures
            .get(index)
            .copied()
            .ok_or(Fault::InvalidInstruction)
    }

    pub(crate) fn args_mut(&mut self) -> Result<&mut ArgumentVector, Fault> {
        self.args.last_mut().ok_or(Fault::InvalidInstruction)
    }

    pub(crate) fn take_args(&mut self) -> Result<ArgumentVector, Fault> {
        self.args.pop().ok_or(Fault::InvalidInstruction)
    }

    /// Continues at this instruction's error handler with `error` pending.
    ///
    /// Returns false if the current instruction is not protected.
    pub(crate) fn handle(&mut self, error: Value) -> bool {
        let Some(handler) = self
            .code
            .instructions()
            .get(self.instruction)
            .and_then(|instruction| instruction.handler)
        else {
            return false;
        };
        self.stack.clear();
        self.args.clear();
        self.pending_error = Some(error);
        self.instruction = usize::try_from(handler).unwrap_or(usize::MAX);
        true
    }

    pub(crate) fn stack_frame(&self) -> StackFrame {
        StackFrame::new(self.code.clone(), self.instruction)
    }

    /// Adds every allocation this frame refers to into `found`.
    pub(crate) fn allocations(&self, found: &mut AHashSet<AnyRef>) {
        found.insert(AnyRef::from(self.function));
        found.insert(AnyRef::from(self.scope.globals));
        found.extend(
            self.captures
                .iter()
                .chain(self.cells.iter().flatten())
                .map(|cell| AnyRef::from(*cell)),
        );
        found.extend(
            self.slots
                .iter()
                .chain(&self.stack)
                .chain(self.pending_error.iter())
                .filter_map(Value::as_any_ref),
        );
        for args in &self.args {
            found.extend(args.allocations());
        }
    }
}

fn check_arguments(code: &Code, signature: &Signature, args: &ArgumentVector) -> Result<(), Fault> {
    let required = signature.positional_count();
    let supplied = args.positional().len();
    if supplied < required || (supplied > required && !signature.variadic_positional) {
        return Err(Fault::ArgumentCount);
    }
    if !signature.variadic_keyword {
        for (name, _) in args.keywords() {
            if code.keyword_slot(&name).is_none() {
                return Err(Fault::UnknownKeyword);
            }
        }
    }
    Ok(())
}
