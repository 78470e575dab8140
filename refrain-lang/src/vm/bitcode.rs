//! The unlinked intermediate representation produced by a lowering pass.
//!
//! A [`BitcodeFunction`] is a list of [`Op`]s that may contain [`Label`]
//! pseudo-instructions and declares try regions in terms of labels. Linking
//! resolves every label to an instruction index and produces a
//! [`Code`](crate::vm::code::Code).

use serde::{Deserialize, Serialize};

use crate::runtime::symbol::{IntoOptionSymbol, Symbol};
use crate::vm::code::{link_module, Capture, LinkError, LinkedModule, Signature, SourceRange};

/// A position within a [`BitcodeFunction`] that jumps and try regions can
/// refer to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(pub u32);

/// A literal value loaded by [`Op::LoadConst`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A string.
    String(Symbol),
    /// An uninstantiated function body. Loading it produces a code value.
    Function(BitcodeFunction),
    /// A data-record template.
    Template(BitcodeTemplate),
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Literal {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&'_ str> for Literal {
    fn from(value: &'_ str) -> Self {
        Self::String(Symbol::from(value))
    }
}

impl From<Symbol> for Literal {
    fn from(value: Symbol) -> Self {
        Self::String(value)
    }
}

impl From<BitcodeFunction> for Literal {
    fn from(value: BitcodeFunction) -> Self {
        Self::Function(value)
    }
}

impl From<BitcodeTemplate> for Literal {
    fn from(value: BitcodeTemplate) -> Self {
        Self::Template(value)
    }
}

/// A single unlinked operation.
///
/// Stack effects are listed with the top of the stack rightmost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Marks the location of a label. Labels do not occupy an instruction.
    Label(Label),
    /// Does nothing.
    Nop,
    /// `[v] -> []`
    Pop,
    /// `[v] -> [v v]`
    Dup,
    /// `[a b] -> [b a]`
    Swap,
    /// `[] -> [null]`
    PushNull,
    /// `[] -> [true]`
    PushTrue,
    /// `[] -> [false]`
    PushFalse,
    /// `[] -> [literal]`
    LoadConst(Literal),
    /// `[] -> [slot]`
    LoadLocal(u32),
    /// `[v] -> []`, storing `v` in the slot.
    StoreLocal(u32),
    /// `[] -> [cell]`, reading the cell of a captured local.
    LoadCell(u32),
    /// `[v] -> []`, writing the cell of a captured local.
    StoreCell(u32),
    /// `[v] -> []`, starting a new instance of a captured local.
    NewCell(u32),
    /// `[] -> [capture]`
    LoadCapture(u32),
    /// `[v] -> []`
    StoreCapture(u32),
    /// `[] -> [module.name]`
    LoadGlobal(Symbol),
    /// `[v] -> []`, assigning `module.name`.
    StoreGlobal(Symbol),
    /// `[target] -> [target.name]`
    GetAttr(Symbol),
    /// `[target v] -> []`
    SetAttr(Symbol),
    /// `[target v] -> []`, defining a const attribute.
    DeclareConst(Symbol),
    /// `[target] -> []`, exporting an attribute.
    Export(Symbol),
    /// `[target] -> []`, locking an attribute.
    Lock(Symbol),
    /// `[target] -> [target]`
    Seal,
    /// `[target index] -> [v]`
    GetIndex,
    /// `[target index v] -> []`
    SetIndex,
    /// `[a b] -> [a + b]`
    Add,
    /// `[a b] -> [a - b]`
    Subtract,
    /// `[a b] -> [a * b]`
    Multiply,
    /// `[a b] -> [a / b]`
    Divide,
    /// `[a b] -> [a % b]`
    Remainder,
    /// `[a b] -> [a & b]`
    BitwiseAnd,
    /// `[a b] -> [a | b]`
    BitwiseOr,
    /// `[a b] -> [a ^ b]`
    BitwiseXor,
    /// `[a b] -> [a << b]`
    ShiftLeft,
    /// `[a b] -> [a >> b]`
    ShiftRight,
    /// `[a b] -> [a == b]`
    Equal,
    /// `[a b] -> [a != b]`
    NotEqual,
    /// `[a b] -> [a < b]`
    LessThan,
    /// `[a b] -> [a <= b]`
    LessThanOrEqual,
    /// `[a b] -> [a > b]`
    GreaterThan,
    /// `[a b] -> [a >= b]`
    GreaterThanOrEqual,
    /// `[a] -> [-a]`
    Negate,
    /// `[a] -> [!a]`
    Not,
    /// Continues execution at the label.
    Jump(Label),
    /// `[condition] -> []`, jumping when the condition is truthy.
    JumpIf(Label),
    /// `[condition] -> []`, jumping when the condition is falsey.
    JumpIfNot(Label),
    /// Begins a new argument vector.
    NewArgs,
    /// `[v] -> []`, appending a positional argument.
    PushArg,
    /// `[v] -> []`, appending a keyword argument.
    PushKeyword(Symbol),
    /// `[callable receiver] -> [result]`, consuming the argument vector.
    Call,
    /// `[target] -> [result]`, calling `target.name` with `target` as the
    /// receiver.
    Invoke(Symbol),
    /// `[callable receiver] -> [bound]`
    Bind,
    /// `[] -> [function]`, capturing according to the function's capture
    /// list.
    MakeFunction(BitcodeFunction),
    /// `[] -> [array]` from the positional arguments.
    NewArray,
    /// `[] -> [object]` from the keyword arguments.
    NewObject,
    /// `[] -> [module]`
    LoadModule(Symbol),
    /// `[v] -> ` returns `v`, or null if the stack is empty.
    Return,
    /// `[v] -> ` raises `v`.
    Throw,
    /// `[] -> [error]`, pushing the error being handled.
    PopErr,
}

/// A region of instructions whose raised errors are handled at `catch`.
///
/// The region covers the instructions from `start` up to but not including
/// `end`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct TryRegion {
    /// The first instruction protected.
    pub start: Label,
    /// The instruction after the last protected instruction.
    pub end: Label,
    /// Where execution continues when an error is raised.
    pub catch: Label,
}

/// An unlinked function body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BitcodeFunction {
    /// The name this function is bound to.
    #[serde(default)]
    pub name: Option<Symbol>,
    /// The parameters this function accepts.
    #[serde(default)]
    pub signature: Signature,
    /// The variables of the enclosing function this function captures.
    #[serde(default)]
    pub captures: Vec<Capture>,
    /// The operations, including label markers.
    pub ops: Vec<Op>,
    /// The source range of each entry of `ops`.
    #[serde(default)]
    pub ranges: Vec<SourceRange>,
    /// The protected regions of this function.
    #[serde(default)]
    pub try_regions: Vec<TryRegion>,
    #[serde(skip)]
    next_label: u32,
    #[serde(skip)]
    range: SourceRange,
}

impl BitcodeFunction {
    /// Returns an empty function with the given name.
    #[must_use]
    pub fn new(name: impl IntoOptionSymbol) -> Self {
        Self {
            name: name.into_symbol(),
            ..Self::default()
        }
    }

    /// Sets the signature and returns self.
    #[must_use]
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    /// Adds a captured variable and returns self.
    #[must_use]
    pub fn with_capture(mut self, capture: Capture) -> Self {
        self.captures.push(capture);
        self
    }

    /// Sets the source range recorded for subsequently pushed operations.
    pub fn set_range(&mut self, range: SourceRange) {
        self.range = range;
    }

    /// Pushes `op`.
    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
        self.ranges.push(self.range);
    }

    /// Pushes each op in `ops`.
    pub fn extend(&mut self, ops: impl IntoIterator<Item = Op>) {
        for op in ops {
            self.push(op);
        }
    }

    /// Returns a label that has not been used in this function.
    pub fn new_label(&mut self) -> Label {
        let highest = self
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Label(label) => Some(label.0 + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        let label = Label(self.next_label.max(highest));
        self.next_label = label.0 + 1;
        label
    }

    /// Marks the location of `label`.
    pub fn label(&mut self, label: Label) {
        self.push(Op::Label(label));
    }

    /// Protects the instructions between `start` and `end`, handling raised
    /// errors at `catch`.
    pub fn protect(&mut self, start: Label, end: Label, catch: Label) {
        self.try_regions.push(TryRegion { start, end, catch });
    }

    /// Pushes an op loading `literal`.
    pub fn load(&mut self, literal: impl Into<Literal>) {
        self.push(Op::LoadConst(literal.into()));
    }

    /// Pushes the ops for calling the callable on the stack with `receiver`
    /// already pushed above it, passing the values produced by `args` as
    /// positional arguments.
    ///
    /// `args` must push exactly one value per argument; each is moved into the
    /// argument vector as it is produced.
    pub fn call_with(&mut self, args: impl IntoIterator<Item = Vec<Op>>) {
        self.push(Op::NewArgs);
        for arg in args {
            self.extend(arg);
            self.push(Op::PushArg);
        }
        self.push(Op::Call);
    }
}

/// An unlinked data-record template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitcodeTemplate {
    /// The name of the template.
    pub name: Symbol,
    /// Whether instances are sealed.
    #[serde(default)]
    pub sealed: bool,
    /// The methods attached to each instance. Each method must be named.
    #[serde(default)]
    pub methods: Vec<BitcodeFunction>,
}

impl BitcodeTemplate {
    /// Returns a template with no methods.
    #[must_use]
    pub fn new(name: impl Into<Symbol>) -> Self {
        Self {
            name: name.into(),
            sealed: false,
            methods: Vec::new(),
        }
    }

    /// Marks instances as sealed and returns self.
    #[must_use]
    pub fn sealed(mut self) -> Self {
        self.sealed = true;
        self
    }

    /// Adds a method and returns self.
    #[must_use]
    pub fn with_method(mut self, method: BitcodeFunction) -> Self {
        self.methods.push(method);
        self
    }
}

/// An unlinked module: a name and the function executed to initialize it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitcodeModule {
    /// The name of the module.
    pub name: Symbol,
    /// The top-level code of the module.
    pub body: BitcodeFunction,
}

impl BitcodeModule {
    /// Returns a module named `name` whose top-level code is `body`.
    #[must_use]
    pub fn new(name: impl Into<Symbol>, body: BitcodeFunction) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }

    /// Links this module.
    pub fn link(&self) -> Result<LinkedModule, LinkError> {
        link_module(self)
    }
}
