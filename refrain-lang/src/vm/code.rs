//! Linked code: the instruction set, code objects, and the linker.

use std::cmp::Reverse;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use ahash::AHashMap;
use kempt::Map;
use serde::{Deserialize, Serialize};

use crate::runtime::symbol::{Symbol, SymbolRef};
use crate::vm::artifact::Version;
use crate::vm::bitcode::{BitcodeFunction, BitcodeModule, BitcodeTemplate, Label, Literal, Op};
use crate::ErrorKind;

/// A line and column in source code.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SourcePosition {
    /// The 1-based line number, or 0 when unknown.
    pub line: u32,
    /// The 1-based column number, or 0 when unknown.
    pub column: u32,
}

/// The span of source code an instruction was generated from.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct SourceRange {
    /// Where the range begins.
    pub start: SourcePosition,
    /// Where the range ends.
    pub end: SourcePosition,
}

impl SourceRange {
    /// Returns a range covering `start_line:start_column` to
    /// `end_line:end_column`.
    #[must_use]
    pub const fn new(start_line: u32, start_column: u32, end_line: u32, end_column: u32) -> Self {
        Self {
            start: SourcePosition {
                line: start_line,
                column: start_column,
            },
            end: SourcePosition {
                line: end_line,
                column: end_column,
            },
        }
    }
}

/// The parameters a function accepts.
///
/// When a function is called, its frame's slots are laid out as:
///
/// | Slot | Contents |
/// |------|----------|
/// | 0 | the callable itself |
/// | 1 | the receiver |
/// | 2.. | positional parameters |
/// | next | an array of excess positional arguments, when variadic |
/// | next | keyword parameters, in declaration order |
/// | next | an object of unknown keyword arguments, when variadic |
///
/// Slots after the parameters hold ordinary locals.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    /// The number of required positional parameters.
    #[serde(default)]
    pub positional: u32,
    /// The names of the keyword parameters.
    #[serde(default)]
    pub keywords: Vec<Symbol>,
    /// Whether excess positional arguments are collected into an array.
    #[serde(default)]
    pub variadic_positional: bool,
    /// Whether unknown keyword arguments are collected into an object.
    #[serde(default)]
    pub variadic_keyword: bool,
}

impl Signature {
    /// The slot holding the callable.
    pub const CALLABLE_SLOT: usize = 0;
    /// The slot holding the receiver.
    pub const RECEIVER_SLOT: usize = 1;
    /// The first parameter slot.
    pub const FIRST_PARAMETER: usize = 2;

    /// Returns a signature accepting `positional` positional parameters.
    #[must_use]
    pub const fn new(positional: u32) -> Self {
        Self {
            positional,
            keywords: Vec::new(),
            variadic_positional: false,
            variadic_keyword: false,
        }
    }

    /// Adds a keyword parameter and returns self.
    #[must_use]
    pub fn with_keyword(mut self, name: impl Into<Symbol>) -> Self {
        self.keywords.push(name.into());
        self
    }

    /// Collects excess positional arguments and returns self.
    #[must_use]
    pub const fn variadic_positional(mut self) -> Self {
        self.variadic_positional = true;
        self
    }

    /// Collects unknown keyword arguments and returns self.
    #[must_use]
    pub const fn variadic_keyword(mut self) -> Self {
        self.variadic_keyword = true;
        self
    }

    /// Returns the number of positional parameters as a `usize`.
    #[must_use]
    pub fn positional_count(&self) -> usize {
        usize::try_from(self.positional).unwrap_or(usize::MAX)
    }

    /// Returns the slot receiving excess positional arguments.
    #[must_use]
    pub fn variadic_positional_slot(&self) -> Option<usize> {
        self.variadic_positional
            .then(|| Self::FIRST_PARAMETER + self.positional_count())
    }

    /// Returns the slot of the first keyword parameter.
    #[must_use]
    pub fn first_keyword_slot(&self) -> usize {
        Self::FIRST_PARAMETER + self.positional_count() + usize::from(self.variadic_positional)
    }

    /// Returns the slot receiving unknown keyword arguments.
    #[must_use]
    pub fn variadic_keyword_slot(&self) -> Option<usize> {
        self.variadic_keyword
            .then(|| self.first_keyword_slot() + self.keywords.len())
    }

    /// Returns the number of slots occupied by the callable, receiver, and
    /// parameters.
    #[must_use]
    pub fn parameter_slots(&self) -> usize {
        self.first_keyword_slot() + self.keywords.len() + usize::from(self.variadic_keyword)
    }
}

/// Where a closure finds a captured variable when it is instantiated.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum Capture {
    /// A local slot of the enclosing frame.
    Local(u32),
    /// A variable the enclosing function itself captured.
    Captured(u32),
}

/// The kind of operand an [`Opcode`] takes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OperandKind {
    /// The opcode takes no operand.
    None,
    /// An index into the constant pool.
    Constant,
    /// An index of a string in the constant pool.
    Name,
    /// An index of a code object in the constant pool.
    Code,
    /// A local slot.
    Slot,
    /// An index into the executing function's captured cells.
    Capture,
    /// An instruction index.
    Target,
}

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident => $operand:ident),+ $(,)?) => {
        /// An instruction's operation.
        ///
        /// The ordinal of each opcode is its encoding in compiled artifacts.
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($(#[$doc])* $name,)+
        }

        impl Opcode {
            const ALL: &'static [Opcode] = &[$(Opcode::$name,)+];

            /// Returns the kind of operand this opcode takes.
            #[must_use]
            pub const fn operand(self) -> OperandKind {
                match self {
                    $(Opcode::$name => OperandKind::$operand,)+
                }
            }
        }
    };
}

opcodes!(
    /// Does nothing.
    Nop => None,
    /// Discards the top of the stack.
    Pop => None,
    /// Duplicates the top of the stack.
    Dup => None,
    /// Swaps the top two values.
    Swap => None,
    /// Pushes null.
    PushNull => None,
    /// Pushes true.
    PushTrue => None,
    /// Pushes false.
    PushFalse => None,
    /// Pushes a pool constant.
    LoadConst => Constant,
    /// Pushes a local slot.
    LoadLocal => Slot,
    /// Pops into a local slot.
    StoreLocal => Slot,
    /// Pushes the cell of a captured local.
    LoadCell => Slot,
    /// Pops into the cell of a captured local.
    StoreCell => Slot,
    /// Pops into a new cell for a captured local.
    NewCell => Slot,
    /// Pushes a captured cell's value.
    LoadCapture => Capture,
    /// Pops into a captured cell.
    StoreCapture => Capture,
    /// Pushes an attribute of the module object.
    LoadGlobal => Name,
    /// Pops into an attribute of the module object.
    StoreGlobal => Name,
    /// Replaces the target with one of its attributes.
    GetAttr => Name,
    /// Pops a value and a target, assigning the attribute.
    SetAttr => Name,
    /// Pops a value and a target, defining a const attribute.
    DeclareConst => Name,
    /// Pops a target, exporting an attribute.
    Export => Name,
    /// Pops a target, locking an attribute.
    Lock => Name,
    /// Seals the object or array on top of the stack.
    Seal => None,
    /// Replaces a target and index with the element.
    GetIndex => None,
    /// Pops a target, index, and value, assigning the element.
    SetIndex => None,
    /// Addition or concatenation.
    Add => None,
    /// Subtraction.
    Subtract => None,
    /// Multiplication.
    Multiply => None,
    /// Division.
    Divide => None,
    /// Remainder.
    Remainder => None,
    /// Bitwise and.
    BitwiseAnd => None,
    /// Bitwise or.
    BitwiseOr => None,
    /// Bitwise exclusive or.
    BitwiseXor => None,
    /// Left shift.
    ShiftLeft => None,
    /// Right shift.
    ShiftRight => None,
    /// Equality.
    Equal => None,
    /// Inequality.
    NotEqual => None,
    /// Less than.
    LessThan => None,
    /// Less than or equal.
    LessThanOrEqual => None,
    /// Greater than.
    GreaterThan => None,
    /// Greater than or equal.
    GreaterThanOrEqual => None,
    /// Arithmetic negation.
    Negate => None,
    /// Logical negation.
    Not => None,
    /// Unconditional jump.
    Jump => Target,
    /// Jump when the popped value is truthy.
    JumpIf => Target,
    /// Jump when the popped value is falsey.
    JumpIfNot => Target,
    /// Begins an argument vector.
    NewArgs => None,
    /// Appends a positional argument.
    PushArg => None,
    /// Appends a keyword argument.
    PushKeyword => Name,
    /// Calls a callable with a receiver.
    Call => None,
    /// Calls a named attribute of the target.
    Invoke => Name,
    /// Rebinds a callable's receiver.
    Bind => None,
    /// Instantiates a closure.
    MakeFunction => Code,
    /// Builds an array from the positional arguments.
    NewArray => None,
    /// Builds an object from the keyword arguments.
    NewObject => None,
    /// Loads a module.
    LoadModule => Name,
    /// Returns from the frame.
    Return => None,
    /// Raises the popped value.
    Throw => None,
    /// Pushes the error being handled.
    PopErr => None,
);

impl Opcode {
    /// Returns the opcode encoded as `ordinal`.
    #[must_use]
    pub fn from_u8(ordinal: u8) -> Option<Self> {
        Self::ALL.get(usize::from(ordinal)).copied()
    }

    /// Returns true if this opcode is encoded with an operand.
    #[must_use]
    pub const fn has_operand(self) -> bool {
        !matches!(self.operand(), OperandKind::None)
    }
}

/// A linked instruction.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Instruction {
    /// The operation to perform.
    pub opcode: Opcode,
    /// The operand, or 0 if the opcode takes none.
    pub operand: u32,
    /// The instruction that handles errors raised by this instruction.
    pub handler: Option<u32>,
    /// The source this instruction was generated from.
    pub range: SourceRange,
}

impl Instruction {
    /// Returns the operand as a `usize`.
    #[must_use]
    pub fn index(&self) -> usize {
        usize::try_from(self.operand).unwrap_or(usize::MAX)
    }
}

/// A linked, immutable function body.
///
/// Cloning a [`Code`] is cheap: every clone shares the same instructions.
#[derive(Clone)]
pub struct Code {
    data: Arc<CodeData>,
}

struct CodeData {
    name: Option<Symbol>,
    signature: Signature,
    keyword_slots: Map<Symbol, usize>,
    captures: Vec<Capture>,
    instructions: Vec<Instruction>,
}

impl Code {
    /// Returns a new code object.
    #[must_use]
    pub fn new(
        name: Option<Symbol>,
        signature: Signature,
        captures: Vec<Capture>,
        instructions: Vec<Instruction>,
    ) -> Self {
        let first_keyword = signature.first_keyword_slot();
        let keyword_slots = signature
            .keywords
            .iter()
            .enumerate()
            .map(|(index, name)| (name.clone(), first_keyword + index))
            .collect();
        Self {
            data: Arc::new(CodeData {
                name,
                signature,
                keyword_slots,
                captures,
                instructions,
            }),
        }
    }

    /// Returns the name this code was bound to.
    #[must_use]
    pub fn name(&self) -> Option<&Symbol> {
        self.data.name.as_ref()
    }

    /// Returns the parameters this code accepts.
    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.data.signature
    }

    /// Returns the slot of the keyword parameter `name`.
    #[must_use]
    pub fn keyword_slot(&self, name: &SymbolRef) -> Option<usize> {
        self.data.keyword_slots.get(name).copied()
    }

    /// Returns where each captured variable comes from.
    #[must_use]
    pub fn captures(&self) -> &[Capture] {
        &self.data.captures
    }

    /// Returns the instructions.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.data.instructions
    }

    /// Returns the source range of the instruction at `index`.
    #[must_use]
    pub fn source_range(&self, index: usize) -> Option<SourceRange> {
        self.data.instructions.get(index).map(|inst| inst.range)
    }
}

impl PartialEq for Code {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
            || (self.data.name == other.data.name
                && self.data.signature == other.data.signature
                && self.data.captures == other.data.captures
                && self.data.instructions == other.data.instructions)
    }
}

impl Debug for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Code")
            .field("name", &self.data.name)
            .field("signature", &self.data.signature)
            .field("captures", &self.data.captures)
            .field("instructions", &self.data.instructions.len())
            .finish()
    }
}

/// An entry in a linked module's constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A string, also used for every name an instruction refers to.
    String(Symbol),
    /// A linked function body.
    Code(Code),
    /// A data-record template.
    Template(TemplateConstant),
}

/// A linked data-record template.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateConstant {
    /// The name of the template.
    pub name: Symbol,
    /// Whether instances are sealed.
    pub sealed: bool,
    /// The methods, each with a name.
    pub methods: Vec<Code>,
}

/// A linked module ready to be loaded into a virtual machine.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedModule {
    name: Symbol,
    pool: Vec<Constant>,
}

impl LinkedModule {
    /// Returns a linked module from its parts after validating every
    /// instruction's operands.
    pub fn new(name: impl Into<Symbol>, pool: Vec<Constant>) -> Result<Self, LinkError> {
        let module = Self {
            name: name.into(),
            pool,
        };
        module.validate()?;
        Ok(module)
    }

    /// Returns the name of this module.
    #[must_use]
    pub const fn name(&self) -> &Symbol {
        &self.name
    }

    /// Returns a copy of this module with a different name.
    #[must_use]
    pub fn renamed(mut self, name: impl Into<Symbol>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns the constant pool.
    #[must_use]
    pub fn pool(&self) -> &[Constant] {
        &self.pool
    }

    /// Returns the module's top-level code, which is always the last entry in
    /// the pool.
    #[must_use]
    pub fn body(&self) -> Option<&Code> {
        match self.pool.last() {
            Some(Constant::Code(code)) => Some(code),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), LinkError> {
        if self.body().is_none() {
            return Err(LinkError::MissingBody);
        }
        for constant in &self.pool {
            match constant {
                Constant::Code(code) => self.validate_code(code)?,
                Constant::Template(template) => {
                    for method in &template.methods {
                        if method.name().is_none() {
                            return Err(LinkError::AnonymousMethod);
                        }
                        self.validate_code(method)?;
                    }
                }
                Constant::Bool(_) | Constant::Int(_) | Constant::Float(_) | Constant::String(_) => {
                }
            }
        }
        Ok(())
    }

    fn validate_code(&self, code: &Code) -> Result<(), LinkError> {
        let count = code.instructions().len();
        for (index, instruction) in code.instructions().iter().enumerate() {
            let operand = instruction.index();
            let valid = match instruction.opcode.operand() {
                OperandKind::None | OperandKind::Slot => true,
                OperandKind::Constant => operand < self.pool.len(),
                OperandKind::Name => matches!(self.pool.get(operand), Some(Constant::String(_))),
                OperandKind::Code => matches!(self.pool.get(operand), Some(Constant::Code(_))),
                OperandKind::Capture => operand < code.captures().len(),
                OperandKind::Target => operand <= count,
            };
            if !valid {
                return Err(LinkError::InvalidOperand { instruction: index });
            }
            if instruction
                .handler
                .is_some_and(|handler| usize::try_from(handler).map_or(true, |h| h > count))
            {
                return Err(LinkError::InvalidHandler { instruction: index });
            }
        }
        Ok(())
    }
}

/// An error encountered while linking bitcode or decoding a compiled
/// artifact.
///
/// Link errors are never recoverable by the code being linked.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum LinkError {
    /// A jump or try region referred to a label that was never marked.
    UnresolvedLabel(Label),
    /// A label was marked more than once in the same function.
    DuplicateLabel(Label),
    /// A template method had no name.
    AnonymousMethod,
    /// A template method declared captured variables.
    CapturingMethod(Symbol),
    /// A function or pool grew beyond what can be encoded.
    TooLarge,
    /// The pool's final entry was not the module's top-level code.
    MissingBody,
    /// An instruction's operand does not refer to a valid target.
    InvalidOperand {
        /// The index of the instruction.
        instruction: usize,
    },
    /// An instruction's error handler is out of bounds.
    InvalidHandler {
        /// The index of the instruction.
        instruction: usize,
    },
    /// An artifact was produced by an incompatible version.
    VersionMismatch(Version),
    /// An artifact ended unexpectedly.
    UnexpectedEof,
    /// An artifact contained an unknown constant tag.
    InvalidTag(u8),
    /// An artifact contained an unknown opcode.
    InvalidOpcode(u8),
    /// An artifact contained a string that was not valid UTF-8.
    InvalidUtf8,
    /// An artifact contained a negative or out-of-range length.
    InvalidLength,
    /// An artifact contained bytes after its constant pool.
    TrailingBytes,
}

impl ErrorKind for LinkError {
    fn kind(&self) -> &'static str {
        match self {
            LinkError::UnresolvedLabel(_) => "unresolved_label",
            LinkError::DuplicateLabel(_) => "duplicate_label",
            LinkError::AnonymousMethod => "anonymous_method",
            LinkError::CapturingMethod(_) => "capturing_method",
            LinkError::TooLarge => "too_large",
            LinkError::MissingBody => "missing_body",
            LinkError::InvalidOperand { .. } => "invalid_operand",
            LinkError::InvalidHandler { .. } => "invalid_handler",
            LinkError::VersionMismatch(_) => "version_mismatch",
            LinkError::UnexpectedEof => "unexpected_eof",
            LinkError::InvalidTag(_) => "invalid_tag",
            LinkError::InvalidOpcode(_) => "invalid_opcode",
            LinkError::InvalidUtf8 => "invalid_utf8",
            LinkError::InvalidLength => "invalid_length",
            LinkError::TrailingBytes => "trailing_bytes",
        }
    }
}

impl Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::UnresolvedLabel(label) => write!(f, "label {} was never marked", label.0),
            LinkError::DuplicateLabel(label) => write!(f, "label {} was marked twice", label.0),
            LinkError::AnonymousMethod => f.write_str("template methods must be named"),
            LinkError::CapturingMethod(name) => {
                write!(f, "template method {name} cannot capture variables")
            }
            LinkError::TooLarge => f.write_str("code is too large to link"),
            LinkError::MissingBody => f.write_str("module has no top-level code"),
            LinkError::InvalidOperand { instruction } => {
                write!(f, "instruction {instruction} has an invalid operand")
            }
            LinkError::InvalidHandler { instruction } => {
                write!(f, "instruction {instruction} has an invalid error handler")
            }
            LinkError::VersionMismatch(version) => {
                write!(f, "artifact was compiled by version {version}")
            }
            LinkError::UnexpectedEof => f.write_str("unexpected end of artifact"),
            LinkError::InvalidTag(tag) => write!(f, "invalid constant tag {tag}"),
            LinkError::InvalidOpcode(opcode) => write!(f, "invalid opcode {opcode}"),
            LinkError::InvalidUtf8 => f.write_str("invalid utf-8 in string"),
            LinkError::InvalidLength => f.write_str("invalid length"),
            LinkError::TrailingBytes => f.write_str("unexpected bytes after constant pool"),
        }
    }
}

impl std::error::Error for LinkError {}

fn encodable(value: usize) -> Result<u32, LinkError> {
    u32::try_from(value).map_err(|_| LinkError::TooLarge)
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
enum Interned {
    Bool(bool),
    Int(i64),
    Float(u64),
    String(Symbol),
}

#[derive(Default)]
struct Linker {
    pool: Vec<Constant>,
    interned: AHashMap<Interned, u32>,
}

impl Linker {
    fn push(&mut self, constant: Constant) -> Result<u32, LinkError> {
        let index = encodable(self.pool.len())?;
        self.pool.push(constant);
        Ok(index)
    }

    fn intern(&mut self, key: Interned, constant: impl FnOnce() -> Constant) -> Result<u32, LinkError> {
        if let Some(index) = self.interned.get(&key) {
            return Ok(*index);
        }
        let index = self.push(constant())?;
        self.interned.insert(key, index);
        Ok(index)
    }

    fn name(&mut self, name: &Symbol) -> Result<u32, LinkError> {
        self.intern(Interned::String(name.clone()), || {
            Constant::String(name.clone())
        })
    }

    fn literal(&mut self, literal: &Literal) -> Result<u32, LinkError> {
        match literal {
            Literal::Bool(value) => {
                self.intern(Interned::Bool(*value), || Constant::Bool(*value))
            }
            Literal::Int(value) => self.intern(Interned::Int(*value), || Constant::Int(*value)),
            Literal::Float(value) => {
                self.intern(Interned::Float(value.to_bits()), || Constant::Float(*value))
            }
            Literal::String(value) => self.name(value),
            Literal::Function(function) => {
                let code = self.function(function)?;
                self.push(Constant::Code(code))
            }
            Literal::Template(template) => {
                let template = self.template(template)?;
                self.push(Constant::Template(template))
            }
        }
    }

    fn template(&mut self, template: &BitcodeTemplate) -> Result<TemplateConstant, LinkError> {
        let methods = template
            .methods
            .iter()
            .map(|method| {
                let name = method.name.as_ref().ok_or(LinkError::AnonymousMethod)?;
                if !method.captures.is_empty() {
                    return Err(LinkError::CapturingMethod(name.clone()));
                }
                self.function(method)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TemplateConstant {
            name: template.name.clone(),
            sealed: template.sealed,
            methods,
        })
    }

    fn function(&mut self, function: &BitcodeFunction) -> Result<Code, LinkError> {
        let mut labels = AHashMap::new();
        let mut count = 0_usize;
        for op in &function.ops {
            if let Op::Label(label) = op {
                if labels.insert(*label, count).is_some() {
                    return Err(LinkError::DuplicateLabel(*label));
                }
            } else {
                count += 1;
            }
        }
        let resolve = |label: Label| {
            labels
                .get(&label)
                .copied()
                .ok_or(LinkError::UnresolvedLabel(label))
        };

        let mut regions = function
            .try_regions
            .iter()
            .map(|region| {
                Ok((
                    resolve(region.start)?,
                    resolve(region.end)?,
                    resolve(region.catch)?,
                ))
            })
            .collect::<Result<Vec<_>, LinkError>>()?;
        // Widest regions first, so that nested regions overwrite the handlers
        // of the regions enclosing them.
        regions.sort_by_key(|(start, end, _)| Reverse(end.saturating_sub(*start)));
        let mut handlers = vec![None; count];
        for (start, end, catch) in regions {
            let catch = encodable(catch)?;
            for handler in handlers.iter_mut().take(end).skip(start) {
                *handler = Some(catch);
            }
        }

        let mut instructions = Vec::with_capacity(count);
        for (index, op) in function.ops.iter().enumerate() {
            let (opcode, operand) = match op {
                Op::Label(_) => continue,
                Op::Nop => (Opcode::Nop, 0),
                Op::Pop => (Opcode::Pop, 0),
                Op::Dup => (Opcode::Dup, 0),
                Op::Swap => (Opcode::Swap, 0),
                Op::PushNull => (Opcode::PushNull, 0),
                Op::PushTrue => (Opcode::PushTrue, 0),
                Op::PushFalse => (Opcode::PushFalse, 0),
                Op::LoadConst(literal) => (Opcode::LoadConst, self.literal(literal)?),
                Op::LoadLocal(slot) => (Opcode::LoadLocal, *slot),
                Op::StoreLocal(slot) => (Opcode::StoreLocal, *slot),
                Op::LoadCell(slot) => (Opcode::LoadCell, *slot),
                Op::StoreCell(slot) => (Opcode::StoreCell, *slot),
                Op::NewCell(slot) => (Opcode::NewCell, *slot),
                Op::LoadCapture(index) => (Opcode::LoadCapture, *index),
                Op::StoreCapture(index) => (Opcode::StoreCapture, *index),
                Op::LoadGlobal(name) => (Opcode::LoadGlobal, self.name(name)?),
                Op::StoreGlobal(name) => (Opcode::StoreGlobal, self.name(name)?),
                Op::GetAttr(name) => (Opcode::GetAttr, self.name(name)?),
                Op::SetAttr(name) => (Opcode::SetAttr, self.name(name)?),
                Op::DeclareConst(name) => (Opcode::DeclareConst, self.name(name)?),
                Op::Export(name) => (Opcode::Export, self.name(name)?),
                Op::Lock(name) => (Opcode::Lock, self.name(name)?),
                Op::Seal => (Opcode::Seal, 0),
                Op::GetIndex => (Opcode::GetIndex, 0),
                Op::SetIndex => (Opcode::SetIndex, 0),
                Op::Add => (Opcode::Add, 0),
                Op::Subtract => (Opcode::Subtract, 0),
                Op::Multiply => (Opcode::Multiply, 0),
                Op::Divide => (Opcode::Divide, 0),
                Op::Remainder => (Opcode::Remainder, 0),
                Op::BitwiseAnd => (Opcode::BitwiseAnd, 0),
                Op::BitwiseOr => (Opcode::BitwiseOr, 0),
                Op::BitwiseXor => (Opcode::BitwiseXor, 0),
                Op::ShiftLeft => (Opcode::ShiftLeft, 0),
                Op::ShiftRight => (Opcode::ShiftRight, 0),
                Op::Equal => (Opcode::Equal, 0),
                Op::NotEqual => (Opcode::NotEqual, 0),
                Op::LessThan => (Opcode::LessThan, 0),
                Op::LessThanOrEqual => (Opcode::LessThanOrEqual, 0),
                Op::GreaterThan => (Opcode::GreaterThan, 0),
                Op::GreaterThanOrEqual => (Opcode::GreaterThanOrEqual, 0),
                Op::Negate => (Opcode::Negate, 0),
                Op::Not => (Opcode::Not, 0),
                Op::Jump(label) => (Opcode::Jump, encodable(resolve(*label)?)?),
                Op::JumpIf(label) => (Opcode::JumpIf, encodable(resolve(*label)?)?),
                Op::JumpIfNot(label) => (Opcode::JumpIfNot, encodable(resolve(*label)?)?),
                Op::NewArgs => (Opcode::NewArgs, 0),
                Op::PushArg => (Opcode::PushArg, 0),
                Op::PushKeyword(name) => (Opcode::PushKeyword, self.name(name)?),
                Op::Call => (Opcode::Call, 0),
                Op::Invoke(name) => (Opcode::Invoke, self.name(name)?),
                Op::Bind => (Opcode::Bind, 0),
                Op::MakeFunction(function) => {
                    let code = self.function(function)?;
                    (Opcode::MakeFunction, self.push(Constant::Code(code))?)
                }
                Op::NewArray => (Opcode::NewArray, 0),
                Op::NewObject => (Opcode::NewObject, 0),
                Op::LoadModule(name) => (Opcode::LoadModule, self.name(name)?),
                Op::Return => (Opcode::Return, 0),
                Op::Throw => (Opcode::Throw, 0),
                Op::PopErr => (Opcode::PopErr, 0),
            };
            let handler = handlers[instructions.len()];
            instructions.push(Instruction {
                opcode,
                operand,
                handler,
                range: function.ranges.get(index).copied().unwrap_or_default(),
            });
        }

        Ok(Code::new(
            function.name.clone(),
            function.signature.clone(),
            function.captures.clone(),
            instructions,
        ))
    }
}

/// Links `module`, producing a constant pool whose final entry is the
/// module's top-level code.
///
/// Linking is a pure function of its input: linking the same module twice
/// produces equal results.
pub fn link_module(module: &BitcodeModule) -> Result<LinkedModule, LinkError> {
    let mut linker = Linker::default();
    let body = linker.function(&module.body)?;
    linker.push(Constant::Code(body))?;
    trace!(module = %module.name, constants = linker.pool.len(), "linked");
    Ok(LinkedModule {
        name: module.name.clone(),
        pool: linker.pool,
    })
}

/// Links a single function as the body of a module named `name`.
pub fn link_function(
    name: impl Into<Symbol>,
    function: &BitcodeFunction,
) -> Result<LinkedModule, LinkError> {
    link_module(&BitcodeModule::new(name, function.clone()))
}
