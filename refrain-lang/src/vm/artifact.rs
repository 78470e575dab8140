//! The binary encoding of compiled modules.
//!
//! All integers are little-endian. An artifact is an 8-byte [`Version`]
//! header followed by the module's constant pool: a `u32` count and then one
//! tagged entry per constant.
//!
//! | Tag | Constant | Payload |
//! |-----|----------|---------|
//! | 0 | bool | `u8` |
//! | 1 | int | `i64` |
//! | 2 | float | `f64` bits |
//! | 3 | string | `i32` length and UTF-8 bytes |
//! | 4 | code | a code object |
//! | 5 | template | name, sealed `u8`, `u32` method count, then each method as an `i32` length-prefixed code object |
//!
//! A code object is its name (a string, or a length of -1 when anonymous),
//! its positional parameter count (`u32`), its keyword names terminated by a
//! length of -1, a flags byte (bit 0 variadic positional, bit 1 variadic
//! keyword), its captures (`u32` count, then an `i32` each: a local slot when
//! non-negative, otherwise the enclosing capture `-(index + 1)`), and its
//! instructions (`u32` count). Each instruction is its opcode (`u8`), its
//! operand (`u32`, only for opcodes that take one), its error handler (`i32`,
//! -1 for none), and its source range as four `u32`s.

use std::fmt::Display;

use crate::runtime::symbol::Symbol;
use crate::vm::code::{
    Capture, Code, Constant, Instruction, LinkError, LinkedModule, Opcode, Signature,
    SourcePosition, SourceRange, TemplateConstant,
};

/// The version of the interpreter that produced an artifact.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Version {
    /// Incompatible format changes.
    pub major: u16,
    /// Compatible additions.
    pub minor: u16,
    /// Fixes.
    pub patch: u32,
}

impl Version {
    /// The version written by this crate.
    pub const CURRENT: Self = Self {
        major: 0,
        minor: 1,
        patch: 0,
    };

    /// Returns true if artifacts produced by `self` can be loaded by
    /// [`Version::CURRENT`].
    #[must_use]
    pub const fn is_compatible(&self) -> bool {
        self.major == Self::CURRENT.major && self.minor <= Self::CURRENT.minor
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

const TAG_BOOL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_CODE: u8 = 4;
const TAG_TEMPLATE: u8 = 5;

const VARIADIC_POSITIONAL: u8 = 1;
const VARIADIC_KEYWORD: u8 = 2;

/// Encodes `module` as an artifact.
///
/// Returns [`LinkError::TooLarge`] if a count, length or index does not fit
/// its encoded width.
pub fn encode(module: &LinkedModule) -> Result<Vec<u8>, LinkError> {
    let mut out = Vec::new();
    out.extend_from_slice(&Version::CURRENT.major.to_le_bytes());
    out.extend_from_slice(&Version::CURRENT.minor.to_le_bytes());
    out.extend_from_slice(&Version::CURRENT.patch.to_le_bytes());
    write_u32(&mut out, module.pool().len())?;
    for constant in module.pool() {
        match constant {
            Constant::Bool(value) => {
                out.push(TAG_BOOL);
                out.push(u8::from(*value));
            }
            Constant::Int(value) => {
                out.push(TAG_INT);
                out.extend_from_slice(&value.to_le_bytes());
            }
            Constant::Float(value) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&value.to_bits().to_le_bytes());
            }
            Constant::String(value) => {
                out.push(TAG_STRING);
                write_str(&mut out, value)?;
            }
            Constant::Code(code) => {
                out.push(TAG_CODE);
                write_code(&mut out, code)?;
            }
            Constant::Template(template) => {
                out.push(TAG_TEMPLATE);
                write_str(&mut out, &template.name)?;
                out.push(u8::from(template.sealed));
                write_u32(&mut out, template.methods.len())?;
                for method in &template.methods {
                    let mut encoded = Vec::new();
                    write_code(&mut encoded, method)?;
                    write_i32(&mut out, encoded.len())?;
                    out.extend_from_slice(&encoded);
                }
            }
        }
    }
    Ok(out)
}

fn write_u32(out: &mut Vec<u8>, value: usize) -> Result<(), LinkError> {
    let value = u32::try_from(value).map_err(|_| LinkError::TooLarge)?;
    out.extend_from_slice(&value.to_le_bytes());
    Ok(())
}

fn write_i32(out: &mut Vec<u8>, value: usize) -> Result<(), LinkError> {
    let value = i32::try_from(value).map_err(|_| LinkError::TooLarge)?;
    out.extend_from_slice(&value.to_le_bytes());
    Ok(())
}

fn write_str(out: &mut Vec<u8>, value: &str) -> Result<(), LinkError> {
    write_i32(out, value.len())?;
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn write_code(out: &mut Vec<u8>, code: &Code) -> Result<(), LinkError> {
    match code.name() {
        Some(name) => write_str(out, name)?,
        None => out.extend_from_slice(&(-1_i32).to_le_bytes()),
    }

    let signature = code.signature();
    out.extend_from_slice(&signature.positional.to_le_bytes());
    for keyword in &signature.keywords {
        write_str(out, keyword)?;
    }
    out.extend_from_slice(&(-1_i32).to_le_bytes());
    let mut flags = 0;
    if signature.variadic_positional {
        flags |= VARIADIC_POSITIONAL;
    }
    if signature.variadic_keyword {
        flags |= VARIADIC_KEYWORD;
    }
    out.push(flags);

    write_u32(out, code.captures().len())?;
    for capture in code.captures() {
        let encoded = match capture {
            Capture::Local(slot) => i32::try_from(*slot),
            Capture::Captured(index) => i32::try_from(*index).map(|index| -index - 1),
        }
        .map_err(|_| LinkError::TooLarge)?;
        out.extend_from_slice(&encoded.to_le_bytes());
    }

    write_u32(out, code.instructions().len())?;
    for instruction in code.instructions() {
        out.push(instruction.opcode as u8);
        if instruction.opcode.has_operand() {
            out.extend_from_slice(&instruction.operand.to_le_bytes());
        }
        let handler = match instruction.handler {
            Some(handler) => i32::try_from(handler).map_err(|_| LinkError::TooLarge)?,
            None => -1,
        };
        out.extend_from_slice(&handler.to_le_bytes());
        for part in [
            instruction.range.start.line,
            instruction.range.start.column,
            instruction.range.end.line,
            instruction.range.end.column,
        ] {
            out.extend_from_slice(&part.to_le_bytes());
        }
    }
    Ok(())
}

/// Decodes an artifact, naming the resulting module `name`.
///
/// Every operand is validated: a successfully decoded module never refers to
/// a constant, capture, or instruction that does not exist.
pub fn decode(name: impl Into<Symbol>, bytes: &[u8]) -> Result<LinkedModule, LinkError> {
    let mut reader = Reader { bytes, offset: 0 };
    let version = Version {
        major: u16::from_le_bytes(reader.array()?),
        minor: u16::from_le_bytes(reader.array()?),
        patch: reader.u32()?,
    };
    if !version.is_compatible() {
        return Err(LinkError::VersionMismatch(version));
    }

    let count = reader.u32()?;
    let mut pool = Vec::new();
    for _ in 0..count {
        let constant = match reader.u8()? {
            TAG_BOOL => Constant::Bool(reader.u8()? != 0),
            TAG_INT => Constant::Int(i64::from_le_bytes(reader.array()?)),
            TAG_FLOAT => Constant::Float(f64::from_bits(u64::from_le_bytes(reader.array()?))),
            TAG_STRING => Constant::String(reader.string()?.ok_or(LinkError::InvalidLength)?),
            TAG_CODE => Constant::Code(reader.code()?),
            TAG_TEMPLATE => {
                let name = reader.string()?.ok_or(LinkError::InvalidLength)?;
                let sealed = reader.u8()? != 0;
                let method_count = reader.u32()?;
                let mut methods = Vec::new();
                for _ in 0..method_count {
                    let length = reader.length()?;
                    let mut nested = Reader {
                        bytes: reader.take(length)?,
                        offset: 0,
                    };
                    methods.push(nested.code()?);
                    nested.finish()?;
                }
                Constant::Template(TemplateConstant {
                    name,
                    sealed,
                    methods,
                })
            }
            other => return Err(LinkError::InvalidTag(other)),
        };
        pool.push(constant);
    }
    reader.finish()?;

    LinkedModule::new(name, pool)
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, length: usize) -> Result<&'a [u8], LinkError> {
        let end = self
            .offset
            .checked_add(length)
            .ok_or(LinkError::InvalidLength)?;
        let bytes = self
            .bytes
            .get(self.offset..end)
            .ok_or(LinkError::UnexpectedEof)?;
        self.offset = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], LinkError> {
        let mut array = [0; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    fn u8(&mut self) -> Result<u8, LinkError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, LinkError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, LinkError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn length(&mut self) -> Result<usize, LinkError> {
        usize::try_from(self.i32()?).map_err(|_| LinkError::InvalidLength)
    }

    /// Reads a length-prefixed string, returning `None` for a length of -1.
    fn string(&mut self) -> Result<Option<Symbol>, LinkError> {
        match self.i32()? {
            -1 => Ok(None),
            length => {
                let length = usize::try_from(length).map_err(|_| LinkError::InvalidLength)?;
                let bytes = self.take(length)?;
                let string = std::str::from_utf8(bytes).map_err(|_| LinkError::InvalidUtf8)?;
                Ok(Some(Symbol::from(string)))
            }
        }
    }

    fn code(&mut self) -> Result<Code, LinkError> {
        let name = self.string()?;

        let mut signature = Signature::new(self.u32()?);
        while let Some(keyword) = self.string()? {
            signature.keywords.push(keyword);
        }
        let flags = self.u8()?;
        signature.variadic_positional = flags & VARIADIC_POSITIONAL != 0;
        signature.variadic_keyword = flags & VARIADIC_KEYWORD != 0;

        let capture_count = self.u32()?;
        let mut captures = Vec::new();
        for _ in 0..capture_count {
            let encoded = self.i32()?;
            captures.push(if encoded >= 0 {
                Capture::Local(encoded.unsigned_abs())
            } else {
                Capture::Captured(encoded.unsigned_abs() - 1)
            });
        }

        let instruction_count = self.u32()?;
        let mut instructions = Vec::new();
        for _ in 0..instruction_count {
            let ordinal = self.u8()?;
            let opcode = Opcode::from_u8(ordinal).ok_or(LinkError::InvalidOpcode(ordinal))?;
            let operand = if opcode.has_operand() { self.u32()? } else { 0 };
            let handler = match self.i32()? {
                -1 => None,
                handler => Some(u32::try_from(handler).map_err(|_| LinkError::InvalidLength)?),
            };
            let range = SourceRange {
                start: SourcePosition {
                    line: self.u32()?,
                    column: self.u32()?,
                },
                end: SourcePosition {
                    line: self.u32()?,
                    column: self.u32()?,
                },
            };
            instructions.push(Instruction {
                opcode,
                operand,
                handler,
                range,
            });
        }

        Ok(Code::new(name, signature, captures, instructions))
    }

    fn finish(&self) -> Result<(), LinkError> {
        if self.offset == self.bytes.len() {
            Ok(())
        } else {
            Err(LinkError::TrailingBytes)
        }
    }
}
