//! Executes individual instructions.

use std::cmp::Ordering;

use refuse::{CollectionGuard, Ref};

use crate::runtime::args::ArgumentVector;
use crate::runtime::array::Array;
use crate::runtime::cell::Cell;
use crate::runtime::function::{Function, FunctionBody};
use crate::runtime::object::Object;
use crate::runtime::symbol::{Symbol, SymbolRef};
use crate::runtime::template::Template;
use crate::runtime::value::Value;
use crate::vm::code::{Capture, Opcode};
use crate::vm::frame::{Continuation, Frame};
use crate::vm::module::ModuleId;
use crate::vm::{Fault, FiberContext};

/// The outcome of executing one instruction.
pub(crate) enum Step {
    /// Continue with the current frame's next instruction.
    Next,
    /// Execute a new frame. The current frame resumes after the instruction
    /// when the new frame completes.
    Enter(Frame),
    /// The current frame completed.
    Return(Value),
}

/// The outcome of preparing a call.
pub(crate) enum Invocation {
    /// The call completed without needing a frame.
    Complete(Value),
    /// The call must execute this frame.
    Enter(Frame),
}

pub(crate) fn step(context: &mut FiberContext<'_, '_>) -> Result<Step, Fault> {
    let (guard, frame) = context.frame()?;
    let Some(instruction) = frame.code.instructions().get(frame.instruction).copied() else {
        return Ok(Step::Return(Value::Null));
    };
    let operand = instruction.index();

    match instruction.opcode {
        Opcode::Nop => {}
        Opcode::Pop => {
            frame.pop()?;
        }
        Opcode::Dup => {
            let value = frame.peek()?;
            frame.push(value);
        }
        Opcode::Swap => {
            let b = frame.pop()?;
            let a = frame.pop()?;
            frame.push(b);
            frame.push(a);
        }
        Opcode::PushNull => frame.push(Value::Null),
        Opcode::PushTrue => frame.push(Value::Bool(true)),
        Opcode::PushFalse => frame.push(Value::Bool(false)),
        Opcode::LoadConst => {
            let value = frame.constant(operand)?;
            frame.push(value);
        }
        Opcode::LoadLocal => {
            let value = frame.local(operand);
            frame.push(value);
        }
        Opcode::StoreLocal => {
            let value = frame.pop()?;
            frame.set_local(operand, value);
        }
        Opcode::LoadCell => {
            let cell = frame.cell(operand, guard);
            let value = cell.load(guard).ok_or(Fault::ValueFreed)?.get();
            frame.push(value);
        }
        Opcode::StoreCell => {
            let value = frame.pop()?;
            let cell = frame.cell(operand, guard);
            cell.load(guard).ok_or(Fault::ValueFreed)?.set(value);
        }
        Opcode::NewCell => {
            let value = frame.pop()?;
            frame.new_cell(operand, value, guard);
        }
        Opcode::LoadCapture => {
            let cell = frame.capture(operand)?;
            let value = cell.load(guard).ok_or(Fault::ValueFreed)?.get();
            frame.push(value);
        }
        Opcode::StoreCapture => {
            let value = frame.pop()?;
            let cell = frame.capture(operand)?;
            cell.load(guard).ok_or(Fault::ValueFreed)?.set(value);
        }
        Opcode::LoadGlobal => {
            let name = frame.name(operand)?;
            let globals = frame.scope.globals.load(guard).ok_or(Fault::ValueFreed)?;
            let value = globals.get(name, Some(frame.scope.module))?;
            frame.push(value);
        }
        Opcode::StoreGlobal => {
            let name = frame.name(operand)?;
            let value = frame.pop()?;
            let globals = frame.scope.globals.load(guard).ok_or(Fault::ValueFreed)?;
            globals.set(name, value, Some(frame.scope.module))?;
        }
        Opcode::GetAttr => {
            let name = frame.name(operand)?;
            let target = frame.pop()?;
            let value = get_attribute(guard, target, name, Some(frame.scope.module))?;
            frame.push(value);
        }
        Opcode::SetAttr => {
            let name = frame.name(operand)?;
            let value = frame.pop()?;
            let target = frame.pop()?;
            object(guard, target)?.set(name, value, Some(frame.scope.module))?;
        }
        Opcode::DeclareConst => {
            let name = frame.name(operand)?;
            let value = frame.pop()?;
            let target = frame.pop()?;
            object(guard, target)?.declare_const(name, value, Some(frame.scope.module))?;
        }
        Opcode::Export => {
            let name = frame.name(operand)?;
            let target = frame.pop()?;
            object(guard, target)?.export(name, Some(frame.scope.module))?;
        }
        Opcode::Lock => {
            let name = frame.name(operand)?;
            let target = frame.pop()?;
            object(guard, target)?.lock(name, Some(frame.scope.module))?;
        }
        Opcode::Seal => match frame.peek()? {
            Value::Object(target) => target.load(guard).ok_or(Fault::ValueFreed)?.seal(),
            Value::Array(target) => target.load(guard).ok_or(Fault::ValueFreed)?.seal(),
            _ => return Err(Fault::UnsupportedOperation),
        },
        Opcode::GetIndex => {
            let index = frame.pop()?;
            let target = frame.pop()?;
            let value = match target {
                Value::Array(array) => array
                    .load(guard)
                    .ok_or(Fault::ValueFreed)?
                    .get(index.as_i64().ok_or(Fault::UnsupportedOperation)?)?,
                Value::Object(_) => object(guard, target)?.get(
                    index.as_symbol_ref().ok_or(Fault::UnsupportedOperation)?,
                    Some(frame.scope.module),
                )?,
                _ => return Err(Fault::UnsupportedOperation),
            };
            frame.push(value);
        }
        Opcode::SetIndex => {
            let value = frame.pop()?;
            let index = frame.pop()?;
            let target = frame.pop()?;
            match target {
                Value::Array(array) => {
                    array
                        .load(guard)
                        .ok_or(Fault::ValueFreed)?
                        .set(index.as_i64().ok_or(Fault::UnsupportedOperation)?, value)?;
                }
                Value::Object(_) => object(guard, target)?.set(
                    index.as_symbol_ref().ok_or(Fault::UnsupportedOperation)?,
                    value,
                    Some(frame.scope.module),
                )?,
                _ => return Err(Fault::UnsupportedOperation),
            }
        }
        Opcode::Add
        | Opcode::Subtract
        | Opcode::Multiply
        | Opcode::Divide
        | Opcode::Remainder
        | Opcode::BitwiseAnd
        | Opcode::BitwiseOr
        | Opcode::BitwiseXor
        | Opcode::ShiftLeft
        | Opcode::ShiftRight
        | Opcode::Equal
        | Opcode::NotEqual
        | Opcode::LessThan
        | Opcode::LessThanOrEqual
        | Opcode::GreaterThan
        | Opcode::GreaterThanOrEqual => return binary(context, instruction.opcode),
        Opcode::Negate | Opcode::Not => return unary(context, instruction.opcode),
        Opcode::Jump => {
            frame.instruction = operand;
            return Ok(Step::Next);
        }
        Opcode::JumpIf | Opcode::JumpIfNot => {
            let condition = frame.pop()?.truthy();
            if condition == (instruction.opcode == Opcode::JumpIf) {
                frame.instruction = operand;
                return Ok(Step::Next);
            }
        }
        Opcode::NewArgs => frame.args.push(ArgumentVector::new()),
        Opcode::PushArg => {
            let value = frame.pop()?;
            frame.args_mut()?.push(value);
        }
        Opcode::PushKeyword => {
            let name = frame.name(operand)?;
            let value = frame.pop()?;
            frame.args_mut()?.push_keyword(name, value);
        }
        Opcode::Call => {
            let receiver = frame.pop()?;
            let callable = frame.pop()?;
            let args = frame.take_args()?;
            let invocation = prepare_call(context, callable, receiver, args)?;
            return finish(context, invocation);
        }
        Opcode::Invoke => {
            let name = frame.name(operand)?;
            let target = frame.pop()?;
            let args = frame.take_args()?;
            let invocation = invoke(context, target, name, args)?;
            return finish(context, invocation);
        }
        Opcode::Bind => {
            let receiver = frame.pop()?;
            let Value::Function(function) = frame.pop()? else {
                return Err(Fault::NotInvokable);
            };
            let bound = function.load(guard).ok_or(Fault::ValueFreed)?.bind(receiver);
            frame.push(Value::Function(Ref::new(bound, guard)));
        }
        Opcode::MakeFunction => {
            let function = make_function(guard, frame, operand)?;
            frame.push(function);
        }
        Opcode::NewArray => {
            let args = frame.take_args()?;
            if args.has_keywords() {
                return Err(Fault::UnknownKeyword);
            }
            let array = Array::from(args.positional().to_vec());
            frame.push(Value::Array(Ref::new(array, guard)));
        }
        Opcode::NewObject => {
            let args = frame.take_args()?;
            let object = new_object(guard, &args)?;
            frame.push(object);
        }
        Opcode::LoadModule => {
            let name = frame.name(operand)?.try_upgrade(guard)?;
            let id = context.module_id(&name)?;
            let invocation = context.enter_module(id, true)?;
            return finish(context, invocation);
        }
        Opcode::Return => {
            let value = frame.stack.pop().unwrap_or_default();
            return Ok(Step::Return(value));
        }
        Opcode::Throw => return Err(Fault::Exception(frame.pop()?)),
        Opcode::PopErr => {
            let error = frame.pending_error.unwrap_or_default();
            frame.push(error);
        }
    }

    frame.instruction += 1;
    Ok(Step::Next)
}

/// Pushes the result of a completed invocation, or enters its frame.
fn finish(context: &mut FiberContext<'_, '_>, invocation: Invocation) -> Result<Step, Fault> {
    match invocation {
        Invocation::Complete(value) => {
            let (_, frame) = context.frame()?;
            frame.push(value);
            frame.instruction += 1;
            Ok(Step::Next)
        }
        Invocation::Enter(frame) => Ok(Step::Enter(frame)),
    }
}

/// Prepares calling `callable`.
///
/// Native functions and templates are evaluated immediately. Interpreted
/// functions have their arguments bound to a new frame. A function's bound
/// receiver takes precedence over `receiver`.
pub(crate) fn prepare_call(
    context: &mut FiberContext<'_, '_>,
    callable: Value,
    receiver: Value,
    args: ArgumentVector,
) -> Result<Invocation, Fault> {
    match callable {
        Value::Function(function_ref) => {
            let function = function_ref
                .load(context.guard())
                .ok_or(Fault::ValueFreed)?;
            let receiver = if function.receiver().is_null() {
                receiver
            } else {
                function.receiver()
            };
            match function.body() {
                FunctionBody::Native(native) => {
                    let native = native.clone();
                    context
                        .invoke_native(&native, callable, receiver, args)
                        .map(Invocation::Complete)
                }
                FunctionBody::Interpreted { code, captures } => {
                    let code = code.clone();
                    let captures = captures.clone();
                    let module = function.module().ok_or(Fault::InvalidInstruction)?;
                    let scope = context.vm().scope(module)?;
                    Frame::bind(function_ref, code, captures, scope, receiver, &args, context.guard())
                        .map(Invocation::Enter)
                }
            }
        }
        Value::Template(template) => construct(context.guard(), template, &args).map(Invocation::Complete),
        _ => Err(Fault::NotInvokable),
    }
}

/// Prepares calling the method `name` of `target`.
pub(crate) fn invoke(
    context: &mut FiberContext<'_, '_>,
    target: Value,
    name: SymbolRef,
    args: ArgumentVector,
) -> Result<Invocation, Fault> {
    if let Value::Object(object) = target {
        let caller = context.current_module();
        let method = object
            .load(context.guard())
            .ok_or(Fault::ValueFreed)?
            .get(name, caller)?;
        prepare_call(context, method, target, args)
    } else {
        builtin_method(context.guard(), target, name, &args).map(Invocation::Complete)
    }
}

fn object<'guard>(guard: &'guard CollectionGuard<'_>, target: Value) -> Result<&'guard Object, Fault> {
    match target {
        Value::Object(object) => object.load(guard).ok_or(Fault::ValueFreed),
        _ => Err(Fault::UnknownAttribute),
    }
}

fn construct(
    guard: &CollectionGuard<'_>,
    template: Ref<Template>,
    args: &ArgumentVector,
) -> Result<Value, Fault> {
    let template = template.load(guard).ok_or(Fault::ValueFreed)?;
    if !args.positional().is_empty() {
        return Err(Fault::ArgumentCount);
    }
    let instance = Ref::new(Object::new(), guard);
    let object = instance.load(guard).ok_or(Fault::ValueFreed)?;
    // Methods are const, so a keyword argument can't replace one.
    for (name, code) in template.methods() {
        let method = Function::interpreted(
            template.module(),
            code.clone(),
            Vec::<Ref<Cell>>::new(),
            Value::Object(instance),
        );
        object.declare_const(name.downgrade(), Value::Function(Ref::new(method, guard)), None)?;
    }
    for (name, value) in args.keywords() {
        object.set(name, value, None)?;
    }
    if template.sealed() {
        object.seal();
    }
    Ok(Value::Object(instance))
}

fn new_object(guard: &CollectionGuard<'_>, args: &ArgumentVector) -> Result<Value, Fault> {
    if !args.positional().is_empty() {
        return Err(Fault::ArgumentCount);
    }
    let instance = Ref::new(Object::new(), guard);
    let object = instance.load(guard).ok_or(Fault::ValueFreed)?;
    for (name, value) in args.keywords() {
        let value = match value {
            Value::Function(function) => {
                let bound = function
                    .load(guard)
                    .ok_or(Fault::ValueFreed)?
                    .bind(Value::Object(instance));
                Value::Function(Ref::new(bound, guard))
            }
            other => other,
        };
        object.set(name, value, None)?;
    }
    Ok(Value::Object(instance))
}

fn make_function(guard: &CollectionGuard<'_>, frame: &mut Frame, operand: usize) -> Result<Value, Fault> {
    let Value::Code(code) = frame.constant(operand)? else {
        return Err(Fault::InvalidInstruction);
    };
    let code = code.load(guard).ok_or(Fault::ValueFreed)?.0.clone();
    let mut captures = Vec::with_capacity(code.captures().len());
    for capture in code.captures() {
        captures.push(match *capture {
            Capture::Local(slot) => frame.cell(slot as usize, guard),
            Capture::Captured(index) => frame.capture(index as usize)?,
        });
    }
    let function = Function::interpreted(frame.scope.module, code, captures, frame.receiver());
    Ok(Value::Function(Ref::new(function, guard)))
}

fn binary(context: &mut FiberContext<'_, '_>, opcode: Opcode) -> Result<Step, Fault> {
    let (guard, frame) = context.frame()?;
    let right = frame.pop()?;
    let left = frame.pop()?;

    let overload = match left {
        Value::Object(object) => object
            .load(guard)
            .ok_or(Fault::ValueFreed)?
            .lookup(overload_symbol(opcode).downgrade()),
        _ => None,
    };
    let Some(overload) = overload else {
        let result = operate(guard, opcode, left, right)?;
        return finish(context, Invocation::Complete(result));
    };

    let invocation = prepare_call(context, overload, left, ArgumentVector::new().with(right))?;
    match (opcode, invocation) {
        (Opcode::NotEqual, Invocation::Complete(value)) => {
            finish(context, Invocation::Complete(Value::Bool(!value.truthy())))
        }
        (Opcode::NotEqual, Invocation::Enter(frame)) => {
            Ok(Step::Enter(frame.with_continuation(Continuation::Not)))
        }
        (_, invocation) => finish(context, invocation),
    }
}

fn unary(context: &mut FiberContext<'_, '_>, opcode: Opcode) -> Result<Step, Fault> {
    let (guard, frame) = context.frame()?;
    let operand = frame.pop()?;

    let overload = match operand {
        Value::Object(object) => object
            .load(guard)
            .ok_or(Fault::ValueFreed)?
            .lookup(overload_symbol(opcode).downgrade()),
        _ => None,
    };
    if let Some(overload) = overload {
        let invocation = prepare_call(context, overload, operand, ArgumentVector::new())?;
        return finish(context, invocation);
    }

    let result = if opcode == Opcode::Negate {
        match operand {
            Value::Int(value) => Value::Int(value.checked_neg().ok_or(Fault::Overflow)?),
            Value::Float(value) => Value::Float(-value),
            _ => return Err(Fault::UnsupportedOperation),
        }
    } else {
        Value::Bool(!operand.truthy())
    };
    finish(context, Invocation::Complete(result))
}

fn overload_symbol(opcode: Opcode) -> &'static Symbol {
    match opcode {
        Opcode::Add => Symbol::add_symbol(),
        Opcode::Subtract => Symbol::subtract_symbol(),
        Opcode::Multiply => Symbol::multiply_symbol(),
        Opcode::Divide => Symbol::divide_symbol(),
        Opcode::Remainder => Symbol::remainder_symbol(),
        Opcode::BitwiseAnd => Symbol::bitwise_and_symbol(),
        Opcode::BitwiseOr => Symbol::bitwise_or_symbol(),
        Opcode::BitwiseXor => Symbol::bitwise_xor_symbol(),
        Opcode::ShiftLeft => Symbol::shift_left_symbol(),
        Opcode::ShiftRight => Symbol::shift_right_symbol(),
        Opcode::LessThan => Symbol::less_than_symbol(),
        Opcode::LessThanOrEqual => Symbol::less_than_or_equal_symbol(),
        Opcode::GreaterThan => Symbol::greater_than_symbol(),
        Opcode::GreaterThanOrEqual => Symbol::greater_than_or_equal_symbol(),
        Opcode::Negate => Symbol::negate_symbol(),
        Opcode::Not => Symbol::not_symbol(),
        _ => Symbol::equal_symbol(),
    }
}

fn operate(
    guard: &CollectionGuard<'_>,
    opcode: Opcode,
    left: Value,
    right: Value,
) -> Result<Value, Fault> {
    match opcode {
        Opcode::Add => add(guard, left, right),
        Opcode::Subtract => arithmetic(left, right, i64::checked_sub, |a, b| a - b),
        Opcode::Multiply => arithmetic(left, right, i64::checked_mul, |a, b| a * b),
        Opcode::Divide => divide(left, right),
        Opcode::Remainder => remainder(left, right),
        Opcode::BitwiseAnd => bitwise(left, right, |a, b| a & b, |a, b| a & b),
        Opcode::BitwiseOr => bitwise(left, right, |a, b| a | b, |a, b| a | b),
        Opcode::BitwiseXor => bitwise(left, right, |a, b| a ^ b, |a, b| a ^ b),
        Opcode::ShiftLeft => shift(left, right, i64::checked_shl),
        Opcode::ShiftRight => shift(left, right, i64::checked_shr),
        Opcode::Equal => Ok(Value::Bool(left.equals(&right))),
        Opcode::NotEqual => Ok(Value::Bool(!left.equals(&right))),
        Opcode::LessThan => compare(guard, left, right, Ordering::is_lt),
        Opcode::LessThanOrEqual => compare(guard, left, right, Ordering::is_le),
        Opcode::GreaterThan => compare(guard, left, right, Ordering::is_gt),
        Opcode::GreaterThanOrEqual => compare(guard, left, right, Ordering::is_ge),
        _ => Err(Fault::InvalidInstruction),
    }
}

fn add(guard: &CollectionGuard<'_>, left: Value, right: Value) -> Result<Value, Fault> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => {
            let mut joined = String::from(a.try_load(guard)?);
            joined.push_str(b.try_load(guard)?);
            Ok(Value::string(joined))
        }
        (Value::Array(a), Value::Array(b)) => {
            let mut joined = a.load(guard).ok_or(Fault::ValueFreed)?.to_vec();
            joined.extend(b.load(guard).ok_or(Fault::ValueFreed)?.to_vec());
            Ok(Value::Array(Ref::new(Array::from(joined), guard)))
        }
        _ => arithmetic(left, right, i64::checked_add, |a, b| a + b),
    }
}

fn arithmetic(
    left: Value,
    right: Value,
    int: fn(i64, i64) -> Option<i64>,
    float: fn(f64, f64) -> f64,
) -> Result<Value, Fault> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => int(a, b).map(Value::Int).ok_or(Fault::Overflow),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(float(a, b))),
            _ => Err(Fault::UnsupportedOperation),
        },
    }
}

#[allow(clippy::cast_precision_loss)]
fn divide(left: Value, right: Value) -> Result<Value, Fault> {
    match (left, right) {
        (Value::Int(_), Value::Int(0)) => Err(Fault::DivideByZero),
        (Value::Int(a), Value::Int(b)) => match a.checked_rem(b) {
            Some(0) => a.checked_div(b).map(Value::Int).ok_or(Fault::Overflow),
            Some(_) => Ok(Value::Float(a as f64 / b as f64)),
            None => Err(Fault::Overflow),
        },
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(_), Some(b)) if b == 0.0 => Err(Fault::DivideByZero),
            (Some(a), Some(b)) => Ok(Value::Float(a / b)),
            _ => Err(Fault::UnsupportedOperation),
        },
    }
}

fn remainder(left: Value, right: Value) -> Result<Value, Fault> {
    match (left, right) {
        (Value::Int(_), Value::Int(0)) => Err(Fault::DivideByZero),
        (Value::Int(a), Value::Int(b)) => a.checked_rem(b).map(Value::Int).ok_or(Fault::Overflow),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(_), Some(b)) if b == 0.0 => Err(Fault::DivideByZero),
            (Some(a), Some(b)) => Ok(Value::Float(a % b)),
            _ => Err(Fault::UnsupportedOperation),
        },
    }
}

fn bitwise(
    left: Value,
    right: Value,
    int: fn(i64, i64) -> i64,
    boolean: fn(bool, bool) -> bool,
) -> Result<Value, Fault> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int(a, b))),
        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(boolean(a, b))),
        _ => Err(Fault::UnsupportedOperation),
    }
}

fn shift(left: Value, right: Value, op: fn(i64, u32) -> Option<i64>) -> Result<Value, Fault> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => u32::try_from(b)
            .ok()
            .and_then(|b| op(a, b))
            .map(Value::Int)
            .ok_or(Fault::Overflow),
        _ => Err(Fault::UnsupportedOperation),
    }
}

fn compare(
    guard: &CollectionGuard<'_>,
    left: Value,
    right: Value,
    matches: fn(Ordering) -> bool,
) -> Result<Value, Fault> {
    Ok(Value::Bool(
        left.compare(&right, guard)?.is_some_and(matches),
    ))
}

/// Methods and read-only properties of values that are not objects.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Builtin {
    Length,
    Push,
    Pop,
    Get,
    Set,
    Concat,
    Bind,
    Name,
    Raised,
    Kind,
    Message,
}

impl Builtin {
    fn lookup(name: SymbolRef) -> Option<Self> {
        [
            (Symbol::length_symbol(), Self::Length),
            (Symbol::push_symbol(), Self::Push),
            (Symbol::pop_symbol(), Self::Pop),
            (Symbol::get_symbol(), Self::Get),
            (Symbol::set_symbol(), Self::Set),
            (Symbol::concat_symbol(), Self::Concat),
            (Symbol::bind_symbol(), Self::Bind),
            (Symbol::name_symbol(), Self::Name),
            (Symbol::value_symbol(), Self::Raised),
            (Symbol::kind_symbol(), Self::Kind),
            (Symbol::message_symbol(), Self::Message),
        ]
        .into_iter()
        .find_map(|(symbol, builtin)| (name == *symbol).then_some(builtin))
    }

    const fn is_property(self) -> bool {
        matches!(
            self,
            Self::Length | Self::Name | Self::Raised | Self::Kind | Self::Message
        )
    }
}

fn get_attribute(
    guard: &CollectionGuard<'_>,
    target: Value,
    name: SymbolRef,
    caller: Option<ModuleId>,
) -> Result<Value, Fault> {
    match target {
        Value::Object(object) => object.load(guard).ok_or(Fault::ValueFreed)?.get(name, caller),
        other => match Builtin::lookup(name) {
            Some(builtin) if builtin.is_property() => property(guard, other, builtin),
            _ => Err(Fault::UnknownAttribute),
        },
    }
}

fn property(guard: &CollectionGuard<'_>, target: Value, builtin: Builtin) -> Result<Value, Fault> {
    match (target, builtin) {
        (Value::Array(array), Builtin::Length) => {
            let length = array.load(guard).ok_or(Fault::ValueFreed)?.len();
            i64::try_from(length).map(Value::Int).map_err(|_| Fault::Overflow)
        }
        (Value::String(string), Builtin::Length) => {
            let length = string.try_load(guard)?.chars().count();
            i64::try_from(length).map(Value::Int).map_err(|_| Fault::Overflow)
        }
        (Value::Function(function), Builtin::Name) => Ok(function
            .load(guard)
            .ok_or(Fault::ValueFreed)?
            .name()
            .map_or(Value::Null, Value::from)),
        (Value::Template(template), Builtin::Name) => Ok(Value::from(
            template.load(guard).ok_or(Fault::ValueFreed)?.name(),
        )),
        (Value::Error(error), Builtin::Raised | Builtin::Kind | Builtin::Message) => {
            let error = error.load(guard).ok_or(Fault::ValueFreed)?;
            Ok(match builtin {
                Builtin::Raised => error.value(),
                Builtin::Kind => Value::from(error.category().as_str()),
                _ => Value::from(error.message()),
            })
        }
        _ => Err(Fault::UnknownAttribute),
    }
}

fn argument(args: &ArgumentVector, index: usize) -> Result<Value, Fault> {
    args.positional()
        .get(index)
        .copied()
        .ok_or(Fault::ArgumentCount)
}

fn builtin_method(
    guard: &CollectionGuard<'_>,
    target: Value,
    name: SymbolRef,
    args: &ArgumentVector,
) -> Result<Value, Fault> {
    let builtin = Builtin::lookup(name).ok_or(Fault::UnknownAttribute)?;
    match (target, builtin) {
        (Value::Array(array), Builtin::Push) => {
            let array = array.load(guard).ok_or(Fault::ValueFreed)?;
            for value in args.positional() {
                array.push(*value)?;
            }
            Ok(Value::Null)
        }
        (Value::Array(array), Builtin::Pop) => Ok(array
            .load(guard)
            .ok_or(Fault::ValueFreed)?
            .pop()?
            .unwrap_or_default()),
        (Value::Array(array), Builtin::Get) => {
            let index = argument(args, 0)?
                .as_i64()
                .ok_or(Fault::UnsupportedOperation)?;
            array.load(guard).ok_or(Fault::ValueFreed)?.get(index)
        }
        (Value::Array(array), Builtin::Set) => {
            let index = argument(args, 0)?
                .as_i64()
                .ok_or(Fault::UnsupportedOperation)?;
            let value = argument(args, 1)?;
            array.load(guard).ok_or(Fault::ValueFreed)?.set(index, value)
        }
        (Value::String(string), Builtin::Concat) => {
            let mut joined = String::from(string.try_load(guard)?);
            for value in args.positional() {
                joined.push_str(value.as_str(guard).ok_or(Fault::UnsupportedOperation)?);
            }
            Ok(Value::string(joined))
        }
        (Value::Function(function), Builtin::Bind) => {
            let receiver = argument(args, 0)?;
            let bound = function.load(guard).ok_or(Fault::ValueFreed)?.bind(receiver);
            Ok(Value::Function(Ref::new(bound, guard)))
        }
        (target, builtin) if builtin.is_property() => {
            if !args.positional().is_empty() || args.has_keywords() {
                return Err(Fault::ArgumentCount);
            }
            property(guard, target, builtin)
        }
        _ => Err(Fault::UnknownAttribute),
    }
}
