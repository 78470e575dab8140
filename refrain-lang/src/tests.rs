use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use refuse::{CollectionGuard, Ref};
use tracing_subscriber::filter::LevelFilter;

use crate::runtime::args::ArgumentVector;
use crate::runtime::array::Array;
use crate::runtime::symbol::SymbolRef;
use crate::runtime::value::Value;
use crate::vm::bitcode::{BitcodeFunction, BitcodeModule, BitcodeTemplate, Literal, Op};
use crate::vm::code::{
    Capture, Code, Constant, Instruction, LinkError, LinkedModule, Opcode, Signature, SourceRange,
};
use crate::vm::{artifact, ExecutionError, Fault, Vm};

fn initialize_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .try_init();
}

fn link(body: BitcodeFunction) -> LinkedModule {
    BitcodeModule::new("test", body).link().expect("linked")
}

fn thrown(err: &ExecutionError, guard: &CollectionGuard<'_>) -> String {
    let value = err.thrown_value(guard).expect("exception");
    value.as_str(guard).expect("string").to_string()
}

fn ints(value: Value, guard: &CollectionGuard<'_>) -> Vec<i64> {
    value
        .as_array()
        .expect("array")
        .load(guard)
        .expect("live")
        .to_vec()
        .into_iter()
        .map(|value| value.as_i64().expect("int"))
        .collect()
}

/// Returns `n` by recursing `n` times.
fn countdown() -> BitcodeFunction {
    let mut f = BitcodeFunction::new("countdown").with_signature(Signature::new(1));
    let recurse = f.new_label();
    f.extend([
        Op::LoadLocal(2),
        Op::LoadConst(Literal::Int(0)),
        Op::Equal,
        Op::JumpIfNot(recurse),
        Op::LoadConst(Literal::Int(0)),
        Op::Return,
    ]);
    f.label(recurse);
    f.extend([
        Op::LoadLocal(0),
        Op::PushNull,
        Op::NewArgs,
        Op::LoadLocal(2),
        Op::LoadConst(Literal::Int(1)),
        Op::Subtract,
        Op::PushArg,
        Op::Call,
        Op::LoadConst(Literal::Int(1)),
        Op::Add,
        Op::Return,
    ]);
    f
}

#[test]
fn linking_is_idempotent() {
    let mut body = BitcodeFunction::default();
    let (start, end, catch) = (body.new_label(), body.new_label(), body.new_label());
    body.label(start);
    body.extend([Op::MakeFunction(countdown()), Op::LoadConst(Literal::Int(5)), Op::Throw]);
    body.label(end);
    body.label(catch);
    body.extend([Op::PopErr, Op::Return]);
    body.protect(start, end, catch);
    let module = BitcodeModule::new("test", body);

    let first = module.link().expect("linked");
    let second = module.link().expect("linked");
    assert_eq!(first, second);
    assert_eq!(
        artifact::encode(&first).expect("encoded"),
        artifact::encode(&second).expect("encoded")
    );
}

#[test]
fn binding_failure_has_no_side_effects() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut add = BitcodeFunction::new("add").with_signature(Signature::new(2));
    add.extend([
        Op::LoadConst(Literal::Bool(true)),
        Op::StoreGlobal("called".into()),
        Op::LoadLocal(2),
        Op::LoadLocal(3),
        Op::Add,
        Op::Return,
    ]);
    let mut body = BitcodeFunction::default();
    body.extend([Op::MakeFunction(add), Op::Return]);
    let function = fiber.execute(link(body), &mut guard).unwrap();

    let err = fiber
        .call(function, Value::Null, ArgumentVector::new().with(1_i64), &mut guard)
        .unwrap_err();
    assert_eq!(thrown(&err, &guard), "args");
    assert!(fiber.context(&mut guard).backtrace().is_empty());
    let globals = vm.module_object("test").expect("registered");
    assert_eq!(
        globals
            .load(&guard)
            .expect("live")
            .lookup(SymbolRef::from("called")),
        None
    );

    let sum = fiber
        .call(
            function,
            Value::Null,
            ArgumentVector::new().with(1_i64).with(2_i64),
            &mut guard,
        )
        .unwrap();
    assert_eq!(sum.as_i64(), Some(3));
}

#[test]
fn keyword_parameters_bind_after_positionals() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut slots = BitcodeFunction::new("slots").with_signature(Signature::new(2).with_keyword("c"));
    slots.push(Op::NewArgs);
    for slot in 2..=4 {
        slots.extend([Op::LoadLocal(slot), Op::PushArg]);
    }
    slots.extend([Op::NewArray, Op::Return]);

    let mut body = BitcodeFunction::default();
    body.extend([
        Op::MakeFunction(slots),
        Op::PushNull,
        Op::NewArgs,
        Op::LoadConst(Literal::Int(1)),
        Op::PushArg,
        Op::LoadConst(Literal::Int(2)),
        Op::PushArg,
        Op::LoadConst(Literal::Int(3)),
        Op::PushKeyword("c".into()),
        Op::Call,
        Op::Return,
    ]);
    let result = fiber.execute(link(body), &mut guard).unwrap();
    assert_eq!(ints(result, &guard), [1, 2, 3]);
}

#[test]
fn unknown_keyword_is_rejected() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut body = BitcodeFunction::default();
    body.extend([
        Op::MakeFunction(BitcodeFunction::new("f")),
        Op::PushNull,
        Op::NewArgs,
        Op::LoadConst(Literal::Int(3)),
        Op::PushKeyword("c".into()),
        Op::Call,
        Op::Return,
    ]);
    let err = fiber.execute(link(body), &mut guard).unwrap_err();
    assert_eq!(thrown(&err, &guard), "unknown_keyword");
}

#[test]
fn variadic_parameters_collect_extras() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    // (a, *rest, **named) returns [a, rest.length, named.extra]
    let mut f = BitcodeFunction::new("f").with_signature(
        Signature::new(1)
            .variadic_positional()
            .variadic_keyword(),
    );
    f.extend([
        Op::NewArgs,
        Op::LoadLocal(2),
        Op::PushArg,
        Op::LoadLocal(3),
        Op::GetAttr("length".into()),
        Op::PushArg,
        Op::LoadLocal(4),
        Op::GetAttr("extra".into()),
        Op::PushArg,
        Op::NewArray,
        Op::Return,
    ]);
    let mut body = BitcodeFunction::default();
    body.extend([
        Op::MakeFunction(f),
        Op::PushNull,
        Op::NewArgs,
        Op::LoadConst(Literal::Int(1)),
        Op::PushArg,
        Op::LoadConst(Literal::Int(2)),
        Op::PushArg,
        Op::LoadConst(Literal::Int(3)),
        Op::PushArg,
        Op::LoadConst(Literal::Int(7)),
        Op::PushKeyword("extra".into()),
        Op::Call,
        Op::Return,
    ]);
    let result = fiber.execute(link(body), &mut guard).unwrap();
    assert_eq!(ints(result, &guard), [1, 2, 7]);
}

#[test]
fn try_catch_exposes_thrown_value() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut body = BitcodeFunction::default();
    let (start, end, catch) = (body.new_label(), body.new_label(), body.new_label());
    body.label(start);
    body.extend([Op::LoadConst(Literal::Int(5)), Op::Throw]);
    body.label(end);
    body.extend([Op::PushNull, Op::Return]);
    body.label(catch);
    body.extend([Op::PopErr, Op::GetAttr("value".into()), Op::Return]);
    body.protect(start, end, catch);

    let result = fiber.execute(link(body), &mut guard).unwrap();
    assert_eq!(result.as_i64(), Some(5));
}

#[test]
fn errors_propagate_to_the_calling_frame() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut fails = BitcodeFunction::new("fails");
    fails.extend([Op::LoadConst(Literal::Int(1)), Op::LoadConst(Literal::Int(0)), Op::Divide, Op::Return]);
    let mut body = BitcodeFunction::default();
    let (start, end, catch) = (body.new_label(), body.new_label(), body.new_label());
    body.label(start);
    body.extend([Op::MakeFunction(fails), Op::PushNull, Op::NewArgs, Op::Call]);
    body.label(end);
    body.push(Op::Return);
    body.label(catch);
    body.extend([
        Op::PopErr,
        Op::StoreLocal(2),
        Op::NewArgs,
        Op::LoadLocal(2),
        Op::GetAttr("value".into()),
        Op::PushArg,
        Op::LoadLocal(2),
        Op::GetAttr("kind".into()),
        Op::PushArg,
        Op::NewArray,
        Op::Return,
    ]);
    body.protect(start, end, catch);

    let result = fiber.execute(link(body), &mut guard).unwrap();
    let values = result.as_array().expect("array").load(&guard).expect("live").to_vec();
    assert_eq!(values[0].as_str(&guard), Some("divided_by_zero"));
    assert_eq!(values[1].as_str(&guard), Some("operator"));
}

#[test]
fn empty_try_region_never_handles() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut body = BitcodeFunction::default();
    let (start, catch) = (body.new_label(), body.new_label());
    body.label(start);
    body.extend([Op::LoadConst(Literal::Int(5)), Op::Throw]);
    body.label(catch);
    body.extend([Op::PushTrue, Op::Return]);
    body.protect(start, start, catch);

    let err = fiber.execute(link(body), &mut guard).unwrap_err();
    assert_eq!(err.thrown_value(&guard).and_then(|value| value.as_i64()), Some(5));
}

#[test]
fn closures_capture_their_own_cell() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let reader = || {
        let mut f = BitcodeFunction::new("read").with_capture(Capture::Local(2));
        f.extend([Op::LoadCapture(0), Op::Return]);
        f
    };
    let call = |slot| [Op::LoadLocal(slot), Op::PushNull, Op::NewArgs, Op::Call, Op::PushArg];

    let mut body = BitcodeFunction::default();
    body.extend([
        Op::LoadConst(Literal::Int(1)),
        Op::NewCell(2),
        Op::MakeFunction(reader()),
        Op::StoreLocal(3),
        Op::LoadConst(Literal::Int(2)),
        Op::NewCell(2),
        Op::MakeFunction(reader()),
        Op::StoreLocal(4),
        // Only the second closure shares the live instance.
        Op::LoadConst(Literal::Int(5)),
        Op::StoreCell(2),
        Op::NewArgs,
    ]);
    body.extend(call(3));
    body.extend(call(4));
    body.extend([Op::NewArray, Op::Return]);

    let result = fiber.execute(link(body), &mut guard).unwrap();
    assert_eq!(ints(result, &guard), [1, 5]);
}

#[test]
fn closures_write_through_shared_cells() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut increment = BitcodeFunction::new("increment").with_capture(Capture::Local(2));
    increment.extend([
        Op::LoadCapture(0),
        Op::LoadConst(Literal::Int(1)),
        Op::Add,
        Op::StoreCapture(0),
        Op::PushNull,
        Op::Return,
    ]);
    let mut body = BitcodeFunction::default();
    body.extend([
        Op::LoadConst(Literal::Int(10)),
        Op::NewCell(2),
        Op::MakeFunction(increment),
        Op::StoreLocal(3),
    ]);
    for _ in 0..3 {
        body.extend([Op::LoadLocal(3), Op::PushNull, Op::NewArgs, Op::Call, Op::Pop]);
    }
    body.extend([Op::LoadCell(2), Op::Return]);

    let result = fiber.execute(link(body), &mut guard).unwrap();
    assert_eq!(result.as_i64(), Some(13));
}

#[test]
fn sealed_objects_reject_new_attributes() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut body = BitcodeFunction::default();
    let (start, end, catch) = (body.new_label(), body.new_label(), body.new_label());
    body.extend([
        Op::NewArgs,
        Op::LoadConst(Literal::Int(1)),
        Op::PushKeyword("a".into()),
        Op::NewObject,
        Op::Seal,
        Op::StoreLocal(2),
        Op::LoadLocal(2),
        Op::LoadConst(Literal::Int(2)),
        Op::SetAttr("a".into()),
    ]);
    body.label(start);
    body.extend([Op::LoadLocal(2), Op::LoadConst(Literal::Int(3)), Op::SetAttr("b".into())]);
    body.label(end);
    body.extend([Op::PushNull, Op::Return]);
    body.label(catch);
    body.extend([
        Op::NewArgs,
        Op::PopErr,
        Op::GetAttr("value".into()),
        Op::PushArg,
        Op::LoadLocal(2),
        Op::GetAttr("a".into()),
        Op::PushArg,
        Op::NewArray,
        Op::Return,
    ]);
    body.protect(start, end, catch);

    let result = fiber.execute(link(body), &mut guard).unwrap();
    let values = result.as_array().expect("array").load(&guard).expect("live").to_vec();
    assert_eq!(values[0].as_str(&guard), Some("sealed"));
    assert_eq!(values[1].as_i64(), Some(2));
}

#[test]
fn const_attributes_accept_one_assignment() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut body = BitcodeFunction::default();
    body.extend([
        Op::LoadLocal(1),
        Op::LoadConst(Literal::Int(1)),
        Op::DeclareConst("x".into()),
        Op::LoadLocal(1),
        Op::LoadConst(Literal::Int(2)),
        Op::SetAttr("x".into()),
        Op::PushNull,
        Op::Return,
    ]);
    let err = fiber.execute(link(body), &mut guard).unwrap_err();
    assert_eq!(thrown(&err, &guard), "immutable");
}

#[test]
fn locked_attributes_reject_writes() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut body = BitcodeFunction::default();
    body.extend([
        Op::LoadConst(Literal::Int(1)),
        Op::StoreGlobal("y".into()),
        Op::LoadLocal(1),
        Op::Lock("y".into()),
        Op::LoadConst(Literal::Int(2)),
        Op::StoreGlobal("y".into()),
        Op::PushNull,
        Op::Return,
    ]);
    let err = fiber.execute(link(body), &mut guard).unwrap_err();
    assert_eq!(thrown(&err, &guard), "locked");
}

#[test]
fn unexported_globals_are_forbidden() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut library = BitcodeFunction::default();
    library.extend([
        Op::LoadConst(Literal::Int(1)),
        Op::StoreGlobal("public".into()),
        Op::LoadLocal(1),
        Op::Export("public".into()),
        Op::LoadConst(Literal::Int(2)),
        Op::StoreGlobal("private".into()),
        Op::PushNull,
        Op::Return,
    ]);
    vm.register_module(
        BitcodeModule::new("library", library).link().expect("linked"),
        &guard,
    );

    let mut body = BitcodeFunction::default();
    body.extend([
        Op::LoadModule("library".into()),
        Op::GetAttr("public".into()),
        Op::Pop,
        Op::LoadModule("library".into()),
        Op::GetAttr("private".into()),
        Op::Return,
    ]);
    let err = fiber.execute(link(body), &mut guard).unwrap_err();
    assert_eq!(thrown(&err, &guard), "forbidden");
}

#[test]
fn native_modules_load_once() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let loads = Arc::new(AtomicUsize::new(0));
    vm.register_native_module("host", {
        let loads = loads.clone();
        move |module| {
            loads.fetch_add(1, Ordering::Relaxed);
            module.define("answer", 42_i64)?;
            module.define_fn("double", |_context, _receiver, args| {
                let value = args.positional().first().and_then(Value::as_i64).unwrap_or_default();
                Ok(Value::Int(value * 2))
            })
        }
    });
    let fiber = vm.spawn(&guard);

    let mut body = BitcodeFunction::default();
    let mismatch = body.new_label();
    body.extend([
        Op::LoadModule("host".into()),
        Op::LoadModule("host".into()),
        Op::Equal,
        Op::JumpIfNot(mismatch),
        Op::LoadModule("host".into()),
        Op::NewArgs,
        Op::LoadModule("host".into()),
        Op::GetAttr("answer".into()),
        Op::PushArg,
        Op::Invoke("double".into()),
        Op::Return,
    ]);
    body.label(mismatch);
    body.extend([Op::PushFalse, Op::Return]);

    let result = fiber.execute(link(body), &mut guard).unwrap();
    assert_eq!(result.as_i64(), Some(84));
    let loaded = fiber.load_module("host", &mut guard).unwrap();
    assert_eq!(loaded.as_object(), vm.module_object("host"));
    assert_eq!(loads.load(Ordering::Relaxed), 1);
}

#[test]
fn module_code_runs_once() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut counter = BitcodeFunction::default();
    counter.extend([
        Op::LoadConst(Literal::Int(1)),
        Op::StoreGlobal("count".into()),
        Op::LoadLocal(1),
        Op::Export("count".into()),
        Op::PushNull,
        Op::Return,
    ]);
    vm.register_module(
        BitcodeModule::new("counter", counter).link().expect("linked"),
        &guard,
    );

    let first = fiber.load_module("counter", &mut guard).unwrap();
    let object = first.as_object().expect("object");
    object
        .load(&guard)
        .expect("live")
        .set(SymbolRef::from("count"), Value::Int(2), object.load(&guard).expect("live").module())
        .unwrap();
    let second = fiber.load_module("counter", &mut guard).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        object
            .load(&guard)
            .expect("live")
            .lookup(SymbolRef::from("count"))
            .and_then(|value| value.as_i64()),
        Some(2)
    );
}

#[test]
fn circular_imports_observe_uninitialized_attributes() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut a = BitcodeFunction::default();
    a.extend([
        Op::LoadModule("b".into()),
        Op::Pop,
        Op::LoadLocal(1),
        Op::LoadConst(Literal::Int(1)),
        Op::DeclareConst("x".into()),
        Op::LoadLocal(1),
        Op::Export("x".into()),
        Op::PushNull,
        Op::Return,
    ]);
    let mut b = BitcodeFunction::default();
    b.extend([Op::LoadModule("a".into()), Op::GetAttr("x".into()), Op::Return]);
    vm.register_module(BitcodeModule::new("a", a).link().expect("linked"), &guard);
    vm.register_module(BitcodeModule::new("b", b).link().expect("linked"), &guard);

    let err = fiber.load_module("a", &mut guard).unwrap_err();
    assert_eq!(thrown(&err, &guard), "uninitialized");
    let err = fiber.load_module("a", &mut guard).unwrap_err();
    assert_eq!(thrown(&err, &guard), "module_failed");
}

#[test]
fn missing_modules_are_catchable() {
    let mut guard = CollectionGuard::acquire();
    let dir = std::env::temp_dir().join("refrain-missing-module");
    let vm = Vm::with_finder(
        crate::vm::module::ModuleFinder::new().with_working_directory(dir),
        &guard,
    );
    let fiber = vm.spawn(&guard);

    let mut body = BitcodeFunction::default();
    let (start, end, catch) = (body.new_label(), body.new_label(), body.new_label());
    body.label(start);
    body.push(Op::LoadModule("does_not_exist".into()));
    body.label(end);
    body.push(Op::Return);
    body.label(catch);
    body.extend([Op::PopErr, Op::GetAttr("value".into()), Op::Return]);
    body.protect(start, end, catch);

    let result = fiber.execute(link(body), &mut guard).unwrap();
    assert_eq!(result.as_str(&guard), Some("module_not_found"));
}

#[test]
fn deep_recursion() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut body = BitcodeFunction::default();
    body.extend([
        Op::MakeFunction(countdown()),
        Op::PushNull,
        Op::NewArgs,
        Op::LoadConst(Literal::Int(100_000)),
        Op::PushArg,
        Op::Call,
        Op::Return,
    ]);
    let result = fiber.execute(link(body), &mut guard).unwrap();
    assert_eq!(result.as_i64(), Some(100_000));
}

#[test]
fn max_depth_is_catchable() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);
    fiber.set_max_depth(50);

    let mut body = BitcodeFunction::default();
    let (start, end, catch) = (body.new_label(), body.new_label(), body.new_label());
    body.label(start);
    body.extend([
        Op::MakeFunction(countdown()),
        Op::PushNull,
        Op::NewArgs,
        Op::LoadConst(Literal::Int(1_000)),
        Op::PushArg,
        Op::Call,
    ]);
    body.label(end);
    body.push(Op::Return);
    body.label(catch);
    body.extend([Op::PopErr, Op::GetAttr("value".into()), Op::Return]);
    body.protect(start, end, catch);

    let result = fiber.execute(link(body), &mut guard).unwrap();
    assert_eq!(result.as_str(&guard), Some("stack_overflow"));
    assert!(fiber.context(&mut guard).backtrace().is_empty());
}

#[test]
fn budgeting() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut body = BitcodeFunction::default();
    body.extend([
        Op::LoadConst(Literal::Int(1)),
        Op::LoadConst(Literal::Int(2)),
        Op::Add,
        Op::Return,
    ]);
    // Turn on budgeting, but don't give any budget.
    fiber.set_steps_per_charge(1);
    fiber.increase_budget(0);
    assert_eq!(
        fiber.execute(link(body), &mut guard).unwrap_err(),
        ExecutionError::NoBudget
    );
    for _ in 0..3 {
        // Step through by allowing one instruction at a time.
        fiber.increase_budget(1);
        assert_eq!(fiber.resume(&mut guard).unwrap_err(), ExecutionError::NoBudget);
    }
    fiber.increase_budget(1);
    assert_eq!(fiber.resume(&mut guard).unwrap().as_i64(), Some(3));
}

#[test]
fn nested_native_calls() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    vm.register_native_module("host", |module| {
        module.define_fn("apply", |context, _receiver, args| {
            let callable = args.positional().first().copied().unwrap_or_default();
            let result = context.call(callable, Value::Null, ArgumentVector::new().with(20_i64))?;
            Ok(result)
        })
    });
    let fiber = vm.spawn(&guard);

    let mut add_one = BitcodeFunction::new("add_one").with_signature(Signature::new(1));
    add_one.extend([Op::LoadLocal(2), Op::LoadConst(Literal::Int(1)), Op::Add, Op::Return]);
    let mut body = BitcodeFunction::default();
    body.extend([
        Op::LoadModule("host".into()),
        Op::NewArgs,
        Op::MakeFunction(add_one),
        Op::PushArg,
        Op::Invoke("apply".into()),
        Op::Return,
    ]);
    let result = fiber.execute(link(body), &mut guard).unwrap();
    assert_eq!(result.as_i64(), Some(21));
}

/// A method returning the sum of the receiver's `x` and `y`.
fn sum_method() -> BitcodeFunction {
    let mut sum = BitcodeFunction::new("sum");
    sum.extend([
        Op::LoadLocal(1),
        Op::GetAttr("x".into()),
        Op::LoadLocal(1),
        Op::GetAttr("y".into()),
        Op::Add,
        Op::Return,
    ]);
    sum
}

fn construct_point(template: BitcodeTemplate) -> [Op; 8] {
    [
        Op::LoadConst(Literal::Template(template)),
        Op::PushNull,
        Op::NewArgs,
        Op::LoadConst(Literal::Int(3)),
        Op::PushKeyword("x".into()),
        Op::LoadConst(Literal::Int(4)),
        Op::PushKeyword("y".into()),
        Op::Call,
    ]
}

#[test]
fn templates_construct_bound_instances() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut body = BitcodeFunction::default();
    body.extend(construct_point(BitcodeTemplate::new("Point").with_method(sum_method())));
    body.extend([
        Op::Dup,
        Op::LoadConst(Literal::Int(5)),
        Op::SetAttr("z".into()),
        Op::NewArgs,
        Op::Invoke("sum".into()),
        Op::Return,
    ]);
    let result = fiber.execute(link(body), &mut guard).unwrap();
    assert_eq!(result.as_i64(), Some(7));
}

#[test]
fn sealed_templates_reject_new_attributes() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut body = BitcodeFunction::default();
    body.extend(construct_point(
        BitcodeTemplate::new("Point").sealed().with_method(sum_method()),
    ));
    body.extend([
        Op::Dup,
        Op::LoadConst(Literal::Int(1)),
        Op::SetAttr("x".into()),
        Op::LoadConst(Literal::Int(0)),
        Op::SetAttr("z".into()),
        Op::PushNull,
        Op::Return,
    ]);
    let err = fiber.execute(link(body), &mut guard).unwrap_err();
    assert_eq!(thrown(&err, &guard), "sealed");
}

#[test]
fn operator_overloads() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    // An object whose `==` compares against its `id` attribute.
    let mut equal = BitcodeFunction::new("==").with_signature(Signature::new(1));
    equal.extend([Op::LoadLocal(1), Op::GetAttr("id".into()), Op::LoadLocal(2), Op::Equal, Op::Return]);
    let mut body = BitcodeFunction::default();
    body.extend([
        Op::NewArgs,
        Op::LoadConst(Literal::Int(9)),
        Op::PushKeyword("id".into()),
        Op::MakeFunction(equal),
        Op::PushKeyword("==".into()),
        Op::NewObject,
        Op::StoreLocal(2),
        Op::NewArgs,
        Op::LoadLocal(2),
        Op::LoadConst(Literal::Int(9)),
        Op::Equal,
        Op::PushArg,
        Op::LoadLocal(2),
        Op::LoadConst(Literal::Int(9)),
        Op::NotEqual,
        Op::PushArg,
        Op::LoadLocal(2),
        Op::LoadConst(Literal::Int(1)),
        Op::NotEqual,
        Op::PushArg,
        Op::NewArray,
        Op::Return,
    ]);
    let result = fiber.execute(link(body), &mut guard).unwrap();
    let values = result.as_array().expect("array").load(&guard).expect("live").to_vec();
    assert_eq!(
        values.iter().map(|value| value.as_bool()).collect::<Vec<_>>(),
        [Some(true), Some(false), Some(true)]
    );
}

#[test]
fn unrooted_values_are_collected() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut body = BitcodeFunction::default();
    body.extend([
        Op::NewArgs,
        Op::LoadConst(Literal::Int(1)),
        Op::PushArg,
        Op::NewArray,
        Op::StoreGlobal("kept".into()),
        Op::PushNull,
        Op::Return,
    ]);
    fiber.execute(link(body), &mut guard).unwrap();

    let orphan = Ref::new(Array::new(), &guard);
    guard.collect();
    assert!(orphan.load(&guard).is_none());

    let globals = vm.module_object("test").expect("registered");
    let kept = globals
        .load(&guard)
        .expect("live")
        .lookup(SymbolRef::from("kept"))
        .and_then(|value| value.as_array())
        .expect("array");
    assert_eq!(kept.load(&guard).expect("live").len(), 1);
}

#[test]
fn artifacts_execute_identically() {
    let mut guard = CollectionGuard::acquire();

    let mut body = BitcodeFunction::default();
    let (start, end, catch) = (body.new_label(), body.new_label(), body.new_label());
    body.label(start);
    body.extend([
        Op::MakeFunction(countdown()),
        Op::PushNull,
        Op::NewArgs,
        Op::LoadConst(Literal::Int(12)),
        Op::PushArg,
        Op::Call,
        Op::StoreGlobal("count".into()),
        Op::LoadConst(Literal::String("done".into())),
        Op::Throw,
    ]);
    body.label(end);
    body.label(catch);
    body.extend([
        Op::PopErr,
        Op::GetAttr("value".into()),
        Op::LoadConst(Literal::Float(0.5)),
        Op::LoadGlobal("count".into()),
        Op::Multiply,
        Op::StoreGlobal("half".into()),
        Op::Return,
    ]);
    body.protect(start, end, catch);
    let linked = link(body);
    let decoded = artifact::decode("test", &artifact::encode(&linked).expect("encoded")).expect("decoded");
    assert_eq!(decoded, linked);

    let mut outcomes = Vec::new();
    for module in [linked, decoded] {
        let vm = Vm::new(&guard);
        let fiber = vm.spawn(&guard);
        let result = fiber.execute(module, &mut guard).unwrap();
        let globals = vm.module_object("test").expect("registered");
        let globals = globals.load(&guard).expect("live");
        outcomes.push((
            result.as_str(&guard).map(String::from),
            globals.lookup(SymbolRef::from("count")).and_then(|v| v.as_i64()),
            globals.lookup(SymbolRef::from("half")).and_then(|v| v.as_f64()),
        ));
    }
    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(
        outcomes[0],
        (Some(String::from("done")), Some(12), Some(6.0))
    );
}

/// Registers a native `host` module whose `collect` function runs a full
/// collection.
fn register_collecting_host(vm: &Vm) {
    vm.register_native_module("host", |module| {
        module.define_fn("collect", |context, _receiver, _args| {
            context.while_unlocked(|guard| guard.collect());
            Ok(Value::Null)
        })?;
        module.define_fn("apply", |context, _receiver, args| {
            let callable = args.positional().first().copied().unwrap_or_default();
            let array = args
                .positional()
                .get(1)
                .and_then(Value::as_array)
                .ok_or(Fault::ArgumentCount)?;
            context.call(callable, Value::Null, ArgumentVector::new())?;
            Ok(Value::Bool(array.load(context.guard()).is_some()))
        })
    });
}

#[test]
fn native_arguments_survive_reentrant_collection() {
    initialize_tracing();
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    register_collecting_host(&vm);
    let fiber = vm.spawn(&guard);

    // The array is only reachable through the arguments of `apply` while
    // `collect` runs beneath it.
    let mut body = BitcodeFunction::default();
    body.extend([
        Op::LoadModule("host".into()),
        Op::NewArgs,
        Op::LoadModule("host".into()),
        Op::GetAttr("collect".into()),
        Op::PushArg,
        Op::NewArgs,
        Op::LoadConst(Literal::Int(1)),
        Op::PushArg,
        Op::NewArray,
        Op::PushArg,
        Op::Invoke("apply".into()),
        Op::Return,
    ]);
    let result = fiber.execute(link(body), &mut guard).unwrap();
    assert_eq!(result, Value::Bool(true));
}

#[test]
fn deep_stacks_survive_collection() {
    initialize_tracing();
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    register_collecting_host(&vm);
    let fiber = vm.spawn(&guard);

    // Counts down like `countdown`, but collects once the bottom is reached.
    let mut descend = BitcodeFunction::new("descend").with_signature(Signature::new(1));
    let recurse = descend.new_label();
    descend.extend([
        Op::LoadLocal(2),
        Op::LoadConst(Literal::Int(0)),
        Op::Equal,
        Op::JumpIfNot(recurse),
        Op::LoadModule("host".into()),
        Op::NewArgs,
        Op::Invoke("collect".into()),
        Op::Pop,
        Op::LoadConst(Literal::Int(0)),
        Op::Return,
    ]);
    descend.label(recurse);
    descend.extend([
        Op::LoadLocal(0),
        Op::PushNull,
        Op::NewArgs,
        Op::LoadLocal(2),
        Op::LoadConst(Literal::Int(1)),
        Op::Subtract,
        Op::PushArg,
        Op::Call,
        Op::LoadConst(Literal::Int(1)),
        Op::Add,
        Op::Return,
    ]);

    let mut body = BitcodeFunction::default();
    body.extend([
        Op::NewArgs,
        Op::LoadConst(Literal::Int(1)),
        Op::PushArg,
        Op::NewArray,
        Op::StoreLocal(2),
        Op::MakeFunction(descend),
        Op::PushNull,
        Op::NewArgs,
        Op::LoadConst(Literal::Int(100_000)),
        Op::PushArg,
        Op::Call,
        Op::LoadLocal(2),
        Op::GetAttr("length".into()),
        Op::Add,
        Op::Return,
    ]);
    let result = fiber.execute(link(body), &mut guard).unwrap();
    assert_eq!(result.as_i64(), Some(100_001));
}

#[test]
fn abandoned_module_loads_fail_for_later_loaders() {
    initialize_tracing();
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);

    let mut slow = BitcodeFunction::default();
    slow.extend([
        Op::LoadConst(Literal::Int(1)),
        Op::StoreGlobal("value".into()),
        Op::LoadConst(Literal::Int(2)),
        Op::StoreGlobal("value".into()),
        Op::PushNull,
        Op::Return,
    ]);
    vm.register_module(
        BitcodeModule::new("slow", slow).link().expect("linked"),
        &guard,
    );

    let abandoned = vm.spawn(&guard);
    abandoned.set_steps_per_charge(1);
    abandoned.increase_budget(1);
    assert_eq!(
        abandoned.load_module("slow", &mut guard).unwrap_err(),
        ExecutionError::NoBudget
    );
    drop(abandoned);
    guard.collect();

    let fiber = vm.spawn(&guard);
    let mut body = BitcodeFunction::default();
    body.extend([Op::LoadModule("slow".into()), Op::Return]);
    let err = fiber
        .execute_for(link(body), Duration::from_secs(5), &mut guard)
        .unwrap_err();
    assert_eq!(thrown(&err, &guard), "module_failed");
}

#[test]
fn template_keywords_cannot_replace_methods() {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    let fiber = vm.spawn(&guard);

    let mut body = BitcodeFunction::default();
    body.extend([
        Op::LoadConst(Literal::Template(
            BitcodeTemplate::new("Point").with_method(sum_method()),
        )),
        Op::PushNull,
        Op::NewArgs,
        Op::LoadConst(Literal::Int(1)),
        Op::PushKeyword("sum".into()),
        Op::Call,
        Op::Return,
    ]);
    let err = fiber.execute(link(body), &mut guard).unwrap_err();
    assert_eq!(thrown(&err, &guard), "immutable");
}

#[test]
fn oversized_captures_fail_to_encode() {
    let code = Code::new(
        None,
        Signature::new(0),
        vec![Capture::Captured(u32::MAX)],
        vec![Instruction {
            opcode: Opcode::Return,
            operand: 0,
            handler: None,
            range: SourceRange::default(),
        }],
    );
    let module = LinkedModule::new("oversized", vec![Constant::Code(code)]).expect("valid");
    assert_eq!(artifact::encode(&module).unwrap_err(), LinkError::TooLarge);
}
