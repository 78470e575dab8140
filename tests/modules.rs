use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use refrain::refuse::CollectionGuard;
use refrain::runtime::symbol::SymbolRef;
use refrain::runtime::value::Value;
use refrain::vm::bitcode::{BitcodeFunction, BitcodeModule, Literal, Op};
use refrain::vm::module::{ModuleFinder, SourceCompiler};
use refrain::vm::{artifact, ExecutionError, Vm};
use tracing_subscriber::filter::LevelFilter;

fn initialize_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .try_init();
}

/// Compiles a source file containing a single integer into a module that
/// exports it as `value`.
#[derive(Clone, Default)]
struct IntCompiler {
    compiled: Arc<AtomicUsize>,
    delay: Duration,
}

impl IntCompiler {
    fn count(&self) -> usize {
        self.compiled.load(Ordering::SeqCst)
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

fn exporting(name: &str, value: i64) -> BitcodeModule {
    let mut body = BitcodeFunction::default();
    body.extend([
        Op::LoadConst(Literal::Int(value)),
        Op::StoreGlobal("value".into()),
        Op::LoadLocal(1),
        Op::Export("value".into()),
        Op::PushNull,
        Op::Return,
    ]);
    BitcodeModule::new(name, body)
}

impl SourceCompiler for IntCompiler {
    fn compile(&self, name: &str, source: &str) -> Result<BitcodeModule, String> {
        self.compiled.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        let value = source.trim().parse().map_err(|err| format!("{err}"))?;
        Ok(exporting(name, value))
    }
}

fn scratch(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("refrain-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&path);
    fs::create_dir_all(&path).unwrap();
    path
}

fn write_artifact(path: &Path, name: &str, value: i64) {
    let module = exporting(name, value).link().unwrap();
    fs::write(path, artifact::encode(&module).unwrap()).unwrap();
}

fn set_modified(path: &Path, time: SystemTime) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(time)
        .unwrap();
}

/// Loads `name` and returns its exported `value`, or the name of the raised
/// error.
fn load(finder: ModuleFinder, name: &str) -> Result<Option<i64>, String> {
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::with_finder(finder, &guard);
    let fiber = vm.spawn(&guard);
    match fiber.load_module(name, &mut guard) {
        Ok(module) => Ok(module
            .as_object()
            .and_then(|object| object.load(&guard))
            .and_then(|object| object.lookup(SymbolRef::from("value")))
            .and_then(|value| value.as_i64())),
        Err(ExecutionError::Link(err)) => Err(format!("link: {err}")),
        Err(err) => Err(err
            .thrown_value(&guard)
            .and_then(|value| value.as_str(&guard).map(String::from))
            .unwrap_or_else(|| err.to_string())),
    }
}

#[test]
fn sources_are_compiled_and_cached() {
    initialize_tracing();
    let dir = scratch("compile");
    fs::write(dir.join("answer.rf"), "42").unwrap();
    let compiler = IntCompiler::default();
    let finder = ModuleFinder::new()
        .with_working_directory(&dir)
        .with_compiler(compiler.clone());

    assert_eq!(load(finder.clone(), "answer").unwrap(), Some(42));
    assert_eq!(compiler.count(), 1);
    assert!(dir.join("answer.rfc").exists());

    // The cache is now at least as new as the source.
    assert_eq!(load(finder, "answer").unwrap(), Some(42));
    assert_eq!(compiler.count(), 1);
}

#[test]
fn fresh_cache_wins_over_source() {
    let dir = scratch("fresh-cache");
    let now = SystemTime::now();
    fs::write(dir.join("m.rf"), "1").unwrap();
    write_artifact(&dir.join("m.rfc"), "m", 2);
    set_modified(&dir.join("m.rf"), now - Duration::from_secs(60));
    set_modified(&dir.join("m.rfc"), now);
    let compiler = IntCompiler::default();
    let finder = ModuleFinder::new()
        .with_working_directory(&dir)
        .with_compiler(compiler.clone());

    assert_eq!(load(finder, "m").unwrap(), Some(2));
    assert_eq!(compiler.count(), 0);
}

#[test]
fn newer_source_is_recompiled() {
    let dir = scratch("stale-cache");
    let now = SystemTime::now();
    fs::write(dir.join("m.rf"), "1").unwrap();
    write_artifact(&dir.join("m.rfc"), "m", 2);
    set_modified(&dir.join("m.rfc"), now - Duration::from_secs(60));
    set_modified(&dir.join("m.rf"), now);
    let compiler = IntCompiler::default();
    let finder = ModuleFinder::new()
        .with_working_directory(&dir)
        .with_compiler(compiler.clone())
        .with_cache_writes(false);

    assert_eq!(load(finder, "m").unwrap(), Some(1));
    assert_eq!(compiler.count(), 1);
}

#[test]
fn unreadable_cache_falls_back_to_source() {
    let dir = scratch("corrupt-cache");
    let now = SystemTime::now();
    fs::write(dir.join("m.rf"), "3").unwrap();
    fs::write(dir.join("m.rfc"), b"not an artifact").unwrap();
    set_modified(&dir.join("m.rf"), now - Duration::from_secs(60));
    set_modified(&dir.join("m.rfc"), now);
    let compiler = IntCompiler::default();
    let finder = ModuleFinder::new()
        .with_working_directory(&dir)
        .with_compiler(compiler.clone());

    assert_eq!(load(finder, "m").unwrap(), Some(3));
    assert_eq!(compiler.count(), 1);
}

#[test]
fn cache_without_source() {
    let dir = scratch("cache-only");
    write_artifact(&dir.join("m.rfc"), "m", 4);
    let finder = ModuleFinder::new().with_working_directory(&dir);
    assert_eq!(load(finder, "m").unwrap(), Some(4));

    fs::write(dir.join("broken.rfc"), [0, 0]).unwrap();
    let finder = ModuleFinder::new().with_working_directory(&dir);
    let err = load(finder, "broken").unwrap_err();
    assert!(err.starts_with("link"), "{err}");
}

#[test]
fn search_order() {
    let std = scratch("order-std");
    let search = scratch("order-search");
    let working = scratch("order-working");
    fs::write(std.join("m.rf"), "1").unwrap();
    fs::write(search.join("m.rf"), "2").unwrap();
    fs::write(search.join("n.rf"), "2").unwrap();
    fs::write(working.join("n.rf"), "3").unwrap();
    fs::write(working.join("o.rf"), "3").unwrap();
    let finder = ModuleFinder::new()
        .with_std_path(&std)
        .with_search_path(&search)
        .with_working_directory(&working)
        .with_compiler(IntCompiler::default())
        .with_cache_writes(false);

    assert_eq!(
        finder.directories(),
        [std.clone(), search.clone(), working.clone()]
    );
    assert_eq!(load(finder.clone(), "m").unwrap(), Some(1));
    assert_eq!(load(finder.clone(), "n").unwrap(), Some(2));
    assert_eq!(load(finder, "o").unwrap(), Some(3));
}

#[test]
fn dotted_names_are_nested_paths() {
    let dir = scratch("dotted");
    fs::create_dir_all(dir.join("outer")).unwrap();
    fs::write(dir.join("outer").join("inner.rf"), "5").unwrap();
    let finder = ModuleFinder::new()
        .with_working_directory(&dir)
        .with_compiler(IntCompiler::default());

    assert_eq!(load(finder, "outer.inner").unwrap(), Some(5));
}

#[test]
fn resolution_errors() {
    let dir = scratch("errors");
    fs::write(dir.join("m.rf"), "not a number").unwrap();
    fs::write(dir.join("uncompiled.rf"), "1").unwrap();

    let finder = ModuleFinder::new().with_working_directory(&dir);
    assert_eq!(
        load(finder.clone(), "1invalid").unwrap_err(),
        "invalid_module_name"
    );
    assert_eq!(load(finder.clone(), "missing").unwrap_err(), "module_not_found");
    assert_eq!(
        load(finder.clone(), "uncompiled").unwrap_err(),
        "module_unavailable"
    );

    let finder = finder.with_compiler(IntCompiler::default());
    assert_eq!(load(finder, "m").unwrap_err(), "module_unavailable");
}

#[test]
fn concurrent_loads_share_one_initialization() {
    initialize_tracing();
    let guard = CollectionGuard::acquire();
    let vm = Vm::new(&guard);
    drop(guard);
    let initialized = Arc::new(AtomicUsize::new(0));
    vm.register_native_module("slow", {
        let initialized = initialized.clone();
        move |module| {
            initialized.fetch_add(1, Ordering::SeqCst);
            module.context().while_unlocked(|guard| {
                guard.while_unlocked(|| thread::sleep(Duration::from_millis(50)));
            });
            module.define("value", 7_i64)
        }
    });

    let loaders = (0..4)
        .map(|_| {
            let vm = vm.clone();
            thread::spawn(move || {
                let mut guard = CollectionGuard::acquire();
                let fiber = vm.spawn(&guard);
                let module = fiber.load_module("slow", &mut guard).unwrap();
                let value = module
                    .as_object()
                    .and_then(|object| object.load(&guard))
                    .and_then(|object| object.lookup(SymbolRef::from("value")));
                (module.as_object(), value.and_then(|value: Value| value.as_i64()))
            })
        })
        .collect::<Vec<_>>();
    let results = loaders
        .into_iter()
        .map(|loader| loader.join().unwrap())
        .collect::<Vec<_>>();

    assert_eq!(initialized.load(Ordering::SeqCst), 1);
    for (object, value) in &results {
        assert_eq!(*object, results[0].0);
        assert_eq!(*value, Some(7));
    }
}

#[test]
fn concurrent_source_loads_register_one_module() {
    initialize_tracing();
    let dir = scratch("concurrent");
    fs::write(dir.join("shared.rf"), "9").unwrap();
    let compiler = IntCompiler::default().with_delay(Duration::from_millis(50));
    let finder = ModuleFinder::new()
        .with_working_directory(&dir)
        .with_compiler(compiler.clone())
        .with_cache_writes(false);
    let mut guard = CollectionGuard::acquire();
    let vm = Vm::with_finder(finder, &guard);

    let loaders = (0..4)
        .map(|_| {
            let vm = vm.clone();
            thread::spawn(move || {
                let mut guard = CollectionGuard::acquire();
                let fiber = vm.spawn(&guard);
                let module = fiber.load_module("shared", &mut guard).unwrap();
                let value = module
                    .as_object()
                    .and_then(|object| object.load(&guard))
                    .and_then(|object| object.lookup(SymbolRef::from("value")));
                (module.as_object(), value.and_then(|value: Value| value.as_i64()))
            })
        })
        .collect::<Vec<_>>();
    // Collections run while the loaders are reading files and parked.
    for _ in 0..3 {
        guard.collect();
        guard.while_unlocked(|| thread::sleep(Duration::from_millis(20)));
    }
    drop(guard);
    let results = loaders
        .into_iter()
        .map(|loader| loader.join().unwrap())
        .collect::<Vec<_>>();

    assert!(compiler.count() >= 1);
    for (object, value) in &results {
        assert_eq!(*object, results[0].0);
        assert_eq!(*value, Some(9));
    }
}
