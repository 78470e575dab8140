//! The virtual machine: modules, fibers, and the instruction driver.
//!
//! A [`Vm`] holds the module table shared by every [`Fiber`] spawned from
//! it. A fiber executes one chain of frames. Guest calls never recurse on the
//! native stack: calling an interpreted function pushes a frame that the
//! driver loop in [`FiberContext`] picks up, and returning pops it.

use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashSet;
use alot::{LotId, Lots};
use crossbeam_utils::sync::Parker;
use kempt::Map;
use parking_lot::{Mutex, MutexGuard};
use refuse::{AnyRef, CollectionGuard, NoMapping, Ref, Root, Trace};

use crate::runtime::args::ArgumentVector;
use crate::runtime::cell::Cell;
use crate::runtime::exception::{ErrorCategory, Exception};
use crate::runtime::function::{Function, NativeFunction};
use crate::runtime::object::Object;
use crate::runtime::symbol::{Symbol, SymbolRef};
use crate::runtime::value::Value;
use crate::vm::code::LinkedModule;
use crate::vm::dispatch::{Invocation, Step};
use crate::vm::frame::{Continuation, Frame, Scope};
use crate::vm::module::{
    FinderError, Module, ModuleFinder, ModuleId, ModuleInitializer, ModuleState, NativeModule,
};
use crate::ErrorKind;

pub mod artifact;
pub mod bitcode;
pub mod code;
mod dispatch;
mod frame;
pub mod module;

pub use self::code::LinkError;
pub use self::frame::StackFrame;

/// A virtual machine: the table of modules and how to find new ones.
///
/// Cloning a [`Vm`] produces another handle to the same machine.
#[derive(Clone)]
pub struct Vm {
    memory: Root<VmMemory>,
}

impl Vm {
    /// Returns a new virtual machine that locates modules with the default
    /// [`ModuleFinder`].
    ///
    /// Virtual machines are allocated within the [`refuse`] garbage
    /// collector. The module table is a root for every module object and
    /// constant it contains.
    #[must_use]
    pub fn new(guard: &CollectionGuard) -> Self {
        Self::with_finder(ModuleFinder::default(), guard)
    }

    /// Returns a new virtual machine that locates modules using `finder`.
    #[must_use]
    pub fn with_finder(finder: ModuleFinder, guard: &CollectionGuard) -> Self {
        Self {
            memory: Root::new(
                VmMemory(Mutex::new(VmState {
                    modules: Vec::new(),
                    by_name: Map::new(),
                    natives: Map::new(),
                    finder: Arc::new(finder),
                    waiting: Lots::new(),
                })),
                guard,
            ),
        }
    }

    fn state(&self) -> MutexGuard<'_, VmState> {
        self.memory.0.lock()
    }

    /// Replaces the module finder used for modules that have not been
    /// resolved yet.
    pub fn set_finder(&self, finder: ModuleFinder) {
        self.state().finder = Arc::new(finder);
    }

    /// Registers a host-native module.
    ///
    /// `initializer` is invoked the first time the module is loaded and
    /// populates the module object. Native modules take precedence over
    /// modules found on disk.
    pub fn register_native_module<F>(&self, name: impl Into<Symbol>, initializer: F)
    where
        F: Fn(&mut NativeModule<'_, '_, '_>) -> Result<(), Fault> + Send + Sync + 'static,
    {
        let initializer: ModuleInitializer = Arc::new(initializer);
        self.state().natives.insert(name.into(), initializer);
    }

    /// Registers a linked module without executing it.
    ///
    /// The module is executed the first time it is loaded by name. If a module
    /// with the same name was already registered, later loads find this one.
    pub fn register_module(&self, module: LinkedModule, guard: &CollectionGuard<'_>) -> ModuleId {
        self.state().register(module, guard)
    }

    /// Returns the object of the module registered as `name`, if any.
    #[must_use]
    pub fn module_object(&self, name: &str) -> Option<Ref<Object>> {
        let state = self.state();
        let id = state.by_name.get(&Symbol::from(name)).copied()?;
        Some(state.modules[id.0].object)
    }

    /// Returns a new fiber executing within this virtual machine.
    #[must_use]
    pub fn spawn(&self, guard: &CollectionGuard) -> Fiber {
        let id = self.state().waiting.push(None);
        Fiber {
            memory: Root::new(
                FiberMemory(Mutex::new(FiberState {
                    frames: Vec::new(),
                    native_calls: Vec::new(),
                    budget: Budget::default(),
                    counter: 16,
                    steps_per_charge: 16,
                    execute_until: None,
                    max_depth: usize::MAX,
                })),
                guard,
            ),
            vm: self.clone(),
            parker: Parker::new(),
            id,
        }
    }

    fn scope(&self, module: ModuleId) -> Result<Scope, Fault> {
        let state = self.state();
        let entry = state.modules.get(module.0).ok_or(Fault::InvalidInstruction)?;
        Ok(Scope {
            module,
            constants: entry.constants.clone(),
            globals: entry.object,
        })
    }

    fn finish_module(
        &self,
        id: ModuleId,
        error: Option<Value>,
        guard: &CollectionGuard<'_>,
    ) -> Ref<Object> {
        let mut state = self.state();
        let module = &mut state.modules[id.0];
        if let Some(error) = error {
            debug!(module = %module.name, "module failed to load");
            module.state = ModuleState::Failed(error);
        } else {
            debug!(module = %module.name, "module loaded");
            module.state = ModuleState::Loaded;
        }
        for waiter in module.waiters.drain(..) {
            waiter.unpark();
        }
        let object = module.object;
        drop(state);
        if let Some(loaded) = object.load(guard) {
            loaded.finish_initializing();
        }
        object
    }
}

struct VmMemory(Mutex<VmState>);

impl Trace for VmMemory {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        for module in &self.0.lock().modules {
            module.trace(tracer);
        }
    }
}

impl NoMapping for VmMemory {}

struct VmState {
    modules: Vec<Module>,
    by_name: Map<Symbol, ModuleId>,
    natives: Map<Symbol, ModuleInitializer>,
    finder: Arc<ModuleFinder>,
    // The module each fiber is parked waiting on.
    waiting: Lots<Option<ModuleId>>,
}

impl VmState {
    fn register(&mut self, module: LinkedModule, guard: &CollectionGuard<'_>) -> ModuleId {
        let id = ModuleId(self.modules.len());
        let name = module.name().clone();
        trace!(module = %name, ?id, "registering module");
        self.modules.push(Module::instantiate(id, module, guard));
        self.by_name.insert(name, id);
        id
    }

    fn register_native(&mut self, name: Symbol, guard: &CollectionGuard<'_>) -> ModuleId {
        let id = ModuleId(self.modules.len());
        self.modules.push(Module::native(id, name.clone(), guard));
        self.by_name.insert(name, id);
        id
    }

    /// Returns true if `waiter` parking until `loader` finishes would never
    /// wake because `loader` is itself waiting, directly or transitively, on
    /// a module `waiter` is loading.
    fn would_deadlock(&self, waiter: LotId, loader: LotId) -> bool {
        let mut current = loader;
        for _ in 0..=self.modules.len() {
            let Some(Some(module)) = self.waiting.get(current) else {
                return false;
            };
            match self.modules[module.0].state {
                ModuleState::Loading { fiber } if fiber == waiter => return true,
                ModuleState::Loading { fiber } => current = fiber,
                _ => return false,
            }
        }
        false
    }

    fn set_waiting(&mut self, fiber: LotId, module: Option<ModuleId>) {
        if let Some(waiting) = self.waiting.get_mut(fiber) {
            *waiting = module;
        }
    }
}

/// A single thread of execution within a [`Vm`].
///
/// Fibers share the module table of the virtual machine that spawned them,
/// but each has its own frames, budget, and limits.
pub struct Fiber {
    memory: Root<FiberMemory>,
    vm: Vm,
    parker: Parker,
    id: LotId,
}

impl Fiber {
    /// Returns the virtual machine this fiber belongs to.
    #[must_use]
    pub const fn vm(&self) -> &Vm {
        &self.vm
    }

    /// Locks this fiber for executing code.
    #[must_use]
    pub fn context<'context, 'guard>(
        &'context self,
        guard: &'context mut CollectionGuard<'guard>,
    ) -> FiberContext<'context, 'guard> {
        FiberContext {
            guard,
            vm: &self.vm,
            parker: &self.parker,
            id: self.id,
            fiber: self.memory.0.lock(),
        }
    }

    /// Registers `module` and executes its top-level code, returning the
    /// value it returns.
    pub fn execute(
        &self,
        module: LinkedModule,
        guard: &mut CollectionGuard,
    ) -> Result<Value, ExecutionError> {
        self.context(guard).execute(module)
    }

    /// Executes `module` for at most `duration` before returning
    /// [`ExecutionError::Timeout`].
    pub fn execute_for(
        &self,
        module: LinkedModule,
        duration: Duration,
        guard: &mut CollectionGuard,
    ) -> Result<Value, ExecutionError> {
        self.context(guard).execute_for(module, duration)
    }

    /// Executes `module` until `instant` before returning
    /// [`ExecutionError::Timeout`].
    pub fn execute_until(
        &self,
        module: LinkedModule,
        instant: Instant,
        guard: &mut CollectionGuard,
    ) -> Result<Value, ExecutionError> {
        self.context(guard).execute_until(module, instant)
    }

    /// Loads the module `name`, returning its module object.
    pub fn load_module(&self, name: &str, guard: &mut CollectionGuard) -> Result<Value, ExecutionError> {
        self.context(guard).load_module(name)
    }

    /// Calls `callable` with `receiver` and `args`.
    pub fn call(
        &self,
        callable: Value,
        receiver: Value,
        args: ArgumentVector,
        guard: &mut CollectionGuard,
    ) -> Result<Value, ExecutionError> {
        self.context(guard).call(callable, receiver, args)
    }

    /// Calls the method `name` of `target`.
    pub fn invoke(
        &self,
        target: Value,
        name: impl Into<SymbolRef>,
        args: ArgumentVector,
        guard: &mut CollectionGuard,
    ) -> Result<Value, ExecutionError> {
        self.context(guard).invoke(target, name, args)
    }

    /// Resumes executing after [`ExecutionError::NoBudget`] or
    /// [`ExecutionError::Timeout`].
    pub fn resume(&self, guard: &mut CollectionGuard) -> Result<Value, ExecutionError> {
        self.context(guard).resume()
    }

    /// Resumes executing for at most `duration`.
    pub fn resume_for(
        &self,
        duration: Duration,
        guard: &mut CollectionGuard,
    ) -> Result<Value, ExecutionError> {
        self.context(guard).resume_for(duration)
    }

    /// Resumes executing until `instant`.
    pub fn resume_until(
        &self,
        instant: Instant,
        guard: &mut CollectionGuard,
    ) -> Result<Value, ExecutionError> {
        self.context(guard).resume_until(instant)
    }

    /// Allows `amount` more instructions to execute.
    ///
    /// Budgeting is disabled until the first call.
    pub fn increase_budget(&self, amount: usize) {
        self.memory.0.lock().budget.allocate(amount);
    }

    /// Sets the number of instructions executed per budget charge.
    ///
    /// This is also how often the fiber yields to the garbage collector.
    pub fn set_steps_per_charge(&self, steps: u16) {
        self.memory.0.lock().set_steps_per_charge(steps);
    }

    /// Sets the maximum number of frames. Calls beyond this depth raise a
    /// `stack_overflow` error.
    pub fn set_max_depth(&self, depth: usize) {
        self.memory.0.lock().max_depth = depth;
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        let guard = CollectionGuard::acquire();
        let abandoned = {
            let mut state = self.vm.state();
            state.waiting.remove(self.id);
            state
                .modules
                .iter()
                .enumerate()
                .filter(|(_, module)| {
                    matches!(module.state, ModuleState::Loading { fiber } if fiber == self.id)
                })
                .map(|(index, _)| ModuleId(index))
                .collect::<Vec<_>>()
        };
        // Modules this fiber was still loading would otherwise stay loading
        // forever, parking every later loader.
        for id in abandoned {
            let error = Fault::ModuleFailed.envelope_with(Vec::new(), &guard);
            self.vm.finish_module(id, Some(error), &guard);
        }
    }
}

struct FiberMemory(Mutex<FiberState>);

impl Trace for FiberMemory {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        // Frames of a deep stack share most of their references, and the
        // collector's mark queue is bounded, so each allocation is marked
        // once.
        let mut found = AHashSet::<AnyRef>::new();
        let state = self.0.lock();
        for frame in &state.frames {
            frame.allocations(&mut found);
        }
        for call in &state.native_calls {
            found.extend(call.callable.as_any_ref());
            found.extend(call.receiver.as_any_ref());
            found.extend(call.args.allocations());
        }
        drop(state);
        for allocation in found {
            tracer.mark(allocation);
        }
    }
}

impl NoMapping for FiberMemory {}

/// A native function that is executing and what it was called with.
struct NativeCall {
    callable: Value,
    receiver: Value,
    args: ArgumentVector,
}

/// The state of a [`Fiber`].
pub struct FiberState {
    frames: Vec<Frame>,
    native_calls: Vec<NativeCall>,
    budget: Budget,
    counter: u16,
    steps_per_charge: u16,
    execute_until: Option<Instant>,
    max_depth: usize,
}

impl FiberState {
    /// Sets the number of instructions executed per budget charge.
    pub fn set_steps_per_charge(&mut self, steps: u16) {
        self.steps_per_charge = steps.max(1);
        self.counter = self.counter.min(self.steps_per_charge);
    }

    /// Allows `amount` more instructions to execute.
    pub fn increase_budget(&mut self, amount: usize) {
        self.budget.allocate(amount);
    }

    /// Sets the maximum number of frames.
    pub fn set_max_depth(&mut self, depth: usize) {
        self.max_depth = depth;
    }

    /// Returns the number of frames currently executing.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// An execution context for a locked [`Fiber`].
///
/// Native functions receive a context, which they can use to allocate values
/// and to call back into guest code.
pub struct FiberContext<'context, 'guard> {
    guard: &'context mut CollectionGuard<'guard>,
    vm: &'context Vm,
    parker: &'context Parker,
    id: LotId,
    fiber: MutexGuard<'context, FiberState>,
}

impl<'context, 'guard> FiberContext<'context, 'guard> {
    /// Returns the collection guard this context holds.
    #[must_use]
    pub fn guard(&self) -> &CollectionGuard<'guard> {
        self.guard
    }

    /// Returns the virtual machine this fiber belongs to.
    #[must_use]
    pub const fn vm(&self) -> &Vm {
        self.vm
    }

    /// Returns the state of the fiber.
    #[must_use]
    pub fn state(&mut self) -> &mut FiberState {
        &mut self.fiber
    }

    /// Executes `func` while the fiber is unlocked.
    ///
    /// Combined with [`CollectionGuard::while_unlocked`] this allows the
    /// garbage collector to run during long-running host operations.
    pub fn while_unlocked<R>(&mut self, func: impl FnOnce(&mut CollectionGuard<'guard>) -> R) -> R {
        MutexGuard::unlocked(&mut self.fiber, || func(self.guard))
    }

    /// Allows `amount` more instructions to execute.
    pub fn increase_budget(&mut self, amount: usize) {
        self.fiber.increase_budget(amount);
    }

    /// Sets the number of instructions executed per budget charge.
    pub fn set_steps_per_charge(&mut self, steps: u16) {
        self.fiber.set_steps_per_charge(steps);
    }

    /// Sets the maximum number of frames.
    pub fn set_max_depth(&mut self, depth: usize) {
        self.fiber.set_max_depth(depth);
    }

    /// Registers `module` and executes its top-level code.
    pub fn execute(&mut self, module: LinkedModule) -> Result<Value, ExecutionError> {
        self.fiber.execute_until = None;
        self.execute_module(module)
    }

    /// Executes `module` for at most `duration`.
    pub fn execute_for(
        &mut self,
        module: LinkedModule,
        duration: Duration,
    ) -> Result<Value, ExecutionError> {
        self.execute_until(
            module,
            Instant::now()
                .checked_add(duration)
                .ok_or(ExecutionError::Timeout)?,
        )
    }

    /// Executes `module` until `instant`.
    pub fn execute_until(
        &mut self,
        module: LinkedModule,
        instant: Instant,
    ) -> Result<Value, ExecutionError> {
        self.fiber.execute_until = Some(instant);
        self.execute_module(module)
    }

    fn execute_module(&mut self, module: LinkedModule) -> Result<Value, ExecutionError> {
        let id = self.vm.register_module(module, self.guard);
        let base = self.fiber.frames.len();
        let result = self.enter_module(id, false);
        self.finish_invocation(result, base)
    }

    /// Loads the module `name`, returning its module object.
    ///
    /// A module's top-level code runs only the first time it is loaded.
    pub fn load_module(&mut self, name: &str) -> Result<Value, ExecutionError> {
        let base = self.fiber.frames.len();
        let result = self
            .module_id(&Symbol::from(name))
            .and_then(|id| self.enter_module(id, true));
        self.finish_invocation(result, base)
    }

    /// Calls `callable` with `receiver` and `args`.
    ///
    /// When invoked by a native function, the call runs above the native
    /// function's caller and returns once the callee completes.
    pub fn call(
        &mut self,
        callable: Value,
        receiver: Value,
        args: ArgumentVector,
    ) -> Result<Value, ExecutionError> {
        let base = self.fiber.frames.len();
        let result = dispatch::prepare_call(self, callable, receiver, args);
        self.finish_invocation(result, base)
    }

    /// Calls the method `name` of `target` with `target` as the receiver.
    pub fn invoke(
        &mut self,
        target: Value,
        name: impl Into<SymbolRef>,
        args: ArgumentVector,
    ) -> Result<Value, ExecutionError> {
        let base = self.fiber.frames.len();
        let result = dispatch::invoke(self, target, name.into(), args);
        self.finish_invocation(result, base)
    }

    /// Resumes executing after [`ExecutionError::NoBudget`] or
    /// [`ExecutionError::Timeout`].
    ///
    /// Returns null if nothing is executing.
    pub fn resume(&mut self) -> Result<Value, ExecutionError> {
        if self.fiber.frames.is_empty() {
            return Ok(Value::Null);
        }
        let result = self.run(0);
        self.finish(result)
    }

    /// Resumes executing for at most `duration`.
    pub fn resume_for(&mut self, duration: Duration) -> Result<Value, ExecutionError> {
        self.resume_until(
            Instant::now()
                .checked_add(duration)
                .ok_or(ExecutionError::Timeout)?,
        )
    }

    /// Resumes executing until `instant`.
    pub fn resume_until(&mut self, instant: Instant) -> Result<Value, ExecutionError> {
        self.fiber.execute_until = Some(instant);
        self.resume()
    }

    /// Invokes `native`, keeping `callable`, `receiver` and `args`
    /// reachable until it returns.
    pub(crate) fn invoke_native(
        &mut self,
        native: &NativeFunction,
        callable: Value,
        receiver: Value,
        args: ArgumentVector,
    ) -> Result<Value, Fault> {
        let depth = self.fiber.native_calls.len();
        self.fiber.native_calls.push(NativeCall {
            callable,
            receiver,
            args: args.clone(),
        });
        let result = native.invoke(self, receiver, args);
        self.fiber.native_calls.truncate(depth);
        result
    }

    /// Returns the frames currently executing, outermost first.
    #[must_use]
    pub fn backtrace(&self) -> Vec<StackFrame> {
        self.fiber.frames.iter().map(Frame::stack_frame).collect()
    }

    fn finish_invocation(
        &mut self,
        result: Result<Invocation, Fault>,
        base: usize,
    ) -> Result<Value, ExecutionError> {
        let result = match result {
            Ok(Invocation::Complete(value)) => Ok(value),
            Ok(Invocation::Enter(frame)) => match self.push_frame(frame) {
                Ok(()) => self.run(base),
                Err(fault) => Err(fault),
            },
            Err(fault) => Err(fault),
        };
        self.finish(result)
    }

    fn finish(&mut self, result: Result<Value, Fault>) -> Result<Value, ExecutionError> {
        match result {
            Ok(value) => {
                if self.fiber.frames.is_empty() {
                    self.fiber.execute_until = None;
                }
                Ok(value)
            }
            Err(fault) => Err(ExecutionError::new(fault, self)),
        }
    }

    fn push_frame(&mut self, frame: Frame) -> Result<(), Fault> {
        if self.fiber.frames.len() >= self.fiber.max_depth {
            return Err(Fault::StackOverflow);
        }
        self.fiber.frames.push(frame);
        Ok(())
    }

    /// Executes frames until the frame above `base` completes.
    fn run(&mut self, base: usize) -> Result<Value, Fault> {
        loop {
            if let Err(fault) = self.budget_and_yield() {
                return Err(self.abandon(fault, base));
            }
            let flow = match dispatch::step(self) {
                Ok(Step::Next) => continue,
                Ok(Step::Enter(frame)) => match self.push_frame(frame) {
                    Ok(()) => continue,
                    Err(fault) => self.raise(fault, base),
                },
                Ok(Step::Return(value)) => self.complete(Ok(value), base),
                Err(fault) if fault.is_fatal() => return Err(self.abandon(fault, base)),
                Err(fault) => self.raise(fault, base),
            };
            if let Flow::Finished(result) = flow {
                return result.map_err(Fault::Exception);
            }
        }
    }

    /// Raises `fault` in the top frame.
    fn raise(&mut self, fault: Fault, base: usize) -> Flow {
        let error = self.envelope(fault);
        if self.handle(error) {
            Flow::Continue
        } else {
            self.complete(Err(error), base)
        }
    }

    fn handle(&mut self, error: Value) -> bool {
        self.fiber
            .frames
            .last_mut()
            .is_some_and(|frame| frame.handle(error))
    }

    /// Pops the top frame, which completed with `result`, and delivers the
    /// result to its caller.
    fn complete(&mut self, mut result: Result<Value, Value>, base: usize) -> Flow {
        loop {
            let Some(frame) = self.fiber.frames.pop() else {
                return Flow::Finished(result);
            };
            result = self.continue_with(frame.continuation, result);
            if self.fiber.frames.len() <= base {
                return Flow::Finished(result);
            }
            match result {
                Ok(value) => {
                    if let Some(caller) = self.fiber.frames.last_mut() {
                        caller.push(value);
                        caller.instruction += 1;
                    }
                    return Flow::Continue;
                }
                Err(error) => {
                    if self.handle(error) {
                        return Flow::Continue;
                    }
                }
            }
        }
    }

    fn continue_with(
        &mut self,
        continuation: Continuation,
        result: Result<Value, Value>,
    ) -> Result<Value, Value> {
        match continuation {
            Continuation::Return => result,
            Continuation::Not => result.map(|value| Value::Bool(!value.truthy())),
            Continuation::Module { id, object } => {
                let globals = self.vm.finish_module(id, result.err(), self.guard);
                match result {
                    Ok(_) if object => Ok(Value::Object(globals)),
                    result => result,
                }
            }
        }
    }

    /// Discards the frames above `base` after a fatal fault.
    ///
    /// A fiber paused at its outermost run keeps its frames so that
    /// execution can resume. Nested runs started by native functions cannot
    /// be resumed midway, so their frames are discarded and resuming
    /// re-executes the native call.
    fn abandon(&mut self, fault: Fault, base: usize) -> Fault {
        if base == 0 && matches!(fault, Fault::NoBudget | Fault::Timeout) {
            return fault;
        }
        while self.fiber.frames.len() > base {
            let Some(frame) = self.fiber.frames.pop() else {
                break;
            };
            if let Continuation::Module { id, .. } = frame.continuation {
                let error = self.envelope(Fault::ModuleFailed);
                self.vm.finish_module(id, Some(error), self.guard);
            }
        }
        fault
    }

    /// Converts `fault` into an error envelope.
    fn envelope(&mut self, fault: Fault) -> Value {
        match fault {
            Fault::Exception(value @ Value::Error(_)) => value,
            other => other.as_exception(self),
        }
    }

    fn budget_and_yield(&mut self) -> Result<(), Fault> {
        if self.fiber.counter > 1 {
            self.fiber.counter -= 1;
            Ok(())
        } else {
            self.fiber.budget.charge()?;
            self.fiber.counter = self.fiber.steps_per_charge;
            self.guard
                .coordinated_yield(|yielder| MutexGuard::unlocked(&mut self.fiber, || yielder.wait()));
            self.check_timeout()
        }
    }

    fn check_timeout(&mut self) -> Result<(), Fault> {
        if matches!(self.fiber.execute_until, Some(execute_until) if execute_until < Instant::now()) {
            self.fiber.execute_until = None;
            Err(Fault::Timeout)
        } else {
            Ok(())
        }
    }

    /// Returns the current frame along with the collection guard.
    pub(crate) fn frame(&mut self) -> Result<(&CollectionGuard<'guard>, &mut Frame), Fault> {
        let guard = &*self.guard;
        let frame = self
            .fiber
            .frames
            .last_mut()
            .ok_or(Fault::InvalidInstruction)?;
        Ok((guard, frame))
    }

    /// Returns the module of the executing frame.
    pub(crate) fn current_module(&self) -> Option<ModuleId> {
        self.fiber.frames.last().map(|frame| frame.scope.module)
    }

    /// Returns the id of the module `name`, registering it if it is a native
    /// module or can be found by the module finder.
    pub(crate) fn module_id(&mut self, name: &Symbol) -> Result<ModuleId, Fault> {
        let mut state = self.vm.state();
        if let Some(id) = state.by_name.get(name) {
            return Ok(*id);
        }
        if state.natives.contains(name) {
            return Ok(state.register_native(name.clone(), self.guard));
        }
        let finder = state.finder.clone();
        drop(state);

        let resolved = self.while_unlocked(|guard| guard.while_unlocked(|| finder.resolve(name)));
        match resolved {
            Ok(Some(module)) => {
                // Another fiber may have resolved the same name while this
                // one was reading files.
                let mut state = self.vm.state();
                if let Some(id) = state.by_name.get(name) {
                    return Ok(*id);
                }
                Ok(state.register(module, self.guard))
            }
            Ok(None) => Err(Fault::ModuleNotFound),
            Err(FinderError::InvalidName(_)) => Err(Fault::InvalidModuleName),
            Err(FinderError::Link { error, .. }) => Err(Fault::Link(error)),
            Err(other) => {
                warn!(module = %name, error = %other, "unable to load module");
                Err(Fault::ModuleUnavailable(other))
            }
        }
    }

    /// Begins loading the module `id`.
    ///
    /// Returns the module object immediately when the module is loaded, is
    /// native, or is being loaded by this fiber. Otherwise returns the frame
    /// executing the module's top-level code. When `object` is false, the
    /// frame's caller receives the value the top-level code returns.
    pub(crate) fn enter_module(&mut self, id: ModuleId, object: bool) -> Result<Invocation, Fault> {
        loop {
            let mut state = self.vm.state();
            let module = state.modules.get(id.0).ok_or(Fault::InvalidInstruction)?;
            let (module_object, current) = (module.object, module.state);
            match current {
                ModuleState::Loaded => return Ok(Invocation::Complete(Value::Object(module_object))),
                ModuleState::Failed(_) => return Err(Fault::ModuleFailed),
                ModuleState::Loading { fiber } if fiber == self.id => {
                    return Ok(Invocation::Complete(Value::Object(module_object)));
                }
                ModuleState::Loading { fiber } => {
                    if state.would_deadlock(self.id, fiber) {
                        return Err(Fault::CircularImport);
                    }
                    let unparker = self.parker.unparker().clone();
                    state.modules[id.0].waiters.push(unparker);
                    state.set_waiting(self.id, Some(id));
                    drop(state);

                    self.park();
                    self.vm.state().set_waiting(self.id, None);
                    self.check_timeout()?;
                }
                ModuleState::Registered => {
                    let module = &mut state.modules[id.0];
                    module.state = ModuleState::Loading { fiber: self.id };
                    let body = module.body.clone();
                    let name = module.name.clone();
                    let native = state.natives.get(&name).cloned();
                    drop(state);

                    debug!(module = %name, "loading module");
                    return match body {
                        Some(body) => {
                            let function = Ref::new(
                                Function::interpreted(
                                    id,
                                    body.clone(),
                                    Vec::<Ref<Cell>>::new(),
                                    Value::Object(module_object),
                                ),
                                self.guard(),
                            );
                            let scope = self.vm.scope(id)?;
                            let frame = Frame::bind(
                                function,
                                body,
                                Arc::new([]),
                                scope,
                                Value::Object(module_object),
                                &ArgumentVector::new(),
                                self.guard(),
                            );
                            match frame {
                                Ok(frame) => Ok(Invocation::Enter(
                                    frame.with_continuation(Continuation::Module { id, object }),
                                )),
                                Err(fault) => {
                                    let error = self.envelope(fault);
                                    self.vm.finish_module(id, Some(error), self.guard);
                                    Err(Fault::Exception(error))
                                }
                            }
                        }
                        None => self.initialize_native(id, native, module_object),
                    };
                }
            }
        }
    }

    fn initialize_native(
        &mut self,
        id: ModuleId,
        initializer: Option<ModuleInitializer>,
        object: Ref<Object>,
    ) -> Result<Invocation, Fault> {
        let result = match initializer {
            Some(initializer) => initializer(&mut NativeModule::new(self, id, object)),
            None => Err(Fault::ModuleNotFound),
        };
        match result {
            Ok(()) => {
                let object = self.vm.finish_module(id, None, self.guard);
                Ok(Invocation::Complete(Value::Object(object)))
            }
            Err(fault) => {
                let fatal = fault.is_fatal();
                let error = self.envelope(if fatal { Fault::ModuleFailed } else { fault.clone() });
                self.vm.finish_module(id, Some(error), self.guard);
                if fatal {
                    Err(fault)
                } else {
                    Err(Fault::Exception(error))
                }
            }
        }
    }

    /// Waits to be woken by a module finishing loading, allowing the garbage
    /// collector to run in the meantime.
    fn park(&mut self) {
        let parker = self.parker;
        let timeout = match self.fiber.execute_until {
            Some(until) => until.saturating_duration_since(Instant::now()),
            None => Duration::from_millis(100),
        };
        self.while_unlocked(|guard| guard.while_unlocked(|| parker.park_timeout(timeout)));
    }
}

impl<'guard> AsRef<CollectionGuard<'guard>> for FiberContext<'_, 'guard> {
    fn as_ref(&self) -> &CollectionGuard<'guard> {
        self.guard()
    }
}

enum Flow {
    Continue,
    Finished(Result<Value, Value>),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Budget(usize);

impl Default for Budget {
    fn default() -> Self {
        Self(Self::DISABLED)
    }
}

impl Budget {
    const DISABLED: usize = usize::MAX;

    fn allocate(&mut self, amount: usize) {
        if self.0 == Self::DISABLED {
            self.0 = 0;
        }
        self.0 = self.0.saturating_add(amount).min(Self::DISABLED - 1);
    }

    fn charge(&mut self) -> Result<(), Fault> {
        if self.0 != Self::DISABLED {
            self.0 = self.0.checked_sub(1).ok_or(Fault::NoBudget)?;
        }
        Ok(())
    }
}

/// An unrecoverable error returned from executing code.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// The fiber's budget was exhausted. Execution can continue with
    /// [`Fiber::resume`] after increasing the budget.
    NoBudget,
    /// Execution did not finish before the deadline. Execution can continue
    /// with [`Fiber::resume`].
    Timeout,
    /// An error envelope was raised and not handled.
    Exception(Value),
    /// A module could not be linked.
    Link(LinkError),
}

impl ExecutionError {
    fn new(fault: Fault, context: &mut FiberContext<'_, '_>) -> Self {
        match fault {
            Fault::NoBudget => Self::NoBudget,
            Fault::Timeout => Self::Timeout,
            Fault::Link(err) => Self::Link(err),
            other => Self::Exception(context.envelope(other)),
        }
    }

    /// Returns the error envelope, if this is an exception.
    #[must_use]
    pub const fn as_value(&self) -> Option<Value> {
        match self {
            Self::Exception(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the value that was raised, unwrapped from its envelope.
    #[must_use]
    pub fn thrown_value(&self, guard: &CollectionGuard<'_>) -> Option<Value> {
        match self {
            Self::Exception(Value::Error(error)) => error.load(guard).map(Exception::value),
            Self::Exception(other) => Some(*other),
            _ => None,
        }
    }
}

impl From<ExecutionError> for Fault {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::NoBudget => Self::NoBudget,
            ExecutionError::Timeout => Self::Timeout,
            ExecutionError::Exception(value) => Self::Exception(value),
            ExecutionError::Link(err) => Self::Link(err),
        }
    }
}

impl ErrorKind for ExecutionError {
    fn kind(&self) -> &'static str {
        match self {
            ExecutionError::NoBudget => "no budget",
            ExecutionError::Timeout => "timeout",
            ExecutionError::Exception(_) => "exception",
            ExecutionError::Link(err) => err.kind(),
        }
    }
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionError::NoBudget => f.write_str("execution budget exhausted"),
            ExecutionError::Timeout => f.write_str("execution timed out"),
            ExecutionError::Exception(value) => write!(f, "unhandled error: {value:?}"),
            ExecutionError::Link(err) => Display::fmt(err, f),
        }
    }
}

impl std::error::Error for ExecutionError {}

impl Trace for ExecutionError {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        if let ExecutionError::Exception(value) = self {
            value.trace(tracer);
        }
    }
}

/// A failure raised while executing an instruction.
///
/// Every fault other than [`Fault::NoBudget`], [`Fault::Timeout`], and
/// [`Fault::Link`] is recoverable: it is raised as an error envelope whose
/// value is the string returned by [`Fault::as_symbol`].
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Fault {
    /// The fiber's budget was exhausted.
    NoBudget,
    /// The fiber's deadline passed.
    Timeout,
    /// A module could not be linked.
    Link(LinkError),
    /// A value was raised.
    Exception(Value),
    /// The number of positional arguments did not match the signature.
    ArgumentCount,
    /// A keyword argument named no keyword parameter.
    UnknownKeyword,
    /// The value called is not callable.
    NotInvokable,
    /// The attribute does not exist.
    UnknownAttribute,
    /// The attribute exists but has not been assigned yet.
    Uninitialized,
    /// The attribute is not exported to the calling module.
    Forbidden,
    /// The const attribute was already assigned.
    Immutable,
    /// The attribute is locked.
    Locked,
    /// The object or array is sealed.
    Sealed,
    /// The index is outside of the array.
    OutOfBounds,
    /// The operator does not support the operands.
    UnsupportedOperation,
    /// The divisor was zero.
    DivideByZero,
    /// An integer operation overflowed.
    Overflow,
    /// No module with the name could be found.
    ModuleNotFound,
    /// The module's top-level code raised an error.
    ModuleFailed,
    /// The module name is not a valid identifier path.
    InvalidModuleName,
    /// The module was found but could not be read or compiled.
    ModuleUnavailable(FinderError),
    /// Two fibers are each waiting for a module the other is loading.
    CircularImport,
    /// The call exceeded the fiber's maximum depth.
    StackOverflow,
    /// An instruction referred to something that does not exist.
    InvalidInstruction,
    /// A value was freed by the garbage collector while in use.
    ValueFreed,
}

impl Fault {
    /// Returns true if this fault cannot be handled by guest code.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Fault::NoBudget | Fault::Timeout | Fault::Link(_))
    }

    /// Returns the name of this fault, which is the value of the envelope it
    /// is raised as.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Fault::NoBudget => "no_budget",
            Fault::Timeout => "timeout",
            Fault::Link(_) => "link",
            Fault::Exception(_) => "exception",
            Fault::ArgumentCount => "args",
            Fault::UnknownKeyword => "unknown_keyword",
            Fault::NotInvokable => "not_invokable",
            Fault::UnknownAttribute => "undefined",
            Fault::Uninitialized => "uninitialized",
            Fault::Forbidden => "forbidden",
            Fault::Immutable => "immutable",
            Fault::Locked => "locked",
            Fault::Sealed => "sealed",
            Fault::OutOfBounds => "out_of_bounds",
            Fault::UnsupportedOperation => "unsupported",
            Fault::DivideByZero => "divided_by_zero",
            Fault::Overflow => "overflow",
            Fault::ModuleNotFound => "module_not_found",
            Fault::ModuleFailed => "module_failed",
            Fault::InvalidModuleName => "invalid_module_name",
            Fault::ModuleUnavailable(_) => "module_unavailable",
            Fault::CircularImport => "circular_import",
            Fault::StackOverflow => "stack_overflow",
            Fault::InvalidInstruction => "invalid_instruction",
            Fault::ValueFreed => "value_freed",
        }
    }

    /// Returns the category of error envelope this fault is raised as.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Fault::NoBudget | Fault::Timeout | Fault::Link(_) | Fault::Exception(_) => {
                ErrorCategory::Thrown
            }
            Fault::ArgumentCount | Fault::UnknownKeyword | Fault::NotInvokable => {
                ErrorCategory::Binding
            }
            Fault::UnknownAttribute
            | Fault::Uninitialized
            | Fault::Forbidden
            | Fault::Immutable
            | Fault::Locked
            | Fault::Sealed
            | Fault::OutOfBounds
            | Fault::ValueFreed => ErrorCategory::Attribute,
            Fault::UnsupportedOperation
            | Fault::DivideByZero
            | Fault::Overflow
            | Fault::InvalidInstruction => ErrorCategory::Operator,
            Fault::ModuleNotFound
            | Fault::ModuleFailed
            | Fault::InvalidModuleName
            | Fault::ModuleUnavailable(_)
            | Fault::CircularImport => ErrorCategory::Module,
            Fault::StackOverflow => ErrorCategory::Stack,
        }
    }

    /// Returns an error envelope for this fault, capturing the fiber's
    /// backtrace.
    ///
    /// A raised value is wrapped as-is. Every other fault's envelope holds
    /// the string returned by [`Fault::as_symbol`].
    #[must_use]
    pub fn as_exception(&self, context: &mut FiberContext<'_, '_>) -> Value {
        let backtrace = context.backtrace();
        self.envelope_with(backtrace, context.guard())
    }

    fn envelope_with(&self, backtrace: Vec<StackFrame>, guard: &CollectionGuard<'_>) -> Value {
        let value = match self {
            Fault::Exception(value) => *value,
            other => Value::from(other.as_symbol()),
        };
        let exception = Exception::new(value, self.category(), self.to_string(), backtrace);
        Value::Error(Ref::new(exception, guard))
    }
}

impl From<LinkError> for Fault {
    fn from(err: LinkError) -> Self {
        Self::Link(err)
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Link(err) => Display::fmt(err, f),
            Fault::Exception(_) => f.write_str("a value was thrown"),
            Fault::ArgumentCount => f.write_str("wrong number of arguments"),
            Fault::UnknownKeyword => f.write_str("unexpected keyword argument"),
            Fault::NotInvokable => f.write_str("value is not callable"),
            Fault::UnknownAttribute => f.write_str("undefined attribute"),
            Fault::Uninitialized => f.write_str("attribute read before it was initialized"),
            Fault::Forbidden => f.write_str("attribute is not exported"),
            Fault::Immutable => f.write_str("const attribute already assigned"),
            Fault::Locked => f.write_str("attribute is locked"),
            Fault::Sealed => f.write_str("value is sealed"),
            Fault::OutOfBounds => f.write_str("index out of bounds"),
            Fault::UnsupportedOperation => f.write_str("unsupported operation"),
            Fault::DivideByZero => f.write_str("divided by zero"),
            Fault::Overflow => f.write_str("integer overflow"),
            Fault::ModuleNotFound => f.write_str("module not found"),
            Fault::ModuleFailed => f.write_str("module failed to initialize"),
            Fault::InvalidModuleName => f.write_str("invalid module name"),
            Fault::ModuleUnavailable(err) => Display::fmt(err, f),
            Fault::CircularImport => f.write_str("circular import between fibers"),
            Fault::StackOverflow => f.write_str("maximum call depth exceeded"),
            Fault::InvalidInstruction => f.write_str("invalid instruction"),
            Fault::ValueFreed => f.write_str("value was freed"),
            Fault::NoBudget => f.write_str("budget exhausted"),
            Fault::Timeout => f.write_str("timed out"),
        }
    }
}
