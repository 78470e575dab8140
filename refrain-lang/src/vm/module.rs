//! Module identity, state, and resolution.

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use alot::LotId;
use crossbeam_utils::sync::Unparker;
use refuse::{CollectionGuard, Ref};

use crate::runtime::function::{CodeObject, Function, NativeFunction};
use crate::runtime::object::Object;
use crate::runtime::symbol::{Symbol, SymbolRef};
use crate::runtime::template::Template;
use crate::runtime::value::Value;
use crate::vm::bitcode::BitcodeModule;
use crate::vm::code::{Code, Constant, LinkError, LinkedModule};
use crate::vm::{artifact, Fault, FiberContext};
use crate::ErrorKind;

/// The index of a module within a [`Vm`](crate::vm::Vm).
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ModuleId(pub(crate) usize);

#[derive(Debug, Clone, Copy)]
pub(crate) enum ModuleState {
    Registered,
    Loading { fiber: LotId },
    Loaded,
    Failed(Value),
}

pub(crate) struct Module {
    pub(crate) name: Symbol,
    pub(crate) object: Ref<Object>,
    pub(crate) body: Option<Code>,
    pub(crate) constants: Arc<[Value]>,
    pub(crate) state: ModuleState,
    pub(crate) waiters: Vec<Unparker>,
    // Keeps every interned string of the pool alive.
    _linked: Option<LinkedModule>,
}

impl Module {
    pub(crate) fn instantiate(id: ModuleId, linked: LinkedModule, guard: &CollectionGuard<'_>) -> Self {
        let constants = linked
            .pool()
            .iter()
            .map(|constant| match constant {
                Constant::Bool(value) => Value::Bool(*value),
                Constant::Int(value) => Value::Int(*value),
                Constant::Float(value) => Value::Float(*value),
                Constant::String(value) => Value::String(value.downgrade()),
                Constant::Code(code) => Value::Code(Ref::new(CodeObject(code.clone()), guard)),
                Constant::Template(template) => {
                    let methods = template
                        .methods
                        .iter()
                        .filter_map(|method| method.name().map(|name| (name.clone(), method.clone())))
                        .collect();
                    Value::Template(Ref::new(
                        Template::new(template.name.clone(), template.sealed, methods, id),
                        guard,
                    ))
                }
            })
            .collect();
        Self {
            name: linked.name().clone(),
            object: Ref::new(Object::for_module(id), guard),
            body: linked.body().cloned(),
            constants,
            state: ModuleState::Registered,
            waiters: Vec::new(),
            _linked: Some(linked),
        }
    }

    pub(crate) fn native(id: ModuleId, name: Symbol, guard: &CollectionGuard<'_>) -> Self {
        Self {
            name,
            object: Ref::new(Object::for_module(id), guard),
            body: None,
            constants: Arc::new([]),
            state: ModuleState::Registered,
            waiters: Vec::new(),
            _linked: None,
        }
    }

    pub(crate) fn trace(&self, tracer: &mut refuse::Tracer) {
        tracer.mark(self.object);
        for constant in self.constants.iter() {
            refuse::Trace::trace(constant, tracer);
        }
        if let ModuleState::Failed(error) = &self.state {
            refuse::Trace::trace(error, tracer);
        }
    }
}

pub(crate) type ModuleInitializer =
    Arc<dyn Fn(&mut NativeModule<'_, '_, '_>) -> Result<(), Fault> + Send + Sync>;

/// A host-native module being initialized.
///
/// Values defined through [`NativeModule::define`] are exported so that any
/// module loading this one can read them.
pub struct NativeModule<'a, 'context, 'guard> {
    context: &'a mut FiberContext<'context, 'guard>,
    id: ModuleId,
    object: Ref<Object>,
}

impl<'a, 'context, 'guard> NativeModule<'a, 'context, 'guard> {
    pub(crate) fn new(
        context: &'a mut FiberContext<'context, 'guard>,
        id: ModuleId,
        object: Ref<Object>,
    ) -> Self {
        Self {
            context,
            id,
            object,
        }
    }

    /// Returns the fiber this module is being loaded by.
    pub fn context(&mut self) -> &mut FiberContext<'context, 'guard> {
        self.context
    }

    /// Returns the id of this module.
    #[must_use]
    pub const fn id(&self) -> ModuleId {
        self.id
    }

    /// Returns the module object.
    #[must_use]
    pub const fn object(&self) -> Ref<Object> {
        self.object
    }

    /// Defines and exports `name` as `value`.
    pub fn define(&mut self, name: impl Into<SymbolRef>, value: impl Into<Value>) -> Result<(), Fault> {
        let name = name.into();
        let object = self.object.load(self.context.guard()).ok_or(Fault::ValueFreed)?;
        object.declare_const(name, value.into(), Some(self.id))?;
        object.export(name, Some(self.id))
    }

    /// Defines and exports a native function named `name`.
    pub fn define_fn<F>(&mut self, name: impl Into<Symbol>, function: F) -> Result<(), Fault>
    where
        F: Fn(&mut FiberContext<'_, '_>, Value, crate::runtime::args::ArgumentVector) -> Result<Value, Fault>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        let function = Function::native_in(self.id, NativeFunction::new(name.clone(), function));
        let function = Ref::new(function, self.context.guard());
        self.define(&name, Value::Function(function))
    }
}

/// Compiles source text into bitcode.
///
/// The module finder invokes the compiler when a module's source is newer
/// than its cached artifact.
pub trait SourceCompiler: Send + Sync {
    /// Compiles `source`, the contents of the module `name`.
    fn compile(&self, name: &str, source: &str) -> Result<BitcodeModule, String>;
}

/// Locates modules on disk.
///
/// Directories are searched in order: every standard library path, every
/// search path, then the working directory. Within a directory, the module
/// `a.b` is found at `a/b.<extension>`.
#[derive(Clone)]
pub struct ModuleFinder {
    std_paths: Vec<PathBuf>,
    search_paths: Vec<PathBuf>,
    working_directory: Option<PathBuf>,
    source_extension: String,
    artifact_extension: String,
    compiler: Option<Arc<dyn SourceCompiler>>,
    write_cache: bool,
}

impl Default for ModuleFinder {
    fn default() -> Self {
        Self {
            std_paths: Vec::new(),
            search_paths: Vec::new(),
            working_directory: None,
            source_extension: String::from("rf"),
            artifact_extension: String::from("rfc"),
            compiler: None,
            write_cache: true,
        }
    }
}

impl ModuleFinder {
    /// Returns a finder that only searches the process's current directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a standard library directory and returns self.
    #[must_use]
    pub fn with_std_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.std_paths.push(path.into());
        self
    }

    /// Adds a module search directory and returns self.
    #[must_use]
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// Sets the directory searched last and returns self.
    ///
    /// When unset, the process's current directory is used.
    #[must_use]
    pub fn with_working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    /// Sets the extension of source files and returns self.
    #[must_use]
    pub fn with_source_extension(mut self, extension: impl Into<String>) -> Self {
        self.source_extension = extension.into();
        self
    }

    /// Sets the extension of compiled artifacts and returns self.
    #[must_use]
    pub fn with_artifact_extension(mut self, extension: impl Into<String>) -> Self {
        self.artifact_extension = extension.into();
        self
    }

    /// Sets the compiler used for source files and returns self.
    #[must_use]
    pub fn with_compiler(mut self, compiler: impl SourceCompiler + 'static) -> Self {
        self.compiler = Some(Arc::new(compiler));
        self
    }

    /// Sets whether compiled sources are written back as artifacts and
    /// returns self.
    #[must_use]
    pub fn with_cache_writes(mut self, enabled: bool) -> Self {
        self.write_cache = enabled;
        self
    }

    /// Returns the directories searched, in order.
    #[must_use]
    pub fn directories(&self) -> Vec<PathBuf> {
        let working_directory = self
            .working_directory
            .clone()
            .or_else(|| std::env::current_dir().ok());
        self.std_paths
            .iter()
            .chain(&self.search_paths)
            .cloned()
            .chain(working_directory)
            .collect()
    }

    /// Locates, compiles or decodes, and links the module `name`.
    ///
    /// Returns `Ok(None)` if no directory contains the module.
    pub fn resolve(&self, name: &str) -> Result<Option<LinkedModule>, FinderError> {
        if !is_valid_module_name(name) {
            return Err(FinderError::InvalidName(name.to_string()));
        }
        for directory in self.directories() {
            if let Some(module) = self.resolve_in(name, &directory)? {
                debug!(module = name, directory = %directory.display(), "resolved module");
                return Ok(Some(module));
            }
        }
        Ok(None)
    }

    fn resolve_in(&self, name: &str, directory: &Path) -> Result<Option<LinkedModule>, FinderError> {
        let source = module_path(directory, name, &self.source_extension);
        let cached = module_path(directory, name, &self.artifact_extension);
        match (modified(&source), modified(&cached)) {
            (None, None) => Ok(None),
            (None, Some(_)) => Self::read_artifact(name, &cached).map(Some),
            (Some(source_time), Some(cached_time)) if cached_time >= source_time => {
                match Self::read_artifact(name, &cached) {
                    Ok(module) => Ok(Some(module)),
                    Err(err) => {
                        warn!(module = name, error = %err, "cached artifact unusable, recompiling");
                        self.compile(name, &source, &cached).map(Some)
                    }
                }
            }
            (Some(_), _) => self.compile(name, &source, &cached).map(Some),
        }
    }

    fn read_artifact(name: &str, path: &Path) -> Result<LinkedModule, FinderError> {
        let bytes = fs::read(path).map_err(|err| FinderError::io(path, &err))?;
        artifact::decode(name, &bytes).map_err(|error| FinderError::Link {
            path: path.to_path_buf(),
            error,
        })
    }

    fn compile(&self, name: &str, source: &Path, cached: &Path) -> Result<LinkedModule, FinderError> {
        let compiler = self
            .compiler
            .as_ref()
            .ok_or_else(|| FinderError::NoCompiler(name.to_string()))?;
        let text = fs::read_to_string(source).map_err(|err| FinderError::io(source, &err))?;
        let bitcode = compiler
            .compile(name, &text)
            .map_err(|message| FinderError::Compile {
                name: name.to_string(),
                message,
            })?;
        let module = bitcode
            .link()
            .map_err(|error| FinderError::Link {
                path: source.to_path_buf(),
                error,
            })?
            .renamed(name);
        info!(module = name, "compiled module");

        if self.write_cache {
            match artifact::encode(&module) {
                Ok(bytes) => {
                    if let Err(err) = fs::write(cached, bytes) {
                        warn!(module = name, path = %cached.display(), error = %err, "unable to write cached artifact");
                    }
                }
                Err(err) => {
                    warn!(module = name, error = %err, "unable to encode cached artifact");
                }
            }
        }
        Ok(module)
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
}

fn module_path(directory: &Path, name: &str, extension: &str) -> PathBuf {
    let mut path = directory.to_path_buf();
    for part in name.split('.') {
        path.push(part);
    }
    path.set_extension(extension);
    path
}

/// Returns true if `name` is a valid module name: one or more identifiers
/// separated by `.`.
#[must_use]
pub fn is_valid_module_name(name: &str) -> bool {
    name.split('.').all(|part| {
        let mut chars = part.chars();
        chars
            .next()
            .is_some_and(|first| first == '_' || unicode_ident::is_xid_start(first))
            && chars.all(unicode_ident::is_xid_continue)
    })
}

/// An error locating or preparing a module.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FinderError {
    /// The name is not a valid module name.
    InvalidName(String),
    /// A file could not be read.
    Io {
        /// The file being read.
        path: PathBuf,
        /// The error reported by the operating system.
        message: String,
    },
    /// A source file was found but no compiler is configured.
    NoCompiler(String),
    /// The compiler rejected a source file.
    Compile {
        /// The module being compiled.
        name: String,
        /// The compiler's message.
        message: String,
    },
    /// Compiled bitcode or a cached artifact could not be linked.
    Link {
        /// The file the module was read from.
        path: PathBuf,
        /// The link error.
        error: LinkError,
    },
}

impl FinderError {
    fn io(path: &Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

impl ErrorKind for FinderError {
    fn kind(&self) -> &'static str {
        match self {
            FinderError::InvalidName(_) => "invalid module name",
            FinderError::Io { .. } => "io",
            FinderError::NoCompiler(_) => "no compiler",
            FinderError::Compile { .. } => "compile",
            FinderError::Link { .. } => "link",
        }
    }
}

impl Display for FinderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinderError::InvalidName(name) => write!(f, "invalid module name `{name}`"),
            FinderError::Io { path, message } => write!(f, "error reading {}: {message}", path.display()),
            FinderError::NoCompiler(name) => write!(f, "no compiler is configured to compile `{name}`"),
            FinderError::Compile { name, message } => write!(f, "error compiling `{name}`: {message}"),
            FinderError::Link { path, error } => write!(f, "error linking {}: {error}", path.display()),
        }
    }
}

impl std::error::Error for FinderError {}
