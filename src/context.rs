use std::{
    cell::RefCell,
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::{
    chunk::Chunk,
    compiler::Compiler,
    error::{ContextError, Result},
    scanner::Scanner,
    std_mod,
    test_runner::TestRunner,
    value::Value,
    vm::{InterpretResult, Vm, VmConfig},
};

/// A named bundle of host bindings, merged into a VM's globals when bound.
#[derive(Clone)]
pub struct Library {
    pub name: String,
    pub bindings: Vec<(String, Value)>,
}

impl Library {
    pub fn new(name: &str) -> Self {
        Library {
            name: name.to_string(),
            bindings: vec![],
        }
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.add(name, value);
        self
    }

    pub fn add(&mut self, name: &str, value: Value) {
        self.bindings.push((name.to_string(), value));
    }
}

#[derive(Default)]
pub struct LibraryRegistry {
    libraries: IndexMap<String, Library>,
}

impl LibraryRegistry {
    pub fn add(&mut self, library: Library) -> Result<(), ContextError> {
        if self.libraries.contains_key(&library.name) {
            return Err(ContextError::DuplicateLibrary(library.name));
        }
        debug!(library = %library.name, "library registered");
        self.libraries.insert(library.name.clone(), library);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Library> {
        self.libraries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.libraries.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub name: String,
    pub text: String,
}

impl Script {
    pub fn new(name: &str, text: &str) -> Self {
        Script {
            name: name.to_string(),
            text: text.to_string(),
        }
    }
}

/// Resolves script names to source text.
pub trait ScriptLocator {
    fn register(&mut self, script: Script);

    fn find(&self, name: &str) -> Result<Script, ContextError>;
}

/// In-memory registrations first, then the first file in `directory` whose
/// name starts with the requested name.
#[derive(Default)]
pub struct DefaultLocator {
    registered: IndexMap<String, Script>,
    directory: Option<PathBuf>,
}

impl DefaultLocator {
    pub fn new() -> Self {
        DefaultLocator::default()
    }

    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        DefaultLocator {
            registered: IndexMap::new(),
            directory: Some(directory.into()),
        }
    }

    fn find_in_directory(directory: &Path, name: &str) -> Result<Script, ContextError> {
        let unreadable = |reason: std::io::Error| ContextError::Unreadable {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let mut candidates: Vec<PathBuf> = fs::read_dir(directory)
            .map_err(unreadable)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .filter(|path| {
                path.file_name()
                    .and_then(|file| file.to_str())
                    .map_or(false, |file| file.starts_with(name))
            })
            .collect();
        candidates.sort();

        let path = candidates
            .into_iter()
            .next()
            .ok_or_else(|| ContextError::ScriptNotFound(name.to_string()))?;
        let text = fs::read_to_string(&path).map_err(unreadable)?;
        Ok(Script {
            name: name.to_string(),
            text,
        })
    }
}

impl ScriptLocator for DefaultLocator {
    fn register(&mut self, script: Script) {
        self.registered.insert(script.name.clone(), script);
    }

    fn find(&self, name: &str) -> Result<Script, ContextError> {
        if let Some(script) = self.registered.get(name) {
            return Ok(script.clone());
        }
        match &self.directory {
            Some(directory) => DefaultLocator::find_in_directory(directory, name),
            None => Err(ContextError::ScriptNotFound(name.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub vm: VmConfig,
    /// Bind the `Core` library before any script runs.
    pub bind_core: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            vm: VmConfig::default(),
            bind_core: true,
        }
    }
}

/// A host session: one VM plus the libraries and scripts it may reach.
pub struct Context {
    vm: Vm,
    libraries: Rc<RefCell<LibraryRegistry>>,
    locator: Box<dyn ScriptLocator>,
    scanner: Scanner,
    /// Scripts queued with `build queue` that have not started yet.
    pending: VecDeque<String>,
}

impl Default for Context {
    fn default() -> Self {
        Context::new(ContextConfig::default())
    }
}

impl Context {
    pub fn new(config: ContextConfig) -> Self {
        Context::with_locator(config, Box::new(DefaultLocator::new()))
    }

    pub fn with_locator(config: ContextConfig, locator: Box<dyn ScriptLocator>) -> Self {
        let libraries = Rc::new(RefCell::new(LibraryRegistry::default()));
        let vm = Vm::with_shared(
            config.vm,
            Rc::new(RefCell::new(TestRunner::new())),
            Rc::clone(&libraries),
            Rc::new(RefCell::new(String::new())),
        );
        let mut context = Context {
            vm,
            libraries,
            locator,
            scanner: Scanner::new(),
            pending: VecDeque::new(),
        };

        if let Err(err) = context.add_library(std_mod::core::library()) {
            warn!(error = %err, "core library unavailable");
        } else if config.bind_core {
            if let Err(err) = context.bind_library(std_mod::core::LIBRARY_NAME) {
                warn!(error = %err, "core library not bound");
            }
        }
        context
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    pub fn test_runner(&self) -> Rc<RefCell<TestRunner>> {
        self.vm.test_runner()
    }

    pub fn add_library(&mut self, library: Library) -> Result<(), ContextError> {
        self.libraries.borrow_mut().add(library)
    }

    pub fn bind_library(&mut self, name: &str) -> Result<(), ContextError> {
        self.vm.bind_library(name)
    }

    pub fn register_script(&mut self, script: Script) {
        self.locator.register(script);
    }

    pub fn compile(&mut self, script: &Script) -> Result<Rc<Chunk>> {
        debug!(script = %script.name, "compiling script");
        let tokens = self.scanner.scan(&script.text)?;
        Ok(Compiler::new(tokens, &script.name).compile()?)
    }

    pub fn run_script(&mut self, name: &str) -> Result<InterpretResult> {
        let script = self.locator.find(name)?;
        self.run_source(script)
    }

    /// Runs `script`, then any scripts it queued. A yield anywhere stops the
    /// session until `resume`.
    pub fn run_source(&mut self, script: Script) -> Result<InterpretResult> {
        let chunk = self.compile(&script)?;
        let result = self.vm.interpret(chunk, 0)?;
        self.after_run(result)
    }

    pub fn resume(&mut self) -> Result<InterpretResult> {
        let result = self.vm.resume()?;
        self.after_run(result)
    }

    fn after_run(&mut self, result: InterpretResult) -> Result<InterpretResult> {
        match result {
            InterpretResult::InterpretYield => Ok(InterpretResult::InterpretYield),
            InterpretResult::InterpretOk(_) => match self.drain_build_queue()? {
                InterpretResult::InterpretYield => Ok(InterpretResult::InterpretYield),
                InterpretResult::InterpretOk(_) => Ok(result),
            },
        }
    }

    /// Runs queued scripts in order until none remain or one of them yields.
    fn drain_build_queue(&mut self) -> Result<InterpretResult> {
        loop {
            self.pending.extend(self.vm.take_build_queue());
            let name = match self.pending.pop_front() {
                Some(name) => name,
                None => return Ok(InterpretResult::InterpretOk(Value::Null)),
            };
            debug!(script = %name, "running queued script");
            let script = self.locator.find(&name)?;
            let chunk = self.compile(&script)?;
            if let InterpretResult::InterpretYield = self.vm.interpret(chunk, 0)? {
                return Ok(InterpretResult::InterpretYield);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UloxError;

    fn context() -> Context {
        Context::new(ContextConfig {
            vm: VmConfig {
                echo_print: false,
                ..VmConfig::default()
            },
            bind_core: true,
        })
    }

    #[test]
    fn test_run_source_prints() {
        let mut context = context();
        context.run_source(Script::new("main", "print(\"hi\");")).unwrap();
        assert_eq!(context.vm().printed(), "hi\n");
    }

    #[test]
    fn test_queued_scripts_run_in_order() {
        let mut context = context();
        context.register_script(Script::new("a", "print(\"a\"); build queue \"c\";"));
        context.register_script(Script::new("b", "print(\"b\");"));
        context.register_script(Script::new("c", "print(\"c\");"));
        context
            .run_source(Script::new("main", "build queue \"a\", \"b\"; print(\"main\");"))
            .unwrap();
        assert_eq!(context.vm().printed(), "main\na\nb\nc\n");
    }

    #[test]
    fn test_yield_defers_queued_scripts() {
        let mut context = context();
        context.register_script(Script::new("q", "print(\"queued\"); yield; print(\"queued2\");"));
        let result = context
            .run_source(Script::new("main", "build queue \"q\"; print(\"m1\"); yield; print(\"m2\");"))
            .unwrap();
        assert_eq!(result, InterpretResult::InterpretYield);
        assert_eq!(context.vm().printed(), "m1\n");

        assert_eq!(context.resume().unwrap(), InterpretResult::InterpretYield);
        assert_eq!(context.vm().printed(), "m1\nm2\nqueued\n");

        assert!(matches!(context.resume().unwrap(), InterpretResult::InterpretOk(_)));
        assert_eq!(context.vm().printed(), "m1\nm2\nqueued\nqueued2\n");
        assert!(context.resume().is_err());
    }

    #[test]
    fn test_missing_script() {
        let mut context = context();
        let err = context.run_script("nowhere").unwrap_err();
        assert_eq!(err, UloxError::Context(ContextError::ScriptNotFound("nowhere".to_string())));
    }

    #[test]
    fn test_duplicate_library() {
        let mut context = context();
        let err = context.add_library(Library::new(std_mod::core::LIBRARY_NAME)).unwrap_err();
        assert_eq!(err, ContextError::DuplicateLibrary("Core".to_string()));
    }

    #[test]
    fn test_core_bound_by_build_directive() {
        let mut context = Context::new(ContextConfig {
            vm: VmConfig {
                echo_print: false,
                ..VmConfig::default()
            },
            bind_core: false,
        });
        assert!(context.run_source(Script::new("a", "print(1);")).is_err());
        context
            .run_source(Script::new("b", "build bind \"Core\"; print(2);"))
            .unwrap();
        assert_eq!(context.vm().printed(), "2\n");
    }

    #[test]
    fn test_directory_lookup_by_prefix() {
        let dir = std::env::temp_dir().join(format!("ulox-locator-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("greet.ulox"), "var greeting = \"hello\";").unwrap();

        let locator = DefaultLocator::with_directory(&dir);
        let script = locator.find("greet").unwrap();
        assert_eq!(script.text, "var greeting = \"hello\";");
        assert!(locator.find("absent").is_err());

        fs::remove_dir_all(&dir).unwrap();
    }
}
