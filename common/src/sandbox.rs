// Snippet compiler and sandboxed runner
// Compiles job source into immutable Units and runs them with per-call output capture.

use crate::errors::JobFault;
use crate::telemetry::JOBS;
use rhai::module_resolvers::FileModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, OptimizationLevel, AST};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Sandbox limits and package location
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Directory that installed packages (`<name>.rhai` modules) live in
    pub module_dir: PathBuf,
    /// Wall-clock budget for a single run; `None` means unbounded
    pub timeout: Option<Duration>,
    /// Operation budget for a single run; `0` means unbounded
    pub max_operations: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            module_dir: PathBuf::from("packages"),
            timeout: None,
            max_operations: 0,
        }
    }
}

/// Executable half of a Unit.
///
/// A snippet that failed to build still gets a handle: invoking it reports
/// the construction fault.
pub enum Runnable {
    Compiled(AST),
    Faulted(JobFault),
}

struct UnitInner {
    id: Uuid,
    source: String,
    runnable: Runnable,
}

/// Compiled, immutable representation of a job.
///
/// Cloning shares the underlying handle; there is no way to mutate a Unit
/// after the sandbox built it.
#[derive(Clone)]
pub struct Unit {
    inner: Arc<UnitInner>,
}

impl Unit {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn runnable(&self) -> &Runnable {
        &self.inner.runnable
    }

    /// True when the source failed to build
    pub fn is_faulted(&self) -> bool {
        matches!(self.inner.runnable, Runnable::Faulted(_))
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.inner.id)
            .field("faulted", &self.is_faulted())
            .finish()
    }
}

/// Outcome of a single run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub output: String,
    pub fault: Option<JobFault>,
}

impl Execution {
    /// Captured text as seen by callers: the fault text replaces output
    pub fn into_text(self) -> String {
        match self.fault {
            // Build faults are emitted the way a print would emit them.
            Some(JobFault::Compile(message)) => format!("{}\n", message),
            Some(fault) => fault.to_string(),
            None => self.output,
        }
    }
}

/// Output buffer owned by exactly one run
#[derive(Clone, Default)]
struct Capture(Arc<Mutex<String>>);

impl Capture {
    fn push_line(&self, line: &str) {
        let mut buffer = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        buffer.push_str(line);
        buffer.push('\n');
    }

    fn take(&self) -> String {
        let mut buffer = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *buffer)
    }
}

/// Compiles snippets and executes Units.
pub struct Sandbox {
    compiler: Engine,
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        let mut compiler = Engine::new();
        // Faults must surface at run time, not be folded away while parsing.
        compiler.set_optimization_level(OptimizationLevel::None);

        Self { compiler, config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Build a Unit from source text. Never fails.
    #[instrument(skip(self, source), fields(job_id = %id))]
    pub fn compile(&self, id: Uuid, source: &str) -> Unit {
        let runnable = match self.compiler.compile(source) {
            Ok(ast) => Runnable::Compiled(ast),
            Err(err) => {
                debug!(target: JOBS, job_id = %id, error = %err, "Snippet failed to compile");
                Runnable::Faulted(JobFault::Compile(err.to_string()))
            }
        };

        Unit {
            inner: Arc::new(UnitInner {
                id,
                source: source.to_string(),
                runnable,
            }),
        }
    }

    /// Run a Unit and return its captured text
    pub fn run(&self, unit: &Unit) -> String {
        self.execute(unit).into_text()
    }

    /// Run a Unit, keeping output and fault apart.
    ///
    /// Blocks for the snippet's duration; call from a blocking thread.
    pub fn execute(&self, unit: &Unit) -> Execution {
        let ast = match unit.runnable() {
            Runnable::Compiled(ast) => ast,
            Runnable::Faulted(fault) => {
                return Execution {
                    output: String::new(),
                    fault: Some(fault.clone()),
                }
            }
        };

        let capture = Capture::default();
        let engine = self.engine_for(unit.id(), &capture);

        match engine.run_ast(ast) {
            Ok(()) => Execution {
                output: capture.take(),
                fault: None,
            },
            Err(err) => {
                let partial = capture.take();
                if !partial.is_empty() {
                    debug!(target: JOBS, job_id = %unit.id(), output = %partial, "Discarding output of faulted run");
                }
                Execution {
                    output: String::new(),
                    fault: Some(self.classify(*err)),
                }
            }
        }
    }

    /// Fresh engine whose print sink is this call's capture buffer
    fn engine_for(&self, job_id: Uuid, capture: &Capture) -> Engine {
        let mut engine = Engine::new();
        engine.set_module_resolver(FileModuleResolver::new_with_path(self.config.module_dir.clone()));

        let sink = capture.clone();
        engine.on_print(move |text| sink.push_line(text));
        engine.on_debug(move |text, _source, position| {
            debug!(target: JOBS, job_id = %job_id, position = %position, "{}", text);
        });

        if self.config.max_operations > 0 {
            engine.set_max_operations(self.config.max_operations);
        }

        if let Some(timeout) = self.config.timeout {
            let deadline = Instant::now() + timeout;
            engine.on_progress(move |_operations| {
                if Instant::now() >= deadline {
                    Some(Dynamic::UNIT)
                } else {
                    None
                }
            });
        }

        engine
    }

    fn classify(&self, err: EvalAltResult) -> JobFault {
        match err {
            EvalAltResult::ErrorTerminated(..) => {
                let seconds = self.config.timeout.map(|t| t.as_secs()).unwrap_or_default();
                JobFault::Timeout(seconds)
            }
            other => JobFault::Runtime(other.to_string()),
        }
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}
