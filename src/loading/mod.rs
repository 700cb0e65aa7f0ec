//! Loading sets: staging, resolution, and atomic commits
//!
//! A loading set batches module declarations. Committing it runs the
//! resolver over the staged batch, loads the survivors in dependency
//! order on the executor, and reports every staged module's fate through
//! its registered callbacks. Commits from any number of sets may be in
//! flight at once; a cooperative mutex serializes them so each commit is
//! atomic with respect to the registry and the symbol index.

mod load;
mod resolver;

use crate::context::ContextShared;
use crate::declaration::ModuleExport;
use crate::discovery::{self, ModuleBinary};
use crate::error::{ModuleError, ModuleResult};
use crate::executor::EnqueuedFuture;
use crate::instance::{InstanceInfo, InstanceRef};
use crate::version::Version;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Unique identifier of a loading set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadingSetId(pub Uuid);

impl LoadingSetId {
    /// Generate a new set ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LoadingSetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LoadingSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a loading set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingSetState {
    /// Accepting staged modules and callbacks
    Building,
    /// A commit is executing
    Committing,
    /// Commit finished; per-module outcomes were delivered
    Committed,
    /// Commit failed structurally
    Failed,
    /// Abandoned before a commit completed
    Dismissed,
}

impl LoadingSetState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            LoadingSetState::Committed | LoadingSetState::Failed | LoadingSetState::Dismissed
        )
    }
}

impl fmt::Display for LoadingSetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadingSetState::Building => "building",
            LoadingSetState::Committing => "committing",
            LoadingSetState::Committed => "committed",
            LoadingSetState::Failed => "failed",
            LoadingSetState::Dismissed => "dismissed",
        };
        write!(f, "{}", name)
    }
}

type SuccessFn = Box<dyn FnOnce(&InstanceInfo) + Send>;
type ErrorFn = Box<dyn FnOnce(&ModuleError) + Send>;
type AbortFn = Box<dyn FnOnce() + Send>;

/// Listener for one module's fate within a commit
///
/// Exactly one of the three callbacks is eventually invoked for every
/// registration: success or error when a commit resolves the module,
/// abort when the set is dismissed or the commit future is dropped.
#[derive(Default)]
pub struct ModuleCallback {
    on_success: Option<SuccessFn>,
    on_error: Option<ErrorFn>,
    on_abort: Option<AbortFn>,
}

impl ModuleCallback {
    /// An empty callback; attach the listeners you need
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoked with the loaded instance's observer
    pub fn on_success(mut self, f: impl FnOnce(&InstanceInfo) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Invoked with the module's failure
    pub fn on_error(mut self, f: impl FnOnce(&ModuleError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Invoked when the module's fate was never resolved
    pub fn on_abort(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_abort = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for ModuleCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCallback")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_abort", &self.on_abort.is_some())
            .finish()
    }
}

/// One staged module declaration
#[derive(Clone)]
pub(crate) struct StagedModule {
    pub export: ModuleExport,
    /// Owning instance, kept strong so the set can back-reference it
    pub owner: Option<InstanceRef>,
    /// Binary the declaration came from, if any
    pub binary: Option<Arc<ModuleBinary>>,
}

pub(crate) struct LoadingSetInner {
    id: LoadingSetId,
    shared: Arc<ContextShared>,
    state: Mutex<LoadingSetState>,
    staged: Mutex<Vec<StagedModule>>,
    callbacks: Mutex<HashMap<String, Vec<ModuleCallback>>>,
    /// Instances this set loaded; marked unloadable when the set drops
    loaded: Mutex<Vec<String>>,
}

impl LoadingSetInner {
    fn ensure_building(&self) -> ModuleResult<()> {
        let state = *self.state.lock();
        if state == LoadingSetState::Building {
            Ok(())
        } else {
            Err(ModuleError::LoadingSetClosed(state.to_string()))
        }
    }

    fn fire_success(&self, module: &str, instance: &InstanceInfo) {
        let listeners = self.callbacks.lock().remove(module);
        for callback in listeners.into_iter().flatten() {
            if let Some(f) = callback.on_success {
                f(instance);
            }
        }
    }

    fn fire_error(&self, module: &str, error: &ModuleError) {
        let listeners = self.callbacks.lock().remove(module);
        for callback in listeners.into_iter().flatten() {
            if let Some(f) = callback.on_error {
                f(error);
            }
        }
    }

    fn fire_aborts(&self) {
        let listeners: Vec<ModuleCallback> = self
            .callbacks
            .lock()
            .drain()
            .flat_map(|(_, callbacks)| callbacks)
            .collect();
        for callback in listeners {
            if let Some(f) = callback.on_abort {
                f();
            }
        }
    }

    /// Deliver an error to every callback not yet consumed
    fn fail_remaining(&self, error_for: impl Fn(&str) -> ModuleError) {
        let remaining: Vec<(String, Vec<ModuleCallback>)> =
            self.callbacks.lock().drain().collect();
        for (module, callbacks) in remaining {
            let error = error_for(&module);
            for callback in callbacks {
                if let Some(f) = callback.on_error {
                    f(&error);
                }
            }
        }
    }

    /// Abandon the set: terminal `Dismissed`, abort unresolved callbacks
    fn abort(&self) {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = LoadingSetState::Dismissed;
        }
        info!("loading set {} dismissed", self.id);
        self.fire_aborts();
    }
}

impl Drop for LoadingSetInner {
    fn drop(&mut self) {
        // Instances loaded by this set live until the set is gone or
        // they are explicitly marked unloadable.
        for name in self.loaded.lock().drain(..) {
            if let Some(instance) = self.shared.registry().get(&name) {
                instance.mark_unloadable();
            }
        }
        self.fire_aborts();
    }
}

/// The commit future: resolves once the set reached a terminal state
pub type CommitFuture = EnqueuedFuture<ModuleResult<()>>;

/// Staging container for a batch of module declarations
#[derive(Clone)]
pub struct LoadingSet {
    inner: Arc<LoadingSetInner>,
}

impl LoadingSet {
    pub(crate) fn new(shared: Arc<ContextShared>) -> Self {
        let id = LoadingSetId::new();
        info!("loading set {} created", id);
        Self {
            inner: Arc::new(LoadingSetInner {
                id,
                shared,
                state: Mutex::new(LoadingSetState::Building),
                staged: Mutex::new(Vec::new()),
                callbacks: Mutex::new(HashMap::new()),
                loaded: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Set identifier
    pub fn id(&self) -> LoadingSetId {
        self.inner.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> LoadingSetState {
        *self.inner.state.lock()
    }

    /// Stage an in-memory declaration
    ///
    /// The owner, if any, is held strong so the set can back-reference
    /// the declaring binary for the staged module's lifetime.
    pub fn add_module(&self, owner: Option<&InstanceRef>, export: ModuleExport) -> ModuleResult<()> {
        self.inner.ensure_building()?;
        self.inner.staged.lock().push(StagedModule {
            export,
            owner: owner.cloned(),
            binary: None,
        });
        Ok(())
    }

    /// Open a binary (or `module.fimo_module` inside a directory) and
    /// stage the declarations accepted by `filter`
    pub fn add_modules_from_path(
        &self,
        path: &Path,
        mut filter: impl FnMut(&ModuleExport) -> bool,
    ) -> ModuleResult<usize> {
        self.inner.ensure_building()?;
        let (binary, exports) = ModuleBinary::open(path)?;
        let mut count = 0;
        let mut staged = self.inner.staged.lock();
        for export in exports {
            if filter(&export) {
                staged.push(StagedModule {
                    export,
                    owner: None,
                    binary: Some(binary.clone()),
                });
                count += 1;
            }
        }
        Ok(count)
    }

    /// Stage declarations registered in the current process binary
    pub fn add_modules_from_local(
        &self,
        mut filter: impl FnMut(&ModuleExport) -> bool,
    ) -> ModuleResult<usize> {
        self.inner.ensure_building()?;
        let mut count = 0;
        let mut staged = self.inner.staged.lock();
        for export in discovery::local_exports() {
            if filter(&export) {
                staged.push(StagedModule {
                    export,
                    owner: None,
                    binary: None,
                });
                count += 1;
            }
        }
        Ok(count)
    }

    /// Register a fate listener for the named module
    pub fn add_callback(&self, module: &str, callback: ModuleCallback) -> ModuleResult<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(ModuleError::LoadingSetClosed(state.to_string()));
        }
        self.inner
            .callbacks
            .lock()
            .entry(module.to_string())
            .or_default()
            .push(callback);
        Ok(())
    }

    /// Whether a module with `name` is staged
    pub fn query_module(&self, name: &str) -> bool {
        self.inner
            .staged
            .lock()
            .iter()
            .any(|module| module.export.name == name)
    }

    /// Whether a staged export satisfies `(namespace, name, version)`
    pub fn query_symbol(&self, namespace: &str, name: &str, version: &Version) -> bool {
        self.inner.staged.lock().iter().any(|module| {
            module
                .export
                .export_keys()
                .iter()
                .any(|(key, exported)| {
                    key.namespace == namespace
                        && key.name == name
                        && exported.is_compatible_with(version)
                })
        })
    }

    /// Abandon the set before committing; fires abort callbacks
    pub fn dismiss(&self) -> ModuleResult<()> {
        self.inner.ensure_building()?;
        self.inner.abort();
        Ok(())
    }

    /// Enqueue the commit on the executor
    ///
    /// The returned future resolves `Ok` even when individual modules
    /// were skipped; per-module outcomes arrive through callbacks. It
    /// resolves to an error for structural failures. Dropping the future
    /// before completion aborts the commit.
    pub fn commit(&self) -> ModuleResult<CommitFuture> {
        let guard = AbortGuard {
            set: self.inner.clone(),
            armed: true,
        };
        self.inner.shared.executor().enqueue(async move {
            let mut guard = guard;
            let result = run_commit(&guard.set).await;
            guard.armed = false;
            result
        })
    }
}

impl fmt::Debug for LoadingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadingSet")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.lock())
            .field("staged", &self.inner.staged.lock().len())
            .finish()
    }
}

/// Fires abort callbacks if the commit future is dropped before it ran
/// to completion
struct AbortGuard {
    set: Arc<LoadingSetInner>,
    armed: bool,
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if self.armed {
            self.set.abort();
        }
    }
}

/// The commit algorithm; runs on the executor under the commit mutex
async fn run_commit(inner: &Arc<LoadingSetInner>) -> ModuleResult<()> {
    let shared = inner.shared.clone();
    let _serial = shared.commit_lock().lock().await;

    {
        let mut state = inner.state.lock();
        match *state {
            LoadingSetState::Building => *state = LoadingSetState::Committing,
            other => return Err(ModuleError::LoadingSetClosed(other.to_string())),
        }
    }

    let staged: Vec<StagedModule> = inner.staged.lock().clone();
    info!(
        "loading set {} committing {} staged modules",
        inner.id,
        staged.len()
    );

    // Validation, resolution, and ordering.
    let plan = match resolver::resolve(shared.symbols(), shared.registry(), &staged) {
        Ok(plan) => plan,
        Err(error) => {
            warn!("loading set {} commit failed: {}", inner.id, error);
            for module in &staged {
                inner.fire_error(&module.export.name, &error);
            }
            inner.fail_remaining(|_| error.clone());
            *inner.state.lock() = LoadingSetState::Failed;
            return Err(error);
        }
    };

    // Resolution-pass rejections are delivered before any load begins.
    for (&index, error) in &plan.skipped {
        warn!(
            "module {} skipped: {}",
            staged[index].export.name, error
        );
        inner.fire_error(&staged[index].export.name, error);
    }

    // Load pass, in topological order, cascading over load failures.
    let mut failed: BTreeSet<usize> = plan.skipped.keys().copied().collect();
    let mut loaded_count = 0usize;
    for &index in &plan.order {
        let module = &staged[index];
        let name = module.export.name.clone();

        if let Some(&provider) = plan.staged_deps[index].iter().find(|dep| failed.contains(*dep)) {
            let error = cascade_error(module, &staged[provider].export);
            warn!("module {} skipped: {}", name, error);
            inner.fire_error(&name, &error);
            failed.insert(index);
            continue;
        }

        match load::load_module(shared.clone(), module.clone()).await {
            Ok(instance) => {
                loaded_count += 1;
                inner.loaded.lock().push(name.clone());
                inner.fire_success(&name, &instance);
            }
            Err(error) => {
                warn!("module {} failed to load: {}", name, error);
                inner.fire_error(&name, &error);
                failed.insert(index);
            }
        }
    }

    // Callbacks for names that were never staged.
    inner.fail_remaining(|module| ModuleError::InstanceNotFound(module.to_string()));

    // A set that loaded nothing because of registry name collisions is a
    // structural failure; everything else commits.
    if loaded_count == 0 && plan.registry_conflicts {
        let error = plan
            .skipped
            .values()
            .find(|e| matches!(e, ModuleError::DuplicateName(_)))
            .cloned()
            .unwrap_or_else(|| ModuleError::DuplicateName(String::new()));
        *inner.state.lock() = LoadingSetState::Failed;
        warn!("loading set {} commit failed: {}", inner.id, error);
        return Err(error);
    }

    *inner.state.lock() = LoadingSetState::Committed;
    info!(
        "loading set {} committed, {} of {} modules loaded",
        inner.id,
        loaded_count,
        staged.len()
    );
    Ok(())
}

/// Error delivered to a module whose staged provider failed
///
/// Names the import the failed provider was going to satisfy; falls back
/// to the provider instance when the link was a static dependency.
fn cascade_error(module: &StagedModule, provider: &ModuleExport) -> ModuleError {
    let provided = provider.export_keys();
    module
        .export
        .symbol_imports
        .iter()
        .find(|import| {
            provided.iter().any(|(key, version)| {
                *key == import.key() && version.is_compatible_with(&import.version)
            })
        })
        .map(|import| ModuleError::UnknownSymbol {
            name: import.name.clone(),
            namespace: import.namespace.clone(),
            version: import.version.to_string(),
        })
        .unwrap_or_else(|| ModuleError::InstanceNotFound(provider.name.clone()))
}
