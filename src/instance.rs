//! Live module instances
//!
//! An instance is a loaded module: its metadata, parameter and resource
//! tables, resolved imports, published exports, and private state. Two
//! counts govern its life:
//!
//! * the *handle* count is the `Arc` count of the record itself; observers
//!   ([`InstanceInfo`]) hold weak references and never keep an instance
//!   loaded, only the record's memory;
//! * the *strong* count keeps the instance loaded. The instance holds one
//!   strong reference on itself until `mark_unloadable`; every dependency
//!   edge pointing at the instance holds another. At zero the instance is
//!   pruned and can never be re-acquired.

use crate::context::ContextShared;
use crate::declaration::{DebugInfo, ModuleExport};
use crate::error::{ModuleError, ModuleResult};
use crate::graph::{DependencyState, EdgeKind};
use crate::params::{AccessClass, ParamTable, ParamValue};
use crate::symbols::{SymbolName, SymbolValue};
use crate::version::Version;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// A resolved symbol import of one instance
#[derive(Clone)]
pub struct ImportBinding {
    /// Imported symbol name
    pub name: String,
    /// Namespace of the import
    pub namespace: String,
    /// Version the exporter actually provides
    pub version: Version,
    /// Name of the exporting instance
    pub exporter: String,
    /// The bound value
    pub value: SymbolValue,
}

impl fmt::Debug for ImportBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportBinding")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("version", &self.version)
            .field("exporter", &self.exporter)
            .finish_non_exhaustive()
    }
}

/// A dynamic export constructed during load, kept for ordered teardown
pub(crate) struct ConstructedExport {
    pub(crate) key: SymbolName,
    pub(crate) version: Version,
    pub(crate) value: SymbolValue,
    pub(crate) destructor: crate::declaration::SymbolDestructor,
}

/// A live module instance record
pub struct Instance {
    decl: ModuleExport,
    path: Option<PathBuf>,
    /// Keeps the owning shared library mapped while the instance lives
    _binary: Option<Arc<crate::discovery::ModuleBinary>>,
    resources: Vec<PathBuf>,
    params: ParamTable,
    imports: Mutex<Vec<ImportBinding>>,
    constructed: Mutex<Vec<ConstructedExport>>,
    state: Mutex<Option<Box<dyn Any + Send>>>,
    debug_info: Mutex<Option<DebugInfo>>,
    strong: AtomicUsize,
    unloadable: AtomicBool,
    shared: Weak<ContextShared>,
    loaded_at: DateTime<Utc>,
}

impl Instance {
    /// Allocate a record with the initial self strong reference
    pub(crate) fn new(
        decl: ModuleExport,
        path: Option<PathBuf>,
        binary: Option<Arc<crate::discovery::ModuleBinary>>,
        resources: Vec<PathBuf>,
        shared: &Arc<ContextShared>,
    ) -> Arc<Self> {
        let params = ParamTable::new(&decl.name, &decl.parameters);
        Arc::new(Self {
            decl,
            path,
            _binary: binary,
            resources,
            params,
            imports: Mutex::new(Vec::new()),
            constructed: Mutex::new(Vec::new()),
            state: Mutex::new(None),
            debug_info: Mutex::new(None),
            strong: AtomicUsize::new(1),
            unloadable: AtomicBool::new(false),
            shared: Arc::downgrade(shared),
            loaded_at: Utc::now(),
        })
    }

    /// Instance name
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    /// The declaration the instance was loaded from
    pub(crate) fn decl(&self) -> &ModuleExport {
        &self.decl
    }

    /// Owning binary path, absent for the root instance
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Resolved resource paths, in declaration order
    pub fn resources(&self) -> &[PathBuf] {
        &self.resources
    }

    /// Current strong count; advisory off the executor thread
    pub fn strong_count(&self) -> usize {
        self.strong.load(Ordering::Acquire)
    }

    /// Whether the instance is loaded and usable
    pub fn is_live(&self) -> bool {
        self.strong_count() > 0
    }

    pub(crate) fn params(&self) -> &ParamTable {
        &self.params
    }

    pub(crate) fn set_state(&self, state: Box<dyn Any + Send>) {
        *self.state.lock() = Some(state);
    }

    pub(crate) fn take_state(&self) -> Option<Box<dyn Any + Send>> {
        self.state.lock().take()
    }

    pub(crate) fn take_constructed(&self) -> Vec<ConstructedExport> {
        self.constructed.lock().drain(..).collect()
    }

    pub(crate) fn set_imports(&self, imports: Vec<ImportBinding>) {
        *self.imports.lock() = imports;
    }

    pub(crate) fn set_debug_info(&self, info: DebugInfo) {
        *self.debug_info.lock() = Some(info);
    }

    pub(crate) fn push_constructed(&self, export: ConstructedExport) {
        self.constructed.lock().push(export);
    }

    pub(crate) fn imports(&self) -> Vec<ImportBinding> {
        self.imports.lock().clone()
    }

    /// Acquire a strong reference unless the count already reached zero
    ///
    /// Zero is final: an instance that lost its last strong reference can
    /// never be resurrected, even before the prune pass destroyed it.
    pub(crate) fn try_acquire_strong(&self) -> bool {
        let mut current = self.strong.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.strong.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Release one strong reference; 1 -> 0 schedules a prune pass
    pub(crate) fn release_strong(&self) {
        let previous = self.strong.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "strong count underflow on {}", self.name());
        if previous == 1 {
            if let Some(shared) = self.shared.upgrade() {
                shared.schedule_prune();
            }
        }
    }

    /// Release the self reference; idempotent
    pub(crate) fn mark_unloadable(&self) {
        if !self.unloadable.swap(true, Ordering::AcqRel) {
            debug!("module {} marked unloadable", self.name());
            self.release_strong();
        }
    }

    /// Observer snapshot of this instance
    pub(crate) fn info(self: &Arc<Self>) -> InstanceInfo {
        InstanceInfo {
            name: self.decl.name.clone(),
            description: self.decl.description.clone(),
            author: self.decl.author.clone(),
            license: self.decl.license.clone(),
            path: self.path.clone(),
            loaded_at: self.loaded_at,
            instance: Arc::downgrade(self),
        }
    }

    /// Context for code acting as this instance
    pub(crate) fn context(self: &Arc<Self>) -> InstanceContext {
        InstanceContext {
            name: self.decl.name.clone(),
            instance: Arc::downgrade(self),
            shared: self.shared.clone(),
        }
    }

    /// The irreversible unload sequence; runs on the executor thread
    pub(crate) fn teardown(self: &Arc<Self>, shared: &Arc<ContextShared>) {
        debug!("unloading module {}", self.name());
        let instance_ctx = self.context();

        // 1. Stop-event listener; failures are logged, never propagated.
        if let Some(listener) = self.decl.stop_listener() {
            if let Err(e) = listener(&instance_ctx) {
                error!("stop listener of {} failed: {}", self.name(), e);
            }
        }

        // 2. Destroy dynamic exports in reverse construction order.
        let constructed: Vec<ConstructedExport> = {
            let mut slot = self.constructed.lock();
            slot.drain(..).collect()
        };
        for export in constructed.into_iter().rev() {
            (export.destructor)(export.value);
        }

        // 3. Retract every export from the symbol index.
        let retracted = shared.symbols().retract_all(self.name());
        if !retracted.is_empty() {
            debug!("retracted {} symbols of {}", retracted.len(), self.name());
        }

        // 4. Release every dependency edge this instance held.
        for (target, kind) in shared.graph().remove_node(self.name()) {
            match shared.registry().get(&target) {
                Some(instance) => instance.release_strong(),
                None => warn!(
                    "dangling {:?} dependency {} -> {}",
                    kind,
                    self.name(),
                    target
                ),
            }
        }

        // 5. Instance-state destructor.
        let state = self.state.lock().take();
        if let Some(state) = state {
            if let Some((_, destructor)) = self.decl.instance_state() {
                destructor(state);
            }
        }

        // 6. Drop owned tables; the binary mapping follows the record.
        self.imports.lock().clear();
        self.debug_info.lock().take();

        // 7. Unregister; the record is freed once all observers drop.
        shared.registry().remove(self.name());
        for hook in self.decl.unload_hooks() {
            hook();
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.decl.name)
            .field("path", &self.path)
            .field("strong", &self.strong_count())
            .field("unloadable", &self.unloadable.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// Observer handle for an instance
///
/// Holds the metadata plus a weak back-reference; an `InstanceInfo` that
/// outlives its instance simply observes `is_loaded() == false`.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    name: String,
    description: String,
    author: String,
    license: String,
    path: Option<PathBuf>,
    loaded_at: DateTime<Utc>,
    instance: Weak<Instance>,
}

impl InstanceInfo {
    /// Instance name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description string
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Author string
    pub fn author(&self) -> &str {
        &self.author
    }

    /// License string
    pub fn license(&self) -> &str {
        &self.license
    }

    /// Owning binary path
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// When the instance was loaded
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Whether the instance is still loaded
    pub fn is_loaded(&self) -> bool {
        self.instance
            .upgrade()
            .map(|instance| instance.is_live())
            .unwrap_or(false)
    }

    /// Current strong count, zero once unloaded; advisory off the executor
    pub fn strong_count(&self) -> usize {
        self.instance
            .upgrade()
            .map(|instance| instance.strong_count())
            .unwrap_or(0)
    }

    /// Acquire a strong reference, preventing unload while held
    pub fn try_ref_strong(&self) -> ModuleResult<InstanceRef> {
        let instance = self
            .instance
            .upgrade()
            .ok_or_else(|| ModuleError::InstanceUnloaded(self.name.clone()))?;
        if !instance.try_acquire_strong() {
            return Err(ModuleError::InstanceUnloaded(self.name.clone()));
        }
        Ok(InstanceRef { instance })
    }
}

/// RAII strong reference to an instance
pub struct InstanceRef {
    instance: Arc<Instance>,
}

impl InstanceRef {
    /// Instance name
    pub fn name(&self) -> &str {
        self.instance.name()
    }

    /// Observer snapshot
    pub fn info(&self) -> InstanceInfo {
        self.instance.info()
    }

    /// Debug metadata constructed at load, when the module declared it
    pub fn debug_info(&self) -> Option<DebugInfo> {
        self.instance.debug_info.lock().clone()
    }
}

impl Clone for InstanceRef {
    fn clone(&self) -> Self {
        // Holding one strong reference keeps the count above zero, so the
        // acquisition cannot fail.
        let acquired = self.instance.try_acquire_strong();
        debug_assert!(acquired);
        Self {
            instance: self.instance.clone(),
        }
    }
}

impl Drop for InstanceRef {
    fn drop(&mut self) {
        self.instance.release_strong();
    }
}

impl fmt::Debug for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRef")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// The API surface handed to module code
///
/// Constructors, listeners, and module-owned state use this to mutate
/// dependencies and namespaces, load symbols, and access parameters as
/// the instance. All operations are synchronous; they fail with
/// [`ModuleError::InstanceUnloaded`] once the instance is gone.
#[derive(Clone)]
pub struct InstanceContext {
    name: String,
    instance: Weak<Instance>,
    shared: Weak<ContextShared>,
}

impl InstanceContext {
    /// Name of the instance this context acts as
    pub fn name(&self) -> &str {
        &self.name
    }

    fn live(&self) -> ModuleResult<(Arc<Instance>, Arc<ContextShared>)> {
        let instance = self
            .instance
            .upgrade()
            .filter(|instance| instance.is_live())
            .ok_or_else(|| ModuleError::InstanceUnloaded(self.name.clone()))?;
        let shared = self
            .shared
            .upgrade()
            .ok_or(ModuleError::EventLoopShutDown)?;
        Ok((instance, shared))
    }

    /// Observer snapshot of the instance
    pub fn info(&self) -> ModuleResult<InstanceInfo> {
        let (instance, _) = self.live()?;
        Ok(instance.info())
    }

    /// Resolved resource paths
    pub fn resources(&self) -> ModuleResult<Vec<PathBuf>> {
        let (instance, _) = self.live()?;
        Ok(instance.resources().to_vec())
    }

    /// The resolved import table
    pub fn imports(&self) -> ModuleResult<Vec<ImportBinding>> {
        let (instance, _) = self.live()?;
        Ok(instance.imports())
    }

    /// A single resolved import
    pub fn import(&self, namespace: &str, name: &str) -> ModuleResult<ImportBinding> {
        let (instance, _) = self.live()?;
        instance
            .imports()
            .into_iter()
            .find(|binding| binding.namespace == namespace && binding.name == name)
            .ok_or_else(|| ModuleError::UnknownSymbol {
                name: name.to_string(),
                namespace: namespace.to_string(),
                version: "any".to_string(),
            })
    }

    /// Add a dynamic dependency on `target`
    pub fn add_dependency(&self, target: &str) -> ModuleResult<()> {
        let (_, shared) = self.live()?;
        shared.add_dependency(&self.name, target, EdgeKind::Dynamic)
    }

    /// Remove a dynamic dependency on `target`
    pub fn remove_dependency(&self, target: &str) -> ModuleResult<()> {
        let (_, shared) = self.live()?;
        shared.remove_dependency(&self.name, target)
    }

    /// Query the dependency on `target`
    pub fn query_dependency(&self, target: &str) -> ModuleResult<DependencyState> {
        let (_, shared) = self.live()?;
        Ok(shared.graph().query_edge(&self.name, target))
    }

    /// Include a namespace dynamically
    pub fn include_namespace(&self, namespace: &str) -> ModuleResult<()> {
        let (_, shared) = self.live()?;
        if !shared.symbols().namespace_exists(namespace) {
            return Err(ModuleError::NamespaceNotFound(namespace.to_string()));
        }
        shared
            .graph()
            .add_include(&self.name, namespace, EdgeKind::Dynamic)
    }

    /// Remove a dynamic namespace include
    pub fn exclude_namespace(&self, namespace: &str) -> ModuleResult<()> {
        let (_, shared) = self.live()?;
        shared.graph().remove_include(&self.name, namespace)
    }

    /// Query the include of `namespace`
    pub fn query_namespace(&self, namespace: &str) -> ModuleResult<DependencyState> {
        let (_, shared) = self.live()?;
        Ok(shared.graph().query_include(&self.name, namespace))
    }

    /// Load a symbol as this instance
    ///
    /// Requires the namespace to be visible (global, included, or exported
    /// by this instance) and a dependency edge to the exporter, so the
    /// binding can never outlive the exporting module.
    pub fn load_symbol(
        &self,
        namespace: &str,
        name: &str,
        min_version: Version,
    ) -> ModuleResult<SymbolValue> {
        let (instance, shared) = self.live()?;
        shared.load_symbol_for(&instance, namespace, name, min_version)
    }

    /// Read a parameter of `module` as this instance
    pub fn read_parameter(&self, module: &str, param: &str) -> ModuleResult<ParamValue> {
        let (_, shared) = self.live()?;
        let owner = shared
            .registry()
            .get(module)
            .filter(|owner| owner.is_live())
            .ok_or_else(|| ModuleError::InstanceNotFound(module.to_string()))?;
        owner.params().read(param, self.class_for(&shared, module))
    }

    /// Write a parameter of `module` as this instance
    pub fn write_parameter(
        &self,
        module: &str,
        param: &str,
        value: ParamValue,
    ) -> ModuleResult<()> {
        let (_, shared) = self.live()?;
        let owner = shared
            .registry()
            .get(module)
            .filter(|owner| owner.is_live())
            .ok_or_else(|| ModuleError::InstanceNotFound(module.to_string()))?;
        owner
            .params()
            .write(param, value, self.class_for(&shared, module))
    }

    fn class_for(&self, shared: &Arc<ContextShared>, owner: &str) -> AccessClass {
        if owner == self.name {
            AccessClass::Owner
        } else if shared.graph().depends_on(&self.name, owner) {
            AccessClass::Dependent
        } else {
            AccessClass::Foreign
        }
    }
}

impl fmt::Debug for InstanceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceContext")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
