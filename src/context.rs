//! The module subsystem context
//!
//! A [`Context`] owns the event loop, the instance registry, the symbol
//! index, and the dependency graph, and hands out loading sets. It is a
//! cheap clone over shared state, like every other handle in the crate.
//! Construction starts the process event loop and installs the root
//! pseudo-instance; [`Context::shutdown`] drains and joins the loop.

use crate::config::{self, ContextConfig, FeatureStatus, Profile};
use crate::declaration::ModuleExport;
use crate::error::{ModuleError, ModuleResult};
use crate::executor::sync::AsyncMutex;
use crate::executor::{EventLoop, EventLoopHandle};
use crate::graph::{DependencyGraph, EdgeKind};
use crate::instance::{Instance, InstanceContext, InstanceInfo};
use crate::loading::LoadingSet;
use crate::params::{AccessClass, ParamValue};
use crate::registry::InstanceRegistry;
use crate::symbols::{SymbolIndex, SymbolName, SymbolValue, GLOBAL_NAMESPACE};
use crate::version::Version;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the pseudo-instance installed at bootstrap
///
/// The root instance owns no binary and exports nothing; it exists so
/// callers can hold dependencies and parameters before any real module
/// is loaded. The angle brackets keep it out of the namespace of
/// loadable module names.
pub const ROOT_INSTANCE: &str = "<root>";

/// Process-global state behind a [`Context`]
pub(crate) struct ContextShared {
    executor: EventLoopHandle,
    event_loop: Mutex<Option<EventLoop>>,
    registry: InstanceRegistry,
    symbols: SymbolIndex,
    graph: DependencyGraph,
    commit_lock: AsyncMutex,
    config: ContextConfig,
    features: Vec<FeatureStatus>,
    prune_scheduled: AtomicBool,
}

impl ContextShared {
    pub(crate) fn executor(&self) -> &EventLoopHandle {
        &self.executor
    }

    pub(crate) fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub(crate) fn symbols(&self) -> &SymbolIndex {
        &self.symbols
    }

    pub(crate) fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub(crate) fn commit_lock(&self) -> &AsyncMutex {
        &self.commit_lock
    }

    /// Resolved state of a feature; unrequested features keep their default
    pub(crate) fn feature_enabled(&self, name: &str) -> bool {
        self.features
            .iter()
            .find(|status| status.name == name)
            .map(|status| status.enabled)
            .unwrap_or_else(|| config::feature_default(name))
    }

    /// Add a dependency edge, holding the target's strong count
    pub(crate) fn add_dependency(
        &self,
        from: &str,
        to: &str,
        kind: EdgeKind,
    ) -> ModuleResult<()> {
        let target = self
            .registry
            .get(to)
            .ok_or_else(|| ModuleError::InstanceNotFound(to.to_string()))?;
        if !target.try_acquire_strong() {
            return Err(ModuleError::InstanceUnloaded(to.to_string()));
        }
        if let Err(error) = self.graph.add_edge(from, to, kind) {
            target.release_strong();
            return Err(error);
        }
        Ok(())
    }

    /// Remove a dynamic dependency edge, releasing the target
    pub(crate) fn remove_dependency(&self, from: &str, to: &str) -> ModuleResult<()> {
        self.graph.remove_edge(from, to)?;
        if let Some(target) = self.registry.get(to) {
            target.release_strong();
        }
        Ok(())
    }

    /// Symbol lookup on behalf of `instance`
    ///
    /// The namespace must be visible to the instance and the instance
    /// must hold a dependency edge to the exporter.
    pub(crate) fn load_symbol_for(
        &self,
        instance: &Arc<Instance>,
        namespace: &str,
        name: &str,
        min_version: Version,
    ) -> ModuleResult<SymbolValue> {
        let caller = instance.name();
        let visible = namespace == GLOBAL_NAMESPACE
            || self.graph.query_include(caller, namespace)
                != crate::graph::DependencyState::Removed
            || instance
                .decl()
                .export_keys()
                .iter()
                .any(|(key, _)| key.namespace == namespace);
        if !visible {
            return Err(ModuleError::NamespaceNotIncluded(namespace.to_string()));
        }

        let key = SymbolName::new(namespace, name);
        let (_, entry) = self.symbols.lookup_visible(&key, &min_version, Some(caller))?;
        if entry.owner != caller && !self.graph.depends_on(caller, &entry.owner) {
            return Err(ModuleError::DependencyNotFound {
                from: caller.to_string(),
                to: entry.owner.clone(),
            });
        }
        Ok(entry.value)
    }

    /// Coalesced request for a prune pass on the executor
    pub(crate) fn schedule_prune(self: &Arc<Self>) {
        if self.prune_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = self.clone();
        let spawned = self.executor.spawn(async move {
            shared.prune_scheduled.store(false, Ordering::Release);
            shared.prune_pass();
        });
        if spawned.is_err() {
            // Loop is draining for shutdown; records die with the process.
            self.prune_scheduled.store(false, Ordering::Release);
            debug!("prune request after shutdown ignored");
        }
    }

    /// Destroy every instance whose strong count reached zero
    ///
    /// Runs to a fixpoint: tearing an instance down releases its edges,
    /// which may push further instances to zero.
    pub(crate) fn prune_pass(self: &Arc<Self>) {
        loop {
            let candidates = self.registry.prune_candidates();
            if candidates.is_empty() {
                return;
            }
            debug!("pruning {} instances", candidates.len());
            for name in self.graph.destruction_order(&candidates) {
                if let Some(instance) = self.registry.get(&name) {
                    if instance.strong_count() == 0 {
                        instance.teardown(self);
                    }
                }
            }
        }
    }
}

impl Drop for ContextShared {
    fn drop(&mut self) {
        let event_loop = self.event_loop.lock().take();
        if let Some(event_loop) = event_loop {
            if event_loop.is_worker_thread() {
                event_loop.detach();
            } else {
                event_loop.join();
            }
        }
    }
}

/// Handle to the module subsystem
#[derive(Clone)]
pub struct Context {
    shared: Arc<ContextShared>,
}

impl Context {
    /// Construct a context with the given configuration
    ///
    /// Starts the process event loop (one per process), validates the
    /// feature requests, and installs the root instance.
    pub fn new(config: ContextConfig) -> ModuleResult<Self> {
        let features = config.resolve_features()?;
        let event_loop = EventLoop::start()?;
        let executor = event_loop.handle();

        let shared = Arc::new(ContextShared {
            executor,
            event_loop: Mutex::new(Some(event_loop)),
            registry: InstanceRegistry::new(),
            symbols: SymbolIndex::new(),
            graph: DependencyGraph::new(),
            commit_lock: AsyncMutex::new(),
            config,
            features,
            prune_scheduled: AtomicBool::new(false),
        });

        let root = Instance::new(
            ModuleExport::builder(ROOT_INSTANCE)
                .description("bootstrap root instance")
                .build(),
            None,
            None,
            Vec::new(),
            &shared,
        );
        shared.registry.insert(root)?;
        shared.graph.add_node(ROOT_INSTANCE);

        info!(
            "module subsystem context created ({:?} profile)",
            shared.config.profile
        );
        Ok(Self { shared })
    }

    /// Context with the default configuration
    pub fn with_defaults() -> ModuleResult<Self> {
        Self::new(ContextConfig::new())
    }

    /// The configured profile
    pub fn profile(&self) -> Profile {
        self.shared.config.profile
    }

    /// The resolved feature-status vector
    pub fn features(&self) -> &[FeatureStatus] {
        &self.shared.features
    }

    /// A handle for enqueueing custom futures on the subsystem's loop
    pub fn executor(&self) -> EventLoopHandle {
        self.shared.executor.clone()
    }

    /// Create an empty loading set
    pub fn new_loading_set(&self) -> LoadingSet {
        LoadingSet::new(self.shared.clone())
    }

    /// Context acting as the root instance
    pub fn root(&self) -> InstanceContext {
        // The root instance is installed at construction and pinned until
        // shutdown, so the lookup cannot fail while `self` exists.
        self.shared
            .registry
            .get(ROOT_INSTANCE)
            .map(|instance| instance.context())
            .unwrap_or_else(|| {
                unreachable!("root instance missing from the registry")
            })
    }

    /// Observer for the named instance
    pub fn find_instance(&self, name: &str) -> ModuleResult<InstanceInfo> {
        self.shared
            .registry
            .get(name)
            .filter(|instance| instance.is_live())
            .map(|instance| instance.info())
            .ok_or_else(|| ModuleError::InstanceNotFound(name.to_string()))
    }

    /// Observer for the instance exporting `(namespace, name, version)`
    pub fn find_instance_by_symbol(
        &self,
        namespace: &str,
        name: &str,
        min_version: Version,
    ) -> ModuleResult<InstanceInfo> {
        let key = SymbolName::new(namespace, name);
        let (_, entry) = self.shared.symbols.lookup(&key, &min_version)?;
        self.find_instance(&entry.owner)
    }

    /// Whether any live export populates `namespace`
    pub fn namespace_exists(&self, namespace: &str) -> bool {
        self.shared.symbols.namespace_exists(namespace)
    }

    /// Live export count in `namespace`
    pub fn namespace_population(&self, namespace: &str) -> usize {
        self.shared.symbols.namespace_population(namespace)
    }

    /// Names of all live instances, including the root
    pub fn instance_names(&self) -> Vec<String> {
        self.shared.registry.names()
    }

    /// Release the named instance's self reference
    ///
    /// The instance is pruned once no dependency edge holds it; the prune
    /// runs on the executor, never inline.
    pub fn mark_unloadable(&self, name: &str) -> ModuleResult<()> {
        if name == ROOT_INSTANCE {
            return Err(ModuleError::AccessDenied(
                "the root instance cannot be unloaded".to_string(),
            ));
        }
        let instance = self
            .shared
            .registry
            .get(name)
            .filter(|instance| instance.is_live())
            .ok_or_else(|| ModuleError::InstanceNotFound(name.to_string()))?;
        instance.mark_unloadable();
        Ok(())
    }

    /// Read a public parameter of `module`
    pub fn read_parameter(&self, module: &str, param: &str) -> ModuleResult<ParamValue> {
        let instance = self
            .shared
            .registry
            .get(module)
            .filter(|instance| instance.is_live())
            .ok_or_else(|| ModuleError::InstanceNotFound(module.to_string()))?;
        instance.params().read(param, AccessClass::Foreign)
    }

    /// Write a public parameter of `module`
    pub fn write_parameter(
        &self,
        module: &str,
        param: &str,
        value: ParamValue,
    ) -> ModuleResult<()> {
        let instance = self
            .shared
            .registry
            .get(module)
            .filter(|instance| instance.is_live())
            .ok_or_else(|| ModuleError::InstanceNotFound(module.to_string()))?;
        instance.params().write(param, value, AccessClass::Foreign)
    }

    /// Block until the executor has no queued or suspended work
    ///
    /// Scheduled prunes and in-flight commits have run once this returns.
    pub fn drain(&self) {
        let event_loop = self.shared.event_loop.lock();
        if let Some(event_loop) = event_loop.as_ref() {
            event_loop.run_to_completion();
        }
    }

    /// Drain the executor and join its thread
    ///
    /// Marks the root instance unloadable, lets the final prune run, and
    /// blocks until the loop exits. Handles that outlive the shutdown see
    /// [`ModuleError::EventLoopShutDown`] on further submissions.
    pub fn shutdown(self) {
        info!("module subsystem shutting down");
        if let Some(root) = self.shared.registry.get(ROOT_INSTANCE) {
            root.mark_unloadable();
        }
        let event_loop = self.shared.event_loop.lock().take();
        if let Some(event_loop) = event_loop {
            event_loop.run_to_completion();
            event_loop.join();
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("profile", &self.shared.config.profile)
            .field("instances", &self.shared.registry.len())
            .finish_non_exhaustive()
    }
}
