//! Module export declarations
//!
//! A declaration is everything a binary states about one module: header
//! metadata, parameters, resources, imported namespaces, imported
//! symbols, static and dynamic exports, and a modifier list. Declarations
//! are staged into a loading set and turned into live instances by the
//! commit engine.

use crate::error::{ModuleError, ModuleResult};
use crate::instance::InstanceContext;
use crate::params::ParameterDecl;
use crate::resources::ResourceDecl;
use crate::symbols::{SymbolName, SymbolValue, GLOBAL_NAMESPACE};
use crate::version::{Version, SUBSYSTEM_VERSION};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Linkage of an exported symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
    /// Visible to every importer
    #[default]
    Global,
    /// Visible only to the exporting instance
    Unique,
}

/// Constructor for the instance's private state
pub type StateConstructor = Arc<
    dyn Fn(InstanceContext) -> BoxFuture<'static, ModuleResult<Box<dyn Any + Send>>>
        + Send
        + Sync,
>;

/// Destructor for the instance's private state
pub type StateDestructor = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

/// Constructor for a dynamic export's value
pub type SymbolConstructor =
    Arc<dyn Fn(InstanceContext) -> BoxFuture<'static, ModuleResult<SymbolValue>> + Send + Sync>;

/// Destructor for a dynamic export's value
pub type SymbolDestructor = Arc<dyn Fn(SymbolValue) + Send + Sync>;

/// Listener invoked after a successful load; an error tears the module down
pub type StartListener = Arc<dyn Fn(&InstanceContext) -> ModuleResult<()> + Send + Sync>;

/// Listener invoked at the start of unload; errors are logged, not propagated
pub type StopListener = Arc<dyn Fn(&InstanceContext) -> ModuleResult<()> + Send + Sync>;

/// Hook invoked after the instance record was torn down
pub type UnloadHook = Arc<dyn Fn() + Send + Sync>;

/// Constructor for the module's debug-info record
pub type DebugInfoConstructor = Arc<dyn Fn() -> DebugInfo + Send + Sync>;

/// Read-only debug metadata attached to an instance at load
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugInfo {
    /// Free-form key/value entries
    pub entries: Vec<(String, String)>,
}

/// An import of a whole namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceImport {
    /// Namespace to include
    pub namespace: String,
}

/// An import of one symbol at a minimum version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolImport {
    /// Symbol name
    pub name: String,
    /// Namespace the symbol lives in
    pub namespace: String,
    /// Minimum required version
    pub version: Version,
}

impl SymbolImport {
    pub(crate) fn key(&self) -> SymbolName {
        SymbolName::new(self.namespace.clone(), self.name.clone())
    }
}

/// A static export: the value exists at declaration time
#[derive(Clone)]
pub struct StaticExport {
    /// Symbol name
    pub name: String,
    /// Namespace the symbol is published in
    pub namespace: String,
    /// Exported version
    pub version: Version,
    /// Linkage
    pub linkage: Linkage,
    /// The exported value
    pub value: SymbolValue,
}

impl StaticExport {
    pub(crate) fn key(&self) -> SymbolName {
        SymbolName::new(self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Debug for StaticExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticExport")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("version", &self.version)
            .field("linkage", &self.linkage)
            .finish_non_exhaustive()
    }
}

/// A dynamic export: the value is produced by a constructor at load time
#[derive(Clone)]
pub struct DynamicExport {
    /// Symbol name
    pub name: String,
    /// Namespace the symbol is published in
    pub namespace: String,
    /// Exported version
    pub version: Version,
    /// Linkage
    pub linkage: Linkage,
    /// Builds the value during load
    pub constructor: SymbolConstructor,
    /// Destroys the value during unload
    pub destructor: SymbolDestructor,
}

impl DynamicExport {
    pub(crate) fn key(&self) -> SymbolName {
        SymbolName::new(self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Debug for DynamicExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicExport")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("version", &self.version)
            .field("linkage", &self.linkage)
            .finish_non_exhaustive()
    }
}

/// Tagged declaration extensions
///
/// Unknown keys must fail the owning module's load; forward compatibility
/// is opt-in through version negotiation, never silent skipping.
#[derive(Clone)]
pub enum Modifier {
    /// Hook run after teardown completes
    Destructor(UnloadHook),
    /// Static dependency on a named instance
    StaticDependency {
        /// Name of the depended-on instance
        instance: String,
    },
    /// Debug-info constructor, run at load when the feature is enabled
    DebugInfo(DebugInfoConstructor),
    /// Instance-state constructor/destructor pair
    InstanceState {
        /// Builds the private state
        constructor: StateConstructor,
        /// Destroys the private state
        destructor: StateDestructor,
    },
    /// Start-event listener
    StartEvent(StartListener),
    /// Stop-event listener
    StopEvent(StopListener),
    /// A key this subsystem build does not recognize
    Unknown {
        /// The unrecognized modifier key
        key: String,
    },
}

impl fmt::Debug for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modifier::Destructor(_) => write!(f, "Destructor"),
            Modifier::StaticDependency { instance } => {
                write!(f, "StaticDependency({})", instance)
            }
            Modifier::DebugInfo(_) => write!(f, "DebugInfo"),
            Modifier::InstanceState { .. } => write!(f, "InstanceState"),
            Modifier::StartEvent(_) => write!(f, "StartEvent"),
            Modifier::StopEvent(_) => write!(f, "StopEvent"),
            Modifier::Unknown { key } => write!(f, "Unknown({})", key),
        }
    }
}

/// A complete module export declaration
#[derive(Clone)]
pub struct ModuleExport {
    /// Module name, unique within the process
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Author string
    pub author: String,
    /// License string
    pub license: String,
    /// Subsystem version the declaration was built against
    pub subsystem_version: Version,
    /// Declared parameters
    pub parameters: Vec<ParameterDecl>,
    /// Declared resources
    pub resources: Vec<ResourceDecl>,
    /// Imported namespaces
    pub namespace_imports: Vec<NamespaceImport>,
    /// Imported symbols
    pub symbol_imports: Vec<SymbolImport>,
    /// Static exports
    pub static_exports: Vec<StaticExport>,
    /// Dynamic exports
    pub dynamic_exports: Vec<DynamicExport>,
    /// Modifier list
    pub modifiers: Vec<Modifier>,
}

impl fmt::Debug for ModuleExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleExport")
            .field("name", &self.name)
            .field("subsystem_version", &self.subsystem_version)
            .field("parameters", &self.parameters.len())
            .field("resources", &self.resources.len())
            .field("namespace_imports", &self.namespace_imports.len())
            .field("symbol_imports", &self.symbol_imports.len())
            .field("static_exports", &self.static_exports.len())
            .field("dynamic_exports", &self.dynamic_exports.len())
            .field("modifiers", &self.modifiers)
            .finish()
    }
}

impl ModuleExport {
    /// Start building a declaration for `name`
    pub fn builder(name: impl Into<String>) -> ModuleExportBuilder {
        ModuleExportBuilder::new(name)
    }

    /// The instance-state constructor/destructor pair, if declared
    pub(crate) fn instance_state(&self) -> Option<(StateConstructor, StateDestructor)> {
        self.modifiers.iter().find_map(|modifier| match modifier {
            Modifier::InstanceState {
                constructor,
                destructor,
            } => Some((constructor.clone(), destructor.clone())),
            _ => None,
        })
    }

    /// Declared static dependencies on named instances
    pub(crate) fn static_dependencies(&self) -> impl Iterator<Item = &str> {
        self.modifiers.iter().filter_map(|modifier| match modifier {
            Modifier::StaticDependency { instance } => Some(instance.as_str()),
            _ => None,
        })
    }

    /// The start-event listener, if declared
    pub(crate) fn start_listener(&self) -> Option<StartListener> {
        self.modifiers.iter().find_map(|modifier| match modifier {
            Modifier::StartEvent(listener) => Some(listener.clone()),
            _ => None,
        })
    }

    /// The stop-event listener, if declared
    pub(crate) fn stop_listener(&self) -> Option<StopListener> {
        self.modifiers.iter().find_map(|modifier| match modifier {
            Modifier::StopEvent(listener) => Some(listener.clone()),
            _ => None,
        })
    }

    /// The unload hooks, in declaration order
    pub(crate) fn unload_hooks(&self) -> impl Iterator<Item = UnloadHook> + '_ {
        self.modifiers.iter().filter_map(|modifier| match modifier {
            Modifier::Destructor(hook) => Some(hook.clone()),
            _ => None,
        })
    }

    /// The debug-info constructor, if declared
    pub(crate) fn debug_info(&self) -> Option<DebugInfoConstructor> {
        self.modifiers.iter().find_map(|modifier| match modifier {
            Modifier::DebugInfo(constructor) => Some(constructor.clone()),
            _ => None,
        })
    }

    /// Validate the declaration shape against this subsystem build
    ///
    /// Checks the subsystem version negotiation, modifier keys, and
    /// resource paths. Name collisions against other modules are the
    /// commit engine's concern.
    pub(crate) fn validate(&self) -> ModuleResult<()> {
        if self.name.is_empty() {
            return Err(ModuleError::InvalidDeclaration(
                "module name must not be empty".to_string(),
            ));
        }
        if self.subsystem_version.major != SUBSYSTEM_VERSION.major {
            return Err(ModuleError::SubsystemVersionMismatch {
                module: self.name.clone(),
                declared: self.subsystem_version.to_string(),
                current: SUBSYSTEM_VERSION.to_string(),
            });
        }
        for modifier in &self.modifiers {
            if let Modifier::Unknown { key } = modifier {
                return Err(ModuleError::InvalidModifier {
                    module: self.name.clone(),
                    key: key.clone(),
                });
            }
        }
        for resource in &self.resources {
            resource.validate()?;
        }
        Ok(())
    }

    /// All export keys, static first, in declaration order
    pub(crate) fn export_keys(&self) -> Vec<(SymbolName, Version)> {
        self.static_exports
            .iter()
            .map(|e| (e.key(), e.version))
            .chain(self.dynamic_exports.iter().map(|e| (e.key(), e.version)))
            .collect()
    }

    /// Export keys other modules may import: unique linkage is private to
    /// the exporting instance
    pub(crate) fn provider_keys(&self) -> Vec<(SymbolName, Version)> {
        self.static_exports
            .iter()
            .filter(|e| e.linkage == Linkage::Global)
            .map(|e| (e.key(), e.version))
            .chain(
                self.dynamic_exports
                    .iter()
                    .filter(|e| e.linkage == Linkage::Global)
                    .map(|e| (e.key(), e.version)),
            )
            .collect()
    }
}

/// Builder for [`ModuleExport`]
pub struct ModuleExportBuilder {
    export: ModuleExport,
}

impl ModuleExportBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            export: ModuleExport {
                name: name.into(),
                description: String::new(),
                author: String::new(),
                license: String::new(),
                subsystem_version: SUBSYSTEM_VERSION,
                parameters: Vec::new(),
                resources: Vec::new(),
                namespace_imports: Vec::new(),
                symbol_imports: Vec::new(),
                static_exports: Vec::new(),
                dynamic_exports: Vec::new(),
                modifiers: Vec::new(),
            },
        }
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.export.description = description.into();
        self
    }

    /// Set the author
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.export.author = author.into();
        self
    }

    /// Set the license
    pub fn license(mut self, license: impl Into<String>) -> Self {
        self.export.license = license.into();
        self
    }

    /// Declare a parameter
    pub fn parameter(mut self, decl: ParameterDecl) -> Self {
        self.export.parameters.push(decl);
        self
    }

    /// Declare a resource path
    pub fn resource(mut self, path: impl Into<String>) -> Self {
        self.export.resources.push(ResourceDecl::new(path));
        self
    }

    /// Import a namespace
    pub fn import_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.export.namespace_imports.push(NamespaceImport {
            namespace: namespace.into(),
        });
        self
    }

    /// Import a symbol from the global namespace
    pub fn import(self, name: impl Into<String>, version: Version) -> Self {
        self.import_from(GLOBAL_NAMESPACE, name, version)
    }

    /// Import a symbol from a namespace
    pub fn import_from(
        mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        version: Version,
    ) -> Self {
        self.export.symbol_imports.push(SymbolImport {
            name: name.into(),
            namespace: namespace.into(),
            version,
        });
        self
    }

    /// Export a static symbol into the global namespace
    pub fn export(
        self,
        name: impl Into<String>,
        version: Version,
        value: SymbolValue,
    ) -> Self {
        self.export_in(GLOBAL_NAMESPACE, name, version, value)
    }

    /// Export a static symbol into a namespace
    pub fn export_in(
        mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        version: Version,
        value: SymbolValue,
    ) -> Self {
        self.export.static_exports.push(StaticExport {
            name: name.into(),
            namespace: namespace.into(),
            version,
            linkage: Linkage::Global,
            value,
        });
        self
    }

    /// Export a dynamic symbol into a namespace
    pub fn export_dynamic_in(
        mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        version: Version,
        constructor: SymbolConstructor,
        destructor: SymbolDestructor,
    ) -> Self {
        self.export.dynamic_exports.push(DynamicExport {
            name: name.into(),
            namespace: namespace.into(),
            version,
            linkage: Linkage::Global,
            constructor,
            destructor,
        });
        self
    }

    /// Export a dynamic symbol into the global namespace
    pub fn export_dynamic(
        self,
        name: impl Into<String>,
        version: Version,
        constructor: SymbolConstructor,
        destructor: SymbolDestructor,
    ) -> Self {
        self.export_dynamic_in(GLOBAL_NAMESPACE, name, version, constructor, destructor)
    }

    /// Declare the instance-state constructor/destructor pair
    pub fn state(mut self, constructor: StateConstructor, destructor: StateDestructor) -> Self {
        self.export.modifiers.push(Modifier::InstanceState {
            constructor,
            destructor,
        });
        self
    }

    /// Declare instance state from an async closure
    pub fn state_async<F, Fut, D>(self, constructor: F, destructor: D) -> Self
    where
        F: Fn(InstanceContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ModuleResult<Box<dyn Any + Send>>> + Send + 'static,
        D: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        self.state(
            Arc::new(
                move |ctx| -> BoxFuture<'static, ModuleResult<Box<dyn Any + Send>>> {
                    Box::pin(constructor(ctx))
                },
            ),
            Arc::new(destructor),
        )
    }

    /// Declare a static dependency on a named instance
    pub fn depends_on(mut self, instance: impl Into<String>) -> Self {
        self.export.modifiers.push(Modifier::StaticDependency {
            instance: instance.into(),
        });
        self
    }

    /// Register the start-event listener
    pub fn on_start(mut self, listener: StartListener) -> Self {
        self.export.modifiers.push(Modifier::StartEvent(listener));
        self
    }

    /// Register the stop-event listener
    pub fn on_stop(mut self, listener: StopListener) -> Self {
        self.export.modifiers.push(Modifier::StopEvent(listener));
        self
    }

    /// Register an unload hook
    pub fn on_unload(mut self, hook: UnloadHook) -> Self {
        self.export.modifiers.push(Modifier::Destructor(hook));
        self
    }

    /// Attach a debug-info constructor
    pub fn debug_info(mut self, constructor: DebugInfoConstructor) -> Self {
        self.export.modifiers.push(Modifier::DebugInfo(constructor));
        self
    }

    /// Attach a raw modifier; used when translating foreign declarations
    pub fn modifier(mut self, modifier: Modifier) -> Self {
        self.export.modifiers.push(modifier);
        self
    }

    /// Finish the declaration
    pub fn build(self) -> ModuleExport {
        self.export
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assembles_all_tables() {
        let export = ModuleExport::builder("gfx")
            .description("graphics core")
            .author("modulith")
            .license("MIT")
            .resource("assets/shaders")
            .import("alloc", Version::new(1, 0, 0))
            .import_from("hal", "present", Version::new(2, 1, 0))
            .import_namespace("hal")
            .export("draw", Version::new(1, 0, 0), Arc::new(1u32))
            .depends_on("platform")
            .build();

        assert_eq!(export.symbol_imports.len(), 2);
        assert_eq!(export.static_exports.len(), 1);
        assert_eq!(export.static_dependencies().collect::<Vec<_>>(), vec!["platform"]);
        export.validate().unwrap();
    }

    #[test]
    fn unknown_modifier_fails_validation() {
        let export = ModuleExport::builder("gfx")
            .modifier(Modifier::Unknown {
                key: "hologram".to_string(),
            })
            .build();
        assert!(matches!(
            export.validate(),
            Err(ModuleError::InvalidModifier { key, .. }) if key == "hologram"
        ));
    }

    #[test]
    fn foreign_major_version_fails_validation() {
        let mut export = ModuleExport::builder("gfx").build();
        export.subsystem_version = Version::new(SUBSYSTEM_VERSION.major + 1, 0, 0);
        assert!(matches!(
            export.validate(),
            Err(ModuleError::SubsystemVersionMismatch { .. })
        ));
    }

    #[test]
    fn absolute_resource_fails_validation() {
        let export = ModuleExport::builder("gfx").resource("/abs").build();
        assert!(matches!(
            export.validate(),
            Err(ModuleError::InvalidResourcePath(_))
        ));
    }
}
