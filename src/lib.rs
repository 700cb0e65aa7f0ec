//! Process-local module subsystem
//!
//! This crate loads, links, and unloads independently authored modules
//! inside a single process:
//! - Stages module declarations in loading sets and commits them
//!   atomically in dependency order
//! - Publishes exported symbols in a versioned, namespaced index
//! - Tracks dependencies in a cycle-free graph with strong/weak
//!   reference semantics, so no symbol binding outlives its exporter
//! - Drives every blocking operation on a single-threaded cooperative
//!   executor with cancellable, poll-based futures
//!
//! The usual entry points are [`Context::new`], [`Context::new_loading_set`],
//! and [`ModuleExport::builder`].

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod config;
pub mod context;
pub mod declaration;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod graph;
pub mod instance;
pub mod loading;
pub mod params;
pub mod resources;
pub mod symbols;
pub mod version;

mod registry;

pub use config::{ContextConfig, FeatureFlag, FeatureRequest, FeatureStatus, Profile};
pub use context::{Context, ROOT_INSTANCE};
pub use declaration::{
    DebugInfo, DebugInfoConstructor, DynamicExport, Linkage, Modifier, ModuleExport,
    ModuleExportBuilder, NamespaceImport, StartListener, StateConstructor, StateDestructor,
    StaticExport, StopListener, SymbolConstructor, SymbolDestructor, SymbolImport, UnloadHook,
};
pub use discovery::{register_local_export, EXPORT_ITERATOR_SYMBOL, MODULE_FILE_NAME};
pub use error::{ModuleError, ModuleResult};
pub use executor::{block_on, BlockingContext, EnqueuedFuture, EventLoop, EventLoopHandle};
pub use graph::{DependencyState, EdgeKind};
pub use instance::{ImportBinding, InstanceContext, InstanceInfo, InstanceRef};
pub use loading::{
    CommitFuture, LoadingSet, LoadingSetId, LoadingSetState, ModuleCallback,
};
pub use params::{ParamAccess, ParamType, ParamValue, ParameterDecl};
pub use resources::ResourceDecl;
pub use symbols::{SymbolName, SymbolValue, GLOBAL_NAMESPACE};
pub use version::{Version, SUBSYSTEM_VERSION};
