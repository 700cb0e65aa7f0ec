//! Error types for the module subsystem

use thiserror::Error;

/// Result type for module subsystem operations
pub type ModuleResult<T> = Result<T, ModuleError>;

/// Comprehensive error types for the module subsystem
///
/// Failures are discriminated kinds rather than opaque strings so that the
/// commit engine can decide per kind whether a failure is fatal to a single
/// module, cascades to its dependents, or fails the whole commit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    /// A staged module's name collides with a loaded instance or another staged module
    #[error("Duplicate module name: {0}")]
    DuplicateName(String),

    /// An export collides with a live or staged symbol under the same key
    #[error("Duplicate symbol {name}@{version} in namespace '{namespace}'")]
    DuplicateSymbol {
        name: String,
        namespace: String,
        version: String,
    },

    /// No current or staged export satisfies an import
    #[error("Unknown symbol {name}@{version} in namespace '{namespace}'")]
    UnknownSymbol {
        name: String,
        namespace: String,
        version: String,
    },

    /// The staged modules of a commit form a dependency cycle
    #[error("Dependency cycle among staged modules: {0:?}")]
    StagedDependencyCycle(Vec<String>),

    /// Adding the dependency would create a cycle in the live graph
    #[error("Dependency cycle: {from} -> {to} would close a cycle")]
    DependencyCycle { from: String, to: String },

    /// Parameter access group check failed
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// An instance-state or dynamic-export constructor returned an error
    #[error("Constructor failed for module {module}: {reason}")]
    ConstructorFailed { module: String, reason: String },

    /// An exported version does not satisfy the requested version
    #[error("Version mismatch for {name}: exported {exported}, requested {requested}")]
    VersionMismatch {
        name: String,
        exported: String,
        requested: String,
    },

    /// Strong reference acquisition on an instance that is already unloaded
    #[error("Instance {0} is unloaded")]
    InstanceUnloaded(String),

    /// A declaration carries a modifier the subsystem does not recognize
    #[error("Invalid modifier '{key}' in module {module}")]
    InvalidModifier { module: String, key: String },

    /// A second event loop was started while one is running in this process
    #[error("An event loop is already running in this process")]
    EventLoopAlreadyRunning,

    /// Operation submitted after the event loop was signalled to stop
    #[error("The event loop has shut down")]
    EventLoopShutDown,

    /// The executor thread could not be spawned
    #[error("Failed to start the event loop thread: {0}")]
    EventLoopStart(String),

    /// Mutation of a loading set that reached a terminal state
    #[error("Loading set is {0} and no longer accepts operations")]
    LoadingSetClosed(String),

    /// Lookup of an instance name that is not in the registry
    #[error("Instance {0} not found")]
    InstanceNotFound(String),

    /// Lookup of a namespace with no live exports
    #[error("Namespace '{0}' not found")]
    NamespaceNotFound(String),

    /// Symbol access without an include of the symbol's namespace
    #[error("Namespace '{0}' is not included by the calling instance")]
    NamespaceNotIncluded(String),

    /// Dependency edge query/removal for an edge that does not exist
    #[error("No dependency from {from} to {to}")]
    DependencyNotFound { from: String, to: String },

    /// Attempt to remove a static dependency or namespace include
    #[error("Dependency from {from} to {to} is static and cannot be removed")]
    StaticDependency { from: String, to: String },

    /// Dependency edge that already exists
    #[error("Dependency from {from} to {to} already exists")]
    DuplicateDependency { from: String, to: String },

    /// Parameter lookup failed
    #[error("Parameter '{param}' not found on module {module}")]
    ParameterNotFound { module: String, param: String },

    /// Parameter read/write with the wrong type tag
    #[error("Parameter '{param}' is {expected}, not {requested}")]
    ParameterTypeMismatch {
        param: String,
        expected: String,
        requested: String,
    },

    /// Resource path is absolute or otherwise malformed
    #[error("Invalid resource path '{0}': paths must be relative")]
    InvalidResourcePath(String),

    /// Declaration was built against an incompatible subsystem version
    #[error("Module {module} targets subsystem {declared}, this build is {current}")]
    SubsystemVersionMismatch {
        module: String,
        declared: String,
        current: String,
    },

    /// Opening a module binary or resolving its export iterator failed
    #[error("Failed to load module binary {path}: {reason}")]
    BinaryLoad { path: String, reason: String },

    /// Required feature cannot be enabled by this build
    #[error("Required feature '{0}' is not supported")]
    UnsupportedFeature(String),

    /// Commit future was dropped before the commit ran to completion
    #[error("Operation aborted")]
    Aborted,

    /// Version string could not be parsed
    #[error("Invalid version string '{0}'")]
    InvalidVersion(String),

    /// Declaration is structurally malformed
    #[error("Invalid declaration: {0}")]
    InvalidDeclaration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_is_stable() {
        let err = ModuleError::DuplicateSymbol {
            name: "draw".to_string(),
            namespace: "gfx".to_string(),
            version: "1.2.0".to_string(),
        };
        assert_eq!(err.to_string(), "Duplicate symbol draw@1.2.0 in namespace 'gfx'");

        let err = ModuleError::LoadingSetClosed("committed".to_string());
        assert!(err.to_string().contains("committed"));
    }
}
