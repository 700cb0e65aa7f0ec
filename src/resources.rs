//! Module resource paths
//!
//! A resource is a relative UTF-8 path resolved against the directory of
//! the module's binary at load time.

use crate::error::{ModuleError, ModuleResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Resource declaration carried by a module export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// Relative path, e.g. `assets/shaders`
    pub path: String,
}

impl ResourceDecl {
    /// Convenience constructor
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Reject absolute paths
    pub(crate) fn validate(&self) -> ModuleResult<()> {
        if self.path.starts_with('/') || Path::new(&self.path).is_absolute() {
            return Err(ModuleError::InvalidResourcePath(self.path.clone()));
        }
        Ok(())
    }

    /// Resolve against the owning binary's directory
    pub(crate) fn resolve(&self, base: &Path) -> PathBuf {
        base.join(&self.path)
    }
}

/// Resolve all declared resources of a module
pub(crate) fn resolve_all(decls: &[ResourceDecl], base: &Path) -> ModuleResult<Vec<PathBuf>> {
    let mut resolved = Vec::with_capacity(decls.len());
    for decl in decls {
        decl.validate()?;
        resolved.push(decl.resolve(base));
    }
    Ok(resolved)
}
