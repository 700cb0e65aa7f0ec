//! Module discovery
//!
//! A module binary advertises its declarations through a well-known
//! iterator symbol; how a platform arranges the declarations behind that
//! symbol (linker sections, static tables) is the binary's business. The
//! loader only ever calls the iterator. For the current process binary a
//! registration list stands in for the symbol, fed by
//! [`register_local_export`].

use crate::declaration::ModuleExport;
use crate::error::{ModuleError, ModuleResult};
use libloading::Library;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the export iterator a module binary must expose
pub const EXPORT_ITERATOR_SYMBOL: &[u8] = b"modulith_export_iterator";

/// File name probed when a directory is given to `add_modules_from_path`
pub const MODULE_FILE_NAME: &str = "module.fimo_module";

/// Signature of the export iterator
pub type ExportIterator = fn() -> Vec<ModuleExport>;

static LOCAL_EXPORTS: RwLock<Vec<ExportIterator>> = RwLock::new(Vec::new());

/// Register an export iterator for the current process binary
///
/// Declarations returned by `iterator` become visible to
/// `LoadingSet::add_modules_from_local`.
pub fn register_local_export(iterator: ExportIterator) {
    LOCAL_EXPORTS.write().push(iterator);
}

/// Collect the declarations registered in the current binary
pub(crate) fn local_exports() -> Vec<ModuleExport> {
    LOCAL_EXPORTS
        .read()
        .iter()
        .flat_map(|iterator| iterator())
        .collect()
}

/// An opened module binary
///
/// Instances loaded from the binary keep it alive through an `Arc`, so
/// the mapping cannot be unloaded while any of its code is reachable.
pub struct ModuleBinary {
    path: PathBuf,
    directory: PathBuf,
    _library: Library,
}

impl ModuleBinary {
    /// Open `path` and iterate its module declarations
    ///
    /// A directory is resolved to the `module.fimo_module` file inside
    /// it. A binary that exposes no iterator symbol is valid and yields
    /// no modules.
    pub(crate) fn open(path: &Path) -> ModuleResult<(std::sync::Arc<Self>, Vec<ModuleExport>)> {
        let binary_path = if path.is_dir() {
            path.join(MODULE_FILE_NAME)
        } else {
            path.to_path_buf()
        };
        let directory = binary_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let library = unsafe { Library::new(&binary_path) }.map_err(|e| ModuleError::BinaryLoad {
            path: binary_path.display().to_string(),
            reason: e.to_string(),
        })?;

        let exports = unsafe {
            match library.get::<ExportIterator>(EXPORT_ITERATOR_SYMBOL) {
                Ok(iterator) => iterator(),
                Err(_) => Vec::new(),
            }
        };
        debug!(
            "binary {} declares {} modules",
            binary_path.display(),
            exports.len()
        );

        let binary = std::sync::Arc::new(Self {
            path: binary_path,
            directory,
            _library: library,
        });
        Ok((binary, exports))
    }

    /// Path of the opened binary
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory resource paths resolve against
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl std::fmt::Debug for ModuleBinary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleBinary")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_reports_load_error() {
        let err = ModuleBinary::open(Path::new("/nonexistent/libmissing.so")).unwrap_err();
        assert!(matches!(err, ModuleError::BinaryLoad { .. }));
    }

    #[test]
    fn local_registration_is_iterated() {
        fn iterator() -> Vec<ModuleExport> {
            vec![ModuleExport::builder("discovery-test-module").build()]
        }
        register_local_export(iterator);
        let names: Vec<String> = local_exports().into_iter().map(|e| e.name).collect();
        assert!(names.contains(&"discovery-test-module".to_string()));
    }
}
