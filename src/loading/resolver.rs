//! Commit resolution: validation, satisfiability, and ordering
//!
//! Runs over the staged declarations of one loading set before any module
//! is loaded. Per-module failures (duplicate names, duplicate symbols,
//! unsatisfiable imports) skip the offending module and cascade to its
//! staged dependents; only a dependency cycle among the staged modules
//! fails the whole commit.

use super::StagedModule;
use crate::error::{ModuleError, ModuleResult};
use crate::registry::InstanceRegistry;
use crate::symbols::{SymbolIndex, SymbolName, GLOBAL_NAMESPACE};
use crate::version::Version;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Output of the resolution passes
#[derive(Debug)]
pub(crate) struct ResolvedPlan {
    /// Indexes into the staged list, in load order
    pub order: Vec<usize>,
    /// Per staged index: staged modules it imports from
    pub staged_deps: Vec<HashSet<usize>>,
    /// Modules rejected before loading, with their failure
    pub skipped: BTreeMap<usize, ModuleError>,
    /// Whether any rejection was a name collision with the live registry
    pub registry_conflicts: bool,
}

/// Run validation, resolution, and ordering over `staged`
pub(crate) fn resolve(
    symbols: &SymbolIndex,
    registry: &InstanceRegistry,
    staged: &[StagedModule],
) -> ModuleResult<ResolvedPlan> {
    let mut skipped: BTreeMap<usize, ModuleError> = BTreeMap::new();
    let mut registry_conflicts = false;

    // Validation pass: declaration shape.
    for (index, module) in staged.iter().enumerate() {
        if let Err(error) = module.export.validate() {
            skipped.insert(index, error);
        }
    }

    // Validation pass: duplicate names, among the staged modules and
    // against the registry.
    let mut name_count: HashMap<&str, usize> = HashMap::new();
    for module in staged {
        *name_count.entry(module.export.name.as_str()).or_insert(0) += 1;
    }
    for (index, module) in staged.iter().enumerate() {
        if skipped.contains_key(&index) {
            continue;
        }
        let name = module.export.name.as_str();
        if name_count[name] > 1 {
            skipped.insert(index, ModuleError::DuplicateName(name.to_string()));
        } else if registry.contains(name) {
            registry_conflicts = true;
            skipped.insert(index, ModuleError::DuplicateName(name.to_string()));
        }
    }

    // Validation pass: duplicate export keys. Earlier staged modules win;
    // the live index always wins.
    let mut staged_keys: HashSet<(SymbolName, Version)> = HashSet::new();
    for (index, module) in staged.iter().enumerate() {
        if skipped.contains_key(&index) {
            continue;
        }
        let keys = module.export.export_keys();
        let mut own: HashSet<(SymbolName, Version)> = HashSet::new();
        let mut conflict = None;
        for (key, version) in &keys {
            let live_conflict = symbols.contains_exact(key, version);
            if live_conflict || staged_keys.contains(&(key.clone(), *version)) || !own.insert((key.clone(), *version)) {
                conflict = Some(ModuleError::DuplicateSymbol {
                    name: key.name.clone(),
                    namespace: key.namespace.clone(),
                    version: version.to_string(),
                });
                break;
            }
        }
        match conflict {
            Some(error) => {
                skipped.insert(index, error);
            }
            None => staged_keys.extend(own),
        }
    }

    // Resolution pass: iterate to a fixpoint, removing modules whose
    // imports no surviving provider satisfies and cascading the removal.
    let mut staged_deps: Vec<HashSet<usize>> = vec![HashSet::new(); staged.len()];
    loop {
        let surviving: Vec<usize> = (0..staged.len())
            .filter(|index| !skipped.contains_key(index))
            .collect();

        let mut removed_any = false;
        for &index in &surviving {
            let module = &staged[index];
            let mut deps: HashSet<usize> = HashSet::new();
            let mut failure: Option<ModuleError> = None;

            for import in &module.export.symbol_imports {
                match find_provider(symbols, staged, &skipped, index, import.key(), import.version)
                {
                    Provider::Live => {}
                    Provider::Staged(provider) => {
                        deps.insert(provider);
                    }
                    Provider::Missing => {
                        failure = Some(ModuleError::UnknownSymbol {
                            name: import.name.clone(),
                            namespace: import.namespace.clone(),
                            version: import.version.to_string(),
                        });
                        break;
                    }
                }
            }

            if failure.is_none() {
                for ns_import in &module.export.namespace_imports {
                    let namespace = ns_import.namespace.as_str();
                    if namespace == GLOBAL_NAMESPACE || symbols.namespace_exists(namespace) {
                        continue;
                    }
                    // The namespace only exists once a staged exporter
                    // loads, so the importer must order after every one
                    // of them.
                    let providers: Vec<usize> = staged
                        .iter()
                        .enumerate()
                        .filter(|(provider, candidate)| {
                            *provider != index
                                && !skipped.contains_key(provider)
                                && candidate
                                    .export
                                    .export_keys()
                                    .iter()
                                    .any(|(key, _)| key.namespace == namespace)
                        })
                        .map(|(provider, _)| provider)
                        .collect();
                    if providers.is_empty() {
                        failure = Some(ModuleError::NamespaceNotFound(namespace.to_string()));
                        break;
                    }
                    deps.extend(providers);
                }
            }

            if failure.is_none() {
                for target in module.export.static_dependencies() {
                    if registry.contains(target) {
                        continue;
                    }
                    match staged_index_of(staged, &skipped, target) {
                        Some(provider) if provider != index => {
                            deps.insert(provider);
                        }
                        _ => {
                            failure = Some(ModuleError::InstanceNotFound(target.to_string()));
                            break;
                        }
                    }
                }
            }

            match failure {
                Some(error) => {
                    skipped.insert(index, error);
                    removed_any = true;
                }
                None => staged_deps[index] = deps,
            }
        }
        if !removed_any {
            break;
        }
    }

    // Ordering pass: Kahn's algorithm over the surviving staged modules.
    let surviving: Vec<usize> = (0..staged.len())
        .filter(|index| !skipped.contains_key(index))
        .collect();
    let mut indegree: HashMap<usize, usize> = surviving.iter().map(|&i| (i, 0)).collect();
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    for &index in &surviving {
        for &dep in &staged_deps[index] {
            *indegree.entry(index).or_insert(0) += 1;
            dependents.entry(dep).or_default().push(index);
        }
    }

    let mut queue: VecDeque<usize> = surviving
        .iter()
        .copied()
        .filter(|index| indegree[index] == 0)
        .collect();
    let mut order = Vec::with_capacity(surviving.len());
    while let Some(index) = queue.pop_front() {
        order.push(index);
        if let Some(deps) = dependents.get(&index) {
            for &dependent in deps {
                if let Some(remaining) = indegree.get_mut(&dependent) {
                    *remaining -= 1;
                    if *remaining == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }
    }

    if order.len() != surviving.len() {
        let ordered: HashSet<usize> = order.iter().copied().collect();
        let cycle: Vec<String> = surviving
            .iter()
            .filter(|&&index| !ordered.contains(&index))
            .map(|&index| staged[index].export.name.clone())
            .collect();
        return Err(ModuleError::StagedDependencyCycle(cycle));
    }

    Ok(ResolvedPlan {
        order,
        staged_deps,
        skipped,
        registry_conflicts,
    })
}

enum Provider {
    /// Satisfied by an already-loaded instance
    Live,
    /// Satisfied by the staged module at this index
    Staged(usize),
    /// No current or staged export matches
    Missing,
}

/// Find the provider of one import; the live index takes precedence
fn find_provider(
    symbols: &SymbolIndex,
    staged: &[StagedModule],
    skipped: &BTreeMap<usize, ModuleError>,
    importer: usize,
    key: SymbolName,
    min_version: Version,
) -> Provider {
    if symbols.lookup_visible(&key, &min_version, None).is_ok() {
        return Provider::Live;
    }
    for (index, module) in staged.iter().enumerate() {
        if index == importer || skipped.contains_key(&index) {
            continue;
        }
        let provides = module
            .export
            .provider_keys()
            .into_iter()
            .any(|(export_key, version)| {
                export_key == key && version.is_compatible_with(&min_version)
            });
        if provides {
            return Provider::Staged(index);
        }
    }
    Provider::Missing
}

fn staged_index_of(
    staged: &[StagedModule],
    skipped: &BTreeMap<usize, ModuleError>,
    name: &str,
) -> Option<usize> {
    staged
        .iter()
        .enumerate()
        .find(|(index, module)| !skipped.contains_key(index) && module.export.name == name)
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::ModuleExport;
    use crate::version::Version;
    use std::sync::Arc;

    fn stage(export: ModuleExport) -> StagedModule {
        StagedModule {
            export,
            owner: None,
            binary: None,
        }
    }

    fn chain() -> Vec<StagedModule> {
        vec![
            stage(
                ModuleExport::builder("a")
                    .export("a", Version::new(1, 0, 0), Arc::new(()))
                    .build(),
            ),
            stage(
                ModuleExport::builder("b")
                    .import("a", Version::new(1, 0, 0))
                    .export("b", Version::new(1, 0, 0), Arc::new(()))
                    .build(),
            ),
            stage(
                ModuleExport::builder("c")
                    .import("b", Version::new(1, 0, 0))
                    .build(),
            ),
        ]
    }

    #[test]
    fn linear_chain_orders_topologically() {
        let symbols = SymbolIndex::new();
        let registry = InstanceRegistry::new();
        let plan = resolve(&symbols, &registry, &chain()).unwrap();

        assert!(plan.skipped.is_empty());
        assert_eq!(plan.order, vec![0, 1, 2]);
    }

    #[test]
    fn missing_import_cascades_to_dependents() {
        let symbols = SymbolIndex::new();
        let registry = InstanceRegistry::new();
        // b imports x (nobody provides it), c imports b.
        let staged = vec![
            stage(
                ModuleExport::builder("b")
                    .import("x", Version::new(1, 0, 0))
                    .export("b", Version::new(1, 0, 0), Arc::new(()))
                    .build(),
            ),
            stage(
                ModuleExport::builder("c")
                    .import("b", Version::new(1, 0, 0))
                    .build(),
            ),
        ];
        let plan = resolve(&symbols, &registry, &staged).unwrap();

        assert!(plan.order.is_empty());
        assert!(matches!(
            plan.skipped.get(&0),
            Some(ModuleError::UnknownSymbol { name, .. }) if name == "x"
        ));
        assert!(matches!(
            plan.skipped.get(&1),
            Some(ModuleError::UnknownSymbol { name, .. }) if name == "b"
        ));
    }

    #[test]
    fn duplicate_staged_names_skip_both() {
        let symbols = SymbolIndex::new();
        let registry = InstanceRegistry::new();
        let staged = vec![
            stage(ModuleExport::builder("dup").build()),
            stage(ModuleExport::builder("dup").build()),
            stage(ModuleExport::builder("ok").build()),
        ];
        let plan = resolve(&symbols, &registry, &staged).unwrap();

        assert_eq!(plan.order, vec![2]);
        assert!(matches!(
            plan.skipped.get(&0),
            Some(ModuleError::DuplicateName(_))
        ));
        assert!(matches!(
            plan.skipped.get(&1),
            Some(ModuleError::DuplicateName(_))
        ));
    }

    #[test]
    fn duplicate_staged_symbol_keeps_first() {
        let symbols = SymbolIndex::new();
        let registry = InstanceRegistry::new();
        let staged = vec![
            stage(
                ModuleExport::builder("first")
                    .export("shared", Version::new(1, 0, 0), Arc::new(()))
                    .build(),
            ),
            stage(
                ModuleExport::builder("second")
                    .export("shared", Version::new(1, 0, 0), Arc::new(()))
                    .build(),
            ),
        ];
        let plan = resolve(&symbols, &registry, &staged).unwrap();

        assert_eq!(plan.order, vec![0]);
        assert!(matches!(
            plan.skipped.get(&1),
            Some(ModuleError::DuplicateSymbol { .. })
        ));
    }

    #[test]
    fn staged_cycle_fails_the_commit() {
        let symbols = SymbolIndex::new();
        let registry = InstanceRegistry::new();
        let staged = vec![
            stage(
                ModuleExport::builder("a")
                    .import("b", Version::new(1, 0, 0))
                    .export("a", Version::new(1, 0, 0), Arc::new(()))
                    .build(),
            ),
            stage(
                ModuleExport::builder("b")
                    .import("a", Version::new(1, 0, 0))
                    .export("b", Version::new(1, 0, 0), Arc::new(()))
                    .build(),
            ),
        ];
        let err = resolve(&symbols, &registry, &staged).unwrap_err();
        assert!(matches!(err, ModuleError::StagedDependencyCycle(_)));
    }

    #[test]
    fn namespace_importer_orders_after_its_provider() {
        let symbols = SymbolIndex::new();
        let registry = InstanceRegistry::new();
        // The importer is staged first but must load second.
        let staged = vec![
            stage(ModuleExport::builder("viewer").import_namespace("gfx").build()),
            stage(
                ModuleExport::builder("gfx-core")
                    .export_in("gfx", "draw", Version::new(1, 0, 0), Arc::new(()))
                    .build(),
            ),
        ];
        let plan = resolve(&symbols, &registry, &staged).unwrap();
        assert_eq!(plan.order, vec![1, 0]);

        // With no provider at all the importer is skipped.
        let staged = vec![stage(
            ModuleExport::builder("viewer").import_namespace("gfx").build(),
        )];
        let plan = resolve(&symbols, &registry, &staged).unwrap();
        assert!(matches!(
            plan.skipped.get(&0),
            Some(ModuleError::NamespaceNotFound(_))
        ));
    }

    #[test]
    fn unknown_modifier_rejects_the_module() {
        let symbols = SymbolIndex::new();
        let registry = InstanceRegistry::new();
        let staged = vec![stage(
            ModuleExport::builder("weird")
                .modifier(crate::declaration::Modifier::Unknown {
                    key: "hologram".to_string(),
                })
                .build(),
        )];
        let plan = resolve(&symbols, &registry, &staged).unwrap();
        assert!(matches!(
            plan.skipped.get(&0),
            Some(ModuleError::InvalidModifier { .. })
        ));
    }
}
