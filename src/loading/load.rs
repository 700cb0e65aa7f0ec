//! The per-module load sequence
//!
//! Each staged module is loaded by a state-machine future whose states
//! mirror the commit algorithm's load pass: resolve imports, construct
//! the instance state, publish static exports, construct and publish
//! dynamic exports, register the instance, fire the start event. The
//! unwind handlers release each state's acquisitions in reverse, so a
//! failure (or cancellation) at any point leaves the registry, symbol
//! index, and dependency graph exactly as before the module's load began.

use super::StagedModule;
use crate::context::ContextShared;
use crate::error::{ModuleError, ModuleResult};
use crate::executor::fsm::{State, StateMachine, Step};
use crate::graph::EdgeKind;
use crate::instance::{ConstructedExport, ImportBinding, Instance, InstanceInfo};
use crate::resources;
use crate::symbols::{SymbolEntry, SymbolValue};
use futures::future::BoxFuture;
use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::info;

pub(crate) struct LoadContext {
    shared: Arc<ContextShared>,
    record: Arc<Instance>,
    state_future: Option<BoxFuture<'static, ModuleResult<Box<dyn Any + Send>>>>,
    dynamic_future: Option<BoxFuture<'static, ModuleResult<SymbolValue>>>,
    dynamic_index: usize,
    /// Static exports published by this load
    published: Vec<(crate::symbols::SymbolName, crate::version::Version)>,
    registered: bool,
}

impl LoadContext {
    /// Acquire a static edge to `target`, holding its strong count
    fn acquire_edge(&mut self, target: &str) -> ModuleResult<()> {
        let name = self.record.name().to_string();
        if self.shared.graph().depends_on(&name, target) {
            return Ok(());
        }
        let instance = self
            .shared
            .registry()
            .get(target)
            .ok_or_else(|| ModuleError::InstanceNotFound(target.to_string()))?;
        if !instance.try_acquire_strong() {
            return Err(ModuleError::InstanceUnloaded(target.to_string()));
        }
        if let Err(error) = self.shared.graph().add_edge(&name, target, EdgeKind::Static) {
            instance.release_strong();
            return Err(error);
        }
        Ok(())
    }
}

fn resolve_imports(ctx: &mut LoadContext, _cx: &mut Context<'_>) -> ModuleResult<Step> {
    let record = ctx.record.clone();
    let name = record.name().to_string();

    for ns_import in &record.decl().namespace_imports {
        let namespace = ns_import.namespace.as_str();
        if !ctx.shared.symbols().namespace_exists(namespace) {
            return Err(ModuleError::NamespaceNotFound(namespace.to_string()));
        }
        ctx.shared
            .graph()
            .add_include(&name, namespace, EdgeKind::Static)?;
    }

    for target in record.decl().static_dependencies() {
        ctx.acquire_edge(target)?;
    }

    let mut bindings = Vec::with_capacity(record.decl().symbol_imports.len());
    for import in &record.decl().symbol_imports {
        let (version, entry) =
            ctx.shared
                .symbols()
                .lookup_visible(&import.key(), &import.version, Some(name.as_str()))?;
        ctx.acquire_edge(&entry.owner)?;
        bindings.push(ImportBinding {
            name: import.name.clone(),
            namespace: import.namespace.clone(),
            version,
            exporter: entry.owner.clone(),
            value: entry.value.clone(),
        });
    }
    record.set_imports(bindings);
    Ok(Step::Next)
}

fn unwind_imports(ctx: &mut LoadContext) {
    // The node's edge set covers both the static edges acquired here and
    // any dynamic edges the module's constructors added; every edge holds
    // one strong reference on its target.
    for (target, _kind) in ctx.shared.graph().remove_node(ctx.record.name()) {
        if let Some(instance) = ctx.shared.registry().get(&target) {
            instance.release_strong();
        }
    }
    ctx.record.set_imports(Vec::new());
}

fn construct_state(ctx: &mut LoadContext, cx: &mut Context<'_>) -> ModuleResult<Step> {
    let record = ctx.record.clone();
    if ctx.state_future.is_none() {
        match record.decl().instance_state() {
            None => return Ok(Step::Next),
            Some((constructor, _)) => {
                ctx.state_future = Some(constructor(record.context()));
            }
        }
    }
    let Some(future) = ctx.state_future.as_mut() else {
        return Ok(Step::Next);
    };
    match future.as_mut().poll(cx) {
        Poll::Pending => Ok(Step::Yield),
        Poll::Ready(Ok(state)) => {
            ctx.state_future = None;
            record.set_state(state);
            Ok(Step::Next)
        }
        Poll::Ready(Err(error)) => {
            ctx.state_future = None;
            Err(ModuleError::ConstructorFailed {
                module: record.name().to_string(),
                reason: error.to_string(),
            })
        }
    }
}

fn unwind_state(ctx: &mut LoadContext) {
    if let Some(state) = ctx.record.take_state() {
        if let Some((_, destructor)) = ctx.record.decl().instance_state() {
            destructor(state);
        }
    }
}

fn publish_static(ctx: &mut LoadContext, _cx: &mut Context<'_>) -> ModuleResult<Step> {
    let record = ctx.record.clone();
    for export in &record.decl().static_exports {
        ctx.shared.symbols().publish(
            &export.key(),
            export.version,
            SymbolEntry {
                owner: record.name().to_string(),
                linkage: export.linkage,
                value: export.value.clone(),
            },
        )?;
        ctx.published.push((export.key(), export.version));
    }
    Ok(Step::Next)
}

fn unwind_static(ctx: &mut LoadContext) {
    for (key, version) in ctx.published.drain(..) {
        ctx.shared.symbols().retract(&key, &version);
    }
}

fn construct_dynamic(ctx: &mut LoadContext, cx: &mut Context<'_>) -> ModuleResult<Step> {
    let record = ctx.record.clone();
    loop {
        if ctx.dynamic_future.is_none() {
            match record.decl().dynamic_exports.get(ctx.dynamic_index) {
                None => return Ok(Step::Next),
                Some(export) => {
                    ctx.dynamic_future = Some((export.constructor)(record.context()));
                }
            }
        }
        let Some(future) = ctx.dynamic_future.as_mut() else {
            return Ok(Step::Next);
        };
        match future.as_mut().poll(cx) {
            Poll::Pending => return Ok(Step::Yield),
            Poll::Ready(Err(error)) => {
                ctx.dynamic_future = None;
                return Err(ModuleError::ConstructorFailed {
                    module: record.name().to_string(),
                    reason: error.to_string(),
                });
            }
            Poll::Ready(Ok(value)) => {
                ctx.dynamic_future = None;
                let export = record.decl().dynamic_exports[ctx.dynamic_index].clone();
                let published = ctx.shared.symbols().publish(
                    &export.key(),
                    export.version,
                    SymbolEntry {
                        owner: record.name().to_string(),
                        linkage: export.linkage,
                        value: value.clone(),
                    },
                );
                match published {
                    Ok(()) => {
                        record.push_constructed(ConstructedExport {
                            key: export.key(),
                            version: export.version,
                            value,
                            destructor: export.destructor.clone(),
                        });
                        ctx.dynamic_index += 1;
                    }
                    Err(error) => {
                        (export.destructor)(value);
                        return Err(error);
                    }
                }
            }
        }
    }
}

fn unwind_dynamic(ctx: &mut LoadContext) {
    for export in ctx.record.take_constructed().into_iter().rev() {
        ctx.shared.symbols().retract(&export.key, &export.version);
        (export.destructor)(export.value);
    }
}

fn register(ctx: &mut LoadContext, _cx: &mut Context<'_>) -> ModuleResult<Step> {
    ctx.shared.registry().insert(ctx.record.clone())?;
    ctx.shared.graph().add_node(ctx.record.name());
    ctx.registered = true;
    Ok(Step::Next)
}

fn unwind_register(ctx: &mut LoadContext) {
    if ctx.registered {
        ctx.shared.registry().remove(ctx.record.name());
        ctx.registered = false;
    }
}

fn start_event(ctx: &mut LoadContext, _cx: &mut Context<'_>) -> ModuleResult<Step> {
    let record = ctx.record.clone();
    if let Some(listener) = record.decl().start_listener() {
        listener(&record.context())?;
    }
    Ok(Step::Finish)
}

/// Load one staged module, returning its observer on success
pub(crate) async fn load_module(
    shared: Arc<ContextShared>,
    staged: StagedModule,
) -> ModuleResult<InstanceInfo> {
    let base = staged
        .binary
        .as_ref()
        .map(|binary| binary.directory().to_path_buf())
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let resolved = resources::resolve_all(&staged.export.resources, &base)?;
    let path = staged
        .binary
        .as_ref()
        .map(|binary| binary.path().to_path_buf());

    let record = Instance::new(
        staged.export.clone(),
        path,
        staged.binary.clone(),
        resolved,
        &shared,
    );
    if shared.feature_enabled("debug-info") {
        if let Some(constructor) = record.decl().debug_info() {
            record.set_debug_info(constructor());
        }
    }

    let machine = StateMachine::new(
        LoadContext {
            shared,
            record,
            state_future: None,
            dynamic_future: None,
            dynamic_index: 0,
            published: Vec::new(),
            registered: false,
        },
        vec![
            State::with_unwind(resolve_imports, unwind_imports),
            State::with_unwind(construct_state, unwind_state),
            State::with_unwind(publish_static, unwind_static),
            State::with_unwind(construct_dynamic, unwind_dynamic),
            State::with_unwind(register, unwind_register),
            State::new(start_event),
        ],
    );

    let ctx = machine.await?;
    info!("module {} loaded", ctx.record.name());
    Ok(ctx.record.info())
}
