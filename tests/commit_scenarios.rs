//! End-to-end commit scenarios through the public API
//!
//! One event loop may run per process, so every test serializes on a
//! file-local mutex and shuts its context down before releasing it.

use modulith::{
    block_on, Context, LoadingSetState, ModuleCallback, ModuleError, ModuleExport, Version,
};
use parking_lot::Mutex;
use std::sync::Arc;

static SERIAL: Mutex<()> = Mutex::new(());

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Module exporting one global symbol
fn provider(name: &str, symbol: &str) -> ModuleExport {
    ModuleExport::builder(name)
        .export(symbol, Version::new(1, 0, 0), Arc::new(symbol.len() as u32))
        .build()
}

/// Module importing one global symbol and exporting another
fn link(name: &str, import: &str, export: &str) -> ModuleExport {
    ModuleExport::builder(name)
        .import(import, Version::new(1, 0, 0))
        .export(export, Version::new(1, 0, 0), Arc::new(0u32))
        .build()
}

/// Module importing one global symbol
fn consumer(name: &str, import: &str) -> ModuleExport {
    ModuleExport::builder(name)
        .import(import, Version::new(1, 0, 0))
        .build()
}

#[test]
fn linear_chain_loads_in_dependency_order() {
    let _serial = SERIAL.lock();
    init_tracing();
    let ctx = Context::with_defaults().unwrap();
    let set = ctx.new_loading_set();

    // Stage in reverse to prove the commit reorders topologically.
    set.add_module(None, consumer("c", "b")).unwrap();
    set.add_module(None, link("b", "a", "b")).unwrap();
    set.add_module(None, provider("a", "a")).unwrap();

    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let failures: Arc<Mutex<Vec<ModuleError>>> = Arc::new(Mutex::new(Vec::new()));
    for module in ["a", "b", "c"] {
        let order = order.clone();
        let failures = failures.clone();
        set.add_callback(
            module,
            ModuleCallback::new()
                .on_success(move |info| order.lock().push(info.name().to_string()))
                .on_error(move |error| failures.lock().push(error.clone())),
        )
        .unwrap();
    }

    let commit = set.commit().unwrap();
    block_on(commit).unwrap();

    assert!(failures.lock().is_empty());
    assert_eq!(*order.lock(), ["a", "b", "c"]);
    assert_eq!(set.state(), LoadingSetState::Committed);

    // a is held by its self reference plus b's import edge.
    assert_eq!(ctx.find_instance("a").unwrap().strong_count(), 2);
    assert_eq!(ctx.find_instance("b").unwrap().strong_count(), 2);
    assert_eq!(ctx.find_instance("c").unwrap().strong_count(), 1);

    // Releasing a's self reference keeps it loaded through b's edge.
    ctx.mark_unloadable("a").unwrap();
    ctx.drain();
    assert!(ctx.find_instance("a").unwrap().is_loaded());
    assert_eq!(ctx.find_instance("a").unwrap().strong_count(), 1);

    // Unloading the chain cascades the prunes and empties the registry.
    ctx.mark_unloadable("c").unwrap();
    ctx.mark_unloadable("b").unwrap();
    ctx.drain();
    assert!(ctx.find_instance("a").is_err());
    assert!(ctx.find_instance("b").is_err());
    assert!(ctx.find_instance("c").is_err());

    drop(set);
    ctx.shutdown();
}

#[test]
fn missing_symbol_cascades_and_commit_resolves_ok() {
    let _serial = SERIAL.lock();
    init_tracing();
    let ctx = Context::with_defaults().unwrap();
    let set = ctx.new_loading_set();

    // b imports x, which nobody provides; c depends on b; d is unrelated.
    set.add_module(None, link("b", "x", "b")).unwrap();
    set.add_module(None, consumer("c", "b")).unwrap();
    set.add_module(None, provider("d", "d")).unwrap();

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    for module in ["b", "c", "d"] {
        let ok_events = events.clone();
        let err_events = events.clone();
        let name = module.to_string();
        let err_name = module.to_string();
        set.add_callback(
            module,
            ModuleCallback::new()
                .on_success(move |_| ok_events.lock().push(format!("ok:{}", name)))
                .on_error(move |error| {
                    assert!(matches!(error, ModuleError::UnknownSymbol { .. }));
                    err_events.lock().push(format!("err:{}", err_name));
                }),
        )
        .unwrap();
    }

    let commit = set.commit().unwrap();
    // Per-module failures do not fail the commit.
    block_on(commit).unwrap();

    let events = events.lock().clone();
    assert!(events.contains(&"err:b".to_string()));
    assert!(events.contains(&"err:c".to_string()));
    assert!(events.contains(&"ok:d".to_string()));
    // Error callbacks fire during resolution, before any success.
    let ok_pos = events.iter().position(|e| e == "ok:d").unwrap();
    assert!(events.iter().position(|e| e == "err:b").unwrap() < ok_pos);
    assert!(events.iter().position(|e| e == "err:c").unwrap() < ok_pos);

    assert!(ctx.find_instance("b").is_err());
    assert!(ctx.find_instance("c").is_err());
    assert!(ctx.find_instance("d").is_ok());

    drop(set);
    ctx.shutdown();
}

#[test]
fn duplicate_symbol_loads_exactly_one_module() {
    let _serial = SERIAL.lock();
    init_tracing();
    let ctx = Context::with_defaults().unwrap();
    let set = ctx.new_loading_set();

    set.add_module(None, provider("first", "shared")).unwrap();
    set.add_module(None, provider("second", "shared")).unwrap();

    let errors: Arc<Mutex<Vec<ModuleError>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    set.add_callback(
        "second",
        ModuleCallback::new().on_error(move |error| sink.lock().push(error.clone())),
    )
    .unwrap();

    block_on(set.commit().unwrap()).unwrap();

    assert!(ctx.find_instance("first").is_ok());
    assert!(ctx.find_instance("second").is_err());
    assert!(matches!(
        errors.lock().first(),
        Some(ModuleError::DuplicateSymbol { .. })
    ));

    drop(set);
    ctx.shutdown();
}

#[test]
fn staged_cycle_fails_the_whole_commit() {
    let _serial = SERIAL.lock();
    init_tracing();
    let ctx = Context::with_defaults().unwrap();
    let set = ctx.new_loading_set();

    set.add_module(None, link("a", "b", "a")).unwrap();
    set.add_module(None, link("b", "a", "b")).unwrap();

    let errors: Arc<Mutex<Vec<ModuleError>>> = Arc::new(Mutex::new(Vec::new()));
    for module in ["a", "b"] {
        let sink = errors.clone();
        set.add_callback(
            module,
            ModuleCallback::new().on_error(move |error| sink.lock().push(error.clone())),
        )
        .unwrap();
    }

    let result = block_on(set.commit().unwrap());
    assert!(matches!(
        result,
        Err(ModuleError::StagedDependencyCycle(_))
    ));
    assert_eq!(set.state(), LoadingSetState::Failed);
    assert_eq!(errors.lock().len(), 2);
    assert!(ctx.find_instance("a").is_err());
    assert!(ctx.find_instance("b").is_err());

    drop(set);
    ctx.shutdown();
}

#[test]
fn concurrent_commits_observe_exactly_one_ordering() {
    let _serial = SERIAL.lock();
    init_tracing();
    let ctx = Context::with_defaults().unwrap();

    let set1 = ctx.new_loading_set();
    set1.add_module(None, provider("m1", "s1")).unwrap();

    let set2 = ctx.new_loading_set();
    set2.add_module(None, consumer("m2", "s1")).unwrap();
    let m2_errored = Arc::new(Mutex::new(false));
    let sink = m2_errored.clone();
    set2.add_callback(
        "m2",
        ModuleCallback::new().on_error(move |error| {
            assert!(matches!(error, ModuleError::UnknownSymbol { .. }));
            *sink.lock() = true;
        }),
    )
    .unwrap();

    let commit1 = set1.commit().unwrap();
    let commit2 = set2.commit().unwrap();
    block_on(commit1).unwrap();
    block_on(commit2).unwrap();

    // m1 loads under either serialization order; m2 either loaded after
    // m1 or was skipped with unknown-symbol, never both or neither.
    assert!(ctx.find_instance("m1").is_ok());
    let m2_loaded = ctx.find_instance("m2").is_ok();
    assert_ne!(m2_loaded, *m2_errored.lock());

    drop(set1);
    drop(set2);
    ctx.shutdown();
}

#[test]
fn dropping_the_commit_future_aborts_the_set() {
    let _serial = SERIAL.lock();
    init_tracing();
    let ctx = Context::with_defaults().unwrap();
    let set = ctx.new_loading_set();
    set.add_module(None, provider("m", "s")).unwrap();

    let outcomes: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let ok_sink = outcomes.clone();
    let err_sink = outcomes.clone();
    let abort_sink = outcomes.clone();
    set.add_callback(
        "m",
        ModuleCallback::new()
            .on_success(move |_| ok_sink.lock().push("success"))
            .on_error(move |_| err_sink.lock().push("error"))
            .on_abort(move || abort_sink.lock().push("abort")),
    )
    .unwrap();

    // Hold the executor on a gate so the commit cannot run before the
    // future is dropped.
    let gate = Arc::new(Mutex::new(()));
    let held = gate.lock();
    let gate_in_task = gate.clone();
    let blocker = ctx
        .executor()
        .enqueue(async move {
            let _open = gate_in_task.lock();
        })
        .unwrap();

    let commit = set.commit().unwrap();
    drop(commit);
    drop(held);
    block_on(blocker);
    ctx.drain();

    assert_eq!(*outcomes.lock(), vec!["abort"]);
    assert_eq!(set.state(), LoadingSetState::Dismissed);
    assert!(ctx.find_instance("m").is_err());

    drop(set);
    ctx.shutdown();
}

#[test]
fn dismissed_set_rejects_further_staging() {
    let _serial = SERIAL.lock();
    init_tracing();
    let ctx = Context::with_defaults().unwrap();
    let set = ctx.new_loading_set();
    set.add_module(None, provider("m", "s")).unwrap();

    set.dismiss().unwrap();
    assert_eq!(set.state(), LoadingSetState::Dismissed);
    assert!(matches!(
        set.add_module(None, provider("n", "t")),
        Err(ModuleError::LoadingSetClosed(_))
    ));
    let result = block_on(set.commit().unwrap());
    assert!(matches!(result, Err(ModuleError::LoadingSetClosed(_))));

    drop(set);
    ctx.shutdown();
}

#[test]
fn staged_queries_see_modules_and_symbols() {
    let _serial = SERIAL.lock();
    init_tracing();
    let ctx = Context::with_defaults().unwrap();
    let set = ctx.new_loading_set();
    set.add_module(
        None,
        ModuleExport::builder("gfx")
            .export_in("gfx", "draw", Version::new(1, 2, 0), Arc::new(0u32))
            .build(),
    )
    .unwrap();

    assert!(set.query_module("gfx"));
    assert!(!set.query_module("missing"));
    assert!(set.query_symbol("gfx", "draw", &Version::new(1, 0, 0)));
    assert!(!set.query_symbol("gfx", "draw", &Version::new(2, 0, 0)));
    assert!(!set.query_symbol("gfx", "blit", &Version::new(1, 0, 0)));

    drop(set);
    ctx.shutdown();
}

#[test]
fn directory_without_module_binary_fails_discovery() {
    let _serial = SERIAL.lock();
    init_tracing();
    let ctx = Context::with_defaults().unwrap();
    let set = ctx.new_loading_set();

    let dir = tempfile::tempdir().unwrap();
    let err = set.add_modules_from_path(dir.path(), |_| true).unwrap_err();
    assert!(matches!(err, ModuleError::BinaryLoad { .. }));

    drop(set);
    ctx.shutdown();
}

#[test]
fn locally_registered_modules_are_discoverable() {
    let _serial = SERIAL.lock();
    init_tracing();

    fn local_iterator() -> Vec<ModuleExport> {
        vec![ModuleExport::builder("local-widget")
            .export("widget", Version::new(1, 0, 0), Arc::new(7u32))
            .build()]
    }
    modulith::register_local_export(local_iterator);

    let ctx = Context::with_defaults().unwrap();
    let set = ctx.new_loading_set();
    let staged = set
        .add_modules_from_local(|export| export.name == "local-widget")
        .unwrap();
    assert_eq!(staged, 1);

    block_on(set.commit().unwrap()).unwrap();
    assert!(ctx.find_instance("local-widget").is_ok());
    assert!(ctx
        .find_instance_by_symbol("", "widget", Version::new(1, 0, 0))
        .is_ok());

    drop(set);
    ctx.shutdown();
}
