//! Scene-level tests driving the public API end to end

use super::*;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;
use crate::prelude::{PropValue, PropertyDecl, SchemaDecl, Vec3};

type Log = Arc<Mutex<Vec<String>>>;

/// Behavior that records every hook as `attr_name:hook`
struct Logger {
    log: Log,
    ticks: bool,
}

impl Logger {
    fn push(&self, ctx: &HookContext<'_>, hook: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}", ctx.attr_name(), hook));
    }
}

impl Behavior for Logger {
    fn init(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        self.push(ctx, "init");
        Ok(())
    }

    fn update(&mut self, ctx: &mut HookContext<'_>, _old: &PropValue) -> HookResult {
        self.push(ctx, "update");
        Ok(())
    }

    fn remove(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        self.push(ctx, "remove");
        Ok(())
    }

    fn play(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        self.push(ctx, "play");
        Ok(())
    }

    fn pause(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        self.push(ctx, "pause");
        Ok(())
    }

    fn tick(&mut self, ctx: &mut HookContext<'_>, _time: f64, delta: f64) -> HookResult {
        self.push(ctx, &format!("tick:{}", delta));
        Ok(())
    }

    fn tock(
        &mut self,
        ctx: &mut HookContext<'_>,
        _time: f64,
        _delta: f64,
        _camera: Option<ObjectHandle>,
    ) -> HookResult {
        self.push(ctx, "tock");
        Ok(())
    }

    fn on_asset(
        &mut self,
        ctx: &mut HookContext<'_>,
        url: &str,
        outcome: &AssetOutcome,
    ) -> HookResult {
        self.push(ctx, &format!("asset:{}:{}", url, outcome.is_loaded()));
        Ok(())
    }

    fn has_tick(&self) -> bool {
        self.ticks
    }

    fn has_tock(&self) -> bool {
        self.ticks
    }
}

/// Clamps its own `value` to 10 by writing back from `update`
struct Clamp;

impl Behavior for Clamp {
    fn update(&mut self, ctx: &mut HookContext<'_>, _old: &PropValue) -> HookResult {
        let value = ctx.property("value").and_then(PropValue::as_f64).unwrap_or(0.0);
        if value > 10.0 {
            let entity = ctx.entity();
            let name = ctx.attr_name().to_string();
            ctx.set_attribute(entity, &name, "value: 10")?;
        }
        Ok(())
    }
}

/// Requests the asset named by its `src` property
struct Texture {
    log: Log,
}

impl Behavior for Texture {
    fn init(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        let src = ctx.data().to_attr_string();
        let status = ctx.request_asset(&src);
        self.log
            .lock()
            .unwrap()
            .push(format!("request:{}", status == AssetStatus::Pending));
        Ok(())
    }

    fn on_asset(
        &mut self,
        _ctx: &mut HookContext<'_>,
        url: &str,
        _outcome: &AssetOutcome,
    ) -> HookResult {
        self.log.lock().unwrap().push(format!("done:{}", url));
        Ok(())
    }
}

/// Behavior whose `init` always fails
struct FailingInit {
    log: Log,
}

impl Behavior for FailingInit {
    fn init(&mut self, _ctx: &mut HookContext<'_>) -> HookResult {
        self.log.lock().unwrap().push("broken:init".to_string());
        Err("no device".into())
    }
}

/// Counts `warn` events emitted while installed
struct WarnCounter(Arc<AtomicUsize>);

impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct Anim {
    log: Log,
}

impl AnimationDriver for Anim {
    fn update(&mut self, _time: f64, _delta: f64) {
        self.log.lock().unwrap().push("anim".to_string());
    }
}

/// Fetcher that only records which URLs were started
#[derive(Clone, Default)]
struct ManualFetcher {
    started: Rc<RefCell<Vec<String>>>,
}

impl Fetcher for ManualFetcher {
    fn start(&mut self, url: &str) {
        self.started.borrow_mut().push(url.to_string());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn clear(log: &Log) {
    log.lock().unwrap().clear();
}

fn count(log: &Log, entry: &str) -> usize {
    log.lock().unwrap().iter().filter(|e| *e == entry).count()
}

fn probe_schema() -> SchemaDecl {
    SchemaDecl::multi([
        ("intensity", PropertyDecl::new().with_default(1.0)),
        ("color", PropertyDecl::typed("color")),
    ])
}

fn logged(log: &Log, schema: SchemaDecl, ticks: bool) -> ComponentSpec {
    let log = log.clone();
    ComponentSpec::new(schema).behavior(move || Logger {
        log: log.clone(),
        ticks,
    })
}

fn logged_system(log: &Log, schema: SchemaDecl, ticks: bool) -> SystemSpec {
    let log = log.clone();
    SystemSpec::new(schema).behavior(move || Logger {
        log: log.clone(),
        ticks,
    })
}

fn registry_with_probe(log: &Log) -> Registry {
    let mut registry = Registry::with_builtins();
    registry
        .register_component("probe", logged(log, probe_schema(), false))
        .unwrap();
    registry
}

fn build(registry: Registry) -> Scene {
    SceneBuilder::new(Arc::new(registry)).build()
}

fn add_entity(scene: &mut Scene, parent: NodeId) -> NodeId {
    let entity = scene.create_element("t-entity");
    scene.append_child(parent, entity).unwrap();
    entity
}

fn add_mixin(scene: &mut Scene, id: &str, attributes: &[(&str, &str)]) -> NodeId {
    let mixin = scene.create_element("t-mixin");
    scene.set_attribute(mixin, "id", id).unwrap();
    for (name, value) in attributes {
        scene.set_attribute(mixin, name, *value).unwrap();
    }
    let root = scene.root();
    scene.append_child(root, mixin).unwrap();
    mixin
}

fn record_events(scene: &mut Scene, node: NodeId, event: &str) -> Rc<RefCell<Vec<Event>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    scene.add_listener(node, event, move |e| sink.borrow_mut().push(e.clone()));
    seen
}

fn number(value: f64) -> PropValue {
    PropValue::Number(value)
}

// ─────────────────────────────────────────────────────────────────────────────
// Data pipeline
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_schema_defaults_fill_missing_properties() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    let entity = scene.create_element("t-entity");
    scene.set_attribute(entity, "probe", "intensity: 3").unwrap();
    let root = scene.root();
    scene.append_child(root, entity).unwrap();

    let data = scene.component_data(entity, "probe").unwrap();
    assert_eq!(data.get("intensity"), Some(&number(3.0)));
    assert_eq!(data.get("color"), Some(&PropValue::from("#FFF")));

    // Default components exist without any markup
    assert_eq!(
        scene.component_data(entity, "position"),
        Some(&PropValue::Vec3(Vec3::new(0.0, 0.0, 0.0)))
    );
    assert_eq!(
        scene.component_data(entity, "scale"),
        Some(&PropValue::Vec3(Vec3::new(1.0, 1.0, 1.0)))
    );
    assert_eq!(scene.component_data(entity, "visible"), Some(&PropValue::Bool(true)));
}

#[test]
fn test_flush_to_dom_reparses_to_same_data() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    let root = scene.root();
    let first = add_entity(&mut scene, root);
    scene
        .set_attribute(first, "probe", "intensity: 2; color: red")
        .unwrap();
    scene.flush_to_dom(first).unwrap();
    let markup = scene.markup_attribute(first, "probe").unwrap().to_string();
    assert!(markup.contains("intensity"));

    let second = scene.create_element("t-entity");
    scene.write_markup_attribute(second, "probe", &markup).unwrap();
    scene.append_child(root, second).unwrap();
    assert_eq!(
        scene.component_data(first, "probe"),
        scene.component_data(second, "probe")
    );
}

#[test]
fn test_transform_components_drive_object3d() {
    let mut scene = build(Registry::with_builtins());
    let root = scene.root();
    let entity = add_entity(&mut scene, root);
    scene.set_attribute(entity, "position", "1 2 3").unwrap();
    scene.set_attribute(entity, "rotation", "0 90 0").unwrap();

    let object = *scene.object3d(entity).unwrap();
    assert_eq!(object.position, Vec3::new(1.0, 2.0, 3.0));
    assert!((object.rotation.y - std::f64::consts::FRAC_PI_2).abs() < 1e-9);

    let handle = scene.object_handle(entity).unwrap();
    let headless = scene.renderer_as::<HeadlessRenderer>().unwrap();
    assert_eq!(
        headless.object(handle).map(|o| o.transform.position),
        Some(Vec3::new(1.0, 2.0, 3.0))
    );
}

#[test]
fn test_mixin_merge_priority() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    add_mixin(&mut scene, "a", &[("probe", "intensity: 2; color: red")]);
    add_mixin(&mut scene, "b", &[("probe", "color: blue")]);

    let entity = scene.create_element("t-entity");
    scene.set_attribute(entity, "mixin", "a b").unwrap();
    scene.set_attribute(entity, "probe", "intensity: 5").unwrap();
    let root = scene.root();
    scene.append_child(root, entity).unwrap();

    // defaults < a < b < own value
    let data = scene.component_data(entity, "probe").unwrap();
    assert_eq!(data.get("intensity"), Some(&number(5.0)));
    assert_eq!(data.get("color"), Some(&PropValue::from("blue")));
    assert_eq!(scene.mixin_ids(entity), vec!["a", "b"]);

    // Refused removal falls back to the mixin values
    scene.remove_attribute(entity, "probe").unwrap();
    assert!(scene.has_component(entity, "probe"));
    let data = scene.component_data(entity, "probe").unwrap();
    assert_eq!(data.get("intensity"), Some(&number(2.0)));
    assert_eq!(data.get("color"), Some(&PropValue::from("blue")));

    scene.set_attribute(entity, "mixin", "b").unwrap();
    let data = scene.component_data(entity, "probe").unwrap();
    assert_eq!(data.get("intensity"), Some(&number(1.0)));
    assert_eq!(data.get("color"), Some(&PropValue::from("blue")));

    // No mixin and no own value left: the component goes away
    scene.set_attribute(entity, "mixin", "").unwrap();
    assert!(!scene.has_component(entity, "probe"));
    assert_eq!(count(&log, "probe:remove"), 1);
}

#[test]
fn test_nested_mixins_compose_before_their_parent() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    add_mixin(&mut scene, "base", &[("probe", "intensity: 4; color: green")]);
    let outer = add_mixin(&mut scene, "outer", &[("probe", "color: white")]);
    scene.set_attribute(outer, "mixin", "base").unwrap();

    let entity = scene.create_element("t-entity");
    scene.set_attribute(entity, "mixin", "outer").unwrap();
    let root = scene.root();
    scene.append_child(root, entity).unwrap();

    assert_eq!(scene.mixin_ids(entity), vec!["base", "outer"]);
    let data = scene.component_data(entity, "probe").unwrap();
    assert_eq!(data.get("intensity"), Some(&number(4.0)));
    assert_eq!(data.get("color"), Some(&PropValue::from("white")));
    // Reflection lists the composed base ids
    assert_eq!(scene.markup_attribute(entity, "mixin"), Some("base outer"));
}

#[test]
fn test_mixin_change_recomputes_users() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    let mixin = add_mixin(&mut scene, "m", &[("probe", "intensity: 2")]);
    let root = scene.root();
    let entity = scene.create_element("t-entity");
    scene.set_attribute(entity, "mixin", "m").unwrap();
    scene.append_child(root, entity).unwrap();

    scene.set_attribute(mixin, "probe", "intensity: 7").unwrap();
    assert_eq!(
        scene.component_data(entity, "probe").and_then(|d| d.get("intensity")),
        Some(&number(7.0))
    );

    scene
        .write_markup_attribute(mixin, "probe", "intensity: 8")
        .unwrap();
    scene.flush_mutations().unwrap();
    assert_eq!(
        scene.component_data(entity, "probe").and_then(|d| d.get("intensity")),
        Some(&number(8.0))
    );
}

#[test]
fn test_mixin_connected_after_entity() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    let root = scene.root();
    let entity = scene.create_element("t-entity");
    scene.set_attribute(entity, "mixin", "late").unwrap();
    scene.append_child(root, entity).unwrap();
    assert!(!scene.has_component(entity, "probe"));

    add_mixin(&mut scene, "late", &[("probe", "intensity: 6")]);
    assert_eq!(
        scene.component_data(entity, "probe").and_then(|d| d.get("intensity")),
        Some(&number(6.0))
    );
}

#[test]
fn test_state_mixins() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    add_mixin(&mut scene, "red", &[("probe", "color: red")]);
    add_mixin(&mut scene, "red-hover", &[("probe", "color: yellow")]);
    let root = scene.root();
    let entity = scene.create_element("t-entity");
    scene.set_attribute(entity, "mixin", "red").unwrap();
    scene.append_child(root, entity).unwrap();
    let added = record_events(&mut scene, root, names::STATE_ADDED);

    scene.add_state(entity, "hover");
    assert!(scene.is_state(entity, "hover"));
    assert_eq!(
        scene.component_data(entity, "probe").and_then(|d| d.get("color")),
        Some(&PropValue::from("yellow"))
    );
    assert_eq!(scene.mixin_ids(entity), vec!["red", "red-hover"]);
    assert_eq!(scene.markup_attribute(entity, "mixin"), Some("red"));
    assert_eq!(added.borrow().len(), 1);
    assert_eq!(added.borrow()[0].detail, EventDetail::State("hover".into()));

    scene.remove_state(entity, "hover");
    assert_eq!(
        scene.component_data(entity, "probe").and_then(|d| d.get("color")),
        Some(&PropValue::from("red"))
    );
}

#[test]
fn test_unchanged_data_skips_update() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    let root = scene.root();
    let entity = scene.create_element("t-entity");
    scene.set_attribute(entity, "probe", "intensity: 2").unwrap();
    scene.append_child(root, entity).unwrap();
    let changed = record_events(&mut scene, entity, names::COMPONENT_CHANGED);
    assert_eq!(count(&log, "probe:update"), 1);

    scene.set_attribute(entity, "probe", "intensity: 2").unwrap();
    scene.set_attribute(entity, "probe", "intensity: 2.0").unwrap();
    assert_eq!(count(&log, "probe:update"), 1);
    assert!(changed.borrow().is_empty());

    scene.set_attribute(entity, "probe", "intensity: 3").unwrap();
    assert_eq!(count(&log, "probe:update"), 2);
    assert_eq!(changed.borrow().len(), 1);
}

#[test]
fn test_set_property_merges_one_key() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    let root = scene.root();
    let entity = add_entity(&mut scene, root);
    scene.set_attribute(entity, "probe", "intensity: 2").unwrap();
    scene.set_property(entity, "probe", "color", "red").unwrap();
    let data = scene.component_data(entity, "probe").unwrap();
    assert_eq!(data.get("intensity"), Some(&number(2.0)));
    assert_eq!(data.get("color"), Some(&PropValue::from("red")));

    scene.reset_property(entity, "probe", Some("intensity")).unwrap();
    assert_eq!(
        scene.component_data(entity, "probe").and_then(|d| d.get("intensity")),
        Some(&number(1.0))
    );
}

#[test]
fn test_default_component_removal_is_refused() {
    let mut scene = build(Registry::with_builtins());
    let root = scene.root();
    let entity = add_entity(&mut scene, root);
    scene.set_attribute(entity, "position", "1 2 3").unwrap();

    scene.remove_attribute(entity, "position").unwrap();
    assert!(scene.has_component(entity, "position"));
    assert_eq!(
        scene.component_data(entity, "position"),
        Some(&PropValue::Vec3(Vec3::new(0.0, 0.0, 0.0)))
    );
    assert_eq!(scene.object3d(entity).unwrap().position, Vec3::new(0.0, 0.0, 0.0));
}

#[test]
fn test_remove_attribute_tears_down_component() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    let root = scene.root();
    let entity = add_entity(&mut scene, root);
    scene.set_attribute(entity, "probe", "intensity: 2").unwrap();
    let removed = record_events(&mut scene, entity, names::COMPONENT_REMOVED);

    scene.remove_attribute(entity, "probe").unwrap();
    assert!(!scene.has_component(entity, "probe"));
    assert!(scene.markup_attribute(entity, "probe").is_none());
    assert_eq!(count(&log, "probe:pause"), 1);
    assert_eq!(count(&log, "probe:remove"), 1);
    assert_eq!(
        removed.borrow()[0].detail,
        EventDetail::Component {
            name: "probe".into(),
            id: None
        }
    );
}

#[test]
fn test_removed_component_stays_removed_after_flush() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    let root = scene.root();
    let entity = add_entity(&mut scene, root);
    scene.set_attribute(entity, "probe", "intensity: 2").unwrap();
    scene.remove_attribute(entity, "probe").unwrap();

    scene.render_frame(16.0);
    assert!(!scene.has_component(entity, "probe"));
    assert!(scene.markup_attribute(entity, "probe").is_none());
    assert_eq!(count(&log, "probe:init"), 1);
}

#[test]
fn test_state_variant_component_reverts_within_one_frame() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    add_mixin(&mut scene, "m", &[]);
    add_mixin(&mut scene, "m-hover", &[("probe", "intensity: 5")]);
    let root = scene.root();
    let entity = scene.create_element("t-entity");
    scene.set_attribute(entity, "mixin", "m").unwrap();
    scene.append_child(root, entity).unwrap();
    assert!(!scene.has_component(entity, "probe"));

    scene.add_state(entity, "hover");
    assert_eq!(
        scene.component_data(entity, "probe").and_then(|d| d.get("intensity")),
        Some(&number(5.0))
    );
    scene.remove_state(entity, "hover");
    assert!(!scene.has_component(entity, "probe"));

    scene.render_frame(16.0);
    assert!(!scene.has_component(entity, "probe"));

    // Still driven by the mixin, so it can come and go again
    scene.add_state(entity, "hover");
    scene.render_frame(32.0);
    scene.remove_state(entity, "hover");
    scene.render_frame(48.0);
    assert!(!scene.has_component(entity, "probe"));
}

#[test]
fn test_unknown_property_warns_once() {
    let warnings = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(WarnCounter(warnings.clone()));
    tracing::subscriber::with_default(subscriber, || {
        let log = new_log();
        let mut scene = build(registry_with_probe(&log));
        let mixin = add_mixin(&mut scene, "tint", &[("probe", "color: red")]);
        let root = scene.root();
        let entity = scene.create_element("t-entity");
        scene.set_attribute(entity, "mixin", "tint").unwrap();
        scene.append_child(root, entity).unwrap();
        let before = warnings.load(Ordering::SeqCst);

        scene.set_attribute(entity, "probe", "intensity: 2; bogus: 1").unwrap();
        assert_eq!(warnings.load(Ordering::SeqCst), before + 1);

        for color in ["#111", "#222", "#333"] {
            scene.set_property(entity, "probe", "color", color).unwrap();
            scene.set_attribute(mixin, "probe", format!("color: {}", color)).unwrap();
        }
        scene.render_frame(16.0);
        assert_eq!(warnings.load(Ordering::SeqCst), before + 1);
        assert_eq!(
            scene.component_data(entity, "probe").and_then(|d| d.get("intensity")),
            Some(&number(2.0))
        );
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Markup mutations
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_initial_empty_markup_echo_is_ignored() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    let root = scene.root();
    let entity = add_entity(&mut scene, root);
    scene.set_attribute(entity, "probe", "intensity: 4").unwrap();
    assert_eq!(scene.markup_attribute(entity, "probe"), Some(""));

    scene.flush_mutations().unwrap();
    assert_eq!(count(&log, "probe:update"), 1);
    assert_eq!(
        scene.component_data(entity, "probe").and_then(|d| d.get("intensity")),
        Some(&number(4.0))
    );
}

#[test]
fn test_markup_writes_coalesce_and_clobber() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    let root = scene.root();
    let entity = scene.create_element("t-entity");
    scene
        .write_markup_attribute(entity, "probe", "intensity: 2; color: red")
        .unwrap();
    scene.append_child(root, entity).unwrap();
    assert_eq!(count(&log, "probe:update"), 1);

    scene
        .write_markup_attribute(entity, "probe", "intensity: 5; color: red")
        .unwrap();
    scene
        .write_markup_attribute(entity, "probe", "intensity: 6")
        .unwrap();
    scene.flush_mutations().unwrap();

    // One observed change; the markup value replaces the cached one
    assert_eq!(count(&log, "probe:update"), 2);
    let data = scene.component_data(entity, "probe").unwrap();
    assert_eq!(data.get("intensity"), Some(&number(6.0)));
    assert_eq!(data.get("color"), Some(&PropValue::from("#FFF")));

    scene.remove_markup_attribute(entity, "probe").unwrap();
    scene.render_frame(0.0);
    assert!(!scene.has_component(entity, "probe"));
}

#[test]
fn test_markup_mixin_attribute_resolves() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    add_mixin(&mut scene, "m", &[("probe", "intensity: 9")]);
    let root = scene.root();
    let entity = add_entity(&mut scene, root);

    scene.write_markup_attribute(entity, "mixin", "m").unwrap();
    scene.flush_mutations().unwrap();
    assert_eq!(
        scene.component_data(entity, "probe").and_then(|d| d.get("intensity")),
        Some(&number(9.0))
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Component lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_dependencies_initialize_first() {
    let log = new_log();
    let mut registry = Registry::with_builtins();
    registry
        .register_component("a", logged(&log, probe_schema(), false))
        .unwrap();
    registry
        .register_component(
            "b",
            logged(&log, probe_schema(), false).dependencies(["a"]),
        )
        .unwrap();
    let mut scene = build(registry);
    let root = scene.root();
    let entity = scene.create_element("t-entity");
    scene.set_attribute(entity, "b", "intensity: 2").unwrap();
    scene.append_child(root, entity).unwrap();

    let hooks: Vec<String> = entries(&log)
        .into_iter()
        .filter(|e| e.ends_with(":init") || e.ends_with(":update"))
        .collect();
    assert_eq!(hooks, vec!["a:init", "a:update", "b:init", "b:update"]);
    assert!(scene.has_component(entity, "a"));
}

#[test]
fn test_dependency_cycle_terminates() {
    let log = new_log();
    let mut registry = Registry::new();
    registry
        .register_component(
            "c",
            logged(&log, probe_schema(), false).dependencies(["d"]),
        )
        .unwrap();
    registry
        .register_component(
            "d",
            logged(&log, probe_schema(), false).dependencies(["c"]),
        )
        .unwrap();
    let mut scene = build(registry);
    let root = scene.root();
    let entity = add_entity(&mut scene, root);
    scene.set_attribute(entity, "c", "").unwrap();

    assert!(scene.has_component(entity, "c"));
    assert!(scene.has_component(entity, "d"));
    assert_eq!(count(&log, "c:init"), 1);
    assert_eq!(count(&log, "d:init"), 1);
}

#[test]
fn test_multiple_instances() {
    let log = new_log();
    let mut registry = registry_with_probe(&log);
    registry
        .register_component("sound", logged(&log, probe_schema(), false).multiple(true))
        .unwrap();
    let mut scene = build(registry);
    let root = scene.root();
    let entity = add_entity(&mut scene, root);

    scene.set_attribute(entity, "sound__a", "intensity: 2").unwrap();
    scene.set_attribute(entity, "sound__b", "intensity: 3").unwrap();
    assert_eq!(
        scene.component_instance(entity, "sound__a").and_then(|c| c.id()),
        Some("a")
    );
    assert_eq!(
        scene.component_data(entity, "sound__b").and_then(|d| d.get("intensity")),
        Some(&number(3.0))
    );

    let err = scene
        .set_attribute(entity, "probe__x", "intensity: 2")
        .unwrap_err();
    assert!(matches!(err, SceneError::NotMultiple { ref name, ref id } if name == "probe" && id == "x"));
}

#[test]
fn test_write_during_hook_is_deferred() {
    let mut registry = Registry::with_builtins();
    registry
        .register_component(
            "clamp",
            ComponentSpec::new(SchemaDecl::multi([(
                "value",
                PropertyDecl::new().with_default(0.0),
            )]))
            .behavior(|| Clamp),
        )
        .unwrap();
    let mut scene = build(registry);
    let root = scene.root();
    let entity = add_entity(&mut scene, root);

    scene.set_attribute(entity, "clamp", "value: 50").unwrap();
    assert_eq!(
        scene.component_data(entity, "clamp").and_then(|d| d.get("value")),
        Some(&number(10.0))
    );

    scene.set_attribute(entity, "clamp", "value: 99").unwrap();
    assert_eq!(
        scene.component_data(entity, "clamp").and_then(|d| d.get("value")),
        Some(&number(10.0))
    );
}

#[test]
fn test_failed_init_is_not_retried_by_flush() {
    let log = new_log();
    let mut registry = registry_with_probe(&log);
    let sink = log.clone();
    registry
        .register_component(
            "broken",
            ComponentSpec::new(SchemaDecl::default()).behavior(move || FailingInit {
                log: sink.clone(),
            }),
        )
        .unwrap();
    let mut scene = build(registry);
    let root = scene.root();
    let entity = add_entity(&mut scene, root);

    scene.set_attribute(entity, "broken", "on").unwrap();
    assert!(!scene.has_component(entity, "broken"));
    assert!(scene.markup_attribute(entity, "broken").is_none());

    scene.render_frame(16.0);
    scene.render_frame(32.0);
    assert_eq!(count(&log, "broken:init"), 1);
    assert!(!scene.has_component(entity, "broken"));
}

#[test]
fn test_multi_data_reuses_pooled_maps() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    let root = scene.root();
    let entity = add_entity(&mut scene, root);
    scene.set_attribute(entity, "probe", "intensity: 1").unwrap();
    scene.set_attribute(entity, "probe", "intensity: 2").unwrap();
    let size = scene.pools.get("probe").map(|p| p.size()).unwrap();

    for i in 0..50 {
        let value = format!("intensity: {}", i % 3);
        scene.set_attribute(entity, "probe", value).unwrap();
    }
    assert_eq!(scene.pools.get("probe").map(|p| p.size()), Some(size));
}

// ─────────────────────────────────────────────────────────────────────────────
// Entity lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_load_fans_in_despite_failed_child() {
    let log = new_log();
    let fetcher = ManualFetcher::default();
    let mut scene = SceneBuilder::new(Arc::new(registry_with_probe(&log)))
        .fetcher(fetcher.clone())
        .build();
    let root = scene.root();

    let parent = scene.create_element("t-entity");
    let child = scene.create_element("t-entity");
    let item = scene.create_element("t-asset-item");
    scene.set_attribute(item, "src", "a.png").unwrap();
    scene.append_child(parent, child).unwrap();
    scene.append_child(parent, item).unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));
    for (node, label) in [(parent, "parent"), (child, "child")] {
        let sink = order.clone();
        scene.add_listener(node, names::LOADED, move |_| sink.borrow_mut().push(label));
    }
    let errors = record_events(&mut scene, item, names::ERROR);

    scene.append_child(root, parent).unwrap();
    assert_eq!(*order.borrow(), vec!["child"]);
    assert!(!scene.has_loaded(parent));
    assert!(!scene.is_playing(child));
    assert_eq!(*fetcher.started.borrow(), vec!["a.png".to_string()]);

    scene.complete_request("a.png", AssetOutcome::Failed("404".into()));
    assert_eq!(*order.borrow(), vec!["child", "parent"]);
    assert!(scene.is_playing(parent));
    assert!(scene.is_playing(child));
    assert_eq!(scene.load_status(item), Some(LoadStatus::Failed));
    assert_eq!(
        errors.borrow()[0].detail,
        EventDetail::Request {
            url: "a.png".into(),
            message: Some("404".into())
        }
    );
}

#[test]
fn test_parent_loads_once_after_every_child_settles() {
    let log = new_log();
    let fetcher = ManualFetcher::default();
    let mut scene = SceneBuilder::new(Arc::new(registry_with_probe(&log)))
        .fetcher(fetcher.clone())
        .build();
    let root = scene.root();

    let parent = scene.create_element("t-entity");
    let first = scene.create_element("t-entity");
    let second = scene.create_element("t-entity");
    for (child, url) in [(first, "first.png"), (second, "second.png")] {
        let item = scene.create_element("t-asset-item");
        scene.set_attribute(item, "src", url).unwrap();
        scene.append_child(child, item).unwrap();
        scene.append_child(parent, child).unwrap();
    }
    let broken = scene.create_element("t-asset-item");
    scene.set_attribute(broken, "src", "broken.png").unwrap();
    scene.append_child(parent, broken).unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));
    for (node, label) in [(parent, "parent"), (first, "first"), (second, "second")] {
        let sink = order.clone();
        scene.add_listener(node, names::LOADED, move |_| sink.borrow_mut().push(label));
    }

    scene.append_child(root, parent).unwrap();
    assert!(order.borrow().is_empty());
    assert_eq!(fetcher.started.borrow().len(), 3);

    scene.complete_request("second.png", AssetOutcome::Loaded);
    assert_eq!(*order.borrow(), vec!["second"]);
    scene.complete_request("broken.png", AssetOutcome::Failed("404".into()));
    assert_eq!(*order.borrow(), vec!["second"]);
    assert!(!scene.has_loaded(parent));

    scene.complete_request("first.png", AssetOutcome::Loaded);
    assert_eq!(*order.borrow(), vec!["second", "first", "parent"]);
    assert!(scene.is_playing(parent));

    scene.render_frame(16.0);
    scene.render_frame(32.0);
    assert_eq!(order.borrow().iter().filter(|l| **l == "parent").count(), 1);
    assert_eq!(scene.load_status(broken), Some(LoadStatus::Failed));
}

#[test]
fn test_entity_objects_follow_the_tree() {
    let mut scene = build(Registry::with_builtins());
    let root = scene.root();
    let parent = add_entity(&mut scene, root);
    let child = add_entity(&mut scene, parent);
    let (root_obj, parent_obj, child_obj) = (
        scene.object_handle(root).unwrap(),
        scene.object_handle(parent).unwrap(),
        scene.object_handle(child).unwrap(),
    );
    let headless = scene.renderer_as::<HeadlessRenderer>().unwrap();
    assert_eq!(headless.parent(parent_obj), Some(root_obj));
    assert_eq!(headless.parent(child_obj), Some(parent_obj));
}

#[test]
fn test_play_pause_recurse() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    let root = scene.root();
    let parent = add_entity(&mut scene, root);
    let child = scene.create_element("t-entity");
    scene.set_attribute(child, "probe", "").unwrap();
    scene.append_child(parent, child).unwrap();
    assert!(scene.is_playing(child));
    assert_eq!(count(&log, "probe:play"), 1);

    let paused = record_events(&mut scene, root, names::PAUSE);
    scene.pause(parent);
    assert!(!scene.is_playing(parent));
    assert!(!scene.is_playing(child));
    assert!(scene.is_playing(root));
    assert_eq!(count(&log, "probe:pause"), 1);
    // Both pause events bubble to the root
    assert_eq!(paused.borrow().len(), 2);

    scene.pause(parent);
    assert_eq!(count(&log, "probe:pause"), 1);

    scene.play(parent);
    assert!(scene.is_playing(child));
    assert_eq!(count(&log, "probe:play"), 2);
}

#[test]
fn test_remove_node_tears_down_subtree() {
    let log = new_log();
    let mut scene = build(registry_with_probe(&log));
    let root = scene.root();
    let parent = scene.create_element("t-entity");
    let child = scene.create_element("t-entity");
    scene.set_attribute(parent, "probe", "").unwrap();
    scene.set_attribute(child, "probe", "").unwrap();
    scene.append_child(parent, child).unwrap();
    scene.append_child(root, parent).unwrap();
    let before = scene.renderer_as::<HeadlessRenderer>().unwrap().object_count();
    let detached = record_events(&mut scene, root, names::CHILD_DETACHED);

    scene.remove_node(parent).unwrap();
    assert_eq!(count(&log, "probe:remove"), 2);
    assert!(scene.entity(parent).is_none());
    assert!(!scene.document().contains(child));
    assert_eq!(
        scene.renderer_as::<HeadlessRenderer>().unwrap().object_count(),
        before - 2
    );
    assert_eq!(detached.borrow()[0].detail, EventDetail::Child(parent));

    assert!(matches!(
        scene.remove_node(root),
        Err(SceneError::InvalidHierarchy(_))
    ));
    assert!(matches!(
        scene.remove_node(parent),
        Err(SceneError::UnknownNode(_))
    ));
}

#[test]
fn test_configured_default_components() {
    let config = SceneConfig {
        default_components: vec!["position".into()],
        ..SceneConfig::default()
    };
    let mut scene = SceneBuilder::new(Arc::new(Registry::with_builtins()))
        .config(config)
        .build();
    let root = scene.root();
    let entity = add_entity(&mut scene, root);
    assert!(scene.has_component(entity, "position"));
    assert!(!scene.has_component(entity, "scale"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Systems and the render loop
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_systems_init_in_name_order() {
    let log = new_log();
    let mut registry = Registry::new();
    registry
        .register_system("zeta", logged_system(&log, SchemaDecl::default(), false))
        .unwrap();
    registry
        .register_system("alpha", logged_system(&log, SchemaDecl::default(), false))
        .unwrap();
    let scene = build(registry);
    let inits: Vec<String> = entries(&log)
        .into_iter()
        .filter(|e| e.ends_with(":init"))
        .collect();
    assert_eq!(inits, vec!["alpha:init", "zeta:init"]);
    assert!(scene.system_instance("alpha").unwrap().is_playing());
}

#[test]
fn test_system_shadows_component() {
    let log = new_log();
    let component_log = new_log();
    let fog_schema = || {
        SchemaDecl::multi([("density", PropertyDecl::new().with_default(0.1))])
    };
    let mut registry = Registry::with_builtins();
    registry
        .register_system("fog", logged_system(&log, fog_schema(), false))
        .unwrap();
    registry
        .register_component("fog", logged(&component_log, fog_schema(), false))
        .unwrap();
    let mut scene = SceneBuilder::new(Arc::new(registry))
        .attribute("fog", "density: 0.5")
        .build();
    let root = scene.root();

    assert!(!scene.has_component(root, "fog"));
    assert!(entries(&component_log).is_empty());
    assert_eq!(
        scene.system_data("fog").and_then(|d| d.get("density")),
        Some(&number(0.5))
    );

    scene.set_attribute(root, "fog", "density: 0.8").unwrap();
    assert_eq!(
        scene.system_data("fog").and_then(|d| d.get("density")),
        Some(&number(0.8))
    );
    assert_eq!(count(&log, "fog:update"), 1);
    assert!(!scene.has_component(root, "fog"));

    // Other entities still get the component
    let entity = add_entity(&mut scene, root);
    scene.set_attribute(entity, "fog", "density: 0.3").unwrap();
    assert!(scene.has_component(entity, "fog"));
}

#[test]
fn test_frame_order() {
    let log = new_log();
    let mut registry = Registry::new();
    registry
        .register_component("probe", logged(&log, probe_schema(), true))
        .unwrap();
    registry
        .register_system("sys", logged_system(&log, SchemaDecl::default(), true))
        .unwrap();
    let mut scene = SceneBuilder::new(Arc::new(registry))
        .animation_driver(Anim { log: log.clone() })
        .build();
    let root = scene.root();
    let entity = add_entity(&mut scene, root);
    scene.set_attribute(entity, "probe", "").unwrap();

    clear(&log);
    scene.render_frame(0.0);
    assert_eq!(
        entries(&log),
        vec!["anim", "probe:tick:0", "sys:tick", "probe:tock", "sys:tock"]
    );

    clear(&log);
    scene.render_frame(16.0);
    assert_eq!(count(&log, "probe:tick:16"), 1);

    scene.pause(root);
    clear(&log);
    scene.render_frame(32.0);
    assert!(entries(&log).is_empty());
    assert_eq!(scene.renderer_as::<HeadlessRenderer>().unwrap().frames(), 3);
}

// ─────────────────────────────────────────────────────────────────────────────
// Assets
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_asset_requests_coalesce() {
    let fetcher = ManualFetcher::default();
    let mut scene = SceneBuilder::new(Arc::new(Registry::with_builtins()))
        .fetcher(fetcher.clone())
        .build();
    let root = scene.root();
    let assets = scene.create_element("t-assets");
    let item_a = scene.create_element("t-asset-item");
    let item_b = scene.create_element("t-asset-item");
    let image = scene.create_element("img");
    for node in [item_a, item_b, image] {
        scene.set_attribute(node, "src", "tex.png").unwrap();
        scene.append_child(assets, node).unwrap();
    }
    scene.append_child(root, assets).unwrap();

    assert_eq!(*fetcher.started.borrow(), vec!["tex.png".to_string()]);
    assert_eq!(scene.load_status(assets), Some(LoadStatus::Pending));

    scene.complete_request("tex.png", AssetOutcome::Loaded);
    for node in [item_a, item_b, image, assets] {
        assert_eq!(scene.load_status(node), Some(LoadStatus::Loaded));
    }
}

#[test]
fn test_component_asset_requests_share_one_fetch() {
    let log = new_log();
    let fetcher = ManualFetcher::default();
    let mut registry = Registry::new();
    let sink = log.clone();
    registry
        .register_component(
            "texture",
            ComponentSpec::new(SchemaDecl::Single(PropertyDecl::typed("string")))
                .behavior(move || Texture { log: sink.clone() }),
        )
        .unwrap();
    let mut scene = SceneBuilder::new(Arc::new(registry))
        .fetcher(fetcher.clone())
        .build();
    let root = scene.root();
    let first = add_entity(&mut scene, root);
    let second = add_entity(&mut scene, root);
    scene.set_attribute(first, "texture", "wood.jpg").unwrap();
    scene.set_attribute(second, "texture", "wood.jpg").unwrap();
    assert_eq!(fetcher.started.borrow().len(), 1);

    // Only attached components hear about the completion
    scene.remove_attribute(second, "texture").unwrap();
    scene.complete_request("wood.jpg", AssetOutcome::Loaded);
    assert_eq!(
        entries(&log),
        vec!["request:true", "request:true", "done:wood.jpg"]
    );
}

#[test]
fn test_asset_timeout_releases_entities() {
    let config = SceneConfig {
        asset_timeout_ms: Some(100.0),
        ..SceneConfig::default()
    };
    let mut scene = SceneBuilder::new(Arc::new(Registry::with_builtins()))
        .config(config)
        .build();
    let root = scene.root();
    let assets = scene.create_element("t-assets");
    let item = scene.create_element("t-asset-item");
    scene.set_attribute(item, "src", "slow.glb").unwrap();
    scene.append_child(assets, item).unwrap();
    scene.append_child(root, assets).unwrap();
    let timeouts = record_events(&mut scene, assets, names::TIMEOUT);

    let entity = add_entity(&mut scene, root);
    assert!(!scene.has_loaded(entity));

    scene.render_frame(0.0);
    assert!(!scene.has_loaded(entity));
    scene.render_frame(150.0);
    assert!(scene.has_loaded(entity));
    assert_eq!(timeouts.borrow().len(), 1);
    assert_eq!(scene.load_status(item), Some(LoadStatus::Pending));

    // Late completions still apply
    scene.complete_request("slow.glb", AssetOutcome::Loaded);
    assert_eq!(scene.load_status(item), Some(LoadStatus::Loaded));
}

#[test]
fn test_fail_fast_settles_container() {
    let config = SceneConfig {
        asset_failure: AssetFailurePolicy::FailFast,
        asset_timeout_ms: None,
        ..SceneConfig::default()
    };
    let mut scene = SceneBuilder::new(Arc::new(Registry::with_builtins()))
        .config(config)
        .build();
    let root = scene.root();
    let assets = scene.create_element("t-assets");
    for src in ["a.png", "b.png"] {
        let item = scene.create_element("t-asset-item");
        scene.set_attribute(item, "src", src).unwrap();
        scene.append_child(assets, item).unwrap();
    }
    scene.append_child(root, assets).unwrap();
    let entity = add_entity(&mut scene, root);
    assert!(!scene.has_loaded(entity));

    scene.complete_request("a.png", AssetOutcome::Failed("bad".into()));
    assert_eq!(scene.load_status(assets), Some(LoadStatus::Failed));
    assert!(scene.has_loaded(entity));
}
