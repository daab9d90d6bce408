// Resource Lifetime Tests for PL/Lua
// These tests verify that script objects never outlive the host resources they mirror

use pllua::host::MemoryHost;
use pllua::routine::RoutineDefinition;
use pllua::tracker::{CleanupRegistry, DescriptorArena, FrameExit};
use pllua::types::{oid, Attribute, RowDescriptor};
use pllua::{CallContext, CallOutcome, Datum, Engine, Options, SetCall, XactEvent};
use std::cell::RefCell;
use std::rc::Rc;

fn setup() -> (Rc<MemoryHost>, Engine) {
    env_logger::try_init().ok();
    let host = Rc::new(MemoryHost::new());
    host.define_table("items", vec![Attribute::new("id", oid::INT4), Attribute::new("name", oid::TEXT)]);
    host.define_select("select * from items", "items");
    for i in 1..=3 {
        host.insert_row("items", vec![Some(Datum::Int4(i)), Some(Datum::Text(format!("item{}", i)))]).unwrap();
    }
    let engine = Engine::new(host.clone(), Options::default()).unwrap();
    (host, engine)
}

fn value(engine: &Engine, routine: u32) -> Option<Datum> {
    match engine.invoke(routine, &[], CallContext::Function).unwrap() {
        CallOutcome::Value(v) => v,
        other => panic!("unexpected outcome {:?}", other),
    }
}

/// Test cleanups run last-in, first-out and exactly once
#[test]
fn test_cleanup_registry_lifo() {
    let registry = CleanupRegistry::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    let mut ids = Vec::new();
    for i in 0..5 {
        let order = Rc::clone(&order);
        ids.push(registry.register(move || order.borrow_mut().push(i)));
    }
    assert!(registry.unregister(ids[2]));
    assert!(!registry.unregister(ids[2]));

    assert_eq!(registry.drain(), 4);
    assert_eq!(*order.borrow(), vec![4, 3, 1, 0]);
    assert_eq!(registry.drain(), 0);
}

/// Test a destructor may unregister entries that have not run yet
#[test]
fn test_cleanup_unregisters_sibling() {
    let registry = Rc::new(CleanupRegistry::new());
    let ran = Rc::new(RefCell::new(Vec::new()));

    let first = {
        let ran = Rc::clone(&ran);
        registry.register(move || ran.borrow_mut().push("first"))
    };
    {
        let ran = Rc::clone(&ran);
        let weak = Rc::downgrade(&registry);
        registry.register(move || {
            ran.borrow_mut().push("second");
            if let Some(registry) = weak.upgrade() {
                registry.unregister(first);
            }
        });
    }

    assert_eq!(registry.drain(), 1);
    assert_eq!(*ran.borrow(), vec!["second"]);
}

/// Test only transaction-ending events drain the registry
#[test]
fn test_only_ending_events_drain() {
    let (host, engine) = setup();
    let open = host.create_routine(RoutineDefinition::new(
        0,
        "open",
        "local p = server.prepare('select * from items') setshared('cur', p:getcursor(nil, true, 'c1'))",
        oid::VOID,
    ));
    value(&engine, open);
    assert_eq!(engine.pending_cleanups(), 1);

    assert_eq!(engine.on_transaction_event(XactEvent::PreCommit), 0);
    assert_eq!(engine.on_transaction_event(XactEvent::PrePrepare), 0);
    assert_eq!(engine.pending_cleanups(), 1);
    assert_eq!(engine.on_transaction_event(XactEvent::Abort), 1);
    assert_eq!(engine.pending_cleanups(), 0);
}

/// Test a cursor kept across the transaction boundary reports itself closed
#[test]
fn test_cursor_closed_at_transaction_end() {
    let (host, engine) = setup();
    let open = host.create_routine(RoutineDefinition::new(
        0,
        "open",
        "local p = server.prepare('select * from items') setshared('cur', p:getcursor(nil, true, 'c1'))",
        oid::VOID,
    ));
    let fetch = host.create_routine(RoutineDefinition::new(
        0,
        "fetch_one",
        "local rows = cur:fetch(1) return rows[1].id",
        oid::INT4,
    ));

    value(&engine, open);
    assert_eq!(value(&engine, fetch), Some(Datum::Int4(1)));

    engine.on_transaction_event(XactEvent::Commit);
    let err = engine.invoke(fetch, &[], CallContext::Function).unwrap_err();
    assert!(err.to_string().contains("is closed"), "{}", err);
}

/// Test closing a cursor releases its registry entry and portal
#[test]
fn test_cursor_close_unregisters() {
    let (host, engine) = setup();
    let f = host.create_routine(RoutineDefinition::new(
        0,
        "scan",
        "local c = server.prepare('select * from items'):getcursor() local rows = c:fetch(2) c:close() c:close() return #rows",
        oid::INT4,
    ));
    assert_eq!(value(&engine, f), Some(Datum::Int4(2)));
    assert_eq!(host.open_portals(), 0);
    assert_eq!(engine.pending_cleanups(), 0);
}

/// Test a tuple kept after a successful call stays readable
#[test]
fn test_tuple_survives_normal_exit() {
    let (host, engine) = setup();
    let keep = host.create_routine(RoutineDefinition::new(
        0,
        "keep",
        "setshared('kept', server.execute('select * from items')[2])",
        oid::VOID,
    ));
    let read = host.create_routine(RoutineDefinition::new(0, "read", "return kept.name", oid::TEXT));

    value(&engine, keep);
    assert_eq!(value(&engine, read), Some(Datum::Text("item2".into())));
    assert!(engine.live_descriptors() >= 1);
}

/// Test a tuple kept by a failed call loses its descriptor instead of dangling
#[test]
fn test_tuple_released_by_aborted_frame() {
    let (host, engine) = setup();
    let keep = host.create_routine(RoutineDefinition::new(
        0,
        "keep_then_fail",
        "setshared('kept', server.execute('select * from items')[1]) error('abort')",
        oid::VOID,
    ));
    let read = host.create_routine(RoutineDefinition::new(0, "read", "return kept.name", oid::TEXT));
    let show = host.create_routine(RoutineDefinition::new(0, "show", "return tostring(kept)", oid::TEXT));

    assert!(engine.invoke(keep, &[], CallContext::Function).is_err());
    assert_eq!(value(&engine, read), None);
    assert_eq!(value(&engine, show), Some(Datum::Text("(lost tuple)".into())));
}

/// Test the arena frees unreferenced handles when their frame pops
#[test]
fn test_arena_frame_semantics() {
    let arena = DescriptorArena::new();
    let desc = Rc::new(RowDescriptor::anonymous(vec![Attribute::new("a", oid::INT4)]));

    let outer = arena.push_frame();
    let kept = arena.allocate(Rc::clone(&desc));

    let inner = arena.push_frame();
    let dropped = arena.allocate(Rc::clone(&desc));
    let survivor = arena.allocate(Rc::clone(&desc));
    let dropped_id = dropped.id();
    drop(dropped);
    assert_eq!(arena.live_descriptors(), 3);

    arena.pop_frame(inner, FrameExit::Aborted).unwrap();
    assert!(arena.status(dropped_id).is_none());
    assert!(survivor.descriptor().is_none());
    assert!(kept.descriptor().is_some());

    arena.pop_frame(outer, FrameExit::Normal).unwrap();
    assert!(kept.descriptor().is_some());
    assert_eq!(arena.live_descriptors(), 1);
}

/// Test frames must pop in order
#[test]
fn test_arena_rejects_out_of_order_pop() {
    let arena = DescriptorArena::new();
    let outer = arena.push_frame();
    let _inner = arena.push_frame();
    assert!(arena.pop_frame(outer, FrameExit::Normal).is_err());
}

/// Test an unfinished set-returning scan is dropped at transaction end
#[test]
fn test_suspended_scan_dropped_at_commit() {
    let (host, engine) = setup();
    let f = host.create_routine(
        RoutineDefinition::new(
            0,
            "each_item",
            "for row in server.rows('select * from items') do coroutine.yield(row.id) end",
            oid::INT4,
        )
        .returns_set(true),
    );
    let mut slot = SetCall::new();
    assert_eq!(
        engine.invoke(f, &[], CallContext::SetFunction(&mut slot)).unwrap(),
        CallOutcome::Row(Some(Datum::Int4(1)))
    );
    assert_eq!(engine.suspended_calls(), 1);
    assert!(engine.pending_cleanups() >= 2);

    engine.on_transaction_event(XactEvent::Commit);
    assert_eq!(engine.suspended_calls(), 0);
    assert_eq!(engine.pending_cleanups(), 0);
}
