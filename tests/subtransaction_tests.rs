// Protected Call Tests for PL/Lua
// These tests verify savepoint isolation of subtransaction() and the double-fault path

use pllua::error::ErrorReport;
use pllua::host::MemoryHost;
use pllua::routine::RoutineDefinition;
use pllua::types::{oid, Attribute};
use pllua::{CallContext, CallOutcome, Datum, Engine, Error, Options};
use std::rc::Rc;

fn setup() -> (Rc<MemoryHost>, Engine) {
    env_logger::try_init().ok();
    let host = Rc::new(MemoryHost::new());
    host.define_table("items", vec![Attribute::new("id", oid::INT4), Attribute::new("name", oid::TEXT)]);
    host.define_insert("insert into items values ($1, $2)", "items");
    host.define_select("select * from items", "items");
    host.fail_statement(
        "select broken",
        ErrorReport::new("division by zero").with_code("22012").with_hint("check the divisor"),
    );
    let engine = Engine::new(host.clone(), Options::default()).unwrap();
    (host, engine)
}

const PREPARE: &str = "local ins = server.prepare('insert into items values ($1, $2)', {'integer', 'text'})\n";

fn text(engine: &Engine, routine: u32) -> Option<Datum> {
    match engine.invoke(routine, &[], CallContext::Function).unwrap() {
        CallOutcome::Value(v) => v,
        other => panic!("unexpected outcome {:?}", other),
    }
}

/// Test work done inside a failed subtransaction is rolled back
#[test]
fn test_failed_body_rolls_back() {
    let (host, engine) = setup();
    let source = format!(
        "{}ins:execute({{1, 'kept'}})
        local ok, err = subtransaction(function()
            ins:execute({{2, 'lost'}})
            error('inner failure')
        end)
        assert(not ok)
        return err",
        PREPARE
    );
    let f = host.create_routine(RoutineDefinition::new(0, "f", source, oid::TEXT));

    match text(&engine, f) {
        Some(Datum::Text(msg)) => assert!(msg.contains("inner failure"), "{}", msg),
        other => panic!("expected the raised message, got {:?}", other),
    }
    let rows = host.table_rows("items");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][1], Some(Datum::Text("kept".into())));
    assert_eq!(host.savepoint_depth(), 0);
}

/// Test a successful subtransaction returns true followed by the body's results
#[test]
fn test_successful_body() {
    let (host, engine) = setup();
    let source = format!(
        "{}local ok, a, b = subtransaction(function(x) ins:execute({{x, 'in'}}) return x, 'done' end, 7)
        return tostring(ok) .. ':' .. a .. ':' .. b",
        PREPARE
    );
    let f = host.create_routine(RoutineDefinition::new(0, "f", source, oid::TEXT));
    assert_eq!(text(&engine, f), Some(Datum::Text("true:7:done".into())));
    assert_eq!(host.table_rows("items").len(), 1);
    assert_eq!(host.savepoint_depth(), 0);
}

/// Test raised tables come back unchanged
#[test]
fn test_raised_table_is_returned_as_is() {
    let (host, engine) = setup();
    let f = host.create_routine(RoutineDefinition::new(
        0,
        "f",
        "local marker = { code = 42 }
        local ok, err = subtransaction(function() error(marker) end)
        return (not ok and err == marker) and err.code or -1",
        oid::INT4,
    ));
    assert_eq!(text(&engine, f), Some(Datum::Int4(42)));
}

/// Test host errors come back as structured report tables
#[test]
fn test_host_error_becomes_report_table() {
    let (host, engine) = setup();
    let f = host.create_routine(RoutineDefinition::new(
        0,
        "f",
        "local ok, err = subtransaction(server.execute, 'select broken')
        return table.concat({ tostring(ok), err.sqlerrcode, err.hint, tostring(err) }, '|')",
        oid::TEXT,
    ));
    assert_eq!(text(&engine, f), Some(Datum::Text("false|22012|check the divisor|division by zero".into())));
}

/// Test nested subtransactions unwind independently
#[test]
fn test_nested_subtransactions() {
    let (host, engine) = setup();
    let source = format!(
        "{}local ok = subtransaction(function()
            ins:execute({{1, 'outer'}})
            local inner_ok = subtransaction(function()
                ins:execute({{2, 'inner'}})
                error('inner only')
            end)
            assert(not inner_ok)
            ins:execute({{3, 'after'}})
        end)
        return ok",
        PREPARE
    );
    let f = host.create_routine(RoutineDefinition::new(0, "f", source, oid::BOOL));
    assert_eq!(text(&engine, f), Some(Datum::Bool(true)));

    let ids: Vec<_> = host.table_rows("items").into_iter().map(|r| r[0].clone()).collect();
    assert_eq!(ids, vec![Some(Datum::Int4(1)), Some(Datum::Int4(3))]);
    assert_eq!(host.savepoint_depth(), 0);
}

/// Test subtransaction refuses non-function arguments and calls outside a transaction
#[test]
fn test_argument_and_transaction_checks() {
    let (host, engine) = setup();
    let f = host.create_routine(RoutineDefinition::new(0, "f", "subtransaction(42)", oid::VOID));
    let err = engine.invoke(f, &[], CallContext::Function).unwrap_err();
    assert!(err.to_string().contains("expects a function"), "{}", err);

    host.set_in_transaction(false);
    let g = host.create_routine(RoutineDefinition::new(0, "g", "subtransaction(function() end)", oid::VOID));
    let err = engine.invoke(g, &[], CallContext::Function).unwrap_err();
    assert!(err.to_string().contains("out of transaction"), "{}", err);
}

/// Test a failed rollback poisons the engine
#[test]
fn test_double_fault_poisons_engine() {
    let (host, engine) = setup();
    let f = host.create_routine(RoutineDefinition::new(
        0,
        "f",
        "local ok, err = subtransaction(function() error('first') end) return 1",
        oid::INT4,
    ));
    let good = host.create_routine(RoutineDefinition::new(0, "good", "return 1", oid::INT4));

    host.fail_next_rollback();
    let err = engine.invoke(f, &[], CallContext::Function).unwrap_err();
    assert!(err.is_fatal(), "{:?}", err);
    assert!(engine.is_poisoned());

    let err = engine.invoke(good, &[], CallContext::Function).unwrap_err();
    assert!(matches!(err, Error::Fatal(_)));
    assert!(engine.validate(good).is_err());
}
