// Trigger Tests for PL/Lua
// These tests fire trigger routines the way a host would and check the rows they produce

use pllua::host::MemoryHost;
use pllua::routine::RoutineDefinition;
use pllua::types::{oid, Attribute};
use pllua::{
    CallContext, CallOutcome, Datum, Engine, Error, Options, Relation, RowValue, TriggerData, TriggerLevel,
    TriggerOperation, TriggerWhen,
};
use std::rc::Rc;

struct Fixture {
    host: Rc<MemoryHost>,
    engine: Engine,
    relation: Relation,
}

fn setup() -> Fixture {
    env_logger::try_init().ok();
    let host = Rc::new(MemoryHost::new());
    let oid = host.define_table(
        "accounts",
        vec![Attribute::new("id", oid::INT4), Attribute::new("owner", oid::TEXT), Attribute::new("balance", oid::INT8)],
    );
    let relation = Relation::new(oid, "accounts", host.table_descriptor("accounts").unwrap());
    let engine = Engine::new(host.clone(), Options::default()).unwrap();
    Fixture { host, engine, relation }
}

impl Fixture {
    fn trigger(&self, source: &str) -> u32 {
        self.host.create_routine(RoutineDefinition::new(0, "trg", source, oid::TRIGGER))
    }

    fn row(&self, id: i32, owner: &str, balance: i64) -> RowValue {
        RowValue::new(
            Rc::clone(&self.relation.descriptor),
            vec![Some(Datum::Int4(id)), Some(Datum::Text(owner.into())), Some(Datum::Int8(balance))],
        )
        .unwrap()
    }

    fn fire(&self, routine: u32, data: &TriggerData) -> pllua::Result<Option<RowValue>> {
        match self.engine.invoke(routine, &[], CallContext::Trigger(data))? {
            CallOutcome::Trigger(row) => Ok(row),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    fn data(&self, when: TriggerWhen, level: TriggerLevel, op: TriggerOperation) -> TriggerData {
        TriggerData::new("accounts_trg", when, level, op, self.relation.clone())
    }
}

/// Test an untouched row comes back exactly as it went in
#[test]
fn test_before_insert_passthrough() {
    let fx = setup();
    let f = fx.trigger("assert(trigger.operation == 'insert' and trigger.when == 'before')");
    let row = fx.row(1, "ann", 10);
    let data = fx
        .data(TriggerWhen::Before, TriggerLevel::Row, TriggerOperation::Insert)
        .with_trigger_row(row.clone());
    assert_eq!(fx.fire(f, &data).unwrap(), Some(row));
}

/// Test field writes on trigger.row modify the stored row
#[test]
fn test_before_insert_modifies_row() {
    let fx = setup();
    let f = fx.trigger("trigger.row.owner = string.upper(trigger.row.owner) trigger.row.balance = nil");
    let data = fx
        .data(TriggerWhen::Before, TriggerLevel::Row, TriggerOperation::Insert)
        .with_trigger_row(fx.row(1, "ann", 10));

    let out = fx.fire(f, &data).unwrap().unwrap();
    assert_eq!(out.values, vec![Some(Datum::Int4(1)), Some(Datum::Text("ANN".into())), None]);
}

/// Test setting trigger.row to nil skips the operation
#[test]
fn test_before_delete_skip() {
    let fx = setup();
    let f = fx.trigger("if trigger.row.balance > 0 then trigger.row = nil end");
    let data = fx
        .data(TriggerWhen::Before, TriggerLevel::Row, TriggerOperation::Delete)
        .with_trigger_row(fx.row(1, "ann", 10));
    assert_eq!(fx.fire(f, &data).unwrap(), None);
}

/// Test update triggers see the old row read-only and the new row writable
#[test]
fn test_before_update_rows() {
    let fx = setup();
    let f = fx.trigger(
        "local ok = pcall(function() trigger.old.balance = 0 end)
        assert(not ok)
        trigger.row.balance = trigger.row.balance + trigger.old.balance",
    );
    let data = fx
        .data(TriggerWhen::Before, TriggerLevel::Row, TriggerOperation::Update)
        .with_trigger_row(fx.row(1, "ann", 10))
        .with_new_row(fx.row(1, "ann", 5));

    let out = fx.fire(f, &data).unwrap().unwrap();
    assert_eq!(out.values[2], Some(Datum::Int8(15)));
}

/// Test a replacement table is converted with the relation's layout
#[test]
fn test_before_insert_table_replacement() {
    let fx = setup();
    let f = fx.trigger("trigger.row = { id = trigger.row.id, owner = 'system' }");
    let data = fx
        .data(TriggerWhen::Before, TriggerLevel::Row, TriggerOperation::Insert)
        .with_trigger_row(fx.row(4, "ann", 10));

    let out = fx.fire(f, &data).unwrap().unwrap();
    assert_eq!(out.values, vec![Some(Datum::Int4(4)), Some(Datum::Text("system".into())), None]);
}

/// Test writing an unknown column is an error
#[test]
fn test_unknown_column_write() {
    let fx = setup();
    let f = fx.trigger("trigger.row.nickname = 'x'");
    let data = fx
        .data(TriggerWhen::Before, TriggerLevel::Row, TriggerOperation::Insert)
        .with_trigger_row(fx.row(1, "ann", 10));
    let err = fx.fire(f, &data).unwrap_err();
    assert!(err.to_string().contains("nickname"), "{}", err);
}

/// Test after and statement triggers always produce no row and see their arguments
#[test]
fn test_after_and_statement_triggers() {
    let fx = setup();
    let f = fx.trigger(
        "local a, b = ...
        print(trigger.level, trigger.relation.name, trigger.relation.attributes.balance, a, b, trigger.row ~= nil)",
    );

    let after = fx
        .data(TriggerWhen::After, TriggerLevel::Row, TriggerOperation::Insert)
        .with_trigger_row(fx.row(1, "ann", 10))
        .with_args(["x", "y"]);
    assert_eq!(fx.fire(f, &after).unwrap(), None);

    let statement = fx.data(TriggerWhen::Before, TriggerLevel::Statement, TriggerOperation::Truncate);
    assert_eq!(fx.fire(f, &statement).unwrap(), None);

    let notices: Vec<String> = fx.host.notices().into_iter().map(|(_, m)| m).collect();
    assert_eq!(notices[0], "row\taccounts\t3\tx\ty\ttrue");
    assert_eq!(notices[1], "statement\taccounts\t3\tnil\tnil\tfalse");
}

/// Test the trigger global is removed after the call, even on failure
#[test]
fn test_trigger_global_cleared() {
    let fx = setup();
    let failing = fx.trigger("error('refused')");
    let data = fx
        .data(TriggerWhen::Before, TriggerLevel::Row, TriggerOperation::Insert)
        .with_trigger_row(fx.row(1, "ann", 10));
    assert!(fx.fire(failing, &data).is_err());

    let check = fx.host.create_routine(RoutineDefinition::new(0, "check_trigger", "return trigger == nil", oid::BOOL));
    assert_eq!(
        fx.engine.invoke(check, &[], CallContext::Function).unwrap(),
        CallOutcome::Value(Some(Datum::Bool(true)))
    );
}

/// Test trigger routines cannot be called as functions and vice versa
#[test]
fn test_trigger_context_mismatch() {
    let fx = setup();
    let trg = fx.trigger("return");
    assert!(matches!(fx.engine.invoke(trg, &[], CallContext::Function), Err(Error::Protocol(_))));

    let plain = fx.host.create_routine(RoutineDefinition::new(0, "plain", "return 1", oid::INT4));
    let data = fx.data(TriggerWhen::After, TriggerLevel::Statement, TriggerOperation::Insert);
    assert!(matches!(
        fx.engine.invoke(plain, &[], CallContext::Trigger(&data)),
        Err(Error::Protocol(_))
    ));
}
