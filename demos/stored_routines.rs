//! Example: Stored Routines Against an In-Memory Host
//!
//! This example walks through the pieces a host database drives: a plain
//! function, a set-returning function, a BEFORE ROW trigger and a
//! subtransaction that rolls back part of its work.

use pllua::host::MemoryHost;
use pllua::routine::RoutineDefinition;
use pllua::types::{oid, Attribute};
use pllua::{
    CallContext, CallOutcome, Datum, Engine, Options, Relation, RowValue, SetCall, TriggerData, TriggerLevel,
    TriggerOperation, TriggerWhen, XactEvent,
};
use std::rc::Rc;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let host = Rc::new(MemoryHost::new());
    let accounts = host.define_table(
        "accounts",
        vec![Attribute::new("id", oid::INT4), Attribute::new("owner", oid::TEXT), Attribute::new("balance", oid::INT8)],
    );
    host.define_select("select * from accounts", "accounts");
    host.define_insert("insert into accounts values ($1, $2, $3)", "accounts");

    let engine = Engine::new(host.clone(), Options::default())?;

    println!("=== PL/Lua Stored Routines Example ===\n");

    // Example 1: plain function
    println!("Example 1: Plain function");
    println!("-----------------------------------");
    let greet = host.create_routine(
        RoutineDefinition::new(0, "greet", "return 'hello, ' .. who", oid::TEXT).arg("who", oid::TEXT),
    );
    let outcome = engine.invoke(greet, &[Some(Datum::Text("world".into()))], CallContext::Function)?;
    println!("greet('world') = {:?}\n", outcome);

    // Example 2: trigger that normalizes rows before insert
    println!("Example 2: BEFORE ROW trigger");
    println!("-----------------------------------");
    let normalize = host.create_routine(RoutineDefinition::new(
        0,
        "normalize",
        "trigger.row.owner = string.lower(trigger.row.owner)
         if trigger.row.balance == nil then trigger.row.balance = 0 end",
        oid::TRIGGER,
    ));
    let descriptor = host.table_descriptor("accounts")?;
    let relation = Relation::new(accounts, "accounts", Rc::clone(&descriptor));
    for (id, owner) in [(1, "Alice"), (2, "BOB")] {
        let row = RowValue::new(
            Rc::clone(&descriptor),
            vec![Some(Datum::Int4(id)), Some(Datum::Text(owner.into())), None],
        )?;
        let data = TriggerData::new(
            "normalize_accounts",
            TriggerWhen::Before,
            TriggerLevel::Row,
            TriggerOperation::Insert,
            relation.clone(),
        )
        .with_trigger_row(row);
        if let CallOutcome::Trigger(Some(stored)) = engine.invoke(normalize, &[], CallContext::Trigger(&data))? {
            println!("storing {:?}", stored.values);
            host.insert_row("accounts", stored.values)?;
        }
    }
    println!();

    // Example 3: subtransaction that rolls back a failed transfer
    println!("Example 3: Subtransaction");
    println!("-----------------------------------");
    let transfer = host.create_routine(RoutineDefinition::new(
        0,
        "open_account",
        "local ins = server.prepare('insert into accounts values ($1, $2, $3)', {'integer', 'text', 'bigint'})
         local ok, err = subtransaction(function()
             ins:execute({3, 'carol', 100})
             error('credit check failed')
         end)
         if not ok then print('rolled back: ' .. tostring(err)) end
         return ok",
        oid::BOOL,
    ));
    let outcome = engine.invoke(transfer, &[], CallContext::Function)?;
    println!("open_account() = {:?}, rows now {}\n", outcome, host.table_rows("accounts").len());

    // Example 4: set-returning function over a query
    println!("Example 4: Set-returning function");
    println!("-----------------------------------");
    let owners = host.create_routine(
        RoutineDefinition::new(
            0,
            "owners",
            "for row in server.rows('select * from accounts') do coroutine.yield(row.owner) end",
            oid::TEXT,
        )
        .returns_set(true),
    );
    let mut call = SetCall::new();
    while let CallOutcome::Row(owner) = engine.invoke(owners, &[], CallContext::SetFunction(&mut call))? {
        println!("owner: {:?}", owner);
    }

    let cleaned = engine.on_transaction_event(XactEvent::Commit);
    println!("\ncommit ran {} cleanup(s)", cleaned);

    for (level, message) in host.notices() {
        println!("[{}] {}", level, message);
    }
    Ok(())
}
