//! Trigger invocation.
//!
//! While a trigger function runs, the global `trigger` describes the firing
//! event:
//!
//! | field       | value                                                   |
//! |-------------|---------------------------------------------------------|
//! | `name`      | trigger name                                            |
//! | `when`      | `"before"`, `"after"` or `"instead"`                    |
//! | `level`     | `"row"` or `"statement"`                                |
//! | `operation` | `"insert"`, `"update"`, `"delete"` or `"truncate"`      |
//! | `relation`  | `{ name, oid, attributes = { column = position } }`     |
//! | `row`       | writable tuple: the new row for insert and update, the old row for delete |
//! | `old`       | read-only old row, for update                           |
//!
//! For BEFORE ROW triggers, whatever is left in `trigger.row` becomes the
//! result: nil skips the operation for this row.

use crate::runtime::Runtime;
use crate::script::{lua, ScriptValue, TupleState, TupleValue};
use crate::types::{Oid, RowDescriptor};
use crate::value::RowValue;
use crate::{Error, Result};
use mlua::{Lua, Table, Value};
use std::fmt;
use std::rc::Rc;

/// Global the trigger record is published under.
pub const TRIGGER_GLOBAL: &str = "trigger";

/// When a trigger fires relative to the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerWhen {
    /// BEFORE
    Before,
    /// AFTER
    After,
    /// INSTEAD OF
    InsteadOf,
}

/// Trigger granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerLevel {
    /// FOR EACH ROW
    Row,
    /// FOR EACH STATEMENT
    Statement,
}

/// Operation that fired the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOperation {
    /// INSERT
    Insert,
    /// UPDATE
    Update,
    /// DELETE
    Delete,
    /// TRUNCATE
    Truncate,
}

impl fmt::Display for TriggerWhen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerWhen::Before => "before",
            TriggerWhen::After => "after",
            TriggerWhen::InsteadOf => "instead",
        })
    }
}

impl fmt::Display for TriggerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerLevel::Row => "row",
            TriggerLevel::Statement => "statement",
        })
    }
}

impl fmt::Display for TriggerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerOperation::Insert => "insert",
            TriggerOperation::Update => "update",
            TriggerOperation::Delete => "delete",
            TriggerOperation::Truncate => "truncate",
        })
    }
}

/// The relation a trigger fired on.
#[derive(Debug, Clone)]
pub struct Relation {
    /// Relation identifier.
    pub oid: Oid,
    /// Relation name.
    pub name: String,
    /// Row layout.
    pub descriptor: Rc<RowDescriptor>,
}

impl Relation {
    /// Describes a relation.
    pub fn new(oid: Oid, name: impl Into<String>, descriptor: Rc<RowDescriptor>) -> Self {
        Self { oid, name: name.into(), descriptor }
    }
}

/// Firing context supplied by the host.
#[derive(Debug, Clone)]
pub struct TriggerData {
    /// Trigger name.
    pub name: String,
    /// Timing.
    pub when: TriggerWhen,
    /// Granularity.
    pub level: TriggerLevel,
    /// Firing operation.
    pub operation: TriggerOperation,
    /// Target relation.
    pub relation: Relation,
    /// The row being inserted or deleted, or the old row of an update.
    pub trigger_row: Option<RowValue>,
    /// The new row of an update.
    pub new_row: Option<RowValue>,
    /// Arguments from the trigger definition.
    pub args: Vec<String>,
}

impl TriggerData {
    /// Creates a context without rows or arguments.
    pub fn new(
        name: impl Into<String>,
        when: TriggerWhen,
        level: TriggerLevel,
        operation: TriggerOperation,
        relation: Relation,
    ) -> Self {
        Self {
            name: name.into(),
            when,
            level,
            operation,
            relation,
            trigger_row: None,
            new_row: None,
            args: Vec::new(),
        }
    }

    /// Sets the row being inserted or deleted (the old row for updates).
    pub fn with_trigger_row(mut self, row: RowValue) -> Self {
        self.trigger_row = Some(row);
        self
    }

    /// Sets the new row of an update.
    pub fn with_new_row(mut self, row: RowValue) -> Self {
        self.new_row = Some(row);
        self
    }

    /// Sets the trigger arguments.
    pub fn with_args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// True when the value left in `trigger.row` is the result.
    pub fn returns_row(&self) -> bool {
        self.when == TriggerWhen::Before && self.level == TriggerLevel::Row
    }

    /// The row scripts see as `trigger.row`.
    fn script_row(&self) -> Option<&RowValue> {
        match self.operation {
            TriggerOperation::Update => self.new_row.as_ref(),
            _ => self.trigger_row.as_ref(),
        }
    }
}

/// The published trigger record and the tuple it started with.
pub(crate) struct Prepared<'lua> {
    table: Table<'lua>,
    row: Option<TupleValue>,
}

/// Publishes the `trigger` global for `data`.
pub(crate) fn prepare<'lua>(lua: &'lua Lua, rt: &Rc<Runtime>, data: &TriggerData) -> Result<Prepared<'lua>> {
    let table = lua.create_table()?;
    table.raw_set("name", data.name.as_str())?;
    table.raw_set("when", data.when.to_string())?;
    table.raw_set("level", data.level.to_string())?;
    table.raw_set("operation", data.operation.to_string())?;
    table.raw_set("relation", relation_table(lua, &data.relation)?)?;

    let mut row = None;
    if data.level == TriggerLevel::Row {
        if let Some(current) = data.script_row() {
            let tuple = TupleValue::new(rt, current.clone(), TupleState::Writable);
            table.raw_set("row", tuple.clone())?;
            row = Some(tuple);
        }
        if data.operation == TriggerOperation::Update {
            if let Some(old) = &data.trigger_row {
                table.raw_set("old", TupleValue::new(rt, old.clone(), TupleState::ReadOnly))?;
            }
        }
    }

    lua.globals().raw_set(TRIGGER_GLOBAL, table.clone())?;
    Ok(Prepared { table, row })
}

/// Relation tables are built once per relation and kept in the registry.
fn relation_table<'lua>(lua: &'lua Lua, relation: &Relation) -> Result<Table<'lua>> {
    let key = format!("pllua.relation.{}", relation.oid);
    if let Some(cached) = lua.named_registry_value::<Option<Table<'_>>>(&key)? {
        return Ok(cached);
    }
    let attributes = lua.create_table()?;
    for (i, attr) in relation.descriptor.attributes.iter().enumerate() {
        attributes.raw_set(attr.name.as_str(), i as i64 + 1)?;
    }
    let table = lua.create_table()?;
    table.raw_set("name", relation.name.as_str())?;
    table.raw_set("oid", relation.oid as i64)?;
    table.raw_set("attributes", attributes)?;
    lua.set_named_registry_value(&key, table.clone())?;
    Ok(table)
}

/// Reads the row a BEFORE ROW trigger produced.
pub(crate) fn result(rt: &Rc<Runtime>, data: &TriggerData, prepared: &Prepared<'_>) -> Result<Option<RowValue>> {
    if !data.returns_row() {
        return Ok(None);
    }
    let layout = &data.relation.descriptor;
    let value: Value<'_> = prepared.table.raw_get("row")?;
    match &value {
        Value::Nil => Ok(None),
        Value::UserData(ud) if ud.is::<TupleValue>() => {
            let tuple = ud.borrow::<TupleValue>()?.clone();
            let original = prepared.row.as_ref().map_or(false, |row| *row == tuple);
            if original && tuple.state() != TupleState::Modified {
                return Ok(data.script_row().cloned());
            }
            rt.marshaler().to_row(&ScriptValue::Tuple(tuple), layout).map(Some)
        }
        Value::Table(_) => {
            let script = lua::pull(&value, 0, rt.options.max_table_depth)?;
            rt.marshaler().to_row(&script, layout).map(Some)
        }
        other => Err(Error::conversion(format!(
            "trigger row must be a tuple, a table or nil, not {}",
            other.type_name()
        ))),
    }
}

/// Removes the `trigger` global.
pub(crate) fn clear(lua: &Lua) {
    if let Err(e) = lua.globals().raw_set(TRIGGER_GLOBAL, Value::Nil) {
        log::warn!("could not clear trigger global: {}", e);
    }
}
