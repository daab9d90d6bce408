//! The `server` table: queries, plans and cursors for scripts.
//!
//! Every row a script sees comes back as a read-only [`TupleValue`]; the rows
//! of one batch share a single descriptor handle. Cursors register with the
//! cleanup registry so a transaction boundary marks them closed.

mod cursor;
mod plan;
mod resultset;

pub(crate) use cursor::Cursor;
pub(crate) use resultset::ResultSet;

use crate::host::{FetchDirection, QueryResult, StatementKind};
use crate::runtime::Runtime;
use crate::script::lua;
use crate::script::{TupleState, TupleValue};
use crate::tracker::DescriptorHandle;
use crate::types::Oid;
use crate::value::Datum;
use crate::{subxact, Error, Result};
use mlua::{Lua, Table, Value};
use plan::Plan;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Builds the `server` table.
pub(crate) fn create_api_table<'lua>(lua: &'lua Lua, rt: &Rc<Runtime>) -> Result<Table<'lua>> {
    let table = lua.create_table()?;

    let rt_execute = Rc::clone(rt);
    let execute = lua.create_function(
        move |lua, (sql, read_only, count): (String, Option<bool>, Option<i64>)| {
            let limit = count.unwrap_or(0).max(0) as usize;
            let result = rt_execute.host.execute(&sql, &[], read_only.unwrap_or(false), limit)?;
            result_value(lua, &rt_execute, result)
        },
    )?;
    table.raw_set("execute", execute)?;

    let rt_rows = Rc::clone(rt);
    let rows = lua.create_function(move |lua, sql: String| {
        let name = rt_rows.host.open_cursor(&sql, &[], None, true)?;
        Cursor::attach(&rt_rows, &name).into_rows(lua)
    })?;
    table.raw_set("rows", rows)?;

    let rt_find = Rc::clone(rt);
    let find = lua.create_function(move |lua, name: String| {
        if rt_find.host.cursor_exists(&name) {
            Ok(Value::UserData(lua.create_userdata(Cursor::attach(&rt_find, &name))?))
        } else {
            Ok(Value::Nil)
        }
    })?;
    table.raw_set("find", find)?;

    let rt_prepare = Rc::clone(rt);
    let prepare = lua.create_function(move |_, (sql, types): (String, Option<Table<'_>>)| {
        let arg_types = match types {
            Some(types) => resolve_types(&rt_prepare, &types)?,
            None => Vec::new(),
        };
        Ok(Plan::new(&rt_prepare, sql, arg_types))
    })?;
    table.raw_set("prepare", prepare)?;

    table.raw_set("subtransaction", subxact::create_function(lua, rt)?)?;
    Ok(table)
}

fn resolve_types(rt: &Runtime, types: &Table<'_>) -> Result<Vec<Oid>> {
    let count = types.raw_len();
    let mut oids = Vec::with_capacity(count);
    for i in 1..=count {
        let name: String = types.raw_get(i)?;
        let oid = rt
            .host
            .type_oid(&name)?
            .ok_or_else(|| Error::invalid_argument(format!("invalid type to plan: {}", name)))?;
        oids.push(oid);
    }
    Ok(oids)
}

/// Converts positional arguments from `args` to the declared parameter types.
pub(crate) fn bind_params(rt: &Runtime, types: &[Oid], args: Option<&Table<'_>>) -> Result<Vec<Option<Datum>>> {
    if types.is_empty() {
        return Ok(Vec::new());
    }
    let args = args.ok_or_else(|| Error::invalid_argument("plan arguments must be a table"))?;
    let m = rt.marshaler();
    let mut params = Vec::with_capacity(types.len());
    for (i, type_oid) in types.iter().enumerate() {
        let value: Value<'_> = args.raw_get(i + 1)?;
        let script = lua::pull(&value, 0, rt.options.max_table_depth)?;
        params.push(m.to_relational(&script, *type_oid, -1)?);
    }
    Ok(params)
}

/// A result set for row-returning statements that produced rows, else nil.
pub(crate) fn result_value<'lua>(lua: &'lua Lua, rt: &Rc<Runtime>, result: QueryResult) -> mlua::Result<Value<'lua>> {
    match result.rows {
        Some(rows) if result.kind == StatementKind::Select && !rows.is_empty() => {
            Ok(Value::UserData(lua.create_userdata(ResultSet::new(rt, rows))?))
        }
        _ => Ok(Value::Nil),
    }
}

struct RowIter {
    cursor: Cursor,
    queue: VecDeque<Vec<Option<Datum>>>,
    handle: Option<DescriptorHandle>,
    done: bool,
}

impl RowIter {
    fn next(&mut self, rt: &Rc<Runtime>) -> Result<Option<TupleValue>> {
        if self.queue.is_empty() && !self.done {
            let batch = rt.host.fetch(self.cursor.name(), FetchDirection::Forward, rt.options.fetch_size as i64)?;
            if batch.is_empty() {
                self.finish();
            } else {
                if self.handle.is_none() {
                    self.handle = Some(rt.arena.allocate(Rc::clone(&batch.descriptor)));
                }
                self.queue.extend(batch.rows);
            }
        }
        match (self.queue.pop_front(), &self.handle) {
            (Some(row), Some(handle)) => Ok(Some(TupleValue::with_handle(rt, handle.clone(), row, TupleState::ReadOnly))),
            _ => Ok(None),
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.handle = None;
        if let Err(e) = self.cursor.close() {
            log::debug!("closing exhausted cursor failed: {}", e);
        }
    }
}

/// Iterator function over a cursor, prefetching `fetch_size` rows at a
/// time. The cursor is closed once it runs dry.
fn row_iterator<'lua>(lua: &'lua Lua, rt: &Rc<Runtime>, cursor: Cursor) -> mlua::Result<Value<'lua>> {
    let state = RefCell::new(RowIter { cursor, queue: VecDeque::new(), handle: None, done: false });
    let rt = Rc::clone(rt);
    let f = lua.create_function(move |lua, ()| {
        let tuple = state.borrow_mut().next(&rt)?;
        match tuple {
            Some(tuple) => Ok(Value::UserData(lua.create_userdata(tuple)?)),
            None => Ok(Value::Nil),
        }
    })?;
    Ok(Value::Function(f))
}

