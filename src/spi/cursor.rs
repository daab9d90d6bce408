use super::{row_iterator, ResultSet};
use crate::host::{FetchDirection, RowSet};
use crate::runtime::Runtime;
use crate::tracker::ResourceId;
use crate::{Error, Result};
use mlua::{Lua, MetaMethod, UserData, UserDataMethods, Value};
use std::cell::Cell;
use std::rc::Rc;

/// Script handle on an open portal.
///
/// The handle is registered with the cleanup registry for as long as it is
/// alive; draining the registry marks it closed, after which every method
/// fails instead of touching a portal the host has already dropped.
pub(crate) struct Cursor {
    rt: Rc<Runtime>,
    name: String,
    closed: Rc<Cell<bool>>,
    resource: Cell<Option<ResourceId>>,
}

impl Cursor {
    /// Wraps the portal called `name`.
    pub fn attach(rt: &Rc<Runtime>, name: &str) -> Self {
        let closed = Rc::new(Cell::new(false));
        let flag = Rc::clone(&closed);
        let portal = name.to_string();
        let resource = rt.registry.register(move || {
            log::debug!("transaction end closed cursor {}", portal);
            flag.set(true);
        });
        Self { rt: Rc::clone(rt), name: name.to_string(), closed, resource: Cell::new(Some(resource)) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.get() {
            Err(Error::runtime(format!("cursor \"{}\" is closed", self.name)))
        } else {
            Ok(())
        }
    }

    fn fetch(&self, direction: FetchDirection, count: i64) -> Result<Option<RowSet>> {
        self.check_open()?;
        let rows = self.rt.host.fetch(&self.name, direction, count)?;
        Ok(if rows.is_empty() { None } else { Some(rows) })
    }

    fn reposition(&self, direction: FetchDirection, count: i64) -> Result<()> {
        self.check_open()?;
        self.rt.host.move_cursor(&self.name, direction, count)
    }

    /// Closes the portal. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.replace(true) {
            return Ok(());
        }
        self.unregister();
        self.rt.host.close_cursor(&self.name)
    }

    fn unregister(&self) {
        if let Some(id) = self.resource.take() {
            self.rt.registry.unregister(id);
        }
    }

    fn rows_value<'lua>(&self, lua: &'lua Lua, rows: Option<RowSet>) -> mlua::Result<Value<'lua>> {
        match rows {
            Some(rows) => Ok(Value::UserData(lua.create_userdata(ResultSet::new(&self.rt, rows))?)),
            None => Ok(Value::Nil),
        }
    }

    /// Row iterator over the rest of this portal.
    pub fn into_rows<'lua>(self, lua: &'lua Lua) -> mlua::Result<Value<'lua>> {
        let rt = Rc::clone(&self.rt);
        row_iterator(lua, &rt, self)
    }
}

fn position_direction(relative: Option<bool>) -> FetchDirection {
    if relative.unwrap_or(false) {
        FetchDirection::Relative
    } else {
        FetchDirection::Absolute
    }
}

impl UserData for Cursor {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("fetch", |lua, this, count: Option<i64>| {
            let rows = this.fetch(FetchDirection::Forward, count.unwrap_or(i64::MAX))?;
            this.rows_value(lua, rows)
        });

        methods.add_method("move", |_, this, count: Option<i64>| {
            this.reposition(FetchDirection::Forward, count.unwrap_or(0))?;
            Ok(())
        });

        methods.add_method("posfetch", |lua, this, (pos, relative): (i64, Option<bool>)| {
            let rows = this.fetch(position_direction(relative), pos)?;
            this.rows_value(lua, rows)
        });

        methods.add_method("posmove", |_, this, (pos, relative): (i64, Option<bool>)| {
            this.reposition(position_direction(relative), pos)?;
            Ok(())
        });

        methods.add_method("close", |_, this, ()| {
            this.close()?;
            Ok(())
        });

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(format!("cursor: {}", this.name)));
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.unregister();
    }
}
