use super::{bind_params, result_value, Cursor};
use crate::runtime::Runtime;
use crate::types::Oid;
use mlua::{MetaMethod, Table, UserData, UserDataMethods, Value};
use std::cell::Cell;
use std::rc::Rc;

/// A statement with declared parameter types.
pub(crate) struct Plan {
    rt: Rc<Runtime>,
    sql: String,
    arg_types: Vec<Oid>,
    saved: Cell<bool>,
}

impl Plan {
    pub fn new(rt: &Rc<Runtime>, sql: String, arg_types: Vec<Oid>) -> Self {
        Self { rt: Rc::clone(rt), sql, arg_types, saved: Cell::new(false) }
    }
}

impl UserData for Plan {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method(
            "execute",
            |lua, this, (args, read_only, count): (Option<Table<'lua>>, Option<bool>, Option<i64>)| {
                let params = bind_params(&this.rt, &this.arg_types, args.as_ref())?;
                let limit = count.unwrap_or(0).max(0) as usize;
                let result = this.rt.host.execute(&this.sql, &params, read_only.unwrap_or(false), limit)?;
                result_value(lua, &this.rt, result)
            },
        );

        methods.add_method(
            "getcursor",
            |lua, this, (args, read_only, name): (Option<Table<'lua>>, Option<bool>, Option<String>)| {
                let params = bind_params(&this.rt, &this.arg_types, args.as_ref())?;
                let portal =
                    this.rt.host.open_cursor(&this.sql, &params, name.as_deref(), read_only.unwrap_or(false))?;
                Ok(Value::UserData(lua.create_userdata(Cursor::attach(&this.rt, &portal))?))
            },
        );

        methods.add_method("rows", |lua, this, args: Option<Table<'lua>>| {
            let params = bind_params(&this.rt, &this.arg_types, args.as_ref())?;
            let portal = this.rt.host.open_cursor(&this.sql, &params, None, true)?;
            Cursor::attach(&this.rt, &portal).into_rows(lua)
        });

        // plans live as long as the script keeps them; saving only records it
        methods.add_method("save", |_, this, ()| {
            this.saved.set(true);
            Ok(true)
        });

        methods.add_method("issaved", |_, this, ()| Ok(this.saved.get()));

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(format!("plan: {}", this.sql)));
    }
}
