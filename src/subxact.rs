//! Savepoint-protected calls from scripts.
//!
//! `subtransaction(f, ...)` runs `f` inside a host savepoint and a fresh
//! descriptor frame. It returns `true, ...` on success. On failure it rolls
//! the savepoint back and returns `false, err`, where `err` is the raised
//! value itself, or a structured report table for errors that started on the
//! host side. A failure of the rollback itself is a double fault: the engine
//! is poisoned and the error keeps propagating.

use crate::runtime::Runtime;
use crate::script::lua;
use crate::tracker::FrameExit;
use crate::{Error, Result};
use mlua::{Function, Lua, MultiValue, Value};
use std::rc::Rc;

/// Creates the script-visible `subtransaction` function.
pub(crate) fn create_function<'lua>(lua: &'lua Lua, rt: &Rc<Runtime>) -> Result<Function<'lua>> {
    let rt = Rc::clone(rt);
    let f = lua.create_function(move |lua, args: MultiValue<'_>| run_protected(lua, &rt, args))?;
    Ok(f)
}

fn run_protected<'lua>(lua: &'lua Lua, rt: &Rc<Runtime>, mut args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    let func = match args.pop_front() {
        Some(Value::Function(f)) => f,
        _ => return Err(Error::invalid_argument("subtransaction expects a function as its first argument").into()),
    };
    if !rt.host.in_transaction() {
        return Err(Error::protocol("cannot start a subtransaction out of transaction").into());
    }

    let frame = rt.arena.push_frame();
    let savepoint = match rt.host.begin_savepoint() {
        Ok(id) => id,
        Err(e) => {
            rt.arena.pop_frame(frame, FrameExit::Normal)?;
            return Err(e.into());
        }
    };
    log::trace!("subtransaction {:?} started", savepoint);

    let outcome = match lua::protected_call(lua, rt, func, args) {
        Ok(outcome) => outcome,
        Err(e) => Err(Value::Error(e.into())),
    };

    match outcome {
        Ok(mut results) => {
            let released = rt.host.release_savepoint(savepoint);
            rt.arena.pop_frame(frame, FrameExit::Normal)?;
            released?;
            results.push_front(Value::Boolean(true));
            Ok(results)
        }
        Err(raised) => {
            let error = lua::error_from_value(&raised);
            if error.is_fatal() {
                rt.arena.pop_frame(frame, FrameExit::Aborted)?;
                return Err(error.into());
            }
            if let Err(fault) = rt.host.rollback_savepoint(savepoint) {
                rt.poisoned.set(true);
                log::error!("rollback of subtransaction failed while handling \"{}\": {}", error, fault);
                if let Err(e) = rt.arena.pop_frame(frame, FrameExit::Aborted) {
                    log::error!("{}", e);
                }
                return Err(Error::Fatal(format!("double fault in subtransaction: {}", fault)).into());
            }
            rt.arena.pop_frame(frame, FrameExit::Aborted)?;
            log::debug!("subtransaction {:?} rolled back: {}", savepoint, error);

            let value = match raised {
                Value::Error(_) => Value::Table(lua::report_table(lua, rt, &error.report())?),
                other => other,
            };
            Ok(MultiValue::from_vec(vec![Value::Boolean(false), value]))
        }
    }
}
