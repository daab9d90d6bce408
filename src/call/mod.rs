//! The call protocol: plain calls, set-returning calls and triggers.

mod srf;

pub use srf::{SetCall, SrfState};
pub(crate) use srf::{abandon, resume, ExecutionTable};

use crate::routine::RoutineEntry;
use crate::runtime::Runtime;
use crate::script::lua;
use crate::trigger::{self, TriggerData};
use crate::value::{Datum, RowValue};
use crate::{Error, Result};
use mlua::{Function, Lua, MultiValue, Value};
use std::rc::Rc;

/// How the host is calling a routine.
#[derive(Debug)]
pub enum CallContext<'a> {
    /// Single-value call.
    Function,
    /// One request of a set-returning call; the slot carries the state
    /// between requests.
    SetFunction(&'a mut SetCall),
    /// Trigger firing.
    Trigger(&'a TriggerData),
}

/// What a call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// Result of a single-value call (`None` is NULL).
    Value(Option<Datum>),
    /// Next row of a set-returning call; more may follow.
    Row(Option<Datum>),
    /// The set-returning call has no more rows.
    EndOfSet,
    /// Row produced by a trigger. `None` skips the operation for BEFORE
    /// ROW triggers and is the only outcome for other triggers.
    Trigger(Option<RowValue>),
}

/// Checks that the routine's kind matches the way it is called.
pub(crate) fn check_context(entry: &RoutineEntry, ctx: &CallContext<'_>) -> Result<()> {
    let is_trigger_call = matches!(ctx, CallContext::Trigger(_));
    if entry.is_trigger() != is_trigger_call {
        return Err(Error::protocol("trigger functions can only be called as triggers"));
    }
    match ctx {
        CallContext::Function if entry.returns_set => Err(Error::protocol(
            "set-valued function called in context that cannot accept a set",
        )),
        CallContext::SetFunction(_) if !entry.returns_set => {
            Err(Error::protocol(format!("function {} does not return a set", entry.name)))
        }
        _ => Ok(()),
    }
}

/// Marshals call arguments into Lua values.
pub(crate) fn push_args<'lua>(
    lua: &'lua Lua,
    rt: &Rc<Runtime>,
    entry: &RoutineEntry,
    args: &[Option<Datum>],
) -> Result<MultiValue<'lua>> {
    if args.len() != entry.arg_types.len() {
        return Err(Error::invalid_argument(format!(
            "function {} takes {} arguments, {} given",
            entry.name,
            entry.arg_types.len(),
            args.len()
        )));
    }
    let m = rt.marshaler();
    let mut values = Vec::with_capacity(args.len());
    for (datum, type_oid) in args.iter().zip(&entry.arg_types) {
        let script = m.to_script(datum.as_ref(), *type_oid)?;
        values.push(lua::push(lua, rt, &script)?);
    }
    Ok(MultiValue::from_vec(values))
}

/// Marshals one script result to the routine's result type.
pub(crate) fn pull_result(rt: &Runtime, entry: &RoutineEntry, value: &Value<'_>) -> Result<Option<Datum>> {
    let script = lua::pull(value, 0, rt.options.max_table_depth)?;
    rt.marshaler().to_relational(&script, entry.result_type, -1)
}

/// Runs a single-value call.
pub(crate) fn call_function(
    lua: &Lua,
    rt: &Rc<Runtime>,
    entry: &RoutineEntry,
    args: &[Option<Datum>],
) -> Result<CallOutcome> {
    let func: Function<'_> = lua.registry_value(&entry.function)?;
    let args = push_args(lua, rt, entry, args)?;
    match lua::protected_call(lua, rt, func, args)? {
        Ok(mut results) => {
            let first = results.pop_front().unwrap_or(Value::Nil);
            pull_result(rt, entry, &first).map(CallOutcome::Value)
        }
        Err(raised) => Err(lua::error_from_value(&raised)),
    }
}

/// Runs a trigger function. The `trigger` global is removed afterwards
/// whether or not the call succeeded.
pub(crate) fn call_trigger(lua: &Lua, rt: &Rc<Runtime>, entry: &RoutineEntry, data: &TriggerData) -> Result<CallOutcome> {
    let outcome = run_trigger(lua, rt, entry, data);
    trigger::clear(lua);
    outcome
}

fn run_trigger(lua: &Lua, rt: &Rc<Runtime>, entry: &RoutineEntry, data: &TriggerData) -> Result<CallOutcome> {
    let prepared = trigger::prepare(lua, rt, data)?;
    let func: Function<'_> = lua.registry_value(&entry.function)?;
    let mut args = Vec::with_capacity(data.args.len());
    for arg in &data.args {
        args.push(Value::String(lua.create_string(arg)?));
    }
    match lua::protected_call(lua, rt, func, MultiValue::from_vec(args))? {
        Ok(_) => trigger::result(rt, data, &prepared).map(CallOutcome::Trigger),
        Err(raised) => Err(lua::error_from_value(&raised)),
    }
}
