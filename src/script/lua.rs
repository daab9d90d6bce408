//! Moving values between [`ScriptValue`] and live Lua values.

use super::{ScriptKey, ScriptTable, ScriptValue, TupleValue};
use crate::error::ErrorReport;
use crate::runtime::Runtime;
use crate::spi::Cursor;
use crate::{Error, Result};
use bytes::Bytes;
use mlua::{Function, Lua, MultiValue, Table, Value};
use std::rc::Rc;

/// Creates the Lua form of `value`.
pub(crate) fn push<'lua>(lua: &'lua Lua, rt: &Rc<Runtime>, value: &ScriptValue) -> mlua::Result<Value<'lua>> {
    Ok(match value {
        ScriptValue::Nil => Value::Nil,
        ScriptValue::Boolean(b) => Value::Boolean(*b),
        ScriptValue::Integer(i) => Value::Integer(*i),
        ScriptValue::Number(n) => Value::Number(*n),
        ScriptValue::String(b) => Value::String(lua.create_string(&b[..])?),
        ScriptValue::Table(entries) => {
            let table = lua.create_table_with_capacity(0, entries.len())?;
            for (key, v) in entries {
                let key = match key {
                    ScriptKey::Integer(i) => Value::Integer(*i),
                    ScriptKey::String(s) => Value::String(lua.create_string(s)?),
                };
                table.raw_set(key, push(lua, rt, v)?)?;
            }
            Value::Table(table)
        }
        ScriptValue::Tuple(t) => Value::UserData(lua.create_userdata(t.clone())?),
        ScriptValue::Cursor(name) => Value::UserData(lua.create_userdata(Cursor::attach(rt, name))?),
    })
}

/// Reads a Lua value into a [`ScriptValue`]. Tables nested deeper than
/// `max_depth` are rejected, which also stops cyclic tables.
pub(crate) fn pull(value: &Value<'_>, depth: usize, max_depth: usize) -> Result<ScriptValue> {
    Ok(match value {
        Value::Nil => ScriptValue::Nil,
        Value::Boolean(b) => ScriptValue::Boolean(*b),
        Value::Integer(i) => ScriptValue::Integer(*i),
        Value::Number(n) => ScriptValue::Number(*n),
        Value::String(s) => ScriptValue::String(Bytes::copy_from_slice(s.as_bytes())),
        Value::Table(t) => {
            if depth >= max_depth {
                return Err(Error::conversion(format!(
                    "table nesting exceeds the maximum depth ({})",
                    max_depth
                )));
            }
            let mut entries = ScriptTable::new();
            for pair in t.clone().pairs::<Value, Value>() {
                let (k, v) = pair?;
                entries.insert(pull_key(&k)?, pull(&v, depth + 1, max_depth)?);
            }
            ScriptValue::Table(entries)
        }
        Value::UserData(ud) => {
            if let Ok(tuple) = ud.borrow::<TupleValue>() {
                ScriptValue::Tuple(tuple.clone())
            } else if let Ok(cursor) = ud.borrow::<Cursor>() {
                ScriptValue::Cursor(cursor.name().to_string())
            } else {
                return Err(Error::conversion("cannot convert userdata to a database value"));
            }
        }
        other => {
            return Err(Error::conversion(format!(
                "cannot convert {} to a database value",
                other.type_name()
            )))
        }
    })
}

fn pull_key(key: &Value<'_>) -> Result<ScriptKey> {
    match key {
        Value::Integer(i) => Ok(ScriptKey::Integer(*i)),
        Value::Number(n) if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n < i64::MAX as f64 => {
            Ok(ScriptKey::Integer(*n as i64))
        }
        Value::Number(n) => Ok(ScriptKey::String(n.to_string())),
        Value::String(s) => Ok(ScriptKey::String(s.to_str()?.to_string())),
        other => Err(Error::conversion(format!("table keys of type {} are not supported", other.type_name()))),
    }
}

/// Interprets a raised Lua error value.
///
/// Errors raised by host callbacks come back as the crate errors they
/// started as. Tables are read as structured reports.
pub(crate) fn error_from_value(value: &Value<'_>) -> Error {
    match value {
        Value::Error(err) => Error::from(err.clone()),
        Value::String(s) => Error::Runtime(ErrorReport::new(s.to_string_lossy().into_owned())),
        Value::Integer(i) => Error::Runtime(ErrorReport::new(i.to_string())),
        Value::Number(n) => Error::Runtime(ErrorReport::new(n.to_string())),
        Value::Table(t) => {
            let field = |name: &str| -> Option<String> {
                t.raw_get::<_, Option<mlua::String>>(name)
                    .ok()
                    .flatten()
                    .map(|s| s.to_string_lossy().into_owned())
            };
            let mut report = ErrorReport::new(field("message").unwrap_or_else(|| "no exception data".to_string()));
            report.detail = field("detail");
            report.hint = field("hint");
            report.context = field("context");
            report.code = field("sqlerrcode");
            Error::Runtime(report)
        }
        Value::Nil => Error::runtime("nil error value"),
        other => Error::runtime(format!("(error object is a {} value)", other.type_name())),
    }
}

/// Builds the script form of an error report.
pub(crate) fn report_table<'lua>(lua: &'lua Lua, rt: &Runtime, report: &ErrorReport) -> mlua::Result<Table<'lua>> {
    let table = lua.create_table()?;
    table.raw_set("message", report.message.as_str())?;
    if let Some(detail) = &report.detail {
        table.raw_set("detail", detail.as_str())?;
    }
    if let Some(hint) = &report.hint {
        table.raw_set("hint", hint.as_str())?;
    }
    if let Some(context) = &report.context {
        table.raw_set("context", context.as_str())?;
    }
    if let Some(code) = &report.code {
        table.raw_set("sqlerrcode", code.as_str())?;
    }
    let meta: Table<'_> = lua.registry_value(&rt.error_meta)?;
    table.set_metatable(Some(meta));
    Ok(table)
}

/// Calls `func` through the VM's own `pcall`, so the raised value comes
/// back untouched instead of being flattened into an `mlua::Error`.
pub(crate) fn protected_call<'lua>(
    lua: &'lua Lua,
    rt: &Runtime,
    func: Function<'lua>,
    args: MultiValue<'lua>,
) -> Result<std::result::Result<MultiValue<'lua>, Value<'lua>>> {
    let pcall: Function<'_> = lua.registry_value(&rt.pcall)?;
    let mut args = args;
    args.push_front(Value::Function(func));
    let mut results: MultiValue<'_> = pcall.call(args)?;
    let ok = matches!(results.pop_front(), Some(Value::Boolean(true)));
    if ok {
        Ok(Ok(results))
    } else {
        Ok(Err(results.pop_front().unwrap_or(Value::Nil)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_normalizes_keys() {
        let lua = Lua::new();
        let v: Value<'_> = lua.load("return { 'a', [2.0] = 'b', [0.5] = 'c', x = { y = true } }").eval().unwrap();
        let script = pull(&v, 0, 8).unwrap();
        let expected = ScriptValue::Table(
            vec![
                (ScriptKey::Integer(1), ScriptValue::from("a")),
                (ScriptKey::Integer(2), ScriptValue::from("b")),
                (ScriptKey::String("0.5".into()), ScriptValue::from("c")),
                (ScriptKey::String("x".into()), ScriptValue::table(vec![("y", ScriptValue::Boolean(true))])),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(script, expected);
    }

    #[test]
    fn test_pull_rejects_cycles_and_functions() {
        let lua = Lua::new();
        let v: Value<'_> = lua.load("local t = {} t.self = t return t").eval().unwrap();
        assert!(matches!(pull(&v, 0, 16), Err(Error::Conversion(_))));

        let v: Value<'_> = lua.load("return { f = print }").eval().unwrap();
        assert!(matches!(pull(&v, 0, 16), Err(Error::Conversion(_))));

        let v: Value<'_> = lua.load("return { [true] = 1 }").eval().unwrap();
        assert!(matches!(pull(&v, 0, 16), Err(Error::Conversion(_))));
    }

    #[test]
    fn test_error_from_table() {
        let lua = Lua::new();
        let v: Value<'_> = lua
            .load("return { message = 'boom', hint = 'try again', sqlerrcode = 'P0001' }")
            .eval()
            .unwrap();
        match error_from_value(&v) {
            Error::Runtime(report) => {
                assert_eq!(report.message, "boom");
                assert_eq!(report.hint.as_deref(), Some("try again"));
                assert_eq!(report.code.as_deref(), Some("P0001"));
                assert_eq!(report.detail, None);
            }
            other => panic!("unexpected {:?}", other),
        }

        let v: Value<'_> = lua.load("return {}").eval().unwrap();
        assert!(matches!(error_from_value(&v), Error::Runtime(r) if r.message == "no exception data"));
    }
}
