//! VM construction and the global environment scripts run in.

use crate::config::Options;
use crate::runtime::Runtime;
use crate::{spi, subxact, Error, Result};
use mlua::{Function, HookTriggers, Lua, LuaOptions, RegistryKey, StdLib, Table, Value, Variadic};
use std::rc::Rc;
use std::time::Instant;

/// Entry point of set-returning coroutines. A failing body ends the
/// coroutine with `false` and the raised value, unchanged, so structured
/// errors cross the resume boundary intact. A body that completes returns
/// nothing.
const SRF_ENTRY: &str = r#"
local pcall = pcall
return function(f, ...)
    local ok, err = pcall(f, ...)
    if not ok then
        return false, err
    end
end
"#;

const ERROR_TOSTRING: &str = "return function(e) return tostring(rawget(e, 'message')) end";

const OS_ALLOWED: [&str; 4] = ["date", "clock", "time", "difftime"];

const REMOVED_GLOBALS: [&str; 3] = ["dofile", "loadfile", "require"];

/// Registry values captured before any script runs.
pub(crate) struct VmKeys {
    pub pcall: RegistryKey,
    pub error_meta: RegistryKey,
    pub srf_entry: RegistryKey,
}

/// Creates a VM with the libraries allowed by `options`.
///
/// Trusted VMs get a reduced library set and an `os` table cut down to
/// time functions. Untrusted VMs get every safe library.
pub(crate) fn create_vm(options: &Options) -> Result<(Lua, VmKeys)> {
    let libs = if options.trusted {
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE | StdLib::OS
    } else {
        StdLib::ALL_SAFE
    };
    let lua = Lua::new_with(libs, LuaOptions::new())?;

    let keys = {
        let globals = lua.globals();
        let pcall: Function<'_> = globals.raw_get("pcall")?;

        let error_meta = lua.create_table()?;
        let tostring: Function<'_> = lua.load(ERROR_TOSTRING).set_name("=error_tostring").eval()?;
        error_meta.raw_set("__tostring", tostring)?;

        let srf_entry: Function<'_> = lua.load(SRF_ENTRY).set_name("=srf_entry").eval()?;

        VmKeys {
            pcall: lua.create_registry_value(pcall)?,
            error_meta: lua.create_registry_value(error_meta)?,
            srf_entry: lua.create_registry_value(srf_entry)?,
        }
    };

    if options.trusted {
        restrict(&lua)?;
    }
    Ok((lua, keys))
}

fn restrict(lua: &Lua) -> Result<()> {
    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.raw_set(name, Value::Nil)?;
    }
    if let Some(os) = globals.raw_get::<_, Option<Table<'_>>>("os")? {
        let reduced = lua.create_table()?;
        for name in OS_ALLOWED {
            reduced.raw_set(name, os.raw_get::<_, Value<'_>>(name)?)?;
        }
        globals.raw_set("os", reduced)?;
    }
    Ok(())
}

/// Installs the script-visible helpers and, for trusted VMs, freezes the
/// global table.
pub(crate) fn install(lua: &Lua, rt: &Rc<Runtime>) -> Result<()> {
    let globals = lua.globals();

    for (name, level) in [
        ("print", log::Level::Info),
        ("info", log::Level::Info),
        ("notice", log::Level::Info),
        ("log", log::Level::Debug),
        ("warning", log::Level::Warn),
    ] {
        let rt = Rc::clone(rt);
        let f = lua.create_function(move |lua, args: Variadic<Value<'_>>| {
            let tostring: Function<'_> = lua.globals().raw_get("tostring")?;
            let mut parts = Vec::with_capacity(args.len());
            for arg in args.iter() {
                let s: mlua::String<'_> = tostring.call(arg.clone())?;
                parts.push(s.to_string_lossy().into_owned());
            }
            rt.host.notice(level, &parts.join("\t"));
            Ok(())
        })?;
        globals.raw_set(name, f)?;
    }

    let setshared = lua.create_function(|lua, (name, value): (mlua::String<'_>, Option<Value<'_>>)| {
        lua.globals().raw_set(name, value.unwrap_or(Value::Nil))
    })?;
    globals.raw_set("setshared", setshared)?;
    globals.raw_set("shared", globals.clone())?;

    globals.raw_set("subtransaction", subxact::create_function(lua, rt)?)?;
    globals.raw_set("server", spi::create_api_table(lua, rt)?)?;

    if rt.options.timeout.is_some() {
        let weak = Rc::downgrade(rt);
        lua.set_hook(
            HookTriggers {
                every_nth_instruction: Some(1000),
                ..Default::default()
            },
            move |_lua, _debug| {
                let expired = weak
                    .upgrade()
                    .and_then(|rt| rt.deadline.get())
                    .map_or(false, |deadline| Instant::now() > deadline);
                if expired {
                    Err(mlua::Error::RuntimeError("Script execution timeout".to_string()))
                } else {
                    Ok(())
                }
            },
        );
    }

    if rt.options.trusted {
        let meta = lua.create_table()?;
        let deny = lua.create_function(|_, (_, key): (Value<'_>, mlua::String<'_>)| -> mlua::Result<()> {
            Err(Error::runtime(format!(
                "attempt to set global var '{}', use setshared",
                key.to_string_lossy()
            ))
            .into())
        })?;
        meta.raw_set("__newindex", deny)?;
        meta.raw_set("__metatable", false)?;
        globals.set_metatable(Some(meta));
    }
    Ok(())
}

/// Evaluates one init module and publishes a non-nil result as a global.
pub(crate) fn load_module(lua: &Lua, name: &str, source: &str) -> Result<()> {
    let chunk_name = format!("={}", name);
    let value: Value<'_> = lua
        .load(source)
        .set_name(chunk_name)
        .eval()
        .map_err(|e| Error::compile(format!("init module \"{}\" failed: {}", name, Error::from(e))))?;
    if !value.is_nil() {
        lua.globals().raw_set(name, value)?;
    }
    log::debug!("loaded init module {}", name);
    Ok(())
}
