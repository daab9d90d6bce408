use super::{build_chunk, RoutineEntry};
use crate::host::Host;
use crate::types::{oid, Oid, TypeCache};
use crate::{Error, Result};
use mlua::{Function, Lua};
use std::collections::HashMap;
use std::rc::Rc;

/// Compiled routines keyed by routine identifier.
///
/// An entry is reused only while the catalog row it was compiled from is
/// unchanged; any difference in [`RowStamp`](super::RowStamp) forces a
/// recompile and releases the stale function from the VM registry.
#[derive(Debug, Default)]
pub struct RoutineCache {
    entries: HashMap<Oid, Rc<RoutineEntry>>,
    compiles: u64,
}

impl RoutineCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the compiled entry for `routine`, compiling it when missing or
    /// stale. On failure any previously cached entry is left untouched.
    pub fn lookup_or_compile<H: Host + ?Sized>(
        &mut self,
        lua: &Lua,
        host: &H,
        types: &TypeCache,
        chunk_name: &str,
        routine: Oid,
    ) -> Result<Rc<RoutineEntry>> {
        let def = host
            .lookup_routine(routine)?
            .ok_or_else(|| Error::host(format!("cache lookup failed for function {}", routine)))?;

        if let Some(entry) = self.entries.get(&routine) {
            if entry.stamp == def.stamp {
                return Ok(Rc::clone(entry));
            }
            log::debug!(
                "routine {} ({}) is stale: cached {}, catalog {}",
                def.name,
                routine,
                entry.stamp,
                def.stamp
            );
        }

        for arg in &def.arg_types {
            types.get(host, *arg)?.check_argument()?;
        }
        types.get(host, def.result_type)?.check_result()?;
        if def.result_type == oid::TRIGGER && !def.arg_types.is_empty() {
            return Err(Error::compile("trigger functions cannot have declared arguments"));
        }

        let (chunk, variadic) = build_chunk(&def);
        let function = compile(lua, &chunk, chunk_name)?;
        let entry = Rc::new(RoutineEntry {
            oid: def.oid,
            name: def.name,
            stamp: def.stamp,
            arg_types: def.arg_types,
            result_type: def.result_type,
            returns_set: def.returns_set,
            variadic,
            function: lua.create_registry_value(function)?,
        });

        if self.entries.insert(routine, Rc::clone(&entry)).is_some() {
            lua.expire_registry_values();
        }
        self.compiles += 1;
        log::debug!("compiled routine {} ({}) at {}", entry.name, routine, entry.stamp);
        Ok(entry)
    }

    /// Drops the entry for `routine`, if any.
    pub fn invalidate(&mut self, lua: &Lua, routine: Oid) -> bool {
        let removed = self.entries.remove(&routine).is_some();
        if removed {
            lua.expire_registry_values();
        }
        removed
    }

    /// Number of cached routines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of compilations performed.
    pub fn compiles(&self) -> u64 {
        self.compiles
    }
}

fn compile<'lua>(lua: &'lua Lua, chunk: &str, chunk_name: &str) -> Result<Function<'lua>> {
    let loader = lua.load(chunk).set_name(chunk_name).into_function().map_err(compile_error)?;
    loader.call::<_, Function>(()).map_err(compile_error)
}

fn compile_error(err: mlua::Error) -> Error {
    match Error::from(err) {
        Error::Runtime(report) => Error::Compile(report.message),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use crate::routine::RoutineDefinition;

    #[test]
    fn test_cache_hit_and_staleness() {
        let lua = Lua::new();
        let host = MemoryHost::new();
        let types = TypeCache::new();
        let mut cache = RoutineCache::new();

        let id = host.create_routine(RoutineDefinition::new(0, "one", "return 1", oid::INT4));
        let first = cache.lookup_or_compile(&lua, &host, &types, "chunk", id).unwrap();
        let again = cache.lookup_or_compile(&lua, &host, &types, "chunk", id).unwrap();
        assert!(Rc::ptr_eq(&first, &again));
        assert_eq!(cache.compiles(), 1);

        host.replace_routine_source(id, "return 2");
        let fresh = cache.lookup_or_compile(&lua, &host, &types, "chunk", id).unwrap();
        assert!(!Rc::ptr_eq(&first, &fresh));
        assert_ne!(first.stamp, fresh.stamp);
        assert_eq!(cache.compiles(), 2);
        assert_eq!(cache.len(), 1);

        let f: Function = lua.registry_value(&fresh.function).unwrap();
        assert_eq!(f.call::<_, i64>(()).unwrap(), 2);
    }

    #[test]
    fn test_compile_error_keeps_previous_entry() {
        let lua = Lua::new();
        let host = MemoryHost::new();
        let types = TypeCache::new();
        let mut cache = RoutineCache::new();

        let id = host.create_routine(RoutineDefinition::new(0, "f", "return 1", oid::INT4));
        cache.lookup_or_compile(&lua, &host, &types, "chunk", id).unwrap();

        host.replace_routine_source(id, "return (");
        let err = cache.lookup_or_compile(&lua, &host, &types, "chunk", id).unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_pseudo_argument_rejected() {
        let lua = Lua::new();
        let host = MemoryHost::new();
        let types = TypeCache::new();
        let mut cache = RoutineCache::new();

        let id = host.create_routine(RoutineDefinition::new(0, "f", "return", oid::VOID).arg("x", oid::VOID));
        assert!(cache.lookup_or_compile(&lua, &host, &types, "chunk", id).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unknown_routine() {
        let lua = Lua::new();
        let host = MemoryHost::new();
        let mut cache = RoutineCache::new();
        let err = cache.lookup_or_compile(&lua, &host, &TypeCache::new(), "chunk", 424242).unwrap_err();
        assert!(matches!(err, Error::Host(_)));
    }
}
