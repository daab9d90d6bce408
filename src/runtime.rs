//! Per-engine shared state.
//!
//! Everything a script callback needs to reach (options, the host, the type
//! cache, the lifetime trackers) lives in one `Runtime` shared by `Rc`
//! between the engine and the closures it installs in the VM.

use crate::config::Options;
use crate::host::Host;
use crate::marshal::Marshaler;
use crate::script::sandbox::VmKeys;
use crate::tracker::{CleanupRegistry, DescriptorArena};
use crate::types::TypeCache;
use mlua::RegistryKey;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

pub(crate) struct Runtime {
    pub options: Options,
    pub host: Rc<dyn Host>,
    pub types: TypeCache,
    pub arena: DescriptorArena,
    pub registry: CleanupRegistry,
    /// The VM's own `pcall`, captured before any sandboxing.
    pub pcall: RegistryKey,
    /// Metatable given to structured error tables.
    pub error_meta: RegistryKey,
    /// Body run by every set-returning coroutine; see `sandbox::SRF_ENTRY`.
    pub srf_entry: RegistryKey,
    pub deadline: Cell<Option<Instant>>,
    /// Set after a double fault; the engine refuses further work.
    pub poisoned: Cell<bool>,
}

impl Runtime {
    pub fn new(options: Options, host: Rc<dyn Host>, keys: VmKeys) -> Self {
        Self {
            options,
            host,
            types: TypeCache::new(),
            arena: DescriptorArena::new(),
            registry: CleanupRegistry::new(),
            pcall: keys.pcall,
            error_meta: keys.error_meta,
            srf_entry: keys.srf_entry,
            deadline: Cell::new(None),
            poisoned: Cell::new(false),
        }
    }

    pub fn marshaler(&self) -> Marshaler<'_> {
        Marshaler::new(&self.types, &*self.host, &self.options)
    }
}

#[cfg(test)]
pub(crate) fn test_runtime() -> (mlua::Lua, Rc<Runtime>) {
    let options = Options::default();
    let (lua, keys) = crate::script::sandbox::create_vm(&options).unwrap();
    let host: Rc<dyn Host> = Rc::new(crate::host::MemoryHost::new());
    (lua, Rc::new(Runtime::new(options, host, keys)))
}
