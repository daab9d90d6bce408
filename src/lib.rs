//! # PL/Lua - Lua Stored Routines for a Relational Database
//!
//! PL/Lua runs routines written in Lua on behalf of a host database. It is
//! the boundary core of a procedural language handler: it owns the Lua VM,
//! compiles and caches routine bodies, converts values in both directions
//! and keeps every VM-side object that mirrors a host resource consistent
//! with that resource's real lifetime.
//!
//! ## Architecture
//!
//! The engine consists of several key components:
//!
//! - **Host**: Traits the database implements (catalog, routines, queries)
//! - **Type Cache**: Resolved type descriptors, looked up once per engine
//! - **Marshaling**: Conversion between relational values and script values
//! - **Routine Cache**: Compiled routines, recompiled when their definition changes
//! - **Call Protocol**: Plain calls, set-returning coroutines and triggers
//! - **Lifetime Tracking**: A cleanup registry drained at transaction end and
//!   frame-scoped row descriptor handles
//! - **Protected Calls**: `subtransaction(f, ...)` backed by host savepoints
//!
//! ## Example Usage
//!
//! ```rust
//! use pllua::routine::RoutineDefinition;
//! use pllua::types::oid;
//! use pllua::{CallContext, CallOutcome, Datum, Engine, MemoryHost, Options};
//! use std::rc::Rc;
//!
//! # fn main() -> Result<(), pllua::Error> {
//! let host = Rc::new(MemoryHost::new());
//! let add = host.create_routine(
//!     RoutineDefinition::new(0, "add", "return a + b", oid::INT4)
//!         .arg("a", oid::INT4)
//!         .arg("b", oid::INT4),
//! );
//!
//! let engine = Engine::new(host.clone(), Options::default())?;
//! let outcome = engine.invoke(add, &[Some(Datum::Int4(2)), Some(Datum::Int4(3))], CallContext::Function)?;
//! assert_eq!(outcome, CallOutcome::Value(Some(Datum::Int4(5))));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod call;
pub mod config;
pub mod error;
pub mod host;
pub mod marshal;
pub mod routine;
pub mod script;
pub mod tracker;
pub mod trigger;
pub mod types;
pub mod value;

mod runtime;
mod spi;
mod subxact;

// Re-exports
pub use call::{CallContext, CallOutcome, SetCall, SrfState};
pub use config::Options;
pub use error::{Error, ErrorReport, Result};
pub use host::{Host, MemoryHost};
pub use tracker::XactEvent;
pub use trigger::{Relation, TriggerData, TriggerLevel, TriggerOperation, TriggerWhen};
pub use types::Oid;
pub use value::{Datum, RowValue};

use call::ExecutionTable;
use mlua::Lua;
use routine::{RoutineCache, RoutineEntry};
use runtime::Runtime;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;
use tracker::FrameExit;
use types::CacheStats;

/// The main engine handle.
///
/// One engine owns one Lua VM and serves every routine call a session
/// makes. The host drives it through [`Engine::invoke`] and reports
/// transaction boundaries through [`Engine::on_transaction_event`].
///
/// # Thread Safety
///
/// `Engine` is neither `Send` nor `Sync`. A database session runs one
/// statement at a time on one thread, and the engine follows that model:
/// all interior state is shared with `Rc` and `RefCell`.
pub struct Engine {
    /// The VM. Declared first so script objects drop before the runtime.
    lua: Lua,

    /// State shared with the closures installed in the VM
    rt: Rc<Runtime>,

    /// Compiled routines by identifier
    routines: RefCell<RoutineCache>,

    /// Suspended set-returning calls
    executions: ExecutionTable,
}

impl Engine {
    /// Creates an engine and its VM.
    ///
    /// The VM is sandboxed according to `options.trusted`, the script API
    /// (`print`, `server`, `subtransaction`, `setshared`, ...) is installed
    /// and every init module the host lists is evaluated in order.
    ///
    /// # Arguments
    ///
    /// * `host` - The database the engine serves
    /// * `options` - Engine configuration
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The options fail validation
    /// - The VM cannot be created
    /// - An init module fails to load
    ///
    /// # Example
    ///
    /// ```rust
    /// use pllua::{Engine, MemoryHost, Options};
    /// use std::rc::Rc;
    ///
    /// # fn main() -> Result<(), pllua::Error> {
    /// let host = Rc::new(MemoryHost::new());
    /// host.add_init_module("greeting", "return 'hello'");
    /// let engine = Engine::new(host, Options::default().trusted(false))?;
    /// assert!(!engine.is_poisoned());
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(host: Rc<dyn Host>, options: Options) -> Result<Self> {
        options.validate()?;
        let (lua, keys) = script::sandbox::create_vm(&options)?;
        let trusted = options.trusted;

        let rt = Rc::new(Runtime::new(options, host, keys));
        script::sandbox::install(&lua, &rt)?;

        let modules = rt.host.init_modules()?;
        for module in &modules {
            script::sandbox::load_module(&lua, &module.name, &module.source)?;
        }

        log::info!(
            "PL/Lua engine started ({}, {} init module(s))",
            if trusted { "trusted" } else { "untrusted" },
            modules.len()
        );

        Ok(Self { lua, rt, routines: RefCell::new(RoutineCache::new()), executions: ExecutionTable::new() })
    }

    /// Calls a routine.
    ///
    /// The routine is compiled on first use and recompiled whenever its
    /// catalog definition changes. Each call runs in its own descriptor
    /// frame; an error aborts the frame, which force-releases descriptors
    /// created during the call even if script objects still refer to them.
    ///
    /// # Arguments
    ///
    /// * `routine` - Identifier of the routine to call
    /// * `args` - Arguments in declaration order (`None` is NULL)
    /// * `ctx` - How the routine is being called
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The engine was poisoned by an earlier double fault
    /// - The routine does not exist or fails to compile
    /// - The call context does not match the routine's kind
    /// - An argument or the result cannot be converted
    /// - The script raises an error
    ///
    /// # Example
    ///
    /// ```rust
    /// use pllua::routine::RoutineDefinition;
    /// use pllua::types::oid;
    /// use pllua::{CallContext, CallOutcome, Datum, Engine, MemoryHost, Options, SetCall};
    /// use std::rc::Rc;
    ///
    /// # fn main() -> Result<(), pllua::Error> {
    /// let host = Rc::new(MemoryHost::new());
    /// let count = host.create_routine(
    ///     RoutineDefinition::new(0, "count", "for i = 1, n do coroutine.yield(i) end", oid::INT4)
    ///         .arg("n", oid::INT4)
    ///         .returns_set(true),
    /// );
    /// let engine = Engine::new(host.clone(), Options::default())?;
    ///
    /// let args = [Some(Datum::Int4(2))];
    /// let mut call = SetCall::new();
    /// let mut rows = Vec::new();
    /// loop {
    ///     match engine.invoke(count, &args, CallContext::SetFunction(&mut call))? {
    ///         CallOutcome::Row(row) => rows.push(row),
    ///         _ => break,
    ///     }
    /// }
    /// assert_eq!(rows, vec![Some(Datum::Int4(1)), Some(Datum::Int4(2))]);
    /// # Ok(())
    /// # }
    /// ```
    pub fn invoke(&self, routine: Oid, args: &[Option<Datum>], ctx: CallContext<'_>) -> Result<CallOutcome> {
        self.check_usable()?;
        let entry = self.lookup(routine)?;
        call::check_context(&entry, &ctx)?;

        let frame = self.rt.arena.push_frame();
        if let Some(timeout) = self.rt.options.timeout {
            self.rt.deadline.set(Some(Instant::now() + timeout));
        }

        let result = match ctx {
            CallContext::Function => call::call_function(&self.lua, &self.rt, &entry, args),
            CallContext::SetFunction(slot) => {
                call::resume(&self.lua, &self.rt, &self.executions, &entry, args, slot)
            }
            CallContext::Trigger(data) => call::call_trigger(&self.lua, &self.rt, &entry, data),
        };

        self.rt.deadline.set(None);
        let exit = if result.is_ok() { FrameExit::Normal } else { FrameExit::Aborted };
        let popped = self.rt.arena.pop_frame(frame, exit);

        if self.rt.poisoned.get() {
            return Err(match result {
                Err(e) if e.is_fatal() => e,
                _ => Error::Fatal("engine is unusable after a double fault".to_string()),
            });
        }
        match result {
            Ok(outcome) => {
                popped?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(frame_error) = popped {
                    log::error!("{}", frame_error);
                }
                if e.is_fatal() {
                    self.rt.poisoned.set(true);
                }
                log::debug!("call of {} ({}) failed: {}", entry.name, routine, e);
                Err(e)
            }
        }
    }

    /// Compiles a routine without calling it.
    ///
    /// # Errors
    ///
    /// Returns an error if the routine does not exist, one of its types is
    /// not accepted, or the body does not compile.
    pub fn validate(&self, routine: Oid) -> Result<()> {
        self.check_usable()?;
        self.lookup(routine).map(|_| ())
    }

    /// Drops a set-returning call the host will not finish.
    ///
    /// The suspended coroutine is released at once instead of waiting for
    /// the transaction to end. Finished calls are left untouched.
    pub fn abandon(&self, call: &mut SetCall) {
        call::abandon(&self.lua, &self.rt, &self.executions, call);
    }

    /// Reports a transaction lifecycle event.
    ///
    /// Events that end the transaction run every registered cleanup in
    /// reverse registration order. Returns the number of cleanups run.
    pub fn on_transaction_event(&self, event: XactEvent) -> usize {
        if !event.drains() {
            return 0;
        }
        let ran = self.rt.registry.drain();
        self.lua.expire_registry_values();
        log::debug!("{:?}: ran {} cleanup(s)", event, ran);
        ran
    }

    /// Drops the compiled form of a routine, if cached.
    pub fn invalidate(&self, routine: Oid) -> bool {
        self.routines.borrow_mut().invalidate(&self.lua, routine)
    }

    /// Engine configuration.
    pub fn options(&self) -> &Options {
        &self.rt.options
    }

    /// True after a double fault; every further call fails.
    pub fn is_poisoned(&self) -> bool {
        self.rt.poisoned.get()
    }

    /// Type cache statistics.
    pub fn type_cache_stats(&self) -> CacheStats {
        self.rt.types.stats()
    }

    /// Number of compiled routines in the cache.
    pub fn cached_routines(&self) -> usize {
        self.routines.borrow().len()
    }

    /// Total number of compilations since the engine started.
    pub fn routine_compiles(&self) -> u64 {
        self.routines.borrow().compiles()
    }

    /// Cleanups waiting for the end of the transaction.
    pub fn pending_cleanups(&self) -> usize {
        self.rt.registry.len()
    }

    /// Row descriptors still held by script objects.
    pub fn live_descriptors(&self) -> usize {
        self.rt.arena.live_descriptors()
    }

    /// Set-returning calls currently suspended.
    pub fn suspended_calls(&self) -> usize {
        self.executions.len()
    }

    fn check_usable(&self) -> Result<()> {
        if self.rt.poisoned.get() {
            return Err(Error::Fatal("engine is unusable after a double fault".to_string()));
        }
        Ok(())
    }

    fn lookup(&self, routine: Oid) -> Result<Rc<RoutineEntry>> {
        self.routines.borrow_mut().lookup_or_compile(
            &self.lua,
            &*self.rt.host,
            &self.rt.types,
            &self.rt.options.chunk_name,
            routine,
        )
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let ran = self.rt.registry.drain();
        if ran > 0 {
            log::debug!("engine shutdown ran {} pending cleanup(s)", ran);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routine::RoutineDefinition;
    use crate::types::oid;
    use std::time::Duration;

    fn setup() -> (Rc<MemoryHost>, Engine) {
        let host = Rc::new(MemoryHost::new());
        let engine = Engine::new(host.clone(), Options::default()).unwrap();
        (host, engine)
    }

    #[test]
    fn test_invoke_plain_function() {
        let (host, engine) = setup();
        let f = host.create_routine(
            RoutineDefinition::new(0, "concat", "return a .. '-' .. b", oid::TEXT)
                .arg("a", oid::TEXT)
                .arg("b", oid::TEXT),
        );
        let outcome = engine
            .invoke(
                f,
                &[Some(Datum::Text("x".into())), Some(Datum::Text("y".into()))],
                CallContext::Function,
            )
            .unwrap();
        assert_eq!(outcome, CallOutcome::Value(Some(Datum::Text("x-y".into()))));
        assert_eq!(engine.cached_routines(), 1);

        let stats = engine.type_cache_stats();
        assert!(stats.misses >= 1);
        assert!(stats.hit_rate() > 0.0);
    }

    #[test]
    fn test_null_result() {
        let (host, engine) = setup();
        let f = host.create_routine(RoutineDefinition::new(0, "nothing", "return nil", oid::INT4));
        let outcome = engine.invoke(f, &[], CallContext::Function).unwrap();
        assert_eq!(outcome, CallOutcome::Value(None));
    }

    #[test]
    fn test_runtime_error_keeps_engine_usable() {
        let (host, engine) = setup();
        let bad = host.create_routine(RoutineDefinition::new(0, "bad", "error('boom')", oid::INT4));
        let good = host.create_routine(RoutineDefinition::new(0, "good", "return 1", oid::INT4));

        let err = engine.invoke(bad, &[], CallContext::Function).unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
        assert!(err.to_string().contains("boom"));
        assert!(!engine.is_poisoned());

        let outcome = engine.invoke(good, &[], CallContext::Function).unwrap();
        assert_eq!(outcome, CallOutcome::Value(Some(Datum::Int4(1))));
    }

    #[test]
    fn test_validate_reports_compile_errors() {
        let (host, engine) = setup();
        let broken = host.create_routine(RoutineDefinition::new(0, "broken", "return (", oid::INT4));
        assert!(matches!(engine.validate(broken), Err(Error::Compile(_))));
        assert_eq!(engine.cached_routines(), 0);
    }

    #[test]
    fn test_missing_routine() {
        let (_host, engine) = setup();
        assert!(engine.invoke(999_999, &[], CallContext::Function).is_err());
    }

    #[test]
    fn test_wrong_context_is_protocol_error() {
        let (host, engine) = setup();
        let srf = host.create_routine(
            RoutineDefinition::new(0, "gen", "coroutine.yield(1)", oid::INT4).returns_set(true),
        );
        let err = engine.invoke(srf, &[], CallContext::Function).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let plain = host.create_routine(RoutineDefinition::new(0, "one", "return 1", oid::INT4));
        let mut call = SetCall::new();
        let err = engine.invoke(plain, &[], CallContext::SetFunction(&mut call)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_timeout_interrupts_runaway_script() {
        let host = Rc::new(MemoryHost::new());
        let spin = host.create_routine(RoutineDefinition::new(0, "spin", "while true do end", oid::INT4));
        let options = Options::default().timeout(Some(Duration::from_millis(50)));
        let engine = Engine::new(host.clone(), options).unwrap();

        let err = engine.invoke(spin, &[], CallContext::Function).unwrap_err();
        assert!(err.to_string().contains("timeout"));
        assert!(!engine.is_poisoned());
    }

    #[test]
    fn test_init_module_failure_fails_startup() {
        let host = Rc::new(MemoryHost::new());
        host.add_init_module("broken", "error('nope')");
        let err = Engine::new(host, Options::default()).err().unwrap();
        assert!(matches!(err, Error::Compile(_)));
    }

    #[test]
    fn test_abandon_releases_suspended_call() {
        let (host, engine) = setup();
        let srf = host.create_routine(
            RoutineDefinition::new(0, "gen", "for i = 1, 10 do coroutine.yield(i) end", oid::INT4)
                .returns_set(true),
        );
        let mut call = SetCall::new();
        let first = engine.invoke(srf, &[], CallContext::SetFunction(&mut call)).unwrap();
        assert_eq!(first, CallOutcome::Row(Some(Datum::Int4(1))));
        assert_eq!(engine.suspended_calls(), 1);
        assert_eq!(engine.pending_cleanups(), 1);

        engine.abandon(&mut call);
        assert_eq!(call.state(), SrfState::Done);
        assert_eq!(engine.suspended_calls(), 0);
        assert_eq!(engine.pending_cleanups(), 0);
    }

    #[test]
    fn test_transaction_end_drops_suspended_calls() {
        let (host, engine) = setup();
        let srf = host.create_routine(
            RoutineDefinition::new(0, "gen", "for i = 1, 10 do coroutine.yield(i) end", oid::INT4)
                .returns_set(true),
        );
        let mut call = SetCall::new();
        engine.invoke(srf, &[], CallContext::SetFunction(&mut call)).unwrap();

        assert_eq!(engine.on_transaction_event(XactEvent::PreCommit), 0);
        assert_eq!(engine.on_transaction_event(XactEvent::Commit), 1);
        assert_eq!(engine.suspended_calls(), 0);

        let err = engine.invoke(srf, &[], CallContext::SetFunction(&mut call)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(call.state(), SrfState::Error);
    }
}
