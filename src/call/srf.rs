use super::{pull_result, push_args, CallOutcome};
use crate::routine::RoutineEntry;
use crate::runtime::Runtime;
use crate::script::lua;
use crate::tracker::{CleanupRegistry, ResourceId};
use crate::value::Datum;
use crate::{Error, Result};
use mlua::{Function, Lua, MultiValue, RegistryKey, Thread, ThreadStatus, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Lifecycle of a set-returning call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrfState {
    /// No request made yet.
    Init,
    /// A resumption is in flight.
    Running,
    /// Suspended after producing a row.
    Yielded,
    /// End of set reached.
    Done,
    /// Terminated by an error.
    Error,
}

/// Host-owned slot for one set-returning call.
///
/// The host keeps the slot across the requests of one scan and passes it to
/// every [`Engine::invoke`](crate::Engine::invoke). A slot that is dropped
/// before reaching [`SrfState::Done`] must be handed to
/// [`Engine::abandon`](crate::Engine::abandon) first.
#[derive(Debug)]
pub struct SetCall {
    state: SrfState,
    execution: Option<u64>,
}

impl Default for SetCall {
    fn default() -> Self {
        Self { state: SrfState::Init, execution: None }
    }
}

impl SetCall {
    /// Creates a fresh slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> SrfState {
        self.state
    }

    /// True once no more requests are accepted.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, SrfState::Done | SrfState::Error)
    }
}

struct Execution {
    thread: RegistryKey,
    resource: ResourceId,
}

#[derive(Default)]
struct ExecutionInner {
    next_id: u64,
    entries: HashMap<u64, Execution>,
}

/// Suspended coroutines of set-returning calls, by execution id.
///
/// Each execution is also registered with the cleanup registry, so a
/// transaction boundary drops executions their hosts never finished.
#[derive(Clone, Default)]
pub(crate) struct ExecutionTable {
    inner: Rc<RefCell<ExecutionInner>>,
}

impl ExecutionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, registry: &CleanupRegistry, thread: RegistryKey) -> u64 {
        let id = {
            let mut inner = self.inner.borrow_mut();
            inner.next_id += 1;
            inner.next_id
        };
        let weak = Rc::downgrade(&self.inner);
        let resource = registry.register(move || {
            if let Some(inner) = weak.upgrade() {
                let removed = inner.borrow_mut().entries.remove(&id);
                if removed.is_some() {
                    log::debug!("transaction end dropped set-returning execution {}", id);
                }
            }
        });
        self.inner.borrow_mut().entries.insert(id, Execution { thread, resource });
        id
    }

    fn thread<'lua>(&self, lua: &'lua Lua, id: u64) -> Result<Option<Thread<'lua>>> {
        let inner = self.inner.borrow();
        match inner.entries.get(&id) {
            Some(execution) => Ok(Some(lua.registry_value(&execution.thread)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, registry: &CleanupRegistry, id: u64) -> bool {
        let removed = self.inner.borrow_mut().entries.remove(&id);
        match removed {
            Some(execution) => {
                registry.unregister(execution.resource);
                true
            }
            None => false,
        }
    }

    /// Number of suspended executions.
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }
}

fn finish(lua: &Lua, rt: &Runtime, executions: &ExecutionTable, call: &mut SetCall, state: SrfState) {
    if let Some(id) = call.execution.take() {
        executions.remove(&rt.registry, id);
        lua.expire_registry_values();
    }
    call.state = state;
}

/// Serves one request of a set-returning call.
pub(crate) fn resume(
    lua: &Lua,
    rt: &Rc<Runtime>,
    executions: &ExecutionTable,
    entry: &RoutineEntry,
    args: &[Option<Datum>],
    call: &mut SetCall,
) -> Result<CallOutcome> {
    let state = call.state;
    let (thread, values) = match state {
        SrfState::Init => {
            let mut values = push_args(lua, rt, entry, args)?;
            let func: Function<'_> = lua.registry_value(&entry.function)?;
            values.push_front(Value::Function(func));

            let body: Function<'_> = lua.registry_value(&rt.srf_entry)?;
            let thread = lua.create_thread(body)?;
            let id = executions.insert(&rt.registry, lua.create_registry_value(thread.clone())?);
            call.execution = Some(id);
            log::trace!("set-returning call of {} started as execution {}", entry.name, id);
            (thread, values)
        }
        SrfState::Yielded => {
            let id = call.execution.ok_or_else(|| Error::internal("suspended call has no execution"))?;
            let thread = match executions.thread(lua, id)? {
                Some(thread) => thread,
                None => {
                    call.execution = None;
                    call.state = SrfState::Error;
                    return Err(Error::protocol("set-returning call was terminated at transaction end"));
                }
            };
            (thread, push_args(lua, rt, entry, args)?)
        }
        SrfState::Running => return Err(Error::protocol("set-returning call is already running")),
        SrfState::Done | SrfState::Error => {
            return Err(Error::protocol("set-returning call has already finished"))
        }
    };

    call.state = SrfState::Running;
    match thread.resume::<_, MultiValue<'_>>(values) {
        Ok(mut yielded) => {
            let finished = thread.status() != ThreadStatus::Resumable;
            let first = yielded.pop_front().unwrap_or(Value::Nil);
            if finished && matches!(first, Value::Boolean(false)) {
                let raised = yielded.pop_front().unwrap_or(Value::Nil);
                finish(lua, rt, executions, call, SrfState::Error);
                return Err(lua::error_from_value(&raised));
            }
            if finished || first.is_nil() {
                finish(lua, rt, executions, call, SrfState::Done);
                return Ok(CallOutcome::EndOfSet);
            }
            match pull_result(rt, entry, &first) {
                Ok(datum) => {
                    call.state = SrfState::Yielded;
                    Ok(CallOutcome::Row(datum))
                }
                Err(e) => {
                    finish(lua, rt, executions, call, SrfState::Error);
                    Err(e)
                }
            }
        }
        Err(e) => {
            finish(lua, rt, executions, call, SrfState::Error);
            Err(Error::from(e))
        }
    }
}

/// Drops the execution behind `call` without finishing it.
pub(crate) fn abandon(lua: &Lua, rt: &Runtime, executions: &ExecutionTable, call: &mut SetCall) {
    if !call.is_finished() {
        finish(lua, rt, executions, call, SrfState::Done);
    }
}
