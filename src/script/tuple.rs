use super::lua;
use crate::runtime::Runtime;
use crate::tracker::DescriptorHandle;
use crate::types::RowDescriptor;
use crate::value::{Datum, RowValue};
use crate::{Error, Result};
use mlua::{MetaMethod, UserData, UserDataMethods, Value};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Write state of a tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleState {
    /// Assignments are rejected.
    ReadOnly,
    /// Writable, nothing assigned yet.
    Writable,
    /// At least one field was assigned.
    Modified,
}

struct TupleData {
    rt: Rc<Runtime>,
    handle: DescriptorHandle,
    values: Vec<Option<Datum>>,
    state: TupleState,
}

/// A row exposed to scripts.
///
/// Fields are marshaled on access, not when the tuple is created. The layout
/// is reached through a [`DescriptorHandle`], so a tuple that outlives an
/// aborted frame reads as empty (with a warning) instead of failing.
#[derive(Clone)]
pub struct TupleValue {
    inner: Rc<RefCell<TupleData>>,
}

impl TupleValue {
    pub(crate) fn new(rt: &Rc<Runtime>, row: RowValue, state: TupleState) -> Self {
        let handle = rt.arena.allocate(row.descriptor);
        Self::with_handle(rt, handle, row.values, state)
    }

    /// Creates a tuple sharing an existing handle, as result sets do.
    pub(crate) fn with_handle(
        rt: &Rc<Runtime>,
        handle: DescriptorHandle,
        values: Vec<Option<Datum>>,
        state: TupleState,
    ) -> Self {
        let data = TupleData { rt: Rc::clone(rt), handle, values, state };
        Self { inner: Rc::new(RefCell::new(data)) }
    }

    /// Current write state.
    pub fn state(&self) -> TupleState {
        self.inner.borrow().state
    }

    /// Row layout, unless it has been released.
    pub fn descriptor(&self) -> Option<Rc<RowDescriptor>> {
        self.inner.borrow().handle.descriptor()
    }

    /// Copies the tuple into a fresh row.
    pub fn to_row(&self) -> Result<RowValue> {
        let data = self.inner.borrow();
        let descriptor = data
            .handle
            .descriptor()
            .ok_or_else(|| Error::runtime("tuple descriptor was released"))?;
        RowValue::new(descriptor, data.values.clone())
    }

    fn get<'lua>(&self, lua: &'lua mlua::Lua, name: &str) -> mlua::Result<Value<'lua>> {
        let data = self.inner.borrow();
        let desc = match data.handle.descriptor() {
            Some(desc) => desc,
            None => {
                log::warn!("access to lost tuple descriptor");
                return Ok(Value::Nil);
            }
        };
        let pos = match desc.position(name) {
            Some(pos) => pos,
            None => {
                log::warn!("tuple has no field \"{}\"", name);
                return Ok(Value::Nil);
            }
        };
        let rt = Rc::clone(&data.rt);
        let datum = data.values[pos].clone();
        drop(data);

        let script = rt.marshaler().to_script(datum.as_ref(), desc.attributes[pos].type_oid)?;
        lua::push(lua, &rt, &script)
    }

    fn set(&self, name: &str, value: &Value<'_>) -> Result<()> {
        let (rt, desc) = {
            let data = self.inner.borrow();
            if data.state == TupleState::ReadOnly {
                return Err(Error::runtime("tuple is read-only"));
            }
            let desc = data
                .handle
                .descriptor()
                .ok_or_else(|| Error::runtime("tuple descriptor was released"))?;
            (Rc::clone(&data.rt), desc)
        };
        let pos = desc.position(name).ok_or_else(|| Error::field_not_found(name))?;
        let attr = &desc.attributes[pos];
        let script = lua::pull(value, 0, rt.options.max_table_depth)?;
        let datum = rt.marshaler().to_relational(&script, attr.type_oid, attr.type_mod)?;

        let mut data = self.inner.borrow_mut();
        data.values[pos] = datum;
        data.state = TupleState::Modified;
        Ok(())
    }

    fn render(&self) -> String {
        let data = self.inner.borrow();
        let desc = match data.handle.descriptor() {
            Some(desc) => desc,
            None => return "(lost tuple)".to_string(),
        };
        let fields: Vec<String> = desc
            .attributes
            .iter()
            .zip(&data.values)
            .map(|(attr, value)| match value {
                None => String::new(),
                Some(datum) => data
                    .rt
                    .types
                    .get(&*data.rt.host, attr.type_oid)
                    .and_then(|t| data.rt.host.output(&t, datum))
                    .unwrap_or_else(|_| format!("<{}>", datum.kind_name())),
            })
            .collect();
        format!("({})", fields.join(","))
    }
}

impl UserData for TupleValue {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: mlua::String<'lua>| this.get(lua, key.to_str()?));

        methods.add_meta_method(MetaMethod::NewIndex, |_, this, (key, value): (mlua::String<'lua>, Value<'lua>)| {
            this.set(key.to_str()?, &value).map_err(mlua::Error::from)
        });

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.render()));
    }
}

impl fmt::Debug for TupleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.borrow();
        f.debug_struct("TupleValue")
            .field("handle", &data.handle.id())
            .field("state", &data.state)
            .field("values", &data.values)
            .finish()
    }
}

impl PartialEq for TupleValue {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_runtime;
    use crate::tracker::FrameExit;
    use crate::types::{oid, Attribute};

    fn descriptor() -> Rc<RowDescriptor> {
        Rc::new(RowDescriptor::anonymous(vec![Attribute::new("id", oid::INT4), Attribute::new("name", oid::TEXT)]))
    }

    fn values(id: i32) -> Vec<Option<Datum>> {
        vec![Some(Datum::Int4(id)), Some(Datum::Text(format!("row{}", id)))]
    }

    #[test]
    fn test_shared_handle_released_with_frame() {
        let (_lua, rt) = test_runtime();
        let frame = rt.arena.push_frame();
        let handle = rt.arena.allocate(descriptor());
        let id = handle.id();

        let tuples: Vec<TupleValue> =
            (1..=3).map(|i| TupleValue::with_handle(&rt, handle.clone(), values(i), TupleState::ReadOnly)).collect();
        drop(handle);
        assert_eq!(rt.arena.status(id).unwrap().refs, 3);

        let mut tuples = tuples.into_iter();
        let first = tuples.next().unwrap();
        drop(tuples);
        let status = rt.arena.status(id).unwrap();
        assert_eq!(status.refs, 1);
        assert!(!status.reclaimable);
        assert_eq!(first.to_row().unwrap().values, values(1));

        drop(first);
        let status = rt.arena.status(id).unwrap();
        assert_eq!(status.refs, 0);
        assert!(status.reclaimable);
        assert!(status.has_descriptor);

        rt.arena.pop_frame(frame, FrameExit::Normal).unwrap();
        assert!(rt.arena.status(id).is_none());
        assert_eq!(rt.arena.live_descriptors(), 0);
    }

    #[test]
    fn test_read_only_tuple_rejects_writes() {
        let (_lua, rt) = test_runtime();
        let tuple = TupleValue::new(&rt, RowValue::new(descriptor(), values(1)).unwrap(), TupleState::ReadOnly);
        assert!(tuple.set("id", &Value::Integer(2)).is_err());
        assert_eq!(tuple.state(), TupleState::ReadOnly);

        let writable = TupleValue::new(&rt, RowValue::new(descriptor(), values(1)).unwrap(), TupleState::Writable);
        writable.set("id", &Value::Integer(2)).unwrap();
        assert_eq!(writable.state(), TupleState::Modified);
        assert_eq!(writable.to_row().unwrap().values[0], Some(Datum::Int4(2)));
        assert!(matches!(writable.set("missing", &Value::Nil), Err(Error::FieldNotFound(_))));
    }

    #[test]
    fn test_tuple_outliving_aborted_frame() {
        let (lua, rt) = test_runtime();
        let frame = rt.arena.push_frame();
        let tuple = TupleValue::new(&rt, RowValue::new(descriptor(), values(4)).unwrap(), TupleState::Writable);
        assert_eq!(tuple.render(), "(4,row4)");

        rt.arena.pop_frame(frame, FrameExit::Aborted).unwrap();
        assert!(tuple.descriptor().is_none());
        assert_eq!(tuple.render(), "(lost tuple)");
        assert!(tuple.to_row().is_err());
        assert!(matches!(tuple.get(&lua, "id").unwrap(), Value::Nil));
    }
}
