use crate::host::RowSet;
use crate::runtime::Runtime;
use crate::script::{TupleState, TupleValue};
use crate::tracker::DescriptorHandle;
use crate::value::Datum;
use mlua::{MetaMethod, UserData, UserDataMethods, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// Buffered rows of one statement, indexed from 1.
///
/// Tuples are built on first access and reused afterwards; every tuple
/// shares the set's descriptor handle.
pub(crate) struct ResultSet {
    rt: Rc<Runtime>,
    handle: DescriptorHandle,
    rows: RefCell<Vec<Option<Vec<Option<Datum>>>>>,
    tuples: RefCell<Vec<Option<TupleValue>>>,
}

impl ResultSet {
    pub fn new(rt: &Rc<Runtime>, rows: RowSet) -> Self {
        let handle = rt.arena.allocate(rows.descriptor);
        let count = rows.rows.len();
        Self {
            rt: Rc::clone(rt),
            handle,
            rows: RefCell::new(rows.rows.into_iter().map(Some).collect()),
            tuples: RefCell::new(vec![None; count]),
        }
    }

    pub fn len(&self) -> usize {
        self.tuples.borrow().len()
    }

    /// Tuple at 1-based `index`.
    pub fn get(&self, index: i64) -> Option<TupleValue> {
        if index < 1 || index as usize > self.len() {
            return None;
        }
        let slot = index as usize - 1;
        if let Some(tuple) = &self.tuples.borrow()[slot] {
            return Some(tuple.clone());
        }
        let values = self.rows.borrow_mut()[slot].take()?;
        let tuple = TupleValue::with_handle(&self.rt, self.handle.clone(), values, TupleState::ReadOnly);
        self.tuples.borrow_mut()[slot] = Some(tuple.clone());
        Some(tuple)
    }
}

impl UserData for ResultSet {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: Value<'lua>| {
            let index = match key {
                Value::Integer(i) => i,
                Value::Number(n) if n.fract() == 0.0 => n as i64,
                _ => return Ok(Value::Nil),
            };
            match this.get(index) {
                Some(tuple) => Ok(Value::UserData(lua.create_userdata(tuple)?)),
                None => Ok(Value::Nil),
            }
        });

        methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.len()));

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(format!("result set: {} rows", this.len())));
    }
}
