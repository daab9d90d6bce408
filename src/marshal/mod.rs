//! Value marshaling between relational and script representations.
//!
//! Conversions are driven by the declared type identifier and type
//! modifier, never by the shape of the value alone. Domains marshal as their
//! underlying type. Scalars with a native script form (booleans, integers,
//! floats, text, bytea, json) take a fast path; numeric, enum and every other
//! type go through the host's text input/output routines.

mod array;

use crate::config::Options;
use crate::host::Host;
use crate::script::{ScriptKey, ScriptTable, ScriptValue};
use crate::types::{oid, Oid, RowDescriptor, TypeCache, TypeDescriptor, TypeKind};
use crate::value::{Datum, RowValue};
use crate::{Error, Result};
use std::rc::Rc;

/// Converts values in both directions for one engine.
///
/// # Example
///
/// ```rust
/// use pllua::host::MemoryHost;
/// use pllua::marshal::Marshaler;
/// use pllua::script::ScriptValue;
/// use pllua::types::{oid, TypeCache};
/// use pllua::value::Datum;
/// use pllua::Options;
///
/// let host = MemoryHost::new();
/// let types = TypeCache::new();
/// let options = Options::default();
/// let m = Marshaler::new(&types, &host, &options);
///
/// let v = m.to_script(Some(&Datum::Int4(42)), oid::INT4).unwrap();
/// assert_eq!(v, ScriptValue::Integer(42));
/// assert_eq!(m.to_relational(&v, oid::INT8, -1).unwrap(), Some(Datum::Int8(42)));
/// ```
pub struct Marshaler<'a> {
    types: &'a TypeCache,
    host: &'a dyn Host,
    options: &'a Options,
}

impl<'a> Marshaler<'a> {
    /// Creates a marshaler over a type cache and host.
    pub fn new(types: &'a TypeCache, host: &'a dyn Host, options: &'a Options) -> Self {
        Self { types, host, options }
    }

    /// Options in effect.
    pub fn options(&self) -> &Options {
        self.options
    }

    /// Resolved descriptor of a type (domains are not unwrapped).
    pub fn descriptor(&self, type_oid: Oid) -> Result<Rc<TypeDescriptor>> {
        self.types.get(self.host, type_oid)
    }

    /// Converts a relational value to its script form. `None` (NULL)
    /// becomes nil.
    pub fn to_script(&self, datum: Option<&Datum>, type_oid: Oid) -> Result<ScriptValue> {
        let datum = match datum {
            Some(d) => d,
            None => return Ok(ScriptValue::Nil),
        };
        let (desc, _) = self.types.resolve_domain(self.host, type_oid, -1)?;

        match (&desc.kind, datum) {
            (TypeKind::Array { element }, Datum::Array(arr)) => array::to_script(self, arr, *element),
            (_, Datum::Composite(row)) if desc.is_row() => self.row_to_script(row),
            (TypeKind::Enum { .. }, _) => Ok(ScriptValue::string(self.host.output(&desc, datum)?)),
            (TypeKind::Base, _) => self.scalar_to_script(&desc, datum),
            _ => Err(Error::conversion(format!(
                "cannot convert {} value to script for type {}",
                datum.kind_name(),
                desc.name
            ))),
        }
    }

    /// Converts a row to a table keyed by column name. NULL columns are
    /// absent from the table.
    pub fn row_to_script(&self, row: &RowValue) -> Result<ScriptValue> {
        let mut table = ScriptTable::new();
        for (attr, value) in row.descriptor.attributes.iter().zip(&row.values) {
            if let Some(v) = value {
                table.insert(ScriptKey::String(attr.name.clone()), self.to_script(Some(v), attr.type_oid)?);
            }
        }
        Ok(ScriptValue::Table(table))
    }

    fn scalar_to_script(&self, desc: &TypeDescriptor, datum: &Datum) -> Result<ScriptValue> {
        Ok(match (desc.oid, datum) {
            (oid::BOOL, Datum::Bool(b)) => ScriptValue::Boolean(*b),
            (oid::INT2, Datum::Int2(i)) => ScriptValue::Integer(*i as i64),
            (oid::INT4, Datum::Int4(i)) => ScriptValue::Integer(*i as i64),
            (oid::INT8, Datum::Int8(i)) => ScriptValue::Integer(*i),
            (oid::FLOAT4, Datum::Float4(f)) => ScriptValue::Number(*f as f64),
            (oid::FLOAT8, Datum::Float8(f)) => ScriptValue::Number(*f),
            (oid::TEXT | oid::VARCHAR | oid::BPCHAR, Datum::Text(s)) => ScriptValue::string(s.as_str()),
            (oid::BYTEA, Datum::Bytea(b)) => ScriptValue::String(b.clone()),
            (oid::JSON, Datum::Json(v)) => json_to_script(v),
            (oid::REFCURSOR, Datum::RefCursor(name)) => {
                if self.host.cursor_exists(name) {
                    ScriptValue::Cursor(name.clone())
                } else {
                    ScriptValue::Nil
                }
            }
            _ => ScriptValue::string(self.host.output(desc, datum)?),
        })
    }

    /// Converts a script value to a relational value of `type_oid`,
    /// applying `type_mod` (-1 for none). nil becomes NULL.
    pub fn to_relational(&self, value: &ScriptValue, type_oid: Oid, type_mod: i32) -> Result<Option<Datum>> {
        if value.is_nil() {
            return Ok(None);
        }
        let (desc, type_mod) = self.types.resolve_domain(self.host, type_oid, type_mod)?;

        match &desc.kind {
            TypeKind::Array { element } => array::to_relational(self, value, *element).map(Some),
            TypeKind::Composite(layout) => self.to_row(value, layout).map(|r| Some(Datum::Composite(r))),
            TypeKind::Pseudo => match desc.oid {
                oid::VOID => Ok(None),
                oid::RECORD => match value {
                    ScriptValue::Tuple(t) => Ok(Some(Datum::Composite(t.to_row()?))),
                    other => Err(Error::conversion(format!(
                        "cannot convert {} to record: the row layout is unknown",
                        other.type_name()
                    ))),
                },
                _ => Err(Error::conversion(format!("cannot convert a value to type {}", desc.name))),
            },
            TypeKind::Enum { .. } => {
                let text = self.text_of(value, &desc)?;
                self.host.input(&desc, &text, type_mod).map(Some)
            }
            TypeKind::Base => self.scalar_to_relational(value, &desc, type_mod).map(Some),
            TypeKind::Domain { .. } => Err(Error::internal("domain was not resolved")),
        }
    }

    /// Converts a table or tuple to a row of `layout`. Table keys that are
    /// not column names are ignored; missing columns become NULL.
    pub fn to_row(&self, value: &ScriptValue, layout: &Rc<RowDescriptor>) -> Result<RowValue> {
        match value {
            ScriptValue::Table(table) => {
                let mut values = Vec::with_capacity(layout.len());
                for attr in &layout.attributes {
                    let v = match table.get(&ScriptKey::String(attr.name.clone())) {
                        Some(v) => self.to_relational(v, attr.type_oid, attr.type_mod)?,
                        None => None,
                    };
                    values.push(v);
                }
                RowValue::new(Rc::clone(layout), values)
            }
            ScriptValue::Tuple(tuple) => {
                let row = tuple.to_row()?;
                if row.descriptor.attributes == layout.attributes {
                    return Ok(RowValue { descriptor: Rc::clone(layout), values: row.values });
                }
                let mut values = Vec::with_capacity(layout.len());
                for attr in &layout.attributes {
                    let v = match row.descriptor.position(&attr.name) {
                        Some(i) => {
                            let source = &row.descriptor.attributes[i];
                            let script = self.to_script(row.values[i].as_ref(), source.type_oid)?;
                            self.to_relational(&script, attr.type_oid, attr.type_mod)?
                        }
                        None => None,
                    };
                    values.push(v);
                }
                RowValue::new(Rc::clone(layout), values)
            }
            other => Err(Error::conversion(format!("cannot convert {} to a composite value", other.type_name()))),
        }
    }

    fn scalar_to_relational(&self, value: &ScriptValue, desc: &TypeDescriptor, type_mod: i32) -> Result<Datum> {
        let mismatch = || Error::conversion(format!("cannot convert {} to {}", value.type_name(), desc.name));

        match desc.oid {
            oid::BOOL => match value {
                ScriptValue::Boolean(b) => Ok(Datum::Bool(*b)),
                ScriptValue::String(_) => self.host.input(desc, &self.text_of(value, desc)?, type_mod),
                _ => Err(mismatch()),
            },
            oid::INT2 | oid::INT4 | oid::INT8 => {
                let i = match value {
                    ScriptValue::Integer(i) => *i,
                    ScriptValue::Number(f) if f.fract() == 0.0 && *f >= -9.2e18 && *f <= 9.2e18 => *f as i64,
                    ScriptValue::Number(_) => {
                        return Err(Error::conversion(format!("number has no integer representation for {}", desc.name)))
                    }
                    ScriptValue::String(_) => return self.host.input(desc, &self.text_of(value, desc)?, type_mod),
                    _ => return Err(mismatch()),
                };
                let out_of_range = || Error::conversion(format!("value {} out of range for type {}", i, desc.name));
                Ok(match desc.oid {
                    oid::INT2 => Datum::Int2(i16::try_from(i).map_err(|_| out_of_range())?),
                    oid::INT4 => Datum::Int4(i32::try_from(i).map_err(|_| out_of_range())?),
                    _ => Datum::Int8(i),
                })
            }
            oid::FLOAT4 | oid::FLOAT8 => {
                let f = match value {
                    ScriptValue::Integer(i) => *i as f64,
                    ScriptValue::Number(f) => *f,
                    ScriptValue::String(_) => return self.host.input(desc, &self.text_of(value, desc)?, type_mod),
                    _ => return Err(mismatch()),
                };
                Ok(if desc.oid == oid::FLOAT4 { Datum::Float4(f as f32) } else { Datum::Float8(f) })
            }
            oid::BYTEA => match value {
                ScriptValue::String(b) => Ok(Datum::Bytea(b.clone())),
                _ => Err(mismatch()),
            },
            oid::JSON => Ok(Datum::Json(script_to_json(value)?)),
            oid::REFCURSOR => match value {
                ScriptValue::Cursor(name) => Ok(Datum::RefCursor(name.clone())),
                ScriptValue::String(_) => Ok(Datum::RefCursor(self.text_of(value, desc)?)),
                _ => Err(mismatch()),
            },
            oid::TEXT => Ok(Datum::Text(self.text_of(value, desc)?)),
            _ => self.host.input(desc, &self.text_of(value, desc)?, type_mod),
        }
    }

    /// Text form of a scalar script value, as Lua's `tostring` would give it.
    fn text_of(&self, value: &ScriptValue, desc: &TypeDescriptor) -> Result<String> {
        match value {
            ScriptValue::String(b) => String::from_utf8(b.to_vec())
                .map_err(|_| Error::conversion(format!("invalid UTF-8 string for type {}", desc.name))),
            ScriptValue::Integer(i) => Ok(i.to_string()),
            ScriptValue::Number(f) => Ok(format_number(*f)),
            ScriptValue::Boolean(b) if desc.oid == oid::TEXT || desc.oid == oid::BOOL => Ok(b.to_string()),
            other => Err(Error::conversion(format!("cannot convert {} to {}", other.type_name(), desc.name))),
        }
    }
}

fn format_number(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{:.1}", f)
    } else if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        (if f > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
    } else {
        f.to_string()
    }
}

/// Converts a JSON document to script form. Arrays become sequences; JSON
/// nulls inside containers are dropped, since a table cannot hold nil. An
/// array with nulls therefore leaves holes and comes back from
/// [`script_to_json`] as an object keyed by the surviving positions.
pub fn json_to_script(value: &serde_json::Value) -> ScriptValue {
    use serde_json::Value as J;
    match value {
        J::Null => ScriptValue::Nil,
        J::Bool(b) => ScriptValue::Boolean(*b),
        J::Number(n) => match n.as_i64() {
            Some(i) => ScriptValue::Integer(i),
            None => ScriptValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        J::String(s) => ScriptValue::string(s.as_str()),
        J::Array(items) => ScriptValue::Table(
            items
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.is_null())
                .map(|(i, v)| (ScriptKey::Integer(i as i64 + 1), json_to_script(v)))
                .collect(),
        ),
        J::Object(map) => ScriptValue::Table(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (ScriptKey::String(k.clone()), json_to_script(v)))
                .collect(),
        ),
    }
}

/// Converts a script value to JSON. A table whose keys are exactly 1..=n
/// becomes an array; any other non-empty table becomes an object.
pub fn script_to_json(value: &ScriptValue) -> Result<serde_json::Value> {
    use serde_json::Value as J;
    Ok(match value {
        ScriptValue::Nil => J::Null,
        ScriptValue::Boolean(b) => J::Bool(*b),
        ScriptValue::Integer(i) => J::from(*i),
        ScriptValue::Number(f) => serde_json::Number::from_f64(*f)
            .map(J::Number)
            .ok_or_else(|| Error::conversion("json cannot represent NaN or infinity"))?,
        ScriptValue::String(b) => J::String(
            String::from_utf8(b.to_vec()).map_err(|_| Error::conversion("json strings must be valid UTF-8"))?,
        ),
        ScriptValue::Cursor(name) => J::String(name.clone()),
        ScriptValue::Tuple(_) => return Err(Error::conversion("cannot convert tuple to json")),
        ScriptValue::Table(table) => {
            let is_sequence = !table.is_empty()
                && table.keys().enumerate().all(|(i, k)| *k == ScriptKey::Integer(i as i64 + 1));
            if is_sequence {
                J::Array(table.values().map(script_to_json).collect::<Result<Vec<_>>>()?)
            } else {
                let mut map = serde_json::Map::new();
                for (k, v) in table {
                    map.insert(k.to_string(), script_to_json(v)?);
                }
                J::Object(map)
            }
        }
    })
}
