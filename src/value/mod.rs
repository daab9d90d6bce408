//! Relational-side values.
//!
//! A [`Datum`] is a non-null value in the database's representation. SQL
//! NULL is `None` wherever an `Option<Datum>` appears: in arguments, row
//! fields and array elements.

mod array;
pub mod io;

pub use array::{ArrayDim, ArrayValue};

use crate::types::RowDescriptor;
use bytes::Bytes;
use std::rc::Rc;

/// A non-null relational value.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    /// boolean
    Bool(bool),
    /// smallint
    Int2(i16),
    /// integer
    Int4(i32),
    /// bigint
    Int8(i64),
    /// real
    Float4(f32),
    /// double precision
    Float8(f64),
    /// numeric, in canonical decimal text form
    Numeric(String),
    /// text, varchar and bpchar
    Text(String),
    /// bytea
    Bytea(Bytes),
    /// json. Nulls nested in arrays and objects do not survive a trip
    /// through a script; see [`json_to_script`](crate::marshal::json_to_script).
    Json(serde_json::Value),
    /// Enum value, by label
    Enum(String),
    /// Array of any element type
    Array(ArrayValue),
    /// Composite row
    Composite(RowValue),
    /// Cursor reference, by portal name
    RefCursor(String),
    /// Any other type, in its text form
    Other(String),
}

impl Datum {
    /// Payload size in bytes, excluding any length header.
    pub fn data_size(&self) -> usize {
        match self {
            Datum::Bool(_) => 1,
            Datum::Int2(_) => 2,
            Datum::Int4(_) | Datum::Float4(_) | Datum::Enum(_) => 4,
            Datum::Int8(_) | Datum::Float8(_) => 8,
            Datum::Numeric(s)
            | Datum::Text(s)
            | Datum::RefCursor(s)
            | Datum::Other(s) => s.len(),
            Datum::Bytea(b) => b.len(),
            Datum::Json(v) => v.to_string().len(),
            Datum::Array(a) => a.encoded_size(),
            Datum::Composite(row) => row.data_size(),
        }
    }

    /// Short name of the variant, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Datum::Bool(_) => "boolean",
            Datum::Int2(_) => "smallint",
            Datum::Int4(_) => "integer",
            Datum::Int8(_) => "bigint",
            Datum::Float4(_) => "real",
            Datum::Float8(_) => "double precision",
            Datum::Numeric(_) => "numeric",
            Datum::Text(_) => "text",
            Datum::Bytea(_) => "bytea",
            Datum::Json(_) => "json",
            Datum::Enum(_) => "enum",
            Datum::Array(_) => "array",
            Datum::Composite(_) => "record",
            Datum::RefCursor(_) => "refcursor",
            Datum::Other(_) => "other",
        }
    }
}

/// A composite value: a row layout plus one optional value per column.
#[derive(Debug, Clone, PartialEq)]
pub struct RowValue {
    /// Row layout.
    pub descriptor: Rc<RowDescriptor>,
    /// Column values, in layout order.
    pub values: Vec<Option<Datum>>,
}

impl RowValue {
    /// Creates a row. Fails when the value count does not match the layout.
    pub fn new(descriptor: Rc<RowDescriptor>, values: Vec<Option<Datum>>) -> crate::Result<Self> {
        if values.len() != descriptor.len() {
            return Err(crate::Error::conversion(format!(
                "row has {} values but its layout has {} columns",
                values.len(),
                descriptor.len()
            )));
        }
        Ok(Self { descriptor, values })
    }

    /// Creates a row of NULLs.
    pub fn nulls(descriptor: Rc<RowDescriptor>) -> Self {
        let values = vec![None; descriptor.len()];
        Self { descriptor, values }
    }

    /// Value of the column called `name`.
    pub fn get(&self, name: &str) -> Option<&Datum> {
        self.descriptor.position(name).and_then(|i| self.values[i].as_ref())
    }

    fn data_size(&self) -> usize {
        // heap tuple header plus null bitmap
        let header = 24 + (self.values.len() + 7) / 8;
        header + self.values.iter().flatten().map(|d| d.data_size() + 4).sum::<usize>()
    }
}
